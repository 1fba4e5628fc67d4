use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

// Quoted attribute values may contain `>`.
static IMG_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?is)<img\b(?:[^>"']|"[^"]*"|'[^']*')*>"#).unwrap());
static IMG_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());

/// One image and the raw markup that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPiece {
    pub image_url: String,
    pub description_html: String,
}

/// Split embedded post HTML at every `<img>` tag, in document order.
///
/// The text before the first image is discarded. An image without a `src`
/// still counts as a boundary and yields an empty URL.
pub fn split(raw_html: &str) -> Vec<ContentPiece> {
    let tags: Vec<_> = IMG_TAG_RE.find_iter(raw_html).collect();
    tags.iter()
        .enumerate()
        .map(|(i, tag)| {
            let end = tags.get(i + 1).map_or(raw_html.len(), |next| next.start());
            ContentPiece {
                image_url: image_src(tag.as_str()),
                description_html: raw_html[tag.end()..end].to_string(),
            }
        })
        .collect()
}

fn image_src(tag: &str) -> String {
    let fragment = Html::parse_fragment(tag);
    fragment
        .select(&IMG_SELECTOR)
        .next()
        .and_then(|img| img.value().attr("src"))
        .map(|src| src.trim().to_string())
        .unwrap_or_default()
}
