use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};

/// Arabic yeh, as typed on Arabic keyboard layouts.
const ARABIC_YEH: char = '\u{064A}';
/// Persian yeh, the canonical form stored.
const PERSIAN_YEH: char = '\u{06CC}';

static MARKUP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<[^>]*>|&(?P<ent>[a-z0-9]+|#[0-9]{1,6}|#x[0-9a-f]{1,6});").unwrap()
});

const NAMED_ENTITIES: &[(&str, &str)] = &[
    ("nbsp", " "),
    ("zwnj", "\u{200C}"),
    ("zwj", "\u{200D}"),
    ("hellip", "\u{2026}"),
    ("laquo", "\u{00AB}"),
    ("raquo", "\u{00BB}"),
    ("ndash", "\u{2013}"),
    ("mdash", "\u{2014}"),
    ("quot", "\""),
    ("apos", "'"),
];

/// Strip markup, resolve entity references and fold letter variants.
pub fn normalize(text: &str) -> String {
    let mut current = text.to_string();
    // Removing a tag can splice an entity together ("&am<b></b>p;"), so run to a fixpoint.
    // Every replacement is shorter than what it replaces.
    loop {
        let next = match MARKUP_RE.replace_all(&current, replace_markup) {
            Cow::Borrowed(_) => break,
            Cow::Owned(s) => s,
        };
        current = next;
    }
    canonical_letters(&current).trim().to_string()
}

/// Fold visually identical letter variants into one code point.
pub fn canonical_letters(text: &str) -> String {
    text.replace(ARABIC_YEH, &PERSIAN_YEH.to_string())
}

fn replace_markup(caps: &Captures) -> String {
    match caps.name("ent") {
        Some(ent) => decode_entity(ent.as_str()).unwrap_or_default(),
        None => String::new(),
    }
}

fn decode_entity(body: &str) -> Option<String> {
    if let Some(num) = body.strip_prefix('#') {
        let code = match num.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        let c = char::from_u32(code)?;
        if c.is_control() || matches!(c, '<' | '>' | '&' | ';') {
            return None;
        }
        return Some(c.to_string());
    }
    NAMED_ENTITIES
        .iter()
        .find(|(name, _)| *name == body)
        .map(|(_, value)| value.to_string())
}
