use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::MAX_RESULTS_LIMIT;
use crate::error::FetchError;
use crate::fetch::Fetch;
use crate::model::{ordered_set, FeedEntry};
use crate::parser::entry::origin_id;

/// One page of the feed listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub entries: Vec<FeedEntry>,
    pub next_url: Option<String>,
}

// ── JSON shapes (Blogger wraps text values as {"$t": ...}) ──

#[derive(Deserialize)]
struct FeedDocument {
    feed: FeedBody,
}

#[derive(Deserialize)]
struct FeedBody {
    #[serde(default)]
    entry: Vec<RawEntry>,
    #[serde(default)]
    link: Vec<RawLink>,
    #[serde(default)]
    category: Vec<RawCategory>,
}

#[derive(Deserialize)]
struct Text {
    #[serde(rename = "$t", default)]
    t: String,
}

#[derive(Deserialize)]
struct RawLink {
    #[serde(default)]
    rel: String,
    #[serde(default)]
    href: String,
}

#[derive(Deserialize)]
struct RawCategory {
    #[serde(default)]
    term: String,
}

#[derive(Deserialize)]
struct RawAuthor {
    name: Option<Text>,
}

#[derive(Deserialize)]
struct RawEntry {
    id: Option<Text>,
    title: Option<Text>,
    published: Option<Text>,
    updated: Option<Text>,
    #[serde(default)]
    link: Vec<RawLink>,
    #[serde(default)]
    author: Vec<RawAuthor>,
    #[serde(default)]
    category: Vec<RawCategory>,
}

impl RawEntry {
    fn into_entry(self) -> Result<FeedEntry, String> {
        let id = self.id.map(|t| t.t).unwrap_or_default();
        let origin_id = origin_id(&id).ok_or_else(|| format!("no post id in `{}`", id))?;
        let self_link = find_link(&self.link, "self")
            .ok_or_else(|| format!("post {} has no self link", origin_id))?;
        let published_date = timestamp(self.published)
            .ok_or_else(|| format!("post {} has no valid published date", origin_id))?;
        let updated_date = timestamp(self.updated).unwrap_or(published_date);

        Ok(FeedEntry {
            title: self.title.map(|t| t.t.trim().to_string()).unwrap_or_default(),
            published_date,
            updated_date,
            alternate_link: find_link(&self.link, "alternate").unwrap_or_default(),
            author_name: self
                .author
                .into_iter()
                .find_map(|a| a.name)
                .map(|n| n.t.trim().to_string())
                .unwrap_or_default(),
            category_names: terms(self.category),
            self_link,
            origin_id,
        })
    }
}

fn timestamp(text: Option<Text>) -> Option<DateTime<FixedOffset>> {
    text.and_then(|t| DateTime::parse_from_rfc3339(t.t.trim()).ok())
}

fn find_link(links: &[RawLink], rel: &str) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel == rel && !l.href.is_empty())
        .map(|l| l.href.clone())
}

fn terms(categories: Vec<RawCategory>) -> Vec<String> {
    ordered_set(
        categories
            .into_iter()
            .map(|c| c.term.trim().to_string())
            .filter(|t| !t.is_empty()),
    )
}

fn decode(url: &str, body: &str) -> Result<FeedBody, FetchError> {
    serde_json::from_str::<FeedDocument>(body)
        .map(|doc| doc.feed)
        .map_err(|e| FetchError::malformed(url, e))
}

/// Build a feed URL for one page. `max_results` is clamped to what the feed accepts.
pub fn page_url(base_url: &str, start_index: u32, max_results: u32) -> Result<String, FetchError> {
    let start = start_index.max(1).to_string();
    let max = max_results.clamp(1, MAX_RESULTS_LIMIT).to_string();
    reqwest::Url::parse_with_params(
        base_url,
        &[("start-index", start.as_str()), ("max-results", max.as_str()), ("alt", "json")],
    )
    .map(String::from)
    .map_err(|e| FetchError::unreachable(base_url, e))
}

/// Decode a feed page body. Entries that cannot be identified are skipped.
pub fn parse_page(url: &str, body: &str) -> Result<Page, FetchError> {
    let feed = decode(url, body)?;
    let next_url = find_link(&feed.link, "next");
    let entries = feed
        .entry
        .into_iter()
        .filter_map(|raw| match raw.into_entry() {
            Ok(entry) => Some(entry),
            Err(reason) => {
                warn!("Skipping feed entry: {}", reason);
                None
            }
        })
        .collect();
    Ok(Page { entries, next_url })
}

pub async fn fetch_page<F: Fetch + ?Sized>(fetcher: &F, url: &str) -> Result<Page, FetchError> {
    let body = fetcher.get(url).await?;
    parse_page(url, &body)
}

/// Category terms listed at the top level of the feed.
pub async fn fetch_categories<F: Fetch + ?Sized>(
    fetcher: &F,
    url: &str,
) -> Result<Vec<String>, FetchError> {
    let body = fetcher.get(url).await?;
    Ok(terms(decode(url, &body)?.category))
}

/// Pull-based walk over feed pages, following `rel="next"` links.
///
/// A failed page ends the walk: without it there is no next link to follow.
pub struct FeedPaginator<'a, F: Fetch + ?Sized> {
    fetcher: &'a F,
    next_url: Option<String>,
}

impl<'a, F: Fetch + ?Sized> FeedPaginator<'a, F> {
    pub fn new(fetcher: &'a F, first_url: impl Into<String>) -> Self {
        FeedPaginator {
            fetcher,
            next_url: Some(first_url.into()),
        }
    }

    pub fn starting_at(
        fetcher: &'a F,
        base_url: &str,
        start_index: u32,
        max_results: u32,
    ) -> Result<Self, FetchError> {
        Ok(Self::new(fetcher, page_url(base_url, start_index, max_results)?))
    }

    /// `None` once the last page has been yielded or a page failed.
    pub async fn next_page(&mut self) -> Option<Result<Page, FetchError>> {
        let url = self.next_url.take()?;
        info!("Fetching feed page: {}", url);
        let result = fetch_page(self.fetcher, &url).await;
        if let Ok(page) = &result {
            debug!("{} entries, next: {:?}", page.entries.len(), page.next_url);
            self.next_url = page.next_url.clone().filter(|next| *next != url);
        }
        Some(result)
    }
}
