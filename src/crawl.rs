use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::db::Storage;
use crate::error::{FetchError, IngestError, ParseError};
use crate::feed::FeedPaginator;
use crate::fetch::Fetch;
use crate::model::{CookingStep, FeedEntry, Recipe};
use crate::parser::parse_entry;
use crate::pipeline::{IngestReport, IngestionPipeline};

/// Where an entry is in its trip from feed to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetching,
    Parsing,
    ResolvingRefs,
    Persisting,
    Done,
}

#[derive(Debug)]
pub enum EntryOutcome {
    Saved(IngestReport),
    Duplicate,
    Failed { stage: Stage, reason: String },
}

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub start_index: u32,
    pub max_results: u32,
    /// Stop after this many feed pages.
    pub max_pages: Option<usize>,
    pub concurrency: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlStats {
    pub pages: usize,
    pub page_errors: usize,
    pub entries: usize,
    pub saved: usize,
    pub steps: usize,
    pub duplicates: usize,
    pub without_author: usize,
    pub fetch_failures: usize,
    pub parse_failures: usize,
    pub store_failures: usize,
}

impl CrawlStats {
    fn record(&mut self, outcome: &EntryOutcome) {
        self.entries += 1;
        match outcome {
            EntryOutcome::Saved(report) => {
                self.saved += 1;
                self.steps += report.steps_written;
                if report
                    .issues
                    .iter()
                    .any(|i| matches!(i, IngestError::AuthorNotFound(_)))
                {
                    self.without_author += 1;
                }
            }
            EntryOutcome::Duplicate => self.duplicates += 1,
            EntryOutcome::Failed { stage, .. } => match stage {
                Stage::Fetching => self.fetch_failures += 1,
                Stage::Parsing => self.parse_failures += 1,
                _ => self.store_failures += 1,
            },
        }
    }
}

enum Fetched {
    Document(String),
    Failed(FetchError),
}

type Parsed = Result<(Recipe, Vec<CookingStep>), (Stage, String)>;

/// Walk the feed and ingest every entry. One feed page is fully fetched,
/// parsed and persisted before the next page is requested.
pub async fn crawl<F, S>(
    fetcher: Arc<F>,
    store: &S,
    feed_url: &str,
    opts: &CrawlOptions,
) -> Result<CrawlStats>
where
    F: Fetch + 'static,
    S: Storage + ?Sized,
{
    let mut pages =
        FeedPaginator::starting_at(fetcher.as_ref(), feed_url, opts.start_index, opts.max_results)?;
    let pipeline = IngestionPipeline::new(store);
    let mut stats = CrawlStats::default();

    while let Some(result) = pages.next_page().await {
        let page = match result {
            Ok(page) => page,
            Err(e) => {
                error!("Feed traversal stopped: {}", e);
                stats.page_errors += 1;
                break;
            }
        };
        stats.pages += 1;
        info!("Page {}: {} entries", stats.pages, page.entries.len());

        let pb = ProgressBar::new(page.entries.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
                .progress_chars("=> "),
        );

        let fetched = fetch_documents(Arc::clone(&fetcher), page.entries, opts.concurrency).await;
        let parsed: Vec<(FeedEntry, Parsed)> = fetched
            .into_par_iter()
            .map(|(entry, doc)| {
                let parsed = parse_fetched(&entry, doc);
                (entry, parsed)
            })
            .collect();

        for (entry, parsed) in parsed {
            let outcome = match parsed {
                Ok((recipe, steps)) => persist(&pipeline, &entry, recipe, steps),
                Err((stage, reason)) => EntryOutcome::Failed { stage, reason },
            };
            if let EntryOutcome::Failed { stage, reason } = &outcome {
                warn!("Entry {} failed while {:?}: {}", entry.origin_id, stage, reason);
            }
            stats.record(&outcome);
            pb.inc(1);
        }
        pb.finish_and_clear();

        if opts.max_pages.is_some_and(|max| stats.pages >= max) {
            info!("Page limit reached");
            break;
        }
    }

    info!(
        "Crawled {} pages: {} saved, {} duplicates, {} failed",
        stats.pages,
        stats.saved,
        stats.duplicates,
        stats.fetch_failures + stats.parse_failures + stats.store_failures
    );
    Ok(stats)
}

/// Fetch every entry's detail document, at most `concurrency` at a time.
/// Results come back in feed order.
async fn fetch_documents<F: Fetch + 'static>(
    fetcher: Arc<F>,
    entries: Vec<FeedEntry>,
    concurrency: usize,
) -> Vec<(FeedEntry, Fetched)> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    let handles: Vec<_> = entries
        .into_iter()
        .map(|entry| {
            let fetcher = Arc::clone(&fetcher);
            let sem = Arc::clone(&semaphore);
            let url = entry.self_link.clone();
            let origin_id = entry.origin_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = sem.acquire().await;
                debug!("{} -> {:?}", origin_id, Stage::Fetching);
                match fetcher.get(&url).await {
                    Ok(body) => Fetched::Document(body),
                    Err(e) => Fetched::Failed(e),
                }
            });
            (entry, handle)
        })
        .collect();

    let mut out = Vec::with_capacity(handles.len());
    for (entry, handle) in handles {
        let doc = match handle.await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Fetch task for {} failed: {}", entry.origin_id, e);
                Fetched::Failed(FetchError::unreachable(&entry.self_link, format!("fetch task failed: {}", e)))
            }
        };
        out.push((entry, doc));
    }
    out
}

fn parse_fetched(entry: &FeedEntry, doc: Fetched) -> Parsed {
    let body = match doc {
        Fetched::Document(body) => body,
        Fetched::Failed(e) => return Err((Stage::Fetching, e.to_string())),
    };
    debug!("{} -> {:?}", entry.origin_id, Stage::Parsing);
    parse_entry(&body, Some(&entry.origin_id)).map_err(|e: ParseError| (Stage::Parsing, e.to_string()))
}

fn persist<S: Storage + ?Sized>(
    pipeline: &IngestionPipeline<'_, S>,
    entry: &FeedEntry,
    recipe: Recipe,
    steps: Vec<CookingStep>,
) -> EntryOutcome {
    debug!("{} -> {:?}", entry.origin_id, Stage::ResolvingRefs);
    match pipeline.ingest(entry, recipe, steps) {
        Ok(report) => {
            debug!("{} -> {:?}", entry.origin_id, Stage::Done);
            EntryOutcome::Saved(report)
        }
        Err(IngestError::Duplicate(_)) => EntryOutcome::Duplicate,
        Err(e) => EntryOutcome::Failed {
            stage: Stage::Persisting,
            reason: e.to_string(),
        },
    }
}
