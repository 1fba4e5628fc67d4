use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use recipe_ingest::catalog::{self, NewAuthor};
use recipe_ingest::config;
use recipe_ingest::crawl::{self, CrawlOptions};
use recipe_ingest::db::{SqliteStore, Storage};
use recipe_ingest::feed;
use recipe_ingest::fetch::HttpFetcher;
use recipe_ingest::model::{Key, Record};
use recipe_ingest::pipeline::StepMerge;

#[derive(Parser)]
#[command(name = "recipe-ingest", about = "Recipe feed crawler and ingester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the feed and store every new recipe
    Run {
        /// 1-based index of the first feed entry
        #[arg(short, long, default_value = "1")]
        start_index: u32,
        /// Entries per feed page (max 150)
        #[arg(short, long)]
        max_results: Option<u32>,
        /// Stop after this many feed pages
        #[arg(short = 'n', long)]
        pages: Option<usize>,
    },
    /// Create categories from the feed's category list
    Categories,
    /// Register an author so recipes can be linked to it
    AddAuthor {
        /// Name as it appears in the feed
        #[arg(long)]
        name: Option<String>,
        /// Name in the source language
        #[arg(long)]
        name_source: Option<String>,
        #[arg(long)]
        website: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    /// Fold decorative-image steps into the step before them
    MergeSteps {
        /// Only this recipe (default: all recipes)
        #[arg(long)]
        origin_id: Option<String>,
    },
    /// Show storage statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = config::load()?;
    let store = SqliteStore::open(&settings.db_path)
        .with_context(|| format!("Failed to open {}", settings.db_path))?;

    let result = match cli.command {
        Commands::Run {
            start_index,
            max_results,
            pages,
        } => {
            let fetcher = Arc::new(HttpFetcher::new(&settings)?);
            let opts = CrawlOptions {
                start_index,
                max_results: max_results.unwrap_or(settings.max_results),
                max_pages: pages,
                concurrency: settings.concurrency,
            };
            println!("Crawling {} from entry {}...", settings.feed_url, opts.start_index);
            let stats = crawl::crawl(fetcher, &store, &settings.feed_url, &opts).await?;
            println!(
                "Done: {} pages, {} entries ({} saved, {} duplicates).",
                stats.pages, stats.entries, stats.saved, stats.duplicates
            );
            println!(
                "Steps written: {} | without author: {}",
                stats.steps, stats.without_author
            );
            println!(
                "Failed: {} fetch, {} parse, {} store",
                stats.fetch_failures, stats.parse_failures, stats.store_failures
            );
            if stats.page_errors > 0 {
                println!("Feed traversal stopped early on a page error.");
            }
            Ok(())
        }
        Commands::Categories => {
            let fetcher = HttpFetcher::new(&settings)?;
            let url = feed::page_url(&settings.feed_url, 1, 1)?;
            let terms = feed::fetch_categories(&fetcher, &url).await?;
            let created = catalog::sync_categories(&store, &terms)?;
            println!("Created {} new categories ({} in feed)", created, terms.len());
            Ok(())
        }
        Commands::AddAuthor {
            name,
            name_source,
            website,
            email,
        } => {
            let (author, created) = catalog::register_author(
                &store,
                NewAuthor {
                    title_source: name_source,
                    title_target: name,
                    website,
                    email,
                },
            )?;
            let label = author
                .title_target
                .as_deref()
                .or(author.title_source.as_deref())
                .unwrap_or("-");
            if created {
                println!("Added author #{} {}", author.id.unwrap_or_default(), label);
            } else {
                println!("Author #{} {} already exists", author.id.unwrap_or_default(), label);
            }
            Ok(())
        }
        Commands::MergeSteps { origin_id } => {
            let merge = StepMerge::new(&settings.marker_pattern)
                .with_context(|| format!("Invalid marker pattern {}", settings.marker_pattern))?;
            let mut recipes = Vec::new();
            match origin_id {
                Some(origin_id) => match store.find(Key::RecipeOrigin(&origin_id))? {
                    Some(Record::Recipe(recipe)) => recipes.push(recipe),
                    _ => bail!("No recipe with origin id {}", origin_id),
                },
                None => {
                    for id in store.recipe_ids()? {
                        if let Some(recipe) = store.recipe_by_id(id)? {
                            recipes.push(recipe);
                        }
                    }
                }
            }

            let (mut removed, mut updated, mut touched) = (0, 0, 0);
            for recipe in &mut recipes {
                let report = merge.apply(&store, recipe)?;
                if report.removed > 0 {
                    touched += 1;
                }
                removed += report.removed;
                updated += report.updated;
            }
            println!(
                "Merged {} steps into their predecessors across {} recipes ({} renumbered, {} checked).",
                removed,
                touched,
                updated,
                recipes.len()
            );
            Ok(())
        }
        Commands::Stats => {
            let s = store.stats()?;
            println!("Recipes:        {}", s.recipes);
            println!("Steps:          {}", s.steps);
            println!("Authors:        {}", s.authors);
            println!("Categories:     {}", s.categories);
            println!("Without author: {}", s.without_author);
            println!("Translated:     {}", s.translated);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
