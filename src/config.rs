use anyhow::{Context, Result};
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

/// Upper bound the feed API accepts for `max-results`.
pub const MAX_RESULTS_LIMIT: u32 = 150;
/// Upper bound on retries per request.
pub const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Feed base URL, without pagination parameters.
    pub feed_url: String,
    pub max_results: u32,
    pub db_path: String,
    /// Detail documents fetched at once.
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    /// Images matching this are folded into the previous step by `merge-steps`.
    pub marker_pattern: String,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            feed_url: "http://www.cheftayebeh.ir/feeds/posts/summary".into(),
            max_results: MAX_RESULTS_LIMIT,
            db_path: "data/recipes.sqlite".into(),
            concurrency: 4,
            request_timeout_secs: 30,
            max_retries: 2,
            marker_pattern: r"(?i)(emoticon|emoji|smiley|/smilies/)".into(),
            user_agent: concat!("recipe-ingest/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

/// Defaults, then `recipes.toml` if present, then `RECIPES_*` environment variables.
pub fn load() -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name("recipes").required(false))
        .add_source(Environment::with_prefix("RECIPES").try_parsing(true));
    from_builder(builder)
}

fn from_builder(builder: ConfigBuilder<config::builder::DefaultState>) -> Result<Settings> {
    let mut settings: Settings = builder
        .build()
        .context("Failed to read configuration")?
        .try_deserialize()
        .context("Invalid configuration")?;
    settings.max_results = settings.max_results.clamp(1, MAX_RESULTS_LIMIT);
    settings.concurrency = settings.concurrency.max(1);
    settings.max_retries = settings.max_retries.min(MAX_RETRIES_LIMIT);
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    #[test]
    fn defaults_without_sources() {
        let s = from_builder(Config::builder()).unwrap();
        assert_eq!(s.max_results, MAX_RESULTS_LIMIT);
        assert_eq!(s.concurrency, 4);
        assert!(s.feed_url.starts_with("http"));
    }

    #[test]
    fn file_overrides_and_clamps() {
        let toml = r#"
            feed_url = "https://example.com/feeds/posts/summary"
            max_results = 500
            concurrency = 0
        "#;
        let builder = Config::builder().add_source(File::from_str(toml, FileFormat::Toml));
        let s = from_builder(builder).unwrap();
        assert_eq!(s.feed_url, "https://example.com/feeds/posts/summary");
        assert_eq!(s.max_results, MAX_RESULTS_LIMIT);
        assert_eq!(s.concurrency, 1);
        assert_eq!(s.max_retries, 2);
    }

    #[test]
    fn retries_are_bounded() {
        let builder = Config::builder().add_source(File::from_str("max_retries = 64", FileFormat::Toml));
        let s = from_builder(builder).unwrap();
        assert_eq!(s.max_retries, MAX_RETRIES_LIMIT);
    }
}
