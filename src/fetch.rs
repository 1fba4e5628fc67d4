use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::FetchError;

const BASE_BACKOFF_MS: u64 = 1000;

/// Retrieve a document body by URL.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &str) -> Result<String, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    max_retries: u32,
}

impl HttpFetcher {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| FetchError::unreachable("<client>", e))?;
        Ok(HttpFetcher {
            client,
            max_retries: settings.max_retries,
        })
    }

    async fn get_once(&self, url: &str) -> Result<String, Attempt> {
        let response = self.client.get(url).send().await.map_err(|e| {
            let reason = if e.is_timeout() {
                "timed out".to_string()
            } else {
                e.to_string()
            };
            Attempt::Failed(reason)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Attempt::Status(status));
        }
        response
            .text()
            .await
            .map_err(|e| Attempt::Failed(e.to_string()))
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt)))
}

enum Attempt {
    Status(StatusCode),
    Failed(String),
}

impl Attempt {
    fn retryable(&self) -> bool {
        matches!(self, Attempt::Status(s) if *s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error())
    }

    fn reason(&self) -> String {
        match self {
            Attempt::Status(s) => format!("HTTP {}", s),
            Attempt::Failed(reason) => reason.clone(),
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            debug!("GET {}", url);
            match self.get_once(url).await {
                Ok(body) => return Ok(body),
                Err(failure) if failure.retryable() && attempt < self.max_retries => {
                    let delay = backoff(attempt);
                    warn!(
                        "{} on {} (attempt {}/{}), backing off {:.1}s",
                        failure.reason(),
                        url,
                        attempt + 1,
                        self.max_retries,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => return Err(FetchError::unreachable(url, failure.reason())),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Serves canned bodies; unknown URLs are unreachable.
    #[derive(Default)]
    pub struct CannedFetcher {
        bodies: HashMap<String, String>,
        pub requested: Mutex<Vec<String>>,
    }

    impl CannedFetcher {
        pub fn with(mut self, url: &str, body: impl Into<String>) -> Self {
            self.bodies.insert(url.to_string(), body.into());
            self
        }
    }

    #[async_trait]
    impl Fetch for CannedFetcher {
        async fn get(&self, url: &str) -> Result<String, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            self.bodies
                .get(url)
                .cloned()
                .ok_or_else(|| FetchError::unreachable(url, "HTTP 404 Not Found"))
        }
    }

    #[test]
    fn only_throttling_and_server_errors_retry() {
        assert!(Attempt::Status(StatusCode::TOO_MANY_REQUESTS).retryable());
        assert!(Attempt::Status(StatusCode::BAD_GATEWAY).retryable());
        assert!(!Attempt::Status(StatusCode::NOT_FOUND).retryable());
        assert!(!Attempt::Failed("timed out".into()).retryable());
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        assert_eq!(backoff(0), Duration::from_millis(1000));
        assert_eq!(backoff(2), Duration::from_millis(4000));
        assert_eq!(backoff(64), Duration::from_millis(u64::MAX));
    }

    #[tokio::test]
    async fn unreachable_host_maps_to_unreachable() {
        let settings = Settings {
            request_timeout_secs: 1,
            max_retries: 0,
            ..Settings::default()
        };
        let fetcher = HttpFetcher::new(&settings).unwrap();
        let err = fetcher.get("http://127.0.0.1:9/feed").await.unwrap_err();
        assert!(matches!(err, FetchError::Unreachable { .. }));
    }
}
