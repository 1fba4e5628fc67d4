use thiserror::Error;

/// Failure to obtain a usable response from the feed or a detail document.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unreachable: {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },
}

impl FetchError {
    pub fn unreachable(url: &str, reason: impl ToString) -> Self {
        FetchError::Unreachable {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(url: &str, reason: impl ToString) -> Self {
        FetchError::MalformedResponse {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no post-<digits> origin id in entry")]
    MissingOriginId,
    #[error("incomplete recipe: missing or invalid `{0}`")]
    IncompleteRecipe(&'static str),
    #[error("malformed document: {0}")]
    MalformedDocument(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("duplicate recipe {0}")]
    Duplicate(String),
    #[error("author `{0}` not found")]
    AuthorNotFound(String),
    /// Never returned from `ingest`; unresolved categories are dropped and logged.
    #[error("category `{0}` not found")]
    CategoryNotFound(String),
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),
}
