use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is busy: could not lock {path} within {waited_ms} ms")]
    Busy { path: PathBuf, waited_ms: u64 },
    #[error("store io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is not valid JSON and has no usable backup: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid config backup: {0}")]
    InvalidBackup(String),
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("feed {0} not found")]
    FeedNotFound(String),
    #[error("feed {feed} has no webhook {webhook}")]
    WebhookNotFound { feed: String, webhook: String },
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("an owner account already exists")]
    AlreadySetUp,
    #[error("user {0} already exists")]
    Duplicate(String),
    #[error("user {0} not found")]
    NotFound(String),
    #[error("operation not permitted: {0}")]
    Forbidden(&'static str),
    #[error("invalid user backup: {0}")]
    InvalidBackup(String),
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("feed {0} not found")]
    FeedNotFound(String),
    #[error("scheduler task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("scheduler is not running")]
    SchedulerStopped,
}
