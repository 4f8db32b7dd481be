use thiserror::Error;

/// Crate-wide error taxonomy. Every public operation fails with one of these kinds so
/// callers can match without downcasting into `anyhow`.
#[derive(Debug, Error)]
pub enum ShannonError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("os error: {0}")]
    Os(#[source] anyhow::Error),

    #[error("security violation: {0}")]
    Security(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("data corruption detected: {0}")]
    Corruption(String),
}

impl ShannonError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }

    pub fn os(err: anyhow::Error) -> Self {
        Self::Os(err)
    }

    pub fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }
}

impl From<anyhow::Error> for ShannonError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

impl From<std::io::Error> for ShannonError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(anyhow::Error::from(err))
    }
}

impl From<rusqlite::Error> for ShannonError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(anyhow::Error::from(err))
    }
}

impl From<serde_json::Error> for ShannonError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ShannonError>;
