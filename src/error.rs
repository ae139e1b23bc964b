//! Error kinds shared by the ingestion and query paths.
//!
//! Every component returns [`Result`]. The variants map one-to-one onto the
//! failure classes callers need to tell apart: client mistakes
//! ([`Error::NotFound`], [`Error::InvalidInput`], [`Error::NoContent`]) and
//! upstream trouble ([`Error::UpstreamRateLimited`], [`Error::UpstreamFailure`]).
//!
//! Only [`Error::UpstreamRateLimited`] is ever retried, and only inside the
//! batch embedding client.

use thiserror::Error;

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An assistant, document or session referenced by id does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Missing field, malformed URL, oversized or wrong-type upload.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The upstream provider kept answering 429 after the retry budget.
    #[error("upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    /// Embedding, vector index or generation service failure.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    /// Chunking or loading produced nothing usable.
    #[error("no content: {0}")]
    NoContent(String),

    /// Relational store failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidInput(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Error::UpstreamFailure(message.into())
    }

    /// True for errors caused by the caller rather than by an upstream service.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::InvalidInput(_) | Error::NoContent(_)
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::UpstreamRateLimited(_))
    }
}

/// Pass successful responses through; turn 429 into
/// [`Error::UpstreamRateLimited`] and every other status into
/// [`Error::UpstreamFailure`], keeping the response body for the message.
pub(crate) async fn check_status(
    response: reqwest::Response,
    service: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{} error {}: {}", service, status, body);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Err(Error::UpstreamRateLimited(message))
    } else {
        Err(Error::UpstreamFailure(message))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::UpstreamFailure(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::UpstreamFailure(format!("malformed response: {}", e))
    }
}
