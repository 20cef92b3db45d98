//! Error types for the listing cache.

use thiserror::Error;

/// Result type alias for listing operations.
pub type Result<T> = std::result::Result<T, ListingError>;

/// Errors that can occur in the listing cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListingError {
    /// The URL could not be parsed or cannot name a directory.
    #[error("invalid directory url: {0}")]
    InvalidUrl(String),

    /// No backend can enumerate this URL's scheme.
    #[error("no backend can list: {0}")]
    UnsupportedScheme(String),

    /// A job was redirected more often than the configured hop cap.
    #[error("too many redirections while listing: {0}")]
    TooManyRedirects(String),

    /// The backend failed to start or run a job.
    #[error("backend error: {0}")]
    Backend(String),

    /// An operation referenced a lister handle the cache does not know.
    #[error("unknown lister handle: {0}")]
    UnknownLister(u64),
}
