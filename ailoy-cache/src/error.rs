//! Model cache errors.

use thiserror::Error;

use ailoy_types::{ComponentError, ErrorKind};

/// Errors raised while resolving, downloading, or removing models.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote answered with a non-2xx status.
    #[error("http {status} fetching {url}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// The remote path that failed.
        url: String,
    },

    /// The HTTP transport itself failed.
    #[error("request to {url} failed: {message}")]
    Request {
        /// The remote path that failed.
        url: String,
        /// Transport-level detail.
        message: String,
    },

    /// The manifest could not be parsed.
    #[error("invalid manifest at {path}: {message}")]
    Manifest {
        /// Local path of the offending manifest.
        path: String,
        /// Parse detail.
        message: String,
    },

    /// A downloaded file's digest disagrees with the manifest.
    #[error("integrity check failed for {path}")]
    Integrity {
        /// The file that failed verification.
        path: String,
    },

    /// The download was interrupted by the user.
    #[error("download interrupted")]
    Interrupted,

    /// The requested model is not in the cache.
    #[error("model not found: {0}")]
    NotFound(String),
}

impl From<CacheError> for ComponentError {
    fn from(err: CacheError) -> Self {
        let kind = match &err {
            CacheError::Io(_)
            | CacheError::Http { .. }
            | CacheError::Request { .. }
            | CacheError::Interrupted => ErrorKind::Io,
            CacheError::Manifest { .. } => ErrorKind::Validation,
            CacheError::Integrity { .. } => ErrorKind::Integrity,
            CacheError::NotFound(_) => ErrorKind::NotFound,
        };
        ComponentError::new(kind, err.to_string())
    }
}
