//! Remote engine errors.

use thiserror::Error;

use ailoy_types::{ComponentError, ErrorKind};

/// Errors from the OpenAI-compatible remote engines.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The HTTP request could not be sent or read.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The provider rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The provider rate-limited the request.
    #[error("rate limited")]
    RateLimited,

    /// Non-2xx status outside the cases above.
    #[error("http {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The response body did not match the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<ProviderError> for ComponentError {
    fn from(err: ProviderError) -> Self {
        let kind = match &err {
            ProviderError::RequestFailed(_)
            | ProviderError::RateLimited
            | ProviderError::Http { .. } => ErrorKind::Io,
            ProviderError::AuthFailed(_) => ErrorKind::Validation,
            ProviderError::InvalidResponse(_) => ErrorKind::Internal,
        };
        ComponentError::new(kind, err.to_string())
    }
}
