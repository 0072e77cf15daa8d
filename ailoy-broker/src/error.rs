//! Broker and transport errors.

use thiserror::Error;

use ailoy_types::ComponentError;

/// Errors raised by the broker, the transport, or the runtime client.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No endpoint is registered under the requested URL.
    #[error("no broker listening at {0}")]
    EndpointNotFound(String),

    /// The peer connection closed while a request was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// No VM serves the requested component type or operator.
    #[error("no module provides {0}")]
    NoRoute(String),

    /// The remote side reported a failure.
    #[error(transparent)]
    Component(#[from] ComponentError),

    /// Catch-all. Include context.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<BrokerError> for ComponentError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Component(inner) => inner,
            other => ComponentError::transport(other.to_string()),
        }
    }
}
