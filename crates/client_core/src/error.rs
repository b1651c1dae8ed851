use shared::error::GraphqlException;
use thiserror::Error;

/// Errors raised at the transport boundary. `Clone` because a failed batch
/// rejects every coalesced operation with the same value.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Graphql(#[from] GraphqlException),
    #[error("streaming transport unsupported in this context")]
    StreamingUnsupported,
    #[error("streaming connection closed")]
    ConnectionClosed,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
