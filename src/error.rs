use thiserror::Error;

#[derive(Debug, Error)]
pub enum CapmetaError {
    #[error("packet decode error: {0}")]
    ParseError(String),

    #[error("no IPv4 layer found in packet")]
    NoIpv4Layer,

    #[error("sink transport error: {0}")]
    Sink(#[from] SinkError),

    #[error("invalid sink endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures on the notification channel. The trackers report these and
/// keep going; they never abort a run.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("reply frame exceeds {max} bytes (got {got})")]
    OversizeFrame { max: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, CapmetaError>;
