use thiserror::Error;

/// Failures raised by a capture source. They end that source only.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("trace line {line}: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("trace line {line}: {reason}")]
    InvalidRecord { line: usize, reason: String },

    #[error("capture channel closed")]
    ChannelClosed,

    #[error("capture driver failed: {0}")]
    Driver(String),
}
