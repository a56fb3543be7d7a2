use thiserror::Error;

/// Reasons a decoded segment is refused at ingestion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("declared payload length {declared} but {actual} bytes carried")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("contradictory flags: {0}")]
    ContradictoryFlags(&'static str),

    #[error("payload of {0} bytes exceeds the sequence window")]
    Oversized(usize),
}
