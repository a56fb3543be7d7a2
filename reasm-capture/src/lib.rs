#![forbid(unsafe_code)]
//! Capture sources and the pipeline that multiplexes them into one reassembler.

pub mod error;
pub mod pipeline;
pub mod source;
pub mod trace;

pub use error::CaptureError;
pub use pipeline::{Pipeline, PipelineHandle, PipelineReport, SourceOutcome, SourceReport};
pub use source::{CaptureSource, ChannelSource, ReplaySource, SegmentSender};
pub use trace::{format_flags, parse_flags, SegmentRecord, TraceSource};
