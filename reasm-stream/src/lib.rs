#![forbid(unsafe_code)]
//! TCP stream reassembly: turns loosely ordered, possibly duplicated segments
//! from any number of capture sources into contiguous per-direction byte streams.

pub mod consumer;
pub mod engine;
pub mod errors;
pub mod flow_key;
pub mod flow_state;
pub mod flow_table;
pub mod segment;
pub mod seq;
pub mod stats;

pub use consumer::{CollectingConsumer, CompletionReason, ConsumerEvent, LoggingConsumer, StreamConsumer};
pub use engine::Reassembler;
pub use errors::SegmentError;
pub use flow_key::{Direction, FlowKey};
pub use flow_state::{FlowState, HalfStream};
pub use flow_table::{epoch_micros, BufferBudget, FlowEntry, FlowTable, Tombstone};
pub use segment::{Segment, SourceId, TcpFlags};
pub use seq::Seq;
pub use stats::{EngineStats, StatsSnapshot};
