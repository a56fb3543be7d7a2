#![forbid(unsafe_code)]

//! Callbacks through which reassembled data leaves the engine.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::flow_key::{Direction, FlowKey};
use crate::segment::Segment;

/// Why a flow was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompletionReason {
    /// FIN observed on every direction that carried traffic.
    Fin,
    /// RST observed on either direction.
    Reset,
    /// No traffic within the idle timeout.
    Idle,
    /// Dropped to bring buffered memory back under the global cap.
    Evicted,
    /// Explicitly closed by the embedding application.
    Requested,
    /// The pipeline is shutting down.
    Shutdown,
}

impl CompletionReason {
    /// True when the connection did not end on its own.
    pub fn is_forced(self) -> bool {
        !matches!(self, CompletionReason::Fin | CompletionReason::Reset)
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompletionReason::Fin => "fin",
            CompletionReason::Reset => "reset",
            CompletionReason::Idle => "idle",
            CompletionReason::Evicted => "evicted",
            CompletionReason::Requested => "requested",
            CompletionReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Receiver of reassembled streams.
///
/// Callbacks run on the ingesting task while the flow's lock is held; they must not call
/// back into the engine.
pub trait StreamConsumer: Send + Sync + 'static {
    /// Decide whether to track a newly seen flow. Rejected flows are never offered again
    /// while they stay active.
    fn accept(&self, _key: &FlowKey, _first: &Segment) -> bool {
        true
    }

    /// Contiguous bytes for one direction. `is_gap_skip` marks data that follows an
    /// unrecoverable gap and starts a new contiguous region.
    fn on_data(&self, key: &FlowKey, direction: Direction, data: Bytes, is_gap_skip: bool);

    /// Called exactly once per flow. Return true to receive still-buffered data (flagged as a
    /// gap skip) before the flow is dropped.
    fn on_complete(&self, _key: &FlowKey, _reason: CompletionReason) -> bool {
        true
    }
}

impl<C: StreamConsumer + ?Sized> StreamConsumer for Arc<C> {
    fn accept(&self, key: &FlowKey, first: &Segment) -> bool {
        (**self).accept(key, first)
    }

    fn on_data(&self, key: &FlowKey, direction: Direction, data: Bytes, is_gap_skip: bool) {
        (**self).on_data(key, direction, data, is_gap_skip)
    }

    fn on_complete(&self, key: &FlowKey, reason: CompletionReason) -> bool {
        (**self).on_complete(key, reason)
    }
}

/// Logs every reassembled chunk and completion.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingConsumer;

impl StreamConsumer for LoggingConsumer {
    fn on_data(&self, key: &FlowKey, direction: Direction, data: Bytes, is_gap_skip: bool) {
        let (src, dst) = key.endpoints(direction);
        info!(%src, %dst, dir = %direction, len = data.len(), skip = is_gap_skip, "reassembled");
    }

    fn on_complete(&self, key: &FlowKey, reason: CompletionReason) -> bool {
        info!(flow = %key, %reason, forced = reason.is_forced(), "reassembly complete");
        true
    }
}

/// Everything a [`CollectingConsumer`] observed, in callback order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Data {
        key: FlowKey,
        direction: Direction,
        data: Bytes,
        gap_skip: bool,
    },
    Complete {
        key: FlowKey,
        reason: CompletionReason,
    },
}

type AcceptFilter = Box<dyn Fn(&FlowKey, &Segment) -> bool + Send + Sync>;

/// Records callbacks in memory. Useful for embedding and tests.
pub struct CollectingConsumer {
    events: Mutex<Vec<ConsumerEvent>>,
    filter: Option<AcceptFilter>,
    flush_on_complete: bool,
}

impl fmt::Debug for CollectingConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectingConsumer")
            .field("events", &self.events.lock().len())
            .field("has_filter", &self.filter.is_some())
            .field("flush_on_complete", &self.flush_on_complete)
            .finish()
    }
}

impl Default for CollectingConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectingConsumer {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            filter: None,
            flush_on_complete: true,
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&FlowKey, &Segment) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Answer for `on_complete`; defaults to true.
    pub fn with_flush_on_complete(mut self, flush: bool) -> Self {
        self.flush_on_complete = flush;
        self
    }

    pub fn events(&self) -> Vec<ConsumerEvent> {
        self.events.lock().clone()
    }

    /// `(data, gap_skip)` chunks delivered for one direction of a flow.
    pub fn chunks(&self, key: &FlowKey, direction: Direction) -> Vec<(Bytes, bool)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ConsumerEvent::Data { key: k, direction: d, data, gap_skip } if k == key && *d == direction => {
                    Some((data.clone(), *gap_skip))
                }
                _ => None,
            })
            .collect()
    }

    /// All bytes delivered for one direction, concatenated.
    pub fn stream(&self, key: &FlowKey, direction: Direction) -> Vec<u8> {
        self.chunks(key, direction)
            .into_iter()
            .flat_map(|(data, _)| data.to_vec())
            .collect()
    }

    pub fn completions(&self, key: &FlowKey) -> Vec<CompletionReason> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ConsumerEvent::Complete { key: k, reason } if k == key => Some(*reason),
                _ => None,
            })
            .collect()
    }
}

impl StreamConsumer for CollectingConsumer {
    fn accept(&self, key: &FlowKey, first: &Segment) -> bool {
        self.filter.as_ref().map_or(true, |f| f(key, first))
    }

    fn on_data(&self, key: &FlowKey, direction: Direction, data: Bytes, is_gap_skip: bool) {
        self.events.lock().push(ConsumerEvent::Data {
            key: *key,
            direction,
            data,
            gap_skip: is_gap_skip,
        });
    }

    fn on_complete(&self, key: &FlowKey, reason: CompletionReason) -> bool {
        self.events.lock().push(ConsumerEvent::Complete { key: *key, reason });
        self.flush_on_complete
    }
}
