#![forbid(unsafe_code)]

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters maintained by the engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub segments_ingested: AtomicU64,
    pub segments_malformed: AtomicU64,
    pub segments_ignored: AtomicU64,
    pub segments_duplicate: AtomicU64,
    pub segments_buffered: AtomicU64,
    pub segments_dropped: AtomicU64,
    pub bytes_delivered: AtomicU64,
    pub gap_skips: AtomicU64,
    pub partial_bytes_discarded: AtomicU64,
    pub flows_accepted: AtomicU64,
    pub flows_rejected: AtomicU64,
    pub flows_completed: AtomicU64,
    pub flows_evicted: AtomicU64,
    pub flows_expired: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`] plus current table occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub segments_ingested: u64,
    pub segments_malformed: u64,
    pub segments_ignored: u64,
    pub segments_duplicate: u64,
    pub segments_buffered: u64,
    pub segments_dropped: u64,
    pub bytes_delivered: u64,
    pub gap_skips: u64,
    pub partial_bytes_discarded: u64,
    pub flows_accepted: u64,
    pub flows_rejected: u64,
    pub flows_completed: u64,
    pub flows_evicted: u64,
    pub flows_expired: u64,
    pub active_flows: usize,
    pub buffered_bytes: usize,
    pub buffered_segments: usize,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl EngineStats {
    pub fn snapshot(&self, active_flows: usize, buffered_bytes: usize, buffered_segments: usize) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            segments_ingested: get(&self.segments_ingested),
            segments_malformed: get(&self.segments_malformed),
            segments_ignored: get(&self.segments_ignored),
            segments_duplicate: get(&self.segments_duplicate),
            segments_buffered: get(&self.segments_buffered),
            segments_dropped: get(&self.segments_dropped),
            bytes_delivered: get(&self.bytes_delivered),
            gap_skips: get(&self.gap_skips),
            partial_bytes_discarded: get(&self.partial_bytes_discarded),
            flows_accepted: get(&self.flows_accepted),
            flows_rejected: get(&self.flows_rejected),
            flows_completed: get(&self.flows_completed),
            flows_evicted: get(&self.flows_evicted),
            flows_expired: get(&self.flows_expired),
            active_flows,
            buffered_bytes,
            buffered_segments,
        }
    }
}
