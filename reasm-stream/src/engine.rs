#![forbid(unsafe_code)]

//! The reassembly engine: classifies each segment against its flow's next expected
//! sequence number, buffers what arrives early, drops what arrives late, and hands
//! contiguous bytes to the [`StreamConsumer`].

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, trace, warn};

use reasm_core::{ReasmResult, ReassemblyConfig};

use crate::consumer::{CompletionReason, StreamConsumer};
use crate::flow_key::{Direction, FlowKey};
use crate::flow_state::{concat, FlowState, Placement};
use crate::flow_table::{epoch_micros, FlowEntry, FlowTable, Tombstone};
use crate::segment::{Segment, TcpFlags};
use crate::stats::{add, bump, EngineStats, StatsSnapshot};

pub struct Reassembler<C> {
    config: ReassemblyConfig,
    table: FlowTable,
    consumer: C,
    stats: EngineStats,
    /// Latest capture timestamp ingested, in epoch microseconds.
    clock: AtomicU64,
}

impl<C: StreamConsumer> Reassembler<C> {
    pub fn new(config: ReassemblyConfig, consumer: C) -> ReasmResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            table: FlowTable::new(),
            consumer,
            stats: EngineStats::default(),
            clock: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ReassemblyConfig {
        &self.config
    }

    pub fn consumer(&self) -> &C {
        &self.consumer
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    pub fn stats(&self) -> StatsSnapshot {
        let budget = self.table.budget();
        self.stats
            .snapshot(self.table.len(), budget.bytes(), budget.segments())
    }

    /// Latest capture timestamp seen so far. Idle flushing is measured against this clock so
    /// replayed captures expire flows the same way live ones do.
    pub fn capture_clock(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(self.clock.load(Ordering::Acquire))
    }

    /// Feed one segment. Blocks only on the lock of the segment's own flow (and, under memory
    /// pressure, on try-locks of eviction candidates).
    pub fn ingest(&self, segment: Segment) {
        bump(&self.stats.segments_ingested);
        if let Err(err) = segment.validate() {
            bump(&self.stats.segments_malformed);
            debug!(
                source = %segment.source(),
                src = %segment.src(),
                dst = %segment.dst(),
                %err,
                "discarding malformed segment"
            );
            return;
        }

        let key = *segment.flow_key();
        let now_us = epoch_micros(segment.timestamp());
        self.clock.fetch_max(now_us, Ordering::AcqRel);

        loop {
            let entry = match self.table.get(&key) {
                Some(entry) => entry,
                None => match self.admit(&key, &segment, now_us) {
                    Some(entry) => entry,
                    None => return,
                },
            };
            let mut state = entry.lock();
            if state.is_completed() {
                // Torn down between lookup and lock; look the key up again.
                continue;
            }
            entry.touch(now_us);
            self.apply(&key, &mut state, segment, now_us);
            if state.is_completed() {
                self.table.remove_entry(&key, entry.id());
            }
            return;
        }
    }

    /// Complete every flow idle for longer than `max_idle`, measured against `now`. SYN-less
    /// directions buffering past the pickup delay start delivering first.
    pub fn flush_older_than(&self, max_idle: Duration, now: SystemTime) -> usize {
        let picked = self.pick_up_stalled(epoch_micros(now));
        let flushed = self
            .table
            .for_each_idle_older_than(max_idle, now, |key, state| {
                self.finish(key, state, CompletionReason::Idle)
            });
        let forgotten = self.table.expire_rejected(max_idle, now) + self.table.expire_completed(max_idle, now);
        if picked > 0 || flushed > 0 || forgotten > 0 {
            debug!(picked, flushed, forgotten, "idle sweep");
        }
        flushed
    }

    /// Complete flows idle past the configured timeout, relative to the capture clock.
    pub fn flush_idle(&self) -> usize {
        self.flush_older_than(self.config.idle_timeout(), self.capture_clock())
    }

    /// Explicitly complete one flow. Returns false if it is not tracked.
    pub fn close(&self, key: &FlowKey) -> bool {
        let Some(entry) = self.table.get(key) else {
            return false;
        };
        let mut state = entry.lock();
        if state.is_completed() {
            return false;
        }
        self.finish(key, &mut state, CompletionReason::Requested);
        self.table.remove_entry(key, entry.id());
        true
    }

    /// Force-complete every open flow.
    pub fn shutdown(&self) -> usize {
        let flushed = self
            .table
            .for_each_open(|key, state| self.finish(key, state, CompletionReason::Shutdown));
        info!(flows = flushed, "flushed open flows");
        flushed
    }

    fn pick_up_stalled(&self, now_us: u64) -> usize {
        if !self.config.allow_missing_init {
            return 0;
        }
        let delay_us = self.config.missing_init_delay().as_micros() as u64;
        let mut picked = 0;
        self.table.for_each_open(|key, state| {
            for dir in Direction::BOTH {
                if state.half(dir).pick_up_due(now_us, delay_us) && self.pick_up(key, state, dir, None) {
                    picked += 1;
                }
            }
            self.finish_if_terminated(key, state);
        });
        picked
    }

    fn admit(&self, key: &FlowKey, segment: &Segment, now_us: u64) -> Option<Arc<FlowEntry>> {
        if self.table.is_rejected(key) {
            self.table.reject(*key, now_us);
            bump(&self.stats.segments_ignored);
            return None;
        }
        if segment.payload().is_empty() && !segment.flags().contains(TcpFlags::SYN) {
            // Bare ACK/FIN/RST for an unknown flow, typically the tail of one already gone.
            bump(&self.stats.segments_ignored);
            trace!(flow = %key, "ignoring control-only segment for unknown flow");
            return None;
        }
        if let Some(tombstone) = self.table.tombstone(key) {
            let dir = segment.direction();
            let new_syn = segment.flags().contains(TcpFlags::SYN) && tombstone.isn(dir) != Some(segment.seq());
            if !new_syn {
                let end = segment.data_seq() + segment.payload().len() as u32;
                match tombstone.final_seq(dir) {
                    Some(last) if !end.is_after(last) => {
                        self.table.touch_tombstone(key, now_us);
                        bump(&self.stats.segments_duplicate);
                        trace!(flow = %key, %dir, seq = %segment.seq(), "late copy for completed flow");
                    }
                    _ => {
                        bump(&self.stats.segments_ignored);
                        debug!(flow = %key, %dir, seq = %segment.seq(), "segment for completed flow ignored");
                    }
                }
                return None;
            }
            self.table.forget_completed(key);
            debug!(flow = %key, isn = %segment.seq(), "new SYN reopens completed flow");
        }
        if !self.consumer.accept(key, segment) {
            self.table.reject(*key, now_us);
            bump(&self.stats.flows_rejected);
            debug!(flow = %key, "flow rejected by consumer");
            return None;
        }

        while self.table.len() >= self.config.max_flows {
            let evicted = self.table.evict_least_recent(
                None,
                |_| true,
                |k, s| self.finish(k, s, CompletionReason::Evicted),
            );
            if !evicted {
                break;
            }
        }

        let (entry, created) = self.table.lookup_or_create(*key, now_us);
        if created {
            bump(&self.stats.flows_accepted);
            info!(flow = %key, source = %segment.source(), "tracking new flow");
        }
        Some(entry)
    }

    fn apply(&self, key: &FlowKey, state: &mut FlowState, segment: Segment, now_us: u64) {
        let dir = segment.direction();
        let flags = segment.flags();

        let half = state.half_mut(dir);
        if flags.contains(TcpFlags::SYN) {
            half.start_syn(segment.seq(), now_us);
        } else {
            half.observe(segment.seq(), now_us);
        }

        let data_seq = segment.data_seq();
        let payload = segment.into_payload();
        let end = data_seq + payload.len() as u32;
        if !payload.is_empty() {
            if let Some(abs) = state.half(dir).position(data_seq) {
                self.place(key, state, dir, abs, payload);
            }
        }
        // A late SYN can make already-buffered data contiguous.
        self.deliver(key, state, dir, None);

        if flags.contains(TcpFlags::RST) {
            state.mark_reset();
        }
        if flags.contains(TcpFlags::FIN) {
            if let Some(fin) = state.half(dir).position(end) {
                state.half_mut(dir).mark_fin(fin);
            }
        }
        if state.half(dir).buffered_through_fin() {
            self.pick_up(key, state, dir, None);
        }
        self.finish_if_terminated(key, state);
    }

    fn finish_if_terminated(&self, key: &FlowKey, state: &mut FlowState) {
        if state.is_completed() || !state.termination_observed() {
            return;
        }
        let reason = if state.was_reset() {
            CompletionReason::Reset
        } else {
            CompletionReason::Fin
        };
        self.finish(key, state, reason);
    }

    /// Start delivery of a SYN-less direction. No-op in strict mode or once started.
    fn pick_up(&self, key: &FlowKey, state: &mut FlowState, dir: Direction, incoming: Option<u64>) -> bool {
        if !self.config.allow_missing_init || !state.half_mut(dir).pick_up(incoming) {
            return false;
        }
        if let Some(seq) = state.next_seq(dir) {
            debug!(flow = %key, %dir, %seq, "picking up stream without SYN");
        }
        self.deliver(key, state, dir, None);
        true
    }

    fn place(&self, key: &FlowKey, state: &mut FlowState, dir: Direction, abs: u64, payload: Bytes) {
        let half = state.half(dir);
        if !half.is_started() {
            self.buffer(key, state, dir, abs, payload);
            return;
        }
        match half.classify(abs, payload.len()) {
            Placement::Duplicate => {
                bump(&self.stats.segments_duplicate);
                trace!(flow = %key, %dir, len = payload.len(), "duplicate segment");
            }
            Placement::Contiguous { skip } => {
                let fresh = payload.slice(skip..);
                state.half_mut(dir).advance(fresh.len());
                self.deliver(key, state, dir, Some(fresh));
            }
            Placement::Ahead => self.buffer(key, state, dir, abs, payload),
        }
    }

    /// Hand `head` plus everything now contiguous behind it to the consumer in one call.
    fn deliver(&self, key: &FlowKey, state: &mut FlowState, dir: Direction, head: Option<Bytes>) {
        let mut chunks: Vec<Bytes> = head.into_iter().collect();
        chunks.extend(state.take_contiguous(dir, self.table.budget()));
        if chunks.is_empty() {
            return;
        }
        let data = concat(chunks);
        add(&self.stats.bytes_delivered, data.len() as u64);
        self.consumer.on_data(key, dir, data, false);
    }

    /// Buffer an early payload, making room under the per-flow and global caps first.
    fn buffer(&self, key: &FlowKey, state: &mut FlowState, dir: Direction, abs: u64, payload: Bytes) {
        let cfg = &self.config;
        let budget = self.table.budget();
        if payload.len() > cfg.max_flow_buffered_bytes {
            if self.pick_up(key, state, dir, Some(abs)) {
                return self.place(key, state, dir, abs, payload);
            }
            bump(&self.stats.segments_dropped);
            warn!(flow = %key, %dir, len = payload.len(), "segment exceeds per-flow buffer cap; dropped");
            return;
        }

        loop {
            let pieces = state.half(dir).plan_insert(abs, &payload);
            if pieces.is_empty() {
                bump(&self.stats.segments_duplicate);
                return;
            }
            let need_bytes: usize = pieces.iter().map(|(_, b)| b.len()).sum();
            let need_segments = pieces.len();

            let over_flow_cap = state.buffered_bytes() + need_bytes > cfg.max_flow_buffered_bytes
                || state.buffered_segments() + need_segments > cfg.max_flow_buffered_segments;
            if over_flow_cap {
                if self.pick_up(key, state, dir, Some(abs)) {
                    return self.place(key, state, dir, abs, payload);
                }
                bump(&self.stats.segments_dropped);
                if state.drop_oldest(dir, budget).is_some() {
                    debug!(flow = %key, %dir, "per-flow cap reached; dropped oldest pending segment");
                    continue;
                }
                return;
            }

            if budget.try_reserve(need_bytes, need_segments, cfg.max_buffered_bytes, cfg.max_buffered_segments) {
                state.insert_reserved(dir, pieces);
                bump(&self.stats.segments_buffered);
                return;
            }
            if self.pick_up(key, state, dir, Some(abs)) {
                return self.place(key, state, dir, abs, payload);
            }

            let evicted = self.table.evict_least_recent(
                Some(key),
                |s| s.buffered_segments() > 0,
                |k, s| self.finish(k, s, CompletionReason::Evicted),
            );
            if evicted {
                continue;
            }
            bump(&self.stats.segments_dropped);
            if state.drop_oldest(dir, budget).is_some() {
                warn!(flow = %key, %dir, "global cap reached with nothing to evict; dropped oldest pending segment");
                continue;
            }
            warn!(flow = %key, %dir, "global cap reached; dropped segment");
            return;
        }
    }

    /// Tear a flow down: notify the consumer once, optionally flush, release its buffers.
    fn finish(&self, key: &FlowKey, state: &mut FlowState, reason: CompletionReason) {
        if !state.begin_completion() {
            return;
        }
        let budget = self.table.budget();
        for dir in Direction::BOTH {
            self.pick_up(key, state, dir, None);
        }
        if self.consumer.on_complete(key, reason) {
            for (dir, data) in state.flush(budget) {
                bump(&self.stats.gap_skips);
                add(&self.stats.bytes_delivered, data.len() as u64);
                self.consumer.on_data(key, dir, data, true);
            }
        }
        let discarded = state.release_all(budget);
        if discarded > 0 {
            add(&self.stats.partial_bytes_discarded, discarded as u64);
            debug!(flow = %key, discarded, "discarded undelivered bytes");
        }
        match reason {
            CompletionReason::Evicted => bump(&self.stats.flows_evicted),
            CompletionReason::Idle => bump(&self.stats.flows_expired),
            _ => bump(&self.stats.flows_completed),
        }
        let skipped: u64 = Direction::BOTH.iter().map(|d| state.half(*d).skipped_bytes()).sum();
        let now_us = self.clock.load(Ordering::Acquire);
        self.table.bury(*key, Tombstone::of(state, now_us), self.config.max_flows);
        info!(flow = %key, %reason, skipped, "flow complete");
    }
}
