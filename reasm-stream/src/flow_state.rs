//! Per-connection reassembly state.
//! Each direction tracks the next expected position and an ordered set of
//! out-of-order chunks that are released once the gap in front of them closes.

#![forbid(unsafe_code)]

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::flow_key::Direction;
use crate::flow_table::BufferBudget;
use crate::seq::Seq;

/// Absolute position given to the first sequence number observed in a direction.
/// Anything up to 2^31 before it still maps to a positive position.
const ORIGIN: u64 = 1 << 32;

/// Where a payload falls relative to the next expected position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Entirely before the next expected byte.
    Duplicate,
    /// Starts at (or straddles) the next expected byte; `skip` bytes were already delivered.
    Contiguous { skip: usize },
    /// Starts after the next expected byte.
    Ahead,
}

/// One direction of a connection.
///
/// Sequence numbers are unwrapped into 64-bit positions relative to an anchor that moves
/// with every delivery, so `pending` stays ordered across a 2^32 wrap.
#[derive(Debug, Default)]
pub struct HalfStream {
    anchor: Option<(Seq, u64)>,
    started: bool,
    next_abs: u64,
    pending: BTreeMap<u64, Bytes>,
    pending_bytes: usize,
    isn: Option<Seq>,
    fin_at: Option<u64>,
    first_seen_us: u64,
    delivered: u64,
    skipped: u64,
}

impl HalfStream {
    /// True once the direction has a known origin and delivers in order.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// True once any segment has been seen in this direction.
    pub fn is_observed(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn next_seq(&self) -> Option<Seq> {
        if self.started {
            self.anchor.map(|(seq, _)| seq)
        } else {
            None
        }
    }

    /// Sequence number of the SYN that opened this direction, if one was captured.
    pub fn isn(&self) -> Option<Seq> {
        self.isn
    }

    pub fn fin_seen(&self) -> bool {
        self.fin_at.is_some()
    }

    /// True once a FIN was seen and every byte in front of it has been delivered.
    pub fn is_finished(&self) -> bool {
        self.fin_at
            .is_some_and(|fin| self.next_abs >= fin && (self.started || self.pending.is_empty()))
    }

    pub fn pending_segments(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.delivered
    }

    /// Bytes known to be missing in front of data flushed across a gap.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    pub(crate) fn position(&self, seq: Seq) -> Option<u64> {
        let (anchor_seq, anchor_abs) = self.anchor?;
        Some((anchor_abs as i64 + seq.distance(anchor_seq) as i64) as u64)
    }

    /// Fix the origin at `seq` and begin in-order delivery. No-op once started.
    pub(crate) fn start_at(&mut self, seq: Seq) -> bool {
        if self.started {
            return false;
        }
        let abs = self.position(seq).unwrap_or(ORIGIN);
        self.anchor = Some((seq, abs));
        self.next_abs = abs;
        self.started = true;
        true
    }

    /// Start from a captured SYN: data begins right after `isn`.
    pub(crate) fn start_syn(&mut self, isn: Seq, now_us: u64) -> bool {
        if self.started {
            return false;
        }
        self.stamp(now_us);
        self.isn = Some(isn);
        self.start_at(isn + 1)
    }

    /// Remember `seq` as a provisional anchor without starting delivery.
    pub(crate) fn observe(&mut self, seq: Seq, now_us: u64) {
        if self.anchor.is_none() {
            self.stamp(now_us);
            self.anchor = Some((seq, ORIGIN));
            self.next_abs = ORIGIN;
        }
    }

    fn stamp(&mut self, now_us: u64) {
        if self.anchor.is_none() {
            self.first_seen_us = now_us;
        }
    }

    /// Record the position of a FIN. The direction closes once delivery reaches it.
    pub(crate) fn mark_fin(&mut self, abs: u64) {
        self.fin_at = Some(self.fin_at.map_or(abs, |fin| fin.min(abs)));
    }

    /// Begin delivery of a direction whose SYN was never seen, at the lowest buffered position
    /// or at `incoming` if that is lower.
    pub(crate) fn pick_up(&mut self, incoming: Option<u64>) -> bool {
        if self.started {
            return false;
        }
        let Some((anchor_seq, anchor_abs)) = self.anchor else {
            return false;
        };
        let lowest = self.pending.keys().next().copied();
        let Some(abs) = lowest.into_iter().chain(incoming).min() else {
            return false;
        };
        self.anchor = Some((anchor_seq + abs.wrapping_sub(anchor_abs) as u32, abs));
        self.next_abs = abs;
        self.started = true;
        true
    }

    /// A SYN-less direction that has buffered data for at least `delay_us`.
    pub(crate) fn pick_up_due(&self, now_us: u64, delay_us: u64) -> bool {
        !self.started && !self.pending.is_empty() && now_us.saturating_sub(self.first_seen_us) >= delay_us
    }

    /// A SYN-less direction whose buffered data runs without a hole up to its FIN.
    pub(crate) fn buffered_through_fin(&self) -> bool {
        let Some(fin) = self.fin_at else {
            return false;
        };
        if self.started {
            return false;
        }
        let mut chunks = self.pending.iter();
        let Some((&start, first)) = chunks.next() else {
            return false;
        };
        let mut end = start + first.len() as u64;
        for (&start, chunk) in chunks {
            if start > end {
                return false;
            }
            end = end.max(start + chunk.len() as u64);
        }
        end >= fin
    }

    pub(crate) fn classify(&self, abs: u64, len: usize) -> Placement {
        let end = abs + len as u64;
        if end <= self.next_abs {
            Placement::Duplicate
        } else if abs <= self.next_abs {
            Placement::Contiguous { skip: (self.next_abs - abs) as usize }
        } else {
            Placement::Ahead
        }
    }

    pub(crate) fn advance(&mut self, len: usize) {
        if let Some((seq, abs)) = self.anchor {
            let next = self.next_abs + len as u64;
            self.anchor = Some((seq + (next - abs) as u32, next));
            self.next_abs = next;
            self.delivered += len as u64;
        }
    }

    /// Portions of `payload` at `abs` not already covered by pending chunks.
    pub(crate) fn plan_insert(&self, abs: u64, payload: &Bytes) -> Vec<(u64, Bytes)> {
        let end = abs + payload.len() as u64;
        let mut cursor = abs;
        let mut pieces = Vec::new();

        if let Some((&start, chunk)) = self.pending.range(..=abs).next_back() {
            cursor = cursor.max(start + chunk.len() as u64);
        }
        for (&start, chunk) in self.pending.range(abs..end) {
            if cursor >= end {
                break;
            }
            if start > cursor {
                let piece_end = start.min(end);
                pieces.push((cursor, payload.slice((cursor - abs) as usize..(piece_end - abs) as usize)));
            }
            cursor = cursor.max(start + chunk.len() as u64);
        }
        if cursor < end {
            pieces.push((cursor, payload.slice((cursor - abs) as usize..)));
        }
        pieces
    }

    fn insert(&mut self, pieces: Vec<(u64, Bytes)>) -> (usize, usize) {
        let mut bytes = 0;
        let count = pieces.len();
        for (abs, chunk) in pieces {
            bytes += chunk.len();
            self.pending.insert(abs, chunk);
        }
        self.pending_bytes += bytes;
        (bytes, count)
    }

    fn drop_front(&mut self) -> Option<usize> {
        let (_, chunk) = self.pending.pop_first()?;
        self.pending_bytes -= chunk.len();
        Some(chunk.len())
    }

    /// Remove every pending chunk reachable from the next expected position, advancing past it.
    /// Returns the fresh bytes plus the buffered bytes/segments released.
    fn take_contiguous(&mut self) -> (Vec<Bytes>, usize, usize) {
        let mut out = Vec::new();
        let mut freed_bytes = 0;
        let mut freed_segments = 0;
        if !self.started {
            return (out, 0, 0);
        }
        while let Some(entry) = self.pending.first_entry() {
            let start = *entry.key();
            if start > self.next_abs {
                break;
            }
            let chunk = entry.remove();
            freed_bytes += chunk.len();
            freed_segments += 1;
            let end = start + chunk.len() as u64;
            if end <= self.next_abs {
                continue;
            }
            let fresh = chunk.slice((self.next_abs - start) as usize..);
            self.advance(fresh.len());
            out.push(fresh);
        }
        self.pending_bytes -= freed_bytes;
        (out, freed_bytes, freed_segments)
    }

    /// Drain all pending chunks as contiguous runs. Every run follows a gap.
    fn flush(&mut self) -> (Vec<Bytes>, usize, usize) {
        let pending = std::mem::take(&mut self.pending);
        let freed_bytes = std::mem::take(&mut self.pending_bytes);
        let freed_segments = pending.len();

        let mut runs: Vec<Vec<Bytes>> = Vec::new();
        let mut run_end = self.started.then_some(self.next_abs);
        for (start, chunk) in pending {
            let end = start + chunk.len() as u64;
            if let Some(prev) = run_end {
                self.skipped += start.saturating_sub(prev);
            }
            let extends = !runs.is_empty() && run_end == Some(start);
            match runs.last_mut() {
                Some(run) if extends => run.push(chunk),
                _ => runs.push(vec![chunk]),
            }
            run_end = Some(end);
        }

        // Later copies of flushed bytes count as already delivered.
        if let (Some(end), Some((seq, abs))) = (run_end, self.anchor) {
            if !self.started || end > self.next_abs {
                self.anchor = Some((seq + end.wrapping_sub(abs) as u32, end));
                self.next_abs = end;
                self.started = true;
            }
        }

        let out: Vec<Bytes> = runs.into_iter().map(concat).collect();
        self.delivered += out.iter().map(|b| b.len() as u64).sum::<u64>();
        (out, freed_bytes, freed_segments)
    }

    fn release(&mut self) -> (usize, usize) {
        let segments = self.pending.len();
        self.pending.clear();
        (std::mem::take(&mut self.pending_bytes), segments)
    }
}

/// Join chunks into one buffer, avoiding a copy for a single chunk.
pub(crate) fn concat(mut chunks: Vec<Bytes>) -> Bytes {
    if chunks.len() == 1 {
        return chunks.pop().unwrap_or_default();
    }
    let total = chunks.iter().map(Bytes::len).sum();
    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

/// Reassembly state of one connection, owned by the flow table.
#[derive(Debug, Default)]
pub struct FlowState {
    halves: [HalfStream; 2],
    buffered_bytes: usize,
    buffered_segments: usize,
    reset: bool,
    closed: bool,
    completed: bool,
}

impl FlowState {
    pub fn half(&self, dir: Direction) -> &HalfStream {
        &self.halves[dir.index()]
    }

    pub(crate) fn half_mut(&mut self, dir: Direction) -> &mut HalfStream {
        &mut self.halves[dir.index()]
    }

    pub fn next_seq(&self, dir: Direction) -> Option<Seq> {
        self.half(dir).next_seq()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn buffered_segments(&self) -> usize {
        self.buffered_segments
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn mark_reset(&mut self) {
        self.reset = true;
    }

    /// RST on either side, or every direction that has carried traffic delivered up to its FIN.
    pub(crate) fn termination_observed(&self) -> bool {
        if self.reset {
            return true;
        }
        let any_fin = self.halves.iter().any(HalfStream::fin_seen);
        any_fin && self.halves.iter().all(|h| h.is_finished() || !h.is_observed())
    }

    pub(crate) fn was_reset(&self) -> bool {
        self.reset
    }

    /// Flip to completed. Returns false if completion already happened.
    pub(crate) fn begin_completion(&mut self) -> bool {
        if self.completed {
            return false;
        }
        self.completed = true;
        self.closed = true;
        true
    }

    /// Add chunks whose budget was already reserved.
    pub(crate) fn insert_reserved(&mut self, dir: Direction, pieces: Vec<(u64, Bytes)>) {
        let (bytes, segments) = self.half_mut(dir).insert(pieces);
        self.buffered_bytes += bytes;
        self.buffered_segments += segments;
    }

    /// Drop the lowest pending chunk of `dir`, or of the other direction when `dir` has none.
    pub(crate) fn drop_oldest(&mut self, dir: Direction, budget: &BufferBudget) -> Option<usize> {
        let dropped = self
            .half_mut(dir)
            .drop_front()
            .or_else(|| self.half_mut(dir.reverse()).drop_front())?;
        self.buffered_bytes -= dropped;
        self.buffered_segments -= 1;
        budget.release(dropped, 1);
        Some(dropped)
    }

    pub(crate) fn take_contiguous(&mut self, dir: Direction, budget: &BufferBudget) -> Vec<Bytes> {
        let (chunks, bytes, segments) = self.half_mut(dir).take_contiguous();
        self.buffered_bytes -= bytes;
        self.buffered_segments -= segments;
        budget.release(bytes, segments);
        chunks
    }

    pub(crate) fn flush(&mut self, budget: &BufferBudget) -> Vec<(Direction, Bytes)> {
        let mut out = Vec::new();
        for dir in Direction::BOTH {
            let (chunks, bytes, segments) = self.half_mut(dir).flush();
            self.buffered_bytes -= bytes;
            self.buffered_segments -= segments;
            budget.release(bytes, segments);
            out.extend(chunks.into_iter().map(|c| (dir, c)));
        }
        out
    }

    /// Discard everything still buffered. Returns the number of bytes thrown away.
    pub(crate) fn release_all(&mut self, budget: &BufferBudget) -> usize {
        let mut discarded = 0;
        for dir in Direction::BOTH {
            let (bytes, segments) = self.half_mut(dir).release();
            budget.release(bytes, segments);
            discarded += bytes;
        }
        self.buffered_bytes = 0;
        self.buffered_segments = 0;
        discarded
    }
}
