#![forbid(unsafe_code)]

//! Concurrent map from [`FlowKey`] to [`FlowState`].
//!
//! The map is sharded (`DashMap`) and every flow sits behind its own mutex, so independent
//! flows never contend on a shared lock. Shard guards are always released before a flow
//! mutex is taken.

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::flow_key::{Direction, FlowKey};
use crate::flow_state::FlowState;
use crate::seq::Seq;

/// Microseconds since the Unix epoch; timestamps before the epoch clamp to zero.
pub fn epoch_micros(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}

/// Global buffered byte/segment totals across all flows.
#[derive(Debug, Default)]
pub struct BufferBudget {
    bytes: AtomicUsize,
    segments: AtomicUsize,
}

impl BufferBudget {
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn segments(&self) -> usize {
        self.segments.load(Ordering::Acquire)
    }

    /// Charge `bytes`/`segments` only if both totals stay within their caps.
    pub fn try_reserve(&self, bytes: usize, segments: usize, max_bytes: usize, max_segments: usize) -> bool {
        let bytes_ok = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(bytes).filter(|&total| total <= max_bytes)
            })
            .is_ok();
        if !bytes_ok {
            return false;
        }
        let segments_ok = self
            .segments
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_add(segments).filter(|&total| total <= max_segments)
            })
            .is_ok();
        if !segments_ok {
            self.bytes.fetch_sub(bytes, Ordering::AcqRel);
        }
        segments_ok
    }

    pub fn release(&self, bytes: usize, segments: usize) {
        self.bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.segments.fetch_sub(segments, Ordering::AcqRel);
    }
}

/// A table slot: the flow's state plus the bookkeeping scanned without taking its lock.
#[derive(Debug)]
pub struct FlowEntry {
    id: u64,
    last_activity: AtomicU64,
    state: Mutex<FlowState>,
}

impl FlowEntry {
    fn new(id: u64, now_us: u64) -> Self {
        Self {
            id,
            last_activity: AtomicU64::new(now_us),
            state: Mutex::new(FlowState::default()),
        }
    }

    /// Creation order; lower ids are older.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn last_activity_micros(&self) -> u64 {
        self.last_activity.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self, now_us: u64) {
        self.last_activity.fetch_max(now_us, Ordering::AcqRel);
    }

    pub fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, FlowState>> {
        self.state.try_lock()
    }
}

/// What is kept of a flow after it completed: where each direction ended and which SYN opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    final_seq: [Option<Seq>; 2],
    isn: [Option<Seq>; 2],
    last_seen: u64,
}

impl Tombstone {
    pub fn of(state: &FlowState, now_us: u64) -> Self {
        Self {
            final_seq: Direction::BOTH.map(|d| state.next_seq(d)),
            isn: Direction::BOTH.map(|d| state.half(d).isn()),
            last_seen: now_us,
        }
    }

    /// Sequence number right after the last byte delivered in `dir`.
    pub fn final_seq(&self, dir: Direction) -> Option<Seq> {
        self.final_seq[dir.index()]
    }

    pub fn isn(&self, dir: Direction) -> Option<Seq> {
        self.isn[dir.index()]
    }

    pub fn last_seen_micros(&self) -> u64 {
        self.last_seen
    }
}

#[derive(Debug)]
pub struct FlowTable {
    flows: DashMap<FlowKey, Arc<FlowEntry>>,
    rejected: DashMap<FlowKey, u64>,
    completed: DashMap<FlowKey, Tombstone>,
    budget: BufferBudget,
    next_id: AtomicU64,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
            rejected: DashMap::new(),
            completed: DashMap::new(),
            budget: BufferBudget::default(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn budget(&self) -> &BufferBudget {
        &self.budget
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<FlowEntry>> {
        self.flows.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Existing entry for `key`, or a fresh one. The flag is true when this call created it.
    pub fn lookup_or_create(&self, key: FlowKey, now_us: u64) -> (Arc<FlowEntry>, bool) {
        let mut created = false;
        let entry = self
            .flows
            .entry(key)
            .or_insert_with(|| {
                created = true;
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Arc::new(FlowEntry::new(id, now_us))
            })
            .value()
            .clone();
        (entry, created)
    }

    /// Drop the slot for `key` regardless of which entry occupies it.
    pub fn remove(&self, key: &FlowKey) -> Option<Arc<FlowEntry>> {
        self.flows.remove(key).map(|(_, e)| e)
    }

    /// Drop the slot for `key` only if it still holds entry `id`.
    pub(crate) fn remove_entry(&self, key: &FlowKey, id: u64) {
        self.flows.remove_if(key, |_, e| e.id == id);
    }

    pub fn is_rejected(&self, key: &FlowKey) -> bool {
        self.rejected.contains_key(key)
    }

    pub(crate) fn reject(&self, key: FlowKey, now_us: u64) {
        self.rejected
            .entry(key)
            .and_modify(|seen| *seen = (*seen).max(now_us))
            .or_insert(now_us);
    }

    pub fn rejected_len(&self) -> usize {
        self.rejected.len()
    }

    /// Forget rejected keys with no traffic for longer than `max_idle`.
    pub fn expire_rejected(&self, max_idle: Duration, now: SystemTime) -> usize {
        let now_us = epoch_micros(now);
        let max_idle_us = max_idle.as_micros() as u64;
        let before = self.rejected.len();
        self.rejected
            .retain(|_, seen| now_us.saturating_sub(*seen) <= max_idle_us);
        before - self.rejected.len()
    }

    /// Remember a completed flow. Beyond `max` tombstones the oldest quarter is forgotten.
    pub(crate) fn bury(&self, key: FlowKey, tombstone: Tombstone, max: usize) {
        self.completed.insert(key, tombstone);
        if self.completed.len() <= max {
            return;
        }
        let mut ages: Vec<(u64, FlowKey)> = self.completed.iter().map(|e| (e.last_seen, *e.key())).collect();
        ages.sort_unstable_by_key(|(seen, _)| *seen);
        let keep = max - max / 4;
        for (_, key) in ages.iter().take(ages.len().saturating_sub(keep)) {
            self.completed.remove(key);
        }
        debug!(kept = self.completed.len(), "pruned completed-flow tombstones");
    }

    pub fn tombstone(&self, key: &FlowKey) -> Option<Tombstone> {
        self.completed.get(key).map(|t| *t.value())
    }

    pub(crate) fn touch_tombstone(&self, key: &FlowKey, now_us: u64) {
        if let Some(mut t) = self.completed.get_mut(key) {
            t.last_seen = t.last_seen.max(now_us);
        }
    }

    pub(crate) fn forget_completed(&self, key: &FlowKey) {
        self.completed.remove(key);
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Forget completed flows with no traffic for longer than `max_idle`.
    pub fn expire_completed(&self, max_idle: Duration, now: SystemTime) -> usize {
        let now_us = epoch_micros(now);
        let max_idle_us = max_idle.as_micros() as u64;
        let before = self.completed.len();
        self.completed
            .retain(|_, t| now_us.saturating_sub(t.last_seen) <= max_idle_us);
        before - self.completed.len()
    }

    fn snapshot(&self) -> Vec<(FlowKey, Arc<FlowEntry>)> {
        self.flows
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    /// Run `f` on every flow idle for longer than `max_idle`, under that flow's lock.
    /// Flows completed by `f` are removed from the table.
    pub fn for_each_idle_older_than<F>(&self, max_idle: Duration, now: SystemTime, mut f: F) -> usize
    where
        F: FnMut(&FlowKey, &mut FlowState),
    {
        let now_us = epoch_micros(now);
        let max_idle_us = max_idle.as_micros() as u64;
        let mut visited = 0;
        for (key, entry) in self.snapshot() {
            if now_us.saturating_sub(entry.last_activity_micros()) <= max_idle_us {
                continue;
            }
            let mut state = entry.lock();
            if state.is_completed() {
                continue;
            }
            // Activity may have landed while we waited for the lock.
            if now_us.saturating_sub(entry.last_activity_micros()) <= max_idle_us {
                continue;
            }
            f(&key, &mut state);
            visited += 1;
            if state.is_completed() {
                self.remove_entry(&key, entry.id);
            }
        }
        visited
    }

    /// Run `f` on every open flow, then remove the ones it completed.
    pub fn for_each_open<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&FlowKey, &mut FlowState),
    {
        let mut visited = 0;
        for (key, entry) in self.snapshot() {
            let mut state = entry.lock();
            if state.is_completed() {
                continue;
            }
            f(&key, &mut state);
            visited += 1;
            if state.is_completed() {
                self.remove_entry(&key, entry.id);
            }
        }
        visited
    }

    /// Hand the least recently active flow accepted by `eligible` to `on_evict`.
    ///
    /// Candidates are ordered by last activity, then by creation order. `except` and flows whose
    /// lock is currently held elsewhere are skipped. Returns false when nothing could be evicted.
    pub fn evict_least_recent<P, F>(&self, except: Option<&FlowKey>, mut eligible: P, on_evict: F) -> bool
    where
        P: FnMut(&FlowState) -> bool,
        F: FnOnce(&FlowKey, &mut FlowState),
    {
        let mut candidates: Vec<(u64, u64, FlowKey, Arc<FlowEntry>)> = self
            .snapshot()
            .into_iter()
            .filter(|(key, _)| Some(key) != except)
            .map(|(key, entry)| (entry.last_activity_micros(), entry.id, key, entry))
            .collect();
        candidates.sort_unstable_by_key(|(last, id, _, _)| (*last, *id));

        for (_, id, key, entry) in candidates {
            let Some(mut state) = entry.try_lock() else {
                continue;
            };
            if state.is_completed() || !eligible(&state) {
                continue;
            }
            debug!(flow = %key, id, "evicting least recently active flow");
            on_evict(&key, &mut state);
            if state.is_completed() {
                self.remove_entry(&key, id);
            }
            return true;
        }
        false
    }
}
