//! Scheduler State
//!
//! Process-wide structures shared by the dispatcher, the monitor and the
//! spawned node tasks:
//! - pending queue keyed by `(instance, node)`, enqueue overwrites
//! - active set, at most one context per key
//! - delayed retries waiting on a backoff timer
//! - merge barriers counting arrived predecessors
//! - per-instance cancellation tokens and execution history
//!
//! Every operation takes the lock once and never across an await, so two
//! ticks can never activate the same key.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::{overlay, ExecutionContext, NodeKey};
use crate::monitoring::{ExecutionRecord, ExecutionTimeline};

struct PendingEntry {
    ctx: ExecutionContext,
    /// Failed readiness checks so far
    checks: u32,
    /// In-flight attempt this entry replaced on pause. The entry is not
    /// dispatchable until that attempt is claimed or released.
    displaced: Option<Displaced>,
}

impl PendingEntry {
    fn new(ctx: ExecutionContext) -> Self {
        Self {
            ctx,
            checks: 0,
            displaced: None,
        }
    }

    fn displaced_generation(&self) -> Option<u64> {
        self.displaced.as_ref().map(|d| d.generation)
    }
}

struct Displaced {
    generation: u64,
    started: Instant,
    cancel: CancellationToken,
}

struct ActiveEntry {
    ctx: ExecutionContext,
    generation: u64,
    started: Instant,
    cancel: CancellationToken,
}

struct MergeBarrier {
    expected: usize,
    arrived: Vec<(String, Value)>,
}

#[derive(Default)]
struct SchedulerInner {
    pending: HashMap<NodeKey, PendingEntry>,
    active: HashMap<NodeKey, ActiveEntry>,
    delayed: HashMap<NodeKey, u64>,
    barriers: HashMap<NodeKey, MergeBarrier>,
    tokens: HashMap<String, CancellationToken>,
    last_progress: HashMap<String, Instant>,
    history: HashMap<String, ExecutionTimeline>,
    next_generation: u64,
}

impl SchedulerInner {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn touch(&mut self, instance_id: &str) {
        self.last_progress.insert(instance_id.to_string(), Instant::now());
    }

    /// True while some attempt or backoff of the instance can still finish.
    fn has_work_in_flight(&self, instance_id: &str) -> bool {
        self.active.keys().any(|(i, _)| i == instance_id)
            || self.delayed.keys().any(|(i, _)| i == instance_id)
            || self
                .pending
                .iter()
                .any(|((i, _), p)| i == instance_id && p.displaced.is_some())
    }
}

/// A running context as seen by the monitor.
#[derive(Debug, Clone)]
pub struct ActiveInfo {
    pub key: NodeKey,
    pub generation: u64,
    pub elapsed: Duration,
    pub timeout: Option<Duration>,
}

/// What is in flight for one instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceActivity {
    pub pending: Vec<ExecutionContext>,
    pub active: Vec<String>,
    pub delayed: Vec<String>,
    /// Nodes whose attempt is still running after a pause requeued them
    pub displaced: Vec<String>,
    /// Merge nodes with some but not all predecessors arrived
    pub waiting_merges: Vec<String>,
}

impl InstanceActivity {
    pub fn is_busy(&self) -> bool {
        !self.active.is_empty() || !self.delayed.is_empty() || !self.displaced.is_empty()
    }
}

/// Work removed from the scheduler when an instance stops.
#[derive(Debug, Default)]
pub struct Dropped {
    pub pending: usize,
    pub active: Vec<String>,
}

#[derive(Default)]
pub struct Scheduler {
    inner: Mutex<SchedulerInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a context, replacing any pending one for the same key.
    pub fn enqueue(&self, ctx: ExecutionContext) {
        self.lock().pending.insert(ctx.key(), PendingEntry::new(ctx));
    }

    /// Pending contexts that can be dispatched: not active and not waiting
    /// on a displaced attempt.
    pub fn pending_snapshot(&self) -> Vec<ExecutionContext> {
        let inner = self.lock();
        inner
            .pending
            .iter()
            .filter(|(key, entry)| entry.displaced.is_none() && !inner.active.contains_key(*key))
            .map(|(_, entry)| entry.ctx.clone())
            .collect()
    }

    /// Records a failed readiness check and returns the running count.
    ///
    /// The count restarts while the instance has running, displaced or
    /// delayed work, since that work may still satisfy the dependency.
    pub fn note_not_ready(&self, key: &NodeKey) -> u32 {
        let mut inner = self.lock();
        let in_flight = inner.has_work_in_flight(&key.0);
        match inner.pending.get_mut(key) {
            Some(entry) => {
                entry.checks = if in_flight { 0 } else { entry.checks + 1 };
                entry.checks
            }
            None => 0,
        }
    }

    /// Moves a pending context into the active set.
    ///
    /// Returns `None` if the key is not pending, already active, still
    /// running a displaced attempt, or the engine-wide cap is reached. The
    /// returned generation identifies this attempt when its result comes
    /// back.
    pub fn activate(&self, key: &NodeKey, max_active: usize) -> Option<(ExecutionContext, u64, CancellationToken)> {
        let mut inner = self.lock();
        if inner.active.len() >= max_active || inner.active.contains_key(key) {
            return None;
        }
        if inner.pending.get(key)?.displaced.is_some() {
            return None;
        }
        let mut entry = inner.pending.remove(key)?;
        entry.ctx.restart_clock();

        let generation = inner.generation();
        let cancel = inner
            .tokens
            .entry(key.0.clone())
            .or_default()
            .child_token();

        inner.active.insert(
            key.clone(),
            ActiveEntry {
                ctx: entry.ctx.clone(),
                generation,
                started: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        inner.touch(&key.0);
        Some((entry.ctx, generation, cancel))
    }

    /// True while `generation` is the live attempt for `key`.
    pub fn is_current(&self, key: &NodeKey, generation: u64) -> bool {
        let inner = self.lock();
        inner
            .active
            .get(key)
            .map(|a| a.generation == generation)
            .unwrap_or(false)
    }

    /// Claims the result of an attempt.
    ///
    /// Succeeds if the attempt is still active, or if it was displaced to
    /// the pending queue by a pause (the pending copy is then dropped).
    pub fn finish(&self, key: &NodeKey, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.active.get(key).map(|a| a.generation) == Some(generation) {
            inner.active.remove(key);
            inner.touch(&key.0);
            return true;
        }
        if inner.pending.get(key).and_then(PendingEntry::displaced_generation) == Some(generation) {
            inner.pending.remove(key);
            inner.touch(&key.0);
            return true;
        }
        false
    }

    /// Returns an attempt that produced no result to the pending queue.
    ///
    /// A displaced attempt only releases its pending copy for dispatch.
    pub fn deactivate(&self, key: &NodeKey, generation: u64) {
        let mut inner = self.lock();
        if inner.active.get(key).map(|a| a.generation) == Some(generation) {
            if let Some(entry) = inner.active.remove(key) {
                inner.pending.insert(key.clone(), PendingEntry::new(entry.ctx));
            }
            return;
        }
        if let Some(entry) = inner.pending.get_mut(key) {
            if entry.displaced_generation() == Some(generation) {
                entry.displaced = None;
                entry.checks = 0;
            }
        }
    }

    /// Moves every active context of an instance back to pending.
    ///
    /// In-flight work keeps running; its result can still be claimed
    /// through [`Scheduler::finish`].
    pub fn requeue_active(&self, instance_id: &str) -> Vec<String> {
        let mut inner = self.lock();
        let keys: Vec<NodeKey> = inner
            .active
            .keys()
            .filter(|(i, _)| i == instance_id)
            .cloned()
            .collect();

        let mut moved = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = inner.active.remove(&key) {
                moved.push(key.1.clone());
                inner.pending.insert(
                    key,
                    PendingEntry {
                        ctx: entry.ctx,
                        checks: 0,
                        displaced: Some(Displaced {
                            generation: entry.generation,
                            started: entry.started,
                            cancel: entry.cancel,
                        }),
                    },
                );
            }
        }
        moved
    }

    /// Removes an expired attempt, active or displaced, and cancels it.
    pub fn expire(&self, key: &NodeKey, generation: u64) -> Option<ExecutionContext> {
        let mut inner = self.lock();
        if inner.active.get(key).map(|a| a.generation) == Some(generation) {
            let entry = inner.active.remove(key)?;
            entry.cancel.cancel();
            return Some(entry.ctx);
        }
        if inner.pending.get(key).and_then(PendingEntry::displaced_generation) == Some(generation) {
            let entry = inner.pending.remove(key)?;
            if let Some(displaced) = entry.displaced {
                displaced.cancel.cancel();
            }
            return Some(entry.ctx);
        }
        None
    }

    /// Parks a failed context until its backoff elapses.
    pub fn delay(&self, key: &NodeKey) -> u64 {
        let mut inner = self.lock();
        let generation = inner.generation();
        inner.delayed.insert(key.clone(), generation);
        generation
    }

    /// Moves a delayed context into the pending queue if still wanted.
    pub fn release_delayed(&self, ctx: ExecutionContext, generation: u64) -> bool {
        let mut inner = self.lock();
        let key = ctx.key();
        if inner.delayed.get(&key) != Some(&generation) {
            return false;
        }
        inner.delayed.remove(&key);
        inner.pending.insert(key, PendingEntry::new(ctx));
        true
    }

    /// Registers a predecessor arrival at a merge node.
    ///
    /// Returns the combined input exactly once, when the last of the
    /// `expected` predecessors arrives.
    pub fn arrive(&self, merge: &NodeKey, expected: usize, predecessor: &str, forward: Value) -> Option<Value> {
        let mut inner = self.lock();
        let barrier = inner
            .barriers
            .entry(merge.clone())
            .or_insert_with(|| MergeBarrier {
                expected,
                arrived: Vec::new(),
            });

        match barrier.arrived.iter_mut().find(|(p, _)| p == predecessor) {
            Some(slot) => slot.1 = forward,
            None => barrier.arrived.push((predecessor.to_string(), forward)),
        }

        if barrier.arrived.len() < barrier.expected {
            return None;
        }

        let barrier = inner.barriers.remove(merge)?;
        let combined = barrier
            .arrived
            .iter()
            .fold(Value::Null, |acc, (_, v)| overlay(&acc, v));
        Some(combined)
    }

    /// Drops all queued, delayed and active work of an instance and cancels
    /// its token. Barriers are kept only when `keep_barriers` is set.
    pub fn drop_instance(&self, instance_id: &str, keep_barriers: bool) -> Dropped {
        let mut inner = self.lock();
        let mut active = Vec::new();
        let before = inner.pending.len();
        inner.pending.retain(|(i, node), entry| {
            if i != instance_id {
                return true;
            }
            if let Some(displaced) = &entry.displaced {
                displaced.cancel.cancel();
                active.push(node.clone());
            }
            false
        });
        let pending = before - inner.pending.len() - active.len();

        inner.delayed.retain(|(i, _), _| i != instance_id);
        if !keep_barriers {
            inner.barriers.retain(|(i, _), _| i != instance_id);
        }

        let keys: Vec<NodeKey> = inner
            .active
            .keys()
            .filter(|(i, _)| i == instance_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(entry) = inner.active.remove(&key) {
                entry.cancel.cancel();
                active.push(key.1);
            }
        }

        if let Some(token) = inner.tokens.remove(instance_id) {
            token.cancel();
        }
        inner.last_progress.remove(instance_id);

        Dropped { pending, active }
    }

    /// Token cancelled when the instance stops.
    pub fn instance_token(&self, instance_id: &str) -> CancellationToken {
        self.lock()
            .tokens
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }

    pub fn activity(&self, instance_id: &str) -> InstanceActivity {
        let inner = self.lock();
        let mut activity = InstanceActivity::default();

        for ((i, node), entry) in &inner.pending {
            if i != instance_id {
                continue;
            }
            if entry.displaced.is_some() {
                activity.displaced.push(node.clone());
            } else {
                activity.pending.push(entry.ctx.clone());
            }
        }
        for (i, node) in inner.active.keys() {
            if i == instance_id {
                activity.active.push(node.clone());
            }
        }
        for (i, node) in inner.delayed.keys() {
            if i == instance_id {
                activity.delayed.push(node.clone());
            }
        }
        for ((i, node), barrier) in &inner.barriers {
            if i == instance_id && !barrier.arrived.is_empty() {
                activity.waiting_merges.push(node.clone());
            }
        }

        activity.active.sort();
        activity
    }

    /// Attempts still running, including those displaced by a pause.
    pub fn active_entries(&self) -> Vec<ActiveInfo> {
        let inner = self.lock();
        let active = inner.active.iter().map(|(key, entry)| ActiveInfo {
            key: key.clone(),
            generation: entry.generation,
            elapsed: entry.started.elapsed(),
            timeout: entry.ctx.timeout,
        });
        let displaced = inner.pending.iter().filter_map(|(key, entry)| {
            entry.displaced.as_ref().map(|d| ActiveInfo {
                key: key.clone(),
                generation: d.generation,
                elapsed: d.started.elapsed(),
                timeout: entry.ctx.timeout,
            })
        });
        active.chain(displaced).collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Time since a node of the instance last started or finished.
    pub fn idle_for(&self, instance_id: &str) -> Option<Duration> {
        self.lock()
            .last_progress
            .get(instance_id)
            .map(|t| t.elapsed())
    }

    pub fn mark_progress(&self, instance_id: &str) {
        self.lock().touch(instance_id);
    }

    pub fn record(&self, instance_id: &str, record: ExecutionRecord) {
        self.lock()
            .history
            .entry(instance_id.to_string())
            .or_default()
            .record(record);
    }

    pub fn history(&self, instance_id: &str) -> ExecutionTimeline {
        self.lock()
            .history
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }
}
