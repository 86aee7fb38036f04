//! Side-effect completion tracking.
//!
//! Every committed action gets a sequence number. Each registered side effect
//! has an entry recording the highest sequence it has fully consumed, meaning
//! its input stream was polled and had nothing further to deliver. Waiters ask
//! "have all effects (of this batch) consumed everything up to `target`?".
//!
//! An effect whose stream ends, panics or is unregistered is removed, so it
//! never holds a waiter back.
//!
//! # Edge cases
//!
//! - `Notify` is edge-triggered, so waiters register for notification before
//!   checking and loop on wake-up.
//! - With no registered effects every wait resolves immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::{Result, StoreError};

/// Progress of one registered side effect.
#[derive(Debug)]
struct EffectEntry {
    batch: u64,
    name: String,
    consumed: AtomicU64,
}

/// Tracks how far each registered side effect has consumed the action stream.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    entries: DashMap<u64, Arc<EffectEntry>>,
    published: AtomicU64,
    next_entry: AtomicU64,
    next_batch: AtomicU64,
    notify: Notify,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a group of effects registered together.
    pub(crate) fn next_batch(&self) -> u64 {
        self.next_batch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Start tracking an effect. Everything published so far counts as
    /// consumed, so the caller must subscribe to the action stream first.
    pub(crate) fn register(&self, batch: u64, name: &str) -> u64 {
        let id = self.next_entry.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = EffectEntry {
            batch,
            name: name.to_string(),
            consumed: AtomicU64::new(self.published.load(Ordering::Acquire)),
        };
        self.entries.insert(id, Arc::new(entry));
        id
    }

    /// Record that action `seq` was committed.
    pub(crate) fn publish(&self, seq: u64) {
        self.published.fetch_max(seq, Ordering::AcqRel);
    }

    /// Highest committed sequence number.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Record that effect `id` consumed every action up to `seq`.
    pub(crate) fn consumed(&self, id: u64, seq: u64) {
        let advanced = match self.entries.get(&id) {
            Some(entry) => entry.consumed.fetch_max(seq, Ordering::AcqRel) < seq,
            None => false,
        };
        if advanced {
            self.notify.notify_waiters();
        }
    }

    /// Stop tracking effect `id`, releasing anyone waiting on it.
    pub(crate) fn complete(&self, id: u64) {
        if self.entries.remove(&id).is_some() {
            self.notify.notify_waiters();
        }
    }

    fn is_caught_up(&self, target: u64, batch: Option<u64>) -> bool {
        self.entries.iter().all(|entry| {
            batch.is_some_and(|b| entry.batch != b)
                || entry.consumed.load(Ordering::Acquire) >= target
        })
    }

    /// Names of effects that have not consumed up to `target`.
    pub fn lagging(&self, target: u64, batch: Option<u64>) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| batch.map_or(true, |b| entry.batch == b))
            .filter(|entry| entry.consumed.load(Ordering::Acquire) < target)
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of tracked effects.
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Wait until every tracked effect (optionally only those of `batch`) has
    /// consumed every action up to `target`, or fail with `Timeout`.
    pub async fn wait(&self, target: u64, batch: Option<u64>, timeout: Duration) -> Result<()> {
        let caught_up = async {
            loop {
                // Register before checking so a notify in between is not lost.
                let notified = self.notify.notified();
                if self.is_caught_up(target, batch) {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, caught_up)
            .await
            .map_err(|_| StoreError::Timeout { duration: timeout })
    }
}
