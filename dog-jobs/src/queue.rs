use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::clock::Clock;
use crate::types::{JobId, JobPriority};

/// Ephemeral queue entry; everything here can be rebuilt from the stored record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub id: JobId,
    pub queue_name: String,
    pub priority: JobPriority,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: Reverse<JobPriority>,
    scheduled_at: DateTime<Utc>,
    seq: u64,
    job: JobRef,
}

impl QueueEntry {
    fn key(&self) -> (Reverse<JobPriority>, DateTime<Utc>, u64) {
        (self.priority, self.scheduled_at, self.seq)
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, BTreeSet<QueueEntry>>,
    paused: HashSet<String>,
    /// job id -> (queue name, entry) for every queued job
    index: HashMap<JobId, (String, QueueEntry)>,
    next_seq: u64,
}

/// Named priority queues of due-or-future job references
///
/// Within a queue, `pop` returns the highest priority entry whose
/// `scheduled_at` has passed, breaking ties by earliest `scheduled_at` and
/// then insertion order.
pub struct PriorityQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
}

impl PriorityQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
        }
    }

    /// Add a reference. Returns `false` (and changes nothing) if the job is
    /// already queued. Pushing to a paused queue is allowed.
    pub fn push(&self, job: JobRef) -> bool {
        let mut state = self.state.lock();
        if state.index.contains_key(&job.id) {
            return false;
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let entry = QueueEntry {
            priority: Reverse(job.priority),
            scheduled_at: job.scheduled_at,
            seq,
            job,
        };

        state
            .index
            .insert(entry.job.id.clone(), (entry.job.queue_name.clone(), entry.clone()));
        state
            .queues
            .entry(entry.job.queue_name.clone())
            .or_default()
            .insert(entry);
        true
    }

    /// Next due reference for `queue_name`, or `None` when the queue is empty,
    /// paused, or holds only future entries
    pub fn pop(&self, queue_name: &str) -> Option<JobRef> {
        self.pop_due(queue_name, self.clock.now())
    }

    /// `pop` against an explicit instant
    pub fn pop_due(&self, queue_name: &str, now: DateTime<Utc>) -> Option<JobRef> {
        let mut state = self.state.lock();
        if state.paused.contains(queue_name) {
            return None;
        }

        let entries = state.queues.get_mut(queue_name)?;
        let due = entries.iter().find(|entry| entry.scheduled_at <= now)?.clone();
        entries.remove(&due);
        state.index.remove(&due.job.id);
        Some(due.job)
    }

    /// Entries held for `queue_name`, due or not
    pub fn len(&self, queue_name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue_name)
            .map_or(0, BTreeSet::len)
    }

    pub fn is_empty(&self, queue_name: &str) -> bool {
        self.len(queue_name) == 0
    }

    pub fn pause(&self, queue_name: &str) {
        self.state.lock().paused.insert(queue_name.to_string());
    }

    pub fn resume(&self, queue_name: &str) {
        self.state.lock().paused.remove(queue_name);
    }

    pub fn is_paused(&self, queue_name: &str) -> bool {
        self.state.lock().paused.contains(queue_name)
    }

    /// Drop every entry of `queue_name`; returns how many were removed
    pub fn clear(&self, queue_name: &str) -> usize {
        let mut state = self.state.lock();
        let Some(entries) = state.queues.remove(queue_name) else {
            return 0;
        };
        for entry in &entries {
            state.index.remove(&entry.job.id);
        }
        entries.len()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.state.lock().index.contains_key(id)
    }

    /// Remove one job wherever it is queued
    pub fn remove(&self, id: &JobId) -> bool {
        let mut state = self.state.lock();
        let Some((queue_name, entry)) = state.index.remove(id) else {
            return false;
        };
        if let Some(entries) = state.queues.get_mut(&queue_name) {
            entries.remove(&entry);
        }
        true
    }

    /// Every queue that currently holds entries, sorted by name
    pub fn queue_names(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
