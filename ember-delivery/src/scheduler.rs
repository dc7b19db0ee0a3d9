//! Delayed job queue
//!
//! Every "run this again later" in the engine goes through here: dispatcher
//! batches, rate-limited sends, retry backoff and scheduled starts. Due times
//! are read from the engine's [`Clock`](ember_common::Clock) rather than a
//! tokio timer, so a manual clock can drive them in tests.
//!
//! A job is identified by its value. Scheduling a job that is already queued
//! keeps whichever due time is earlier; the superseded heap entry is skipped
//! when it surfaces.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap},
    time::Duration,
};

use chrono::{DateTime, Utc};
use ember_store::{AccountId, CampaignId, SendId};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// `now` plus `delay`, saturating at the latest representable instant
#[must_use]
pub fn deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A unit of deferred work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    /// Pull the next batch of pending sends for a campaign
    Dispatch(CampaignId),
    /// Deliver one send through the per-send worker
    SendEmail {
        send_id: SendId,
        campaign_id: CampaignId,
        account_id: AccountId,
    },
    /// Return a failed send to the queue once its backoff has elapsed
    Retry(SendId),
    /// Start a scheduled campaign
    StartScheduled(CampaignId),
    /// Create the send rows for a large campaign
    Materialize(CampaignId),
}

impl Job {
    /// Short name for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Dispatch(_) => "dispatch",
            Self::SendEmail { .. } => "send_email",
            Self::Retry(_) => "retry",
            Self::StartScheduled(_) => "start_scheduled",
            Self::Materialize(_) => "materialize",
        }
    }
}

#[derive(Debug)]
struct Entry {
    due: DateTime<Utc>,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

#[derive(Debug, Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Entry>>,
    due: HashMap<Job, DateTime<Utc>>,
    seq: u64,
}

impl Queue {
    /// Drop heap entries that were superseded by an earlier reschedule
    fn prune(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.due.get(&top.job) == Some(&top.due) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Delayed job queue keyed on wall-clock time
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: Mutex<Queue>,
    notify: Notify,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `job` to run at `at`.
    ///
    /// Returns `false` if the same job was already queued for an earlier (or
    /// the same) time, in which case nothing changes.
    pub fn schedule_at(&self, job: Job, at: DateTime<Utc>) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.due.get(&job).is_some_and(|existing| *existing <= at) {
                return false;
            }

            queue.seq += 1;
            let seq = queue.seq;
            queue.due.insert(job, at);
            queue.heap.push(Reverse(Entry { due: at, seq, job }));
        }

        self.notify.notify_one();
        true
    }

    /// Queue `job` to run `delay` after `now`
    pub fn schedule_in(&self, job: Job, now: DateTime<Utc>, delay: Duration) -> bool {
        self.schedule_at(job, deadline(now, delay))
    }

    /// Remove and return every job due at or before `now`, earliest first
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut queue = self.queue.lock();
        let mut jobs = Vec::new();

        loop {
            queue.prune();
            let Some(Reverse(top)) = queue.heap.peek() else {
                break;
            };
            if top.due > now {
                break;
            }

            if let Some(Reverse(entry)) = queue.heap.pop() {
                queue.due.remove(&entry.job);
                jobs.push(entry.job);
            }
        }

        jobs
    }

    /// When the earliest queued job is due
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut queue = self.queue.lock();
        queue.prune();
        queue.heap.peek().map(|Reverse(entry)| entry.due)
    }

    /// When `job` is due, if it is queued
    #[must_use]
    pub fn scheduled_at(&self, job: &Job) -> Option<DateTime<Utc>> {
        self.queue.lock().due.get(job).copied()
    }

    /// Wait until something new is scheduled
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Number of distinct queued jobs
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().due.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
