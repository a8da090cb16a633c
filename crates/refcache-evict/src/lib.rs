// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! TTL-driven eviction for the refcache normalized store.
//!
//! The writer reports every committed entity that carries a TTL marker
//! through [`refcache_core::EvictionHook`]. [`EvictionScheduler`] turns those
//! reports into deferred jobs on a [`JobQueue`], keeping at most one job per
//! entity in the common case:
//!
//! - no job yet: add one at the marker time;
//! - a job exists: move it to the marker time in place;
//! - the move fails: add a fallback job shortly in the future;
//! - the marker is `null`: remove the job.
//!
//! Scheduling is best effort. Nothing here can fail a write.
//!
//! [`MemoryJobQueue`] is the in-process queue. Its tick loop runs due jobs and
//! fires a drained signal once the queue empties, which
//! [`EvictionScheduler::install`] wires to a store GC sweep.
#![forbid(unsafe_code)]

mod adapter;
mod clock;
mod queue;

pub use adapter::EvictionScheduler;
pub use clock::{Clock, ManualClock, SystemClock};
pub use queue::{tick_interval, MemoryJobQueue};

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Job kind used for entity eviction.
pub const EVICT_JOB_KIND: &str = "refcache.evict";

/// Queue-assigned job identifier.
pub type JobId = u64;

/// What an eviction job acts on, and when.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Entity to remove.
    pub entity_id: String,
    /// Absolute execution time, Unix milliseconds.
    pub execute_at: u64,
}

/// A pending job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Queue-assigned id.
    pub id: JobId,
    /// Handler selector.
    pub kind: String,
    /// Job data.
    pub payload: JobPayload,
}

/// Runs one job.
pub type JobHandler = Arc<dyn Fn(&Job) + Send + Sync>;

/// Receives each batch of executed jobs.
pub type CompletionCallback = Arc<dyn Fn(&[Job]) + Send + Sync>;

/// Fired when a tick leaves the queue empty.
pub type DrainedCallback = Arc<dyn Fn() + Send + Sync>;

/// Errors reported by a [`JobQueue`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue no longer accepts work.
    #[error("[QUEUE_CLOSED] job queue is closed")]
    Closed,
    /// No job has the given id.
    #[error("[QUEUE_UNKNOWN_JOB] no job with id {0}")]
    UnknownJob(JobId),
    /// Backend-specific failure.
    #[error("[QUEUE_BACKEND] {0}")]
    Backend(String),
}

/// Deferred-job scheduler consumed by [`EvictionScheduler`].
///
/// Async operations must return `Send` futures so they can run on the
/// adapter's worker task.
pub trait JobQueue: Send + Sync + 'static {
    /// Schedule a job. Returns its id.
    fn add_job(
        &self,
        kind: &str,
        payload: JobPayload,
    ) -> impl Future<Output = Result<JobId, QueueError>> + Send;

    /// Every pending job, in id order.
    fn list_jobs(&self) -> impl Future<Output = Result<Vec<Job>, QueueError>> + Send;

    /// Move `job` to `job.payload.execute_at`. Returns `false` if the queue
    /// declined (for example because the job already ran).
    fn update_job_execution_time(
        &self,
        job: &Job,
    ) -> impl Future<Output = Result<bool, QueueError>> + Send;

    /// Drop a pending job. Returns `false` if it was not pending.
    fn remove_job(&self, id: JobId) -> impl Future<Output = Result<bool, QueueError>> + Send;

    /// Register the handler for jobs of `kind`, replacing any previous one.
    fn register_handler(&self, kind: &str, handler: JobHandler);

    /// Register a callback receiving each batch of executed jobs.
    fn on_complete(&self, callback: CompletionCallback);

    /// Register a callback fired whenever a tick drains the queue.
    fn on_drained(&self, callback: DrainedCallback);
}
