// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-process job queue driven by a tokio interval.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use refcache_core::EvictionConfig;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, instrument, warn};

use crate::{
    Clock, CompletionCallback, DrainedCallback, Job, JobHandler, JobId, JobPayload, JobQueue,
    QueueError, SystemClock,
};

/// [`JobQueue`] holding jobs in memory.
///
/// Jobs run from [`run_due`](Self::run_due), either called directly or from
/// the [`run`](Self::run) tick loop. Handlers and callbacks are invoked with
/// no internal lock held, so they may call back into the queue.
pub struct MemoryJobQueue<C: Clock = SystemClock> {
    clock: C,
    state: Mutex<QueueState>,
    handlers: RwLock<HashMap<String, JobHandler>>,
    completed: RwLock<Vec<CompletionCallback>>,
    drained: RwLock<Vec<DrainedCallback>>,
}

#[derive(Default)]
struct QueueState {
    next_id: JobId,
    jobs: BTreeMap<JobId, Job>,
    closed: bool,
}

impl MemoryJobQueue<SystemClock> {
    /// Queue on the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryJobQueue<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryJobQueue<C> {
    /// Queue reading time from `clock`.
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: Mutex::new(QueueState::default()),
            handlers: RwLock::new(HashMap::new()),
            completed: RwLock::new(Vec::new()),
            drained: RwLock::new(Vec::new()),
        }
    }

    /// Number of pending jobs.
    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }

    /// Returns `true` if no job is pending.
    pub fn is_empty(&self) -> bool {
        self.state().jobs.is_empty()
    }

    /// Stop accepting new jobs. Pending jobs still run.
    pub fn close(&self) {
        self.state().closed = true;
    }

    /// Run every job whose time has come. Returns how many ran.
    pub fn run_due(&self) -> usize {
        let now = self.clock.now_ms();
        let (due, empty) = {
            let mut state = self.state();
            let ids: Vec<JobId> = state
                .jobs
                .values()
                .filter(|job| job.payload.execute_at <= now)
                .map(|job| job.id)
                .collect();
            let due: Vec<Job> = ids
                .into_iter()
                .filter_map(|id| state.jobs.remove(&id))
                .collect();
            (due, state.jobs.is_empty())
        };
        if due.is_empty() {
            return 0;
        }

        for job in &due {
            let handler = self
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&job.kind)
                .cloned();
            match handler {
                Some(handler) => handler(job),
                None => warn!(kind = job.kind.as_str(), id = job.id, "no handler for job kind, dropped"),
            }
        }
        debug!(executed = due.len(), "ran due jobs");

        let completed = self
            .completed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for callback in completed {
            callback(&due);
        }
        if empty {
            let drained = self
                .drained
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for callback in drained {
                callback();
            }
        }
        due.len()
    }

    /// Tick forever, running due jobs every `interval`.
    ///
    /// Spawn it and abort the task to stop.
    #[instrument(skip(self))]
    pub async fn run(&self, interval: Duration) {
        let mut ticker = time::interval(interval);
        info!("Job queue started. Tick interval: {:?}", interval);
        loop {
            ticker.tick().await;
            self.run_due();
        }
    }

    /// Spawn [`run`](Self::run) ticking every `config.tick_interval_ms`.
    ///
    /// Abort the returned handle to stop.
    pub fn spawn_ticker(self: &Arc<Self>, config: &EvictionConfig) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let interval = tick_interval(config);
        tokio::spawn(async move { queue.run(interval).await })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tick period for `config`. A zero interval is raised to one millisecond,
/// since `tokio::time::interval` rejects a zero period.
pub fn tick_interval(config: &EvictionConfig) -> Duration {
    Duration::from_millis(config.tick_interval_ms.max(1))
}

impl<C: Clock> JobQueue for MemoryJobQueue<C> {
    async fn add_job(&self, kind: &str, payload: JobPayload) -> Result<JobId, QueueError> {
        let mut state = self.state();
        if state.closed {
            return Err(QueueError::Closed);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(
            id,
            Job {
                id,
                kind: kind.to_owned(),
                payload,
            },
        );
        Ok(id)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.state().jobs.values().cloned().collect())
    }

    async fn update_job_execution_time(&self, job: &Job) -> Result<bool, QueueError> {
        let mut state = self.state();
        Ok(match state.jobs.get_mut(&job.id) {
            Some(pending) => {
                pending.payload.execute_at = job.payload.execute_at;
                true
            }
            None => false,
        })
    }

    async fn remove_job(&self, id: JobId) -> Result<bool, QueueError> {
        Ok(self.state().jobs.remove(&id).is_some())
    }

    fn register_handler(&self, kind: &str, handler: JobHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.to_owned(), handler);
    }

    fn on_complete(&self, callback: CompletionCallback) {
        self.completed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn on_drained(&self, callback: DrainedCallback) {
        self.drained
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn payload(id: &str, at: u64) -> JobPayload {
        JobPayload {
            entity_id: id.into(),
            execute_at: at,
        }
    }

    #[tokio::test]
    async fn only_due_jobs_run_and_callbacks_see_the_batch() {
        let clock = ManualClock::at(100);
        let queue = MemoryJobQueue::with_clock(clock.clone());
        let ran = Arc::new(Mutex::new(Vec::new()));
        let batches = Arc::new(AtomicUsize::new(0));
        let drains = Arc::new(AtomicUsize::new(0));

        let sink = ran.clone();
        queue.register_handler(
            "k",
            Arc::new(move |job: &Job| sink.lock().unwrap().push(job.payload.entity_id.clone())),
        );
        let counter = batches.clone();
        queue.on_complete(Arc::new(move |jobs: &[Job]| {
            counter.fetch_add(jobs.len(), Ordering::SeqCst);
        }));
        let drained = drains.clone();
        queue.on_drained(Arc::new(move || {
            drained.fetch_add(1, Ordering::SeqCst);
        }));

        queue.add_job("k", payload("a", 50)).await.unwrap();
        queue.add_job("k", payload("b", 200)).await.unwrap();

        assert_eq!(queue.run_due(), 1);
        assert_eq!(*ran.lock().unwrap(), vec!["a".to_owned()]);
        assert_eq!(drains.load(Ordering::SeqCst), 0);

        clock.set(200);
        assert_eq!(queue.run_due(), 1);
        assert_eq!(batches.load(Ordering::SeqCst), 2);
        assert_eq!(drains.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.run_due(), 0);
        assert_eq!(drains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn update_and_remove_report_whether_the_job_was_pending() {
        let queue = MemoryJobQueue::with_clock(ManualClock::at(0));
        let id = queue.add_job("k", payload("a", 10)).await.unwrap();
        let mut job = queue.list_jobs().await.unwrap().remove(0);
        job.payload.execute_at = 20;
        assert!(queue.update_job_execution_time(&job).await.unwrap());
        assert_eq!(queue.list_jobs().await.unwrap()[0].payload.execute_at, 20);
        assert!(queue.remove_job(id).await.unwrap());
        assert!(!queue.remove_job(id).await.unwrap());
        assert!(!queue.update_job_execution_time(&job).await.unwrap());
    }

    #[tokio::test]
    async fn jobs_without_handler_are_dropped() {
        let queue = MemoryJobQueue::with_clock(ManualClock::at(5));
        queue.add_job("orphan", payload("a", 1)).await.unwrap();
        assert_eq!(queue.run_due(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn closed_queue_rejects_new_jobs() {
        let queue = MemoryJobQueue::with_clock(ManualClock::at(0));
        queue.close();
        assert_eq!(queue.add_job("k", payload("a", 1)).await, Err(QueueError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_loop_runs_due_jobs() {
        let clock = ManualClock::at(0);
        let queue = Arc::new(MemoryJobQueue::with_clock(clock.clone()));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        queue.register_handler(
            "k",
            Arc::new(move |_: &Job| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        queue.add_job("k", payload("a", 0)).await.unwrap();

        let runner = queue.clone();
        let task = tokio::spawn(async move { runner.run(Duration::from_millis(10)).await });
        tokio::time::sleep(Duration::from_millis(25)).await;
        task.abort();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_follows_configured_interval() {
        let clock = ManualClock::at(0);
        let queue = Arc::new(MemoryJobQueue::with_clock(clock.clone()));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        queue.register_handler(
            "k",
            Arc::new(move |_: &Job| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        queue.add_job("k", payload("a", 100)).await.unwrap();
        let config = EvictionConfig {
            tick_interval_ms: 1_000,
            ..EvictionConfig::default()
        };
        let task = queue.spawn_ticker(&config);

        // First tick is immediate; the job is not due yet.
        tokio::time::sleep(Duration::from_millis(10)).await;
        clock.set(100);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        task.abort();
    }

    #[test]
    fn zero_tick_interval_is_clamped() {
        let config = EvictionConfig {
            tick_interval_ms: 0,
            ..EvictionConfig::default()
        };
        assert_eq!(tick_interval(&config), Duration::from_millis(1));
        assert_eq!(
            tick_interval(&EvictionConfig::default()),
            Duration::from_millis(250)
        );
    }
}
