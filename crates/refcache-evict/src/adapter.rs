// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bridge from the writer's [`EvictionHook`] to a [`JobQueue`].
//!
//! The hook runs inside a synchronous write and must not block, so it only
//! enqueues a command. A single worker task drains the commands in order,
//! which keeps reconciliation for one entity in write order.

use std::sync::Arc;

use refcache_core::{EvictionConfig, EvictionHook, NormalizedStore, StoreValue};
use serde_json::Number;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::{Clock, Job, JobPayload, JobQueue, QueueError, EVICT_JOB_KIND};

enum Command {
    /// `None` cancels any pending eviction.
    Reconcile {
        entity_id: String,
        execute_at: Option<u64>,
    },
    Settle(oneshot::Sender<()>),
}

/// Schedules, moves, and cancels eviction jobs from TTL markers.
#[derive(Debug)]
pub struct EvictionScheduler {
    commands: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

impl EvictionScheduler {
    /// Start the worker task on the current tokio runtime.
    pub fn spawn<Q, C>(queue: Arc<Q>, clock: C, config: &EvictionConfig) -> Self
    where
        Q: JobQueue,
        C: Clock,
    {
        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(queue, clock, config.fallback_delay_ms, receiver));
        Self { commands, worker }
    }

    /// Register the eviction handler and the drained GC sweep on `queue`.
    pub fn install<Q: JobQueue>(queue: &Q, store: Arc<dyn NormalizedStore>) {
        let evicting = Arc::clone(&store);
        queue.register_handler(
            EVICT_JOB_KIND,
            Arc::new(move |job: &Job| {
                let existed = evicting.evict(&job.payload.entity_id);
                debug!(entity = job.payload.entity_id.as_str(), existed, "entity evicted");
            }),
        );
        queue.on_drained(Arc::new(move || {
            let removed = store.gc();
            debug!(removed = removed.len(), "queue drained, store collected");
        }));
    }

    /// Wait until every marker reported so far has been reconciled.
    pub async fn settle(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Settle(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Returns `true` once the worker has stopped.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    fn send(&self, entity_id: &str, execute_at: Option<u64>) {
        let command = Command::Reconcile {
            entity_id: entity_id.to_owned(),
            execute_at,
        };
        if self.commands.send(command).is_err() {
            warn!(entity = entity_id, "eviction worker gone, marker dropped");
        }
    }
}

impl EvictionHook for EvictionScheduler {
    fn entity_written(&self, id: &str, marker: &StoreValue) {
        match marker {
            StoreValue::Null => self.send(id, None),
            StoreValue::Number(n) => match millis(n) {
                Some(at) => self.send(id, Some(at)),
                None => warn!(entity = id, marker = %n, "TTL marker is not a valid timestamp"),
            },
            _ => warn!(entity = id, "TTL marker is not a number, ignored"),
        }
    }
}

/// Float markers saturate into `u64`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn millis(n: &Number) -> Option<u64> {
    n.as_u64().or_else(|| {
        n.as_f64()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f as u64)
    })
}

#[instrument(level = "debug", skip_all)]
async fn run_worker<Q: JobQueue, C: Clock>(
    queue: Arc<Q>,
    clock: C,
    fallback_delay_ms: u64,
    mut receiver: mpsc::UnboundedReceiver<Command>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            Command::Reconcile {
                entity_id,
                execute_at,
            } => {
                let fallback_at = clock.now_ms().saturating_add(fallback_delay_ms);
                if let Err(err) =
                    reconcile(queue.as_ref(), &entity_id, execute_at, fallback_at).await
                {
                    warn!(entity = entity_id.as_str(), error = %err, "eviction scheduling failed");
                }
            }
            Command::Settle(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("eviction worker stopped");
}

async fn reconcile<Q: JobQueue>(
    queue: &Q,
    entity_id: &str,
    execute_at: Option<u64>,
    fallback_at: u64,
) -> Result<(), QueueError> {
    let pending = queue
        .list_jobs()
        .await?
        .into_iter()
        .find(|job| job.kind == EVICT_JOB_KIND && job.payload.entity_id == entity_id);

    match (pending, execute_at) {
        (None, None) => Ok(()),
        (Some(job), None) => {
            queue.remove_job(job.id).await?;
            debug!(entity = entity_id, job = job.id, "eviction cancelled");
            Ok(())
        }
        (None, Some(at)) => {
            let job = queue.add_job(EVICT_JOB_KIND, payload(entity_id, at)).await?;
            debug!(entity = entity_id, job, at, "eviction scheduled");
            Ok(())
        }
        (Some(job), Some(at)) if job.payload.execute_at == at => Ok(()),
        (Some(mut job), Some(at)) => {
            job.payload.execute_at = at;
            let moved = queue.update_job_execution_time(&job).await;
            match moved {
                Ok(true) => {
                    debug!(entity = entity_id, job = job.id, at, "eviction moved");
                    Ok(())
                }
                Ok(false) | Err(_) => {
                    warn!(entity = entity_id, job = job.id, "eviction update refused, scheduling fallback");
                    queue
                        .add_job(EVICT_JOB_KIND, payload(entity_id, fallback_at))
                        .await?;
                    Ok(())
                }
            }
        }
    }
}

fn payload(entity_id: &str, execute_at: u64) -> JobPayload {
    JobPayload {
        entity_id: entity_id.to_owned(),
        execute_at,
    }
}
