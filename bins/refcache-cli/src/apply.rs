// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! One write against a fresh store, with eviction wired to a manual clock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use refcache_core::{
    CacheConfig, EvictionHook, MemoryStore, NormalizedStore, PolicyConfig, QueryDocument,
    Reference, StoreObject, StoreWriter, TypePolicies, Variables, WriteRequest,
};
use refcache_evict::{
    Clock, EvictionScheduler, Job, JobPayload, JobQueue, ManualClock, MemoryJobQueue, SystemClock,
    EVICT_JOB_KIND,
};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

/// Everything a single `write` invocation needs.
#[derive(Debug)]
pub struct WriteInputs {
    pub query: QueryDocument,
    pub result: Value,
    pub variables: Option<Variables>,
    pub policies: PolicyConfig,
    pub config: CacheConfig,
    pub data_id: Option<String>,
    pub advance_ms: Option<u64>,
}

/// What the CLI prints.
#[derive(Debug, Serialize)]
pub struct WriteReport {
    pub root: Option<Reference>,
    pub records: BTreeMap<String, StoreObject>,
    pub pending_evictions: Vec<JobPayload>,
    pub evicted: usize,
}

pub async fn apply(inputs: WriteInputs) -> Result<WriteReport> {
    apply_at(inputs, ManualClock::at(SystemClock.now_ms())).await
}

async fn apply_at(inputs: WriteInputs, clock: ManualClock) -> Result<WriteReport> {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryJobQueue::with_clock(clock.clone()));
    let scheduler = Arc::new(EvictionScheduler::spawn(
        Arc::clone(&queue),
        clock.clone(),
        &inputs.config.eviction,
    ));
    EvictionScheduler::install(queue.as_ref(), Arc::clone(&store) as Arc<dyn NormalizedStore>);
    let evicted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&evicted);
    queue.on_complete(Arc::new(move |jobs: &[Job]| {
        let n = jobs.iter().filter(|job| job.kind == EVICT_JOB_KIND).count();
        counter.fetch_add(n, Ordering::SeqCst);
    }));

    let policy = Arc::new(TypePolicies::from_config(&inputs.policies));
    let hook: Arc<dyn EvictionHook> = Arc::clone(&scheduler) as Arc<dyn EvictionHook>;
    let writer = StoreWriter::new(policy, inputs.config.clone()).with_eviction_hook(hook);

    let mut request = match inputs.data_id.as_deref() {
        Some(id) => WriteRequest::new(&inputs.query, &inputs.result).with_data_id(id),
        None => WriteRequest::rooted(&inputs.query, &inputs.result),
    };
    if let Some(variables) = &inputs.variables {
        request = request.with_variables(variables);
    }
    let root = writer.write(store.as_ref(), request)?;
    scheduler.settle().await;
    let ticker = queue.spawn_ticker(&inputs.config.eviction);

    if let Some(delta) = inputs.advance_ms {
        clock.advance(delta);
    }
    // The ticker only stops between batches, so no job is left half-run.
    ticker.abort();
    let _ = ticker.await;
    queue.run_due();
    if let Some(delta) = inputs.advance_ms {
        info!(delta, evicted = evicted.load(Ordering::SeqCst), "clock advanced");
    }

    let pending_evictions = queue
        .list_jobs()
        .await?
        .into_iter()
        .map(|job| job.payload)
        .collect();
    Ok(WriteReport {
        root,
        records: store.snapshot(),
        pending_evictions,
        evicted: evicted.load(Ordering::SeqCst),
    })
}
