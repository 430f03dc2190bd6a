// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! mc-runtime: the MongoClaw streaming pipeline.
//!
//! Wires the watcher, dispatcher, durable queue, worker pool, and
//! resilience fabric over the adapter traits. The flow is
//! `watcher → dispatcher → queue → worker → model → write engine`, with
//! execution records persisted at each boundary and metrics throughout.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod parse;
pub mod queue;
pub mod resilience;
mod shared;
pub mod watcher;
pub mod worker;
pub mod write;

pub use cache::{AgentCache, AgentSnapshot, CachedAgent};
pub use config::{BreakerConfig, RuntimeConfig};
pub use error::RuntimeError;
pub use queue::{dlq_name, stream_name, DlqEntry, QueueClient, GROUP};
pub use resilience::BreakerState;
pub use watcher::ResumeTracker;

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ledger::ExecutionLedger;
use crate::resilience::{BreakerRegistry, CostRegistry, Quarantine, RateRegistry, SloTracker};
use crate::shared::{RecentKeys, Shared};
use mc_adapters::{AgentStore, DocumentStore, KeyValueStream, MetricsSink, ModelClient};
use mc_core::{AgentId, Clock, Trigger, WorkItem, WorkItemId};

/// Per-agent view for `status()`.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub id: AgentId,
    pub enabled: bool,
    /// Stream length, including already-acknowledged history up to the
    /// trim caps
    pub queue_depth: u64,
    /// Delivered but unacknowledged items
    pub queue_pending: u64,
    pub dlq_depth: u64,
    pub breaker_state: BreakerState,
    pub quarantined: bool,
    pub last_execution_at_ms: Option<u64>,
}

/// The assembled pipeline.
///
/// `start` spawns every long-running task; `drain` stops them gracefully.
pub struct Runtime<D, S, M, A, C: Clock> {
    pub(crate) shared: Arc<Shared<D, S, M, A, C>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D, S, M, A, C> Runtime<D, S, M, A, C>
where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    /// Build and start the pipeline: load the agent cache, seed resume
    /// tokens from the control store, then spawn the watcher set,
    /// dispatcher, workers, and support loops.
    pub async fn start(
        config: RuntimeConfig,
        docs: Arc<D>,
        kv: Arc<S>,
        model: Arc<M>,
        agents: Arc<A>,
        metrics: Arc<dyn MetricsSink>,
        clock: C,
    ) -> Result<Self, RuntimeError> {
        let cache = cache::AgentCache::new();
        let specs = agents.list_all().await?;
        tracing::info!(agents = specs.len(), "loading agent definitions");
        cache.install(AgentSnapshot::build(specs));

        let tracker = ResumeTracker::new();
        for ns in cache.snapshot().watched_namespaces() {
            let stored = docs
                .find(&config.control_db, &config.resume_tokens_collection, &ns.to_string())
                .await?;
            let token =
                stored.and_then(|doc| doc.get("token").and_then(Value::as_str).map(String::from));
            if token.is_some() {
                tracing::info!(namespace = %ns, "resuming from stored token");
            }
            tracker.seed(&ns, token);
        }

        let (handoff_tx, handoff_rx) = mpsc::channel(config.handoff_depth);
        let (shutdown_tx, _) = watch::channel(false);
        let queue = QueueClient::new(
            Arc::clone(&kv),
            clock.clone(),
            config.stream_max_len,
            config.dlq_max_len,
        );
        let ledger = ExecutionLedger::new(
            Arc::clone(&docs),
            config.control_db.clone(),
            config.executions_collection.clone(),
        );
        let shared = Arc::new(Shared {
            breakers: BreakerRegistry::new(config.breaker.clone(), clock.clone()),
            rate: RateRegistry::new(clock.clone()),
            cost: CostRegistry::new(clock.clone()),
            quarantine: Quarantine::new(config.quarantine_threshold),
            slo: SloTracker::new(config.slo_target, config.slo_sustain, clock.clone()),
            recent_keys: RecentKeys::new(10_000),
            config,
            docs,
            model,
            agents,
            metrics,
            clock,
            cache,
            tracker,
            queue,
            kv,
            ledger,
            handoff: handoff_tx,
            shutdown: shutdown_tx,
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_cache_refresher(Arc::clone(&shared))));
        tasks.push(tokio::spawn(watcher::run_reconciler(Arc::clone(&shared))));
        tasks.push(tokio::spawn(watcher::run_token_flusher(Arc::clone(&shared))));
        tasks.push(tokio::spawn(dispatch::run_dispatcher(Arc::clone(&shared), handoff_rx)));
        tasks.push(tokio::spawn(run_metrics_pump(Arc::clone(&shared))));
        for i in 0..shared.config.worker_count {
            let name = format!("worker-{i}");
            tasks.push(tokio::spawn(worker::run_worker(Arc::clone(&shared), name)));
        }

        Ok(Self { shared, tasks: Mutex::new(tasks) })
    }

    /// Enqueue a document for one agent, bypassing the watcher (webhook
    /// path). The attempt counter starts at 1.
    pub async fn enqueue_manual(
        &self,
        agent_id: &str,
        document: Value,
    ) -> Result<WorkItemId, RuntimeError> {
        let snapshot = self.shared.cache.snapshot();
        let id = AgentId::from_store(agent_id);
        let agent = snapshot
            .get(&id)
            .ok_or_else(|| RuntimeError::UnknownAgent(agent_id.to_string()))?;
        if let Some(error) = &agent.config_error {
            return Err(RuntimeError::Misconfigured(agent_id.to_string(), error.clone()));
        }
        let document_id = document
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| RuntimeError::InvalidDocument("document is missing _id".to_string()))?
            .to_string();

        let now_ms = self.shared.clock.epoch_ms();
        let spec = &agent.spec;
        let context = dispatch::render_context(
            &document,
            &document_id,
            spec,
            mc_core::ChangeOperation::Update,
            now_ms,
        );
        let key = agent
            .idempotency_key
            .as_ref()
            .ok_or_else(|| {
                RuntimeError::Misconfigured(agent_id.to_string(), "idempotency template".into())
            })?
            .render(&context)?;

        let item = WorkItem {
            work_id: WorkItemId::new(),
            agent_id: spec.id.clone(),
            agent_revision: spec.revision,
            document_id,
            document,
            operation: mc_core::ChangeOperation::Update,
            enqueued_at_ms: now_ms,
            attempt: 1,
            trigger: Trigger::Webhook,
            idempotency_key: key,
            not_before_ms: 0,
        };
        self.shared.queue.produce(&item).await?;
        Ok(item.work_id)
    }

    /// Per-agent operational status.
    pub async fn status(&self) -> Vec<AgentStatus> {
        let snapshot = self.shared.cache.snapshot();
        let mut statuses = Vec::new();
        for agent in snapshot.all_agents() {
            let id = agent.spec.id.clone();
            let (queue_depth, queue_pending) =
                self.shared.queue.depth(&id).await.unwrap_or((0, 0));
            let dlq_depth = self.shared.queue.dlq_depth(&id).await.unwrap_or(0);
            statuses.push(AgentStatus {
                enabled: agent.spec.enabled,
                queue_depth,
                queue_pending,
                dlq_depth,
                breaker_state: self.shared.breakers.agent_state(&id),
                quarantined: self.shared.quarantine.is_active(&id),
                last_execution_at_ms: self.shared.ledger.last_execution_at(id.as_str()),
                id,
            });
        }
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Prometheus-style exposition text, when the configured sink supports
    /// pull (the Prometheus sink does; `NullSink` does not).
    pub fn render_metrics(&self) -> Option<String> {
        self.shared.metrics.render()
    }

    /// Manually release a quarantined agent.
    pub fn release_quarantine(&self, agent_id: &str) -> bool {
        let id = AgentId::from_store(agent_id);
        let released = self.shared.quarantine.release(&id);
        if released {
            self.shared
                .metrics
                .set_gauge("quarantine_active", &[("agent", agent_id)], 0.0);
            tracing::info!(agent = %agent_id, "quarantine released");
        }
        released
    }

    /// Graceful shutdown: watchers stop reading, the dispatcher drains its
    /// handoff, workers finish their current item, then everything stops.
    /// The hard deadline aborts stragglers; their unacknowledged items
    /// replay on restart.
    pub async fn drain(&self) {
        tracing::info!("draining pipeline");
        let _ = self.shared.shutdown.send(true);
        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let deadline = self.shared.config.shutdown_deadline;
        let wait_all = futures_util::future::join_all(tasks.iter_mut());
        if tokio::time::timeout(deadline, wait_all).await.is_err() {
            tracing::warn!("shutdown deadline hit, aborting remaining tasks");
            for task in &tasks {
                task.abort();
            }
        }
        tracing::info!("pipeline drained");
    }
}

/// Rebuild the agent snapshot on store notifications and on a fixed
/// cadence (the ≤ 2 s disable window).
async fn run_cache_refresher<D, S, M, A, C>(shared: Arc<Shared<D, S, M, A, C>>)
where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let mut shutdown = shared.shutdown.subscribe();
    let mut changes = shared.agents.subscribe_changes();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(shared.config.cache_refresh_interval) => {}
            change = changes.recv() => {
                if change.is_none() {
                    return;
                }
                // Coalesce bursts of store notifications
                while changes.try_recv().is_ok() {}
            }
            _ = shutdown.changed() => return,
        }
        match shared.agents.list_all().await {
            Ok(specs) => shared.cache.install(AgentSnapshot::build(specs)),
            Err(e) => tracing::warn!(error = %e, "agent cache refresh failed"),
        }
    }
}

/// Periodically publish queue depths, breaker states, and quarantine
/// gauges.
async fn run_metrics_pump<D, S, M, A, C>(shared: Arc<Shared<D, S, M, A, C>>)
where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let snapshot = shared.cache.snapshot();
        for agent in snapshot.all_agents() {
            let id = agent.spec.id.clone();
            let labels = [("agent", id.as_str())];
            if let Ok((_, pending)) = shared.queue.depth(&id).await {
                shared.metrics.set_gauge("queue_pending", &labels, pending as f64);
            }
            if let Ok(dlq) = shared.queue.dlq_depth(&id).await {
                shared.metrics.set_gauge("dlq_size", &labels, dlq as f64);
            }
            shared.metrics.set_gauge(
                "circuit_breaker_state",
                &labels,
                shared.breakers.agent_state(&id).as_gauge(),
            );
            let quarantined = if shared.quarantine.is_active(&id) { 1.0 } else { 0.0 };
            shared.metrics.set_gauge("quarantine_active", &labels, quarantined);
        }
        tokio::select! {
            _ = tokio::time::sleep(shared.config.metrics_interval) => {}
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
#[path = "runtime_tests/mod.rs"]
mod runtime_tests;
