// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatcher: fan each change event out to matching agents.
//!
//! Fan-out is all-or-nothing per event: the sequence is acknowledged to
//! the watcher only after every surviving work item is enqueued, so a
//! crash mid-fan-out replays the whole event. Duplicate delivery to one
//! agent is tolerated; the idempotency layer absorbs it.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cache::CachedAgent;
use crate::shared::Shared;
use mc_adapters::{AgentStore, DocumentStore, KeyValueStream, ModelClient};
use mc_core::{
    AgentSpec, ChangeEvent, ChangeOperation, Clock, ErrorTag, ExecError, Execution, Trigger,
    WorkItem, WorkItemId,
};

/// Template render context shared by the dispatcher (idempotency keys) and
/// the worker (prompts).
pub(crate) fn render_context(
    document: &Value,
    document_id: &str,
    spec: &AgentSpec,
    operation: ChangeOperation,
    now_ms: u64,
) -> Value {
    json!({
        "document": document,
        "document_id": document_id,
        "agent_id": spec.id,
        "agent_revision": spec.revision,
        "agent": {
            "id": spec.id,
            "name": spec.name,
            "tags": spec.tags,
            "provider": spec.ai.provider,
            "model": spec.ai.model,
        },
        "operation": operation.as_str(),
        "now": now_ms,
    })
}

/// Check whether the event is the echo of this agent's own write: the
/// post-image already carries an envelope with the current revision and
/// the exact key this event would produce.
fn loop_guard_hit(agent: &CachedAgent, event: &ChangeEvent, key: &str) -> bool {
    let Some(doc) = &event.full_document else { return false };
    let Some(written) = doc.get(&agent.spec.write.target_field) else { return false };
    let revision = agent.spec.revision;
    let matches_envelope = |value: &Value| {
        value.get("agent_revision").and_then(Value::as_u64) == Some(revision)
            && value.get("idempotency_key").and_then(Value::as_str) == Some(key)
    };
    match written {
        Value::Array(items) => items.iter().any(matches_envelope),
        other => matches_envelope(other),
    }
}

/// Dispatcher loop. Consumes the bounded handoff until shutdown, then
/// drains whatever is already buffered.
pub(crate) async fn run_dispatcher<D, S, M, A, C>(
    shared: Arc<Shared<D, S, M, A, C>>,
    mut handoff: mpsc::Receiver<ChangeEvent>,
) where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let event = tokio::select! {
            event = handoff.recv() => event,
            _ = shutdown.changed() => break,
        };
        match event {
            Some(event) => dispatch_event(&shared, &event).await,
            None => return,
        }
    }
    // Drain the handoff so buffered events are not lost on graceful stop
    while let Ok(event) = handoff.try_recv() {
        dispatch_event(&shared, &event).await;
    }
}

/// Fan one event out. Acknowledges the sequence unless enqueueing was
/// abandoned by shutdown.
pub(crate) async fn dispatch_event<D, S, M, A, C>(
    shared: &Arc<Shared<D, S, M, A, C>>,
    event: &ChangeEvent,
) where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let snapshot = shared.cache.snapshot();
    let now_ms = shared.clock.epoch_ms();
    let mut items: Vec<WorkItem> = Vec::new();

    for agent_id in snapshot.agents_for(&event.watcher) {
        let Some(agent) = snapshot.get(agent_id) else { continue };
        let spec = &agent.spec;
        if !spec.watch.operations.contains(&event.operation) {
            continue;
        }
        if let Some(error) = &agent.config_error {
            record_skip(shared, spec, event, ErrorTag::ConfigurationError, error).await;
            continue;
        }
        if !filter_matches(agent, event) {
            continue;
        }

        let document = event
            .full_document
            .clone()
            .unwrap_or_else(|| json!({"_id": event.document_id}));
        let context = render_context(&document, &event.document_id, spec, event.operation, now_ms);
        let key = match agent.idempotency_key.as_ref().map(|t| t.render(&context)) {
            Some(Ok(key)) => key,
            Some(Err(e)) => {
                record_skip(shared, spec, event, ErrorTag::ConfigurationError, &e.to_string())
                    .await;
                continue;
            }
            None => continue,
        };

        if loop_guard_hit(agent, event, &key) {
            shared.metrics.inc_counter(
                "loop_guard_skips_total",
                &[("agent", spec.id.as_str())],
                1,
            );
            let mut execution =
                Execution::begin(spec.id.as_str(), &event.document_id, 0, now_ms)
                    .skip(now_ms, "loop_guard_skipped");
            execution.lifecycle_state = "loop_guard_skipped".to_string();
            shared.ledger.record(&execution).await;
            tracing::debug!(agent = %spec.id, document = %event.document_id,
                "loop guard suppressed self-triggered event");
            continue;
        }

        if shared.quarantine.is_active(&spec.id) {
            tracing::debug!(agent = %spec.id, "agent quarantined, not enqueueing");
            continue;
        }

        if shared.recent_keys.check_and_insert(&key) {
            tracing::debug!(agent = %spec.id, key = %key, "duplicate key suppressed");
            continue;
        }

        items.push(WorkItem {
            work_id: WorkItemId::new(),
            agent_id: spec.id.clone(),
            agent_revision: spec.revision,
            document_id: event.document_id.clone(),
            document,
            operation: event.operation,
            enqueued_at_ms: now_ms,
            attempt: 1,
            trigger: Trigger::Change,
            idempotency_key: key,
            not_before_ms: 0,
        });
    }

    // All-or-nothing: keep retrying each enqueue; only shutdown abandons
    // the event (unacknowledged, so it replays).
    let mut shutdown = shared.shutdown.subscribe();
    for item in &items {
        let mut backoff: u32 = 0;
        loop {
            match shared.queue.produce(item).await {
                Ok(_) => break,
                Err(e) => {
                    if *shutdown.borrow() {
                        tracing::warn!(agent = %item.agent_id, error = %e,
                            "enqueue abandoned by shutdown, event will replay");
                        return;
                    }
                    let delay = Duration::from_millis(
                        200u64.saturating_mul(1 << backoff.min(5)).min(5_000),
                    );
                    tracing::warn!(agent = %item.agent_id, error = %e,
                        delay_ms = delay.as_millis() as u64, "enqueue failed, retrying");
                    backoff += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    shared.tracker.ack(&event.watcher, event.seq);
}

fn filter_matches(agent: &CachedAgent, event: &ChangeEvent) -> bool {
    let Some(filter) = &agent.filter else { return true };
    match &event.full_document {
        Some(doc) => filter.matches(doc),
        None => {
            // No post-image (delete): only `_id`-only filters can match
            event.operation == ChangeOperation::Delete
                && filter.references_only_id()
                && filter.matches(&json!({"_id": event.document_id}))
        }
    }
}

async fn record_skip<D, S, M, A, C>(
    shared: &Arc<Shared<D, S, M, A, C>>,
    spec: &AgentSpec,
    event: &ChangeEvent,
    tag: ErrorTag,
    message: &str,
) where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let now_ms = shared.clock.epoch_ms();
    let mut execution = Execution::begin(spec.id.as_str(), &event.document_id, 0, now_ms)
        .skip(now_ms, tag.as_str());
    execution.error = Some(ExecError { tag, message: message.to_string() });
    shared.ledger.record(&execution).await;
    tracing::warn!(agent = %spec.id, document = %event.document_id, error = message,
        "event skipped: {}", tag);
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
