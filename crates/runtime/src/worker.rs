// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker loop: claim, gate, render, invoke, parse, write, finalize.
//!
//! Every worker reads every enabled agent's stream with a short block in
//! round-robin. Per-item failures are tagged and each tag maps to exactly
//! one disposition; admission refusals requeue without consuming an
//! attempt.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::render_context;
use crate::parse::parse_response;
use crate::shared::Shared;
use crate::write::{write_result, WriteRequest};
use mc_adapters::{AgentStore, DocumentStore, KeyValueStream, ModelClient, ModelRequest};
use mc_core::{
    fingerprint, Clock, Consistency, Disposition, ErrorTag, ExecError, Execution, WorkItem,
};

/// Terminal result of one pipeline pass over an item.
enum ItemOutcome {
    Completed { written: bool, duplicate: bool, stale_agent: bool, result_fingerprint: String },
    Failed { tag: ErrorTag, message: String },
}

pub(crate) async fn run_worker<D, S, M, A, C>(shared: Arc<Shared<D, S, M, A, C>>, name: String)
where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let mut shutdown = shared.shutdown.subscribe();
    let mut last_claim = tokio::time::Instant::now();
    loop {
        if *shutdown.borrow() {
            return;
        }
        let snapshot = shared.cache.snapshot();
        let agents = snapshot.enabled_agents();
        if agents.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(shared.config.queue_block) => continue,
                _ = shutdown.changed() => return,
            }
        }
        let sweep = last_claim.elapsed() >= shared.config.claim_interval;
        if sweep {
            last_claim = tokio::time::Instant::now();
        }
        for agent_id in &agents {
            if *shutdown.borrow() {
                return;
            }
            if shared.quarantine.is_active(agent_id) {
                continue;
            }
            let block = shared.config.queue_block;
            match shared.queue.consume(agent_id, &name, 1, block).await {
                Ok(entries) => {
                    for (entry_id, item) in entries {
                        process_item(&shared, &name, &entry_id, item).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = %name, agent = %agent_id, error = %e,
                        "queue consume failed");
                }
            }
            if sweep {
                claim_orphans(&shared, &name, agent_id, &snapshot).await;
            }
        }
    }
}

/// Recover items whose consumer died mid-flight.
async fn claim_orphans<D, S, M, A, C>(
    shared: &Arc<Shared<D, S, M, A, C>>,
    name: &str,
    agent_id: &mc_core::AgentId,
    snapshot: &Arc<crate::cache::AgentSnapshot>,
) where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let timeout_ms = snapshot
        .get(agent_id)
        .map(|a| a.spec.execution.timeout_ms)
        .unwrap_or(60_000);
    let min_idle = Duration::from_millis(timeout_ms.saturating_mul(2));
    match shared.queue.claim_pending(agent_id, name, min_idle, 10).await {
        Ok(claimed) => {
            for (entry_id, item) in claimed {
                tracing::info!(worker = %name, agent = %agent_id, item = %item.work_id,
                    "claimed orphaned work item");
                process_item(shared, name, &entry_id, item).await;
            }
        }
        Err(e) => {
            tracing::warn!(worker = %name, agent = %agent_id, error = %e, "claim sweep failed");
        }
    }
}

async fn process_item<D, S, M, A, C>(
    shared: &Arc<Shared<D, S, M, A, C>>,
    worker: &str,
    entry_id: &str,
    item: WorkItem,
) where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let now_ms = shared.clock.epoch_ms();

    // Retry delays ride on the item itself; not-yet-due items go back.
    if item.not_before_ms > now_ms {
        requeue(shared, entry_id, &item, item.not_before_ms).await;
        return;
    }

    // Stale revision or deleted agent: the work no longer has a definition.
    let snapshot = shared.cache.snapshot();
    let agent = match snapshot.get(&item.agent_id) {
        Some(agent) if agent.spec.revision == item.agent_revision => Arc::clone(agent),
        _ => {
            let execution = Execution::begin(
                item.agent_id.as_str(),
                &item.document_id,
                item.attempt,
                now_ms,
            )
            .skip(now_ms, ErrorTag::AgentGone.as_str());
            shared.ledger.record(&execution).await;
            let _ = shared.queue.ack(&item.agent_id, entry_id).await;
            return;
        }
    };
    let spec = &agent.spec;
    let exec_spec = &spec.execution;

    // Idempotency: a fresh fingerprint means this work already ran.
    let idem_key = format!("idem:{}", item.idempotency_key);
    if matches!(shared.kv.get(&idem_key).await, Ok(Some(_))) {
        let execution =
            Execution::begin(spec.id.as_str(), &item.document_id, item.attempt, now_ms)
                .skip(now_ms, "idempotent_replay");
        shared.ledger.record(&execution).await;
        let _ = shared.queue.ack(&item.agent_id, entry_id).await;
        tracing::debug!(agent = %spec.id, document = %item.document_id,
            "idempotent replay skipped");
        return;
    }

    // Admission gates. Refusals requeue without consuming an attempt.
    let admission_delay = backoff_delay(
        exec_spec.retry_delay_ms,
        item.attempt,
        1,
        shared.config.retry_max_delay,
    );
    if shared.quarantine.is_active(&spec.id) {
        requeue(shared, entry_id, &item, now_ms + admission_delay).await;
        return;
    }
    if !shared.rate.admit(&spec.id, exec_spec.rate_limit_per_minute) {
        tracing::debug!(agent = %spec.id, "rate limit refused admission");
        requeue(shared, entry_id, &item, now_ms + admission_delay).await;
        return;
    }
    if !shared.cost.admit(&spec.id, exec_spec.cost_limit_usd_per_hour) {
        tracing::debug!(agent = %spec.id, "cost limit refused admission");
        requeue(shared, entry_id, &item, now_ms + admission_delay).await;
        return;
    }
    let breaker = shared.breakers.get(&spec.id, &spec.ai.provider, &spec.ai.model);
    if !breaker.allow() {
        tracing::debug!(agent = %spec.id, "circuit breaker refused admission");
        requeue(shared, entry_id, &item, now_ms + admission_delay).await;
        return;
    }

    // Per-document advisory lock in strong mode, held for render → write.
    let lock_key = format!("lock:{}:{}", spec.id, item.document_id);
    let lock_ttl = Duration::from_millis(exec_spec.timeout_ms.saturating_mul(2));
    let locked = if exec_spec.consistency == Consistency::Strong {
        match shared.kv.setnx(&lock_key, worker, lock_ttl).await {
            Ok(true) => true,
            _ => {
                breaker.cancel_probe();
                let due = now_ms + shared.config.lock_retry_delay.as_millis() as u64;
                requeue(shared, entry_id, &item, due).await;
                return;
            }
        }
    } else {
        false
    };

    let mut execution =
        Execution::begin(spec.id.as_str(), &item.document_id, item.attempt, now_ms);
    shared.ledger.record(&execution).await;

    let outcome = execute_pipeline(shared, &agent, &item, &breaker, &mut execution).await;

    if locked {
        let _ = shared.kv.del(&lock_key).await;
    }

    settle(shared, entry_id, &item, &agent, execution, outcome).await;
}

/// Steps 4-7: render, invoke, parse, write.
async fn execute_pipeline<D, S, M, A, C>(
    shared: &Arc<Shared<D, S, M, A, C>>,
    agent: &Arc<crate::cache::CachedAgent>,
    item: &WorkItem,
    breaker: &Arc<crate::resilience::CircuitBreaker<C>>,
    execution: &mut Execution,
) -> ItemOutcome
where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let spec = &agent.spec;
    let now_ms = shared.clock.epoch_ms();
    let context =
        render_context(&item.document, &item.document_id, spec, item.operation, now_ms);

    let prompt = match agent.prompt.as_ref().map(|t| t.render(&context)) {
        Some(Ok(prompt)) => prompt,
        Some(Err(e)) => {
            breaker.cancel_probe();
            return ItemOutcome::Failed {
                tag: ErrorTag::ConfigurationError,
                message: format!("prompt render failed: {e}"),
            };
        }
        None => {
            breaker.cancel_probe();
            return ItemOutcome::Failed {
                tag: ErrorTag::ConfigurationError,
                message: "prompt template failed to compile".to_string(),
            };
        }
    };
    let system_prompt = match agent.system_prompt.as_ref().map(|t| t.render(&context)) {
        None => None,
        Some(Ok(rendered)) => Some(rendered),
        Some(Err(e)) => {
            breaker.cancel_probe();
            return ItemOutcome::Failed {
                tag: ErrorTag::ConfigurationError,
                message: format!("system prompt render failed: {e}"),
            };
        }
    };

    let request = ModelRequest {
        provider: spec.ai.provider.clone(),
        model: spec.ai.model.clone(),
        system_prompt,
        prompt,
        temperature: spec.ai.temperature,
        max_tokens: spec.ai.max_tokens,
        timeout: Duration::from_millis(spec.execution.timeout_ms),
    };
    let response = match shared.model.invoke(request).await {
        Ok(response) => {
            breaker.record(true);
            response
        }
        Err(e) => {
            breaker.record(false);
            return ItemOutcome::Failed { tag: e.tag(), message: e.to_string() };
        }
    };
    execution.tokens_used = response.tokens_used;
    execution.cost_usd = response.cost_usd;
    shared.cost.record(&spec.id, response.cost_usd);
    shared
        .metrics
        .observe("model_cost_usd", &[("agent", spec.id.as_str())], response.cost_usd);

    let value = match parse_response(&response.text, spec.ai.response_schema.as_ref()) {
        Ok(value) => value,
        Err(message) => return ItemOutcome::Failed { tag: ErrorTag::ParseError, message },
    };

    // The write proceeds even if the agent vanished mid-pipeline; the
    // execution is tagged so auditors can see it was prior work.
    let stale_agent =
        shared.cache.snapshot().live_revision(&item.agent_id) != Some(item.agent_revision);

    // Fingerprint the bare result, not the envelope: the envelope carries
    // a per-execution timestamp, so hashing it would make identical model
    // output look different on every attempt.
    let result_fingerprint = fingerprint(&value);
    let request = WriteRequest {
        database: &spec.watch.database,
        collection: &spec.watch.collection,
        document_id: &item.document_id,
        agent_id: spec.id.as_str(),
        agent_revision: item.agent_revision,
        idempotency_key: &item.idempotency_key,
        executed_at_ms: shared.clock.epoch_ms(),
        value,
    };
    match write_result(shared.docs.as_ref(), &spec.write, &request).await {
        Ok(written) => ItemOutcome::Completed {
            written,
            duplicate: !written,
            stale_agent,
            result_fingerprint,
        },
        Err((tag, message)) => ItemOutcome::Failed { tag, message },
    }
}

/// Step 8 and error dispositions: finalize, acknowledge, retry, or
/// dead-letter.
async fn settle<D, S, M, A, C>(
    shared: &Arc<Shared<D, S, M, A, C>>,
    entry_id: &str,
    item: &WorkItem,
    agent: &Arc<crate::cache::CachedAgent>,
    execution: Execution,
    outcome: ItemOutcome,
) where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let spec = &agent.spec;
    let now_ms = shared.clock.epoch_ms();
    match outcome {
        ItemOutcome::Completed { written, duplicate, stale_agent, result_fingerprint } => {
            // When the precondition no-ops the write, compare against the
            // result already sitting in the document: a matching
            // fingerprint is a benign replay of identical output, a
            // mismatch means a different result holds this key.
            let conflict = if duplicate {
                Some(match stored_result_fingerprint(shared, spec, item).await {
                    Some(stored) if stored == result_fingerprint => {
                        "an identical result is already written for this key".to_string()
                    }
                    Some(_) => {
                        tracing::warn!(agent = %spec.id, document = %item.document_id,
                            "duplicate key holds a different result");
                        "a different result is already written for this key".to_string()
                    }
                    None => "nothing to write: document or envelope is gone".to_string(),
                })
            } else {
                None
            };
            let entry = json!({
                "executed_at_ms": now_ms,
                "execution_id": execution.id.as_str(),
                "result_fingerprint": result_fingerprint,
            });
            if let Err(e) = shared
                .kv
                .set_with_ttl(
                    &format!("idem:{}", item.idempotency_key),
                    &entry.to_string(),
                    shared.config.idempotency_ttl,
                )
                .await
            {
                tracing::warn!(agent = %spec.id, error = %e,
                    "failed to record idempotency key");
            }
            let mut execution = execution.complete(now_ms, written);
            if let Some(message) = conflict {
                execution.error = Some(ExecError { tag: ErrorTag::WriteConflict, message });
            }
            if stale_agent {
                execution.lifecycle_state = "stale_agent".to_string();
            }
            shared.ledger.record(&execution).await;
            let _ = shared.queue.ack(&item.agent_id, entry_id).await;
            shared.quarantine.record_ok(&spec.id);
            finish_latency(shared, item, now_ms);
        }
        ItemOutcome::Failed { tag, message } => match tag.disposition() {
            Disposition::SkipAck => {
                let mut execution = execution.skip(now_ms, tag.as_str());
                execution.error = Some(ExecError { tag, message });
                shared.ledger.record(&execution).await;
                let _ = shared.queue.ack(&item.agent_id, entry_id).await;
            }
            Disposition::CompleteUnwritten => {
                let mut execution = execution.complete(now_ms, false);
                execution.error = Some(ExecError { tag, message });
                shared.ledger.record(&execution).await;
                let _ = shared.queue.ack(&item.agent_id, entry_id).await;
                shared.quarantine.record_ok(&spec.id);
            }
            Disposition::NackNoAttempt => {
                let delay = backoff_delay(
                    spec.execution.retry_delay_ms,
                    item.attempt,
                    1,
                    shared.config.retry_max_delay,
                );
                requeue(shared, entry_id, item, now_ms + delay).await;
            }
            Disposition::Retry | Disposition::RetryElongated => {
                if item.attempt > spec.execution.max_retries {
                    dead_letter(shared, entry_id, item, spec, execution, tag, message).await;
                } else {
                    let factor = if tag.disposition() == Disposition::RetryElongated {
                        shared.config.elongated_backoff_factor
                    } else {
                        1
                    };
                    let delay = backoff_delay(
                        spec.execution.retry_delay_ms,
                        item.attempt,
                        factor,
                        shared.config.retry_max_delay,
                    );
                    let replacement = item.retry(now_ms + delay);
                    let execution = execution.fail(now_ms, tag, message);
                    shared.ledger.record(&execution).await;
                    if let Err(e) =
                        shared.queue.nack(&item.agent_id, entry_id, &replacement).await
                    {
                        tracing::warn!(agent = %spec.id, error = %e,
                            "retry requeue failed, item stays pending");
                    } else {
                        shared.metrics.inc_counter(
                            "retries_scheduled_total",
                            &[("agent", spec.id.as_str())],
                            1,
                        );
                        tracing::info!(agent = %spec.id, item = %item.work_id,
                            attempt = item.attempt, delay_ms = delay, tag = %tag,
                            "retry scheduled");
                    }
                }
            }
            Disposition::DlqDirect => {
                dead_letter(shared, entry_id, item, spec, execution, tag, message).await;
            }
        },
    }
}

async fn dead_letter<D, S, M, A, C>(
    shared: &Arc<Shared<D, S, M, A, C>>,
    entry_id: &str,
    item: &WorkItem,
    spec: &mc_core::AgentSpec,
    execution: Execution,
    tag: ErrorTag,
    message: String,
) where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let now_ms = shared.clock.epoch_ms();
    if let Err(e) = shared.queue.dlq_push(item, tag, &message).await {
        tracing::error!(agent = %spec.id, error = %e,
            "dead-letter push failed, item stays pending");
        return;
    }
    let _ = shared.queue.ack(&item.agent_id, entry_id).await;
    let execution = execution.dead_letter(now_ms, tag, message);
    shared.ledger.record(&execution).await;
    if shared.quarantine.record_dlq(&spec.id) {
        shared
            .metrics
            .set_gauge("quarantine_active", &[("agent", spec.id.as_str())], 1.0);
    }
}

/// Fingerprint of the result already written at the target field under
/// this item's idempotency key, if any.
async fn stored_result_fingerprint<D, S, M, A, C>(
    shared: &Arc<Shared<D, S, M, A, C>>,
    spec: &mc_core::AgentSpec,
    item: &WorkItem,
) -> Option<String>
where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let doc = shared
        .docs
        .find(&spec.watch.database, &spec.watch.collection, &item.document_id)
        .await
        .ok()
        .flatten()?;
    let field = doc.get(&spec.write.target_field)?;
    let stored = match field {
        Value::Array(items) => items
            .iter()
            .find(|entry| {
                entry.get("idempotency_key").and_then(Value::as_str)
                    == Some(item.idempotency_key.as_str())
            })?
            .get("value")?,
        other => other.get("value")?,
    };
    Some(fingerprint(stored))
}

fn finish_latency<D, S, M, A, C>(
    shared: &Arc<Shared<D, S, M, A, C>>,
    item: &WorkItem,
    now_ms: u64,
) where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let latency_ms = now_ms.saturating_sub(item.enqueued_at_ms);
    shared.metrics.observe(
        "agent_latency_seconds",
        &[("agent", item.agent_id.as_str())],
        latency_ms as f64 / 1000.0,
    );
    if shared.slo.record(&item.agent_id, latency_ms) {
        shared.metrics.inc_counter(
            "agent_latency_slo_violations_total",
            &[("agent", item.agent_id.as_str())],
            1,
        );
    }
}

/// Requeue without consuming an attempt.
async fn requeue<D, S, M, A, C>(
    shared: &Arc<Shared<D, S, M, A, C>>,
    entry_id: &str,
    item: &WorkItem,
    not_before_ms: u64,
) where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let replacement = item.requeue(not_before_ms);
    if let Err(e) = shared.queue.nack(&item.agent_id, entry_id, &replacement).await {
        tracing::warn!(agent = %item.agent_id, error = %e,
            "requeue failed, item stays pending");
    }
}

/// `base * 2^(attempt-1)`, capped.
fn backoff_delay(base_ms: u64, attempt: u32, factor: u32, cap: Duration) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base_ms
        .saturating_mul(1u64 << exponent)
        .saturating_mul(factor as u64);
    delay.min(cap.as_millis() as u64)
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
