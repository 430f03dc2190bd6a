// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::harness::*;
use crate::queue::QueueClient;
use mc_adapters::{DocumentStore, MemoryAgentStore, MemoryDocumentStore, MemoryStream, ModelResponse};
use mc_core::{AgentId, ChangeOperation, SystemClock, Trigger, WorkItem, WorkItemId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// A worker claims the item, then dies without acking. After the idle
/// window a restarted pipeline claims and completes it, and the
/// idempotency layer keeps the write single.
#[tokio::test]
async fn orphaned_items_are_claimed_and_completed() {
    let docs = Arc::new(MemoryDocumentStore::new());
    let kv = Arc::new(MemoryStream::new(SystemClock));
    let agents = Arc::new(MemoryAgentStore::new());
    let mut spec = triage_agent("classify");
    // Short timeout so the 2x idle window elapses quickly
    spec.execution.timeout_ms = 50;
    agents.put(spec).unwrap();
    docs.insert_document("support", "tickets", open_ticket("t1", "billing"));

    // Simulate the dead worker before any runtime exists
    let queue = QueueClient::new(Arc::clone(&kv), SystemClock, 1_000, 100);
    let item = WorkItem {
        work_id: WorkItemId::new(),
        agent_id: AgentId::new("classify").unwrap(),
        agent_revision: 1,
        document_id: "t1".to_string(),
        document: open_ticket("t1", "billing"),
        operation: ChangeOperation::Insert,
        enqueued_at_ms: 0,
        attempt: 1,
        trigger: Trigger::Change,
        idempotency_key: "t1:classify:1".to_string(),
        not_before_ms: 0,
    };
    queue.produce(&item).await.unwrap();
    let agent = AgentId::new("classify").unwrap();
    let delivered = queue.consume(&agent, "dead-worker", 1, Duration::ZERO).await.unwrap();
    assert_eq!(delivered.len(), 1);

    let rig = restart_rig(crate::RuntimeConfig::fast(), docs, kv, agents).await;
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.docs
                .document("support", "tickets", "t1")
                .is_some_and(|d| d.get("ai_triage").is_some())
        })
        .await
    );
    // Exactly one write in spite of redelivery
    assert_eq!(rig.model.call_count(), 1);
    assert_eq!(executions_where(&rig.docs, "completed", Some("written")).len(), 1);
    let (_, pending) = rig.runtime.shared.queue.depth(&agent).await.unwrap();
    assert_eq!(pending, 0);
    rig.runtime.drain().await;
}

/// A crash after the write landed but before the idempotency key was
/// recorded: the replay re-invokes the model, the write no-ops against the
/// existing envelope, and the stored result fingerprint tells a benign
/// identical-output replay apart from divergent output.
#[tokio::test]
async fn duplicate_write_distinguishes_identical_results() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    rig.docs.insert_document(
        "support",
        "tickets",
        json!({
            "_id": "t1", "status": "open", "category_hint": "billing",
            "ai_triage": {"value": "billing", "agent_id": "classify", "agent_revision": 1,
                "executed_at_ms": 1, "idempotency_key": "t1:classify:1"},
        }),
    );
    rig.docs.insert_document(
        "support",
        "tickets",
        json!({
            "_id": "t2", "status": "open", "category_hint": "refunds",
            "ai_triage": {"value": "refunds", "agent_id": "classify", "agent_revision": 1,
                "executed_at_ms": 1, "idempotency_key": "t2:classify:1"},
        }),
    );
    // The model reproduces t1's stored result but not t2's
    rig.model.respond_with(ModelResponse {
        text: "billing".to_string(),
        tokens_used: 5,
        cost_usd: 0.001,
    });

    for doc_id in ["t1", "t2"] {
        let document = rig.docs.document("support", "tickets", doc_id).unwrap();
        let item = WorkItem {
            work_id: WorkItemId::new(),
            agent_id: AgentId::new("classify").unwrap(),
            agent_revision: 1,
            document_id: doc_id.to_string(),
            document,
            operation: ChangeOperation::Insert,
            enqueued_at_ms: 0,
            attempt: 1,
            trigger: Trigger::Retry,
            idempotency_key: format!("{doc_id}:classify:1"),
            not_before_ms: 0,
        };
        rig.runtime.shared.queue.produce(&item).await.unwrap();
    }

    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "completed", Some("write_skipped")).len() == 2
        })
        .await
    );
    let completed = executions_where(&rig.docs, "completed", Some("write_skipped"));
    let message = |doc_id: &str| {
        completed
            .iter()
            .find(|e| e["document_id"] == doc_id)
            .and_then(|e| e["error"]["message"].as_str())
            .unwrap()
            .to_string()
    };
    assert!(message("t1").contains("identical"));
    assert!(message("t2").contains("different"));
    assert_eq!(rig.model.call_count(), 2);

    // Neither envelope was overwritten
    let t1 = rig.docs.document("support", "tickets", "t1").unwrap();
    assert_eq!(t1["ai_triage"]["value"], "billing");
    let t2 = rig.docs.document("support", "tickets", "t2").unwrap();
    assert_eq!(t2["ai_triage"]["value"], "refunds");
    rig.runtime.drain().await;
}

/// Replaying from an older resume token after a restart converges without
/// duplicate writes: the replayed echo is loop-guarded, the document keeps
/// its value.
#[tokio::test]
async fn replay_from_older_token_is_idempotent() {
    let mut spec = triage_agent("classify");
    spec.watch.operations = vec![ChangeOperation::Insert, ChangeOperation::Update];
    let rig = start_rig(vec![spec]).await;

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.metrics.counter_value("loop_guard_skips_total", &[("agent", "classify")]) == 1
        })
        .await
    );
    let settled = rig.docs.document("support", "tickets", "t1").unwrap();
    rig.runtime.drain().await;

    // Rewind the durable token to before the self-write echo
    let docs = Arc::clone(&rig.docs);
    docs.upsert(
        "mongoclaw",
        "resume_tokens",
        "support.tickets",
        json!({"watcher_id": "support.tickets", "token": "0", "updated_at_ms": 0}),
    )
    .await
    .unwrap();

    let rig2 = restart_rig(
        crate::RuntimeConfig::fast(),
        Arc::clone(&rig.docs),
        Arc::clone(&rig.kv),
        Arc::clone(&rig.agents),
    )
    .await;
    // The echo replays and is suppressed again
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig2.metrics.counter_value("loop_guard_skips_total", &[("agent", "classify")]) == 1
        })
        .await
    );
    assert_eq!(rig2.model.call_count(), 0);
    assert_eq!(rig2.docs.document("support", "tickets", "t1").unwrap(), settled);
    rig2.runtime.drain().await;
}

/// An invalidated token is a feed gap: exactly one reset is recorded and
/// the stream restarts from "now".
#[tokio::test]
async fn feed_reset_records_once_and_resumes_from_now() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            !rig.docs.documents("mongoclaw", "resume_tokens").is_empty()
        })
        .await
    );
    rig.runtime.drain().await;

    rig.docs.invalidate_next_resume("support", "tickets");
    let rig2 = restart_rig(
        crate::RuntimeConfig::fast(),
        Arc::clone(&rig.docs),
        Arc::clone(&rig.kv),
        Arc::clone(&rig.agents),
    )
    .await;

    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig2.docs, "skipped", Some("feed_reset")).len() == 1
        })
        .await
    );
    // The stream works again from "now"
    rig2.docs.insert_document("support", "tickets", open_ticket("t2", "payments"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig2.docs
                .document("support", "tickets", "t2")
                .is_some_and(|d| d.get("ai_triage").is_some())
        })
        .await
    );
    assert_eq!(
        executions_where(&rig2.docs, "skipped", Some("feed_reset")).len(),
        1
    );
    rig2.runtime.drain().await;
}
