// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::harness::*;
use mc_adapters::ModelError;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn transient_timeouts_then_success() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    rig.model.push_errors(ModelError::Timeout(Duration::from_secs(1)), 2);

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));

    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.docs
                .document("support", "tickets", "t1")
                .is_some_and(|d| d.get("ai_triage").is_some())
        })
        .await
    );
    assert_eq!(rig.model.call_count(), 3);
    assert_eq!(
        rig.metrics.counter_value("retries_scheduled_total", &[("agent", "classify")]),
        2
    );

    // One execution per attempt: two failed, one completed
    let failed = executions_where(&rig.docs, "failed", None);
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|e| e["error"]["tag"] == "model_timeout"));
    let completed = executions_where(&rig.docs, "completed", None);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["attempt"], 3);

    // The document was written exactly once
    let doc = rig.docs.document("support", "tickets", "t1").unwrap();
    assert_eq!(doc["ai_triage"]["idempotency_key"], "t1:classify:1");
    rig.runtime.drain().await;
}

#[tokio::test]
async fn exhausted_retries_dead_letter_with_origin() {
    let mut spec = triage_agent("classify");
    spec.execution.max_retries = 1;
    let rig = start_rig(vec![spec]).await;
    rig.model.push_errors(ModelError::Server { status: 503 }, 2);

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));

    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "dlq", None).len() == 1
        })
        .await
    );
    assert_eq!(rig.model.call_count(), 2);

    let agent = mc_core::AgentId::new("classify").unwrap();
    assert_eq!(rig.runtime.shared.queue.dlq_depth(&agent).await.unwrap(), 1);
    let dlq = executions_where(&rig.docs, "dlq", None);
    assert_eq!(dlq[0]["error"]["tag"], "model_5xx");
    assert_eq!(dlq[0]["attempt"], 2);

    // No write happened
    let doc = rig.docs.document("support", "tickets", "t1").unwrap();
    assert!(doc.get("ai_triage").is_none());

    // The gauge catches up via the metrics pump
    assert!(
        wait_for(Duration::from_secs(2), || {
            rig.metrics.gauge_value("dlq_size", &[("agent", "classify")]) == Some(1.0)
        })
        .await
    );
    rig.runtime.drain().await;
}

#[tokio::test]
async fn client_errors_skip_retries_entirely() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    rig.model.push(Err(ModelError::Client { status: 400 }));

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));

    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "dlq", None).len() == 1
        })
        .await
    );
    assert_eq!(rig.model.call_count(), 1);
    assert_eq!(executions_where(&rig.docs, "dlq", None)[0]["error"]["tag"], "model_4xx");
    assert_eq!(
        rig.metrics.counter_value("retries_scheduled_total", &[("agent", "classify")]),
        0
    );
    rig.runtime.drain().await;
}

#[tokio::test]
async fn schema_violations_retry_then_succeed() {
    let mut spec = triage_agent("classify");
    spec.ai.response_schema = Some(json!({"type": "object", "required": ["category"]}));
    let rig = start_rig(vec![spec]).await;
    rig.model.push(Ok(mc_adapters::ModelResponse {
        text: "not json at all".to_string(),
        tokens_used: 5,
        cost_usd: 0.001,
    }));
    rig.model.push(Ok(mc_adapters::ModelResponse {
        text: "```json\n{\"category\": \"billing\"}\n```".to_string(),
        tokens_used: 9,
        cost_usd: 0.001,
    }));

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));

    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.docs
                .document("support", "tickets", "t1")
                .is_some_and(|d| d.get("ai_triage").is_some())
        })
        .await
    );
    assert_eq!(rig.model.call_count(), 2);
    let doc = rig.docs.document("support", "tickets", "t1").unwrap();
    assert_eq!(doc["ai_triage"]["value"]["category"], "billing");
    let failed = executions_where(&rig.docs, "failed", None);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["error"]["tag"], "parse_error");
    rig.runtime.drain().await;
}
