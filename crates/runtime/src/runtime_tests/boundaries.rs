// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::harness::*;
use mc_adapters::ModelError;
use mc_core::ChangeOperation;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn empty_operations_are_rejected_at_creation() {
    let rig = start_rig(Vec::new()).await;
    let mut spec = triage_agent("classify");
    spec.watch.operations.clear();
    assert!(rig.agents.put(spec).is_err());
    rig.runtime.drain().await;
}

#[tokio::test]
async fn zero_retries_send_the_first_failure_to_the_dlq() {
    let mut spec = triage_agent("classify");
    spec.execution.max_retries = 0;
    let rig = start_rig(vec![spec]).await;
    rig.model.push(Err(ModelError::Server { status: 500 }));

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "dlq", None).len() == 1
        })
        .await
    );
    assert_eq!(rig.model.call_count(), 1);
    assert_eq!(
        rig.metrics.counter_value("retries_scheduled_total", &[("agent", "classify")]),
        0
    );
    rig.runtime.drain().await;
}

#[tokio::test]
async fn deletes_without_post_image_match_only_id_filters() {
    let mut by_status = triage_agent("by-status");
    by_status.watch.operations = vec![ChangeOperation::Delete];

    let mut by_id = triage_agent("by-id");
    by_id.watch.operations = vec![ChangeOperation::Delete];
    by_id.watch.filter = Some(json!({"_id": "t1"}));
    by_id.write.target_field = "ai_tombstone".to_string();

    let rig = start_rig(vec![by_status, by_id]).await;

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));
    rig.docs.delete_document("support", "tickets", "t1");

    // Only the _id filter matches; the document is gone, so the write is
    // an unwritten completion
    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "completed", Some("write_skipped")).len() == 1
        })
        .await
    );
    assert_eq!(rig.model.call_count(), 1);
    let completed = executions_where(&rig.docs, "completed", Some("write_skipped"));
    assert_eq!(completed[0]["agent_id"], "by-id");
    assert_eq!(completed[0]["written"], false);
    rig.runtime.drain().await;
}

#[tokio::test]
async fn rate_limited_agents_back_off_without_burning_attempts() {
    let mut spec = triage_agent("classify");
    spec.execution.rate_limit_per_minute = Some(1);
    spec.execution.retry_delay_ms = 20;
    let rig = start_rig(vec![spec]).await;

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "a"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "completed", Some("written")).len() == 1
        })
        .await
    );
    // Second document is admitted only after the bucket refills; the item
    // keeps cycling with attempt = 1 meanwhile
    rig.docs.insert_document("support", "tickets", open_ticket("t2", "b"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rig.model.call_count(), 1);
    let completed = executions_where(&rig.docs, "completed", Some("written"));
    assert_eq!(completed.len(), 1);
    assert!(executions_where(&rig.docs, "dlq", None).is_empty());
    rig.runtime.drain().await;
}

#[tokio::test]
async fn prometheus_rendering_covers_pipeline_series() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "completed", Some("written")).len() == 1
        })
        .await
    );
    assert!(
        wait_for(Duration::from_secs(2), || {
            rig.metrics
                .gauge_value("circuit_breaker_state", &[("agent", "classify")])
                .is_some()
        })
        .await
    );
    // The runtime handle is the pull surface
    let text = rig.runtime.render_metrics().unwrap();
    assert!(text.contains("queue_pending{agent=\"classify\"}"));
    assert!(text.contains("dlq_size{agent=\"classify\"}"));
    assert!(text.contains("circuit_breaker_state{agent=\"classify\"} 0"));
    assert!(text.contains("quarantine_active{agent=\"classify\"} 0"));
    assert!(text.contains("agent_latency_seconds_count{agent=\"classify\"}"));
    rig.runtime.drain().await;
}
