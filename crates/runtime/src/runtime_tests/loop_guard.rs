// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::harness::*;
use mc_adapters::DocumentStore;
use mc_core::ChangeOperation;
use std::time::Duration;

#[tokio::test]
async fn own_write_does_not_retrigger() {
    let mut spec = triage_agent("classify");
    spec.watch.operations = vec![ChangeOperation::Insert, ChangeOperation::Update];
    let rig = start_rig(vec![spec]).await;

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));

    // The write itself emits an update event carrying the envelope; the
    // loop guard must swallow it without another model call.
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.metrics.counter_value("loop_guard_skips_total", &[("agent", "classify")]) == 1
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(rig.model.call_count(), 1);
    assert_eq!(
        executions_where(&rig.docs, "skipped", Some("loop_guard_skipped")).len(),
        1
    );

    // The document still carries exactly one write
    let doc = rig.docs.document("support", "tickets", "t1").unwrap();
    assert_eq!(doc["ai_triage"]["idempotency_key"], "t1:classify:1");
    rig.runtime.drain().await;
}

#[tokio::test]
async fn content_keyed_agents_reprocess_foreign_edits() {
    let mut spec = triage_agent("classify");
    spec.watch.operations = vec![ChangeOperation::Insert, ChangeOperation::Update];
    // Content-sensitive key: a real edit produces a new key, the echo of
    // our own write does not
    spec.write.idempotency_key = Some(
        "{{ document_id }}:{{ agent_id }}:{{ agent_revision }}:{{ document.category_hint }}"
            .to_string(),
    );
    let rig = start_rig(vec![spec]).await;

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.metrics.counter_value("loop_guard_skips_total", &[("agent", "classify")]) == 1
        })
        .await
    );
    assert_eq!(rig.model.call_count(), 1);

    // A foreign edit changes the content the key depends on
    rig.docs
        .update(
            "support",
            "tickets",
            "t1",
            mc_adapters::UpdatePatch::SetField {
                field: "category_hint".to_string(),
                value: serde_json::json!("outage"),
            },
            mc_adapters::Precondition::None,
        )
        .await
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.metrics.counter_value("loop_guard_skips_total", &[("agent", "classify")]) == 2
        })
        .await
    );
    assert_eq!(rig.model.call_count(), 2);
    let doc = rig.docs.document("support", "tickets", "t1").unwrap();
    assert_eq!(doc["ai_triage"]["idempotency_key"], "t1:classify:1:outage");
    rig.runtime.drain().await;
}
