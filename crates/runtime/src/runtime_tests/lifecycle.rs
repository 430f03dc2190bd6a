// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::harness::*;
use mc_adapters::ModelError;
use mc_core::{AgentId, Trigger, WorkItem, WorkItemId};
use std::time::Duration;

#[tokio::test]
async fn disabling_stops_matching_within_the_refresh_window() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    let agent = AgentId::new("classify").unwrap();

    rig.agents.set_enabled(&agent, false);
    assert!(
        wait_for(Duration::from_secs(2), || {
            !rig.runtime.shared.cache.snapshot().enabled_agents().contains(&agent)
        })
        .await
    );

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rig.model.call_count(), 0);
    rig.runtime.drain().await;
}

#[tokio::test]
async fn stale_revision_items_are_skipped_as_agent_gone() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    let item = WorkItem {
        work_id: WorkItemId::new(),
        agent_id: AgentId::new("classify").unwrap(),
        // The live agent is at revision 1; this item is from an older one
        agent_revision: 0,
        document_id: "t1".to_string(),
        document: open_ticket("t1", "billing"),
        operation: mc_core::ChangeOperation::Insert,
        enqueued_at_ms: 0,
        attempt: 1,
        trigger: Trigger::Change,
        idempotency_key: "t1:classify:0".to_string(),
        not_before_ms: 0,
    };
    rig.runtime.shared.queue.produce(&item).await.unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "skipped", Some("agent_gone")).len() == 1
        })
        .await
    );
    assert_eq!(rig.model.call_count(), 0);
    assert!(rig.docs.document("support", "tickets", "t1").is_none());
    rig.runtime.drain().await;
}

#[tokio::test]
async fn quarantine_after_consecutive_dead_letters() {
    let mut config = crate::RuntimeConfig::fast();
    config.quarantine_threshold = 2;
    let mut spec = triage_agent("classify");
    spec.execution.max_retries = 0;
    let rig = start_rig_with(config, vec![spec]).await;
    rig.model.push_errors(ModelError::Client { status: 400 }, 2);

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "a"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "dlq", None).len() == 1
        })
        .await
    );
    rig.docs.insert_document("support", "tickets", open_ticket("t2", "b"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "dlq", None).len() == 2
        })
        .await
    );

    let agent = AgentId::new("classify").unwrap();
    assert!(
        wait_for(Duration::from_secs(2), || rig.runtime.shared.quarantine.is_active(&agent))
            .await
    );
    let statuses = rig.runtime.status().await;
    assert!(statuses[0].quarantined);

    // Quarantined: new events are not enqueued
    rig.docs.insert_document("support", "tickets", open_ticket("t3", "c"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rig.model.call_count(), 2);

    // Manual release restores processing
    assert!(rig.runtime.release_quarantine("classify"));
    rig.docs.insert_document("support", "tickets", open_ticket("t4", "d"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.docs
                .document("support", "tickets", "t4")
                .is_some_and(|d| d.get("ai_triage").is_some())
        })
        .await
    );
    rig.runtime.drain().await;
}

#[tokio::test]
async fn manual_enqueue_validates_the_agent() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    let err = rig
        .runtime
        .enqueue_manual("ghost", open_ticket("t1", "billing"))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::RuntimeError::UnknownAgent(_)));

    let err = rig
        .runtime
        .enqueue_manual("classify", serde_json::json!({"no_id": true}))
        .await
        .unwrap_err();
    assert!(matches!(err, crate::RuntimeError::InvalidDocument(_)));
    rig.runtime.drain().await;
}

#[tokio::test]
async fn new_agents_get_subscriptions_at_runtime() {
    let rig = start_rig(Vec::new()).await;
    assert!(rig.runtime.status().await.is_empty());

    rig.agents.put(triage_agent("classify")).unwrap();
    assert!(
        wait_for(Duration::from_secs(2), || {
            rig.runtime.shared.cache.snapshot().len() == 1
        })
        .await
    );
    // The reconciler opens the subscription on its next tick
    assert!(
        wait_for(Duration::from_secs(2), || {
            rig.docs.subscribe_count("support", "tickets") >= 1
        })
        .await
    );

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.docs
                .document("support", "tickets", "t1")
                .is_some_and(|d| d.get("ai_triage").is_some())
        })
        .await
    );
    rig.runtime.drain().await;
}
