// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::harness::*;
use mc_adapters::ModelResponse;
use std::time::Duration;

#[tokio::test]
async fn insert_is_enriched_with_an_envelope() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    rig.model.respond_with(ModelResponse {
        text: "billing".to_string(),
        tokens_used: 17,
        cost_usd: 0.002,
    });

    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));

    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.docs
                .document("support", "tickets", "t1")
                .is_some_and(|d| d.get("ai_triage").is_some())
        })
        .await
    );

    let doc = rig.docs.document("support", "tickets", "t1").unwrap();
    assert_eq!(doc["ai_triage"]["value"], "billing");
    assert_eq!(doc["ai_triage"]["agent_id"], "classify");
    assert_eq!(doc["ai_triage"]["agent_revision"], 1);
    assert_eq!(doc["ai_triage"]["idempotency_key"], "t1:classify:1");
    // Untouched fields survive the merge
    assert_eq!(doc["status"], "open");

    // The prompt rendered from the document
    let requests = rig.model.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].prompt, "cat=billing");

    // One completed execution with usage accounting
    assert!(
        wait_for(Duration::from_secs(2), || {
            executions_where(&rig.docs, "completed", Some("written")).len() == 1
        })
        .await
    );
    let execution = &executions_where(&rig.docs, "completed", Some("written"))[0];
    assert_eq!(execution["agent_id"], "classify");
    assert_eq!(execution["document_id"], "t1");
    assert_eq!(execution["attempt"], 1);
    assert_eq!(execution["tokens_used"], 17);
    assert_eq!(execution["written"], true);

    rig.runtime.drain().await;
}

#[tokio::test]
async fn non_matching_documents_are_ignored() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    rig.docs.insert_document(
        "support",
        "tickets",
        serde_json::json!({"_id": "t9", "status": "closed"}),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rig.model.call_count(), 0);
    assert!(executions(&rig.docs).is_empty());
    rig.runtime.drain().await;
}

#[tokio::test]
async fn resume_token_is_persisted_after_dispatch() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));

    assert!(
        wait_for(Duration::from_secs(5), || {
            !rig.docs.documents("mongoclaw", "resume_tokens").is_empty()
        })
        .await
    );
    let tokens = rig.docs.documents("mongoclaw", "resume_tokens");
    assert_eq!(tokens[0]["watcher_id"], "support.tickets");
    assert!(tokens[0]["token"].is_string());
    rig.runtime.drain().await;
}

#[tokio::test]
async fn idempotent_replay_via_manual_enqueue() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    let ticket = open_ticket("t1", "billing");
    rig.docs.insert_document("support", "tickets", ticket.clone());
    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "completed", None).len() == 1
        })
        .await
    );
    let before = rig.docs.document("support", "tickets", "t1").unwrap();

    // Re-drive the same event through the webhook path
    rig.runtime.enqueue_manual("classify", ticket).await.unwrap();
    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "skipped", Some("idempotent_replay")).len() == 1
        })
        .await
    );
    assert_eq!(rig.model.call_count(), 1);
    assert_eq!(rig.docs.document("support", "tickets", "t1").unwrap(), before);
    rig.runtime.drain().await;
}

#[tokio::test]
async fn status_reports_the_agent() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            executions_where(&rig.docs, "completed", None).len() == 1
        })
        .await
    );

    let statuses = rig.runtime.status().await;
    assert_eq!(statuses.len(), 1);
    let status = &statuses[0];
    assert_eq!(status.id.as_str(), "classify");
    assert!(status.enabled);
    assert!(!status.quarantined);
    assert_eq!(status.dlq_depth, 0);
    assert_eq!(status.breaker_state, crate::BreakerState::Closed);
    assert!(status.last_execution_at_ms.is_some());
    rig.runtime.drain().await;
}

#[tokio::test]
async fn latency_histogram_is_observed() {
    let rig = start_rig(vec![triage_agent("classify")]).await;
    rig.docs.insert_document("support", "tickets", open_ticket("t1", "billing"));
    assert!(
        wait_for(Duration::from_secs(5), || {
            rig.metrics.histogram_count("agent_latency_seconds", &[("agent", "classify")]) == 1
        })
        .await
    );
    assert_eq!(rig.metrics.histogram_count("model_cost_usd", &[("agent", "classify")]), 1);
    rig.runtime.drain().await;
}
