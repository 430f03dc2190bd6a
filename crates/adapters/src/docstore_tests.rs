// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;

#[tokio::test]
async fn feed_sees_inserts_after_subscription_point() {
    let store = MemoryDocumentStore::new();
    store.insert_document("db", "c", json!({"_id": "before"}));
    let mut feed = store.subscribe("db", "c", None).await.unwrap();

    // Subscribed at "now": the earlier insert is not replayed
    assert_eq!(feed.next(Duration::from_millis(10)).await.unwrap(), None);

    store.insert_document("db", "c", json!({"_id": "after"}));
    let change = feed.next(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(change.document_id, "after");
    assert_eq!(change.operation, ChangeOperation::Insert);
    assert!(change.full_document.is_some());
}

#[tokio::test]
async fn resume_token_replays_from_position() {
    let store = MemoryDocumentStore::new();
    let mut feed = store.subscribe("db", "c", None).await.unwrap();
    store.insert_document("db", "c", json!({"_id": "a"}));
    store.insert_document("db", "c", json!({"_id": "b"}));

    let first = feed.next(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(first.document_id, "a");

    // Resume after the first token: only "b" is replayed
    let mut resumed = store.subscribe("db", "c", Some(first.resume_token)).await.unwrap();
    let second = resumed.next(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(second.document_id, "b");
    assert_eq!(resumed.next(Duration::from_millis(10)).await.unwrap(), None);
}

#[tokio::test]
async fn invalidated_resume_token_fails_subscribe_once() {
    let store = MemoryDocumentStore::new();
    store.insert_document("db", "c", json!({"_id": "a"}));
    store.invalidate_next_resume("db", "c");
    let err = store.subscribe("db", "c", Some("0".to_string())).await.unwrap_err();
    assert!(matches!(err, StoreError::TokenInvalidated));
    // Second attempt succeeds
    assert!(store.subscribe("db", "c", Some("0".to_string())).await.is_ok());
}

#[tokio::test]
async fn delete_emits_change_without_post_image() {
    let store = MemoryDocumentStore::new();
    let mut feed = store.subscribe("db", "c", None).await.unwrap();
    store.insert_document("db", "c", json!({"_id": "a"}));
    store.delete_document("db", "c", "a");
    feed.next(Duration::from_millis(200)).await.unwrap().unwrap();
    let change = feed.next(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(change.operation, ChangeOperation::Delete);
    assert_eq!(change.full_document, None);
    assert_eq!(store.document("db", "c", "a"), None);
}

#[tokio::test]
async fn update_applies_set_and_emits_change() {
    let store = MemoryDocumentStore::new();
    store.insert_document("db", "c", json!({"_id": "a", "x": 1}));
    let mut feed = store.subscribe("db", "c", None).await.unwrap();

    let outcome = store
        .update(
            "db",
            "c",
            "a",
            UpdatePatch::SetField { field: "y".to_string(), value: json!({"idempotency_key": "k"}) },
            Precondition::None,
        )
        .await
        .unwrap();
    assert!(outcome.matched && outcome.modified);

    let change = feed.next(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(change.operation, ChangeOperation::Update);
    assert_eq!(change.full_document.unwrap()["y"]["idempotency_key"], "k");
}

#[tokio::test]
async fn envelope_precondition_blocks_duplicate_write() {
    let store = MemoryDocumentStore::new();
    store.insert_document("db", "c", json!({"_id": "a"}));
    let patch = || UpdatePatch::SetField {
        field: "out".to_string(),
        value: json!({"value": 1, "idempotency_key": "k1"}),
    };
    let pre =
        || Precondition::EnvelopeKeyDiffers { field: "out".to_string(), key: "k1".to_string() };

    let first = store.update("db", "c", "a", patch(), pre()).await.unwrap();
    assert!(first.matched);
    let second = store.update("db", "c", "a", patch(), pre()).await.unwrap();
    assert!(!second.matched && !second.modified);

    // A different key passes the precondition
    let third = store
        .update(
            "db",
            "c",
            "a",
            UpdatePatch::SetField {
                field: "out".to_string(),
                value: json!({"value": 2, "idempotency_key": "k2"}),
            },
            Precondition::EnvelopeKeyDiffers { field: "out".to_string(), key: "k2".to_string() },
        )
        .await
        .unwrap();
    assert!(third.matched);
}

#[tokio::test]
async fn array_precondition_dedups_appends() {
    let store = MemoryDocumentStore::new();
    store.insert_document("db", "c", json!({"_id": "a"}));
    let patch = || UpdatePatch::PushField {
        field: "log".to_string(),
        value: json!({"value": "v", "idempotency_key": "k1"}),
    };
    let pre = || Precondition::ArrayLacksKey { field: "log".to_string(), key: "k1".to_string() };

    assert!(store.update("db", "c", "a", patch(), pre()).await.unwrap().matched);
    assert!(!store.update("db", "c", "a", patch(), pre()).await.unwrap().matched);
    let doc = store.document("db", "c", "a").unwrap();
    assert_eq!(doc["log"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn merge_preserves_existing_keys() {
    let store = MemoryDocumentStore::new();
    store.insert_document("db", "c", json!({"_id": "a", "out": {"keep": true}}));
    store
        .update(
            "db",
            "c",
            "a",
            UpdatePatch::MergeField { field: "out".to_string(), value: json!({"new": 1}) },
            Precondition::None,
        )
        .await
        .unwrap();
    let doc = store.document("db", "c", "a").unwrap();
    assert_eq!(doc["out"]["keep"], true);
    assert_eq!(doc["out"]["new"], 1);
}

#[tokio::test]
async fn missing_document_reports_unmatched() {
    let store = MemoryDocumentStore::new();
    let outcome = store
        .update(
            "db",
            "c",
            "ghost",
            UpdatePatch::SetField { field: "x".to_string(), value: json!(1) },
            Precondition::None,
        )
        .await
        .unwrap();
    assert!(!outcome.matched);
}

#[tokio::test]
async fn injected_failures_surface_as_transient() {
    let store = MemoryDocumentStore::new();
    store.insert_document("db", "c", json!({"_id": "a"}));
    store.fail_next_updates(1);
    let err = store
        .update(
            "db",
            "c",
            "a",
            UpdatePatch::SetField { field: "x".to_string(), value: json!(1) },
            Precondition::None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Transient(_)));
}

#[tokio::test]
async fn upsert_and_find_round_trip() {
    let store = MemoryDocumentStore::new();
    store.upsert("ctrl", "resume_tokens", "db.c", json!({"token": "5"})).await.unwrap();
    let found = store.find("ctrl", "resume_tokens", "db.c").await.unwrap().unwrap();
    assert_eq!(found["token"], "5");
    assert_eq!(store.find("ctrl", "resume_tokens", "other").await.unwrap(), None);
}
