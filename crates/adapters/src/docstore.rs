// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Document store adapter: change feeds and conditional point writes

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use mc_core::{ChangeOperation, Namespace};

/// Errors from document store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The resume token no longer identifies a position in the feed
    #[error("resume token invalidated")]
    TokenInvalidated,
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("store error: {0}")]
    Other(String),
}

/// One raw change as supplied by the feed, before watcher normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub operation: ChangeOperation,
    pub document_id: String,
    /// Post-image when available (absent on deletes)
    pub full_document: Option<Value>,
    pub resume_token: String,
    pub cluster_time: Option<u64>,
}

/// Conditional update payloads.
///
/// The store applies exactly one patch per call; the write engine maps
/// strategies onto these shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePatch {
    /// Overwrite the field
    SetField { field: String, value: Value },
    /// Object-merge into the field, preserving keys the value doesn't carry
    MergeField { field: String, value: Value },
    /// Push onto an array at the field, creating it if needed
    PushField { field: String, value: Value },
}

/// Write preconditions, evaluated atomically with the patch.
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    None,
    /// The envelope at `field` must be absent or carry a different
    /// `idempotency_key` than `key`
    EnvelopeKeyDiffers { field: String, key: String },
    /// No element of the array at `field` may carry `idempotency_key = key`
    ArrayLacksKey { field: String, key: String },
}

/// Result of a conditional update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteOutcome {
    /// Document found and precondition held
    pub matched: bool,
    pub modified: bool,
}

/// An open change-feed subscription
#[async_trait]
pub trait ChangeFeed: Send + std::fmt::Debug {
    /// Next change, waiting up to `block`. `Ok(None)` on timeout.
    async fn next(&mut self, block: Duration) -> Result<Option<RawChange>, StoreError>;
}

/// The document store the pipeline watches and writes back to
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn subscribe(
        &self,
        db: &str,
        coll: &str,
        resume_token: Option<String>,
    ) -> Result<Box<dyn ChangeFeed>, StoreError>;

    /// Single conditional update; the precondition and patch apply
    /// atomically.
    async fn update(
        &self,
        db: &str,
        coll: &str,
        doc_id: &str,
        patch: UpdatePatch,
        precondition: Precondition,
    ) -> Result<WriteOutcome, StoreError>;

    /// Upsert a whole document by id (control collections: executions,
    /// resume tokens).
    async fn upsert(&self, db: &str, coll: &str, doc_id: &str, doc: Value)
        -> Result<(), StoreError>;

    async fn find(&self, db: &str, coll: &str, doc_id: &str) -> Result<Option<Value>, StoreError>;
}

/// Extract the embedded idempotency key from a written envelope.
fn envelope_key(value: &Value) -> Option<&str> {
    value.get("idempotency_key")?.as_str()
}

fn precondition_holds(doc: &Value, precondition: &Precondition) -> bool {
    match precondition {
        Precondition::None => true,
        Precondition::EnvelopeKeyDiffers { field, key } => match doc.get(field) {
            Some(existing) => envelope_key(existing) != Some(key.as_str()),
            None => true,
        },
        Precondition::ArrayLacksKey { field, key } => match doc.get(field).and_then(Value::as_array)
        {
            Some(items) => !items.iter().any(|item| envelope_key(item) == Some(key.as_str())),
            None => true,
        },
    }
}

fn apply_patch(doc: &mut Value, patch: &UpdatePatch) {
    let Some(map) = doc.as_object_mut() else { return };
    match patch {
        UpdatePatch::SetField { field, value } => {
            map.insert(field.clone(), value.clone());
        }
        UpdatePatch::MergeField { field, value } => {
            match (map.get_mut(field).and_then(Value::as_object_mut), value.as_object()) {
                (Some(existing), Some(incoming)) => {
                    for (k, v) in incoming {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                _ => {
                    map.insert(field.clone(), value.clone());
                }
            }
        }
        UpdatePatch::PushField { field, value } => {
            match map.get_mut(field).and_then(Value::as_array_mut) {
                Some(items) => items.push(value.clone()),
                None => {
                    map.insert(field.clone(), Value::Array(vec![value.clone()]));
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct CollState {
    docs: HashMap<String, Value>,
    log: Vec<RawChange>,
    /// Successful subscriptions opened against this namespace
    subscribe_count: u64,
    /// When set, the next subscribe carrying a token fails once with
    /// `TokenInvalidated` (simulates a feed gap)
    invalidate_next_resume: bool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    collections: Mutex<HashMap<Namespace, CollState>>,
    fail_next_updates: Mutex<u32>,
    cluster: Mutex<u64>,
}

/// In-memory document store whose change feeds observe writes made through
/// the store, so loop-guard and replay behavior is testable end to end.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<MemoryInner>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document, emitting an `insert` change.
    pub fn insert_document(&self, db: &str, coll: &str, doc: Value) {
        let doc_id = doc.get("_id").and_then(Value::as_str).unwrap_or_default().to_string();
        let ns = Namespace::new(db, coll);
        let mut collections = self.inner.collections.lock();
        let state = collections.entry(ns).or_default();
        state.docs.insert(doc_id.clone(), doc.clone());
        let change = RawChange {
            operation: ChangeOperation::Insert,
            document_id: doc_id,
            full_document: Some(doc),
            resume_token: state.log.len().to_string(),
            cluster_time: Some(self.next_cluster()),
        };
        state.log.push(change);
    }

    /// Delete a document, emitting a `delete` change with no post-image.
    pub fn delete_document(&self, db: &str, coll: &str, doc_id: &str) {
        let ns = Namespace::new(db, coll);
        let mut collections = self.inner.collections.lock();
        let state = collections.entry(ns).or_default();
        state.docs.remove(doc_id);
        let change = RawChange {
            operation: ChangeOperation::Delete,
            document_id: doc_id.to_string(),
            full_document: None,
            resume_token: state.log.len().to_string(),
            cluster_time: Some(self.next_cluster()),
        };
        state.log.push(change);
    }

    /// Make the next `subscribe` with a resume token fail once, simulating
    /// a feed gap.
    pub fn invalidate_next_resume(&self, db: &str, coll: &str) {
        let ns = Namespace::new(db, coll);
        self.inner.collections.lock().entry(ns).or_default().invalidate_next_resume = true;
    }

    /// Fail the next `n` updates with a transient error.
    pub fn fail_next_updates(&self, n: u32) {
        *self.inner.fail_next_updates.lock() = n;
    }

    /// Current document content, for assertions.
    pub fn document(&self, db: &str, coll: &str, doc_id: &str) -> Option<Value> {
        let ns = Namespace::new(db, coll);
        self.inner.collections.lock().get(&ns)?.docs.get(doc_id).cloned()
    }

    /// All documents in a collection, for assertions.
    pub fn documents(&self, db: &str, coll: &str) -> Vec<Value> {
        let ns = Namespace::new(db, coll);
        self.inner
            .collections
            .lock()
            .get(&ns)
            .map(|s| s.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of change events recorded for a namespace.
    pub fn feed_len(&self, db: &str, coll: &str) -> usize {
        let ns = Namespace::new(db, coll);
        self.inner.collections.lock().get(&ns).map(|s| s.log.len()).unwrap_or(0)
    }

    /// Successful subscriptions opened so far, so tests can wait for a
    /// watcher before driving the feed.
    pub fn subscribe_count(&self, db: &str, coll: &str) -> u64 {
        let ns = Namespace::new(db, coll);
        self.inner.collections.lock().get(&ns).map(|s| s.subscribe_count).unwrap_or(0)
    }

    fn next_cluster(&self) -> u64 {
        let mut cluster = self.inner.cluster.lock();
        *cluster += 1;
        *cluster
    }
}

#[derive(Debug)]
struct MemoryFeed {
    inner: Arc<MemoryInner>,
    ns: Namespace,
    offset: usize,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn next(&mut self, block: Duration) -> Result<Option<RawChange>, StoreError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            {
                let collections = self.inner.collections.lock();
                if let Some(state) = collections.get(&self.ns) {
                    if let Some(change) = state.log.get(self.offset) {
                        self.offset += 1;
                        return Ok(Some(change.clone()));
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn subscribe(
        &self,
        db: &str,
        coll: &str,
        resume_token: Option<String>,
    ) -> Result<Box<dyn ChangeFeed>, StoreError> {
        let ns = Namespace::new(db, coll);
        let offset = {
            let mut collections = self.inner.collections.lock();
            let state = collections.entry(ns.clone()).or_default();
            let offset = match resume_token {
                Some(token) => {
                    if state.invalidate_next_resume {
                        state.invalidate_next_resume = false;
                        return Err(StoreError::TokenInvalidated);
                    }
                    let position: usize =
                        token.parse().map_err(|_| StoreError::TokenInvalidated)?;
                    position + 1
                }
                None => state.log.len(),
            };
            state.subscribe_count += 1;
            offset
        };
        Ok(Box::new(MemoryFeed { inner: Arc::clone(&self.inner), ns, offset }))
    }

    async fn update(
        &self,
        db: &str,
        coll: &str,
        doc_id: &str,
        patch: UpdatePatch,
        precondition: Precondition,
    ) -> Result<WriteOutcome, StoreError> {
        {
            let mut failures = self.inner.fail_next_updates.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(StoreError::Transient("injected update failure".to_string()));
            }
        }
        let cluster_time = self.next_cluster();
        let ns = Namespace::new(db, coll);
        let mut collections = self.inner.collections.lock();
        let Some(state) = collections.get_mut(&ns) else {
            return Ok(WriteOutcome { matched: false, modified: false });
        };
        let Some(doc) = state.docs.get_mut(doc_id) else {
            return Ok(WriteOutcome { matched: false, modified: false });
        };
        if !precondition_holds(doc, &precondition) {
            return Ok(WriteOutcome { matched: false, modified: false });
        }
        apply_patch(doc, &patch);
        let change = RawChange {
            operation: ChangeOperation::Update,
            document_id: doc_id.to_string(),
            full_document: Some(doc.clone()),
            resume_token: state.log.len().to_string(),
            cluster_time: Some(cluster_time),
        };
        state.log.push(change);
        Ok(WriteOutcome { matched: true, modified: true })
    }

    async fn upsert(
        &self,
        db: &str,
        coll: &str,
        doc_id: &str,
        doc: Value,
    ) -> Result<(), StoreError> {
        let ns = Namespace::new(db, coll);
        let mut collections = self.inner.collections.lock();
        let state = collections.entry(ns).or_default();
        state.docs.insert(doc_id.to_string(), doc);
        Ok(())
    }

    async fn find(&self, db: &str, coll: &str, doc_id: &str) -> Result<Option<Value>, StoreError> {
        let ns = Namespace::new(db, coll);
        Ok(self.inner.collections.lock().get(&ns).and_then(|s| s.docs.get(doc_id).cloned()))
    }
}

#[cfg(test)]
#[path = "docstore_tests.rs"]
mod tests;
