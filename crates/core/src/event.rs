// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Normalized change events emitted by the watcher

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{ChangeOperation, Namespace};

/// One normalized mutation observed on a watched collection.
///
/// `seq` numbers events per watcher; the dispatcher acknowledges sequences
/// after fan-out so the watcher can advance the durable resume token to the
/// highest contiguously acknowledged position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub watcher: Namespace,
    pub seq: u64,
    pub resume_token: String,
    pub operation: ChangeOperation,
    pub document_id: String,
    /// Post-image, when the feed supplies one (absent on deletes)
    pub full_document: Option<Value>,
    pub cluster_time: Option<u64>,
}

impl ChangeEvent {
    pub fn database(&self) -> &str {
        &self.watcher.database
    }

    pub fn collection(&self) -> &str {
        &self.watcher.collection
    }
}
