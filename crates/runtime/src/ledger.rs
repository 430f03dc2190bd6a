// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution ledger: best-effort persistence of execution records into the
//! control store, plus in-memory last-execution tracking for `status()`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use mc_adapters::DocumentStore;
use mc_core::Execution;

pub struct ExecutionLedger<D> {
    store: Arc<D>,
    database: String,
    collection: String,
    last_execution_ms: Mutex<HashMap<String, u64>>,
}

impl<D: DocumentStore> ExecutionLedger<D> {
    pub fn new(store: Arc<D>, database: String, collection: String) -> Self {
        Self { store, database, collection, last_execution_ms: Mutex::new(HashMap::new()) }
    }

    /// Upsert a record by execution id. Ledger failures are logged, never
    /// propagated: auditability must not stall the stream.
    pub async fn record(&self, execution: &Execution) {
        if execution.completed_at_ms > 0 {
            self.last_execution_ms
                .lock()
                .insert(execution.agent_id.clone(), execution.completed_at_ms);
        }
        let doc = match serde_json::to_value(execution) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(execution = %execution.id, error = %e,
                    "failed to serialize execution record");
                return;
            }
        };
        if let Err(e) = self
            .store
            .upsert(&self.database, &self.collection, execution.id.as_str(), doc)
            .await
        {
            tracing::warn!(execution = %execution.id, error = %e,
                "failed to persist execution record");
        }
    }

    pub fn last_execution_at(&self, agent_id: &str) -> Option<u64> {
        self.last_execution_ms.lock().get(agent_id).copied()
    }
}
