// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Write engine: merge / replace / append as single conditional updates.
//!
//! Every strategy embeds the result in an envelope carrying the agent
//! identity, revision, and idempotency key. The precondition asserts the
//! existing envelope (if any) carries a different key, so a duplicate
//! write degrades to a no-op reported as `written = false`.

use serde_json::{json, Value};

use mc_adapters::{DocumentStore, Precondition, StoreError, UpdatePatch};
use mc_core::{ErrorTag, WriteSpec, WriteStrategy};

/// One write-back request.
pub struct WriteRequest<'a> {
    pub database: &'a str,
    pub collection: &'a str,
    pub document_id: &'a str,
    pub agent_id: &'a str,
    pub agent_revision: u64,
    pub idempotency_key: &'a str,
    pub executed_at_ms: u64,
    pub value: Value,
}

/// Wrap a result value in the loop-guard envelope.
pub fn envelope(req: &WriteRequest<'_>, include_metadata: bool) -> Value {
    if !include_metadata {
        return req.value.clone();
    }
    json!({
        "value": req.value,
        "agent_id": req.agent_id,
        "agent_revision": req.agent_revision,
        "executed_at_ms": req.executed_at_ms,
        "idempotency_key": req.idempotency_key,
    })
}

/// Perform the write. `Ok(true)` when the document changed, `Ok(false)`
/// when the precondition made it a no-op (duplicate key or missing
/// document). Store failures map onto the error taxonomy.
pub async fn write_result<D: DocumentStore>(
    store: &D,
    spec: &WriteSpec,
    req: &WriteRequest<'_>,
) -> Result<bool, (ErrorTag, String)> {
    let wrapped = envelope(req, spec.include_metadata);
    let field = spec.target_field.clone();
    let key = req.idempotency_key.to_string();
    let (patch, precondition) = match spec.strategy {
        WriteStrategy::Merge => (
            UpdatePatch::MergeField { field: field.clone(), value: wrapped },
            Precondition::EnvelopeKeyDiffers { field, key },
        ),
        WriteStrategy::Replace => (
            UpdatePatch::SetField { field: field.clone(), value: wrapped },
            Precondition::EnvelopeKeyDiffers { field, key },
        ),
        WriteStrategy::Append => (
            UpdatePatch::PushField { field: field.clone(), value: wrapped },
            Precondition::ArrayLacksKey { field, key },
        ),
    };

    let outcome = store
        .update(req.database, req.collection, req.document_id, patch, precondition)
        .await
        .map_err(|e| match e {
            StoreError::Transient(msg) => (ErrorTag::TransientWriteError, msg),
            other => (ErrorTag::TransientWriteError, other.to_string()),
        })?;

    Ok(outcome.matched && outcome.modified)
}

#[cfg(test)]
#[path = "write_tests.rs"]
mod tests;
