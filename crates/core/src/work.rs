// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue work items

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::{AgentId, ChangeOperation};
use crate::WorkItemId;

/// What put a work item on the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Change,
    Webhook,
    Retry,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Change => f.write_str("change"),
            Trigger::Webhook => f.write_str("webhook"),
            Trigger::Retry => f.write_str("retry"),
        }
    }
}

/// A unit of work queued for one agent on one document snapshot.
///
/// The queue assigns its own entry id on produce; `work_id` identifies the
/// logical item across nack/redelivery copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub work_id: WorkItemId,
    pub agent_id: AgentId,
    pub agent_revision: u64,
    pub document_id: String,
    pub document: Value,
    pub operation: ChangeOperation,
    pub enqueued_at_ms: u64,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
    pub trigger: Trigger,
    pub idempotency_key: String,
    /// Earliest epoch-ms at which the item may be processed (retry delay)
    #[serde(default)]
    pub not_before_ms: u64,
}

impl WorkItem {
    /// Copy for redelivery with the attempt counter bumped.
    pub fn retry(&self, not_before_ms: u64) -> WorkItem {
        WorkItem {
            attempt: self.attempt + 1,
            trigger: Trigger::Retry,
            not_before_ms,
            ..self.clone()
        }
    }

    /// Copy for redelivery without counting an attempt (admission refusals
    /// are not attempts).
    pub fn requeue(&self, not_before_ms: u64) -> WorkItem {
        WorkItem { not_before_ms, ..self.clone() }
    }
}

#[cfg(test)]
#[path = "work_tests.rs"]
mod tests;
