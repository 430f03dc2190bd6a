// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue client over the stream backend.
//!
//! One stream per agent (`agent:<id>`) with a parallel dead-letter stream
//! (`agent:<id>:dlq`) and a single consumer group per agent. Redelivery
//! with delay has no native backend support, so `nack` appends a
//! replacement copy stamped `not_before` and acknowledges the original
//! only after the re-add lands; a crash in between leaves the original
//! pending for `claim_pending`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use mc_adapters::{KeyValueStream, StreamError};
use mc_core::{AgentId, Clock, ErrorTag, WorkItem};

/// The single consumer group name used on every agent stream.
pub const GROUP: &str = "workers";

/// Entry on a dead-letter stream, with origin metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub item: WorkItem,
    pub reason: ErrorTag,
    pub message: String,
    pub origin_stream: String,
    pub failed_at_ms: u64,
}

pub fn stream_name(agent_id: &AgentId) -> String {
    format!("agent:{agent_id}")
}

pub fn dlq_name(agent_id: &AgentId) -> String {
    format!("agent:{agent_id}:dlq")
}

/// Produce / consume / ack / nack / claim / dead-letter over the backend.
pub struct QueueClient<S, C> {
    stream: Arc<S>,
    clock: C,
    stream_max_len: u64,
    dlq_max_len: u64,
}

impl<S: KeyValueStream, C: Clock> QueueClient<S, C> {
    pub fn new(stream: Arc<S>, clock: C, stream_max_len: u64, dlq_max_len: u64) -> Self {
        Self { stream, clock, stream_max_len, dlq_max_len }
    }

    /// Append a work item; trims the stream to its length cap.
    pub async fn produce(&self, item: &WorkItem) -> Result<String, StreamError> {
        let payload =
            serde_json::to_string(item).map_err(|e| StreamError::Other(e.to_string()))?;
        let name = stream_name(&item.agent_id);
        let id = self.stream.xadd(&name, &payload).await?;
        self.stream.xtrim(&name, self.stream_max_len).await?;
        tracing::debug!(
            agent = %item.agent_id,
            item = %item.work_id,
            entry = %id,
            attempt = item.attempt,
            "produced work item"
        );
        Ok(id)
    }

    /// Deliver up to `count` items for one agent. Malformed payloads are
    /// acknowledged and dropped so they cannot wedge the stream.
    pub async fn consume(
        &self,
        agent_id: &AgentId,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(String, WorkItem)>, StreamError> {
        let name = stream_name(agent_id);
        let entries = self.stream.xreadgroup(&name, GROUP, consumer, count, block).await?;
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_str::<WorkItem>(&entry.payload) {
                Ok(item) => items.push((entry.id, item)),
                Err(e) => {
                    tracing::warn!(stream = %name, entry = %entry.id, error = %e,
                        "dropping malformed queue payload");
                    self.stream.xack(&name, GROUP, &entry.id).await?;
                }
            }
        }
        Ok(items)
    }

    pub async fn ack(&self, agent_id: &AgentId, entry_id: &str) -> Result<(), StreamError> {
        self.stream.xack(&stream_name(agent_id), GROUP, entry_id).await
    }

    /// Schedule redelivery: append the replacement, then acknowledge the
    /// original.
    pub async fn nack(
        &self,
        agent_id: &AgentId,
        entry_id: &str,
        replacement: &WorkItem,
    ) -> Result<(), StreamError> {
        self.produce(replacement).await?;
        self.ack(agent_id, entry_id).await
    }

    /// Reassign items whose consumer has gone quiet.
    pub async fn claim_pending(
        &self,
        agent_id: &AgentId,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<(String, WorkItem)>, StreamError> {
        let name = stream_name(agent_id);
        let entries = self.stream.xclaim(&name, GROUP, consumer, min_idle, count).await?;
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_str::<WorkItem>(&entry.payload) {
                Ok(item) => items.push((entry.id, item)),
                Err(e) => {
                    tracing::warn!(stream = %name, entry = %entry.id, error = %e,
                        "dropping malformed claimed payload");
                    self.stream.xack(&name, GROUP, &entry.id).await?;
                }
            }
        }
        Ok(items)
    }

    /// Append to the agent's dead-letter stream with origin metadata.
    pub async fn dlq_push(
        &self,
        item: &WorkItem,
        reason: ErrorTag,
        message: &str,
    ) -> Result<(), StreamError> {
        let entry = DlqEntry {
            item: item.clone(),
            reason,
            message: message.to_string(),
            origin_stream: stream_name(&item.agent_id),
            failed_at_ms: self.clock.epoch_ms(),
        };
        let payload =
            serde_json::to_string(&entry).map_err(|e| StreamError::Other(e.to_string()))?;
        let name = dlq_name(&item.agent_id);
        self.stream.xadd(&name, &payload).await?;
        self.stream.xtrim(&name, self.dlq_max_len).await?;
        tracing::warn!(
            agent = %item.agent_id,
            item = %item.work_id,
            reason = %reason,
            "work item dead-lettered"
        );
        Ok(())
    }

    /// `(stream length, unacknowledged)` for one agent's work stream.
    pub async fn depth(&self, agent_id: &AgentId) -> Result<(u64, u64), StreamError> {
        let name = stream_name(agent_id);
        let len = self.stream.xlen(&name).await?;
        let pending = self.stream.xpending(&name, GROUP).await?;
        Ok((len, pending))
    }

    pub async fn dlq_depth(&self, agent_id: &AgentId) -> Result<u64, StreamError> {
        self.stream.xlen(&dlq_name(agent_id)).await
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
