// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable stream adapter with consumer-group semantics plus TTL keys.
//!
//! Mirrors the stream-database operation set the queue is built on:
//! `xadd`/`xreadgroup`/`xack`/`xclaim`/`xlen`/`xpending`/`xtrim` and
//! `set_with_ttl`/`get`/`setnx`/`del`. Each entry is delivered to exactly
//! one consumer in a group until acknowledged; unacknowledged entries age
//! and can be claimed by other consumers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use mc_core::Clock;

/// Errors from stream operations
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream unavailable: {0}")]
    Unavailable(String),
    #[error("stream error: {0}")]
    Other(String),
}

/// One delivered stream entry
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
    /// How many times this entry has been delivered to any consumer
    pub delivery_count: u32,
}

/// Durable stream + TTL key-value operations
#[async_trait]
pub trait KeyValueStream: Send + Sync + 'static {
    /// Append to a stream; returns the entry id.
    async fn xadd(&self, stream: &str, payload: &str) -> Result<String, StreamError>;

    /// Deliver up to `count` new entries to `consumer` within `group`,
    /// blocking up to `block` when none are ready.
    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Acknowledge an entry; it leaves the pending list.
    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError>;

    /// Reassign pending entries idle for at least `min_idle` to `consumer`.
    async fn xclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    async fn xlen(&self, stream: &str) -> Result<u64, StreamError>;

    /// Number of delivered-but-unacknowledged entries in the group.
    async fn xpending(&self, stream: &str, group: &str) -> Result<u64, StreamError>;

    /// Drop oldest entries beyond `max_len`; returns how many were dropped.
    async fn xtrim(&self, stream: &str, max_len: u64) -> Result<u64, StreamError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StreamError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StreamError>;

    /// Set if absent (or expired). Returns true when the key was set.
    async fn setnx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StreamError>;

    async fn del(&self, key: &str) -> Result<(), StreamError>;
}

struct PendingEntry {
    payload: String,
    consumer: String,
    delivered_at_ms: u64,
    delivery_count: u32,
}

#[derive(Default)]
struct GroupState {
    /// Absolute sequence of the next undelivered entry
    cursor: u64,
    pending: HashMap<String, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    /// (absolute sequence, payload); the front may be trimmed away
    entries: VecDeque<(u64, String)>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct KvEntry {
    value: String,
    expires_at_ms: u64,
}

struct MemoryState {
    streams: HashMap<String, StreamState>,
    kv: HashMap<String, KvEntry>,
}

/// In-memory stream backend with real consumer-group semantics, driven by a
/// [`Clock`] so idle times and TTLs are controllable in tests.
#[derive(Clone)]
pub struct MemoryStream<C: Clock> {
    state: Arc<Mutex<MemoryState>>,
    clock: C,
}

impl<C: Clock> MemoryStream<C> {
    pub fn new(clock: C) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                streams: HashMap::new(),
                kv: HashMap::new(),
            })),
            clock,
        }
    }

    /// Consumer currently holding a pending entry, for assertions.
    pub fn pending_consumer(&self, stream: &str, group: &str, id: &str) -> Option<String> {
        let state = self.state.lock();
        state
            .streams
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(id)
            .map(|p| p.consumer.clone())
    }

    fn read_ready(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<StreamEntry> {
        let now_ms = self.clock.epoch_ms();
        let mut state = self.state.lock();
        let StreamState { entries, groups, .. } =
            state.streams.entry(stream.to_string()).or_default();
        let group_state = groups.entry(group.to_string()).or_default();
        let mut delivered = Vec::new();
        for (seq, payload) in entries.iter() {
            if delivered.len() >= count {
                break;
            }
            if *seq < group_state.cursor {
                continue;
            }
            let id = seq.to_string();
            group_state.cursor = *seq + 1;
            group_state.pending.insert(
                id.clone(),
                PendingEntry {
                    payload: payload.clone(),
                    consumer: consumer.to_string(),
                    delivered_at_ms: now_ms,
                    delivery_count: 1,
                },
            );
            delivered.push(StreamEntry { id, payload: payload.clone(), delivery_count: 1 });
        }
        delivered
    }
}

#[async_trait]
impl<C: Clock> KeyValueStream for MemoryStream<C> {
    async fn xadd(&self, stream: &str, payload: &str) -> Result<String, StreamError> {
        let mut state = self.state.lock();
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        let seq = stream_state.next_seq;
        stream_state.next_seq += 1;
        stream_state.entries.push_back((seq, payload.to_string()));
        Ok(seq.to_string())
    }

    async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let delivered = self.read_ready(stream, group, consumer, count);
            if !delivered.is_empty() {
                return Ok(delivered);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        if let Some(stream_state) = state.streams.get_mut(stream) {
            if let Some(group_state) = stream_state.groups.get_mut(group) {
                group_state.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn xclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let now_ms = self.clock.epoch_ms();
        let min_idle_ms = min_idle.as_millis() as u64;
        let mut state = self.state.lock();
        let mut claimed = Vec::new();
        if let Some(stream_state) = state.streams.get_mut(stream) {
            if let Some(group_state) = stream_state.groups.get_mut(group) {
                let mut ids: Vec<String> = group_state
                    .pending
                    .iter()
                    .filter(|(_, p)| now_ms.saturating_sub(p.delivered_at_ms) >= min_idle_ms)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
                for id in ids.into_iter().take(count) {
                    if let Some(pending) = group_state.pending.get_mut(&id) {
                        pending.consumer = consumer.to_string();
                        pending.delivered_at_ms = now_ms;
                        pending.delivery_count += 1;
                        claimed.push(StreamEntry {
                            id: id.clone(),
                            payload: pending.payload.clone(),
                            delivery_count: pending.delivery_count,
                        });
                    }
                }
            }
        }
        Ok(claimed)
    }

    async fn xlen(&self, stream: &str) -> Result<u64, StreamError> {
        let state = self.state.lock();
        Ok(state.streams.get(stream).map(|s| s.entries.len() as u64).unwrap_or(0))
    }

    async fn xpending(&self, stream: &str, group: &str) -> Result<u64, StreamError> {
        let state = self.state.lock();
        Ok(state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn xtrim(&self, stream: &str, max_len: u64) -> Result<u64, StreamError> {
        let mut state = self.state.lock();
        let Some(stream_state) = state.streams.get_mut(stream) else { return Ok(0) };
        let mut dropped = 0;
        while stream_state.entries.len() as u64 > max_len {
            stream_state.entries.pop_front();
            dropped += 1;
        }
        Ok(dropped)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StreamError> {
        let expires_at_ms = self.clock.epoch_ms() + ttl.as_millis() as u64;
        let mut state = self.state.lock();
        state
            .kv
            .insert(key.to_string(), KvEntry { value: value.to_string(), expires_at_ms });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StreamError> {
        let now_ms = self.clock.epoch_ms();
        let mut state = self.state.lock();
        match state.kv.get(key) {
            Some(entry) if entry.expires_at_ms > now_ms => Ok(Some(entry.value.clone())),
            Some(_) => {
                state.kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn setnx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StreamError> {
        let now_ms = self.clock.epoch_ms();
        let mut state = self.state.lock();
        let live = state.kv.get(key).is_some_and(|entry| entry.expires_at_ms > now_ms);
        if live {
            return Ok(false);
        }
        state.kv.insert(
            key.to_string(),
            KvEntry { value: value.to_string(), expires_at_ms: now_ms + ttl.as_millis() as u64 },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), StreamError> {
        self.state.lock().kv.remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
