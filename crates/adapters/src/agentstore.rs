// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent store adapter: CRUD with revision bumping and change notifications

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::docstore::StoreError;
use mc_core::{AgentError, AgentId, AgentSpec};

/// Store-side mutation notifications
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStoreEvent {
    Created(AgentId),
    Updated(AgentId),
    Deleted(AgentId),
}

/// Owner of agent definitions. The runtime only reads; mutation is the
/// management surface's job.
#[async_trait]
pub trait AgentStore: Send + Sync + 'static {
    async fn list_enabled(&self) -> Result<Vec<AgentSpec>, StoreError>;

    /// All definitions including disabled ones (the cache needs revisions
    /// of disabled agents to resolve stale in-flight work).
    async fn list_all(&self) -> Result<Vec<AgentSpec>, StoreError>;

    async fn get(&self, id: &AgentId) -> Result<Option<AgentSpec>, StoreError>;

    /// Subscribe to mutation notifications. Each subscriber gets every
    /// event from the moment of subscription.
    fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<AgentStoreEvent>;
}

#[derive(Default)]
struct MemoryAgentState {
    agents: HashMap<AgentId, AgentSpec>,
    subscribers: Vec<mpsc::UnboundedSender<AgentStoreEvent>>,
}

/// In-memory agent store. Mutations validate the spec, bump the revision,
/// and notify subscribers.
#[derive(Default)]
pub struct MemoryAgentStore {
    state: Mutex<MemoryAgentState>,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update an agent. Revision is forced monotonic: updates get
    /// `existing.revision + 1` regardless of what the caller supplied.
    pub fn put(&self, mut spec: AgentSpec) -> Result<u64, AgentError> {
        spec.validate()?;
        let mut state = self.state.lock();
        let event = match state.agents.get(&spec.id) {
            Some(existing) => {
                spec.revision = existing.revision + 1;
                AgentStoreEvent::Updated(spec.id.clone())
            }
            None => AgentStoreEvent::Created(spec.id.clone()),
        };
        let revision = spec.revision;
        state.agents.insert(spec.id.clone(), spec);
        Self::broadcast(&mut state, event);
        Ok(revision)
    }

    pub fn delete(&self, id: &AgentId) -> bool {
        let mut state = self.state.lock();
        let removed = state.agents.remove(id).is_some();
        if removed {
            Self::broadcast(&mut state, AgentStoreEvent::Deleted(id.clone()));
        }
        removed
    }

    pub fn set_enabled(&self, id: &AgentId, enabled: bool) -> bool {
        let mut state = self.state.lock();
        let Some(spec) = state.agents.get_mut(id) else { return false };
        if spec.enabled != enabled {
            spec.enabled = enabled;
            spec.revision += 1;
        }
        Self::broadcast(&mut state, AgentStoreEvent::Updated(id.clone()));
        true
    }

    fn broadcast(state: &mut MemoryAgentState, event: AgentStoreEvent) {
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn list_enabled(&self) -> Result<Vec<AgentSpec>, StoreError> {
        Ok(self.state.lock().agents.values().filter(|a| a.enabled).cloned().collect())
    }

    async fn list_all(&self) -> Result<Vec<AgentSpec>, StoreError> {
        Ok(self.state.lock().agents.values().cloned().collect())
    }

    async fn get(&self, id: &AgentId) -> Result<Option<AgentSpec>, StoreError> {
        Ok(self.state.lock().agents.get(id).cloned())
    }

    fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<AgentStoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
#[path = "agentstore_tests.rs"]
mod tests;
