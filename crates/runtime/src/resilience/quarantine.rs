// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Quarantine: suspend agents that dead-letter repeatedly.
//!
//! An agent accumulating `threshold` consecutive DLQ items is quarantined:
//! the dispatcher stops enqueueing for it and workers stop consuming its
//! stream. Release is manual.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use mc_core::AgentId;

#[derive(Default)]
struct QuarantineState {
    consecutive_dlq: HashMap<AgentId, u32>,
    active: HashSet<AgentId>,
}

pub struct Quarantine {
    threshold: u32,
    state: Mutex<QuarantineState>,
}

impl Quarantine {
    pub fn new(threshold: u32) -> Self {
        Self { threshold, state: Mutex::new(QuarantineState::default()) }
    }

    /// Record a dead-lettered item. Returns true when this crossed the
    /// threshold and the agent just entered quarantine.
    pub fn record_dlq(&self, agent: &AgentId) -> bool {
        let mut state = self.state.lock();
        let count = state.consecutive_dlq.entry(agent.clone()).or_insert(0);
        *count += 1;
        if *count >= self.threshold && !state.active.contains(agent) {
            state.active.insert(agent.clone());
            tracing::error!(agent = %agent, threshold = self.threshold,
                "agent quarantined after consecutive dead-letters");
            return true;
        }
        false
    }

    /// Record a successfully processed item, resetting the streak.
    pub fn record_ok(&self, agent: &AgentId) {
        self.state.lock().consecutive_dlq.remove(agent);
    }

    pub fn is_active(&self, agent: &AgentId) -> bool {
        self.state.lock().active.contains(agent)
    }

    /// Manual release. Returns true when the agent was quarantined.
    pub fn release(&self, agent: &AgentId) -> bool {
        let mut state = self.state.lock();
        state.consecutive_dlq.remove(agent);
        state.active.remove(agent)
    }

    pub fn active_agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.state.lock().active.iter().cloned().collect();
        agents.sort();
        agents
    }
}

#[cfg(test)]
#[path = "quarantine_tests.rs"]
mod tests;
