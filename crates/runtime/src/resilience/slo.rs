// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-agent p95 latency SLO tracking.
//!
//! Samples live in a rolling window the length of the sustain period; a
//! violation fires once per episode when the p95 has been above target for
//! the whole sustain period.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use mc_core::{AgentId, Clock};

struct SloState {
    samples: VecDeque<(u64, u64)>,
    violating_since_ms: Option<u64>,
    fired: bool,
}

pub struct SloTracker<C: Clock> {
    clock: C,
    target_ms: u64,
    sustain_ms: u64,
    agents: Mutex<HashMap<AgentId, SloState>>,
}

impl<C: Clock> SloTracker<C> {
    pub fn new(target: Duration, sustain: Duration, clock: C) -> Self {
        Self {
            clock,
            target_ms: target.as_millis() as u64,
            sustain_ms: sustain.as_millis() as u64,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Record an end-to-end latency sample. Returns true when a sustained
    /// violation fires (once per episode).
    pub fn record(&self, agent: &AgentId, duration_ms: u64) -> bool {
        let now_ms = self.clock.epoch_ms();
        let cutoff = now_ms.saturating_sub(self.sustain_ms);
        let mut agents = self.agents.lock();
        let state = agents.entry(agent.clone()).or_insert_with(|| SloState {
            samples: VecDeque::new(),
            violating_since_ms: None,
            fired: false,
        });
        state.samples.push_back((now_ms, duration_ms));
        while state.samples.front().is_some_and(|(at, _)| *at < cutoff) {
            state.samples.pop_front();
        }

        let p95 = percentile_95(state.samples.iter().map(|(_, d)| *d));
        if p95 <= self.target_ms {
            state.violating_since_ms = None;
            state.fired = false;
            return false;
        }
        let since = *state.violating_since_ms.get_or_insert(now_ms);
        if !state.fired && now_ms.saturating_sub(since) >= self.sustain_ms {
            state.fired = true;
            tracing::warn!(agent = %agent, p95_ms = p95, target_ms = self.target_ms,
                "sustained latency SLO violation");
            return true;
        }
        false
    }

    /// Current p95 for an agent, for observability.
    pub fn p95_ms(&self, agent: &AgentId) -> Option<u64> {
        let agents = self.agents.lock();
        let state = agents.get(agent)?;
        if state.samples.is_empty() {
            return None;
        }
        Some(percentile_95(state.samples.iter().map(|(_, d)| *d)))
    }
}

fn percentile_95(samples: impl Iterator<Item = u64>) -> u64 {
    let mut sorted: Vec<u64> = samples.collect();
    if sorted.is_empty() {
        return 0;
    }
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
#[path = "slo_tests.rs"]
mod tests;
