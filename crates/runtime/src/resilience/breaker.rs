// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Circuit breaker per `(agent, provider, model)`.
//!
//! Closed → open when the rolling-window error rate crosses the threshold;
//! open → half-open after a cooldown; half-open admits one probe whose
//! outcome closes the circuit or reopens it with a doubled cooldown.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::config::BreakerConfig;
use mc_core::{AgentId, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Gauge encoding: closed 0, open 1, half-open 2.
    pub fn as_gauge(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct BreakerInner {
    state: BreakerState,
    outcomes: VecDeque<bool>,
    opened_at_ms: Option<u64>,
    cooldown: Duration,
    probe_inflight: bool,
}

/// One breaker instance.
pub struct CircuitBreaker<C: Clock> {
    config: BreakerConfig,
    clock: C,
    inner: Mutex<BreakerInner>,
}

impl<C: Clock> CircuitBreaker<C> {
    pub fn new(config: BreakerConfig, clock: C) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
                opened_at_ms: None,
                cooldown,
                probe_inflight: false,
            }),
        }
    }

    /// Admission check. In half-open state at most one caller is admitted
    /// as the probe.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed_ms = inner
                    .opened_at_ms
                    .map(|at| self.clock.epoch_ms().saturating_sub(at));
                if elapsed_ms.is_some_and(|e| e >= inner.cooldown.as_millis() as u64) {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_inflight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_inflight {
                    false
                } else {
                    inner.probe_inflight = true;
                    true
                }
            }
        }
    }

    /// Record a call outcome.
    pub fn record(&self, ok: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.outcomes.push_back(ok);
                while inner.outcomes.len() > self.config.window {
                    inner.outcomes.pop_front();
                }
                if inner.outcomes.len() >= self.config.min_samples {
                    let errors = inner.outcomes.iter().filter(|o| !**o).count();
                    let rate = errors as f64 / inner.outcomes.len() as f64;
                    if rate > self.config.error_rate {
                        inner.state = BreakerState::Open;
                        inner.opened_at_ms = Some(self.clock.epoch_ms());
                        inner.outcomes.clear();
                        tracing::warn!(error_rate = rate, "circuit breaker opened");
                    }
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_inflight = false;
                if ok {
                    inner.state = BreakerState::Closed;
                    inner.cooldown = self.config.cooldown;
                    inner.outcomes.clear();
                    tracing::info!("circuit breaker closed");
                } else {
                    inner.state = BreakerState::Open;
                    inner.opened_at_ms = Some(self.clock.epoch_ms());
                    inner.cooldown = (inner.cooldown * 2).min(self.config.cooldown_cap);
                    tracing::warn!(cooldown_ms = inner.cooldown.as_millis() as u64,
                        "probe failed, circuit breaker reopened");
                }
            }
            // Outcomes landing after the breaker opened carry no signal
            BreakerState::Open => {}
        }
    }

    /// Release a half-open probe slot when the admitted call bailed before
    /// reaching the provider (no outcome to record).
    pub fn cancel_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_inflight = false;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}

/// Breakers keyed by `(agent, provider, model)`.
pub struct BreakerRegistry<C: Clock> {
    config: BreakerConfig,
    clock: C,
    breakers: Mutex<HashMap<(AgentId, String, String), Arc<CircuitBreaker<C>>>>,
}

impl<C: Clock> BreakerRegistry<C> {
    pub fn new(config: BreakerConfig, clock: C) -> Self {
        Self { config, clock, breakers: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, agent: &AgentId, provider: &str, model: &str) -> Arc<CircuitBreaker<C>> {
        let key = (agent.clone(), provider.to_string(), model.to_string());
        let mut breakers = self.breakers.lock();
        Arc::clone(breakers.entry(key).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(self.config.clone(), self.clock.clone()))
        }))
    }

    /// Worst state across an agent's breakers, for `status()`.
    pub fn agent_state(&self, agent: &AgentId) -> BreakerState {
        let breakers = self.breakers.lock();
        let mut state = BreakerState::Closed;
        for ((id, _, _), breaker) in breakers.iter() {
            if id == agent {
                let s = breaker.state();
                if s == BreakerState::Open {
                    return BreakerState::Open;
                }
                if s == BreakerState::HalfOpen {
                    state = BreakerState::HalfOpen;
                }
            }
        }
        state
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
