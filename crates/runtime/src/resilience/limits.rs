// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admission limits: per-agent token buckets and rolling cost windows

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use mc_core::{AgentId, Clock};

/// Token bucket: capacity = requests per minute, refilled continuously at
/// capacity/60 per second. Non-blocking; a failed acquire is an admission
/// refusal, not a wait.
pub struct TokenBucket<C: Clock> {
    clock: C,
    capacity: f64,
    refill_per_sec: f64,
    /// (available tokens, last refill epoch-ms)
    inner: Mutex<(f64, u64)>,
}

impl<C: Clock> TokenBucket<C> {
    pub fn new(per_minute: u32, clock: C) -> Self {
        let capacity = per_minute as f64;
        let now_ms = clock.epoch_ms();
        Self {
            clock,
            capacity,
            refill_per_sec: capacity / 60.0,
            inner: Mutex::new((capacity, now_ms)),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        if inner.0 >= 1.0 {
            inner.0 -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> f64 {
        let mut inner = self.inner.lock();
        self.refill(&mut inner);
        inner.0
    }

    fn refill(&self, inner: &mut (f64, u64)) {
        let now_ms = self.clock.epoch_ms();
        let elapsed_secs = now_ms.saturating_sub(inner.1) as f64 / 1000.0;
        inner.0 = (inner.0 + elapsed_secs * self.refill_per_sec).min(self.capacity);
        inner.1 = now_ms;
    }
}

/// Per-agent rate limiters. Buckets are rebuilt when the configured limit
/// changes (agent revision bumps).
pub struct RateRegistry<C: Clock> {
    clock: C,
    buckets: Mutex<HashMap<AgentId, (u32, Arc<TokenBucket<C>>)>>,
}

impl<C: Clock> RateRegistry<C> {
    pub fn new(clock: C) -> Self {
        Self { clock, buckets: Mutex::new(HashMap::new()) }
    }

    /// Admission check. Agents without a configured limit always pass.
    pub fn admit(&self, agent: &AgentId, per_minute: Option<u32>) -> bool {
        let Some(per_minute) = per_minute else { return true };
        let mut buckets = self.buckets.lock();
        let entry = buckets.entry(agent.clone()).or_insert_with(|| {
            (per_minute, Arc::new(TokenBucket::new(per_minute, self.clock.clone())))
        });
        if entry.0 != per_minute {
            *entry = (per_minute, Arc::new(TokenBucket::new(per_minute, self.clock.clone())));
        }
        let bucket = Arc::clone(&entry.1);
        drop(buckets);
        bucket.try_acquire()
    }
}

struct CostWindow {
    samples: VecDeque<(u64, f64)>,
}

/// Rolling 1-hour cost accounting per agent. Admission is denied when the
/// window total plus the projected next-call cost (running average) would
/// exceed the hourly limit.
pub struct CostRegistry<C: Clock> {
    clock: C,
    window_ms: u64,
    windows: Mutex<HashMap<AgentId, CostWindow>>,
}

impl<C: Clock> CostRegistry<C> {
    pub fn new(clock: C) -> Self {
        Self { clock, window_ms: 60 * 60 * 1000, windows: Mutex::new(HashMap::new()) }
    }

    pub fn admit(&self, agent: &AgentId, limit_usd_per_hour: Option<f64>) -> bool {
        let Some(limit) = limit_usd_per_hour else { return true };
        let now_ms = self.clock.epoch_ms();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(agent.clone())
            .or_insert_with(|| CostWindow { samples: VecDeque::new() });
        let cutoff = now_ms.saturating_sub(self.window_ms);
        while window.samples.front().is_some_and(|(at, _)| *at < cutoff) {
            window.samples.pop_front();
        }
        let spent: f64 = window.samples.iter().map(|(_, cost)| cost).sum();
        if window.samples.is_empty() {
            return spent < limit;
        }
        let projected = spent / window.samples.len() as f64;
        spent + projected <= limit
    }

    pub fn record(&self, agent: &AgentId, cost_usd: f64) {
        let now_ms = self.clock.epoch_ms();
        let mut windows = self.windows.lock();
        let window = windows
            .entry(agent.clone())
            .or_insert_with(|| CostWindow { samples: VecDeque::new() });
        window.samples.push_back((now_ms, cost_usd));
    }

    /// Window total, for observability.
    pub fn spent(&self, agent: &AgentId) -> f64 {
        let now_ms = self.clock.epoch_ms();
        let cutoff = now_ms.saturating_sub(self.window_ms);
        let windows = self.windows.lock();
        windows
            .get(agent)
            .map(|w| w.samples.iter().filter(|(at, _)| *at >= cutoff).map(|(_, c)| c).sum())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
#[path = "limits_tests.rs"]
mod tests;
