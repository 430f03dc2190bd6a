// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared state handed to every pipeline task.
//!
//! Nothing module-level: one explicit handle, cloned into each task, per
//! the share-nothing-except-snapshots design.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::cache::AgentCache;
use crate::config::RuntimeConfig;
use crate::ledger::ExecutionLedger;
use crate::queue::QueueClient;
use crate::resilience::{BreakerRegistry, CostRegistry, Quarantine, RateRegistry, SloTracker};
use crate::watcher::ResumeTracker;
use mc_adapters::MetricsSink;
use mc_core::{ChangeEvent, Clock};

/// Short-window duplicate suppression for dispatched idempotency keys.
///
/// Cheap first line ahead of the durable idempotency store; halved when it
/// outgrows its cap.
pub(crate) struct RecentKeys {
    max: usize,
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl RecentKeys {
    pub(crate) fn new(max: usize) -> Self {
        Self { max, inner: Mutex::new((HashSet::new(), VecDeque::new())) }
    }

    /// Returns true when the key was already seen recently.
    pub(crate) fn check_and_insert(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.0.contains(key) {
            return true;
        }
        inner.0.insert(key.to_string());
        inner.1.push_back(key.to_string());
        while inner.1.len() > self.max {
            if let Some(old) = inner.1.pop_front() {
                inner.0.remove(&old);
            }
        }
        false
    }
}

/// Everything the pipeline tasks share.
pub(crate) struct Shared<D, S, M, A, C: Clock> {
    pub config: RuntimeConfig,
    pub docs: Arc<D>,
    pub model: Arc<M>,
    pub agents: Arc<A>,
    pub metrics: Arc<dyn MetricsSink>,
    pub clock: C,
    pub cache: AgentCache,
    pub tracker: ResumeTracker,
    pub queue: QueueClient<S, C>,
    pub kv: Arc<S>,
    pub ledger: ExecutionLedger<D>,
    pub breakers: BreakerRegistry<C>,
    pub rate: RateRegistry<C>,
    pub cost: CostRegistry<C>,
    pub quarantine: Quarantine,
    pub slo: SloTracker<C>,
    pub recent_keys: RecentKeys,
    /// Watcher → dispatcher bounded handoff
    pub handoff: mpsc::Sender<ChangeEvent>,
    pub shutdown: watch::Sender<bool>,
}
