// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Change-feed watcher.
//!
//! One watch task per distinct watched namespace. Each received change is
//! tagged with a per-namespace sequence number and pushed into the bounded
//! handoff; the dispatcher acknowledges sequences after fan-out, and the
//! durable resume token only advances to the highest contiguously
//! acknowledged position. Crash recovery therefore replays at least every
//! unacknowledged event.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::shared::Shared;
use mc_adapters::{AgentStore, DocumentStore, KeyValueStream, ModelClient, StoreError};
use mc_core::{ChangeEvent, Clock, Execution, Namespace};

#[derive(Default)]
struct TokenWindow {
    next_seq: u64,
    /// seq → token, for staged (delivered, unacknowledged) events
    pending: BTreeMap<u64, String>,
    /// acknowledged seqs not yet contiguous with the floor
    acked: BTreeSet<u64>,
    durable: Option<String>,
    dirty: bool,
}

impl TokenWindow {
    fn advance(&mut self) {
        while let Some((&first, _)) = self.pending.first_key_value() {
            if !self.acked.remove(&first) {
                break;
            }
            self.durable = self.pending.remove(&first);
            self.dirty = true;
        }
        // Drop stale acks from before a rewind so the set stays bounded
        let floor = self.pending.first_key_value().map(|(s, _)| *s).unwrap_or(self.next_seq);
        self.acked.retain(|s| *s >= floor);
    }
}

/// Tracks resume-token durability per watcher.
#[derive(Default)]
pub struct ResumeTracker {
    windows: Mutex<HashMap<Namespace, TokenWindow>>,
}

impl ResumeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the token loaded from the control store at startup.
    pub fn seed(&self, ns: &Namespace, token: Option<String>) {
        let mut windows = self.windows.lock();
        windows.entry(ns.clone()).or_default().durable = token;
    }

    /// Stage a received event; returns its assigned sequence number.
    pub fn stage(&self, ns: &Namespace, token: String) -> u64 {
        let mut windows = self.windows.lock();
        let window = windows.entry(ns.clone()).or_default();
        let seq = window.next_seq;
        window.next_seq += 1;
        window.pending.insert(seq, token);
        seq
    }

    /// Acknowledge a sequence; the durable token advances over every
    /// contiguously acknowledged prefix.
    pub fn ack(&self, ns: &Namespace, seq: u64) {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(ns) else { return };
        window.acked.insert(seq);
        window.advance();
    }

    pub fn durable(&self, ns: &Namespace) -> Option<String> {
        self.windows.lock().get(ns).and_then(|w| w.durable.clone())
    }

    /// Drop staged state before a resubscription; replayed events will be
    /// re-staged under fresh sequence numbers.
    pub fn rewind(&self, ns: &Namespace) {
        let mut windows = self.windows.lock();
        if let Some(window) = windows.get_mut(ns) {
            window.pending.clear();
            window.acked.clear();
        }
    }

    /// Feed gap: the stored position no longer exists. Restart from "now".
    pub fn reset(&self, ns: &Namespace) {
        let mut windows = self.windows.lock();
        if let Some(window) = windows.get_mut(ns) {
            window.pending.clear();
            window.acked.clear();
            window.durable = None;
            window.dirty = false;
        }
    }

    /// Tokens that became durable since the last flush.
    pub fn take_dirty(&self) -> Vec<(Namespace, String)> {
        let mut windows = self.windows.lock();
        let mut dirty = Vec::new();
        for (ns, window) in windows.iter_mut() {
            if window.dirty {
                window.dirty = false;
                if let Some(token) = &window.durable {
                    dirty.push((ns.clone(), token.clone()));
                }
            }
        }
        dirty
    }

    /// Staged-but-unacknowledged count, for tests.
    pub fn staged(&self, ns: &Namespace) -> usize {
        self.windows.lock().get(ns).map(|w| w.pending.len()).unwrap_or(0)
    }
}

/// Reconnect backoff: `min(2^n * 200ms, 30s)`.
pub(crate) fn reconnect_backoff(attempt: u32) -> Duration {
    let millis = 200u64.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(millis.min(30_000))
}

/// Reconciliation loop: diff desired vs active subscriptions every tick.
pub(crate) async fn run_reconciler<D, S, M, A, C>(shared: Arc<Shared<D, S, M, A, C>>)
where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let mut shutdown = shared.shutdown.subscribe();
    let mut active: HashMap<Namespace, watch::Sender<bool>> = HashMap::new();
    loop {
        let desired = shared.cache.snapshot().watched_namespaces();
        active.retain(|ns, stop| {
            if desired.contains(ns) {
                true
            } else {
                tracing::info!(namespace = %ns, "stopping orphaned subscription");
                let _ = stop.send(true);
                false
            }
        });
        for ns in desired {
            if !active.contains_key(&ns) {
                let (stop_tx, stop_rx) = watch::channel(false);
                active.insert(ns.clone(), stop_tx);
                tokio::spawn(watch_namespace(Arc::clone(&shared), ns, stop_rx));
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(shared.config.reconcile_interval) => {}
            _ = shutdown.changed() => {
                for stop in active.values() {
                    let _ = stop.send(true);
                }
                return;
            }
        }
    }
}

/// One namespace's watch loop: subscribe, read, stage, hand off.
pub(crate) async fn watch_namespace<D, S, M, A, C>(
    shared: Arc<Shared<D, S, M, A, C>>,
    ns: Namespace,
    mut stop: watch::Receiver<bool>,
) where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let mut shutdown = shared.shutdown.subscribe();
    let mut attempt: u32 = 0;
    loop {
        if *stop.borrow() || *shutdown.borrow() {
            return;
        }
        let resume = shared.tracker.durable(&ns);
        shared.tracker.rewind(&ns);
        match shared.docs.subscribe(&ns.database, &ns.collection, resume).await {
            Ok(mut feed) => {
                tracing::info!(namespace = %ns, "change feed opened");
                attempt = 0;
                loop {
                    if *stop.borrow() || *shutdown.borrow() {
                        return;
                    }
                    let next = tokio::select! {
                        next = feed.next(shared.config.feed_block) => next,
                        _ = stop.changed() => return,
                        _ = shutdown.changed() => return,
                    };
                    match next {
                        Ok(Some(raw)) => {
                            let seq = shared.tracker.stage(&ns, raw.resume_token.clone());
                            let event = ChangeEvent {
                                watcher: ns.clone(),
                                seq,
                                resume_token: raw.resume_token,
                                operation: raw.operation,
                                document_id: raw.document_id,
                                full_document: raw.full_document,
                                cluster_time: raw.cluster_time,
                            };
                            // Bounded handoff: when the dispatcher lags, this
                            // send blocks and we stop reading the feed.
                            if shared.handoff.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => continue,
                        Err(StoreError::TokenInvalidated) => {
                            feed_reset(&shared, &ns).await;
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(namespace = %ns, error = %e, "change feed error");
                            break;
                        }
                    }
                }
            }
            Err(StoreError::TokenInvalidated) => {
                feed_reset(&shared, &ns).await;
            }
            Err(e) => {
                tracing::warn!(namespace = %ns, error = %e, "change feed subscribe failed");
            }
        }
        attempt += 1;
        let delay = reconnect_backoff(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => return,
            _ = shutdown.changed() => return,
        }
    }
}

/// The stored position fell off the feed. Events in the gap are lost by
/// definition; record exactly one execution per reset and restart from
/// "now".
async fn feed_reset<D, S, M, A, C>(shared: &Arc<Shared<D, S, M, A, C>>, ns: &Namespace)
where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    tracing::error!(namespace = %ns, "resume token invalidated, feed reset: restarting from now");
    shared.tracker.reset(ns);
    let now = shared.clock.epoch_ms();
    let execution = Execution::begin(format!("watch:{ns}"), "", 0, now).skip(now, "feed_reset");
    shared.ledger.record(&execution).await;
}

/// Flush loop: persist tokens that became durable, at most once per
/// interval (best-effort within a second of acknowledgement).
pub(crate) async fn run_token_flusher<D, S, M, A, C>(shared: Arc<Shared<D, S, M, A, C>>)
where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        flush_tokens(&shared).await;
        tokio::select! {
            _ = tokio::time::sleep(shared.config.token_flush_interval) => {}
            _ = shutdown.changed() => {
                // Final flush so a graceful shutdown loses nothing
                flush_tokens(&shared).await;
                return;
            }
        }
    }
}

async fn flush_tokens<D, S, M, A, C>(shared: &Arc<Shared<D, S, M, A, C>>)
where
    D: DocumentStore,
    S: KeyValueStream,
    M: ModelClient,
    A: AgentStore,
    C: Clock,
{
    for (ns, token) in shared.tracker.take_dirty() {
        let doc = json!({
            "watcher_id": ns.to_string(),
            "token": token,
            "updated_at_ms": shared.clock.epoch_ms(),
        });
        let result = shared
            .docs
            .upsert(
                &shared.config.control_db,
                &shared.config.resume_tokens_collection,
                &ns.to_string(),
                doc,
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(namespace = %ns, error = %e, "failed to persist resume token");
        }
    }
}

#[cfg(test)]
#[path = "watcher_tests.rs"]
mod tests;
