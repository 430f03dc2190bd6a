// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Read-copy-update agent cache.
//!
//! The cache holds an immutable snapshot of every known agent with its
//! filter and templates precompiled. Readers grab the `Arc` and never
//! block; the refresher builds a whole new snapshot and swaps the pointer.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use mc_core::{AgentId, AgentSpec, FilterExpr, Namespace, Template};

/// One agent with its compiled artifacts.
///
/// A definition that fails to compile is kept with `config_error` set so
/// the dispatcher can record a `configuration_error` skip instead of
/// silently dropping events.
#[derive(Debug)]
pub struct CachedAgent {
    pub spec: AgentSpec,
    pub filter: Option<FilterExpr>,
    pub prompt: Option<Template>,
    pub system_prompt: Option<Template>,
    pub idempotency_key: Option<Template>,
    pub config_error: Option<String>,
}

impl CachedAgent {
    fn compile(spec: AgentSpec) -> Self {
        let mut config_error = None;
        let mut fail = |what: &str, err: String| {
            if config_error.is_none() {
                config_error = Some(format!("{what}: {err}"));
            }
        };

        let filter = match &spec.watch.filter {
            Some(doc) => match FilterExpr::parse(doc) {
                Ok(expr) => Some(expr),
                Err(e) => {
                    fail("watch.filter", e.to_string());
                    None
                }
            },
            None => None,
        };
        let prompt = match Template::parse(&spec.ai.prompt) {
            Ok(t) => Some(t),
            Err(e) => {
                fail("ai.prompt", e.to_string());
                None
            }
        };
        let system_prompt = match &spec.ai.system_prompt {
            Some(source) => match Template::parse(source) {
                Ok(t) => Some(t),
                Err(e) => {
                    fail("ai.system_prompt", e.to_string());
                    None
                }
            },
            None => None,
        };
        let idempotency_key = match Template::parse(spec.write.idempotency_template()) {
            Ok(t) => Some(t),
            Err(e) => {
                fail("write.idempotency_key", e.to_string());
                None
            }
        };

        Self { spec, filter, prompt, system_prompt, idempotency_key, config_error }
    }
}

/// Immutable view of all known agents at one point in time.
#[derive(Default)]
pub struct AgentSnapshot {
    agents: HashMap<AgentId, Arc<CachedAgent>>,
    /// Enabled agents indexed by watched namespace
    by_namespace: HashMap<Namespace, Vec<AgentId>>,
}

impl AgentSnapshot {
    pub fn build(specs: Vec<AgentSpec>) -> Self {
        let mut agents = HashMap::with_capacity(specs.len());
        let mut by_namespace: HashMap<Namespace, Vec<AgentId>> = HashMap::new();
        for spec in specs {
            let id = spec.id.clone();
            if spec.enabled {
                by_namespace.entry(spec.namespace()).or_default().push(id.clone());
            }
            agents.insert(id, Arc::new(CachedAgent::compile(spec)));
        }
        for ids in by_namespace.values_mut() {
            ids.sort();
        }
        Self { agents, by_namespace }
    }

    pub fn get(&self, id: &AgentId) -> Option<&Arc<CachedAgent>> {
        self.agents.get(id)
    }

    /// Enabled agents watching a namespace, in stable order.
    pub fn agents_for(&self, namespace: &Namespace) -> &[AgentId] {
        self.by_namespace.get(namespace).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The set of namespaces that must have an active subscription.
    pub fn watched_namespaces(&self) -> Vec<Namespace> {
        let mut namespaces: Vec<Namespace> = self.by_namespace.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    /// Enabled agent ids in stable order (worker round-robin order).
    pub fn enabled_agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .agents
            .values()
            .filter(|a| a.spec.enabled)
            .map(|a| a.spec.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Live revision of an agent, `None` once deleted (the tombstone).
    pub fn live_revision(&self, id: &AgentId) -> Option<u64> {
        self.agents.get(id).map(|a| a.spec.revision)
    }

    /// Every known agent, enabled or not, in stable order.
    pub fn all_agents(&self) -> Vec<Arc<CachedAgent>> {
        let mut agents: Vec<Arc<CachedAgent>> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Shared snapshot pointer.
#[derive(Clone, Default)]
pub struct AgentCache {
    current: Arc<RwLock<Arc<AgentSnapshot>>>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<AgentSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn install(&self, snapshot: AgentSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
