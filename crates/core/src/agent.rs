// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative agent definitions and validation

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::filter::FilterExpr;
use crate::template::Template;

/// Default idempotency key template: stable across replays of the same
/// document for the same agent revision.
pub const DEFAULT_IDEMPOTENCY_TEMPLATE: &str =
    "{{ document_id }}:{{ agent_id }}:{{ agent_revision }}";

/// Agent IDs that may never be claimed by user configuration.
const RESERVED_IDS: [&str; 5] = ["system", "admin", "root", "default", "all"];

/// Errors raised while validating an agent definition
#[derive(Debug, Error, PartialEq)]
pub enum AgentError {
    #[error("invalid agent id {0:?}: {1}")]
    InvalidId(String, String),
    #[error("agent {0}: {1}")]
    Invalid(String, String),
}

/// Unique, user-chosen agent identifier.
///
/// Lowercase slug, 1-64 characters of `[a-z0-9_-]`, starting and ending
/// alphanumeric. Reserved names are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Result<Self, AgentError> {
        let id = id.into();
        Self::check(&id)?;
        Ok(Self(id))
    }

    /// Construct without validation, for values loaded from the store.
    pub fn from_store(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn check(id: &str) -> Result<(), AgentError> {
        let err = |why: &str| AgentError::InvalidId(id.to_string(), why.to_string());
        if id.is_empty() || id.len() > 64 {
            return Err(err("must be 1-64 characters"));
        }
        if !id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(err("only [a-z0-9_-] allowed"));
        }
        let first = id.as_bytes()[0];
        let last = id.as_bytes()[id.len() - 1];
        if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return Err(err("must start and end alphanumeric"));
        }
        if RESERVED_IDS.contains(&id) {
            return Err(err("reserved name"));
        }
        Ok(())
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for AgentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A watched `(database, collection)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self { database: database.into(), collection: collection.into() }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Change feed operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Replace,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Replace => "replace",
            ChangeOperation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What store changes the agent reacts to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchSpec {
    pub database: String,
    pub collection: String,
    #[serde(default = "default_operations")]
    pub operations: Vec<ChangeOperation>,
    /// Store-filter document matched against the post-image
    #[serde(default)]
    pub filter: Option<Value>,
}

fn default_operations() -> Vec<ChangeOperation> {
    vec![ChangeOperation::Insert, ChangeOperation::Update]
}

impl WatchSpec {
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.database.clone(), self.collection.clone())
    }
}

/// Model invocation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
    /// Prompt template (restricted expression grammar)
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Optional JSON schema the response must satisfy
    #[serde(default)]
    pub response_schema: Option<Value>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

/// Write-back strategy for model results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    #[default]
    Merge,
    Replace,
    Append,
}

impl std::fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteStrategy::Merge => f.write_str("merge"),
            WriteStrategy::Replace => f.write_str("replace"),
            WriteStrategy::Append => f.write_str("append"),
        }
    }
}

/// How results are written back to the source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSpec {
    #[serde(default)]
    pub strategy: WriteStrategy,
    #[serde(default = "default_target_field")]
    pub target_field: String,
    /// Template for the idempotency key. Defaults to
    /// [`DEFAULT_IDEMPOTENCY_TEMPLATE`] when absent.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
}

fn default_target_field() -> String {
    "ai_result".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for WriteSpec {
    fn default() -> Self {
        Self {
            strategy: WriteStrategy::Merge,
            target_field: default_target_field(),
            idempotency_key: None,
            include_metadata: true,
        }
    }
}

impl WriteSpec {
    /// The idempotency key template source, falling back to the default.
    pub fn idempotency_template(&self) -> &str {
        self.idempotency_key.as_deref().unwrap_or(DEFAULT_IDEMPOTENCY_TEMPLATE)
    }
}

/// Per-document ordering guarantee
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    #[default]
    Eventual,
    Strong,
}

/// Execution behavior: retries, timeouts, admission limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub cost_limit_usd_per_hour: Option<f64>,
    #[serde(default)]
    pub consistency: Consistency,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl Default for ExecutionSpec {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_ms: default_timeout_ms(),
            rate_limit_per_minute: None,
            cost_limit_usd_per_hour: None,
            consistency: Consistency::Eventual,
        }
    }
}

/// Complete declarative agent definition.
///
/// `revision` is bumped by the store on any mutation; it invalidates
/// idempotency keys when the agent's semantics change and lets workers
/// detect stale in-flight work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub watch: WatchSpec,
    pub ai: ModelSpec,
    #[serde(default)]
    pub write: WriteSpec,
    #[serde(default)]
    pub execution: ExecutionSpec,
    #[serde(default = "default_revision")]
    pub revision: u64,
}

fn default_revision() -> u64 {
    1
}

impl AgentSpec {
    pub fn namespace(&self) -> Namespace {
        self.watch.namespace()
    }

    /// Validate the definition against the invariants enforced at creation
    /// time: non-empty operations, non-empty provider/model, a parseable
    /// prompt and idempotency template, a parseable filter, and a sane
    /// target field for the chosen strategy.
    pub fn validate(&self) -> Result<(), AgentError> {
        let invalid = |why: String| AgentError::Invalid(self.id.to_string(), why);
        AgentId::check(self.id.as_str())?;
        if self.name.is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        if self.watch.database.is_empty() || self.watch.collection.is_empty() {
            return Err(invalid("watch database and collection are required".into()));
        }
        if self.watch.operations.is_empty() {
            return Err(invalid("watch.operations must not be empty".into()));
        }
        if let Some(filter) = &self.watch.filter {
            FilterExpr::parse(filter).map_err(|e| invalid(format!("watch.filter: {e}")))?;
        }
        if self.ai.provider.is_empty() || self.ai.model.is_empty() {
            return Err(invalid("ai.provider and ai.model are required".into()));
        }
        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return Err(invalid("ai.temperature must be within 0.0..=2.0".into()));
        }
        if self.ai.max_tokens == 0 {
            return Err(invalid("ai.max_tokens must be at least 1".into()));
        }
        Template::parse(&self.ai.prompt).map_err(|e| invalid(format!("ai.prompt: {e}")))?;
        if let Some(system) = &self.ai.system_prompt {
            Template::parse(system).map_err(|e| invalid(format!("ai.system_prompt: {e}")))?;
        }
        if self.write.target_field.is_empty() {
            return Err(invalid("write.target_field must not be empty".into()));
        }
        if self.write.strategy == WriteStrategy::Merge && self.write.target_field.contains('.') {
            return Err(invalid(
                "write.target_field must be a single top-level field for merge".into(),
            ));
        }
        Template::parse(self.write.idempotency_template())
            .map_err(|e| invalid(format!("write.idempotency_key: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
