// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Execution ledger records and the error taxonomy

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::ExecutionId;

/// Terminal (and transient `Running`) states of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Dlq,
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecStatus::Pending => f.write_str("pending"),
            ExecStatus::Running => f.write_str("running"),
            ExecStatus::Completed => f.write_str("completed"),
            ExecStatus::Failed => f.write_str("failed"),
            ExecStatus::Skipped => f.write_str("skipped"),
            ExecStatus::Dlq => f.write_str("dlq"),
        }
    }
}

/// What the pipeline does with a failure carrying this tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Record a skipped execution and acknowledge the item
    SkipAck,
    /// Retry with exponential backoff, dead-letter on exhaustion
    Retry,
    /// Retry with elongated backoff (provider asked us to slow down)
    RetryElongated,
    /// Dead-letter immediately
    DlqDirect,
    /// The write was a duplicate: completed, `written = false`
    CompleteUnwritten,
    /// Redeliver without counting an attempt
    NackNoAttempt,
}

/// Error taxonomy. Every terminal state maps to exactly one tag, and every
/// tag maps to exactly one disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTag {
    ConfigurationError,
    FilterError,
    ModelTimeout,
    ModelRateLimited,
    #[serde(rename = "model_5xx")]
    Model5xx,
    #[serde(rename = "model_4xx")]
    Model4xx,
    ParseError,
    WriteConflict,
    TransientWriteError,
    AgentGone,
    Quarantined,
}

impl ErrorTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorTag::ConfigurationError => "configuration_error",
            ErrorTag::FilterError => "filter_error",
            ErrorTag::ModelTimeout => "model_timeout",
            ErrorTag::ModelRateLimited => "model_rate_limited",
            ErrorTag::Model5xx => "model_5xx",
            ErrorTag::Model4xx => "model_4xx",
            ErrorTag::ParseError => "parse_error",
            ErrorTag::WriteConflict => "write_conflict",
            ErrorTag::TransientWriteError => "transient_write_error",
            ErrorTag::AgentGone => "agent_gone",
            ErrorTag::Quarantined => "quarantined",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            ErrorTag::ConfigurationError => Disposition::SkipAck,
            ErrorTag::FilterError => Disposition::SkipAck,
            ErrorTag::ModelTimeout => Disposition::Retry,
            ErrorTag::ModelRateLimited => Disposition::RetryElongated,
            ErrorTag::Model5xx => Disposition::Retry,
            ErrorTag::Model4xx => Disposition::DlqDirect,
            ErrorTag::ParseError => Disposition::Retry,
            ErrorTag::WriteConflict => Disposition::CompleteUnwritten,
            ErrorTag::TransientWriteError => Disposition::Retry,
            ErrorTag::AgentGone => Disposition::SkipAck,
            ErrorTag::Quarantined => Disposition::NackNoAttempt,
        }
    }
}

impl std::fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged error carried on a failed execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecError {
    pub tag: ErrorTag,
    pub message: String,
}

/// One ledger entry, written once at its terminal state.
///
/// `agent_id` is a plain string so the ledger can also record stream-level
/// facts (feed resets) under a pseudo id like `watch:db.coll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub agent_id: String,
    pub document_id: String,
    pub status: ExecStatus,
    pub lifecycle_state: String,
    pub attempt: u32,
    pub started_at_ms: u64,
    pub completed_at_ms: u64,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub written: bool,
    pub error: Option<ExecError>,
    pub skip_reason: Option<String>,
}

impl Execution {
    /// Begin a record in the `running` state.
    pub fn begin(
        agent_id: impl Into<String>,
        document_id: impl Into<String>,
        attempt: u32,
        started_at_ms: u64,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            agent_id: agent_id.into(),
            document_id: document_id.into(),
            status: ExecStatus::Running,
            lifecycle_state: "running".to_string(),
            attempt,
            started_at_ms,
            completed_at_ms: 0,
            duration_ms: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            written: false,
            error: None,
            skip_reason: None,
        }
    }

    pub fn complete(mut self, now_ms: u64, written: bool) -> Self {
        self.status = ExecStatus::Completed;
        self.lifecycle_state =
            if written { "written".to_string() } else { "write_skipped".to_string() };
        self.written = written;
        self.finish(now_ms);
        self
    }

    pub fn skip(mut self, now_ms: u64, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.status = ExecStatus::Skipped;
        self.lifecycle_state = reason.clone();
        self.skip_reason = Some(reason);
        self.finish(now_ms);
        self
    }

    pub fn fail(mut self, now_ms: u64, tag: ErrorTag, message: impl Into<String>) -> Self {
        self.status = ExecStatus::Failed;
        self.lifecycle_state = "failed".to_string();
        self.error = Some(ExecError { tag, message: message.into() });
        self.finish(now_ms);
        self
    }

    pub fn dead_letter(mut self, now_ms: u64, tag: ErrorTag, message: impl Into<String>) -> Self {
        self.status = ExecStatus::Dlq;
        self.lifecycle_state = "dlq".to_string();
        self.error = Some(ExecError { tag, message: message.into() });
        self.finish(now_ms);
        self
    }

    pub fn with_usage(mut self, tokens_used: u64, cost_usd: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost_usd = cost_usd;
        self
    }

    pub fn with_lifecycle(mut self, state: impl Into<String>) -> Self {
        self.lifecycle_state = state.into();
        self
    }

    fn finish(&mut self, now_ms: u64) {
        self.completed_at_ms = now_ms;
        self.duration_ms = now_ms.saturating_sub(self.started_at_ms);
    }
}

/// Serialize a JSON value with object keys sorted at every level, so equal
/// values always produce byte-equal output.
pub fn canonical_json(value: &Value) -> String {
    fn normalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: std::collections::BTreeMap<&String, Value> =
                    map.iter().map(|(k, v)| (k, normalize(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
            other => other.clone(),
        }
    }
    normalize(value).to_string()
}

/// Hex SHA-256 over the canonical JSON encoding of a value.
pub fn fingerprint(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
#[path = "execution_tests.rs"]
mod tests;
