// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime error type

use thiserror::Error;

use mc_adapters::{StoreError, StreamError};
use mc_core::{AgentError, FilterError, TemplateError};

/// Errors surfaced by the runtime's control surface and startup path.
///
/// Inside the pipeline, per-item failures travel as [`mc_core::ErrorTag`]
/// so each maps to exactly one disposition; `RuntimeError` is for the
/// places where an operation as a whole fails.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("unknown agent {0:?}")]
    UnknownAgent(String),
    #[error("agent {0:?} is misconfigured: {1}")]
    Misconfigured(String, String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("runtime is shutting down")]
    ShuttingDown,
}
