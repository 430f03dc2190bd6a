// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! mc-adapters: the interfaces the pipeline consumes, as traits.
//!
//! Each trait ships an in-memory implementation used by tests and local
//! runs. Production deployments plug in real backends (a document store
//! with a change feed, a stream database with consumer groups, a model
//! provider HTTP API) behind the same traits.

pub mod agentstore;
pub mod docstore;
pub mod metrics;
pub mod model;
pub mod stream;

pub use agentstore::{AgentStore, AgentStoreEvent, MemoryAgentStore};
pub use docstore::{
    ChangeFeed, DocumentStore, MemoryDocumentStore, Precondition, RawChange, StoreError,
    UpdatePatch, WriteOutcome,
};
pub use metrics::{MetricsSink, NullSink, PrometheusSink};
pub use model::{
    HttpModelClient, ModelClient, ModelError, ModelRequest, ModelResponse, ProviderConfig,
    ScriptedModelClient,
};
pub use stream::{KeyValueStream, MemoryStream, StreamEntry, StreamError};
