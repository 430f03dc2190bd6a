// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identifiers for queue work items and execution ledger entries.
//!
//! Ids are `<prefix><nanoid>` strings. The prefix makes the id kind
//! readable in logs, queue payloads, and ledger documents; the random
//! suffix carries the uniqueness.

use serde::{Deserialize, Serialize};

fn tagged(prefix: &str) -> String {
    let mut id = String::with_capacity(prefix.len() + 21);
    id.push_str(prefix);
    id.push_str(&nanoid::nanoid!());
    id
}

/// Identifier for a single logical unit of queued work.
///
/// Stays stable across nack and redelivery copies of the same item, so a
/// retry chain can be followed through the logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    pub const PREFIX: &'static str = "wi_";

    pub fn new() -> Self {
        Self(tagged(Self::PREFIX))
    }

    /// Rebuild from a string loaded off the queue.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for WorkItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier for one execution ledger entry; doubles as the document id
/// of the persisted record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub const PREFIX: &'static str = "exec_";

    pub fn new() -> Self {
        Self(tagged(Self::PREFIX))
    }

    /// Rebuild from a stored ledger document id.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ExecutionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
