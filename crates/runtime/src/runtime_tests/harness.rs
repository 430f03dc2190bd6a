// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared rig for pipeline tests: memory adapters, scripted model, fast
//! intervals.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::{Runtime, RuntimeConfig};
use mc_adapters::{
    MemoryAgentStore, MemoryDocumentStore, MemoryStream, MetricsSink, PrometheusSink,
    ScriptedModelClient,
};
use mc_core::{
    AgentId, AgentSpec, ChangeOperation, ExecutionSpec, ModelSpec, SystemClock, WatchSpec,
    WriteSpec, WriteStrategy,
};

pub(crate) type TestRuntime = Runtime<
    MemoryDocumentStore,
    MemoryStream<SystemClock>,
    ScriptedModelClient,
    MemoryAgentStore,
    SystemClock,
>;

pub(crate) struct Rig {
    pub docs: Arc<MemoryDocumentStore>,
    pub kv: Arc<MemoryStream<SystemClock>>,
    pub model: Arc<ScriptedModelClient>,
    pub agents: Arc<MemoryAgentStore>,
    pub metrics: Arc<PrometheusSink>,
    pub runtime: TestRuntime,
}

/// The `classify` agent from the triage scenario: watches
/// `support.tickets` inserts with `{status: "open"}`, writes to
/// `ai_triage`.
pub(crate) fn triage_agent(id: &str) -> AgentSpec {
    AgentSpec {
        id: AgentId::new(id).unwrap(),
        name: "Ticket triage".to_string(),
        enabled: true,
        tags: vec!["support".to_string()],
        watch: WatchSpec {
            database: "support".to_string(),
            collection: "tickets".to_string(),
            operations: vec![ChangeOperation::Insert],
            filter: Some(serde_json::json!({"status": "open"})),
        },
        ai: ModelSpec {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            prompt: "cat={{ document.category_hint | default('none') }}".to_string(),
            system_prompt: None,
            temperature: 0.2,
            max_tokens: 128,
            response_schema: None,
        },
        write: WriteSpec {
            strategy: WriteStrategy::Merge,
            target_field: "ai_triage".to_string(),
            idempotency_key: None,
            include_metadata: true,
        },
        execution: ExecutionSpec {
            max_retries: 2,
            retry_delay_ms: 10,
            timeout_ms: 5_000,
            rate_limit_per_minute: None,
            cost_limit_usd_per_hour: None,
            consistency: Default::default(),
        },
        revision: 1,
    }
}

pub(crate) async fn start_rig(specs: Vec<AgentSpec>) -> Rig {
    start_rig_with(RuntimeConfig::fast(), specs).await
}

pub(crate) async fn start_rig_with(config: RuntimeConfig, specs: Vec<AgentSpec>) -> Rig {
    let docs = Arc::new(MemoryDocumentStore::new());
    let kv = Arc::new(MemoryStream::new(SystemClock));
    let agents = Arc::new(MemoryAgentStore::new());
    for spec in specs {
        agents.put(spec).unwrap();
    }
    restart_rig(config, docs, kv, agents).await
}

/// Start (or restart) a runtime over existing stores, with a fresh model
/// client and metrics sink. Waits until every watched namespace has an
/// open subscription so tests can drive the feed immediately.
pub(crate) async fn restart_rig(
    config: RuntimeConfig,
    docs: Arc<MemoryDocumentStore>,
    kv: Arc<MemoryStream<SystemClock>>,
    agents: Arc<MemoryAgentStore>,
) -> Rig {
    use mc_adapters::AgentStore;

    let watched: Vec<(String, String, u64)> = agents
        .list_enabled()
        .await
        .unwrap()
        .into_iter()
        .map(|spec| {
            let count = docs.subscribe_count(&spec.watch.database, &spec.watch.collection);
            (spec.watch.database, spec.watch.collection, count)
        })
        .collect();

    let model = Arc::new(ScriptedModelClient::new());
    let metrics = Arc::new(PrometheusSink::new());
    let sink: Arc<dyn MetricsSink> = Arc::clone(&metrics) as Arc<dyn MetricsSink>;
    let runtime = Runtime::start(
        config,
        Arc::clone(&docs),
        Arc::clone(&kv),
        Arc::clone(&model),
        Arc::clone(&agents),
        sink,
        SystemClock,
    )
    .await
    .unwrap();

    for (db, coll, before) in watched {
        let docs = Arc::clone(&docs);
        assert!(
            wait_for(Duration::from_secs(5), move || docs.subscribe_count(&db, &coll) > before)
                .await,
            "watcher never subscribed",
        );
    }
    Rig { docs, kv, model, agents, metrics, runtime }
}

/// Poll until `f` holds or the timeout passes; returns the final check.
pub(crate) async fn wait_for(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

pub(crate) fn executions(docs: &MemoryDocumentStore) -> Vec<Value> {
    docs.documents("mongoclaw", "executions")
}

pub(crate) fn executions_where(
    docs: &MemoryDocumentStore,
    status: &str,
    lifecycle: Option<&str>,
) -> Vec<Value> {
    executions(docs)
        .into_iter()
        .filter(|e| {
            e["status"] == status
                && lifecycle.map_or(true, |state| e["lifecycle_state"] == state)
        })
        .collect()
}

pub(crate) fn open_ticket(id: &str, hint: &str) -> Value {
    serde_json::json!({"_id": id, "status": "open", "category_hint": hint})
}
