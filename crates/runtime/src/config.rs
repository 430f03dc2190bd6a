// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime tunables

use std::time::Duration;

/// Circuit breaker tuning (per `(agent, provider, model)` key)
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling outcome window size
    pub window: usize,
    /// Minimum samples before the breaker may open
    pub min_samples: usize,
    /// Error-rate threshold over the window
    pub error_rate: f64,
    /// Initial open-state cooldown
    pub cooldown: Duration,
    /// Cooldown doubles on each reopen, up to this cap
    pub cooldown_cap: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 60,
            min_samples: 10,
            error_rate: 0.5,
            cooldown: Duration::from_secs(30),
            cooldown_cap: Duration::from_secs(300),
        }
    }
}

/// Pipeline configuration with production defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Control-store database holding executions and resume tokens
    pub control_db: String,
    pub executions_collection: String,
    pub resume_tokens_collection: String,
    /// Watcher → dispatcher handoff depth (back-pressure bound)
    pub handoff_depth: usize,
    /// Subscription reconciliation period
    pub reconcile_interval: Duration,
    /// Agent cache refresh period (upper bound on disable latency)
    pub cache_refresh_interval: Duration,
    pub worker_count: usize,
    /// Change-feed blocking read timeout
    pub feed_block: Duration,
    /// Queue blocking read timeout
    pub queue_block: Duration,
    /// How often each worker sweeps for orphaned pending items
    pub claim_interval: Duration,
    /// Retry backoff cap
    pub retry_max_delay: Duration,
    /// Elongation factor applied to rate-limited retries
    pub elongated_backoff_factor: u32,
    /// Delay before a contender re-queues a lock-contended item
    pub lock_retry_delay: Duration,
    pub idempotency_ttl: Duration,
    /// Consecutive DLQ items before an agent is quarantined
    pub quarantine_threshold: u32,
    /// Per-agent p95 end-to-end latency target
    pub slo_target: Duration,
    /// How long the p95 must stay above target before a violation fires
    pub slo_sustain: Duration,
    pub breaker: BreakerConfig,
    /// Length cap applied to work streams on produce
    pub stream_max_len: u64,
    pub dlq_max_len: u64,
    /// Resume tokens are flushed at most this often
    pub token_flush_interval: Duration,
    /// How often queue-depth and breaker gauges are refreshed
    pub metrics_interval: Duration,
    /// Hard deadline for graceful shutdown
    pub shutdown_deadline: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control_db: "mongoclaw".to_string(),
            executions_collection: "executions".to_string(),
            resume_tokens_collection: "resume_tokens".to_string(),
            handoff_depth: 256,
            reconcile_interval: Duration::from_secs(5),
            cache_refresh_interval: Duration::from_secs(2),
            worker_count: 10,
            feed_block: Duration::from_secs(5),
            queue_block: Duration::from_secs(1),
            claim_interval: Duration::from_secs(10),
            retry_max_delay: Duration::from_secs(60),
            elongated_backoff_factor: 4,
            lock_retry_delay: Duration::from_millis(200),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            quarantine_threshold: 20,
            slo_target: Duration::from_secs(30),
            slo_sustain: Duration::from_secs(300),
            breaker: BreakerConfig::default(),
            stream_max_len: 100_000,
            dlq_max_len: 10_000,
            token_flush_interval: Duration::from_secs(1),
            metrics_interval: Duration::from_secs(2),
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    /// Short intervals suited to integration tests: everything that
    /// periodically polls runs at millisecond cadence.
    pub fn fast() -> Self {
        Self {
            reconcile_interval: Duration::from_millis(20),
            cache_refresh_interval: Duration::from_millis(20),
            feed_block: Duration::from_millis(20),
            queue_block: Duration::from_millis(20),
            claim_interval: Duration::from_millis(50),
            token_flush_interval: Duration::from_millis(20),
            metrics_interval: Duration::from_millis(50),
            shutdown_deadline: Duration::from_secs(5),
            ..Self::default()
        }
    }
}
