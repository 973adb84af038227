//! Session telemetry aggregation.
//!
//! Counters are updated from the hot path with a non-blocking lock: a
//! contended update is dropped and counted rather than stalling the run
//! loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use crate::llm::UsageMetadata;

#[derive(Debug, Clone, Default)]
pub struct ModelUsageStats {
    pub api_time: Duration,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub thought_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryStats {
    pub total_turns: usize,
    pub total_llm_requests: usize,
    pub total_tool_calls: usize,
    pub total_retries: usize,
    pub tool_counts: HashMap<String, usize>,
    pub tool_errors: HashMap<String, usize>,
    pub session_duration: Duration,
    pub api_time_spent: Duration,
    pub model_usage: HashMap<String, ModelUsageStats>,
    pub dropped_metric_updates: u64,
}

/// Aggregates telemetry for one agent session.
#[derive(Debug, Clone)]
pub struct TelemetryManager {
    stats: Arc<Mutex<TelemetryStats>>,
    start_time: Instant,
    dropped_metric_updates: Arc<AtomicU64>,
}

impl Default for TelemetryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryManager {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(Mutex::new(TelemetryStats::default())),
            start_time: Instant::now(),
            dropped_metric_updates: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn record_turn(&self) {
        let start = self.start_time;
        self.with_stats_mut_non_blocking(|stats| {
            stats.total_turns += 1;
            stats.session_duration = start.elapsed();
        });
    }

    pub fn record_retry(&self) {
        self.with_stats_mut_non_blocking(|stats| {
            stats.total_retries += 1;
        });
    }

    pub fn record_tool_usage(&self, tool: &str, success: bool) {
        self.with_stats_mut_non_blocking(|stats| {
            stats.total_tool_calls += 1;
            *stats.tool_counts.entry(tool.to_owned()).or_insert(0) += 1;
            if !success {
                *stats.tool_errors.entry(tool.to_owned()).or_insert(0) += 1;
            }
        });
    }

    pub fn record_llm_request(
        &self,
        model: &str,
        duration: Duration,
        usage: Option<&UsageMetadata>,
    ) {
        self.with_stats_mut_non_blocking(|stats| {
            stats.total_llm_requests += 1;
            stats.api_time_spent = stats.api_time_spent.saturating_add(duration);
            let model_stats = stats.model_usage.entry(model.to_owned()).or_default();
            model_stats.api_time = model_stats.api_time.saturating_add(duration);
            if let Some(usage) = usage {
                model_stats.prompt_tokens = model_stats
                    .prompt_tokens
                    .saturating_add(u64::from(usage.prompt_token_count));
                model_stats.completion_tokens = model_stats
                    .completion_tokens
                    .saturating_add(u64::from(usage.candidates_token_count));
                model_stats.thought_tokens = model_stats
                    .thought_tokens
                    .saturating_add(u64::from(usage.thoughts_token_count.unwrap_or(0)));
            }
        });
    }

    fn with_stats_mut_non_blocking<F>(&self, update: F)
    where
        F: FnOnce(&mut TelemetryStats),
    {
        match self.stats.try_lock() {
            Ok(mut stats) => update(&mut stats),
            Err(TryLockError::WouldBlock) | Err(TryLockError::Poisoned(_)) => {
                self.dropped_metric_updates.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> TelemetryStats {
        match self.stats.lock() {
            Ok(stats) => {
                let mut snapshot = stats.clone();
                snapshot.dropped_metric_updates =
                    self.dropped_metric_updates.load(Ordering::Relaxed);
                snapshot
            }
            Err(poisoned) => {
                let mut snapshot = poisoned.into_inner().clone();
                snapshot.dropped_metric_updates =
                    self.dropped_metric_updates.load(Ordering::Relaxed);
                snapshot
            }
        }
    }
}
