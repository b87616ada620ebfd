//! Engine-wide tuning knobs.
//!
//! Per-flowchart budgets live on [`crate::store::Flowchart`]; everything here
//! applies to the whole engine instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::BackoffPolicy;

/// What to do with a node run whose executor could not be reached even after
/// dispatch retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncertainDispatchPolicy {
    /// Fail the node run.
    #[default]
    Fail,
    /// Complete the node run with empty output, flagged degraded.
    Degrade,
}

impl std::str::FromStr for UncertainDispatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "degrade" => Ok(Self::Degrade),
            other => Err(format!("unknown uncertain dispatch policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Extra attempts to reach an unavailable executor.
    pub dispatch_max_retries: usize,
    pub dispatch_backoff: BackoffPolicy,
    pub uncertain_dispatch: UncertainDispatchPolicy,
    /// Entries kept in each run's artifact history.
    pub artifact_history_limit: usize,
    /// How often the runtime budget is checked while nothing else happens.
    pub budget_tick: Duration,
    pub retention_sweep_interval: Duration,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_max_retries: 3,
            dispatch_backoff: BackoffPolicy::default(),
            uncertain_dispatch: UncertainDispatchPolicy::Fail,
            artifact_history_limit: 50,
            budget_tick: Duration::from_secs(1),
            retention_sweep_interval: Duration::from_secs(60),
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads the following environment variables, falling back to the
    /// default for anything unset or unparsable:
    /// - `SWITCHYARD_DISPATCH_MAX_RETRIES`
    /// - `SWITCHYARD_DISPATCH_BACKOFF_BASE_MS` / `SWITCHYARD_DISPATCH_BACKOFF_MAX_MS`
    /// - `SWITCHYARD_UNCERTAIN_DISPATCH`: `fail` or `degrade`
    /// - `SWITCHYARD_ARTIFACT_HISTORY_LIMIT`
    /// - `SWITCHYARD_BUDGET_TICK_MS`
    /// - `SWITCHYARD_RETENTION_SWEEP_SECS`
    /// - `SWITCHYARD_EVENT_CAPACITY`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let defaults = Self::default();
        let dispatch_backoff = match (
            parsed::<u64>(&lookup, "SWITCHYARD_DISPATCH_BACKOFF_BASE_MS"),
            parsed::<u64>(&lookup, "SWITCHYARD_DISPATCH_BACKOFF_MAX_MS"),
        ) {
            (None, None) => defaults.dispatch_backoff,
            (base, max) => BackoffPolicy::Exponential {
                base_ms: base.unwrap_or(200),
                max_ms: max.unwrap_or(5_000),
            },
        };

        Self {
            dispatch_max_retries: parsed(&lookup, "SWITCHYARD_DISPATCH_MAX_RETRIES")
                .unwrap_or(defaults.dispatch_max_retries),
            dispatch_backoff,
            uncertain_dispatch: parsed(&lookup, "SWITCHYARD_UNCERTAIN_DISPATCH")
                .unwrap_or(defaults.uncertain_dispatch),
            artifact_history_limit: parsed(&lookup, "SWITCHYARD_ARTIFACT_HISTORY_LIMIT")
                .unwrap_or(defaults.artifact_history_limit),
            budget_tick: parsed(&lookup, "SWITCHYARD_BUDGET_TICK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.budget_tick),
            retention_sweep_interval: parsed(&lookup, "SWITCHYARD_RETENTION_SWEEP_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention_sweep_interval),
            event_capacity: parsed(&lookup, "SWITCHYARD_EVENT_CAPACITY")
                .unwrap_or(defaults.event_capacity),
        }
    }

    pub fn with_dispatch_retries(mut self, retries: usize, backoff: BackoffPolicy) -> Self {
        self.dispatch_max_retries = retries;
        self.dispatch_backoff = backoff;
        self
    }

    pub fn with_uncertain_dispatch(mut self, policy: UncertainDispatchPolicy) -> Self {
        self.uncertain_dispatch = policy;
        self
    }

    pub fn with_budget_tick(mut self, tick: Duration) -> Self {
        self.budget_tick = tick.max(Duration::from_millis(1));
        self
    }
}
