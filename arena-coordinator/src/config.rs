//! Configuration for the coordination layer
//!
//! Level 4 - Utilities and configuration

use std::path::Path;
use std::time::Duration;

use arena_core::{ConvergenceConfig, MatchmakingConfig, RatingModel};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::retry::RetryPolicy;

/// Timing, retry and algorithm settings shared by the coordinator, workers
/// and battle loops. Every field has a default, so a config file only needs
/// the values it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Time between two ticks of a context's battle loop
    pub loop_interval_ms: u64,
    /// How often a worker refreshes the heartbeat of the task it runs
    pub heartbeat_interval_secs: u64,
    /// How often a worker scans for abandoned tasks
    pub zombie_scan_interval_secs: u64,
    /// Heartbeat age after which a new task counts as abandoned
    pub task_timeout_secs: u64,
    pub max_retries: u32,
    /// Upper bound on one judge call
    pub judge_timeout_ms: u64,
    /// Idle workers re-check the queue this often even without a wake-up
    pub idle_recheck_ms: u64,
    /// Re-read attempts when a task save hits a version conflict
    pub conflict_retries: u32,
    /// Resolved battles included in a snapshot for rematch avoidance
    pub recent_battle_window: usize,
    pub store_retry: RetryPolicy,
    /// Passed through to the judge with every request
    pub judge_criteria: Option<String>,
    pub rating: RatingModel,
    pub matchmaking: MatchmakingConfig,
    pub convergence: ConvergenceConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: 10_000,
            heartbeat_interval_secs: 30,
            zombie_scan_interval_secs: 300,
            task_timeout_secs: 30 * 60,
            max_retries: 3,
            judge_timeout_ms: 60_000,
            idle_recheck_ms: 30_000,
            conflict_retries: 5,
            recent_battle_window: 100,
            store_retry: RetryPolicy::default(),
            judge_criteria: None,
            rating: RatingModel::default(),
            matchmaking: MatchmakingConfig::default(),
            convergence: ConvergenceConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from a JSON file; missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn zombie_scan_interval(&self) -> Duration {
        Duration::from_secs(self.zombie_scan_interval_secs)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_millis(self.judge_timeout_ms)
    }

    pub fn idle_recheck(&self) -> Duration {
        Duration::from_millis(self.idle_recheck_ms)
    }

    /// Set the battle loop interval
    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the judge timeout
    pub fn with_judge_timeout(mut self, timeout: Duration) -> Self {
        self.judge_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the heartbeat age after which tasks are recovered
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    pub fn with_judge_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.judge_criteria = Some(criteria.into());
        self
    }

    pub fn with_convergence(mut self, convergence: ConvergenceConfig) -> Self {
        self.convergence = convergence;
        self
    }
}
