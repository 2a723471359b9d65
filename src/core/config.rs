//! TL-008: Engine tunables, threaded explicitly into the executor.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Execution policy for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum nodes executing concurrently within a wave
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Retries after the first attempt for transient remote errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Deadline for a single remote call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Read unchanged resources back from the provider before trusting state
    #[serde(default)]
    pub refresh: bool,

    /// Write the provenance event log
    #[serde(default = "default_true")]
    pub tripwire: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_retries: default_max_retries(),
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            refresh: false,
            tripwire: true,
        }
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_min_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Exponential backoff: `min * 2^attempt`, capped at `max`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self
            .min_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Validation problems, empty when the policy is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.parallelism == 0 {
            problems.push("policy.parallelism must be at least 1".to_string());
        }
        if self.call_timeout_secs == 0 {
            problems.push("policy.call_timeout_secs must be at least 1".to_string());
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            problems.push("policy.min_backoff_ms exceeds policy.max_backoff_ms".to_string());
        }
        problems
    }
}
