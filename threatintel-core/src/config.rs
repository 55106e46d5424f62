use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FeedJobError, Result};

/// Global knobs that tune the feed-job engine.
///
/// All fields carry defaults so deployments only spell out what they change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Lease duration and renewal cadence.
    pub lock: LockConfig,
    /// Batch sizing and shard-readiness wait for index rotation.
    pub rotation: RotationConfig,
    /// Worker budget for scheduled runs.
    pub runner: RunnerConfig,
    /// Names of the system indices.
    pub store: StoreIndices,
    /// HTTP client settings for feed downloads.
    pub fetch: FetchConfig,
}

impl EngineConfig {
    /// Rejects combinations that would let a lease lapse between renewals or
    /// make the shard wait meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.lock.renew_after_secs == 0 {
            return Err(FeedJobError::Validation(
                "lock.renew_after_secs must be positive".into(),
            ));
        }
        if self.lock.lock_duration_secs < self.lock.renew_after_secs.saturating_mul(2) {
            return Err(FeedJobError::Validation(format!(
                "lock.lock_duration_secs ({}) must be at least twice lock.renew_after_secs ({})",
                self.lock.lock_duration_secs, self.lock.renew_after_secs
            )));
        }
        if self.rotation.batch_size == 0 {
            return Err(FeedJobError::Validation(
                "rotation.batch_size must be positive".into(),
            ));
        }
        if self.rotation.shard_poll_interval_ms == 0
            || self.rotation.shard_poll_interval_ms >= self.rotation.shard_wait_timeout_ms
        {
            return Err(FeedJobError::Validation(format!(
                "rotation.shard_poll_interval_ms ({}) must be positive and shorter than rotation.shard_wait_timeout_ms ({})",
                self.rotation.shard_poll_interval_ms, self.rotation.shard_wait_timeout_ms
            )));
        }
        if self.runner.max_concurrent_runs == 0 {
            return Err(FeedJobError::Validation(
                "runner.max_concurrent_runs must be positive".into(),
            ));
        }
        if self.store.jobs_index == self.store.locks_index {
            return Err(FeedJobError::Validation(
                "store.jobs_index and store.locks_index must differ".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease length granted on acquire and on every renewal (seconds).
    pub lock_duration_secs: u64,
    /// Renewal is a no-op until the lease is at least this old (seconds).
    pub renew_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_duration_secs: 300,
            renew_after_secs: 120,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Rows per bulk request; the lock is renewed between batches.
    pub batch_size: usize,
    /// Upper bound on the shard-readiness wait.
    pub shard_wait_timeout_ms: u64,
    /// Sleep between shard-readiness polls.
    pub shard_poll_interval_ms: u64,
    /// Prepended to every data index name.
    pub data_index_prefix: String,
}

impl RotationConfig {
    pub fn shard_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_wait_timeout_ms)
    }

    pub fn shard_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shard_poll_interval_ms)
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            shard_wait_timeout_ms: 2 * 60 * 60 * 1_000,
            shard_poll_interval_ms: 5_000,
            data_index_prefix: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Scheduled runs allowed to execute at once in this process.
    pub max_concurrent_runs: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreIndices {
    pub jobs_index: String,
    pub locks_index: String,
}

impl Default for StoreIndices {
    fn default() -> Self {
        Self {
            jobs_index: ".threatintel-jobs".to_string(),
            locks_index: ".threatintel-job-locks".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub connect_timeout_ms: u64,
    /// Applies to the whole download, not a single read.
    pub request_timeout_ms: u64,
    pub user_agent: String,
}

impl FetchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30 * 60 * 1_000,
            user_agent: concat!("threatintel-feeds/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}
