// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loader configuration loaded from environment variables.

use crate::chunk::{ChunkStrategy, MB};
use std::time::Duration;

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Maximum number of non-terminal jobs at once.
    pub max_concurrent_jobs: usize,
    /// Worker threads per job (chunks parsed at once).
    pub worker_threads: usize,
    /// Base chunk size in bytes before strategy scaling.
    pub base_chunk_size: u64,
    /// Bounded wait for a single chunk.
    pub chunk_timeout: Duration,
    /// Hard memory ceiling in bytes; `None` derives one from available memory.
    pub memory_limit: Option<u64>,
    /// Below this much total RAM the memory-constrained strategy is used.
    pub low_memory_threshold: u64,
    /// Time budget for `cancel()` bookkeeping.
    pub cancel_budget: Duration,
    /// How long terminal jobs are retained before `cleanup` may purge them.
    pub job_retention: Duration,
    /// Skip strategy selection and always use this strategy.
    pub forced_strategy: Option<ChunkStrategy>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl LoaderConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            max_concurrent_jobs: env_or("LOADER_MAX_JOBS", 2usize).max(1),
            worker_threads: env_or("LOADER_WORKER_THREADS", num_cpus::get()).max(1),
            base_chunk_size: env_or("LOADER_CHUNK_SIZE_MB", 64u64).max(1).saturating_mul(MB),
            chunk_timeout: Duration::from_secs(env_or("LOADER_CHUNK_TIMEOUT_SECS", 30u64)),
            memory_limit: std::env::var("LOADER_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|mb| mb.saturating_mul(MB)),
            low_memory_threshold: env_or("LOADER_LOW_MEMORY_GB", 8u64).saturating_mul(1024 * MB),
            cancel_budget: Duration::from_millis(env_or("LOADER_CANCEL_BUDGET_MS", 500u64)),
            job_retention: Duration::from_secs(env_or("LOADER_JOB_RETENTION_SECS", 3600u64)),
            forced_strategy: std::env::var("LOADER_CHUNK_STRATEGY")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
