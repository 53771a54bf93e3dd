use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub cache_root: Option<String>,
    pub entry_ttl_days: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_parallel_downloads: Option<usize>,
    pub user_agent: Option<String>,
    /// Hosts in static preference order, primary CDN first.
    pub preferred_hosts: Option<Vec<String>>,

    // Feature configs
    pub rate_limiter: Option<RateLimiterFileConfig>,
    pub ledger: Option<LedgerFileConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RateLimiterFileConfig {
    pub base_delay_ms: Option<u64>,
    pub jitter_max_ms: Option<u64>,
    pub initial_penalty_secs: Option<u64>,
    pub max_extra_delay_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub successes_to_decay: Option<u32>,
    pub max_concurrent_per_host: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct LedgerFileConfig {
    pub retry_window_days: Option<i64>,
    pub retention_days: Option<i64>,
    pub read_lock_timeout_secs: Option<u64>,
    pub write_lock_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
