mod file_config;

pub use file_config::{FileConfig, LedgerFileConfig, RateLimiterFileConfig};

use anyhow::{bail, Result};
use chrono::Duration as ChronoDuration;
use std::path::PathBuf;
use std::time::Duration;

use crate::image_cache::{CdnSelectorConfig, ImageCacheConfig, LedgerConfig, RateLimiterConfig};

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub cache_root: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub max_parallel_downloads: usize,
}

/// Resolve the cache configuration from CLI arguments and optional TOML
/// file config. TOML values override CLI values where present.
pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<ImageCacheConfig> {
    let file = file_config.unwrap_or_default();

    let cache_root = file
        .cache_root
        .map(PathBuf::from)
        .or_else(|| cli.cache_root.clone())
        .ok_or_else(|| {
            anyhow::anyhow!("cache_root must be specified via --cache-root or in config file")
        })?;

    // The cache root is created on demand, but a path that exists and is not
    // a directory is a configuration mistake.
    if cache_root.exists() && !cache_root.is_dir() {
        bail!("cache_root is not a directory: {:?}", cache_root);
    }

    let mut config = ImageCacheConfig::new(cache_root);

    if let Some(days) = file.entry_ttl_days {
        config.entry_ttl = Duration::from_secs(days * 24 * 3600);
    }
    let timeout_secs = file.request_timeout_secs.unwrap_or(cli.request_timeout_secs);
    config.request_timeout = Duration::from_secs(timeout_secs);
    config.max_parallel_downloads = file
        .max_parallel_downloads
        .unwrap_or(cli.max_parallel_downloads);
    if config.max_parallel_downloads == 0 {
        bail!("max_parallel_downloads must be at least 1");
    }
    if let Some(user_agent) = file.user_agent {
        config.user_agent = user_agent;
    }
    config.selector = CdnSelectorConfig {
        preferred_hosts: file.preferred_hosts.unwrap_or_default(),
    };

    // Rate limiter settings - merge file config with defaults
    let rl_file = file.rate_limiter.unwrap_or_default();
    let rl_defaults = RateLimiterConfig::default();
    config.rate_limiter = RateLimiterConfig {
        base_delay: rl_file
            .base_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(rl_defaults.base_delay),
        jitter_max: rl_file
            .jitter_max_ms
            .map(Duration::from_millis)
            .unwrap_or(rl_defaults.jitter_max),
        initial_penalty: rl_file
            .initial_penalty_secs
            .map(Duration::from_secs)
            .unwrap_or(rl_defaults.initial_penalty),
        max_extra_delay: rl_file
            .max_extra_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(rl_defaults.max_extra_delay),
        backoff_multiplier: rl_file
            .backoff_multiplier
            .unwrap_or(rl_defaults.backoff_multiplier),
        successes_to_decay: rl_file
            .successes_to_decay
            .unwrap_or(rl_defaults.successes_to_decay),
        max_concurrent_per_host: rl_file
            .max_concurrent_per_host
            .unwrap_or(rl_defaults.max_concurrent_per_host),
    };

    let ledger_file = file.ledger.unwrap_or_default();
    let ledger_defaults = LedgerConfig::default();
    config.ledger = LedgerConfig {
        retry_window: ledger_file
            .retry_window_days
            .map(ChronoDuration::days)
            .unwrap_or(ledger_defaults.retry_window),
        retention: ledger_file
            .retention_days
            .map(ChronoDuration::days)
            .unwrap_or(ledger_defaults.retention),
        read_lock_timeout: ledger_file
            .read_lock_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(ledger_defaults.read_lock_timeout),
        write_lock_timeout: ledger_file
            .write_lock_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(ledger_defaults.write_lock_timeout),
    };

    Ok(config)
}
