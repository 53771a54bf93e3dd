//! Common test infrastructure
//!
//! Everything the end-to-end tests need: a counting mock CDN and a cache
//! configuration tuned for fast, deterministic test runs. Tests should only
//! import from this module, not from internal submodules.
#![allow(dead_code)]

mod server;

use std::path::Path;
use std::time::Duration;

use cover_cache::image_cache::RateLimiterConfig;
use cover_cache::ImageCacheConfig;

pub use server::MockCdn;

/// Minimal valid PNG: signature plus a little padding. The cache only
/// sniffs the header, it never decodes pixels.
pub fn png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&[0u8; 32]);
    bytes
}

/// Cache configuration with pacing flattened so tests run in milliseconds.
pub fn test_config(cache_root: &Path) -> ImageCacheConfig {
    let mut config = ImageCacheConfig::new(cache_root);
    config.rate_limiter = RateLimiterConfig {
        base_delay: Duration::ZERO,
        jitter_max: Duration::ZERO,
        ..RateLimiterConfig::default()
    };
    config
}
