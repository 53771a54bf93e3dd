//! Per-domain adaptive rate limiting.
//!
//! Every outbound artwork request passes through here. Each host gets a
//! small concurrency budget and an enforced spacing between calls; hosts
//! that answer 429/403 see their spacing grow exponentially (capped) and
//! shrink again after a streak of successes, following the same
//! escalate/de-escalate shape as the downloader corruption handling.
//!
//! Both suspension points (the per-host slot and the spacing wait) observe
//! the caller's cancellation token. A cancelled admission releases any slot
//! it already held; permits are RAII so no exit path can leak one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::models::RequestOutcome;

/// Extra delay below this is treated as fully decayed.
const DECAY_FLOOR: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("request cancelled while waiting for admission")]
    Cancelled,

    #[error("url has no host: {url}")]
    InvalidUrl { url: String },
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Minimum spacing between calls to one host.
    pub base_delay: Duration,
    /// Upper bound of the random addition to each spacing, preventing
    /// synchronized retry storms across many cache keys.
    pub jitter_max: Duration,
    /// Extra delay after the first throttling response.
    pub initial_penalty: Duration,
    /// Hard cap for the extra delay.
    pub max_extra_delay: Duration,
    /// Growth factor per consecutive throttling response.
    pub backoff_multiplier: f64,
    /// Consecutive successes required to halve the extra delay.
    pub successes_to_decay: u32,
    /// Concurrency budget per host.
    pub max_concurrent_per_host: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            jitter_max: Duration::from_millis(250),
            initial_penalty: Duration::from_secs(2),
            max_extra_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            successes_to_decay: 3,
            max_concurrent_per_host: 2,
        }
    }
}

/// Read-only view of one host's live statistics, for the CDN selector.
#[derive(Debug, Clone)]
pub struct DomainStatsSnapshot {
    pub active_requests: usize,
    pub success_count: u64,
    pub failure_count: u64,
    pub extra_delay: Duration,
    pub blocked_until: Option<Instant>,
}

impl DomainStatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        self.success_count as f64 / 1.0_f64.max((self.success_count + self.failure_count) as f64)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked_until.is_some()
    }
}

struct PacingState {
    last_call: Option<Instant>,
    extra_delay: Duration,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Server-supplied Retry-After, consumed by the next admission.
    retry_after_override: Option<Duration>,
    blocked_until: Option<Instant>,
}

struct HostState {
    semaphore: Arc<Semaphore>,
    /// Fair mutex: spacing waiters for one host are served in arrival order.
    pacing: Mutex<PacingState>,
    active: AtomicUsize,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl HostState {
    fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            pacing: Mutex::new(PacingState {
                last_call: None,
                extra_delay: Duration::ZERO,
                consecutive_failures: 0,
                consecutive_successes: 0,
                retry_after_override: None,
                blocked_until: None,
            }),
            active: AtomicUsize::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }
}

/// Admission ticket for one request to one host.
///
/// Dropping it releases the concurrency slot and decrements the active
/// counter exactly once, on every exit path.
pub struct DomainPermit {
    _permit: OwnedSemaphorePermit,
    state: Arc<HostState>,
}

impl Drop for DomainPermit {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Per-host adaptive delay, backoff, and bounded concurrency.
pub struct DomainRateLimiter {
    config: RateLimiterConfig,
    hosts: StdMutex<HashMap<String, Arc<HostState>>>,
}

impl DomainRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            hosts: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Wait until a request to `url` may proceed.
    ///
    /// Suspends first on the host's concurrency slot, then on the computed
    /// spacing. Cancellation at either point returns [`AdmitError::Cancelled`]
    /// with every acquired resource released.
    pub async fn admit(
        &self,
        url: &Url,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<DomainPermit, AdmitError> {
        let host = host_of(url)?;
        let state = self.host_state(&host);

        let semaphore = state.semaphore.clone();
        let permit = tokio::select! {
            permit = semaphore.acquire_owned() => {
                permit.expect("host semaphore is never closed")
            }
            _ = cancel.cancelled() => return Err(AdmitError::Cancelled),
        };

        state.active.fetch_add(1, Ordering::SeqCst);
        // From here on the permit guards the slot and the active counter.
        let permit = DomainPermit {
            _permit: permit,
            state: state.clone(),
        };

        let mut pacing = tokio::select! {
            guard = state.pacing.lock() => guard,
            _ = cancel.cancelled() => return Err(AdmitError::Cancelled),
        };

        let spacing = match pacing.retry_after_override.take() {
            Some(hint) => hint,
            None => self.config.base_delay + pacing.extra_delay + self.jitter(),
        };
        if let Some(last_call) = pacing.last_call {
            let elapsed = last_call.elapsed();
            if elapsed < spacing {
                let wait = spacing - elapsed;
                debug!("pacing {host} for {wait:?}");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return Err(AdmitError::Cancelled),
                }
            }
        }
        pacing.last_call = Some(Instant::now());
        drop(pacing);

        Ok(permit)
    }

    /// Feed the result of a completed request back into the host state.
    pub async fn record_outcome(&self, url: &Url, outcome: RequestOutcome) {
        let Ok(host) = host_of(url) else {
            return;
        };
        let state = self.host_state(&host);
        match outcome {
            RequestOutcome::Success => {
                state.successes.fetch_add(1, Ordering::SeqCst);
                let mut pacing = state.pacing.lock().await;
                pacing.consecutive_failures = 0;
                pacing.consecutive_successes += 1;
                if pacing.consecutive_successes >= self.config.successes_to_decay {
                    pacing.consecutive_successes = 0;
                    if !pacing.extra_delay.is_zero() {
                        let halved = pacing.extra_delay / 2;
                        pacing.extra_delay = if halved < DECAY_FLOOR {
                            Duration::ZERO
                        } else {
                            halved
                        };
                        debug!(
                            "decayed extra delay for {host} to {:?}",
                            pacing.extra_delay
                        );
                    }
                }
            }
            RequestOutcome::Throttled { retry_after } => {
                state.failures.fetch_add(1, Ordering::SeqCst);
                let mut pacing = state.pacing.lock().await;
                pacing.consecutive_successes = 0;
                pacing.consecutive_failures += 1;
                pacing.extra_delay = self.penalty_for(pacing.consecutive_failures);
                if let Some(hint) = retry_after {
                    pacing.retry_after_override = Some(hint);
                }
                warn!(
                    "{host} is throttling, extra delay now {:?} (streak {})",
                    pacing.extra_delay, pacing.consecutive_failures
                );
            }
            // Content absence says nothing about the host's health or mood.
            RequestOutcome::NotFound => {}
            RequestOutcome::TransportError => {
                state.failures.fetch_add(1, Ordering::SeqCst);
                let mut pacing = state.pacing.lock().await;
                pacing.consecutive_successes = 0;
            }
        }
    }

    /// Live statistics for one host. Clears an expired block as a side
    /// effect, so selection sees fresh state without a sweeper task.
    pub async fn host_stats(&self, host: &str) -> DomainStatsSnapshot {
        let state = self.host_state(host);
        let mut pacing = state.pacing.lock().await;
        if let Some(until) = pacing.blocked_until {
            if until <= Instant::now() {
                pacing.blocked_until = None;
            }
        }
        DomainStatsSnapshot {
            active_requests: state.active.load(Ordering::SeqCst),
            success_count: state.successes.load(Ordering::SeqCst),
            failure_count: state.failures.load(Ordering::SeqCst),
            extra_delay: pacing.extra_delay,
            blocked_until: pacing.blocked_until,
        }
    }

    /// Temporarily take a host out of selection.
    pub async fn record_blocked(&self, host: &str, duration: Duration) {
        let state = self.host_state(host);
        let mut pacing = state.pacing.lock().await;
        pacing.blocked_until = Some(Instant::now() + duration);
        warn!("blocking {host} from selection for {duration:?}");
    }

    fn host_state(&self, host: &str) -> Arc<HostState> {
        let mut hosts = self.hosts.lock().unwrap();
        hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.config.max_concurrent_per_host))
            .clone()
    }

    fn penalty_for(&self, consecutive_failures: u32) -> Duration {
        let growth = self
            .config
            .backoff_multiplier
            .powi(consecutive_failures.saturating_sub(1) as i32);
        let penalty = self.config.initial_penalty.as_secs_f64() * growth;
        Duration::from_secs_f64(penalty.min(self.config.max_extra_delay.as_secs_f64()))
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.config.jitter_max.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

fn host_of(url: &Url) -> Result<String, AdmitError> {
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| AdmitError::InvalidUrl {
            url: url.to_string(),
        })
}
