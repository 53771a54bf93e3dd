//! Mirror selection for candidate artwork URLs.
//!
//! Candidate lists usually contain the same artifact on several
//! interchangeable hosts. Selection orders them by a static preference
//! weight multiplied by the host's live success rate, so a flaky mirror
//! drifts to the back of the line without ever being written off entirely.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

use super::rate_limiter::DomainRateLimiter;

#[derive(Debug, Error)]
pub enum SelectorError {
    /// An empty candidate list is a caller contract violation.
    #[error("candidate url list is empty")]
    NoCandidates,
}

#[derive(Debug, Clone, Default)]
pub struct CdnSelectorConfig {
    /// Hosts in static preference order (primary CDN first). Hosts not
    /// listed rank below every listed one, all else being equal.
    pub preferred_hosts: Vec<String>,
}

/// Orders candidate URLs by host health and static preference.
pub struct CdnSelector {
    limiter: Arc<DomainRateLimiter>,
    config: CdnSelectorConfig,
}

struct HostGroup {
    host: String,
    first_index: usize,
    urls: Vec<Url>,
}

impl CdnSelector {
    pub fn new(limiter: Arc<DomainRateLimiter>, config: CdnSelectorConfig) -> Self {
        Self { limiter, config }
    }

    /// Order `candidates` best-first.
    ///
    /// Hosts inside a block window are excluded, unless that would empty the
    /// result, in which case the caller's original first candidate is
    /// returned as a last resort. Ties keep the caller's order.
    pub async fn choose_order(&self, candidates: &[Url]) -> Result<Vec<Url>, SelectorError> {
        if candidates.is_empty() {
            return Err(SelectorError::NoCandidates);
        }

        let mut groups: Vec<HostGroup> = Vec::new();
        for (index, url) in candidates.iter().enumerate() {
            let Some(host) = url.host_str() else {
                continue;
            };
            match groups.iter_mut().find(|g| g.host == host) {
                Some(group) => group.urls.push(url.clone()),
                None => groups.push(HostGroup {
                    host: host.to_string(),
                    first_index: index,
                    urls: vec![url.clone()],
                }),
            }
        }
        if groups.is_empty() {
            // Hostless URLs only; hand them back untouched.
            return Ok(candidates.to_vec());
        }

        let max_concurrent = self.limiter.config().max_concurrent_per_host;
        let mut scored: Vec<(bool, bool, f64, usize, Vec<Url>)> = Vec::new();
        for group in groups {
            // host_stats clears expired blocks lazily.
            let stats = self.limiter.host_stats(&group.host).await;
            let score = self.priority(&group.host) * stats.success_rate();
            let saturated = stats.active_requests >= max_concurrent;
            scored.push((
                stats.is_blocked(),
                saturated,
                score,
                group.first_index,
                group.urls,
            ));
        }

        scored.sort_by(|a, b| {
            // Saturated hosts sink, higher score floats, caller order breaks
            // ties. Block state is filtered below, not sorted.
            a.1.cmp(&b.1)
                .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.3.cmp(&b.3))
        });

        let ordered: Vec<Url> = scored
            .iter()
            .filter(|(blocked, ..)| !blocked)
            .flat_map(|(_, _, _, _, urls)| urls.iter().cloned())
            .collect();

        if ordered.is_empty() {
            // Every host is blocked; better one long-shot attempt than none.
            return Ok(vec![candidates[0].clone()]);
        }
        Ok(ordered)
    }

    /// Take a host out of selection for `duration`.
    pub async fn record_blocked(&self, host: &str, duration: Duration) {
        self.limiter.record_blocked(host, duration).await;
    }

    fn priority(&self, host: &str) -> f64 {
        match self.config.preferred_hosts.iter().position(|h| h == host) {
            Some(position) => (self.config.preferred_hosts.len() - position + 1) as f64,
            None => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_cache::models::RequestOutcome;
    use crate::image_cache::rate_limiter::RateLimiterConfig;
    use tokio_util::sync::CancellationToken;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn make_selector(preferred: &[&str]) -> (CdnSelector, Arc<DomainRateLimiter>) {
        let limiter = Arc::new(DomainRateLimiter::new(RateLimiterConfig {
            jitter_max: Duration::ZERO,
            ..RateLimiterConfig::default()
        }));
        let selector = CdnSelector::new(
            limiter.clone(),
            CdnSelectorConfig {
                preferred_hosts: preferred.iter().map(|s| s.to_string()).collect(),
            },
        );
        (selector, limiter)
    }

    #[tokio::test]
    async fn test_empty_candidates_is_an_error() {
        let (selector, _) = make_selector(&[]);
        let result = selector.choose_order(&[]).await;
        assert!(matches!(result, Err(SelectorError::NoCandidates)));
    }

    #[tokio::test]
    async fn test_ties_keep_caller_order() {
        let (selector, _) = make_selector(&[]);
        let candidates = vec![
            url("https://a.example.com/1.png"),
            url("https://b.example.com/1.png"),
            url("https://c.example.com/1.png"),
        ];

        let ordered = selector.choose_order(&candidates).await.unwrap();
        assert_eq!(ordered, candidates);
    }

    #[tokio::test]
    async fn test_preferred_host_wins_with_equal_health() {
        let (selector, limiter) = make_selector(&["primary.example.com"]);
        // Give both hosts one success so their rates are equal and nonzero.
        for host in ["mirror.example.com", "primary.example.com"] {
            let u = url(&format!("https://{host}/1.png"));
            limiter.record_outcome(&u, RequestOutcome::Success).await;
        }
        let candidates = vec![
            url("https://mirror.example.com/1.png"),
            url("https://primary.example.com/1.png"),
        ];

        let ordered = selector.choose_order(&candidates).await.unwrap();
        assert_eq!(ordered[0].host_str(), Some("primary.example.com"));
    }

    #[tokio::test]
    async fn test_unhealthy_host_ranks_below_healthy_one() {
        let (selector, limiter) = make_selector(&[]);
        let healthy = url("https://healthy.example.com/1.png");
        let flaky = url("https://flaky.example.com/1.png");

        limiter.record_outcome(&healthy, RequestOutcome::Success).await;
        limiter.record_outcome(&flaky, RequestOutcome::Success).await;
        for _ in 0..3 {
            limiter
                .record_outcome(&flaky, RequestOutcome::TransportError)
                .await;
        }

        let ordered = selector
            .choose_order(&[flaky.clone(), healthy.clone()])
            .await
            .unwrap();
        assert_eq!(ordered[0], healthy);
        assert_eq!(ordered[1], flaky);
    }

    #[tokio::test]
    async fn test_blocked_host_is_excluded() {
        let (selector, _limiter) = make_selector(&[]);
        let blocked = url("https://blocked.example.com/1.png");
        let open = url("https://open.example.com/1.png");

        selector
            .record_blocked("blocked.example.com", Duration::from_secs(60))
            .await;

        let ordered = selector
            .choose_order(&[blocked.clone(), open.clone()])
            .await
            .unwrap();
        assert_eq!(ordered, vec![open]);
    }

    #[tokio::test]
    async fn test_all_blocked_falls_back_to_first_candidate() {
        let (selector, _limiter) = make_selector(&[]);
        let first = url("https://a.example.com/1.png");
        let second = url("https://b.example.com/1.png");

        selector
            .record_blocked("a.example.com", Duration::from_secs(60))
            .await;
        selector
            .record_blocked("b.example.com", Duration::from_secs(60))
            .await;

        let ordered = selector
            .choose_order(&[first.clone(), second])
            .await
            .unwrap();
        assert_eq!(ordered, vec![first]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_block_is_cleared_on_selection() {
        let (selector, _limiter) = make_selector(&[]);
        let a = url("https://a.example.com/1.png");
        let b = url("https://b.example.com/1.png");

        selector
            .record_blocked("a.example.com", Duration::from_secs(5))
            .await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        let ordered = selector.choose_order(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(ordered, vec![a, b]);
    }

    #[tokio::test]
    async fn test_saturated_host_is_deprioritized_not_excluded() {
        let limiter = Arc::new(DomainRateLimiter::new(RateLimiterConfig {
            jitter_max: Duration::ZERO,
            base_delay: Duration::ZERO,
            max_concurrent_per_host: 1,
            ..RateLimiterConfig::default()
        }));
        let selector = CdnSelector::new(limiter.clone(), CdnSelectorConfig::default());

        let busy = url("https://busy.example.com/1.png");
        let idle = url("https://idle.example.com/1.png");

        // Equal health.
        limiter.record_outcome(&busy, RequestOutcome::Success).await;
        limiter.record_outcome(&idle, RequestOutcome::Success).await;

        let cancel = CancellationToken::new();
        let _held = limiter.admit(&busy, &cancel).await.unwrap();

        let ordered = selector
            .choose_order(&[busy.clone(), idle.clone()])
            .await
            .unwrap();
        assert_eq!(ordered, vec![idle, busy]);
    }

    #[tokio::test]
    async fn test_urls_of_one_host_stay_grouped_in_order() {
        let (selector, limiter) = make_selector(&[]);
        let a1 = url("https://a.example.com/1.png");
        let a2 = url("https://a.example.com/2.png");
        let b = url("https://b.example.com/1.png");

        // Make b healthier than a so it leads.
        limiter.record_outcome(&b, RequestOutcome::Success).await;

        let ordered = selector
            .choose_order(&[a1.clone(), b.clone(), a2.clone()])
            .await
            .unwrap();
        assert_eq!(ordered, vec![b, a1, a2]);
    }
}
