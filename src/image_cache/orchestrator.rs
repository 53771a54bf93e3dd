//! Image cache orchestration.
//!
//! The façade the catalog browser talks to. Resolves cache hits from disk,
//! drives ordered URL attempts through the rate limiter, validates content,
//! persists results atomically, and falls back to English artwork when a
//! localized image cannot be produced.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::image_cache::cdn_selector::{CdnSelector, CdnSelectorConfig, SelectorError};
use crate::image_cache::ledger::{FailureLedger, LedgerConfig};
use crate::image_cache::models::{
    FetchFailure, ImageOutcome, ImageRequest, Language, RequestOutcome,
};
use crate::image_cache::progress::{ProgressCallback, ProgressTracker};
use crate::image_cache::rate_limiter::{AdmitError, DomainRateLimiter, RateLimiterConfig};
use crate::image_cache::validator::ImageFormat;

/// Settings for one cache instance.
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    /// Directory holding one subdirectory per language plus the ledger.
    pub cache_root: PathBuf,
    /// Entries older than this get a header re-check before being served.
    pub entry_ttl: Duration,
    /// Fixed client-level timeout per HTTP request.
    pub request_timeout: Duration,
    /// Total simultaneous downloads across all hosts.
    pub max_parallel_downloads: usize,
    pub user_agent: String,
    pub rate_limiter: RateLimiterConfig,
    pub selector: CdnSelectorConfig,
    pub ledger: LedgerConfig,
}

impl ImageCacheConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            entry_ttl: Duration::from_secs(30 * 24 * 3600),
            request_timeout: Duration::from_secs(30),
            max_parallel_downloads: 4,
            user_agent: format!("cover-cache/{}", env!("CARGO_PKG_VERSION")),
            rate_limiter: RateLimiterConfig::default(),
            selector: CdnSelectorConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.cache_root.join("image_failures.json")
    }
}

type SharedFetch = Shared<BoxFuture<'static, ImageOutcome>>;

/// Long-lived artwork cache. Construct once at startup and hand clones to
/// every caller; all clones share one state.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: ImageCacheConfig,
    http: Client,
    limiter: Arc<DomainRateLimiter>,
    selector: CdnSelector,
    ledger: FailureLedger,
    global_slots: Arc<Semaphore>,
    /// Duplicate concurrent requests for one target collapse onto the same
    /// in-flight future, so N callers trigger exactly one download.
    in_flight: Mutex<HashMap<PathBuf, SharedFetch>>,
    progress: ProgressTracker,
}

impl ImageCache {
    pub fn new(config: ImageCacheConfig) -> anyhow::Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Construct with an explicit clock; tests use this to age ledger
    /// records without rewriting files by hand.
    pub fn with_clock(config: ImageCacheConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let limiter = Arc::new(DomainRateLimiter::new(config.rate_limiter.clone()));
        let selector = CdnSelector::new(limiter.clone(), config.selector.clone());
        let ledger = FailureLedger::open(config.ledger_path(), clock, config.ledger.clone());
        let global_slots = Arc::new(Semaphore::new(config.max_parallel_downloads));

        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                http,
                limiter,
                selector,
                ledger,
                global_slots,
                in_flight: Mutex::new(HashMap::new()),
                progress: ProgressTracker::new(),
            }),
        })
    }

    /// Resolve artwork for one catalog item.
    ///
    /// Never fails for ordinary network trouble; an empty outcome means the
    /// caller should render its placeholder.
    pub async fn get_image(&self, request: ImageRequest) -> ImageOutcome {
        self.inner.progress.request_started();
        let outcome = self.resolve(&request, true).await;
        self.inner.progress.request_completed();
        outcome
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        self.inner.progress.set_callback(callback);
    }

    pub fn clear_progress_callback(&self) {
        self.inner.progress.clear_callback();
    }

    /// Current (completed, total) progress counters.
    pub fn progress(&self) -> (usize, usize) {
        self.inner.progress.snapshot()
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.inner.ledger
    }

    /// Delete cached files for one language, or for all of them.
    /// The failure ledger is left alone.
    pub fn clear_cache(&self, language: Option<Language>) -> anyhow::Result<()> {
        let languages: Vec<Language> = match language {
            Some(lang) => vec![lang],
            None => Language::all().to_vec(),
        };
        for lang in languages {
            let dir = self.inner.config.cache_root.join(lang.as_str());
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => info!("cleared cached artwork in {dir:?}"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("clearing {dir:?}"));
                }
            }
        }
        Ok(())
    }

    /// Periodic upkeep: drops failure records past retention.
    pub fn run_maintenance(&self) -> anyhow::Result<usize> {
        Ok(self.inner.ledger.prune()?)
    }

    async fn resolve(&self, request: &ImageRequest, allow_fallback: bool) -> ImageOutcome {
        // Hot path: a valid, fresh entry never touches the network.
        if let Some(path) = self.find_valid_entry(&request.item_id, request.language) {
            return ImageOutcome::hit(path);
        }

        if self
            .inner
            .ledger
            .should_skip(&request.item_id, request.language)
        {
            debug!(
                "skipping {}/{}: failed recently",
                request.item_id, request.language
            );
            if allow_fallback {
                return self.english_fallback(request).await;
            }
            return ImageOutcome::empty();
        }

        let outcome = self.coalesced_download(request).await;
        if !outcome.is_empty() {
            return outcome;
        }

        if allow_fallback {
            return self.english_fallback(request).await;
        }
        ImageOutcome::empty()
    }

    /// Reuse English artwork when the localized image cannot be produced.
    ///
    /// A cached English entry is returned verbatim; it is NOT copied into
    /// the requested language's directory. A copy would masquerade as a
    /// localized entry and starve future retries for the real one.
    async fn english_fallback(&self, request: &ImageRequest) -> ImageOutcome {
        if request.language == Language::English {
            return ImageOutcome::empty();
        }
        let mut english = request.clone();
        english.language = Language::English;
        // English has no further fallback of its own.
        let outcome = Box::pin(self.resolve(&english, false)).await;
        if outcome.downloaded {
            // A fresh English download satisfied the caller; the CDN is
            // serving this item again, so the localized key gets another
            // chance on its next request.
            if let Err(err) = self.inner.ledger.clear(&request.item_id, request.language) {
                warn!("could not clear ledger record: {err}");
            }
        }
        outcome
    }

    async fn coalesced_download(&self, request: &ImageRequest) -> ImageOutcome {
        let key = self.entry_stem(&request.item_id, request.language);

        let fetch: SharedFetch = {
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    // Spawned so the download owns its permits and always
                    // runs to completion even if every caller stops polling.
                    let task = tokio::spawn({
                        let cache = self.clone();
                        let request = request.clone();
                        async move { cache.download_and_store(&request).await }
                    });
                    let fetch: SharedFetch = {
                        let cache = self.clone();
                        let key = key.clone();
                        async move {
                            let outcome = match task.await {
                                Ok(outcome) => outcome,
                                Err(err) => {
                                    error!("download task failed: {err}");
                                    ImageOutcome::empty()
                                }
                            };
                            cache.inner.in_flight.lock().await.remove(&key);
                            outcome
                        }
                        .boxed()
                        .shared()
                    };
                    in_flight.insert(key.clone(), fetch.clone());
                    fetch
                }
            }
        };

        fetch.await
    }

    /// Try every candidate URL in selector order; on exhaustion record a
    /// conclusive failure.
    async fn download_and_store(&self, request: &ImageRequest) -> ImageOutcome {
        let slots = self.inner.global_slots.clone();
        let _global = tokio::select! {
            permit = slots.acquire_owned() => {
                permit.expect("global download semaphore is never closed")
            }
            _ = request.cancel.cancelled() => return ImageOutcome::empty(),
        };

        let ordered = match self.inner.selector.choose_order(&request.candidate_urls).await {
            Ok(ordered) => ordered,
            Err(SelectorError::NoCandidates) => {
                debug_assert!(false, "get_image called with no candidate urls");
                error!(
                    "no candidate urls for {}/{}",
                    request.item_id, request.language
                );
                return ImageOutcome::empty();
            }
        };

        let mut conclusive_failure = false;
        for url in &ordered {
            match self.try_fetch_one(request, url).await {
                Ok(path) => {
                    if let Err(err) = self.inner.ledger.clear(&request.item_id, request.language) {
                        warn!("could not clear ledger record: {err}");
                    }
                    info!(
                        "downloaded artwork for {}/{} from {}",
                        request.item_id,
                        request.language,
                        url.host_str().unwrap_or("?")
                    );
                    return ImageOutcome::fetched(path);
                }
                Err(FetchFailure::Cancelled) => {
                    debug!(
                        "download of {}/{} cancelled",
                        request.item_id, request.language
                    );
                    return ImageOutcome::empty();
                }
                Err(failure) => {
                    // Throttling is transient; it must not poison the ledger
                    // for days on its own.
                    if !matches!(failure, FetchFailure::Throttled { .. }) {
                        conclusive_failure = true;
                    }
                    debug!("attempt against {url} failed: {failure}");
                }
            }
        }

        if conclusive_failure {
            if let Err(err) = self.inner.ledger.record_failure(
                &request.item_id,
                request.language,
                request.display_name.as_deref(),
            ) {
                warn!("could not record ledger failure: {err}");
            }
        }
        ImageOutcome::empty()
    }

    async fn try_fetch_one(
        &self,
        request: &ImageRequest,
        url: &Url,
    ) -> Result<PathBuf, FetchFailure> {
        let permit = match self.inner.limiter.admit(url, &request.cancel).await {
            Ok(permit) => permit,
            Err(AdmitError::Cancelled) => return Err(FetchFailure::Cancelled),
            Err(AdmitError::InvalidUrl { .. }) => return Err(FetchFailure::InvalidUrl),
        };

        let result = self.fetch_bytes(request, url).await;
        drop(permit);

        match &result {
            Ok(_) => {
                self.inner
                    .limiter
                    .record_outcome(url, RequestOutcome::Success)
                    .await;
            }
            Err(failure) => {
                if let Some(outcome) = failure.outcome() {
                    self.inner.limiter.record_outcome(url, outcome).await;
                }
            }
        }

        let (bytes, format) = result?;
        let path = self
            .store_entry(&request.item_id, request.language, &bytes, format)
            .map_err(FetchFailure::Storage)?;
        Ok(path)
    }

    /// One HTTP GET plus content sniff. The Content-Type header is advisory
    /// only; the magic-byte sniff is the canonical format decision.
    async fn fetch_bytes(
        &self,
        request: &ImageRequest,
        url: &Url,
    ) -> Result<(Vec<u8>, ImageFormat), FetchFailure> {
        let send = self
            .inner
            .http
            .get(url.clone())
            .header(ACCEPT, ImageFormat::accept_header())
            .send();
        let response = tokio::select! {
            response = send => response?,
            _ = request.cancel.cancelled() => return Err(FetchFailure::Cancelled),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::FORBIDDEN {
            return Err(FetchFailure::Throttled {
                status: status.as_u16(),
                retry_after: parse_retry_after(response.headers()),
            });
        }
        if !status.is_success() {
            return Err(FetchFailure::NotFound {
                status: status.as_u16(),
            });
        }

        let bytes = tokio::select! {
            bytes = response.bytes() => bytes?.to_vec(),
            _ = request.cancel.cancelled() => return Err(FetchFailure::Cancelled),
        };

        match ImageFormat::sniff(&bytes) {
            Some(format) => Ok((bytes, format)),
            None => Err(FetchFailure::InvalidContent),
        }
    }

    /// Commit bytes to `<root>/<language>/<id>.<ext>` via temp file + atomic
    /// rename, so a partially written entry can never be observed.
    fn store_entry(
        &self,
        item_id: &str,
        language: Language,
        bytes: &[u8],
        format: ImageFormat,
    ) -> std::io::Result<PathBuf> {
        let dir = self.inner.config.cache_root.join(language.as_str());
        std::fs::create_dir_all(&dir)?;

        // Drop leftovers in other formats so lookups see a single entry.
        for other in ImageFormat::all() {
            if *other != format {
                let stale = dir.join(format!("{item_id}.{}", other.extension()));
                if stale.exists() {
                    let _ = std::fs::remove_file(stale);
                }
            }
        }

        let path = dir.join(format!("{item_id}.{}", format.extension()));
        let temp = tempfile::NamedTempFile::new_in(&dir)?;
        std::fs::write(temp.path(), bytes)?;
        temp.persist(&path).map_err(|err| err.error)?;
        Ok(path)
    }

    /// Locate a usable cache entry for the key.
    ///
    /// Fresh entries are served as-is. Stale entries get their header
    /// re-checked; an entry that no longer sniffs as an image is evicted
    /// and treated as a miss.
    fn find_valid_entry(&self, item_id: &str, language: Language) -> Option<PathBuf> {
        let dir = self.inner.config.cache_root.join(language.as_str());
        for format in ImageFormat::all() {
            let path = dir.join(format!("{item_id}.{}", format.extension()));
            let Ok(metadata) = std::fs::metadata(&path) else {
                continue;
            };
            let fresh = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .map(|age| age < self.inner.config.entry_ttl)
                .unwrap_or(false);
            if fresh {
                return Some(path);
            }
            if Self::revalidate(&path) {
                return Some(path);
            }
            info!("evicting invalid cache entry {path:?}");
            let _ = std::fs::remove_file(&path);
        }
        None
    }

    fn revalidate(path: &std::path::Path) -> bool {
        use std::io::Read;
        let Ok(mut file) = std::fs::File::open(path) else {
            return false;
        };
        let mut header = [0u8; 64];
        let Ok(read) = file.read(&mut header) else {
            return false;
        };
        ImageFormat::sniff(&header[..read]).is_some()
    }

    fn entry_stem(&self, item_id: &str, language: Language) -> PathBuf {
        self.inner
            .config
            .cache_root
            .join(language.as_str())
            .join(item_id)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_parses_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_retry_after_ignores_http_dates() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_config_defaults() {
        let config = ImageCacheConfig::new("/tmp/covers");
        assert_eq!(config.entry_ttl, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_parallel_downloads, 4);
        assert_eq!(
            config.ledger_path(),
            PathBuf::from("/tmp/covers/image_failures.json")
        );
    }
}
