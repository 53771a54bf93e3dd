//! Data models for the image cache.
//!
//! Defines the supported language set, request/outcome types, and the
//! failure taxonomy used to drive retry and throttling decisions.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Supported catalog languages.
///
/// Cache entries are stored per language; `English` is the fallback for
/// every other language and has no fallback of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    German,
    French,
    Spanish,
    Schinese,
    Tchinese,
    Japanese,
    Koreana,
    Russian,
    Italian,
    Polish,
    Brazilian,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::English => "english",
            Language::German => "german",
            Language::French => "french",
            Language::Spanish => "spanish",
            Language::Schinese => "schinese",
            Language::Tchinese => "tchinese",
            Language::Japanese => "japanese",
            Language::Koreana => "koreana",
            Language::Russian => "russian",
            Language::Italian => "italian",
            Language::Polish => "polish",
            Language::Brazilian => "brazilian",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "english" => Some(Language::English),
            "german" => Some(Language::German),
            "french" => Some(Language::French),
            "spanish" => Some(Language::Spanish),
            "schinese" => Some(Language::Schinese),
            "tchinese" => Some(Language::Tchinese),
            "japanese" => Some(Language::Japanese),
            // Store APIs use "koreana"; accept the plain form too.
            "koreana" | "korean" => Some(Language::Koreana),
            "russian" => Some(Language::Russian),
            "italian" => Some(Language::Italian),
            "polish" => Some(Language::Polish),
            "brazilian" => Some(Language::Brazilian),
            _ => None,
        }
    }

    pub fn all() -> &'static [Language] {
        &[
            Language::English,
            Language::German,
            Language::French,
            Language::Spanish,
            Language::Schinese,
            Language::Tchinese,
            Language::Japanese,
            Language::Koreana,
            Language::Russian,
            Language::Italian,
            Language::Polish,
            Language::Brazilian,
        ]
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single artwork request from a caller.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    /// Catalog item identifier (numeric for store items, opaque otherwise).
    pub item_id: String,
    /// Candidate URLs in the caller's preference order, typically one per
    /// CDN mirror with the store-API-resolved image first.
    pub candidate_urls: Vec<Url>,
    pub language: Language,
    /// Human-readable name recorded alongside failures for diagnostics.
    pub display_name: Option<String>,
    /// Cancels the request at any suspension point.
    pub cancel: CancellationToken,
}

impl ImageRequest {
    pub fn new(item_id: impl Into<String>, candidate_urls: Vec<Url>, language: Language) -> Self {
        Self {
            item_id: item_id.into(),
            candidate_urls,
            language,
            display_name: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of a `get_image` call.
///
/// Ordinary network failure is not an error: callers get an empty outcome
/// and the presentation layer renders its placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageOutcome {
    /// Local path of a valid cached image, absent when every attempt failed.
    pub path: Option<PathBuf>,
    /// True when this call performed the download, false for cache hits and
    /// fallback reuse.
    pub downloaded: bool,
}

impl ImageOutcome {
    pub fn hit(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            downloaded: false,
        }
    }

    pub fn fetched(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            downloaded: true,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none()
    }
}

/// Outcome of one outbound request, reported back to the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    /// 429 or 403: the host is pushing back. Grows the per-host delay.
    Throttled { retry_after: Option<Duration> },
    /// 404 and other client errors: the item is absent. Leaves the delay
    /// and the host statistics untouched.
    NotFound,
    /// DNS/timeout/reset. Counts against host health, not against pacing.
    TransportError,
}

/// Why a single URL attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum FetchFailure {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("throttled by host (status {status})")]
    Throttled {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("not found (status {status})")]
    NotFound { status: u16 },

    #[error("response bytes are not a recognized image")]
    InvalidContent,

    #[error("request cancelled")]
    Cancelled,

    #[error("candidate url has no host")]
    InvalidUrl,

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl FetchFailure {
    /// The throttling signal reported to the rate limiter for this failure.
    /// Cancelled attempts report nothing.
    pub fn outcome(&self) -> Option<RequestOutcome> {
        match self {
            FetchFailure::Throttled {
                retry_after: hint, ..
            } => Some(RequestOutcome::Throttled { retry_after: *hint }),
            // Validation failure is equivalent to content absence: the host
            // answered, the item just is not a usable image.
            FetchFailure::NotFound { .. } | FetchFailure::InvalidContent => {
                Some(RequestOutcome::NotFound)
            }
            FetchFailure::Transport(_) | FetchFailure::Storage(_) => {
                Some(RequestOutcome::TransportError)
            }
            FetchFailure::Cancelled | FetchFailure::InvalidUrl => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_round_trip() {
        for lang in Language::all() {
            assert_eq!(Language::from_str(lang.as_str()), Some(*lang));
        }
        assert_eq!(Language::from_str("klingon"), None);
    }

    #[test]
    fn test_language_serde_names_are_lowercase() {
        let s = serde_json::to_string(&Language::Schinese).unwrap();
        assert_eq!(s, "\"schinese\"");
        let back: Language = serde_json::from_str(&s).unwrap();
        assert_eq!(back, Language::Schinese);
    }

    #[test]
    fn test_throttled_failure_maps_to_throttled_outcome() {
        let failure = FetchFailure::Throttled {
            status: 429,
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(
            failure.outcome(),
            Some(RequestOutcome::Throttled {
                retry_after: Some(Duration::from_secs(5))
            })
        );
    }

    #[test]
    fn test_invalid_content_is_content_absence() {
        assert_eq!(
            FetchFailure::InvalidContent.outcome(),
            Some(RequestOutcome::NotFound)
        );
        assert_eq!(
            FetchFailure::NotFound { status: 404 }.outcome(),
            Some(RequestOutcome::NotFound)
        );
        assert_eq!(FetchFailure::Cancelled.outcome(), None);
    }
}
