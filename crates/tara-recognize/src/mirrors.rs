//! Racing model downloads across mirrors.
//!
//! Sources are optionally probed in parallel, reordered so reachable ones
//! come first, then attempted one at a time. Every attempt is bounded by a
//! per-source timeout and the whole procedure by a global one.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::time::error::Elapsed;
use tracing::{debug, info, warn};

/// Errors while obtaining the local model.
#[derive(Debug, Clone, Error)]
pub enum ModelLoadError {
    #[error("model download timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("downloaded model failed verification: {0}")]
    Integrity(String),

    #[error("model file error: {0}")]
    Io(String),

    #[error("no model sources configured")]
    NoSources,

    #[error("this build has no local recognition backend")]
    Unsupported,

    #[error("model failed to load: {0}")]
    Unknown(String),
}

/// Coarse classification used for user-facing messages and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadErrorClass {
    Timeout,
    Network,
    Unsupported,
    Unknown,
}

impl LoadErrorClass {
    pub fn name(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Unsupported => "unsupported",
            Self::Unknown => "unknown",
        }
    }
}

impl ModelLoadError {
    pub fn class(&self) -> LoadErrorClass {
        match self {
            Self::Timeout => LoadErrorClass::Timeout,
            Self::Network(_) => LoadErrorClass::Network,
            Self::Unsupported => LoadErrorClass::Unsupported,
            Self::Integrity(_) | Self::Io(_) | Self::NoSources | Self::Unknown(_) => {
                LoadErrorClass::Unknown
            }
        }
    }

    /// Message shown to the user when voice input falls back.
    pub fn user_message(&self) -> &'static str {
        match self.class() {
            LoadErrorClass::Timeout => {
                "The offline speech model took too long to download. Using another voice input method."
            }
            LoadErrorClass::Network => {
                "The offline speech model could not be downloaded. Check your connection."
            }
            LoadErrorClass::Unsupported => "Offline speech recognition is not available in this build.",
            LoadErrorClass::Unknown => {
                "The offline speech model could not be loaded. Using another voice input method."
            }
        }
    }
}

impl From<reqwest::Error> for ModelLoadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// One place the model can be downloaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    pub url: String,
}

impl ModelSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Source for `filename` below a mirror base URL.
    pub fn from_mirror(base: &str, filename: &str) -> Self {
        Self::new(format!("{}/{}", base.trim_end_matches('/'), filename))
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Timeouts for [`fetch_from_mirrors`].
#[derive(Debug, Clone, Copy)]
pub struct MirrorPolicy {
    /// Run the existence check before downloading
    pub probe: bool,
    pub probe_timeout: Duration,
    pub source_timeout: Duration,
    pub global_timeout: Duration,
}

impl Default for MirrorPolicy {
    fn default() -> Self {
        Self {
            probe: true,
            probe_timeout: Duration::from_secs(5),
            source_timeout: Duration::from_secs(30),
            global_timeout: Duration::from_secs(60),
        }
    }
}

/// Progress callback receiving (bytes_downloaded, total_bytes).
pub type ProgressFn<'a> = dyn Fn(u64, u64) + Send + Sync + 'a;

/// Fetches something from a single source.
#[async_trait]
pub trait SourceFetcher<T>: Send + Sync {
    /// Cheap existence check (an HTTP HEAD for downloads).
    async fn exists(&self, source: &ModelSource) -> bool;

    /// Fetches from one source.
    async fn fetch(&self, source: &ModelSource, progress: &ProgressFn<'_>) -> Result<T, ModelLoadError>;
}

/// A successful fetch and where it came from.
#[derive(Debug)]
pub struct Fetched<T> {
    pub value: T,
    pub source: ModelSource,
}

/// Why [`fetch_from_mirrors`] gave up.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct MirrorFailure {
    /// The last error seen, or `Timeout` when the global bound was hit
    pub error: ModelLoadError,
    /// Whether any source passed the existence check
    pub reachable: bool,
}

/// Bounds `attempt` by `limit`.
pub async fn race_with_timeout<F: Future>(attempt: F, limit: Duration) -> Result<F::Output, Elapsed> {
    tokio::time::timeout(limit, attempt).await
}

/// Checks every source in parallel. Each check is bounded by `timeout`; a
/// check that times out counts as failed.
pub async fn probe_sources<T, F>(fetcher: &F, sources: &[ModelSource], timeout: Duration) -> Vec<bool>
where
    F: SourceFetcher<T> + ?Sized,
{
    join_all(sources.iter().map(|source| async move {
        let passed = race_with_timeout(fetcher.exists(source), timeout)
            .await
            .unwrap_or(false);
        debug!(source = %source, passed, "Probed model source");
        passed
    }))
    .await
}

/// Orders sources so the ones that passed the probe come first, keeping
/// the configured order otherwise. If none passed the full list is
/// returned unchanged.
pub fn prioritize(sources: &[ModelSource], passed: &[bool]) -> Vec<ModelSource> {
    let passed_at = |i: usize| passed.get(i).copied().unwrap_or(false);
    if !(0..sources.len()).any(passed_at) {
        return sources.to_vec();
    }

    let (mut first, rest): (Vec<_>, Vec<_>) = sources
        .iter()
        .enumerate()
        .partition(|(i, _)| passed_at(*i));
    first.extend(rest);
    first.into_iter().map(|(_, s)| s.clone()).collect()
}

/// Fetches from the first source that succeeds within the policy's bounds.
pub async fn fetch_from_mirrors<T, F>(
    fetcher: &F,
    sources: &[ModelSource],
    policy: &MirrorPolicy,
    progress: &ProgressFn<'_>,
) -> Result<Fetched<T>, MirrorFailure>
where
    T: Send,
    F: SourceFetcher<T> + ?Sized,
{
    if sources.is_empty() {
        return Err(MirrorFailure {
            error: ModelLoadError::NoSources,
            reachable: false,
        });
    }

    let reachable = AtomicBool::new(false);

    let attempts = async {
        let ordered = if policy.probe {
            let passed = probe_sources::<T, F>(fetcher, sources, policy.probe_timeout).await;
            reachable.store(passed.iter().any(|p| *p), Ordering::Relaxed);
            prioritize(sources, &passed)
        } else {
            sources.to_vec()
        };

        let mut last_error = None;
        for source in ordered {
            info!(source = %source, "Fetching model");
            match race_with_timeout(fetcher.fetch(&source, progress), policy.source_timeout).await {
                Ok(Ok(value)) => {
                    reachable.store(true, Ordering::Relaxed);
                    return Ok(Fetched { value, source });
                }
                Ok(Err(e)) => {
                    warn!(source = %source, error = %e, "Model source failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(source = %source, timeout = ?policy.source_timeout, "Model source timed out");
                    last_error = Some(ModelLoadError::Timeout);
                }
            }
        }
        Err(last_error.unwrap_or(ModelLoadError::NoSources))
    };

    match race_with_timeout(attempts, policy.global_timeout).await {
        Ok(Ok(fetched)) => Ok(fetched),
        Ok(Err(error)) => Err(MirrorFailure {
            error,
            reachable: reachable.load(Ordering::Relaxed),
        }),
        Err(_) => {
            warn!(timeout = ?policy.global_timeout, "Model acquisition abandoned");
            Err(MirrorFailure {
                error: ModelLoadError::Timeout,
                reachable: reachable.load(Ordering::Relaxed),
            })
        }
    }
}
