//! A retrying decorator over any content session.

use std::{future::Future, path::Path, sync::Arc, time::Duration};

use bon::Builder;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tokio::{sync::Semaphore, time::Instant};
use tracing::{debug, instrument, trace, warn};

use crate::{
    hash::ContentHash,
    session::{
        ContentStream, FileAccessMode, FileRealizationMode, FileReplacementMode, OpenContent,
        PinContent, PinResult, PlaceContent, PlaceResult, SessionCounter, SessionCounters,
    },
};

/// How long a gate acquisition may take before we warn about contention.
const GATE_WAIT_WARN_THRESHOLD: Duration = Duration::from_secs(1);

/// The retry policy for session operations.
///
/// The policy is injected so that callers (and tests) control how
/// aggressive the session is; the decorator never hard-codes attempt
/// counts.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Builder)]
pub struct RetryPolicy {
    /// Total attempts per call, including the first.
    #[builder(default = 3)]
    pub max_attempts: u32,

    /// Delay between consecutive attempts.
    #[builder(default = Duration::from_millis(100))]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A session decorator adding bounded retries, a concurrency gate, and
/// per-attempt tracing to any back-end exposing the session capabilities.
///
/// ## Cloning
///
/// This type is cheaply cloneable; clones share the gate and the counters.
#[derive(Clone, Debug)]
pub struct RetryingSession<S> {
    inner: Arc<S>,
    policy: RetryPolicy,
    gate: Arc<Semaphore>,
    counters: Arc<SessionCounters>,
}

impl<S> RetryingSession<S> {
    /// Wrap a back-end with the given policy and a gate bounding the number
    /// of outstanding remote calls.
    pub fn new(inner: S, policy: RetryPolicy, max_outstanding: usize) -> Self {
        Self {
            inner: Arc::new(inner),
            policy,
            gate: Arc::new(Semaphore::new(max_outstanding)),
            counters: Arc::new(SessionCounters::default()),
        }
    }

    /// The counters shared by all clones of this session.
    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Acquire the concurrency gate, warning when acquisition stalls.
    async fn acquire_gate(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        let started = Instant::now();
        let permit = self.gate.acquire().await.context("session gate closed")?;
        let waited = started.elapsed();
        if waited > GATE_WAIT_WARN_THRESHOLD {
            self.counters.bump(SessionCounter::GateWait);
            warn!(?waited, "waited on the session concurrency gate");
        }
        Ok(permit)
    }

    /// Run `op` up to `max_attempts` times, tracing each attempt.
    ///
    /// Domain outcomes (e.g. `ContentNotFound`) come back as `Ok` and are
    /// never retried; only the error channel is.
    async fn with_retries<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            trace!(operation, attempt, "session attempt");
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts => {
                    self.counters.bump(SessionCounter::Retry);
                    debug!(operation, attempt, retry_count = attempt, ?err, "retrying");
                    tokio::time::sleep(self.policy.backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("{operation} failed after {max_attempts} attempts")
                    });
                }
            }
        }
    }
}

impl<S: PinContent> PinContent for RetryingSession<S> {
    #[instrument(skip(self))]
    async fn pin(&self, hash: &ContentHash) -> Result<PinResult> {
        let _permit = self.acquire_gate().await?;
        self.with_retries("pin", |_| self.inner.pin(hash)).await
    }

    #[instrument(skip_all, fields(hashes = hashes.len()))]
    async fn pin_bulk(&self, hashes: &[ContentHash]) -> Result<Vec<PinResult>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let _permit = self.acquire_gate().await?;
        let results = self
            .with_retries("pin_bulk", |_| self.inner.pin_bulk(hashes))
            .await?;
        if results.len() != hashes.len() {
            bail!(
                "bulk pin returned {} results for {} hashes",
                results.len(),
                hashes.len()
            );
        }
        Ok(results)
    }
}

impl<S: OpenContent> OpenContent for RetryingSession<S> {
    #[instrument(skip(self))]
    async fn open_stream(&self, hash: &ContentHash) -> Result<Option<ContentStream>> {
        let _permit = self.acquire_gate().await?;
        self.with_retries("open_stream", |_| self.inner.open_stream(hash))
            .await
    }
}

impl<S: PlaceContent> PlaceContent for RetryingSession<S> {
    #[instrument(skip(self, destination), fields(destination = ?destination))]
    async fn place_file(
        &self,
        hash: &ContentHash,
        destination: &Path,
        access: FileAccessMode,
        replacement: FileReplacementMode,
        realization: FileRealizationMode,
    ) -> Result<PlaceResult> {
        // The replacement policy is resolved locally so that we never pay a
        // remote round trip just to learn the destination was occupied.
        if replacement != FileReplacementMode::ReplaceExisting {
            let exists = tokio::fs::try_exists(destination)
                .await
                .with_context(|| format!("check existence of {destination:?}"))?;
            match (replacement, exists) {
                (FileReplacementMode::SkipIfExists, true) => {
                    trace!(?destination, "destination exists; skipping place");
                    return Ok(PlaceResult::AlreadyExists);
                }
                (FileReplacementMode::FailIfExists, true) => {
                    bail!("file exists: {destination:?}");
                }
                _ => {}
            }
        }

        let _permit = self.acquire_gate().await?;
        self.with_retries("place_file", |_| {
            self.inner
                .place_file(hash, destination, access, replacement, realization)
        })
        .await
    }
}
