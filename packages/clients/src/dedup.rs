//! Dedup-aware pinning.
//!
//! Dedup content is either a *chunk* (a leaf holding bytes) or a *node* (an
//! interior entry referencing children). Pinning a chunk is a single store
//! call; pinning a node walks the tree only as deep as the store reports
//! insufficient TTL, and cheap root checks let most pins be skipped or
//! detached entirely.

use std::sync::Arc;

use bon::Builder;
use color_eyre::{Result, eyre::Context};
use jiff::{SignedDuration, Timestamp};
use tracing::{instrument, trace, warn};

use crate::{
    hash::{ContentHash, DedupRef},
    session::{PinResult, SessionCounter, SessionCounters},
};

/// The store operations the pinner needs.
///
/// Back-ends implement this against the real dedup service; tests script
/// it. All operations are cheap metadata calls except `pin_chunk`, which
/// may touch storage.
pub trait DedupStore: Send + Sync + 'static {
    /// Query the expiry of a node's root entry, if the node exists.
    fn keep_until(
        &self,
        node: &ContentHash,
    ) -> impl Future<Output = Result<Option<Timestamp>>> + Send;

    /// Ask the store to extend a node and everything it references.
    fn try_keep_until_reference_node(
        &self,
        node: &ContentHash,
        keep_until: Timestamp,
    ) -> impl Future<Output = Result<ReferenceNodeOutcome>> + Send;

    /// Enumerate a node's direct children.
    fn enumerate_children(
        &self,
        node: &ContentHash,
    ) -> impl Future<Output = Result<Vec<DedupRef>>> + Send;

    /// Pin a single chunk.
    fn pin_chunk(
        &self,
        chunk: &ContentHash,
        keep_until: Timestamp,
    ) -> impl Future<Output = Result<PinResult>> + Send;
}

/// The store's answer to a reference-node extension.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum ReferenceNodeOutcome {
    /// The node and its references were extended.
    Extended,

    /// The node is not in the store.
    NotFound,

    /// Some children expire too soon for the node to be extended; the
    /// caller must pin them first.
    InsufficientChildTtl,
}

/// Thresholds governing the pin strategy.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Builder)]
pub struct DedupPinConfig {
    /// How far into the future pins extend content.
    #[builder(default = SignedDuration::from_hours(7 * 24))]
    pub keep_until: SignedDuration,

    /// Remaining TTL above which a node pin is skipped outright.
    #[builder(default = SignedDuration::from_hours(24))]
    pub ignore_pin_threshold: SignedDuration,

    /// Remaining TTL below which a node pin is awaited inline. Between the
    /// two thresholds the pin runs detached and the caller sees `Success`
    /// immediately.
    #[builder(default = SignedDuration::from_hours(1))]
    pub pin_inline_threshold: SignedDuration,
}

impl Default for DedupPinConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Pins dedup content trees against a [`DedupStore`].
///
/// ## Cloning
///
/// Cheaply cloneable; clones share the store handle and the counters.
#[derive(Debug)]
pub struct DedupPinner<S> {
    store: Arc<S>,
    config: DedupPinConfig,
    counters: Arc<SessionCounters>,
}

impl<S> Clone for DedupPinner<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config,
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<S: DedupStore> DedupPinner<S> {
    /// Create a pinner over the given store.
    pub fn new(store: S, config: DedupPinConfig) -> Self {
        Self {
            store: Arc::new(store),
            config,
            counters: Arc::new(SessionCounters::default()),
        }
    }

    /// The counters shared by all clones of this pinner.
    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Pin a dedup entry, choosing the strategy from its kind.
    #[instrument(skip(self))]
    pub async fn pin(&self, hash: &ContentHash) -> Result<PinResult> {
        let target = self.target_keep_until()?;
        match DedupRef::classify(*hash)? {
            DedupRef::Chunk(chunk) => self.store.pin_chunk(&chunk, target).await,
            DedupRef::Node(node) => self.pin_node(node, target).await,
        }
    }

    fn target_keep_until(&self) -> Result<Timestamp> {
        Timestamp::now()
            .checked_add(self.config.keep_until)
            .context("compute target keep-until")
    }

    async fn pin_node(&self, node: ContentHash, target: Timestamp) -> Result<PinResult> {
        let now = Timestamp::now();
        let remaining = self
            .store
            .keep_until(&node)
            .await
            .context("query root keep-until")?
            .map(|expiry| expiry.duration_since(now));

        if let Some(remaining) = remaining
            && remaining > self.config.ignore_pin_threshold
        {
            trace!(%node, ?remaining, "ttl is ample; skipping pin");
            self.counters.bump(SessionCounter::PinIgnored);
            return Ok(PinResult::Success);
        }

        // Unknown expiry means the node may be absent; that case must be
        // observed inline so the caller can fall back to re-execution.
        let inline = remaining.is_none_or(|remaining| remaining < self.config.pin_inline_threshold);
        if inline {
            self.counters.bump(SessionCounter::PinInline);
            return Self::extend_node(Arc::clone(&self.store), node, target).await;
        }

        self.counters.bump(SessionCounter::PinDetached);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match Self::extend_node(store, node, target).await {
                Ok(PinResult::Success) => trace!(%node, "detached pin completed"),
                Ok(outcome) => warn!(%node, %outcome, "detached pin did not succeed"),
                Err(err) => warn!(%node, ?err, "detached pin failed"),
            }
        });
        Ok(PinResult::Success)
    }

    /// Extend a node, pinning children first when the store demands it.
    async fn extend_node(
        store: Arc<S>,
        node: ContentHash,
        target: Timestamp,
    ) -> Result<PinResult> {
        match store.try_keep_until_reference_node(&node, target).await? {
            ReferenceNodeOutcome::Extended => return Ok(PinResult::Success),
            ReferenceNodeOutcome::NotFound => return Ok(PinResult::ContentNotFound),
            ReferenceNodeOutcome::InsufficientChildTtl => {}
        }

        let children = store
            .enumerate_children(&node)
            .await
            .context("enumerate node children")?;
        let mut chunks = Vec::new();
        let mut nodes = Vec::new();
        for child in children {
            match child {
                DedupRef::Chunk(chunk) => chunks.push(chunk),
                DedupRef::Node(node) => nodes.push(node),
            }
        }

        for chunk in chunks {
            match store.pin_chunk(&chunk, target).await? {
                PinResult::Success => {}
                other => return Ok(other),
            }
        }
        for child in nodes {
            match Box::pin(Self::extend_node(Arc::clone(&store), child, target)).await? {
                PinResult::Success => {}
                other => return Ok(other),
            }
        }

        // Children are now pinned; the parent extension must go through.
        match store.try_keep_until_reference_node(&node, target).await? {
            ReferenceNodeOutcome::Extended => Ok(PinResult::Success),
            ReferenceNodeOutcome::NotFound => Ok(PinResult::ContentNotFound),
            ReferenceNodeOutcome::InsufficientChildTtl => Ok(PinResult::Error(format!(
                "children of {node} still below required ttl after pinning"
            ))),
        }
    }
}
