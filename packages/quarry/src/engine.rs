//! Cache lookup and post-execution processing.
//!
//! The two phases of the fingerprint pipeline meet here. A cache lookup
//! replays each prior path set through the observed-input processor and
//! accepts an entry only when the recomputed strong fingerprint matches
//! the stored one. After an execution, the fresh sandbox accesses go
//! through the same processor, and the resulting path set and fingerprint
//! are published for future lookups. Because both phases share every
//! classification rule, an execution's entry always re-validates against
//! an unchanged filesystem.

use std::sync::Arc;

use clients::{
    hash::ContentHash,
    session::{FileAccessMode, FileRealizationMode, FileReplacementMode, PlaceContent, PlaceResult},
};
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tracing::{debug, instrument, trace};

use crate::{
    context::{BuildContext, EngineCounter},
    fingerprint::{StrongFingerprint, WeakFingerprint},
    observe::{
        ObservationProcessingRequest, ObservedInputProcessingResult, ObservedInputProcessor,
        ObservedPathSet,
    },
    path::{PathId, PathTable},
    pip::PipDescriptor,
    sandbox::{ReportedFileAccess, observations_from_accesses},
};

/// A published cache entry: the strong fingerprint, the path set that
/// derives it, and the pip's output content.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub strong_fingerprint: StrongFingerprint,
    pub path_set: ObservedPathSet,
    pub outputs: Vec<(PathId, ContentHash)>,
}

/// The memoization store consumed by the engine. Internals (local,
/// remote, two-phase) live behind this interface.
pub trait MemoizationStore: Send + Sync {
    /// Prior entries published under a weak fingerprint, most recent
    /// first.
    fn prior_entries(&self, weak: &WeakFingerprint) -> Vec<CacheEntry>;

    /// Publish an entry under a weak fingerprint.
    fn publish(&self, weak: WeakFingerprint, entry: CacheEntry);
}

/// The outcome of a cache lookup.
#[derive(Clone, Debug)]
pub enum CacheLookupOutcome {
    /// A prior entry re-validated; its outputs can be placed.
    Hit {
        strong_fingerprint: StrongFingerprint,
        outputs: Vec<(PathId, ContentHash)>,
    },

    /// No prior entry survives re-validation; the pip must execute.
    Miss,
}

/// Ties the observed-input processor to the memoization store.
pub struct Engine<S> {
    context: BuildContext,
    processor: Arc<ObservedInputProcessor>,
    store: Arc<S>,
}

impl<S: MemoizationStore> Engine<S> {
    pub fn new(context: BuildContext, processor: Arc<ObservedInputProcessor>, store: Arc<S>) -> Self {
        Self {
            context,
            processor,
            store,
        }
    }

    /// Re-validate prior entries for a pip.
    #[instrument(skip_all, fields(pip = %pip.id))]
    pub fn run_cache_lookup(&self, pip: &PipDescriptor) -> CacheLookupOutcome {
        let weak = pip.weak_fingerprint(&self.context.paths, &self.context.fingerprint_salt);

        for entry in self.store.prior_entries(&weak) {
            match self.processor.process_prior(pip, &entry.path_set) {
                ObservedInputProcessingResult::Success(success)
                    if success.strong_fingerprint == entry.strong_fingerprint =>
                {
                    debug!(strong = %entry.strong_fingerprint, "cache hit");
                    self.context.counters.bump(EngineCounter::CacheHits);
                    return CacheLookupOutcome::Hit {
                        strong_fingerprint: entry.strong_fingerprint,
                        outputs: entry.outputs,
                    };
                }
                ObservedInputProcessingResult::Success(success) => {
                    trace!(
                        stored = %entry.strong_fingerprint,
                        recomputed = %success.strong_fingerprint,
                        "stale entry",
                    );
                }
                ObservedInputProcessingResult::Mismatched { invalid_count } => {
                    trace!(invalid_count, "entry no longer reproducible");
                }
                ObservedInputProcessingResult::Aborted { .. } => break,
            }
        }

        self.context.counters.bump(EngineCounter::CacheMisses);
        CacheLookupOutcome::Miss
    }

    /// Process a finished execution's sandbox accesses and publish the
    /// resulting entry.
    #[instrument(skip_all, fields(pip = %pip.id, accesses = accesses.len()))]
    pub fn process_execution(
        &self,
        pip: &PipDescriptor,
        accesses: Vec<ReportedFileAccess>,
        outputs: Vec<(PathId, ContentHash)>,
        shared_opaque_roots: Vec<PathId>,
        created_directories: Vec<PathId>,
    ) -> ObservedInputProcessingResult {
        let observations = observations_from_accesses(&self.context.paths, accesses);
        let request = ObservationProcessingRequest::builder()
            .pip(pip)
            .observations(observations)
            .shared_opaque_roots(shared_opaque_roots)
            .created_directories(created_directories)
            .build();

        let result = self.processor.process(request);
        if let ObservedInputProcessingResult::Success(success) = &result {
            let weak = pip.weak_fingerprint(&self.context.paths, &self.context.fingerprint_salt);
            self.store.publish(
                weak,
                CacheEntry {
                    strong_fingerprint: success.strong_fingerprint,
                    path_set: success.path_set.clone(),
                    outputs,
                },
            );
            debug!(strong = %success.strong_fingerprint, "published execution entry");
        }
        result
    }
}

/// Place a hit's outputs on disk through a content session.
#[instrument(skip_all, fields(outputs = outputs.len()))]
pub async fn materialize_outputs(
    session: &impl PlaceContent,
    paths: &PathTable,
    outputs: &[(PathId, ContentHash)],
) -> Result<u64> {
    let mut placed = 0;
    for (path, hash) in outputs {
        let destination = paths.expand(*path);
        let result = session
            .place_file(
                hash,
                std::path::Path::new(&*destination),
                FileAccessMode::ReadOnly,
                FileReplacementMode::ReplaceExisting,
                FileRealizationMode::Any,
            )
            .await
            .with_context(|| format!("place {destination}"))?;
        match result {
            PlaceResult::Placed { .. } | PlaceResult::AlreadyExists => placed += 1,
            PlaceResult::ContentNotFound => {
                // Surfaced, not swallowed: the caller reacts by executing
                // the pip instead.
                bail!("content {hash} for {destination} not in the store");
            }
        }
    }
    Ok(placed)
}
