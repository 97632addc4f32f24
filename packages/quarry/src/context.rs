//! Build-scoped state threaded through every operation.
//!
//! There is no process-global mutable state in the engine: everything a
//! build shares (the path table, counters, the cancellation token, salts)
//! hangs off one [`BuildContext`] handle that is cheap to clone.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use derive_more::Display;
use strum::EnumCount;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    fingerprint::{Fingerprint, FingerprintWriter, tag},
    path::PathTable,
};

/// Events counted across a build.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, Display, EnumCount, strum::EnumIter, strum::FromRepr,
)]
#[repr(usize)]
pub enum EngineCounter {
    CacheHits,
    CacheMisses,
    ObservationsProcessed,
    AbsentProbesElided,
    ProbesReclassifiedAbsent,
    DirectoryEnumerations,
    AlienFileCacheHits,
    AllowedUndeclaredReads,
    PipsDispatched,
    PipsCancelled,
}

/// Lock-free counters for [`EngineCounter`] events.
#[derive(Debug, Default)]
pub struct EngineCounters {
    counts: [AtomicU64; EngineCounter::COUNT],
}

impl EngineCounters {
    pub fn bump(&self, counter: EngineCounter) {
        self.counts[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: EngineCounter, n: u64) {
        self.counts[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: EngineCounter) -> u64 {
        self.counts[counter as usize].load(Ordering::Relaxed)
    }
}

/// The per-build context handle.
///
/// ## Cloning
///
/// Cheaply cloneable; clones share every underlying table and counter.
#[derive(Clone, Debug)]
pub struct BuildContext {
    pub paths: Arc<PathTable>,
    pub counters: Arc<EngineCounters>,

    /// Identifies this build session in every RPC.
    pub invocation_id: Uuid,

    /// Build-wide cooperative cancellation.
    pub cancellation: CancellationToken,

    /// Salt folded into every weak fingerprint.
    pub fingerprint_salt: Arc<str>,

    /// Hash of the unsafe-mode options in effect, folded into every path
    /// set so that runs under different safety regimes never share cache
    /// entries.
    pub unsafe_options_hash: Fingerprint,
}

impl BuildContext {
    /// Create a context with the platform path table and no salt.
    pub fn new() -> Self {
        Self::with_paths(Arc::new(PathTable::new()))
    }

    /// Create a context over an existing path table.
    pub fn with_paths(paths: Arc<PathTable>) -> Self {
        let unsafe_options_hash = {
            let mut writer = FingerprintWriter::new();
            writer.write_str(tag::UNSAFE_OPTIONS, "default");
            writer.finish()
        };
        Self {
            paths,
            counters: Arc::new(EngineCounters::default()),
            invocation_id: Uuid::new_v4(),
            cancellation: CancellationToken::new(),
            fingerprint_salt: Arc::from(""),
            unsafe_options_hash,
        }
    }

    /// Replace the fingerprint salt.
    pub fn with_salt(mut self, salt: impl AsRef<str>) -> Self {
        self.fingerprint_salt = Arc::from(salt.as_ref());
        self
    }
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new()
    }
}
