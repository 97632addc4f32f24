//! Content-session capabilities.
//!
//! A session over a content store is described as a small capability set:
//! pinning, opening, and placing content. Concrete back-ends (local,
//! remote, dedup, distributed) implement the capabilities they offer, and
//! decorators such as [`crate::retry::RetryingSession`] wrap any back-end
//! exposing the same capabilities.

use std::{
    future::Future,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::EnumCount;
use tokio::io::AsyncRead;

use crate::hash::ContentHash;

/// A readable stream of content bytes.
pub type ContentStream = Box<dyn AsyncRead + Send + Unpin>;

/// The outcome of pinning a single content entry.
///
/// `ContentNotFound` is a domain outcome, not an error: callers branch on
/// it (typically by falling back to a fresh execution), so it must never be
/// collapsed into the error channel.
#[derive(Clone, Eq, PartialEq, Debug, Display, Serialize, Deserialize)]
pub enum PinResult {
    /// The entry exists and its TTL was extended (or was already ample).
    Success,

    /// The entry is not present in the store.
    ContentNotFound,

    /// The pin failed for a reason other than absence.
    #[display("error: {_0}")]
    Error(String),
}

impl PinResult {
    /// Whether the pin succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// The outcome of placing content at a destination path.
#[derive(Clone, Eq, PartialEq, Debug, Display, Serialize, Deserialize)]
pub enum PlaceResult {
    /// The file was written to the destination.
    #[display("placed {bytes} bytes")]
    Placed {
        /// Number of content bytes written.
        bytes: u64,
    },

    /// The destination already held a file and the replacement mode said to
    /// keep it.
    AlreadyExists,

    /// The content is not present in the store.
    ContentNotFound,
}

/// How the placed file will be accessed by the caller.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum FileAccessMode {
    ReadOnly,
    Write,
}

/// What to do when the destination of a place already exists.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum FileReplacementMode {
    /// Overwrite whatever is there.
    ReplaceExisting,

    /// Keep the existing file and report [`PlaceResult::AlreadyExists`].
    SkipIfExists,

    /// Fail the operation without touching the store.
    FailIfExists,
}

/// How the content should be realized on disk.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum FileRealizationMode {
    /// The back-end chooses.
    Any,

    /// Always copy the bytes.
    Copy,

    /// Hard-link out of a local cache when possible.
    HardLink,
}

/// Capability: extend the TTL of content entries.
pub trait PinContent: Send + Sync {
    /// Pin a single entry.
    fn pin(&self, hash: &ContentHash) -> impl Future<Output = color_eyre::Result<PinResult>> + Send;

    /// Pin a batch of entries.
    ///
    /// The result is indexed: position `i` reports the outcome for
    /// `hashes[i]`, and per-entry failures surface as
    /// [`PinResult::Error`] at their index rather than failing the batch.
    fn pin_bulk(
        &self,
        hashes: &[ContentHash],
    ) -> impl Future<Output = color_eyre::Result<Vec<PinResult>>> + Send;
}

/// Capability: open content as a byte stream.
pub trait OpenContent: Send + Sync {
    /// Open the entry for reading, or `None` if it is not in the store.
    fn open_stream(
        &self,
        hash: &ContentHash,
    ) -> impl Future<Output = color_eyre::Result<Option<ContentStream>>> + Send;
}

/// Capability: materialize content at a path on the local filesystem.
pub trait PlaceContent: Send + Sync {
    /// Write the entry's bytes to `destination`.
    fn place_file(
        &self,
        hash: &ContentHash,
        destination: &Path,
        access: FileAccessMode,
        replacement: FileReplacementMode,
        realization: FileRealizationMode,
    ) -> impl Future<Output = color_eyre::Result<PlaceResult>> + Send;
}

/// Events counted across a session's lifetime.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, Display, EnumCount, strum::EnumIter, strum::FromRepr,
)]
#[repr(usize)]
pub enum SessionCounter {
    /// A node pin was skipped because its TTL was ample.
    PinIgnored,

    /// A node pin was awaited inline.
    PinInline,

    /// A node pin was detached to the background.
    PinDetached,

    /// An operation attempt was retried.
    Retry,

    /// Acquiring the concurrency gate took over a second.
    GateWait,
}

/// Lock-free counters for [`SessionCounter`] events.
#[derive(Debug, Default)]
pub struct SessionCounters {
    counts: [AtomicU64; SessionCounter::COUNT],
}

impl SessionCounters {
    /// Increment the counter by one.
    pub fn bump(&self, counter: SessionCounter) {
        self.counts[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Read the counter's current value.
    pub fn get(&self, counter: SessionCounter) -> u64 {
        self.counts[counter as usize].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn counters_start_at_zero_and_bump_independently() {
        let counters = SessionCounters::default();
        for counter in SessionCounter::iter() {
            assert_eq!(counters.get(counter), 0);
        }

        counters.bump(SessionCounter::Retry);
        counters.bump(SessionCounter::Retry);
        counters.bump(SessionCounter::PinIgnored);

        assert_eq!(counters.get(SessionCounter::Retry), 2);
        assert_eq!(counters.get(SessionCounter::PinIgnored), 1);
        assert_eq!(counters.get(SessionCounter::GateWait), 0);
    }
}
