//! File and directory artifacts.

use clients::hash::ContentHash;
use derive_more::Display;

use crate::path::PathId;

/// Whether a path currently resolves to anything, and to what.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum PathExistence {
    Nonexistent,
    ExistsAsFile,
    ExistsAsDirectory,
}

impl PathExistence {
    /// Whether the path resolves at all.
    pub fn exists(self) -> bool {
        self != Self::Nonexistent
    }
}

/// A versioned file: a path plus how many sequenced pips have rewritten it.
///
/// Rewrite count 0 is the source file; count `n ≥ 1` is the output of the
/// n-th producer over the same path. Two artifacts over one path with
/// different counts are distinct dependencies.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display("{path:?}#{rewrite_count}")]
pub struct FileArtifact {
    pub path: PathId,
    pub rewrite_count: u32,
}

impl FileArtifact {
    /// The source (never rewritten) artifact over a path.
    pub const fn source(path: PathId) -> Self {
        Self {
            path,
            rewrite_count: 0,
        }
    }

    /// An output artifact over a path.
    pub const fn output(path: PathId, rewrite_count: u32) -> Self {
        Self {
            path,
            rewrite_count,
        }
    }

    /// Whether this artifact is a source file.
    pub const fn is_source(&self) -> bool {
        self.rewrite_count == 0
    }
}

/// A sealed view over a directory.
///
/// The partial-seal id distinguishes different seals over the same path;
/// two artifacts with equal paths but different seal ids are distinct
/// dependencies.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display("{path:?}@{partial_seal_id}")]
pub struct DirectoryArtifact {
    pub path: PathId,
    pub partial_seal_id: u32,

    /// Whether multiple pips may produce into this directory.
    pub shared_opaque: bool,
}

impl DirectoryArtifact {
    pub const fn new(path: PathId, partial_seal_id: u32, shared_opaque: bool) -> Self {
        Self {
            path,
            partial_seal_id,
            shared_opaque,
        }
    }
}

/// Known content of a tracked file.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FileContentInfo {
    pub hash: ContentHash,
    pub length: u64,
    pub existence: PathExistence,
}

impl FileContentInfo {
    /// Content info for a present file.
    pub const fn file(hash: ContentHash, length: u64) -> Self {
        Self {
            hash,
            length,
            existence: PathExistence::ExistsAsFile,
        }
    }

    /// Content info for a known-absent file.
    pub const fn absent() -> Self {
        Self {
            hash: ContentHash::ABSENT_FILE,
            length: 0,
            existence: PathExistence::Nonexistent,
        }
    }
}
