//! Observations and observed inputs.
//!
//! A pip's sandbox reports raw accesses; the processor in
//! [`processor`] turns them into a stable, cacheable set of observed
//! inputs. The same machinery runs in two phases: against fresh
//! observations after an execution, and against a prior path set during
//! cache lookup. Both phases must agree byte-for-byte on the strong
//! fingerprint for a cache hit to be sound.

pub mod enumeration;
pub mod processor;

use clients::hash::ContentHash;
use derive_more::Display;

use crate::{
    artifact::{DirectoryArtifact, FileArtifact, FileContentInfo},
    fingerprint::{Fingerprint, FingerprintWriter, StrongFingerprint, tag},
    path::{FileNameAtom, PathId, PathTable},
    pip::PipId,
};

pub use enumeration::{
    DirectoryMembershipFilter, EnumerationMode, MountPolicy, MountTable,
};
pub use processor::{ObservationProcessingRequest, ObservedInputProcessor, ProcessorConfig};

/// The namespace folded into every strong fingerprint, versioning the
/// serialization scheme itself.
pub const FINGERPRINT_NAMESPACE: &str = "observed-inputs.v1";

/// What the sandbox reported about one path.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct ObservationFlags {
    /// The access was an existence probe.
    pub file_probe: bool,

    /// The path was used as a directory.
    pub directory_location: bool,

    /// The directory was enumerated.
    pub enumeration: bool,

    /// The content was read, so its hash is part of the pip's identity.
    pub hashing_required: bool,
}

impl ObservationFlags {
    pub const PROBE: Self = Self {
        file_probe: true,
        directory_location: false,
        enumeration: false,
        hashing_required: false,
    };

    pub const READ: Self = Self {
        file_probe: false,
        directory_location: false,
        enumeration: false,
        hashing_required: true,
    };

    pub const ENUMERATE: Self = Self {
        file_probe: false,
        directory_location: true,
        enumeration: true,
        hashing_required: false,
    };

    pub const DIRECTORY_PROBE: Self = Self {
        file_probe: true,
        directory_location: true,
        enumeration: false,
        hashing_required: false,
    };

    /// Union of two access reports over the same path.
    pub fn merge(self, other: Self) -> Self {
        Self {
            file_probe: self.file_probe || other.file_probe,
            directory_location: self.directory_location || other.directory_location,
            enumeration: self.enumeration || other.enumeration,
            hashing_required: self.hashing_required || other.hashing_required,
        }
    }
}

/// One raw, per-pip observation, as produced by the sandbox adapter.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Observation {
    pub path: PathId,
    pub flags: ObservationFlags,

    /// Filter pattern the enumeration ran with, if any.
    pub enumeration_pattern: Option<String>,

    /// Whether the enumeration came from search-path resolution (e.g. a
    /// PATH or include-directory walk).
    pub is_search_path: bool,
}

impl Observation {
    /// A plain existence probe.
    pub fn probe(path: PathId) -> Self {
        Self {
            path,
            flags: ObservationFlags::PROBE,
            enumeration_pattern: None,
            is_search_path: false,
        }
    }

    /// A content read.
    pub fn read(path: PathId) -> Self {
        Self {
            path,
            flags: ObservationFlags::READ,
            enumeration_pattern: None,
            is_search_path: false,
        }
    }

    /// A directory enumeration.
    pub fn enumerate(path: PathId, pattern: Option<String>) -> Self {
        Self {
            path,
            flags: ObservationFlags::ENUMERATE,
            enumeration_pattern: pattern,
            is_search_path: false,
        }
    }

    /// Mark this observation as a search-path enumeration.
    pub fn search_path(mut self) -> Self {
        self.is_search_path = true;
        self
    }
}

/// A processed observation: one of the five shapes that feed the strong
/// fingerprint.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum ObservedInput {
    /// The path did not exist.
    AbsentPathProbe { path: PathId },

    /// The file's bytes were read; the hash is part of the identity.
    FileContentRead { path: PathId, hash: ContentHash },

    /// The file exists; only its presence matters.
    ExistingFileProbe { path: PathId },

    /// The directory exists; only its presence matters.
    ExistingDirectoryProbe { path: PathId },

    /// The directory was enumerated; the fingerprint covers the filtered
    /// member names.
    DirectoryEnumeration {
        path: PathId,
        fingerprint: Fingerprint,
        is_search_path: bool,
        pattern: Option<String>,
    },
}

impl ObservedInput {
    pub fn path(&self) -> PathId {
        match self {
            Self::AbsentPathProbe { path }
            | Self::FileContentRead { path, .. }
            | Self::ExistingFileProbe { path }
            | Self::ExistingDirectoryProbe { path }
            | Self::DirectoryEnumeration { path, .. } => *path,
        }
    }

    /// The variant's serialization tag.
    const fn variant_tag(&self) -> u8 {
        match self {
            Self::AbsentPathProbe { .. } => 0,
            Self::FileContentRead { .. } => 1,
            Self::ExistingFileProbe { .. } => 2,
            Self::ExistingDirectoryProbe { .. } => 3,
            Self::DirectoryEnumeration { .. } => 4,
        }
    }

    /// Serialize into a strong fingerprint: the variant tag plus its hash
    /// where one applies, and nothing else. The path itself is covered by
    /// the path-set hash.
    pub fn encode(&self, writer: &mut FingerprintWriter) {
        writer.write_u8(tag::OBSERVED_INPUT, self.variant_tag());
        match self {
            Self::FileContentRead { hash, .. } => {
                writer.write_hash(tag::CONTENT_HASH, hash);
            }
            Self::DirectoryEnumeration { fingerprint, .. } => {
                writer.write_bytes(tag::CONTENT_HASH, fingerprint.as_bytes());
            }
            Self::AbsentPathProbe { .. }
            | Self::ExistingFileProbe { .. }
            | Self::ExistingDirectoryProbe { .. } => {}
        }
    }
}

/// One entry of a cached path set: enough to replay the observation during
/// a later cache lookup.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ObservedPathEntry {
    pub path: PathId,
    pub is_search_path: bool,
    pub is_directory_path: bool,
    pub is_enumeration: bool,
    pub hashing_required: bool,
    pub enumeration_pattern: Option<String>,
}

impl ObservedPathEntry {
    /// Reconstruct the raw observation this entry was recorded from.
    pub fn to_observation(&self) -> Observation {
        Observation {
            path: self.path,
            flags: ObservationFlags {
                file_probe: !self.is_enumeration && !self.hashing_required,
                directory_location: self.is_directory_path,
                enumeration: self.is_enumeration,
                hashing_required: self.hashing_required,
            },
            enumeration_pattern: self.enumeration_pattern.clone(),
            is_search_path: self.is_search_path,
        }
    }

    fn encode(&self, paths: &PathTable, writer: &mut FingerprintWriter) {
        let expanded = paths.expand(self.path);
        let expanded = if paths.case_sensitive() {
            expanded.to_string()
        } else {
            expanded.to_lowercase()
        };
        writer.write_str(tag::PATH, expanded);
        writer.write_u8(
            tag::PATH,
            u8::from(self.is_search_path)
                | u8::from(self.is_directory_path) << 1
                | u8::from(self.is_enumeration) << 2
                | u8::from(self.hashing_required) << 3,
        );
        if let Some(pattern) = &self.enumeration_pattern {
            writer.write_str(tag::PATH, pattern);
        }
    }
}

/// The ordered collection of paths that contributed to a strong
/// fingerprint, cached alongside it.
///
/// Entries are sorted by expanded path under the table's case rule;
/// accessed file names are sorted case-insensitively.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct ObservedPathSet {
    pub entries: Vec<ObservedPathEntry>,
    pub accessed_file_names: Vec<FileNameAtom>,
}

impl ObservedPathSet {
    /// The path-set hash: entries, accessed names, and the unsafe-options
    /// hash, in canonical order.
    pub fn hash(&self, paths: &PathTable, unsafe_options_hash: &Fingerprint) -> Fingerprint {
        let mut writer = FingerprintWriter::new();
        writer.write_count(self.entries.len());
        for entry in &self.entries {
            entry.encode(paths, &mut writer);
        }
        writer.write_count(self.accessed_file_names.len());
        for atom in &self.accessed_file_names {
            writer.write_str(tag::FILE_NAME, paths.expand_atom(*atom).to_lowercase());
        }
        writer.write_bytes(tag::UNSAFE_OPTIONS, unsafe_options_hash.as_bytes());
        writer.finish()
    }
}

/// How a violating observation should be handled.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum ViolationDecision {
    /// Fail the pip.
    Fail,

    /// Drop the offending path and continue.
    SuppressAndIgnorePath,
}

/// Policy hook consulted for recoverable access-check violations.
pub trait ViolationPolicy: Send + Sync {
    fn decide(&self, path: PathId) -> ViolationDecision;
}

/// The default policy: every violation fails the pip.
#[derive(Copy, Clone, Debug, Default)]
pub struct FailViolations;

impl ViolationPolicy for FailViolations {
    fn decide(&self, _path: PathId) -> ViolationDecision {
        ViolationDecision::Fail
    }
}

/// A failed access check, reported with the pip.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("{kind} at {path:?}: {description}")]
pub struct ObservationFailure {
    pub path: PathId,
    pub kind: ObservationFailureKind,
    pub description: String,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum ObservationFailureKind {
    /// A declared-dependency violation under strict checking.
    FatalObservation,

    /// A recoverable violation the policy chose to fail on.
    AccessCheckFailure,
}

/// A dynamic (non-content) observation worth replaying on later lookups.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum DynamicObservation {
    Enumeration { path: PathId, mode: EnumerationMode },
    AbsentProbe { path: PathId },
}

/// The outcome of observed-input processing.
#[derive(Clone, Debug)]
pub enum ObservedInputProcessingResult {
    Success(ProcessingSuccess),

    /// Prior path-set entries could not be reproduced (content vanished or
    /// became unhashable); the strong fingerprint cannot be trusted.
    Mismatched { invalid_count: usize },

    /// Processing stopped: access-check failure or build cancellation.
    Aborted { failures: Vec<ObservationFailure> },
}

impl ObservedInputProcessingResult {
    /// The success payload, if this is a success.
    pub fn success(&self) -> Option<&ProcessingSuccess> {
        match self {
            Self::Success(success) => Some(success),
            _ => None,
        }
    }
}

/// Everything a successful processing run produces.
#[derive(Clone, Debug)]
pub struct ProcessingSuccess {
    /// Observed inputs, sorted by expanded path.
    pub observed_inputs: Vec<ObservedInput>,

    /// The replayable path set, sorted the same way.
    pub path_set: ObservedPathSet,

    /// Hash of `path_set`.
    pub path_set_hash: Fingerprint,

    /// The strong fingerprint over the weak fingerprint, the path-set
    /// hash, and the encoded observed inputs.
    pub strong_fingerprint: StrongFingerprint,

    /// Enumerations and absent probes, for the two-phase store.
    pub dynamic_observations: Vec<DynamicObservation>,

    /// Reads tolerated by `allow_undeclared_source_reads`.
    pub allowed_undeclared_reads: Vec<PathId>,
}

/// The queries the processor makes of the graph and cache layers.
pub trait InputOracle: Send + Sync {
    /// Known content for a sealed or tolerated-undeclared input.
    fn query_content(&self, path: PathId) -> Option<FileContentInfo>;

    /// The sealed contents of a directory dependency, sorted by path.
    fn sealed_directory_contents(&self, dir: &DirectoryArtifact) -> Vec<FileArtifact>;

    /// Source-seal metadata for a directory dependency, if it is
    /// source-sealed.
    fn source_seal(&self, dir: &DirectoryArtifact) -> Option<SourceSeal>;

    /// Whether `pip` is ordered after `other` in the graph.
    fn is_downstream(&self, pip: PipId, other: PipId) -> bool;

    /// Whether a shared-opaque output at this path is pending lazy
    /// deletion bookkeeping (the sideband flag).
    fn is_pending_lazy_output(&self, _path: PathId) -> bool {
        false
    }
}

/// Source-seal metadata: scope plus file-name patterns.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct SourceSeal {
    /// Recursive (all directories) or top-level only.
    pub all_directories: bool,

    /// Wildcard patterns limiting membership; empty means all names.
    pub patterns: Vec<String>,
}
