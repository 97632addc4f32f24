//! Sandbox observation adapter.
//!
//! The sandbox reports one event per intercepted filesystem call. The
//! processor wants one observation per path, with merged flags, writes
//! removed, in sorted order. This module is that normalization step.

use std::collections::{HashMap, HashSet};

use derive_more::Display;
use tracing::{instrument, trace};

use crate::{
    observe::{Observation, ObservationFlags},
    path::{PathId, PathTable},
};

/// What an intercepted call did with a path.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, strum::EnumIter)]
pub enum AccessOperation {
    /// Opened and read content.
    Read,

    /// Checked existence.
    Probe,

    /// Listed a directory.
    Enumerate,

    /// Probed a path while resolving a directory listing.
    EnumerateProbe,

    /// Wrote or created.
    Write,
}

/// One raw per-process file-access event.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct ReportedFileAccess {
    pub path: PathId,
    pub operation: AccessOperation,

    /// The filter pattern of an enumeration, when the sandbox captured
    /// one.
    pub enumerate_pattern: Option<String>,

    /// Whether the access came from search-path resolution.
    pub is_search_path: bool,
}

impl ReportedFileAccess {
    pub fn new(path: PathId, operation: AccessOperation) -> Self {
        Self {
            path,
            operation,
            enumerate_pattern: None,
            is_search_path: false,
        }
    }

    fn flags(&self) -> ObservationFlags {
        match self.operation {
            AccessOperation::Read => ObservationFlags::READ,
            AccessOperation::Probe => ObservationFlags::PROBE,
            AccessOperation::Enumerate => ObservationFlags::ENUMERATE,
            AccessOperation::EnumerateProbe => ObservationFlags::DIRECTORY_PROBE,
            AccessOperation::Write => ObservationFlags::default(),
        }
    }
}

/// Convert raw access events into the observation stream the processor
/// consumes: writes dropped, per-path flags merged, sorted by expanded
/// path.
///
/// A path that was written at all is an output, not an input; every event
/// on it is dropped, including reads that happened before the write.
#[instrument(skip_all, fields(accesses = accesses.len()))]
pub fn observations_from_accesses(
    paths: &PathTable,
    accesses: Vec<ReportedFileAccess>,
) -> Vec<Observation> {
    let written: HashSet<PathId> = accesses
        .iter()
        .filter(|access| access.operation == AccessOperation::Write)
        .map(|access| access.path)
        .collect();

    let mut merged: HashMap<PathId, Observation> = HashMap::new();
    for access in accesses {
        if written.contains(&access.path) {
            continue;
        }
        let flags = access.flags();
        match merged.entry(access.path) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Observation {
                    path: access.path,
                    flags,
                    enumeration_pattern: access.enumerate_pattern,
                    is_search_path: access.is_search_path,
                });
            }
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                existing.flags = existing.flags.merge(flags);
                existing.is_search_path |= access.is_search_path;
                if existing.enumeration_pattern.is_none() {
                    existing.enumeration_pattern = access.enumerate_pattern;
                }
            }
        }
    }

    let mut observations: Vec<Observation> = merged.into_values().collect();
    observations.sort_by(|a, b| paths.cmp_paths(a.path, b.path));
    trace!(observations = observations.len(), "normalized sandbox accesses");
    observations
}
