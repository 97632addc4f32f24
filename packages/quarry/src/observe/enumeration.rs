//! Directory-enumeration modes, membership filters, and fingerprints.

use std::collections::HashSet;

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use regex::Regex;

use crate::{
    fingerprint::{Fingerprint, FingerprintWriter, tag},
    path::{FileNameAtom, PathId, PathTable},
};

/// How a directory enumeration is fingerprinted.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, strum::EnumIter)]
pub enum EnumerationMode {
    /// A constant fingerprint: the directory's contents are irrelevant
    /// (outside any mount, or inside a non-hashable one).
    DefaultFingerprint,

    /// Enumerate the real directory, filtered by the membership filter.
    RealFilesystem,

    /// Enumerate every graph-known path under the directory.
    FullGraph,

    /// Enumerate only graph-known paths reachable from the pip's declared
    /// dependencies.
    MinimalGraph,

    /// Minimal graph union with filesystem entries the build does not
    /// produce (sources and tolerated undeclared reads), with
    /// build-produced files actively excluded.
    MinimalGraphWithAlienFiles,
}

impl EnumerationMode {
    const fn tag(self) -> u8 {
        match self {
            Self::DefaultFingerprint => 0,
            Self::RealFilesystem => 1,
            Self::FullGraph => 2,
            Self::MinimalGraph => 3,
            Self::MinimalGraphWithAlienFiles => 4,
        }
    }
}

/// Filesystem policy of the mount containing a path.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MountPolicy {
    pub readable: bool,
    pub hashable: bool,
    pub has_build_outputs: bool,
}

/// Mount roots and their policies, longest-prefix matched.
#[derive(Debug, Default)]
pub struct MountTable {
    mounts: Vec<(PathId, MountPolicy)>,
}

impl MountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, root: PathId, policy: MountPolicy) {
        self.mounts.push((root, policy));
    }

    /// The policy of the deepest mount containing `path`, if any.
    pub fn policy_for(&self, paths: &PathTable, path: PathId) -> Option<MountPolicy> {
        self.mounts
            .iter()
            .filter(|(root, _)| paths.is_within(path, *root))
            .max_by_key(|(root, _)| paths.expand(*root).len())
            .map(|(_, policy)| *policy)
    }
}

/// Pick the enumeration mode for a directory from its mount policy.
pub fn choose_mode(
    policy: Option<MountPolicy>,
    allow_undeclared_source_reads: bool,
    prefer_full_graph: bool,
) -> EnumerationMode {
    match policy {
        None => EnumerationMode::DefaultFingerprint,
        Some(policy) if !policy.readable || !policy.hashable => {
            EnumerationMode::DefaultFingerprint
        }
        Some(policy) if !policy.has_build_outputs => EnumerationMode::RealFilesystem,
        Some(_) if prefer_full_graph => EnumerationMode::FullGraph,
        Some(_) if allow_undeclared_source_reads => EnumerationMode::MinimalGraphWithAlienFiles,
        Some(_) => EnumerationMode::MinimalGraph,
    }
}

/// Which member names of a directory count as observed.
#[derive(Clone, Debug)]
pub enum DirectoryMembershipFilter {
    /// Every member counts.
    AllowAll,

    /// A member counts if it matches any wildcard pattern, or if its name
    /// is in the search-path accessed set.
    Filtered {
        regexes: Vec<Regex>,
        search_names: HashSet<FileNameAtom>,
    },
}

impl DirectoryMembershipFilter {
    /// Build from an optional wildcard pattern (`*` and `?`).
    pub fn from_pattern(pattern: Option<&str>) -> Result<Self> {
        match pattern {
            None | Some("*") => Ok(Self::AllowAll),
            Some(pattern) => Self::from_patterns([pattern]),
        }
    }

    /// Build from a set of wildcard patterns. An empty set allows all.
    pub fn from_patterns<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let regexes = patterns
            .into_iter()
            .map(compile_wildcard)
            .collect::<Result<Vec<_>>>()?;
        if regexes.is_empty() {
            Ok(Self::AllowAll)
        } else {
            Ok(Self::Filtered {
                regexes,
                search_names: HashSet::new(),
            })
        }
    }

    /// Augment the filter with search-path accessed names, so the filter
    /// stays stable across cache lookups that saw those names accessed.
    pub fn union_search_names(self, names: impl IntoIterator<Item = FileNameAtom>) -> Self {
        match self {
            Self::AllowAll => Self::AllowAll,
            Self::Filtered {
                regexes,
                mut search_names,
            } => {
                search_names.extend(names);
                Self::Filtered {
                    regexes,
                    search_names,
                }
            }
        }
    }

    /// Whether a member name passes the filter.
    pub fn allows(&self, paths: &PathTable, name: FileNameAtom) -> bool {
        match self {
            Self::AllowAll => true,
            Self::Filtered {
                regexes,
                search_names,
            } => {
                if search_names.contains(&name) {
                    return true;
                }
                let expanded = paths.expand_atom(name);
                regexes.iter().any(|regex| regex.is_match(&expanded))
            }
        }
    }
}

/// Compile a case-insensitive wildcard pattern to an anchored regex.
fn compile_wildcard(pattern: &str) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?i)^");
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    Regex::new(&source).with_context(|| format!("compile wildcard pattern {pattern:?}"))
}

/// The constant fingerprint used by [`EnumerationMode::DefaultFingerprint`].
pub fn default_fingerprint() -> Fingerprint {
    let mut writer = FingerprintWriter::new();
    writer.write_u8(tag::PATH, EnumerationMode::DefaultFingerprint.tag());
    writer.finish()
}

/// Hash an enumeration's member names.
///
/// Names are ordered case-insensitively and folded to lower case before
/// hashing, so the fingerprint is stable across platforms that report
/// different casings.
pub fn fingerprint_members(
    paths: &PathTable,
    mode: EnumerationMode,
    mut members: Vec<FileNameAtom>,
) -> Fingerprint {
    members.sort_by(|a, b| paths.cmp_atoms(*a, *b));
    members.dedup();

    let mut writer = FingerprintWriter::new();
    writer.write_u8(tag::PATH, mode.tag());
    writer.write_count(members.len());
    for name in members {
        writer.write_str(tag::FILE_NAME, paths.expand_atom(name).to_lowercase());
    }
    writer.finish()
}
