//! The observed-input processor.
//!
//! Turns raw sandbox observations (or a prior path set) into sorted
//! observed inputs, a replayable path set, and the strong fingerprint.
//! The cache-lookup and post-execution phases share every classification
//! rule below, which is what makes their fingerprints agree.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use bon::Builder;
use clients::hash::ContentHash;
use dashmap::DashMap;
use tracing::{debug, instrument, trace, warn};

use crate::{
    artifact::PathExistence,
    context::{BuildContext, EngineCounter},
    fingerprint::{FingerprintWriter, StrongFingerprint, tag},
    fsview::CombinedView,
    observe::{
        DynamicObservation, FINGERPRINT_NAMESPACE, FailViolations, InputOracle, Observation,
        ObservationFailure, ObservationFailureKind, ObservedInput, ObservedInputProcessingResult,
        ObservedPathEntry, ObservedPathSet, ProcessingSuccess, ViolationDecision, ViolationPolicy,
        enumeration::{
            DirectoryMembershipFilter, EnumerationMode, MountTable, choose_mode,
            default_fingerprint, fingerprint_members,
        },
    },
    path::{FileNameAtom, PathId},
    pip::PipDescriptor,
};

/// Knobs that change classification behavior build-wide.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Builder)]
pub struct ProcessorConfig {
    /// Fingerprint output-mount enumerations over the full graph instead
    /// of the minimal one.
    #[builder(default)]
    pub prefer_full_graph: bool,

    /// Whether shared-opaque outputs are deleted lazily. When enabled, the
    /// sideband flag governs probe reclassification and the
    /// downstream-producer rule is not consulted.
    #[builder(default)]
    pub lazy_deletion_enabled: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One request to process a pip's observations.
#[derive(Builder)]
pub struct ObservationProcessingRequest<'a> {
    pub pip: &'a PipDescriptor,

    /// Pre-sorted or unsorted raw observations; the processor sorts and
    /// deduplicates either way.
    pub observations: Vec<Observation>,

    /// True when replaying a prior path set to validate a cache entry.
    #[builder(default)]
    pub cache_lookup: bool,

    /// Shared-opaque output roots in effect for this pip.
    #[builder(default)]
    pub shared_opaque_roots: Vec<PathId>,

    /// Directories the pip created during execution.
    #[builder(default)]
    pub created_directories: Vec<PathId>,

    /// Accessed file names recorded by the prior run, when replaying.
    #[builder(default)]
    pub prior_accessed_file_names: Vec<FileNameAtom>,
}

/// Membership of a path in the pip's sealed-directory dependencies.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum SealMembership {
    NotSealed,
    Included,
    /// Under a source seal whose patterns exclude this name: the access is
    /// counted, but content is never hashed through the seal.
    Excluded,
}

/// The observed-input processor. One instance serves the whole build.
pub struct ObservedInputProcessor {
    context: BuildContext,
    views: Arc<CombinedView>,
    oracle: Arc<dyn InputOracle>,
    mounts: MountTable,
    config: ProcessorConfig,
    violations: Box<dyn ViolationPolicy>,

    /// Alien-file enumerations are build-wide invariants (they exclude
    /// everything the build produces), so they are shared across pips.
    alien_cache: DashMap<PathId, Arc<Vec<FileNameAtom>>>,
}

impl ObservedInputProcessor {
    pub fn new(
        context: BuildContext,
        views: Arc<CombinedView>,
        oracle: Arc<dyn InputOracle>,
        mounts: MountTable,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            context,
            views,
            oracle,
            mounts,
            config,
            violations: Box::new(FailViolations),
            alien_cache: DashMap::new(),
        }
    }

    /// Replace the violation policy.
    pub fn with_violation_policy(mut self, policy: impl ViolationPolicy + 'static) -> Self {
        self.violations = Box::new(policy);
        self
    }

    /// Replay a prior path set in cache-lookup mode.
    #[instrument(skip_all, fields(pip = %pip.id, entries = prior.entries.len()))]
    pub fn process_prior(
        &self,
        pip: &PipDescriptor,
        prior: &ObservedPathSet,
    ) -> ObservedInputProcessingResult {
        let request = ObservationProcessingRequest::builder()
            .pip(pip)
            .observations(prior.entries.iter().map(ObservedPathEntry::to_observation).collect())
            .cache_lookup(true)
            .prior_accessed_file_names(prior.accessed_file_names.clone())
            .build();
        self.process(request)
    }

    /// Process observations into observed inputs and fingerprints.
    #[instrument(skip_all, fields(pip = %request.pip.id, observations = request.observations.len(), cache_lookup = request.cache_lookup))]
    pub fn process(&self, request: ObservationProcessingRequest<'_>) -> ObservedInputProcessingResult {
        let paths = &self.context.paths;
        let pip = request.pip;

        // Pass 1: canonical order, merged duplicates, and sealed-dependency
        // metadata.
        let observations = self.sort_and_merge(request.observations);
        self.context
            .counters
            .add(EngineCounter::ObservationsProcessed, observations.len() as u64);

        let declared: HashMap<PathId, ContentHash> = pip
            .declared_inputs
            .iter()
            .map(|(artifact, hash)| (artifact.path, *hash))
            .collect();

        let mut sealed_contents = HashSet::new();
        let mut source_seals = Vec::new();
        for dir in &pip.directory_dependencies {
            for artifact in self.oracle.sealed_directory_contents(dir) {
                sealed_contents.insert(artifact.path);
            }
            if let Some(seal) = self.oracle.source_seal(dir) {
                let filter = match DirectoryMembershipFilter::from_patterns(
                    seal.patterns.iter().map(String::as_str),
                ) {
                    Ok(filter) => filter,
                    Err(err) => {
                        warn!(?err, dir = ?dir.path, "unusable source-seal patterns");
                        DirectoryMembershipFilter::AllowAll
                    }
                };
                source_seals.push((dir.path, seal.all_directories, filter));
            }
        }

        // Names accessed under search-path enumerations, which both augment
        // enumeration filters and become the path set's accessed-name set.
        let search_roots: Vec<PathId> = observations
            .iter()
            .filter(|o| o.flags.enumeration && o.is_search_path)
            .map(|o| o.path)
            .collect();
        let mut accessed_names: HashSet<FileNameAtom> =
            request.prior_accessed_file_names.iter().copied().collect();
        for observation in &observations {
            if let Some(parent) = paths.parent(observation.path)
                && search_roots.contains(&parent)
                && let Some(name) = paths.file_name_atom(observation.path)
            {
                accessed_names.insert(name);
            }
        }

        // Pass 2: existence resolution and per-observation classification.
        let mut classified: Vec<(ObservedInput, Observation)> = Vec::new();
        let mut failures = Vec::new();
        let mut allowed_undeclared = Vec::new();
        let mut invalid_count = 0usize;
        let mut dynamic = Vec::new();
        let mut real_fs_filters: HashMap<PathId, DirectoryMembershipFilter> = HashMap::new();

        for observation in observations {
            if self.context.cancellation.is_cancelled() {
                debug!("observation processing cancelled");
                return ObservedInputProcessingResult::Aborted { failures };
            }

            let path = observation.path;
            let existence = if request.created_directories.contains(&path) {
                PathExistence::ExistsAsDirectory
            } else {
                self.views.existence(path)
            };

            if observation.flags.enumeration && existence == PathExistence::ExistsAsDirectory {
                match self.resolve_enumeration(
                    pip,
                    &observation,
                    &declared,
                    &sealed_contents,
                    &accessed_names,
                    &mut real_fs_filters,
                ) {
                    EnumerationOutcome::Enumerated { fingerprint, mode } => {
                        dynamic.push(DynamicObservation::Enumeration { path, mode });
                        classified.push((
                            ObservedInput::DirectoryEnumeration {
                                path,
                                fingerprint,
                                is_search_path: observation.is_search_path,
                                pattern: observation.enumeration_pattern.clone(),
                            },
                            observation,
                        ));
                    }
                    EnumerationOutcome::NormalizedAbsent => {
                        dynamic.push(DynamicObservation::AbsentProbe { path });
                        classified.push((ObservedInput::AbsentPathProbe { path }, observation));
                    }
                }
                continue;
            }

            match existence {
                PathExistence::Nonexistent => {
                    dynamic.push(DynamicObservation::AbsentProbe { path });
                    classified.push((ObservedInput::AbsentPathProbe { path }, observation));
                }
                PathExistence::ExistsAsDirectory => {
                    classified.push((ObservedInput::ExistingDirectoryProbe { path }, observation));
                }
                PathExistence::ExistsAsFile if observation.flags.hashing_required => {
                    let membership = seal_membership(paths, &sealed_contents, &source_seals, path);
                    let input = if let Some(hash) = declared.get(&path) {
                        Some(ObservedInput::FileContentRead { path, hash: *hash })
                    } else {
                        match membership {
                            SealMembership::Included => match self.oracle.query_content(path) {
                                Some(info) => Some(ObservedInput::FileContentRead {
                                    path,
                                    hash: info.hash,
                                }),
                                None => {
                                    trace!(?path, "sealed content not hashable");
                                    invalid_count += 1;
                                    None
                                }
                            },
                            SealMembership::NotSealed | SealMembership::Excluded => {
                                if pip.allow_undeclared_source_reads {
                                    self.context
                                        .counters
                                        .bump(EngineCounter::AllowedUndeclaredReads);
                                    allowed_undeclared.push(path);
                                    let hash = self
                                        .oracle
                                        .query_content(path)
                                        .map(|info| info.hash)
                                        .unwrap_or(ContentHash::UNTRACKED);
                                    Some(ObservedInput::FileContentRead { path, hash })
                                } else {
                                    match self.violations.decide(path) {
                                        ViolationDecision::Fail => {
                                            failures.push(ObservationFailure {
                                                path,
                                                kind: ObservationFailureKind::FatalObservation,
                                                description: format!(
                                                    "read of {:?} which is not a declared dependency",
                                                    paths.expand(path),
                                                ),
                                            });
                                            None
                                        }
                                        ViolationDecision::SuppressAndIgnorePath => {
                                            trace!(?path, "suppressed undeclared read");
                                            None
                                        }
                                    }
                                }
                            }
                        }
                    };
                    if let Some(input) = input {
                        classified.push((input, observation));
                    }
                }
                PathExistence::ExistsAsFile => {
                    let input = if self.reclassify_as_absent(pip, path, &request.shared_opaque_roots)
                    {
                        self.context
                            .counters
                            .bump(EngineCounter::ProbesReclassifiedAbsent);
                        dynamic.push(DynamicObservation::AbsentProbe { path });
                        ObservedInput::AbsentPathProbe { path }
                    } else {
                        ObservedInput::ExistingFileProbe { path }
                    };
                    classified.push((input, observation));
                }
            }
        }

        if !failures.is_empty() {
            return ObservedInputProcessingResult::Aborted { failures };
        }
        if invalid_count > 0 {
            return ObservedInputProcessingResult::Mismatched { invalid_count };
        }

        // Pass 3: elision and fingerprint formation over the sorted set.
        let mut absent_roots: Vec<PathId> = Vec::new();
        let mut observed_inputs = Vec::new();
        let mut entries = Vec::new();
        for (input, observation) in classified {
            if let ObservedInput::AbsentPathProbe { path } = input {
                if absent_roots
                    .iter()
                    .any(|root| *root != path && paths.is_within(path, *root))
                {
                    self.context.counters.bump(EngineCounter::AbsentProbesElided);
                    continue;
                }
                if let Some(parent) = paths.parent(path)
                    && let Some(filter) = real_fs_filters.get(&parent)
                    && let Some(name) = paths.file_name_atom(path)
                    && filter.allows(paths, name)
                {
                    // The parent's real enumeration already covers this
                    // name's absence.
                    self.context.counters.bump(EngineCounter::AbsentProbesElided);
                    continue;
                }
                absent_roots.push(path);
            }

            // Entries replay the raw observation, not its classification:
            // a later lookup must re-derive the classification from the
            // filesystem state it sees.
            entries.push(ObservedPathEntry {
                path: input.path(),
                is_search_path: observation.is_search_path,
                is_directory_path: observation.flags.directory_location,
                is_enumeration: observation.flags.enumeration,
                hashing_required: observation.flags.hashing_required,
                enumeration_pattern: observation.enumeration_pattern.clone(),
            });
            observed_inputs.push(input);
        }

        let mut accessed_file_names: Vec<FileNameAtom> = accessed_names.into_iter().collect();
        accessed_file_names.sort_by(|a, b| paths.cmp_atoms(*a, *b));

        let path_set = ObservedPathSet {
            entries,
            accessed_file_names,
        };
        let path_set_hash = path_set.hash(paths, &self.context.unsafe_options_hash);

        let weak = pip.weak_fingerprint(paths, &self.context.fingerprint_salt);
        let mut writer = FingerprintWriter::new();
        writer
            .write_str(tag::NAMESPACE, FINGERPRINT_NAMESPACE)
            .write_bytes(tag::WEAK, weak.0.as_bytes())
            .write_bytes(tag::PATH_SET, path_set_hash.as_bytes());
        writer.write_count(observed_inputs.len());
        for input in &observed_inputs {
            input.encode(&mut writer);
        }
        let strong_fingerprint = StrongFingerprint(writer.finish());

        trace!(%strong_fingerprint, inputs = observed_inputs.len(), "processed observations");
        ObservedInputProcessingResult::Success(ProcessingSuccess {
            observed_inputs,
            path_set,
            path_set_hash,
            strong_fingerprint,
            dynamic_observations: dynamic,
            allowed_undeclared_reads: allowed_undeclared,
        })
    }

    /// Sort by expanded path (classification and serialization order) and
    /// merge duplicate reports of one path.
    fn sort_and_merge(&self, observations: Vec<Observation>) -> Vec<Observation> {
        let paths = &self.context.paths;
        let mut merged: HashMap<PathId, Observation> = HashMap::new();
        for observation in observations {
            match merged.entry(observation.path) {
                std::collections::hash_map::Entry::Vacant(entry) => {
                    entry.insert(observation);
                }
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    existing.flags = existing.flags.merge(observation.flags);
                    existing.is_search_path |= observation.is_search_path;
                    if existing.enumeration_pattern.is_none() {
                        existing.enumeration_pattern = observation.enumeration_pattern;
                    }
                }
            }
        }
        let mut observations: Vec<Observation> = merged.into_values().collect();
        observations.sort_by(|a, b| paths.cmp_paths(a.path, b.path));
        observations
    }

    fn resolve_enumeration(
        &self,
        pip: &PipDescriptor,
        observation: &Observation,
        declared: &HashMap<PathId, ContentHash>,
        sealed_contents: &HashSet<PathId>,
        accessed_names: &HashSet<FileNameAtom>,
        real_fs_filters: &mut HashMap<PathId, DirectoryMembershipFilter>,
    ) -> EnumerationOutcome {
        let paths = &self.context.paths;
        let dir = observation.path;
        self.context.counters.bump(EngineCounter::DirectoryEnumerations);

        let policy = self.mounts.policy_for(paths, dir);
        let mode = choose_mode(
            policy,
            pip.allow_undeclared_source_reads,
            self.config.prefer_full_graph,
        );
        trace!(dir = ?paths.expand(dir), %mode, "enumerating");

        match mode {
            EnumerationMode::DefaultFingerprint => EnumerationOutcome::Enumerated {
                fingerprint: default_fingerprint(),
                mode,
            },
            EnumerationMode::RealFilesystem => {
                let filter = DirectoryMembershipFilter::from_pattern(
                    observation.enumeration_pattern.as_deref(),
                )
                .unwrap_or(DirectoryMembershipFilter::AllowAll);
                let filter = if observation.is_search_path {
                    filter.union_search_names(accessed_names.iter().copied())
                } else {
                    filter
                };

                let members = self
                    .views
                    .real
                    .enumerate(dir)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|entry| filter.allows(paths, entry.name))
                    .map(|entry| entry.name)
                    .collect();
                let fingerprint = fingerprint_members(paths, mode, members);
                real_fs_filters.insert(dir, filter);
                EnumerationOutcome::Enumerated { fingerprint, mode }
            }
            EnumerationMode::FullGraph => {
                let members = self
                    .views
                    .graph
                    .members(dir)
                    .iter()
                    .map(|&(_, name, _)| name)
                    .collect();
                EnumerationOutcome::Enumerated {
                    fingerprint: fingerprint_members(paths, mode, members),
                    mode,
                }
            }
            EnumerationMode::MinimalGraph => {
                let members = self.minimal_members(dir, declared, sealed_contents);
                if members.is_empty() {
                    // An output-mount directory with no reachable members
                    // is indistinguishable from a missing one.
                    EnumerationOutcome::NormalizedAbsent
                } else {
                    EnumerationOutcome::Enumerated {
                        fingerprint: fingerprint_members(paths, mode, members),
                        mode,
                    }
                }
            }
            EnumerationMode::MinimalGraphWithAlienFiles => {
                let mut members = self.minimal_members(dir, declared, sealed_contents);
                members.extend(self.alien_files(dir).iter().copied());
                EnumerationOutcome::Enumerated {
                    fingerprint: fingerprint_members(paths, mode, members),
                    mode,
                }
            }
        }
    }

    /// Graph members of `dir` reachable from the pip's declared
    /// dependencies.
    fn minimal_members(
        &self,
        dir: PathId,
        declared: &HashMap<PathId, ContentHash>,
        sealed_contents: &HashSet<PathId>,
    ) -> Vec<FileNameAtom> {
        self.views
            .graph
            .members(dir)
            .iter()
            .filter(|(path, _, existence)| {
                match existence {
                    // Intermediate directories count when any dependency
                    // lives beneath them.
                    PathExistence::ExistsAsDirectory => declared
                        .keys()
                        .chain(sealed_contents.iter())
                        .any(|dep| self.context.paths.is_within(*dep, *path)),
                    _ => declared.contains_key(path) || sealed_contents.contains(path),
                }
            })
            .map(|&(_, name, _)| name)
            .collect()
    }

    /// Filesystem entries under `dir` that the build does not produce.
    /// Shared across pips for the life of the build.
    fn alien_files(&self, dir: PathId) -> Arc<Vec<FileNameAtom>> {
        if let Some(cached) = self.alien_cache.get(&dir) {
            self.context.counters.bump(EngineCounter::AlienFileCacheHits);
            return Arc::clone(&cached);
        }

        let paths = &self.context.paths;
        let expanded = paths.expand(dir);
        let aliens: Vec<FileNameAtom> = self
            .views
            .real
            .enumerate(dir)
            .unwrap_or_default()
            .into_iter()
            .filter(|entry| {
                let name = paths.expand_atom(entry.name);
                let child = paths.intern(format!(
                    "{}/{}",
                    expanded.trim_end_matches(['/', '\\']),
                    name
                ));
                self.views.output.info(child).is_none()
            })
            .map(|entry| entry.name)
            .collect();

        let aliens = Arc::new(aliens);
        self.alien_cache.insert(dir, Arc::clone(&aliens));
        aliens
    }

    /// Whether an existing-file probe must be reclassified as absent: the
    /// path is an eventual output under a shared-opaque root, its bytes
    /// are not on disk, and (lazy deletion disabled) its producer runs
    /// after this pip, or (lazy deletion enabled) its sideband flag is
    /// still pending.
    fn reclassify_as_absent(
        &self,
        pip: &PipDescriptor,
        path: PathId,
        shared_opaque_roots: &[PathId],
    ) -> bool {
        let Some(info) = self.views.output.info(path) else {
            return false;
        };
        if !info.existence.exists() {
            return false;
        }
        let on_disk = self
            .views
            .real
            .existence(path)
            .is_some_and(|existence| existence.exists());
        if on_disk {
            return false;
        }
        let under_shared_opaque = shared_opaque_roots
            .iter()
            .any(|root| self.context.paths.is_within(path, *root));
        if !under_shared_opaque {
            return false;
        }

        if self.config.lazy_deletion_enabled {
            // Lazy deletion governs: the sideband flag alone decides.
            self.oracle.is_pending_lazy_output(path)
        } else {
            info.producer
                .is_some_and(|producer| self.oracle.is_downstream(producer, pip.id))
        }
    }
}

/// Outcome of resolving one enumeration.
enum EnumerationOutcome {
    Enumerated {
        fingerprint: crate::fingerprint::Fingerprint,
        mode: EnumerationMode,
    },
    NormalizedAbsent,
}

fn seal_membership(
    paths: &crate::path::PathTable,
    sealed_contents: &HashSet<PathId>,
    source_seals: &[(PathId, bool, DirectoryMembershipFilter)],
    path: PathId,
) -> SealMembership {
    if sealed_contents.contains(&path) {
        return SealMembership::Included;
    }

    let mut excluded = false;
    for (root, all_directories, filter) in source_seals {
        let in_scope = if *all_directories {
            paths.is_within(path, *root) && path != *root
        } else {
            paths.parent(path) == Some(*root)
        };
        if !in_scope {
            continue;
        }
        match paths.file_name_atom(path) {
            Some(name) if filter.allows(paths, name) => return SealMembership::Included,
            Some(_) => excluded = true,
            None => {}
        }
    }

    if excluded {
        SealMembership::Excluded
    } else {
        SealMembership::NotSealed
    }
}
