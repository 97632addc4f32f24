//! Layered filesystem views.
//!
//! The observed-input processor never touches the disk directly; it asks a
//! [`CombinedView`] which resolves each query against three layers in
//! order: what the build has produced (or will produce), what is really on
//! disk, and what the build graph knows structurally. Real-disk existence
//! is cached for the life of the build unless explicitly refreshed.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use tracing::trace;

use crate::{
    artifact::PathExistence,
    path::{FileNameAtom, PathId, PathTable},
    pip::PipId,
};

/// One member of an enumerated directory.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct DirectoryEntry {
    pub name: FileNameAtom,
    pub existence: PathExistence,
}

/// A source of existence and enumeration answers.
///
/// `None` means the view has no opinion about the path and resolution
/// should fall through to the next layer.
pub trait FileSystemView: Send + Sync {
    fn existence(&self, path: PathId) -> Option<PathExistence>;

    fn enumerate(&self, dir: PathId) -> Option<Vec<DirectoryEntry>>;
}

/// What the build knows about a declared or produced output path.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct OutputInfo {
    pub existence: PathExistence,

    /// The pip that produces this path, when known.
    pub producer: Option<PipId>,

    /// Whether the bytes are actually on disk yet.
    pub materialized: bool,
}

/// The produced-output layer: paths this build will or has produced.
#[derive(Debug, Default)]
pub struct OutputView {
    outputs: DashMap<PathId, OutputInfo>,
}

impl OutputView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a declared output and its producer.
    pub fn declare(&self, path: PathId, producer: PipId, existence: PathExistence) {
        self.outputs.insert(
            path,
            OutputInfo {
                existence,
                producer: Some(producer),
                materialized: false,
            },
        );
    }

    /// Record that an output's bytes are now on disk.
    pub fn mark_materialized(&self, path: PathId) {
        if let Some(mut info) = self.outputs.get_mut(&path) {
            info.materialized = true;
        }
    }

    /// Everything known about an output path.
    pub fn info(&self, path: PathId) -> Option<OutputInfo> {
        self.outputs.get(&path).map(|info| *info)
    }
}

impl FileSystemView for OutputView {
    fn existence(&self, path: PathId) -> Option<PathExistence> {
        self.outputs.get(&path).map(|info| info.existence)
    }

    fn enumerate(&self, _dir: PathId) -> Option<Vec<DirectoryEntry>> {
        None
    }
}

/// The real-disk layer, with a build-lifetime existence cache.
pub struct RealView {
    paths: Arc<PathTable>,
    cache: DashMap<PathId, PathExistence>,
}

impl RealView {
    pub fn new(paths: Arc<PathTable>) -> Self {
        Self {
            paths,
            cache: DashMap::new(),
        }
    }

    /// Drop the cached existence for a path, forcing a fresh stat.
    pub fn refresh(&self, path: PathId) {
        self.cache.remove(&path);
    }

    fn stat(&self, path: PathId) -> PathExistence {
        let expanded = self.paths.expand(path);
        match std::fs::symlink_metadata(&*expanded) {
            Ok(metadata) if metadata.is_dir() => PathExistence::ExistsAsDirectory,
            Ok(_) => PathExistence::ExistsAsFile,
            Err(_) => PathExistence::Nonexistent,
        }
    }
}

impl FileSystemView for RealView {
    fn existence(&self, path: PathId) -> Option<PathExistence> {
        if let Some(cached) = self.cache.get(&path) {
            return Some(*cached);
        }
        let existence = self.stat(path);
        self.cache.insert(path, existence);
        Some(existence)
    }

    fn enumerate(&self, dir: PathId) -> Option<Vec<DirectoryEntry>> {
        let expanded = self.paths.expand(dir);
        let entries = std::fs::read_dir(&*expanded).ok()?;
        let mut members = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let existence = match entry.file_type() {
                Ok(kind) if kind.is_dir() => PathExistence::ExistsAsDirectory,
                Ok(_) => PathExistence::ExistsAsFile,
                Err(_) => continue,
            };
            members.push(DirectoryEntry {
                name: self.paths.intern_atom(&*name),
                existence,
            });
        }
        trace!(dir = %expanded, members = members.len(), "enumerated real directory");
        Some(members)
    }
}

/// An in-memory disk, standing in for [`RealView`] where tests need exact
/// control over what "the disk" contains.
#[derive(Debug)]
pub struct InMemoryView {
    paths: Arc<PathTable>,
    entries: DashMap<PathId, PathExistence>,
}

impl InMemoryView {
    pub fn new(paths: Arc<PathTable>) -> Self {
        Self {
            paths,
            entries: DashMap::new(),
        }
    }

    /// Add a file, creating parent directories implicitly.
    pub fn add_file(&self, path: impl AsRef<str>) -> PathId {
        let id = self.paths.intern(path);
        self.entries.insert(id, PathExistence::ExistsAsFile);
        self.add_parents(id);
        id
    }

    /// Add an (empty) directory, creating parents implicitly.
    pub fn add_dir(&self, path: impl AsRef<str>) -> PathId {
        let id = self.paths.intern(path);
        self.entries.insert(id, PathExistence::ExistsAsDirectory);
        self.add_parents(id);
        id
    }

    /// Remove an entry, leaving parents in place.
    pub fn remove(&self, path: PathId) {
        self.entries.remove(&path);
    }

    fn add_parents(&self, mut id: PathId) {
        while let Some(parent) = self.paths.parent(id) {
            self.entries
                .insert(parent, PathExistence::ExistsAsDirectory);
            id = parent;
        }
    }
}

impl FileSystemView for InMemoryView {
    fn existence(&self, path: PathId) -> Option<PathExistence> {
        Some(
            self.entries
                .get(&path)
                .map(|e| *e)
                .unwrap_or(PathExistence::Nonexistent),
        )
    }

    fn enumerate(&self, dir: PathId) -> Option<Vec<DirectoryEntry>> {
        match self.entries.get(&dir).map(|e| *e) {
            Some(PathExistence::ExistsAsDirectory) => {}
            _ => return None,
        }
        let mut members = Vec::new();
        for entry in self.entries.iter() {
            let (id, existence) = (*entry.key(), *entry.value());
            if self.paths.parent(id) == Some(dir)
                && let Some(name) = self.paths.file_name_atom(id)
            {
                members.push(DirectoryEntry { name, existence });
            }
        }
        Some(members)
    }
}

/// The structural layer: every path the build graph knows about.
#[derive(Debug)]
pub struct GraphView {
    nodes: HashMap<PathId, PathExistence>,
    children: HashMap<PathId, Vec<(PathId, FileNameAtom, PathExistence)>>,
}

impl GraphView {
    /// Build the view from the set of graph-known file paths. Ancestor
    /// directories are derived.
    pub fn from_files(paths: &PathTable, files: impl IntoIterator<Item = PathId>) -> Self {
        let mut nodes = HashMap::new();
        for file in files {
            nodes.insert(file, PathExistence::ExistsAsFile);
            let mut child = file;
            while let Some(parent) = paths.parent(child) {
                nodes
                    .entry(parent)
                    .or_insert(PathExistence::ExistsAsDirectory);
                child = parent;
            }
        }

        let mut children: HashMap<PathId, Vec<(PathId, FileNameAtom, PathExistence)>> =
            HashMap::new();
        for (&node, &existence) in &nodes {
            if let Some(parent) = paths.parent(node)
                && let Some(name) = paths.file_name_atom(node)
            {
                children
                    .entry(parent)
                    .or_default()
                    .push((node, name, existence));
            }
        }

        Self { nodes, children }
    }

    /// The graph-known members of a directory, with their paths.
    pub fn members(&self, dir: PathId) -> &[(PathId, FileNameAtom, PathExistence)] {
        self.children.get(&dir).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the graph knows this path at all.
    pub fn knows(&self, path: PathId) -> bool {
        self.nodes.contains_key(&path)
    }
}

impl FileSystemView for GraphView {
    fn existence(&self, path: PathId) -> Option<PathExistence> {
        self.nodes.get(&path).copied()
    }

    fn enumerate(&self, dir: PathId) -> Option<Vec<DirectoryEntry>> {
        let members = self.children.get(&dir)?;
        Some(
            members
                .iter()
                .map(|&(_, name, existence)| DirectoryEntry { name, existence })
                .collect(),
        )
    }
}

/// The resolution order the processor sees: produced outputs first, then
/// the real disk, then graph structure (for directory existence only).
pub struct CombinedView {
    pub output: Arc<OutputView>,
    pub real: Arc<dyn FileSystemView>,
    pub graph: Arc<GraphView>,
}

impl CombinedView {
    pub fn new(
        output: Arc<OutputView>,
        real: Arc<dyn FileSystemView>,
        graph: Arc<GraphView>,
    ) -> Self {
        Self {
            output,
            real,
            graph,
        }
    }

    /// Resolve a path's existence through the layers.
    pub fn existence(&self, path: PathId) -> PathExistence {
        if let Some(existence) = self.output.existence(path)
            && existence.exists()
        {
            return existence;
        }
        if let Some(existence) = self.real.existence(path)
            && existence.exists()
        {
            return existence;
        }
        if self.graph.existence(path) == Some(PathExistence::ExistsAsDirectory) {
            return PathExistence::ExistsAsDirectory;
        }
        PathExistence::Nonexistent
    }
}
