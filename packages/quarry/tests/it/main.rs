use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use quarry::{
    artifact::{DirectoryArtifact, FileArtifact, FileContentInfo},
    context::BuildContext,
    fsview::{CombinedView, FileSystemView, GraphView, InMemoryView, OutputView},
    observe::{InputOracle, MountPolicy, MountTable, ObservedInputProcessor, ProcessorConfig, SourceSeal},
    path::{PathId, PathTable},
    pip::PipId,
};

pub mod engine;
pub mod observe;
pub mod props;
pub mod scheduler;

/// A self-contained build world over an in-memory disk.
pub struct World {
    pub context: BuildContext,
    pub paths: Arc<PathTable>,
    pub disk: Arc<InMemoryView>,
    pub output: Arc<OutputView>,
    pub views: Arc<CombinedView>,
}

/// Build a world whose graph knows the given files.
pub fn world(graph_files: &[&str]) -> World {
    let paths = Arc::new(PathTable::with_case_sensitivity(true));
    let disk = Arc::new(InMemoryView::new(Arc::clone(&paths)));
    let output = Arc::new(OutputView::new());
    let graph = Arc::new(GraphView::from_files(
        &paths,
        graph_files.iter().map(|file| paths.intern(*file)),
    ));
    let views = Arc::new(CombinedView::new(
        Arc::clone(&output),
        Arc::clone(&disk) as Arc<dyn FileSystemView>,
        graph,
    ));
    World {
        context: BuildContext::with_paths(Arc::clone(&paths)),
        paths,
        disk,
        output,
        views,
    }
}

impl World {
    /// A mount table with one readable, hashable, source-only mount.
    pub fn source_mount(&self, root: &str) -> MountTable {
        let mut mounts = MountTable::new();
        mounts.add(
            self.paths.intern(root),
            MountPolicy {
                readable: true,
                hashable: true,
                has_build_outputs: false,
            },
        );
        mounts
    }

    /// Add an output mount (graph-fingerprinted) to a table.
    pub fn add_output_mount(&self, mounts: &mut MountTable, root: &str) {
        mounts.add(
            self.paths.intern(root),
            MountPolicy {
                readable: true,
                hashable: true,
                has_build_outputs: true,
            },
        );
    }

    /// A processor over this world with the default config.
    pub fn processor(&self, oracle: Arc<dyn InputOracle>, mounts: MountTable) -> ObservedInputProcessor {
        self.processor_with(oracle, mounts, ProcessorConfig::default())
    }

    pub fn processor_with(
        &self,
        oracle: Arc<dyn InputOracle>,
        mounts: MountTable,
        config: ProcessorConfig,
    ) -> ObservedInputProcessor {
        ObservedInputProcessor::new(
            self.context.clone(),
            Arc::clone(&self.views),
            oracle,
            mounts,
            config,
        )
    }
}

/// An oracle answering from fixed maps.
#[derive(Default)]
pub struct StubOracle {
    pub contents: HashMap<PathId, FileContentInfo>,
    pub sealed_contents: HashMap<PathId, Vec<FileArtifact>>,
    pub source_seals: HashMap<PathId, SourceSeal>,
    /// Pairs `(later, earlier)`: `later` is ordered after `earlier`.
    pub downstream: HashSet<(PipId, PipId)>,
    pub pending_lazy: HashSet<PathId>,
}

impl InputOracle for StubOracle {
    fn query_content(&self, path: PathId) -> Option<FileContentInfo> {
        self.contents.get(&path).copied()
    }

    fn sealed_directory_contents(&self, dir: &DirectoryArtifact) -> Vec<FileArtifact> {
        self.sealed_contents.get(&dir.path).cloned().unwrap_or_default()
    }

    fn source_seal(&self, dir: &DirectoryArtifact) -> Option<SourceSeal> {
        self.source_seals.get(&dir.path).cloned()
    }

    fn is_downstream(&self, pip: PipId, other: PipId) -> bool {
        self.downstream.contains(&(pip, other))
    }

    fn is_pending_lazy_output(&self, path: PathId) -> bool {
        self.pending_lazy.contains(&path)
    }
}
