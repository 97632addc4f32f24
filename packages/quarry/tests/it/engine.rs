//! Cache lookup / re-execution agreement through the memoization store.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
};

use clients::{
    hash::{ContentHash, HashAlgorithm},
    session::{
        FileAccessMode, FileRealizationMode, FileReplacementMode, PlaceContent, PlaceResult,
    },
};
use pretty_assertions::assert_eq;
use quarry::{
    artifact::FileArtifact,
    context::EngineCounter,
    engine::{CacheEntry, CacheLookupOutcome, Engine, MemoizationStore, materialize_outputs},
    fingerprint::WeakFingerprint,
    observe::ObservedInputProcessingResult,
    pip::{PipDescriptor, PipId},
    sandbox::{AccessOperation, ReportedFileAccess},
};

use crate::{StubOracle, World, world};

#[derive(Default)]
struct MemStore {
    entries: Mutex<HashMap<WeakFingerprint, Vec<CacheEntry>>>,
}

impl MemStore {
    fn snapshot(&self) -> Vec<(WeakFingerprint, String)> {
        let mut snapshot: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(weak, entries)| {
                entries
                    .iter()
                    .map(|entry| (*weak, entry.strong_fingerprint.to_string()))
            })
            .collect();
        snapshot.sort_by(|a, b| a.1.cmp(&b.1));
        snapshot
    }
}

impl MemoizationStore for MemStore {
    fn prior_entries(&self, weak: &WeakFingerprint) -> Vec<CacheEntry> {
        let entries = self.entries.lock().unwrap();
        let mut prior = entries.get(weak).cloned().unwrap_or_default();
        prior.reverse();
        prior
    }

    fn publish(&self, weak: WeakFingerprint, entry: CacheEntry) {
        self.entries.lock().unwrap().entry(weak).or_default().push(entry);
    }
}

fn hash(fill: u8) -> ContentHash {
    ContentHash::new(HashAlgorithm::Vso, [fill; 32])
}

fn engine(world: &World, store: Arc<MemStore>) -> Engine<MemStore> {
    let processor = Arc::new(world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    ));
    Engine::new(world.context.clone(), processor, store)
}

fn compile_pip(world: &World, id: u32, source: &str, declared_hash: ContentHash) -> PipDescriptor {
    let input = world.paths.intern(source);
    PipDescriptor::builder()
        .id(PipId(id))
        .description(format!("compile {source}"))
        .executable("/usr/bin/cc")
        .declared_inputs(vec![(FileArtifact::source(input), declared_hash)])
        .build()
}

#[test_log::test]
fn an_execution_entry_re_validates_as_a_hit() {
    let world = world(&[]);
    let source = world.disk.add_file("/repo/src/a.c");
    let missing = world.paths.intern("/repo/src/a.c.local");
    let pip = compile_pip(&world, 1, "/repo/src/a.c", hash(0x01));

    let store = Arc::new(MemStore::default());
    let engine = engine(&world, Arc::clone(&store));

    let result = engine.process_execution(
        &pip,
        vec![
            ReportedFileAccess::new(source, AccessOperation::Read),
            ReportedFileAccess::new(missing, AccessOperation::Probe),
        ],
        vec![(world.paths.intern("/repo/out/a.o"), hash(0xA0))],
        vec![],
        vec![],
    );
    let executed = match result {
        ObservedInputProcessingResult::Success(success) => success,
        other => panic!("expected success, got {other:?}"),
    };

    match engine.run_cache_lookup(&pip) {
        CacheLookupOutcome::Hit {
            strong_fingerprint,
            outputs,
        } => {
            assert_eq!(strong_fingerprint, executed.strong_fingerprint);
            assert_eq!(outputs, vec![(world.paths.intern("/repo/out/a.o"), hash(0xA0))]);
        }
        CacheLookupOutcome::Miss => panic!("expected a hit"),
    }
    assert_eq!(world.context.counters.get(EngineCounter::CacheHits), 1);
}

#[test_log::test]
fn a_changed_filesystem_invalidates_the_entry() {
    let world = world(&[]);
    let source = world.disk.add_file("/repo/src/a.c");
    let probed = world.paths.intern("/repo/src/a.c.local");
    let pip = compile_pip(&world, 1, "/repo/src/a.c", hash(0x01));

    let store = Arc::new(MemStore::default());
    let engine = engine(&world, Arc::clone(&store));

    engine.process_execution(
        &pip,
        vec![
            ReportedFileAccess::new(source, AccessOperation::Read),
            ReportedFileAccess::new(probed, AccessOperation::Probe),
        ],
        vec![],
        vec![],
        vec![],
    );

    // The absent probe now resolves to a real file: the strong
    // fingerprint no longer matches.
    world.disk.add_file("/repo/src/a.c.local");
    assert!(matches!(
        engine.run_cache_lookup(&pip),
        CacheLookupOutcome::Miss,
    ));
    assert_eq!(world.context.counters.get(EngineCounter::CacheMisses), 1);
}

#[test_log::test]
fn disjoint_pips_reach_the_same_cache_state_in_any_order() {
    let run = |first_a: bool| {
        let world = world(&[]);
        let a_src = world.disk.add_file("/repo/src/a.c");
        let b_src = world.disk.add_file("/repo/src/b.c");
        let pip_a = compile_pip(&world, 1, "/repo/src/a.c", hash(0x01));
        let pip_b = compile_pip(&world, 2, "/repo/src/b.c", hash(0x02));

        let store = Arc::new(MemStore::default());
        let engine = engine(&world, Arc::clone(&store));

        let mut jobs: Vec<(&PipDescriptor, _)> = vec![
            (&pip_a, ReportedFileAccess::new(a_src, AccessOperation::Read)),
            (&pip_b, ReportedFileAccess::new(b_src, AccessOperation::Read)),
        ];
        if !first_a {
            jobs.reverse();
        }
        for (pip, access) in jobs {
            engine.process_execution(pip, vec![access], vec![], vec![], vec![]);
        }
        store.snapshot()
    };

    assert_eq!(run(true), run(false));
}

/// A placement session that records destinations.
#[derive(Default)]
struct RecordingSession {
    placed: Mutex<Vec<String>>,
    missing: Vec<ContentHash>,
}

impl PlaceContent for RecordingSession {
    async fn place_file(
        &self,
        hash: &ContentHash,
        destination: &Path,
        _access: FileAccessMode,
        _replacement: FileReplacementMode,
        _realization: FileRealizationMode,
    ) -> color_eyre::Result<PlaceResult> {
        if self.missing.contains(hash) {
            return Ok(PlaceResult::ContentNotFound);
        }
        self.placed
            .lock()
            .unwrap()
            .push(destination.to_string_lossy().into_owned());
        Ok(PlaceResult::Placed { bytes: 4 })
    }
}

#[test_log::test(tokio::test)]
async fn hit_outputs_are_placed_through_the_session() {
    let world = world(&[]);
    let outputs = vec![
        (world.paths.intern("/repo/out/a.o"), hash(0xA0)),
        (world.paths.intern("/repo/out/a.d"), hash(0xA1)),
    ];

    let session = RecordingSession::default();
    let placed = materialize_outputs(&session, &world.paths, &outputs)
        .await
        .unwrap();

    assert_eq!(placed, 2);
    assert_eq!(
        *session.placed.lock().unwrap(),
        vec!["/repo/out/a.o".to_owned(), "/repo/out/a.d".to_owned()],
    );
}

#[test_log::test(tokio::test)]
async fn missing_content_surfaces_instead_of_being_swallowed() {
    let world = world(&[]);
    let outputs = vec![(world.paths.intern("/repo/out/a.o"), hash(0xA0))];

    let session = RecordingSession {
        missing: vec![hash(0xA0)],
        ..RecordingSession::default()
    };
    assert!(
        materialize_outputs(&session, &world.paths, &outputs)
            .await
            .is_err()
    );
}
