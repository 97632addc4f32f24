//! Observed-input processing scenarios over the in-memory world.

use std::sync::Arc;

use clients::hash::{ContentHash, HashAlgorithm};
use pretty_assertions::assert_eq;
use quarry::{
    artifact::{DirectoryArtifact, FileArtifact, FileContentInfo},
    context::EngineCounter,
    observe::{
        Observation, ObservationProcessingRequest, ObservedInput,
        ObservedInputProcessingResult, ProcessorConfig, SourceSeal,
    },
    path::PathId,
    pip::{PipDescriptor, PipId},
};

use crate::{StubOracle, World, world};

fn hash(fill: u8) -> ContentHash {
    ContentHash::new(HashAlgorithm::Vso, [fill; 32])
}

fn pip(world: &World, declared: Vec<(FileArtifact, ContentHash)>) -> PipDescriptor {
    PipDescriptor::builder()
        .id(PipId(1))
        .description("compile app")
        .executable("/usr/bin/cc")
        .working_directory(world.paths.intern("/repo"))
        .declared_inputs(declared)
        .build()
}

fn expect_success(result: ObservedInputProcessingResult) -> quarry::observe::ProcessingSuccess {
    match result {
        ObservedInputProcessingResult::Success(success) => success,
        other => panic!("expected success, got {other:?}"),
    }
}

#[test_log::test]
fn observed_inputs_come_back_in_expanded_path_order() {
    let world = world(&[]);
    let p1 = world.disk.add_file("/repo/src/a.c");
    let p2 = world.disk.add_file("/repo/src/b.gen");
    let p3 = world.disk.add_dir("/repo/src/include");

    let pip = pip(&world, vec![(FileArtifact::source(p1), hash(0x01))]);
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );

    // Deliberately out of order: probe, read, enumeration.
    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![
            Observation::probe(p2),
            Observation::read(p1),
            Observation::enumerate(p3, None),
        ])
        .build();
    let success = expect_success(processor.process(request));

    let order: Vec<PathId> = success.observed_inputs.iter().map(ObservedInput::path).collect();
    assert_eq!(order, vec![p1, p2, p3]);
    assert!(matches!(
        success.observed_inputs[0],
        ObservedInput::FileContentRead { hash: h, .. } if h == hash(0x01),
    ));
    assert!(matches!(
        success.observed_inputs[1],
        ObservedInput::ExistingFileProbe { .. },
    ));
    assert!(matches!(
        success.observed_inputs[2],
        ObservedInput::DirectoryEnumeration { .. },
    ));
}

#[test_log::test]
fn permuted_observations_produce_the_same_strong_fingerprint() {
    let world = world(&[]);
    let a = world.disk.add_file("/repo/src/a.c");
    let b = world.disk.add_file("/repo/src/b.c");
    let c = world.disk.add_dir("/repo/src/sub");

    let pip = pip(
        &world,
        vec![
            (FileArtifact::source(a), hash(0x01)),
            (FileArtifact::source(b), hash(0x02)),
        ],
    );
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );

    let observations = vec![
        Observation::read(a),
        Observation::read(b),
        Observation::enumerate(c, None),
        Observation::probe(world.paths.intern("/repo/src/missing.h")),
    ];

    let mut fingerprints = Vec::new();
    for permutation in [
        vec![0, 1, 2, 3],
        vec![3, 2, 1, 0],
        vec![1, 3, 0, 2],
    ] {
        let shuffled = permutation
            .into_iter()
            .map(|i: usize| observations[i].clone())
            .collect();
        let request = ObservationProcessingRequest::builder()
            .pip(&pip)
            .observations(shuffled)
            .build();
        fingerprints.push(expect_success(processor.process(request)).strong_fingerprint);
    }
    assert_eq!(fingerprints[0], fingerprints[1]);
    assert_eq!(fingerprints[0], fingerprints[2]);
}

#[test_log::test]
fn replaying_the_path_set_reproduces_the_strong_fingerprint() {
    let world = world(&[]);
    let a = world.disk.add_file("/repo/src/a.c");
    let include = world.disk.add_dir("/repo/include");
    world.disk.add_file("/repo/include/a.h");
    let missing = world.paths.intern("/repo/src/config.local");

    let pip = pip(&world, vec![(FileArtifact::source(a), hash(0x01))]);
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );

    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![
            Observation::read(a),
            Observation::enumerate(include, Some("*.h".to_owned())),
            Observation::probe(missing),
        ])
        .build();
    let executed = expect_success(processor.process(request));

    let replayed = expect_success(processor.process_prior(&pip, &executed.path_set));
    assert_eq!(replayed.strong_fingerprint, executed.strong_fingerprint);
    assert_eq!(replayed.path_set, executed.path_set);
    assert_eq!(replayed.path_set_hash, executed.path_set_hash);
}

#[test_log::test]
fn processing_is_idempotent() {
    let world = world(&[]);
    let a = world.disk.add_file("/repo/src/a.c");
    let pip = pip(&world, vec![(FileArtifact::source(a), hash(0x01))]);
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );

    let run = || {
        let request = ObservationProcessingRequest::builder()
            .pip(&pip)
            .observations(vec![
                Observation::read(a),
                Observation::probe(world.paths.intern("/repo/src/missing.h")),
            ])
            .build();
        expect_success(processor.process(request))
    };

    let first = run();
    let second = run();
    assert_eq!(first.strong_fingerprint, second.strong_fingerprint);
    assert_eq!(first.path_set, second.path_set);
    assert_eq!(first.observed_inputs, second.observed_inputs);
}

#[test_log::test]
fn absent_probes_nested_under_an_absent_probe_are_elided() {
    let world = world(&[]);
    world.disk.add_dir("/repo/src");
    let parent = world.paths.intern("/repo/src/missing");
    let child = world.paths.intern("/repo/src/missing/deep.h");

    let pip = pip(&world, vec![]);
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );

    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![Observation::probe(parent), Observation::probe(child)])
        .build();
    let success = expect_success(processor.process(request));

    let absent: Vec<PathId> = success
        .observed_inputs
        .iter()
        .filter_map(|input| match input {
            ObservedInput::AbsentPathProbe { path } => Some(*path),
            _ => None,
        })
        .collect();
    assert_eq!(absent, vec![parent]);
    assert_eq!(world.context.counters.get(EngineCounter::AbsentProbesElided), 1);
}

#[test_log::test]
fn absent_probe_under_a_real_enumeration_is_elided_when_the_filter_covers_it() {
    let world = world(&[]);
    let include = world.disk.add_dir("/repo/include");
    world.disk.add_file("/repo/include/present.h");
    let covered = world.paths.intern("/repo/include/missing.h");
    let uncovered = world.paths.intern("/repo/include/missing.txt");

    let pip = pip(&world, vec![]);
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );

    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![
            Observation::enumerate(include, Some("*.h".to_owned())),
            Observation::probe(covered),
            Observation::probe(uncovered),
        ])
        .build();
    let success = expect_success(processor.process(request));

    let absent: Vec<PathId> = success
        .observed_inputs
        .iter()
        .filter_map(|input| match input {
            ObservedInput::AbsentPathProbe { path } => Some(*path),
            _ => None,
        })
        .collect();
    // `missing.h` is covered by the enumeration's filter; `missing.txt`
    // is outside it and must be recorded.
    assert_eq!(absent, vec![uncovered]);
}

#[test_log::test]
fn source_seal_patterns_gate_content_hashing_but_not_probes() {
    let world = world(&[]);
    let hdrs = world.disk.add_dir("/repo/hdrs");
    let header = world.disk.add_file("/repo/hdrs/util.h");
    let readme = world.disk.add_file("/repo/hdrs/readme.txt");

    let mut oracle = StubOracle::default();
    oracle.contents.insert(header, FileContentInfo::file(hash(0x11), 64));
    oracle.source_seals.insert(
        hdrs,
        SourceSeal {
            all_directories: false,
            patterns: vec!["*.h".to_owned()],
        },
    );

    let mut pip = pip(&world, vec![]);
    pip.directory_dependencies = vec![DirectoryArtifact::new(hdrs, 1, false)];

    let processor = world.processor(Arc::new(oracle), world.source_mount("/repo"));
    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![Observation::read(header), Observation::probe(readme)])
        .build();
    let success = expect_success(processor.process(request));

    // Sorted by path: readme.txt precedes util.h. The excluded probe is
    // counted, but only as a probe; the sealed read is hashed through the
    // seal.
    assert!(matches!(
        success.observed_inputs[0],
        ObservedInput::ExistingFileProbe { .. },
    ));
    assert!(matches!(
        success.observed_inputs[1],
        ObservedInput::FileContentRead { hash: h, .. } if h == hash(0x11),
    ));
}

#[test_log::test]
fn undeclared_reads_fail_the_pip_under_strict_checking() {
    let world = world(&[]);
    let stray = world.disk.add_file("/repo/src/stray.c");

    let pip = pip(&world, vec![]);
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );

    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![Observation::read(stray)])
        .build();
    match processor.process(request) {
        ObservedInputProcessingResult::Aborted { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].path, stray);
        }
        other => panic!("expected abort, got {other:?}"),
    }
}

#[test_log::test]
fn undeclared_reads_are_recorded_when_allowed() {
    let world = world(&[]);
    let stray = world.disk.add_file("/repo/src/stray.c");

    let mut pip = pip(&world, vec![]);
    pip.allow_undeclared_source_reads = true;

    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );
    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![Observation::read(stray)])
        .build();
    let success = expect_success(processor.process(request));

    assert_eq!(success.allowed_undeclared_reads, vec![stray]);
    // No oracle content: the read is tracked under the untracked
    // sentinel.
    assert!(matches!(
        success.observed_inputs[0],
        ObservedInput::FileContentRead { hash, .. } if hash == ContentHash::UNTRACKED,
    ));
}

#[test_log::test]
fn eventual_outputs_reclassify_to_absent_when_the_producer_is_downstream() {
    let world = world(&[]);
    world.disk.add_dir("/repo/out");
    let eventual = world.paths.intern("/repo/out/gen.bin");
    world.output.declare(
        eventual,
        PipId(9),
        quarry::artifact::PathExistence::ExistsAsFile,
    );

    let mut oracle = StubOracle::default();
    // Pip 9 (the producer) runs after pip 1 (the prober).
    oracle.downstream.insert((PipId(9), PipId(1)));

    let pip = pip(&world, vec![]);
    let processor = world.processor(Arc::new(oracle), world.source_mount("/repo"));

    let shared_opaque = vec![world.paths.intern("/repo/out")];
    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![Observation::probe(eventual)])
        .shared_opaque_roots(shared_opaque)
        .build();
    let success = expect_success(processor.process(request));

    assert!(matches!(
        success.observed_inputs[0],
        ObservedInput::AbsentPathProbe { .. },
    ));
    assert_eq!(
        world
            .context
            .counters
            .get(EngineCounter::ProbesReclassifiedAbsent),
        1,
    );
}

#[test_log::test]
fn lazy_deletion_makes_the_sideband_flag_governing() {
    let world = world(&[]);
    world.disk.add_dir("/repo/out");
    let eventual = world.paths.intern("/repo/out/gen.bin");
    world.output.declare(
        eventual,
        PipId(9),
        quarry::artifact::PathExistence::ExistsAsFile,
    );

    // Downstream would say "reclassify", the sideband flag says "keep":
    // with lazy deletion enabled the sideband flag wins.
    let mut oracle = StubOracle::default();
    oracle.downstream.insert((PipId(9), PipId(1)));

    let pip = pip(&world, vec![]);
    let config = ProcessorConfig::builder().lazy_deletion_enabled(true).build();
    let processor = world.processor_with(Arc::new(oracle), world.source_mount("/repo"), config);

    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![Observation::probe(eventual)])
        .shared_opaque_roots(vec![world.paths.intern("/repo/out")])
        .build();
    let success = expect_success(processor.process(request));
    assert!(matches!(
        success.observed_inputs[0],
        ObservedInput::ExistingFileProbe { .. },
    ));
}

#[test_log::test]
fn empty_minimal_graph_enumeration_normalizes_to_an_absent_probe() {
    let world = world(&["/repo/out/other/lib.a"]);
    let out = world.disk.add_dir("/repo/out/gen");

    let pip = pip(&world, vec![]);
    let mut mounts = world.source_mount("/repo");
    world.add_output_mount(&mut mounts, "/repo/out");

    let processor = world.processor(Arc::new(StubOracle::default()), mounts);
    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![Observation::enumerate(out, None)])
        .build();
    let success = expect_success(processor.process(request));

    assert!(matches!(
        success.observed_inputs[0],
        ObservedInput::AbsentPathProbe { .. },
    ));
}

#[test_log::test]
fn search_path_enumerations_fold_accessed_names_into_the_filter() {
    let world = world(&[]);
    let tools = world.disk.add_dir("/repo/tools");
    world.disk.add_file("/repo/tools/cc.sh");
    world.disk.add_file("/repo/tools/linker.exe");
    let accessed = world.disk.add_file("/repo/tools/cc.sh");

    let pip = pip(&world, vec![]);
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );

    let enumerate = |search: bool| {
        let observation = Observation::enumerate(tools, Some("*.exe".to_owned()));
        let observation = if search {
            observation.search_path()
        } else {
            observation
        };
        let request = ObservationProcessingRequest::builder()
            .pip(&pip)
            .observations(vec![observation, Observation::probe(accessed)])
            .build();
        expect_success(processor.process(request))
    };

    let plain = enumerate(false);
    let search = enumerate(true);

    // The accessed name widens the search-path filter, so the
    // enumeration fingerprints differ.
    assert_ne!(plain.strong_fingerprint, search.strong_fingerprint);
    let atom = world.paths.intern_atom("cc.sh");
    assert!(search.path_set.accessed_file_names.contains(&atom));
    assert!(plain.path_set.accessed_file_names.is_empty());
}

#[test_log::test]
fn unhashable_sealed_content_reports_a_mismatch() {
    let world = world(&[]);
    let hdrs = world.disk.add_dir("/repo/hdrs");
    let header = world.disk.add_file("/repo/hdrs/util.h");

    let mut oracle = StubOracle::default();
    // Sealed contents list the file, but no content is available.
    oracle
        .sealed_contents
        .insert(hdrs, vec![FileArtifact::source(header)]);

    let mut pip = pip(&world, vec![]);
    pip.directory_dependencies = vec![DirectoryArtifact::new(hdrs, 1, false)];

    let processor = world.processor(Arc::new(oracle), world.source_mount("/repo"));
    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![Observation::read(header)])
        .build();
    match processor.process(request) {
        ObservedInputProcessingResult::Mismatched { invalid_count } => {
            assert_eq!(invalid_count, 1);
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
}

#[test_log::test]
fn cancellation_aborts_processing() {
    let world = world(&[]);
    let a = world.disk.add_file("/repo/src/a.c");
    let pip = pip(&world, vec![(FileArtifact::source(a), hash(0x01))]);
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );

    world.context.cancellation.cancel();
    let request = ObservationProcessingRequest::builder()
        .pip(&pip)
        .observations(vec![Observation::read(a)])
        .build();
    assert!(matches!(
        processor.process(request),
        ObservedInputProcessingResult::Aborted { .. },
    ));
}

#[test_log::test]
fn enumerations_outside_any_mount_use_the_default_fingerprint() {
    let world = world(&[]);
    let outside = world.disk.add_dir("/opt/toolchain");
    let pip = pip(&world, vec![]);
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );

    // Two different directories outside the mounts fingerprint
    // identically: their contents are invisible to the cache identity.
    let other = world.disk.add_dir("/opt/other");
    world.disk.add_file("/opt/other/file.txt");

    let fingerprint_of = |dir: PathId| {
        let request = ObservationProcessingRequest::builder()
            .pip(&pip)
            .observations(vec![Observation::enumerate(dir, None)])
            .build();
        match expect_success(processor.process(request)).observed_inputs[0] {
            ObservedInput::DirectoryEnumeration { fingerprint, .. } => fingerprint,
            ref other => panic!("expected enumeration, got {other:?}"),
        }
    };

    assert_eq!(fingerprint_of(outside), fingerprint_of(other));
}

#[test_log::test]
fn alien_file_enumerations_exclude_build_outputs_and_are_cached() {
    let world = world(&["/repo/out/lib.a"]);
    let out = world.disk.add_dir("/repo/out");
    world.disk.add_file("/repo/out/stray-note.txt");
    let produced = world.disk.add_file("/repo/out/lib.a");
    world.output.declare(
        produced,
        PipId(5),
        quarry::artifact::PathExistence::ExistsAsFile,
    );

    let mut pip = pip(&world, vec![(FileArtifact::source(produced), hash(0x07))]);
    pip.allow_undeclared_source_reads = true;

    let mut mounts = world.source_mount("/repo");
    world.add_output_mount(&mut mounts, "/repo/out");
    let processor = world.processor(Arc::new(StubOracle::default()), mounts);

    let run = || {
        let request = ObservationProcessingRequest::builder()
            .pip(&pip)
            .observations(vec![Observation::enumerate(out, None)])
            .build();
        expect_success(processor.process(request))
    };

    let first = run();
    let second = run();
    assert_eq!(first.strong_fingerprint, second.strong_fingerprint);
    // The second enumeration was served from the build-wide alien cache.
    assert_eq!(world.context.counters.get(EngineCounter::AlienFileCacheHits), 1);
}
