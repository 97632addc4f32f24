//! Property suites for the fingerprint pipeline.

use std::sync::Arc;

use clients::hash::{ContentHash, HashAlgorithm};
use proptest::prelude::*;
use quarry::{
    artifact::FileArtifact,
    observe::{
        Observation, ObservationProcessingRequest, ObservedInputProcessingResult,
        ProcessingSuccess,
    },
    pip::{PipDescriptor, PipId},
};

use crate::{StubOracle, World, world};

const FILES: usize = 6;

/// One generated access: `(target index, kind)` where kind 0 reads a
/// declared file, 1 probes an absent path, 2 enumerates a directory.
fn arb_accesses() -> impl Strategy<Value = Vec<(usize, u8)>> {
    prop::collection::vec((0..FILES, 0..3u8), 1..16)
}

fn build_world() -> (World, PipDescriptor) {
    let world = world(&[]);
    let mut declared = Vec::new();
    for i in 0..FILES {
        let file = world.disk.add_file(format!("/repo/src/f{i}.c"));
        world.disk.add_dir(format!("/repo/d{i}"));
        declared.push((
            FileArtifact::source(file),
            ContentHash::new(HashAlgorithm::Vso, [i as u8 + 1; 32]),
        ));
    }
    let pip = PipDescriptor::builder()
        .id(PipId(1))
        .description("generated pip")
        .executable("/usr/bin/cc")
        .declared_inputs(declared)
        .build();
    (world, pip)
}

fn to_observations(world: &World, accesses: &[(usize, u8)]) -> Vec<Observation> {
    accesses
        .iter()
        .map(|&(i, kind)| match kind {
            0 => Observation::read(world.paths.intern(format!("/repo/src/f{i}.c"))),
            1 => Observation::probe(world.paths.intern(format!("/repo/src/absent{i}"))),
            _ => Observation::enumerate(world.paths.intern(format!("/repo/d{i}")), None),
        })
        .collect()
}

fn process(world: &World, pip: &PipDescriptor, observations: Vec<Observation>) -> ProcessingSuccess {
    let processor = world.processor(
        Arc::new(StubOracle::default()),
        world.source_mount("/repo"),
    );
    let request = ObservationProcessingRequest::builder()
        .pip(pip)
        .observations(observations)
        .build();
    match processor.process(request) {
        ObservedInputProcessingResult::Success(success) => success,
        other => panic!("expected success, got {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn strong_fingerprint_is_arrival_order_invariant(accesses in arb_accesses()) {
        let (world, pip) = build_world();

        let forward = process(&world, &pip, to_observations(&world, &accesses));

        let mut reversed = accesses.clone();
        reversed.reverse();
        let backward = process(&world, &pip, to_observations(&world, &reversed));

        let mut rotated = accesses.clone();
        let rotated_len = rotated.len();
        rotated.rotate_left(rotated_len / 2);
        let turned = process(&world, &pip, to_observations(&world, &rotated));

        prop_assert_eq!(forward.strong_fingerprint, backward.strong_fingerprint);
        prop_assert_eq!(forward.strong_fingerprint, turned.strong_fingerprint);
    }

    #[test]
    fn replaying_the_path_set_agrees_with_direct_processing(accesses in arb_accesses()) {
        let (world, pip) = build_world();
        let executed = process(&world, &pip, to_observations(&world, &accesses));

        let processor = world.processor(
            Arc::new(StubOracle::default()),
            world.source_mount("/repo"),
        );
        let replayed = match processor.process_prior(&pip, &executed.path_set) {
            ObservedInputProcessingResult::Success(success) => success,
            other => panic!("expected success, got {other:?}"),
        };

        prop_assert_eq!(replayed.strong_fingerprint, executed.strong_fingerprint);
        prop_assert_eq!(replayed.path_set_hash, executed.path_set_hash);
    }

    #[test]
    fn processing_twice_is_byte_identical(accesses in arb_accesses()) {
        let (world, pip) = build_world();
        let first = process(&world, &pip, to_observations(&world, &accesses));
        let second = process(&world, &pip, to_observations(&world, &accesses));

        prop_assert_eq!(first.strong_fingerprint, second.strong_fingerprint);
        prop_assert_eq!(first.path_set, second.path_set);
        prop_assert_eq!(first.observed_inputs, second.observed_inputs);
    }
}
