//! Pips: the units of work in the build graph.

use std::collections::BTreeMap;

use bon::Builder;
use clients::hash::ContentHash;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    artifact::{DirectoryArtifact, FileArtifact},
    fingerprint::{FingerprintWriter, WeakFingerprint, tag},
    path::{PathId, PathTable},
};

/// A pip's identity within the build graph.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("Pip{_0:08X}")]
pub struct PipId(pub u32);

/// What kind of work a pip performs.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize, strum::EnumIter,
)]
pub enum PipKind {
    /// Run an external process in a sandbox.
    Process,

    /// Copy a file.
    CopyFile,

    /// Write declared bytes to a file.
    WriteFile,

    /// Seal a directory's contents.
    SealDirectory,

    /// Exchange messages with a service process.
    Ipc,
}

/// The static description of a pip, sufficient to compute its weak
/// fingerprint and to access-check its observations.
#[derive(Clone, Debug, Builder)]
pub struct PipDescriptor {
    pub id: PipId,

    #[builder(default = PipKind::Process)]
    pub kind: PipKind,

    /// A hash of the pip's provenance that stays stable across builds;
    /// used in user-facing diagnostics.
    #[builder(default)]
    pub semi_stable_hash: u64,

    #[builder(into)]
    pub description: String,

    #[builder(into)]
    pub executable: String,

    #[builder(default)]
    pub arguments: Vec<String>,

    #[builder(default)]
    pub environment: BTreeMap<String, String>,

    pub working_directory: Option<PathId>,

    /// Declared file dependencies with their known content.
    #[builder(default)]
    pub declared_inputs: Vec<(FileArtifact, ContentHash)>,

    #[builder(default)]
    pub declared_outputs: Vec<FileArtifact>,

    #[builder(default)]
    pub directory_dependencies: Vec<DirectoryArtifact>,

    /// Whether reads outside the declared set are tolerated (and recorded)
    /// instead of failing the pip.
    #[builder(default)]
    pub allow_undeclared_source_reads: bool,
}

impl PipDescriptor {
    /// Compute the weak fingerprint: a hash of the static description only.
    ///
    /// Collections are hashed in a canonical order so that graph
    /// construction order cannot leak into the identity.
    pub fn weak_fingerprint(&self, paths: &PathTable, salt: &str) -> WeakFingerprint {
        let mut writer = FingerprintWriter::new();
        writer
            .write_str(tag::SALT, salt)
            .write_str(tag::EXECUTABLE, &self.executable);

        writer.write_count(self.arguments.len());
        for argument in &self.arguments {
            writer.write_str(tag::ARGUMENT, argument);
        }

        writer.write_count(self.environment.len());
        for (name, value) in &self.environment {
            writer.write_str(tag::ENVIRONMENT, format!("{name}={value}"));
        }

        let mut inputs = self
            .declared_inputs
            .iter()
            .map(|(artifact, hash)| {
                (
                    paths.expand(artifact.path),
                    artifact.rewrite_count,
                    *hash,
                )
            })
            .collect::<Vec<_>>();
        inputs.sort_by(|(a, ar, _), (b, br, _)| {
            paths.cmp_strs(a, b).then(ar.cmp(br))
        });
        writer.write_count(inputs.len());
        for (path, rewrite_count, hash) in inputs {
            writer
                .write_str(tag::DECLARED_INPUT, &*path)
                .write_u32(tag::DECLARED_INPUT, rewrite_count)
                .write_hash(tag::CONTENT_HASH, &hash);
        }

        let mut outputs = self
            .declared_outputs
            .iter()
            .map(|artifact| (paths.expand(artifact.path), artifact.rewrite_count))
            .collect::<Vec<_>>();
        outputs.sort_by(|(a, ar), (b, br)| paths.cmp_strs(a, b).then(ar.cmp(br)));
        writer.write_count(outputs.len());
        for (path, rewrite_count) in outputs {
            writer
                .write_str(tag::DECLARED_OUTPUT, &*path)
                .write_u32(tag::DECLARED_OUTPUT, rewrite_count);
        }

        let mut directories = self
            .directory_dependencies
            .iter()
            .map(|dir| (paths.expand(dir.path), dir.partial_seal_id, dir.shared_opaque))
            .collect::<Vec<_>>();
        directories.sort_by(|(a, asid, _), (b, bsid, _)| {
            paths.cmp_strs(a, b).then(asid.cmp(bsid))
        });
        writer.write_count(directories.len());
        for (path, seal_id, shared) in directories {
            writer
                .write_str(tag::DIRECTORY_DEPENDENCY, &*path)
                .write_u32(tag::DIRECTORY_DEPENDENCY, seal_id)
                .write_u8(tag::DIRECTORY_DEPENDENCY, u8::from(shared));
        }

        WeakFingerprint(writer.finish())
    }
}
