//! Fingerprints and their canonical byte serialization.
//!
//! Everything that feeds a fingerprint goes through [`FingerprintWriter`],
//! which frames every field with a tag byte and, for variable-width data, a
//! little-endian length. Two logically equal inputs therefore always
//! produce identical bytes, and no concatenation of adjacent fields can
//! masquerade as another field list.

use clients::hash::{ContentHash, Selector};
use derive_more::Display;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Field tags used by the canonical serialization.
///
/// Tags are part of the cache identity; they must never be renumbered.
pub(crate) mod tag {
    pub const NAMESPACE: u8 = 0x01;
    pub const WEAK: u8 = 0x02;
    pub const PATH_SET: u8 = 0x03;
    pub const OBSERVED_INPUT: u8 = 0x04;
    pub const EXECUTABLE: u8 = 0x05;
    pub const ARGUMENT: u8 = 0x06;
    pub const ENVIRONMENT: u8 = 0x07;
    pub const DECLARED_INPUT: u8 = 0x08;
    pub const DECLARED_OUTPUT: u8 = 0x09;
    pub const SALT: u8 = 0x0A;
    pub const PATH: u8 = 0x0B;
    pub const FILE_NAME: u8 = 0x0C;
    pub const UNSAFE_OPTIONS: u8 = 0x0D;
    pub const CONTENT_HASH: u8 = 0x0E;
    pub const COUNT: u8 = 0x0F;
    pub const SELECTOR_OUTPUT: u8 = 0x10;
    pub const DIRECTORY_DEPENDENCY: u8 = 0x11;
}

/// A 32-byte fingerprint.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("{}", hex::encode(_0))]
pub struct Fingerprint(pub(crate) [u8; 32]);

impl Fingerprint {
    /// View the fingerprint bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from 64 hex digits.
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        use color_eyre::eyre::{Context, bail};
        let decoded = hex::decode(hex.as_ref()).context("decode hex")?;
        if decoded.len() != 32 {
            bail!("invalid fingerprint length: {}", decoded.len());
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Canonical, collision-framed fingerprint construction.
#[derive(Debug)]
pub struct FingerprintWriter {
    hasher: blake3::Hasher,
}

impl Default for FingerprintWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintWriter {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
        }
    }

    /// Write a variable-width field: tag, length, bytes.
    pub fn write_bytes(&mut self, tag: u8, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.hasher.update(&[tag]);
        self.hasher.update(&(bytes.len() as u32).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    /// Write a UTF-8 string field.
    pub fn write_str(&mut self, tag: u8, s: impl AsRef<str>) -> &mut Self {
        self.write_bytes(tag, s.as_ref().as_bytes())
    }

    /// Write a fixed-width integer field.
    pub fn write_u32(&mut self, tag: u8, value: u32) -> &mut Self {
        self.hasher.update(&[tag]);
        self.hasher.update(&value.to_le_bytes());
        self
    }

    /// Write a single byte field.
    pub fn write_u8(&mut self, tag: u8, value: u8) -> &mut Self {
        self.hasher.update(&[tag, value]);
        self
    }

    /// Write a content hash field (bytes plus algorithm tag).
    pub fn write_hash(&mut self, tag: u8, hash: &ContentHash) -> &mut Self {
        self.hasher.update(&[tag]);
        self.hasher.update(hash.as_bytes());
        self.hasher.update(&[hash.algorithm().tag()]);
        self
    }

    /// Write a collection length, framing the fields that follow.
    pub fn write_count(&mut self, count: usize) -> &mut Self {
        self.write_u32(tag::COUNT, count as u32)
    }

    /// Finish and produce the fingerprint.
    pub fn finish(&self) -> Fingerprint {
        Fingerprint(self.hasher.finalize().into())
    }
}

/// A fingerprint over the static description of a pip.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct WeakFingerprint(pub Fingerprint);

/// A fingerprint over a weak fingerprint plus the observed dynamic inputs
/// of an execution. Two strong fingerprints collide iff the serialized
/// inputs are byte-identical.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
#[display("{_0}")]
pub struct StrongFingerprint(pub Fingerprint);

/// Re-derive the strong fingerprint key from a weak fingerprint and a
/// published selector.
pub fn strong_fingerprint_key(weak: &WeakFingerprint, selector: &Selector) -> StrongFingerprint {
    let mut writer = FingerprintWriter::new();
    writer
        .write_bytes(tag::WEAK, weak.0.as_bytes())
        .write_hash(tag::PATH_SET, &selector.content_hash)
        .write_bytes(tag::SELECTOR_OUTPUT, &selector.output);
    StrongFingerprint(writer.finish())
}
