//! Content identity types shared between the engine, the distribution
//! layer, and the content store.

use color_eyre::eyre::{Context, bail};
use derive_more::{Debug, Display};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The hashing algorithm a [`ContentHash`] was produced by.
///
/// The discriminants are the wire tag bytes; they must never be renumbered.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Debug,
    Display,
    strum::EnumIter,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum HashAlgorithm {
    /// The blocked rolling blob identity.
    Vso = 0x00,

    /// A leaf chunk of the store's dedup content tree.
    DedupChunk = 0x01,

    /// An interior node of the store's dedup content tree.
    DedupNode = 0x02,
}

impl HashAlgorithm {
    /// The wire tag byte for this algorithm.
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Resolve an algorithm from its wire tag byte.
    pub fn from_tag(tag: u8) -> color_eyre::Result<Self> {
        match tag {
            0x00 => Ok(Self::Vso),
            0x01 => Ok(Self::DedupChunk),
            0x02 => Ok(Self::DedupNode),
            other => bail!("unknown hash algorithm tag: {other:#04x}"),
        }
    }
}

/// A tagged 32-byte content identity.
///
/// Equality and ordering are byte-wise over the algorithm tag and the hash
/// bytes. The rendered form is 66 lowercase hex digits: the 32 hash bytes
/// followed by the algorithm tag byte.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("{}", self.to_hex())]
#[debug("{}", self.to_hex())]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    bytes: [u8; 32],
}

impl ContentHash {
    /// The reserved identity for a file known to be absent.
    ///
    /// No real content hashes to this value; it is carved out of the hash
    /// space by convention.
    pub const ABSENT_FILE: Self = Self {
        algorithm: HashAlgorithm::Vso,
        bytes: [0x00; 32],
    };

    /// The reserved identity for content deliberately excluded from
    /// tracking.
    pub const UNTRACKED: Self = Self {
        algorithm: HashAlgorithm::Vso,
        bytes: [0xFF; 32],
    };

    /// Create a hash from its algorithm and raw bytes.
    pub const fn new(algorithm: HashAlgorithm, bytes: [u8; 32]) -> Self {
        Self { algorithm, bytes }
    }

    /// The algorithm that produced this hash.
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// View the hash bytes (without the algorithm tag).
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Whether this is one of the reserved sentinel identities.
    pub fn is_special(&self) -> bool {
        *self == Self::ABSENT_FILE || *self == Self::UNTRACKED
    }

    /// Render the hash as 66 lowercase hex digits: bytes then tag.
    pub fn to_hex(&self) -> String {
        let mut wire = [0u8; 33];
        wire[..32].copy_from_slice(&self.bytes);
        wire[32] = self.algorithm.tag();
        hex::encode(wire)
    }

    /// Parse a hash from its 66-digit hex rendering.
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let decoded = hex::decode(hex.as_ref()).context("decode hex")?;
        let len = decoded.len();
        if len != 33 {
            bail!("invalid content hash length: expected 33 bytes, got {len}");
        }

        let algorithm = HashAlgorithm::from_tag(decoded[32])?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded[..32]);
        Ok(Self { algorithm, bytes })
    }

}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// A cache selector: a content hash plus a small opaque output blob.
///
/// Combined with a weak fingerprint, a selector yields the strong
/// fingerprint key under which a prior execution's metadata is stored.
/// Equality is content-hash equality AND byte-wise output equality.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Selector {
    /// The hash of the path set this selector covers.
    pub content_hash: ContentHash,

    /// Opaque bytes the store attached when the entry was published.
    pub output: Vec<u8>,
}

impl Selector {
    /// The maximum length of the output blob.
    pub const MAX_OUTPUT_LENGTH: usize = 1024;

    /// Create a selector, validating the output length cap.
    pub fn new(content_hash: ContentHash, output: Vec<u8>) -> color_eyre::Result<Self> {
        let len = output.len();
        if len > Self::MAX_OUTPUT_LENGTH {
            bail!(
                "selector output is {len} bytes; the cap is {} bytes",
                Self::MAX_OUTPUT_LENGTH
            );
        }
        Ok(Self {
            content_hash,
            output,
        })
    }
}

/// A reference into the store's dedup content tree.
///
/// Chunks are leaves holding bytes; nodes reference children which are
/// themselves chunks or nodes.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum DedupRef {
    /// A leaf chunk.
    #[display("chunk:{_0}")]
    Chunk(ContentHash),

    /// An interior node.
    #[display("node:{_0}")]
    Node(ContentHash),
}

impl DedupRef {
    /// Classify a hash as dedup content from its algorithm tag.
    pub fn classify(hash: ContentHash) -> color_eyre::Result<Self> {
        match hash.algorithm() {
            HashAlgorithm::DedupChunk => Ok(Self::Chunk(hash)),
            HashAlgorithm::DedupNode => Ok(Self::Node(hash)),
            HashAlgorithm::Vso => bail!("hash {hash} is not dedup content"),
        }
    }

    /// The underlying hash.
    pub const fn hash(&self) -> ContentHash {
        match self {
            Self::Chunk(hash) | Self::Node(hash) => *hash,
        }
    }
}
