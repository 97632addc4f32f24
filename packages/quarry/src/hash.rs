//! The blocked rolling content hasher.
//!
//! Content identity is computed over fixed-size blocks: each block is cut
//! into pages, each page is SHA-256 hashed, the concatenated page digests
//! are SHA-256 hashed into the block hash, and a rolling state folds the
//! block hashes together in order. The final fold is marked, which is what
//! makes the identity length-deterministic: the same prefix followed by
//! different tails can never collide on the marker byte.

use std::sync::{Arc, Mutex};

use clients::hash::{ContentHash, HashAlgorithm};
use color_eyre::{Result, eyre::Context};
use derive_more::{Display, Error};
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::Semaphore,
    task::spawn_blocking,
};
use tracing::{instrument, trace};

/// Size of one page within a block.
pub const PAGE_SIZE: usize = 64 * 1024;

/// Number of pages per block.
pub const PAGES_PER_BLOCK: usize = 32;

/// Size of one block.
pub const BLOCK_SIZE: usize = PAGE_SIZE * PAGES_PER_BLOCK;

/// The fixed rolling seed: SHA-256 of the ASCII string
/// `blob-identifier-seed`.
const ROLLING_SEED: [u8; 32] = [
    0xa0, 0x72, 0xbc, 0xad, 0x22, 0xb8, 0x43, 0x81, 0x7e, 0x97, 0xc6, 0x05, 0xb2, 0x44, 0xc2,
    0x2c, 0x6c, 0x08, 0x36, 0x1b, 0x02, 0x24, 0x0c, 0xce, 0x4b, 0x24, 0x0e, 0x99, 0xdd, 0x6d,
    0xcc, 0x9e,
];

/// Failures local to a single hash computation.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
pub enum HashError {
    /// The stream ended before delivering the bytes it promised.
    #[display("stream ended early: expected {expected} bytes, read {actual}")]
    ShortRead { expected: u64, actual: u64 },

    /// The rolling state was already frozen by a final block.
    #[display("the rolling hash was already finalized")]
    AlreadyFinalized,
}

/// SHA-256 of a block's concatenated page digests.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display("{}", hex::encode(_0))]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    /// Hash one block of content (at most [`BLOCK_SIZE`] bytes).
    ///
    /// An empty block is one empty page.
    pub fn of(block: &[u8]) -> Self {
        debug_assert!(block.len() <= BLOCK_SIZE);

        let mut pages = Sha256::new();
        let mut chunks = block.chunks(PAGE_SIZE);
        let first = chunks.next().unwrap_or(&[]);
        pages.update(Sha256::digest(first));
        for page in chunks {
            pages.update(Sha256::digest(page));
        }
        Self(pages.finalize().into())
    }

    /// View the hash bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// The finalized identity of a blob plus its ordered block hashes.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display("{hash}")]
pub struct BlobIdentifier {
    /// The rolled-up identity.
    pub hash: ContentHash,

    /// The per-block hashes, in stream order.
    pub blocks: Vec<BlockHash>,
}

/// The strictly sequential rolling state.
///
/// Block hashes are folded in stream order; the final block is folded with
/// a distinct marker byte and freezes the state.
#[derive(Clone, Debug)]
pub struct RollingBlobHasher {
    state: [u8; 32],
    blocks: Vec<BlockHash>,
    finalized: bool,
}

impl Default for RollingBlobHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl RollingBlobHasher {
    /// Start a fresh rolling state.
    pub fn new() -> Self {
        Self {
            state: ROLLING_SEED,
            blocks: Vec::new(),
            finalized: false,
        }
    }

    fn roll(&mut self, block: BlockHash, is_final: bool) {
        let mut hasher = Sha256::new();
        hasher.update(self.state);
        hasher.update(block.as_bytes());
        hasher.update([u8::from(is_final)]);
        self.state = hasher.finalize().into();
        self.blocks.push(block);
    }

    /// Fold in a non-final block.
    pub fn add_block(&mut self, block: BlockHash) -> Result<(), HashError> {
        if self.finalized {
            return Err(HashError::AlreadyFinalized);
        }
        self.roll(block, false);
        Ok(())
    }

    /// Fold in the final block and freeze the state.
    pub fn finalize_block(&mut self, block: BlockHash) -> Result<BlobIdentifier, HashError> {
        if self.finalized {
            return Err(HashError::AlreadyFinalized);
        }
        self.roll(block, true);
        self.finalized = true;
        Ok(BlobIdentifier {
            hash: ContentHash::new(HashAlgorithm::Vso, self.state),
            blocks: self.blocks.clone(),
        })
    }
}

/// Hash an in-memory buffer.
///
/// An empty buffer is a single empty block.
#[instrument(skip_all, fields(bytes = data.len()))]
pub fn hash_bytes(data: &[u8]) -> BlobIdentifier {
    let mut roller = RollingBlobHasher::new();
    let mut blocks = data.chunks(BLOCK_SIZE).peekable();

    let identifier = loop {
        let block = blocks.next().unwrap_or(&[]);
        let hash = BlockHash::of(block);
        if blocks.peek().is_none() {
            // The roller is freshly created and never finalized before this
            // point, so the fold cannot fail.
            break roller.finalize_block(hash).unwrap_or_else(|_| unreachable!());
        }
        roller.add_block(hash).unwrap_or_else(|_| unreachable!());
    };

    trace!(%identifier, blocks = identifier.blocks.len(), "hashed buffer");
    identifier
}

/// Reusable block buffers, so steady-state hashing does not allocate per
/// block.
#[derive(Debug, Default)]
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn take(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(BLOCK_SIZE))
    }

    fn put(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.buffers
            .lock()
            .expect("buffer pool poisoned")
            .push(buffer);
    }
}

/// Read up to one block; `Ok(len)` with `len < BLOCK_SIZE` means EOF.
async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, buffer: &mut Vec<u8>) -> Result<usize> {
    buffer.resize(BLOCK_SIZE, 0);
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let read = reader
            .read(&mut buffer[filled..])
            .await
            .context("read block")?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buffer.truncate(filled);
    Ok(filled)
}

/// Hash a stream of unknown length.
#[instrument(skip_all)]
pub async fn hash_reader<R: AsyncRead + Unpin>(mut reader: R) -> Result<BlobIdentifier> {
    let mut roller = RollingBlobHasher::new();
    let mut buffer = Vec::with_capacity(BLOCK_SIZE);
    let mut pending: Option<BlockHash> = None;

    loop {
        let len = read_block(&mut reader, &mut buffer).await?;
        let at_eof = len < BLOCK_SIZE;

        if len > 0 || pending.is_none() {
            if let Some(block) = pending.take() {
                roller.add_block(block)?;
            }
            pending = Some(BlockHash::of(&buffer[..len]));
        }

        if at_eof {
            let last = pending.take().unwrap_or_else(|| BlockHash::of(&[]));
            return Ok(roller.finalize_block(last)?);
        }
    }
}

/// Hash a stream whose length is known up front.
///
/// A stream that ends before delivering `expected` bytes fails with
/// [`HashError::ShortRead`]; extra bytes past `expected` are an error too.
#[instrument(skip_all, fields(expected = expected))]
pub async fn hash_reader_sized<R: AsyncRead + Unpin>(
    reader: R,
    expected: u64,
) -> Result<BlobIdentifier> {
    let mut total: u64 = 0;
    let mut reader = reader;
    let mut roller = RollingBlobHasher::new();
    let mut buffer = Vec::with_capacity(BLOCK_SIZE);
    let mut pending: Option<BlockHash> = None;

    loop {
        let len = read_block(&mut reader, &mut buffer).await?;
        total += len as u64;
        let at_eof = len < BLOCK_SIZE;

        if len > 0 || pending.is_none() {
            if let Some(block) = pending.take() {
                roller.add_block(block)?;
            }
            pending = Some(BlockHash::of(&buffer[..len]));
        }

        if at_eof {
            if total != expected {
                return Err(HashError::ShortRead {
                    expected,
                    actual: total,
                }
                .into());
            }
            let last = pending.take().unwrap_or_else(|| BlockHash::of(&[]));
            return Ok(roller.finalize_block(last)?);
        }
    }
}

/// Hash a stream, computing block hashes on blocking workers.
///
/// At most `parallelism` blocks are hashed in flight at once; the rolling
/// fold itself stays strictly sequential in block order, so the result is
/// identical to [`hash_reader`] for every stream and every parallelism
/// factor.
#[instrument(skip_all, fields(parallelism = parallelism))]
pub async fn hash_reader_parallel<R: AsyncRead + Unpin>(
    mut reader: R,
    parallelism: usize,
) -> Result<BlobIdentifier> {
    let limiter = Arc::new(Semaphore::new(parallelism.max(1)));
    let pool = Arc::new(BufferPool::default());
    let mut handles = Vec::new();

    loop {
        let mut buffer = pool.take();
        let len = read_block(&mut reader, &mut buffer).await?;
        let at_eof = len < BLOCK_SIZE;

        if len > 0 || handles.is_empty() {
            let permit = Arc::clone(&limiter)
                .acquire_owned()
                .await
                .context("acquire hashing slot")?;
            let pool = Arc::clone(&pool);
            handles.push(spawn_blocking(move || {
                let hash = BlockHash::of(&buffer[..len]);
                pool.put(buffer);
                drop(permit);
                hash
            }));
        } else {
            pool.put(buffer);
        }

        if at_eof {
            break;
        }
    }

    let mut roller = RollingBlobHasher::new();
    let last = handles.len() - 1;
    for (index, handle) in handles.into_iter().enumerate() {
        let hash = handle.await.context("join block hasher")?;
        if index == last {
            return Ok(roller.finalize_block(hash)?);
        }
        roller.add_block(hash)?;
    }
    unreachable!("at least one block is always scheduled");
}
