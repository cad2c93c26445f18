//! The download state of a single piece: which blocks have been requested,
//! which have arrived, and whether the assembled piece matches its expected
//! hash.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use crate::{block_count, block_len, error::*, BlockInfo, PieceIndex, Sha1Hash};

/// The status of a block within its piece.
#[derive(Clone, Copy, Debug, PartialEq)]
enum BlockStatus {
    /// Not yet requested from the peer.
    Free,
    /// A request for this block is outstanding.
    Requested,
    /// The block's payload has arrived.
    Received,
}

/// Tracks the in-progress download of a single piece.
///
/// A session has at most one of these at a time. Blocks are requested in
/// order, arrive in whatever order the peer serves them, and are buffered by
/// their offset; once every block is present the piece can be verified
/// against its expected SHA-1 digest and turned into a contiguous payload.
pub(crate) struct PieceDownload {
    /// The piece's index in the torrent.
    index: PieceIndex,
    /// The expected SHA-1 digest of the assembled piece.
    expected_hash: Sha1Hash,
    /// The piece's actual length in bytes.
    len: u32,
    /// Per-block request state.
    blocks: Vec<BlockStatus>,
    /// The payloads that have arrived so far, keyed by their byte offset in
    /// the piece. The key order is the serialization order.
    data: BTreeMap<u32, Vec<u8>>,
    /// The number of payload bytes in `data`.
    downloaded: u32,
}

impl PieceDownload {
    /// Starts the download of a piece of the given length.
    pub fn new(index: PieceIndex, expected_hash: Sha1Hash, len: u32) -> Self {
        Self {
            index,
            expected_hash,
            len,
            blocks: vec![BlockStatus::Free; block_count(len)],
            data: BTreeMap::new(),
            downloaded: 0,
        }
    }

    /// The index of the piece being downloaded.
    pub fn piece_index(&self) -> PieceIndex {
        self.index
    }

    /// Picks at most `count` blocks that have not been requested yet and
    /// marks them as requested.
    pub fn pick_blocks(&mut self, count: usize, blocks: &mut Vec<BlockInfo>) {
        let mut picked = 0;
        for (i, status) in self.blocks.iter_mut().enumerate() {
            if picked == count {
                break;
            }
            if *status == BlockStatus::Free {
                *status = BlockStatus::Requested;
                blocks.push(BlockInfo {
                    piece_index: self.index,
                    offset: i as u32 * crate::BLOCK_LEN,
                    len: block_len(self.len, i),
                });
                picked += 1;
            }
        }
    }

    /// Buffers a block that arrived from the peer.
    ///
    /// The offset must be block aligned and the payload must fill its block
    /// slot exactly (only the piece's last block may be shorter than the
    /// canonical block length); anything else is a [`Error::BadOffset`].
    /// A block that was already received is a [`Error::DuplicateBlock`] and
    /// leaves the existing payload untouched.
    pub fn received_block(&mut self, offset: u32, data: Vec<u8>) -> Result<()> {
        let piece_index = self.index;
        if offset % crate::BLOCK_LEN != 0 || offset >= self.len {
            return Err(Error::BadOffset {
                piece_index,
                offset,
            });
        }

        let block_index = (offset / crate::BLOCK_LEN) as usize;
        if data.len() as u32 != block_len(self.len, block_index) {
            return Err(Error::BadOffset {
                piece_index,
                offset,
            });
        }

        if self.blocks[block_index] == BlockStatus::Received {
            return Err(Error::DuplicateBlock {
                piece_index,
                offset,
            });
        }

        self.blocks[block_index] = BlockStatus::Received;
        self.downloaded += data.len() as u32;
        self.data.insert(offset, data);

        Ok(())
    }

    /// Returns the number of blocks that have not arrived yet.
    pub fn count_missing_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| **b != BlockStatus::Received)
            .count()
    }

    /// Returns true if every byte of the piece has arrived.
    pub fn is_complete(&self) -> bool {
        self.downloaded == self.len
    }

    /// Hashes the assembled piece and compares it against the expected
    /// digest. A mismatch is a normal return value, not an error: the piece
    /// can be re-downloaded from another peer.
    pub fn verify(&self) -> bool {
        debug_assert!(self.is_complete());
        let mut hasher = Sha1::new();
        for block in self.data.values() {
            hasher.update(block);
        }
        hasher.finalize().as_slice() == self.expected_hash
    }

    /// Consumes the download and returns the piece's payload as one
    /// contiguous buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len as usize);
        for block in self.data.values() {
            buf.extend_from_slice(block);
        }
        buf
    }
}
