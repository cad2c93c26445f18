// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod conf;
mod download;
pub mod error;
pub mod metainfo;
mod peer;
mod piece_picker;
mod storage_info;
pub mod torrent;
pub mod tracker;

use bitvec::prelude::{BitVec, Msb0};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least significants
/// bits, that is, where the first highest bit represents the first piece, the
/// second highest element the second piece, and so on (e.g. `0b1100_0001` would
/// mean that we have pieces 0, 1, and 7). A truthy boolean value of a piece's
/// position in this vector means that the peer has the piece, while a falsy
/// value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// This is the only block length we're dealing with (except for possibly the
/// last block).  It is the widely used and accepted 16 KiB.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), except for
    /// the last block in the last piece, which may be shorter.
    pub len: u32,
}

/// Returns the length of the block starting at `index * BLOCK_LEN` within
/// a piece of the given length.
///
/// Every block spans the canonical 16 KiB except the piece's last one,
/// which covers whatever remains.
///
/// # Panics
///
/// Panics if the block would begin at or past the end of the piece.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * BLOCK_LEN;
    assert!(block_offset < piece_len);
    (piece_len - block_offset).min(BLOCK_LEN)
}

/// Returns the number of blocks a piece of the given length is split into,
/// rounding up for a short trailing block.
pub(crate) fn block_count(piece_len: u32) -> usize {
    ((piece_len as u64 + BLOCK_LEN as u64 - 1) / BLOCK_LEN as u64) as usize
}
