use crate::{error::*, metainfo::Metainfo, PieceIndex, Sha1Hash};

/// Information about a torrent's piece geometry: the piece count and
/// lengths, the download length, and the expected hash of each piece.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The length of the downloaded file, in bytes.
    pub download_len: u64,
    /// The expected SHA-1 digest of each piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo) -> Self {
        let piece_count = metainfo.piece_count();
        let download_len = metainfo.info.length;
        let piece_len = metainfo.info.piece_length;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            piece_hashes: metainfo.piece_hashes(),
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the expected hash of the piece at the given index.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        self.piece_hashes
            .get(index)
            .copied()
            .ok_or(Error::InvalidPieceIndex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info() -> StorageInfo {
        // 3 full length pieces and 1 smaller piece
        StorageInfo {
            piece_count: 4,
            piece_len: 4,
            last_piece_len: 2,
            download_len: 3 * 4 + 2,
            piece_hashes: vec![[0; 20], [1; 20], [2; 20], [3; 20]],
        }
    }

    #[test]
    fn test_piece_len() {
        let info = test_info();
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 4);
        assert_eq!(info.piece_len(3).unwrap(), 2);
        assert!(info.piece_len(4).is_err());
    }

    #[test]
    fn test_piece_hash() {
        let info = test_info();
        assert_eq!(info.piece_hash(1).unwrap(), [1; 20]);
        assert!(info.piece_hash(4).is_err());
    }
}
