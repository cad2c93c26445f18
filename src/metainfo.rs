//! Decoding of `.torrent` metainfo files.
//!
//! Only single-file torrents are supported: the torrent carries a single
//! `length` entry rather than a `files` list.

use sha1::{Digest, Sha1};

use crate::{error::*, Sha1Hash};

/// The parsed contents of a `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    /// The URL of the tracker that tracks this torrent's swarm.
    pub announce: String,
    pub info: Info,
}

/// The `info` dictionary of the metainfo file.
///
/// The fields are declared in lexicographic key order so that re-serializing
/// the struct produces the canonical bencoding, whose SHA-1 digest is the
/// torrent's info hash.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    /// The length of the downloaded file, in bytes.
    pub length: u64,
    /// The suggested name of the downloaded file.
    pub name: String,
    /// The nominal length of a piece. The last piece may be shorter.
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    /// The concatenated 20 byte SHA-1 digests of all pieces.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
}

impl Metainfo {
    /// Parses a metainfo file's raw bytes and validates its invariants.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Metainfo = serde_bencode::from_bytes(buf)?;

        if metainfo.announce.is_empty() {
            return Err(Error::InvalidMetainfo("no announce url"));
        }
        if metainfo.info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("piece length is zero"));
        }
        if metainfo.info.length == 0 {
            return Err(Error::InvalidMetainfo("download length is zero"));
        }
        if metainfo.info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(
                "pieces length is not a multiple of 20",
            ));
        }

        // the number of hashes must cover the download length exactly
        let piece_count = metainfo.piece_count() as u64;
        let piece_len = metainfo.info.piece_length as u64;
        let expected_count =
            (metainfo.info.length + piece_len - 1) / piece_len;
        if piece_count != expected_count {
            return Err(Error::InvalidMetainfo(
                "piece hash count doesn't match download length",
            ));
        }

        Ok(metainfo)
    }

    /// Computes the torrent's info hash: the SHA-1 digest of the canonically
    /// bencoded `info` dictionary.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Splits the `pieces` byte string into one 20 byte hash per piece.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        let mut hashes = Vec::with_capacity(self.piece_count());
        for chunk in self.info.pieces.chunks_exact(20) {
            let mut hash = [0; 20];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }
        hashes
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A well-formed single-file torrent: 51200 bytes in two pieces of
    // nominal length 32768, so the last piece is 18432 bytes.
    fn test_torrent_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce23:http://tracker.test/ann4:info");
        buf.extend_from_slice(&test_info_bytes());
        buf.extend_from_slice(b"e");
        buf
    }

    fn test_info_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d6:lengthi51200e4:name8:test.bin12:piece lengthi32768e6:pieces40:",
        );
        buf.extend_from_slice(&[b'a'; 20]);
        buf.extend_from_slice(&[b'b'; 20]);
        buf.extend_from_slice(b"e");
        buf
    }

    #[test]
    fn test_parse_metainfo() {
        let metainfo = Metainfo::from_bytes(&test_torrent_bytes()).unwrap();
        assert_eq!(metainfo.announce, "http://tracker.test/ann");
        assert_eq!(metainfo.info.name, "test.bin");
        assert_eq!(metainfo.info.length, 51200);
        assert_eq!(metainfo.info.piece_length, 32768);
        assert_eq!(metainfo.piece_count(), 2);

        let hashes = metainfo.piece_hashes();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], [b'a'; 20]);
        assert_eq!(hashes[1], [b'b'; 20]);
    }

    #[test]
    fn test_info_hash_is_digest_of_canonical_encoding() {
        let metainfo = Metainfo::from_bytes(&test_torrent_bytes()).unwrap();
        let mut expected = [0; 20];
        expected.copy_from_slice(&Sha1::digest(&test_info_bytes()));
        assert_eq!(metainfo.create_info_hash().unwrap(), expected);
    }

    #[test]
    fn test_reject_truncated_pieces() {
        // 39 piece bytes instead of 40
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce23:http://tracker.test/ann4:info");
        buf.extend_from_slice(
            b"d6:lengthi51200e4:name8:test.bin12:piece lengthi32768e6:pieces39:",
        );
        buf.extend_from_slice(&[b'a'; 39]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn test_reject_wrong_hash_count() {
        // one hash for a download that needs two pieces
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce23:http://tracker.test/ann4:info");
        buf.extend_from_slice(
            b"d6:lengthi51200e4:name8:test.bin12:piece lengthi32768e6:pieces20:",
        );
        buf.extend_from_slice(&[b'a'; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }
}
