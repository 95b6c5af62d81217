//! Parsing of the bencoded `.torrent` metainfo format (BEP 3) into the
//! normalized, in-memory `TorrentDescriptor` this engine's core consumes.
//!
//! Tracker announce and magnet URI resolution are external collaborators
//! (see the top-level spec); this module only turns the metainfo dictionary
//! into the `Metainfo`/`StorageInfo` types the rest of the engine is built
//! around.

use std::path::PathBuf;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::FsStructure,
    FileInfo, Sha1Hash,
};

/// The length, in bytes, of a single SHA-1 piece hash.
const HASH_LEN: usize = 20;

/// The fully parsed and normalized metainfo of a torrent: its info hash, name,
/// piece length, concatenated piece hashes, and file system structure.
///
/// This is what the spec calls a `TorrentDescriptor`. It is immutable once
/// constructed.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// SHA-1 of the bencoded `info` dictionary; uniquely identifies the
    /// torrent.
    pub info_hash: Sha1Hash,
    /// The name of the torrent. Used as the download root directory name for
    /// multi-file torrents.
    pub name: String,
    /// The nominal length of a piece, in bytes. The final piece may be
    /// shorter; see [`crate::storage_info::StorageInfo`].
    pub piece_len: u32,
    /// The concatenation of all piece SHA-1 hashes, 20 bytes each.
    pub piece_hashes: Vec<u8>,
    /// The file(s) that make up the torrent's contents.
    pub structure: FsStructure,
}

impl Metainfo {
    /// Parses a bencoded metainfo byte buffer into a [`Metainfo`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawMetainfo) -> Result<Self> {
        let info_bytes = serde_bencode::to_bytes(&raw.info)?;
        let digest = Sha1::digest(&info_bytes);
        let mut info_hash = [0; HASH_LEN];
        info_hash.copy_from_slice(&digest);

        let piece_hashes = raw.info.pieces.into_vec();
        if piece_hashes.len() % HASH_LEN != 0 {
            return Err(Error::InvalidMetainfo(format!(
                "piece hash table length {} is not a multiple of {}",
                piece_hashes.len(),
                HASH_LEN
            )));
        }

        let structure = match (raw.info.length, raw.info.files) {
            (Some(len), None) => FsStructure::File(FileInfo {
                path: PathBuf::from(&raw.info.name),
                len,
                torrent_offset: 0,
            }),
            (None, Some(files)) => {
                let mut offset = 0u64;
                let mut infos = Vec::with_capacity(files.len());
                for file in files {
                    let path: PathBuf = file.path.iter().collect();
                    infos.push(FileInfo {
                        path,
                        len: file.length,
                        torrent_offset: offset,
                    });
                    offset += file.length;
                }
                FsStructure::Archive { files: infos }
            }
            // a metainfo dictionary must describe exactly one of a single
            // file or a list of files, never both or neither
            (Some(_), Some(_)) => {
                return Err(Error::InvalidMetainfo(
                    "info dictionary has both `length` and `files`".to_owned(),
                ))
            }
            (None, None) => {
                return Err(Error::InvalidMetainfo(
                    "info dictionary has neither `length` nor `files`".to_owned(),
                ))
            }
        };

        Ok(Self {
            info_hash,
            name: raw.info.name,
            piece_len: raw.info.piece_length as u32,
            piece_hashes,
            structure,
        })
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / HASH_LEN
    }

    /// Returns the expected SHA-1 hash of the piece at `index`, if valid.
    pub fn piece_hash(&self, index: usize) -> Option<Sha1Hash> {
        let start = index.checked_mul(HASH_LEN)?;
        let end = start.checked_add(HASH_LEN)?;
        let slice = self.piece_hashes.get(start..end)?;
        let mut hash = [0; HASH_LEN];
        hash.copy_from_slice(slice);
        Some(hash)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file(
        name: &str,
        piece_len: u64,
        length: u64,
        pieces: &[u8],
    ) -> Vec<u8> {
        let raw = RawMetainfo {
            info: RawInfo {
                name: name.to_owned(),
                pieces: ByteBuf::from(pieces.to_vec()),
                piece_length: piece_len,
                length: Some(length),
                files: None,
                private: None,
            },
        };
        serde_bencode::to_bytes(&raw).unwrap()
    }

    #[test]
    fn parses_single_file_torrent() {
        let pieces = vec![0u8; HASH_LEN * 2];
        let bytes = bencode_single_file("movie.mp4", 16, 30, &pieces);
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.name, "movie.mp4");
        assert_eq!(metainfo.piece_len, 16);
        assert_eq!(metainfo.piece_count(), 2);
        assert!(!metainfo.structure.is_archive());
    }

    #[test]
    fn rejects_truncated_piece_hash_table() {
        let bytes = bencode_single_file("f", 16, 10, &[0u8; 7]);
        assert!(Metainfo::from_bytes(&bytes).is_err());
    }
}
