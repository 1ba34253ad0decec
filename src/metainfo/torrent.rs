use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use super::error::MetainfoError;
use crate::bencode::{decode, decode_top_spans};

/// Largest metainfo file the client accepts.
pub const MAX_METAINFO_SIZE: u64 = 8192;

/// The unit of transfer within a piece.
pub const BLOCK_SIZE: u32 = 16384;

/// Suffix of the sidecar file a leecher downloads into.
const TMP_SUFFIX: &str = ".tmp";

/// A parsed single-file torrent.
///
/// All fields are immutable after parsing. The geometry invariants hold by
/// construction: every piece except the last has length [`piece_length`],
/// and the last has [`last_piece_length`] (equal to `piece_length` when the
/// file size divides evenly).
///
/// [`piece_length`]: Metainfo::piece_length
/// [`last_piece_length`]: Metainfo::last_piece_length
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Tracker announce URL.
    pub announce: String,
    /// SHA-1 of the `info` dictionary's exact source bytes.
    pub info_hash: [u8; 20],
    /// Target file name.
    pub name: String,
    /// Bytes per piece (except possibly the last).
    pub piece_length: u32,
    /// Bytes in the final piece.
    pub last_piece_length: u32,
    /// SHA-1 hash of each piece.
    pub piece_hashes: Vec<[u8; 20]>,
    /// Total file size in bytes.
    pub file_size: u64,
    /// Path the metainfo was loaded from.
    pub source: PathBuf,
}

impl Metainfo {
    /// Loads and parses a metainfo file from disk.
    ///
    /// # Errors
    ///
    /// Returns [`MetainfoError::TooLarge`] for files over 8 KiB and a parse
    /// error for anything that is not a well-formed single-file torrent.
    pub fn open(path: &Path) -> Result<Self, MetainfoError> {
        let size = std::fs::metadata(path)?.len();
        if size > MAX_METAINFO_SIZE {
            return Err(MetainfoError::TooLarge);
        }

        let data = std::fs::read(path)?;
        Self::from_bytes(&data, path.to_path_buf())
    }

    /// Parses metainfo from raw bytes.
    pub fn from_bytes(data: &[u8], source: PathBuf) -> Result<Self, MetainfoError> {
        let value = decode(data)?;
        let dict = value.as_dict().ok_or(MetainfoError::Invalid("root"))?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::Missing("announce"))?
            .to_string();

        let info = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::Missing("info"))?;
        let info_dict = info.as_dict().ok_or(MetainfoError::Invalid("info"))?;

        // Hash the exact byte range the info value occupies in the source.
        let spans = decode_top_spans(data)?;
        let info_span = spans
            .get(b"info".as_slice())
            .cloned()
            .ok_or(MetainfoError::Missing("info"))?;
        let info_hash: [u8; 20] = Sha1::digest(&data[info_span]).into();

        let name = info_dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::Missing("name"))?
            .to_string();

        let piece_length = info_dict
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_integer())
            .filter(|&n| n > 0)
            .ok_or(MetainfoError::Invalid("piece length"))? as u32;

        let file_size = info_dict
            .get(b"length".as_slice())
            .and_then(|v| v.as_integer())
            .filter(|&n| n > 0)
            .ok_or(MetainfoError::Invalid("length"))? as u64;

        let pieces = info_dict
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::Missing("pieces"))?;

        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(MetainfoError::Invalid("pieces"));
        }

        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected = file_size.div_ceil(piece_length as u64) as usize;
        if piece_hashes.len() != expected {
            return Err(MetainfoError::Invalid("pieces"));
        }

        let last_piece_length = match (file_size % piece_length as u64) as u32 {
            0 => piece_length,
            rem => rem,
        };

        Ok(Self {
            announce,
            info_hash,
            name,
            piece_length,
            last_piece_length,
            piece_hashes,
            file_size,
            source,
        })
    }

    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of piece `index`.
    pub fn piece_len(&self, index: u32) -> u32 {
        if index == self.piece_count() - 1 {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    /// Length of the block at `offset` within piece `index`.
    pub fn block_len(&self, index: u32, offset: u32) -> u32 {
        BLOCK_SIZE.min(self.piece_len(index) - offset)
    }

    /// Byte offset of piece `index` within the file.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Path of the completed target file.
    pub fn target_path(&self) -> PathBuf {
        PathBuf::from(&self.name)
    }

    /// Path of the temporary sidecar a leecher writes into.
    pub fn tmp_path(&self) -> PathBuf {
        PathBuf::from(format!("{}{}", self.name, TMP_SUFFIX))
    }
}
