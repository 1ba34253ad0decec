//! Torrent metainfo handling.
//!
//! Parses single-file `.torrent` files and exposes the immutable torrent
//! geometry: announce URL, piece length, per-piece SHA-1 hashes, and file
//! size. The info hash is computed over the exact byte range the `info`
//! dictionary occupies in the source file, never over a re-serialization.

mod error;
mod torrent;

pub use error::MetainfoError;
pub use torrent::{Metainfo, BLOCK_SIZE, MAX_METAINFO_SIZE};
