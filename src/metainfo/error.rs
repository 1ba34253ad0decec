use crate::bencode::BencodeError;
use thiserror::Error;

/// Errors raised while loading a metainfo file. All of these are fatal to
/// the client: without valid geometry there is nothing to transfer.
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The metainfo file exceeds the accepted size.
    #[error("big metainfo: the metainfo file should not exceed 8KB")]
    TooLarge,

    #[error("parse error: {0}")]
    Bencode(#[from] BencodeError),

    #[error("parse error: missing field `{0}`")]
    Missing(&'static str),

    #[error("parse error: invalid field `{0}`")]
    Invalid(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
