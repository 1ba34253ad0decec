use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The temporary download file could not be created at full size.
    #[error("I/O error: cannot allocate temporary file on disk")]
    Allocate(#[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A block landed outside the file, or outside its piece.
    #[error("block out of bounds: piece {index} offset {begin} len {len}")]
    OutOfBounds { index: u32, begin: u32, len: u32 },

    /// A write was attempted against a read-only (seeder) mapping.
    #[error("backing file is read-only")]
    ReadOnly,
}
