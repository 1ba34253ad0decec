use std::fs::OpenOptions;
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};
use parking_lot::RwLock;
use sha1::{Digest, Sha1};

use super::error::StorageError;
use crate::metainfo::Metainfo;

enum Backing {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

/// The torrent's backing file, mapped into memory.
///
/// Block addressing is always `piece_offset(index) + begin`; callers are
/// expected to stay within a single piece per call.
pub struct Store {
    meta: Arc<Metainfo>,
    map: RwLock<Backing>,
}

impl Store {
    /// Maps an already-complete target file read-only.
    pub fn seed(meta: Arc<Metainfo>) -> Result<Self, StorageError> {
        let file = OpenOptions::new().read(true).open(meta.target_path())?;
        if file.metadata()?.len() != meta.file_size {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "target file size does not match metainfo",
            )));
        }

        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            meta,
            map: RwLock::new(Backing::ReadOnly(map)),
        })
    }

    /// Creates the zero-filled temporary sidecar and maps it read-write.
    pub fn allocate(meta: Arc<Metainfo>) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(meta.tmp_path())
            .map_err(StorageError::Allocate)?;
        file.set_len(meta.file_size).map_err(StorageError::Allocate)?;

        let map = unsafe { MmapMut::map_mut(&file) }.map_err(StorageError::Allocate)?;
        Ok(Self {
            meta,
            map: RwLock::new(Backing::Writable(map)),
        })
    }

    /// Writes a downloaded block at `piece_offset(index) + begin`.
    pub fn write_block(&self, index: u32, begin: u32, data: &[u8]) -> Result<(), StorageError> {
        let range = self.block_range(index, begin, data.len() as u32)?;

        match &mut *self.map.write() {
            Backing::Writable(map) => {
                map[range].copy_from_slice(data);
                Ok(())
            }
            Backing::ReadOnly(_) => Err(StorageError::ReadOnly),
        }
    }

    /// Reads a block to serve an upload request.
    pub fn read_block(&self, index: u32, begin: u32, len: u32) -> Result<Vec<u8>, StorageError> {
        let range = self.block_range(index, begin, len)?;

        let map = self.map.read();
        let bytes = match &*map {
            Backing::ReadOnly(m) => &m[range],
            Backing::Writable(m) => &m[range],
        };
        Ok(bytes.to_vec())
    }

    /// Hashes piece `index` and compares against the expected digest.
    pub fn verify_piece(&self, index: u32) -> bool {
        let start = self.meta.piece_offset(index) as usize;
        let end = start + self.meta.piece_len(index) as usize;

        let map = self.map.read();
        let bytes = match &*map {
            Backing::ReadOnly(m) => &m[start..end],
            Backing::Writable(m) => &m[start..end],
        };

        let digest: [u8; 20] = Sha1::digest(bytes).into();
        digest == self.meta.piece_hashes[index as usize]
    }

    /// Zeroes a piece that failed verification.
    pub fn zero_piece(&self, index: u32) -> Result<(), StorageError> {
        let start = self.meta.piece_offset(index) as usize;
        let end = start + self.meta.piece_len(index) as usize;

        match &mut *self.map.write() {
            Backing::Writable(map) => {
                map[start..end].fill(0);
                Ok(())
            }
            Backing::ReadOnly(_) => Err(StorageError::ReadOnly),
        }
    }

    /// Flushes the finished download and renames `<name>.tmp` to the
    /// target, remapping read-only.
    pub fn promote(&self) -> Result<(), StorageError> {
        let mut map = self.map.write();

        if let Backing::Writable(m) = &*map {
            m.flush()?;
            std::fs::rename(self.meta.tmp_path(), self.meta.target_path())?;

            let file = OpenOptions::new()
                .read(true)
                .open(self.meta.target_path())?;
            *map = Backing::ReadOnly(unsafe { Mmap::map(&file)? });
        }

        Ok(())
    }

    /// Removes the temporary file after an abandoned download.
    pub fn discard(&self) {
        if matches!(&*self.map.read(), Backing::Writable(_)) {
            let _ = std::fs::remove_file(self.meta.tmp_path());
        }
    }

    fn block_range(
        &self,
        index: u32,
        begin: u32,
        len: u32,
    ) -> Result<std::ops::Range<usize>, StorageError> {
        if index >= self.meta.piece_count()
            || begin as u64 + len as u64 > self.meta.piece_len(index) as u64
        {
            return Err(StorageError::OutOfBounds { index, begin, len });
        }

        let start = (self.meta.piece_offset(index) + begin as u64) as usize;
        Ok(start..start + len as usize)
    }
}
