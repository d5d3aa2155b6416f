//! Memory-mapped backing store for one in-progress decode.
//!
//! The file holds two regions: `FEC_CHUNK_SIZE * chunk_count` bytes of chunk
//! payloads followed by `4 * chunk_count` bytes of little-endian chunk ids,
//! both mapped shared read/write. Chunks are inserted in arrival order, so a
//! non-zero id slot proves prior insertions and makes the file recoverable
//! after a restart.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::chunk::{CHUNK_ID_SIZE, FEC_CHUNK_SIZE};
use crate::error::{FecError, Result};

/// File-backed `(payload ‖ id)` array for a fixed number of chunks.
#[derive(Debug)]
pub struct ChunkStorage {
    map: MmapMut,
    _file: File,
    path: PathBuf,
    chunk_count: usize,
    created: bool,
}

impl ChunkStorage {
    /// Opens or creates the backing file and maps it.
    ///
    /// With `create`, parent directories are created and the file is extended
    /// to its full size; existing contents are preserved either way.
    pub fn new(path: &Path, chunk_count: usize, create: bool) -> Result<Self> {
        let fs_err = |source| FecError::FileSystemFailed {
            path: path.display().to_string(),
            source,
        };

        if create {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(fs_err)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(fs_err)?;

        let file_size = (FEC_CHUNK_SIZE + CHUNK_ID_SIZE) as u64 * chunk_count as u64;
        if create {
            if let Err(e) = file.set_len(file_size) {
                let _ = fs::remove_file(path);
                return Err(fs_err(e));
            }
        }

        // Safety: the mapping is private to this decoder; the file is sized
        // above and never truncated while mapped.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| FecError::MmapFailed {
            path: path.display().to_string(),
            source,
        })?;
        if map.len() as u64 != file_size {
            return Err(FecError::MmapFailed {
                path: path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, "unexpected file size"),
            });
        }

        Ok(Self {
            map,
            _file: file,
            path: path.to_path_buf(),
            chunk_count,
            created: create,
        })
    }

    /// Total mapped size in bytes.
    pub fn size(&self) -> usize {
        (FEC_CHUNK_SIZE + CHUNK_ID_SIZE) * self.chunk_count
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_index(&self, idx: usize) -> Result<()> {
        if idx < self.chunk_count {
            Ok(())
        } else {
            Err(FecError::IndexOutOfRange {
                index: idx,
                max: self.chunk_count,
            })
        }
    }

    /// Writes one chunk payload and its id at `slot`.
    pub fn insert(&mut self, chunk: &[u8], chunk_id: u32, slot: usize) -> Result<()> {
        debug_assert_eq!(chunk.len(), FEC_CHUNK_SIZE);
        self.check_index(slot)?;
        let off = slot * FEC_CHUNK_SIZE;
        self.map[off..off + FEC_CHUNK_SIZE].copy_from_slice(chunk);
        let id_off = self.chunk_count * FEC_CHUNK_SIZE + slot * CHUNK_ID_SIZE;
        self.map[id_off..id_off + CHUNK_ID_SIZE].copy_from_slice(&chunk_id.to_le_bytes());
        Ok(())
    }

    /// Reads back the chunk payload at `slot`.
    pub fn chunk(&self, slot: usize) -> Result<&[u8]> {
        self.check_index(slot)?;
        let off = slot * FEC_CHUNK_SIZE;
        Ok(&self.map[off..off + FEC_CHUNK_SIZE])
    }

    /// Overwrites the chunk payload at `slot`, leaving the id untouched.
    pub fn write_chunk(&mut self, slot: usize, chunk: &[u8]) -> Result<()> {
        debug_assert_eq!(chunk.len(), FEC_CHUNK_SIZE);
        self.check_index(slot)?;
        let off = slot * FEC_CHUNK_SIZE;
        self.map[off..off + FEC_CHUNK_SIZE].copy_from_slice(chunk);
        Ok(())
    }

    /// Reads back the chunk id at `slot`.
    pub fn chunk_id(&self, slot: usize) -> Result<u32> {
        self.check_index(slot)?;
        let id_off = self.chunk_count * FEC_CHUNK_SIZE + slot * CHUNK_ID_SIZE;
        let mut id = [0u8; CHUNK_ID_SIZE];
        id.copy_from_slice(&self.map[id_off..id_off + CHUNK_ID_SIZE]);
        Ok(u32::from_le_bytes(id))
    }

    /// Rewrites the id at `slot`.
    pub fn write_chunk_id(&mut self, slot: usize, chunk_id: u32) -> Result<()> {
        self.check_index(slot)?;
        let id_off = self.chunk_count * FEC_CHUNK_SIZE + slot * CHUNK_ID_SIZE;
        self.map[id_off..id_off + CHUNK_ID_SIZE].copy_from_slice(&chunk_id.to_le_bytes());
        Ok(())
    }

    /// Whether the file carries state worth recovering: at least one id slot
    /// is non-zero. Insertion order guarantees this holds after any insert
    /// whose id is non-zero. Only meaningful on freshly created stores.
    pub fn is_recoverable(&self) -> bool {
        self.created && (0..self.chunk_count).any(|i| self.chunk_id(i).unwrap_or(0) != 0)
    }

    /// Index one past the last slot holding a non-zero id, i.e. the number of
    /// chunks that were provably inserted.
    pub fn recovered_count(&self) -> usize {
        (0..self.chunk_count)
            .rev()
            .find(|&i| self.chunk_id(i).unwrap_or(0) != 0)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Renames the backing file; the mapping stays valid across the rename.
    pub fn rename_to(&mut self, new_path: &Path) -> Result<()> {
        fs::rename(&self.path, new_path).map_err(|source| FecError::FileSystemFailed {
            path: new_path.display().to_string(),
            source,
        })?;
        self.path = new_path.to_path_buf();
        Ok(())
    }

    /// Releases the mapped pages and unlinks the backing file.
    pub fn remove(self) {
        #[cfg(target_os = "linux")]
        {
            use memmap2::UncheckedAdvice;
            // Safety: the mapping is dropped immediately after; zeroed pages
            // are never read back.
            let _ = unsafe { self.map.unchecked_advise(UncheckedAdvice::Remove) };
        }
        let path = self.path.clone();
        drop(self.map);
        if let Err(e) = fs::remove_file(&path) {
            tracing::debug!("failed to unlink chunk file {}: {}", path.display(), e);
        }
    }
}
