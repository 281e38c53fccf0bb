//! Memory-mapped file I/O for zero-copy weight loading.
//!
//! Uses `mmap` to map model part files directly into the process address
//! space. Tensor payloads are read straight from the mapped pages; nothing is
//! copied into process memory unless a caller asks for an owned buffer.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use llama_engine::{LlamaError, Result};

/// A memory-mapped file handle.
///
/// The mapped region remains valid for the lifetime of this struct.
/// Dropping it unlocks (if locked) and unmaps the file.
#[derive(Debug)]
pub struct MappedFile {
    /// The memory map handle.
    mmap: Mmap,

    /// Where the mapping came from, for error messages.
    path: PathBuf,

    /// Whether the pages were pinned with `mlock`.
    locked: bool,
}

impl MappedFile {
    /// Map a file into memory.
    ///
    /// # Safety
    /// The file must not be modified while mapped. Model files are treated
    /// as read-only for the lifetime of the loaded model.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            LlamaError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to open {}: {e}", path.display()),
            ))
        })?;

        // Safety: we treat the file as read-only and it won't be modified externally.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                LlamaError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to mmap {}: {e}", path.display()),
                ))
            })?
        };

        Ok(MappedFile {
            mmap,
            path: path.to_path_buf(),
            locked: false,
        })
    }

    /// Get the full mapped data as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Get a subslice at the given offset and length.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset.checked_add(len).filter(|&end| end <= self.size());
        match end {
            Some(end) => Ok(&self.mmap[offset..end]),
            None => Err(LlamaError::Format(format!(
                "{}: slice [{offset}..+{len}] exceeds file size {}",
                self.path.display(),
                self.size(),
            ))),
        }
    }

    /// Pin the mapped pages in RAM.
    pub fn lock(&mut self) -> std::io::Result<()> {
        self.mmap.lock()?;
        self.locked = true;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Total file size in bytes.
    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = self.mmap.unlock() {
                tracing::warn!(path = %self.path.display(), "munlock failed: {e}");
            }
        }
    }
}
