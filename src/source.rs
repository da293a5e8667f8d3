//! Byte sources handed to matchers
//!
//! A [`Buffer`] is a cheap-to-clone view over a file's content, either held
//! in memory or memory mapped. Matchers read windows from the beginning and
//! end of file without copying the whole file.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::FormidResult;

#[derive(Debug, Clone)]
enum Backing {
    Memory(Arc<[u8]>),
    Mapped(Arc<Mmap>),
}

/// Seekable, read-only file content shared between matchers.
#[derive(Debug, Clone)]
pub struct Buffer {
    backing: Backing,
}

impl Buffer {
    /// Wrap in-memory bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self {
            backing: Backing::Memory(Arc::from(bytes)),
        }
    }

    /// An empty source
    pub fn empty() -> Self {
        Self::from_bytes(Vec::new())
    }

    /// Open a file. Non-empty files are memory mapped; empty files cannot be
    /// mapped and are held as an empty in-memory buffer.
    pub fn open<P: AsRef<Path>>(path: P) -> FormidResult<Self> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        if size == 0 {
            return Ok(Self::empty());
        }
        // The mapping is read only and lives as long as the buffer; the file
        // must not be truncated while it is identified.
        let mmap = unsafe { Mmap::map(&file) }?;
        Ok(Self {
            backing: Backing::Mapped(Arc::new(mmap)),
        })
    }

    /// Entire content
    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Memory(bytes) => &bytes[..],
            Backing::Mapped(mmap) => &mmap[..],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `n` bytes from the beginning of file
    pub fn bof(&self, n: usize) -> &[u8] {
        let data = self.as_slice();
        &data[..n.min(data.len())]
    }

    /// Up to `n` bytes from the end of file
    pub fn eof(&self, n: usize) -> &[u8] {
        let data = self.as_slice();
        &data[data.len().saturating_sub(n)..]
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::empty()
    }
}
