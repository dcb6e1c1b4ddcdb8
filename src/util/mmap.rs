use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::errors::NetResult;

/// A read-only memory mapping of a file on disk, used by the tensor stream
/// readers to avoid loading whole datasets into memory.
pub struct MemoryMappedFile {
    _file: File,
    map: Mmap,
}

impl MemoryMappedFile {
    pub fn open<P: AsRef<Path>>(path: P) -> NetResult<Self> {
        let file = File::open(path)?;
        // Read-only mapping of a file we keep open for the mapping's lifetime.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { _file: file, map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn address(&self) -> *const u8 {
        self.map.as_ptr()
    }
}
