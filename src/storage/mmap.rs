//! Memory-mapped storage backend.
//!
//! Writes go through buffered file outputs; reads map the whole file. Segment
//! files are immutable once renamed into place, so a cached map stays valid
//! until the file is deleted or replaced.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;

use crate::error::{NrtError, Result};
use crate::storage::file::{create_file_output, list_directory, open_directory};
use crate::storage::{
    FileStorageConfig, Storage, StorageInput, StorageOutput, file_not_found, storage_closed,
};

/// Memory-mapped storage backend.
#[derive(Debug)]
pub struct MmapStorage {
    base_path: PathBuf,
    config: FileStorageConfig,
    mmap_cache: RwLock<AHashMap<String, Arc<Mmap>>>,
    closed: AtomicBool,
}

impl MmapStorage {
    /// Create a new memory-mapped storage backend.
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        let base_path = open_directory(&config)?;

        Ok(MmapStorage {
            base_path,
            config,
            mmap_cache: RwLock::new(AHashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(storage_closed())
        } else {
            Ok(())
        }
    }

    /// Get or create a memory map for a file.
    fn get_mmap(&self, name: &str) -> Result<Arc<Mmap>> {
        if let Some(mmap) = self.mmap_cache.read().get(name) {
            return Ok(Arc::clone(mmap));
        }

        let file = File::open(self.file_path(name)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                file_not_found(name)
            } else {
                NrtError::storage(format!("Failed to open file {name}: {e}"))
            }
        })?;

        // SAFETY: segment files are never modified after they are renamed into
        // place; they are only deleted, which leaves existing maps valid.
        let mmap = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|e| NrtError::storage(format!("Failed to mmap file {name}: {e}")))?
        };

        let mmap = Arc::new(mmap);
        self.mmap_cache
            .write()
            .insert(name.to_string(), Arc::clone(&mmap));
        Ok(mmap)
    }

    fn invalidate_cache(&self, name: &str) {
        self.mmap_cache.write().remove(name);
    }

    /// Number of files currently mapped.
    pub fn mapped_count(&self) -> usize {
        self.mmap_cache.read().len()
    }
}

impl Storage for MmapStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        // Zero-length files cannot be mapped on every platform.
        if self.file_size(name)? == 0 {
            return Ok(Box::new(MmapInput {
                cursor: Cursor::new(MappedBytes::Empty),
            }));
        }

        let mmap = self.get_mmap(name)?;
        Ok(Box::new(MmapInput {
            cursor: Cursor::new(MappedBytes::Mapped(mmap)),
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;
        self.invalidate_cache(name);
        create_file_output(
            self.file_path(name),
            self.config.buffer_size,
            self.config.sync_writes,
        )
    }

    fn file_exists(&self, name: &str) -> bool {
        !self.closed.load(Ordering::Acquire) && self.file_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;
        self.invalidate_cache(name);

        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| NrtError::storage(format!("Failed to delete file: {e}")))?;
        }
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;
        list_directory(&self.base_path)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let metadata = std::fs::metadata(self.file_path(name)).map_err(|_| file_not_found(name))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;
        self.invalidate_cache(old_name);
        self.invalidate_cache(new_name);

        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| NrtError::storage(format!("Failed to rename {old_name}: {e}")))
    }

    fn sync(&self) -> Result<()> {
        self.check_closed()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.mmap_cache.write().clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
enum MappedBytes {
    Empty,
    Mapped(Arc<Mmap>),
}

impl AsRef<[u8]> for MappedBytes {
    fn as_ref(&self) -> &[u8] {
        match self {
            MappedBytes::Empty => &[],
            MappedBytes::Mapped(mmap) => &mmap[..],
        }
    }
}

/// Input stream over a memory-mapped file.
#[derive(Debug)]
pub struct MmapInput {
    cursor: Cursor<MappedBytes>,
}

impl Read for MmapInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MmapInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MmapInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().as_ref().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_mmap_storage_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = MmapStorage::new(FileStorageConfig::new(temp_dir.path())).unwrap();

        let mut output = storage.create_output("seg_1.nrt").unwrap();
        output.write_all(b"mapped segment").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("seg_1.nrt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"mapped segment");
        assert_eq!(storage.mapped_count(), 1);

        storage.delete_file("seg_1.nrt").unwrap();
        assert_eq!(storage.mapped_count(), 0);
        assert!(!storage.file_exists("seg_1.nrt"));
    }

    #[test]
    fn test_mmap_storage_empty_file() {
        let temp_dir = TempDir::new().unwrap();
        let storage = MmapStorage::new(FileStorageConfig::new(temp_dir.path())).unwrap();

        let mut output = storage.create_output("empty.nrt").unwrap();
        output.close().unwrap();

        let input = storage.open_input("empty.nrt").unwrap();
        assert_eq!(input.size().unwrap(), 0);
    }
}
