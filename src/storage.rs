//! Storage abstraction layer.
//!
//! Segments are persisted through the [`Storage`] trait so that the writer,
//! the compactor and every snapshot share one backend without knowing which
//! one it is. Only the writer and the compactor create or delete files;
//! snapshots only read.
//!
//! # Storage Types
//!
//! - [`MemoryStorage`]: in-memory, for tests and short benchmark runs
//! - [`FileStorage`]: buffered file I/O under a directory
//! - [`MmapStorage`]: file-backed writes, memory-mapped reads
//!
//! # Example
//!
//! ```
//! use nrtbench::storage::{StorageConfig, StorageFactory};
//! use std::io::{Read, Write};
//!
//! # fn main() -> nrtbench::error::Result<()> {
//! let storage = StorageFactory::create(&StorageConfig::Memory)?;
//!
//! let mut output = storage.create_output("seg_1.nrt")?;
//! output.write_all(b"data")?;
//! output.close()?;
//!
//! let mut input = storage.open_input("seg_1.nrt")?;
//! let mut buffer = Vec::new();
//! input.read_to_end(&mut buffer)?;
//! assert_eq!(buffer, b"data");
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{NrtError, Result};

pub mod file;
pub mod memory;
pub mod mmap;
pub mod structured;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use mmap::MmapStorage;

/// A storage backend that stores and retrieves named byte files.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open a file for reading. The file must exist.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing file.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename a file, replacing `new_name` if present.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Sync all pending writes to storage.
    fn sync(&self) -> Result<()>;

    /// Close the storage. Later calls fail with a storage error.
    fn close(&self) -> Result<()>;

    /// Whether [`Storage::close`] has been called.
    fn is_closed(&self) -> bool;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> u64;

    /// Close the output stream, making the file visible to readers.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> u64 {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }
}

/// Options for file-backed storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStorageConfig {
    /// Root directory of the storage.
    pub path: PathBuf,

    /// Read files through memory maps.
    #[serde(default)]
    pub use_mmap: bool,

    /// Buffer size for I/O operations.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Whether to fsync each file when it is closed.
    #[serde(default)]
    pub sync_writes: bool,
}

fn default_buffer_size() -> usize {
    65536
}

impl FileStorageConfig {
    /// Create a file storage configuration rooted at `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FileStorageConfig {
            path: path.into(),
            use_mmap: false,
            buffer_size: default_buffer_size(),
            sync_writes: false,
        }
    }
}

/// Selects and configures a storage backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    /// In-memory storage.
    #[default]
    Memory,

    /// Directory-backed storage, optionally memory-mapped.
    File(FileStorageConfig),
}

/// Builds storage backends from configuration.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a storage backend. Failure here is fatal to the host.
    pub fn create(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory => Ok(Arc::new(MemoryStorage::new())),
            StorageConfig::File(file_config) if file_config.use_mmap => {
                Ok(Arc::new(MmapStorage::new(file_config.clone())?))
            }
            StorageConfig::File(file_config) => {
                Ok(Arc::new(FileStorage::new(file_config.clone())?))
            }
        }
    }
}

/// Error returned by every backend once it has been closed.
pub(crate) fn storage_closed() -> NrtError {
    NrtError::storage("Storage is closed")
}

/// Error returned when a named file is missing.
pub(crate) fn file_not_found(name: &str) -> NrtError {
    NrtError::storage(format!("File not found: {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_storage_config_defaults() {
        let config = FileStorageConfig::new("/tmp/index");

        assert!(!config.use_mmap);
        assert_eq!(config.buffer_size, 65536);
        assert!(!config.sync_writes);
    }

    #[test]
    fn test_storage_config_from_json() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"type":"file","path":"/tmp/x","use_mmap":true}"#).unwrap();
        match config {
            StorageConfig::File(file) => {
                assert!(file.use_mmap);
                assert_eq!(file.buffer_size, 65536);
            }
            StorageConfig::Memory => panic!("expected file storage"),
        }

        let config: StorageConfig = serde_json::from_str(r#"{"type":"memory"}"#).unwrap();
        assert!(matches!(config, StorageConfig::Memory));
    }

    #[test]
    fn test_factory_memory() {
        let storage = StorageFactory::create(&StorageConfig::Memory).unwrap();
        assert!(storage.list_files().unwrap().is_empty());
        assert!(!storage.is_closed());
    }
}
