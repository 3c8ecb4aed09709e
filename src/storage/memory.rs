//! In-memory storage implementation for testing and short runs.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::{Storage, StorageInput, StorageOutput, file_not_found, storage_closed};

type FileMap = Arc<Mutex<AHashMap<String, Arc<[u8]>>>>;

/// An in-memory storage implementation.
///
/// Finalized files are kept as `Arc<[u8]>` so that opening an input is a
/// reference-count bump rather than a copy.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: FileMap,
    closed: AtomicBool,
}

impl MemoryStorage {
    /// Create a new, empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(storage_closed())
        } else {
            Ok(())
        }
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files
            .lock()
            .values()
            .map(|data| data.len() as u64)
            .sum()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let files = self.files.lock();
        let data = files.get(name).ok_or_else(|| file_not_found(name))?;

        Ok(Box::new(MemoryInput {
            cursor: Cursor::new(Arc::clone(data)),
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            files: Arc::clone(&self.files),
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        !self.closed.load(Ordering::Acquire) && self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let files = self.files.lock();
        let data = files.get(name).ok_or_else(|| file_not_found(name))?;
        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        let mut files = self.files.lock();
        let data = files.remove(old_name).ok_or_else(|| file_not_found(old_name))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_closed()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }
}

/// A memory-based output. The file becomes visible when closed or dropped.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    closed: bool,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data: Arc<[u8]> = std::mem::take(&mut self.buffer).into();
            self.files.lock().insert(self.name.clone(), data);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_basic() {
        let storage = MemoryStorage::new();

        let mut output = storage.create_output("test.bin").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        assert_eq!(output.position(), 13);
        output.close().unwrap();

        assert!(storage.file_exists("test.bin"));
        assert_eq!(storage.file_size("test.bin").unwrap(), 13);

        let mut input = storage.open_input("test.bin").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"Hello, World!");
    }

    #[test]
    fn test_memory_storage_file_invisible_until_closed() {
        let storage = MemoryStorage::new();

        let mut output = storage.create_output("pending.bin").unwrap();
        output.write_all(b"abc").unwrap();
        assert!(!storage.file_exists("pending.bin"));

        output.close().unwrap();
        assert!(storage.file_exists("pending.bin"));
    }

    #[test]
    fn test_memory_storage_rename_and_delete() {
        let storage = MemoryStorage::new();

        let mut output = storage.create_output("a.tmp").unwrap();
        output.write_all(b"x").unwrap();
        output.close().unwrap();

        storage.rename_file("a.tmp", "a.nrt").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["a.nrt".to_string()]);

        storage.delete_file("a.nrt").unwrap();
        assert_eq!(storage.file_count(), 0);
        assert!(storage.open_input("a.nrt").is_err());
    }

    #[test]
    fn test_memory_storage_closed() {
        let storage = MemoryStorage::new();
        storage.close().unwrap();

        assert!(storage.is_closed());
        assert!(storage.create_output("x").is_err());
        assert!(!storage.file_exists("x"));
    }
}
