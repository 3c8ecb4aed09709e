//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{NrtError, Result};
use crate::storage::{
    FileStorageConfig, Storage, StorageInput, StorageOutput, file_not_found, storage_closed,
};

/// A file-based storage implementation rooted at a directory.
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    config: FileStorageConfig,
    closed: AtomicBool,
}

impl FileStorage {
    /// Create a new file storage, creating the directory if needed.
    pub fn new(config: FileStorageConfig) -> Result<Self> {
        let directory = open_directory(&config)?;

        Ok(FileStorage {
            directory,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Get the full path for a file name.
    pub(crate) fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(storage_closed())
        } else {
            Ok(())
        }
    }
}

/// Create (if needed) and validate the storage root directory.
pub(crate) fn open_directory(config: &FileStorageConfig) -> Result<PathBuf> {
    let directory = config.path.clone();

    if !directory.exists() {
        std::fs::create_dir_all(&directory)
            .map_err(|e| NrtError::storage(format!("Failed to create directory: {e}")))?;
    }

    if !directory.is_dir() {
        return Err(NrtError::storage(format!(
            "Path is not a directory: {}",
            directory.display()
        )));
    }

    Ok(directory)
}

/// Open a file under `directory` for writing.
pub(crate) fn create_file_output(
    path: PathBuf,
    buffer_size: usize,
    sync_writes: bool,
) -> Result<Box<dyn StorageOutput>> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| NrtError::storage(format!("Failed to create {}: {e}", path.display())))?;

    Ok(Box::new(FileOutput {
        writer: Some(BufWriter::with_capacity(buffer_size, file)),
        position: 0,
        sync_writes,
    }))
}

/// List regular files in `directory`, sorted by name.
pub(crate) fn list_directory(directory: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let file = File::open(self.file_path(name)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                file_not_found(name)
            } else {
                NrtError::storage(e.to_string())
            }
        })?;
        let size = file.metadata()?.len();

        Ok(Box::new(FileInput {
            reader: BufReader::with_capacity(self.config.buffer_size, file),
            size,
        }))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;
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

        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| NrtError::storage(format!("Failed to delete file: {e}")))?;
        }
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;
        list_directory(&self.directory)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let metadata = std::fs::metadata(self.file_path(name)).map_err(|_| file_not_found(name))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| NrtError::storage(format!("Failed to rename {old_name}: {e}")))
    }

    fn sync(&self) -> Result<()> {
        self.check_closed()?;

        // Persist directory entries created by renames.
        #[cfg(unix)]
        File::open(&self.directory)?.sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A buffered file input.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

/// A buffered file output.
#[derive(Debug)]
pub struct FileOutput {
    writer: Option<BufWriter<File>>,
    position: u64,
    sync_writes: bool,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("Output is closed"))?;
        let written = writer.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            if self.sync_writes {
                writer.get_ref().sync_all()?;
            }
        }
        Ok(())
    }
}
