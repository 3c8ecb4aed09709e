//! Structured binary I/O with a running CRC32 trailer.
//!
//! Every value written through [`StructWriter`] is fed into a CRC32 hasher and
//! the final checksum is appended on [`StructWriter::finish`]. [`StructReader`]
//! recomputes the checksum while reading so that a truncated or bit-flipped
//! segment file is detected before its records are exposed.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{NrtError, Result};
use crate::storage::{StorageInput, StorageOutput};
use crate::util::varint::{decode_u64, encode_u64};

/// Size of the trailing checksum in bytes.
pub const CHECKSUM_LEN: u64 = 4;

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: Hasher,
    position: u64,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: Hasher::new(),
            position: 0,
        }
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.track(&[value]);
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    /// Write an i64 value (little-endian).
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.writer.write_i64::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    /// Write a f64 value (little-endian).
    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.writer.write_f64::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = encode_u64(value);
        self.writer.write_all(&encoded)?;
        self.track(&encoded);
        Ok(())
    }

    /// Write a string with a varint length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with a varint length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.writer.write_all(value)?;
        self.track(value);
        Ok(())
    }

    /// Bytes written so far, excluding the trailer.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn track(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Append the checksum, sync and close the output.
    ///
    /// Returns the total file length including the checksum.
    pub fn finish(mut self) -> Result<u64> {
        let checksum = self.hasher.finalize();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.flush_and_sync()?;
        self.writer.close()?;
        Ok(self.position + CHECKSUM_LEN)
    }
}

/// A structured file reader for binary data.
pub struct StructReader<R: StorageInput> {
    reader: R,
    hasher: Hasher,
    position: u64,
    file_size: u64,
}

impl<R: StorageInput> std::fmt::Debug for StructReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructReader")
            .field("position", &self.position)
            .field("file_size", &self.file_size)
            .finish_non_exhaustive()
    }
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader.
    pub fn new(reader: R) -> Result<Self> {
        let file_size = reader.size()?;
        if file_size < CHECKSUM_LEN {
            return Err(NrtError::corruption(format!(
                "file of {file_size} bytes is too short for a checksum"
            )));
        }

        Ok(StructReader {
            reader,
            hasher: Hasher::new(),
            position: 0,
            file_size,
        })
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure_available(1)?;
        let value = self.reader.read_u8()?;
        self.track(&[value]);
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure_available(4)?;
        let value = self.reader.read_u32::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure_available(8)?;
        let value = self.reader.read_u64::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    /// Read an i64 value (little-endian).
    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure_available(8)?;
        let value = self.reader.read_i64::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    /// Read a f64 value (little-endian).
    pub fn read_f64(&mut self) -> Result<f64> {
        self.ensure_available(8)?;
        let value = self.reader.read_f64::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut bytes = Vec::with_capacity(10);
        loop {
            self.ensure_available(bytes.len() as u64 + 1)?;
            let byte = self.reader.read_u8()?;
            bytes.push(byte);
            if byte & 0x80 == 0 {
                break;
            }
        }

        let (value, _) = decode_u64(&bytes)?;
        self.track(&bytes);
        Ok(value)
    }

    /// Read a string with a varint length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| NrtError::corruption(format!("invalid UTF-8: {e}")))
    }

    /// Read raw bytes with a varint length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()?;
        self.ensure_available(length)?;
        let mut bytes = vec![0u8; length as usize];
        self.reader.read_exact(&mut bytes)?;
        self.track(&bytes);
        Ok(bytes)
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total file size including the trailer.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Whether only the checksum trailer remains.
    pub fn is_eof(&self) -> bool {
        self.position + CHECKSUM_LEN >= self.file_size
    }

    fn ensure_available(&self, len: u64) -> Result<()> {
        if self.position + len + CHECKSUM_LEN > self.file_size {
            return Err(NrtError::corruption(format!(
                "unexpected end of data at offset {}",
                self.position
            )));
        }
        Ok(())
    }

    fn track(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Read the stored trailer and compare it with the running checksum.
    ///
    /// Fails with [`NrtError::Corruption`] on mismatch or trailing garbage.
    pub fn verify_checksum(mut self) -> Result<()> {
        if self.position + CHECKSUM_LEN != self.file_size {
            return Err(NrtError::corruption(format!(
                "{} unread bytes before checksum",
                self.file_size - CHECKSUM_LEN - self.position
            )));
        }

        let stored = self.reader.read_u32::<LittleEndian>()?;
        let computed = self.hasher.finalize();
        if stored != computed {
            return Err(NrtError::corruption(format!(
                "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Storage};
    use std::io::Write;

    #[test]
    fn test_struct_writer_reader() {
        let storage = MemoryStorage::new();

        let output = storage.create_output("test.struct").unwrap();
        let mut writer = StructWriter::new(output);
        writer.write_u8(42).unwrap();
        writer.write_u32(5678).unwrap();
        writer.write_u64(9876543210).unwrap();
        writer.write_i64(-17).unwrap();
        writer.write_varint(12345).unwrap();
        writer.write_f64(std::f64::consts::E).unwrap();
        writer.write_string("Hello, World!").unwrap();
        writer.write_bytes(b"binary data").unwrap();
        let written = writer.finish().unwrap();
        assert_eq!(written, storage.file_size("test.struct").unwrap());

        let input = storage.open_input("test.struct").unwrap();
        let mut reader = StructReader::new(input).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 42);
        assert_eq!(reader.read_u32().unwrap(), 5678);
        assert_eq!(reader.read_u64().unwrap(), 9876543210);
        assert_eq!(reader.read_i64().unwrap(), -17);
        assert_eq!(reader.read_varint().unwrap(), 12345);
        assert!((reader.read_f64().unwrap() - std::f64::consts::E).abs() < 1e-12);
        assert_eq!(reader.read_string().unwrap(), "Hello, World!");
        assert_eq!(reader.read_bytes().unwrap(), b"binary data");
        assert!(reader.is_eof());
        reader.verify_checksum().unwrap();
    }

    #[test]
    fn test_checksum_detects_flipped_byte() {
        let storage = MemoryStorage::new();

        let output = storage.create_output("good").unwrap();
        let mut writer = StructWriter::new(output);
        writer.write_string("payload").unwrap();
        writer.finish().unwrap();

        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut storage.open_input("good").unwrap(), &mut bytes).unwrap();
        bytes[2] ^= 0xff;
        let mut output = storage.create_output("bad").unwrap();
        output.write_all(&bytes).unwrap();
        output.close().unwrap();

        let mut reader = StructReader::new(storage.open_input("bad").unwrap()).unwrap();
        let _ = reader.read_string();
        let err = reader.verify_checksum().unwrap_err();
        assert!(matches!(err, NrtError::Corruption(_)));
    }

    #[test]
    fn test_truncated_file() {
        let storage = MemoryStorage::new();
        let mut output = storage.create_output("short").unwrap();
        output.write_all(&[1, 2]).unwrap();
        output.close().unwrap();

        let err = StructReader::new(storage.open_input("short").unwrap()).unwrap_err();
        assert!(matches!(err, NrtError::Corruption(_)));
    }

    #[test]
    fn test_read_past_end_is_corruption() {
        let storage = MemoryStorage::new();
        let output = storage.create_output("one").unwrap();
        let mut writer = StructWriter::new(output);
        writer.write_u8(7).unwrap();
        writer.finish().unwrap();

        let mut reader = StructReader::new(storage.open_input("one").unwrap()).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert!(matches!(reader.read_u64(), Err(NrtError::Corruption(_))));
    }
}
