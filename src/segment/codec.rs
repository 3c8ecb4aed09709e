//! On-disk encoding of a segment.
//!
//! ```text
//! magic u32 | version u8 | generation u64 | origin u8 | doc_count varint
//! doc_count x ( id string | field_count varint | field_count x field )
//! field = name string | tag u8 | value
//! crc32 u32
//! ```
//!
//! Segments are written under a temporary name and renamed into place, so a
//! reader never observes a partially written file.

use log::warn;

use crate::document::{FieldValue, Record};
use crate::error::{NrtError, Result};
use crate::segment::{SegmentInfo, SegmentOrigin, segment_file_name};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const SEGMENT_MAGIC: u32 = 0x4E52_5453;
const SEGMENT_VERSION: u8 = 1;

const TAG_TEXT: u8 = 0;
const TAG_INTEGER: u8 = 1;
const TAG_FLOAT: u8 = 2;

const ORIGIN_FLUSH: u8 = 0;
const ORIGIN_MERGE: u8 = 1;

/// Decoded contents of a segment file.
#[derive(Debug)]
pub struct SegmentData {
    /// Generation recorded in the header.
    pub generation: u64,
    /// Flush or merge.
    pub origin: SegmentOrigin,
    /// Records in doc order.
    pub records: Vec<Record>,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Write `records` as segment `generation` and return its info.
///
/// On failure the temporary file is removed and nothing is renamed.
pub fn write_segment(
    storage: &dyn Storage,
    generation: u64,
    origin: SegmentOrigin,
    records: &[Record],
) -> Result<SegmentInfo> {
    let file_name = segment_file_name(generation);
    let tmp_name = format!("{file_name}.tmp");

    let result = encode(storage, &tmp_name, generation, origin, records)
        .and_then(|size| storage.rename_file(&tmp_name, &file_name).map(|_| size));

    match result {
        Ok(size_bytes) => Ok(SegmentInfo {
            generation,
            doc_count: records.len() as u32,
            size_bytes,
            origin,
        }),
        Err(e) => {
            if let Err(cleanup) = storage.delete_file(&tmp_name) {
                warn!("failed to remove {tmp_name} after write error: {cleanup}");
            }
            Err(e)
        }
    }
}

fn encode(
    storage: &dyn Storage,
    name: &str,
    generation: u64,
    origin: SegmentOrigin,
    records: &[Record],
) -> Result<u64> {
    let mut writer = StructWriter::new(storage.create_output(name)?);

    writer.write_u32(SEGMENT_MAGIC)?;
    writer.write_u8(SEGMENT_VERSION)?;
    writer.write_u64(generation)?;
    writer.write_u8(match origin {
        SegmentOrigin::Flush => ORIGIN_FLUSH,
        SegmentOrigin::Merge => ORIGIN_MERGE,
    })?;
    writer.write_varint(records.len() as u64)?;

    for record in records {
        writer.write_string(record.id())?;
        writer.write_varint(record.fields().len() as u64)?;
        for (name, value) in record.fields() {
            writer.write_string(name)?;
            match value {
                FieldValue::Text(text) => {
                    writer.write_u8(TAG_TEXT)?;
                    writer.write_string(text)?;
                }
                FieldValue::Integer(v) => {
                    writer.write_u8(TAG_INTEGER)?;
                    writer.write_i64(*v)?;
                }
                FieldValue::Float(v) => {
                    writer.write_u8(TAG_FLOAT)?;
                    writer.write_f64(*v)?;
                }
            }
        }
    }

    writer.finish()
}

/// Read and verify the segment file `file_name`.
pub fn read_segment(storage: &dyn Storage, file_name: &str) -> Result<SegmentData> {
    let mut reader = StructReader::new(storage.open_input(file_name)?)?;
    let size_bytes = reader.size();

    let magic = reader.read_u32()?;
    if magic != SEGMENT_MAGIC {
        return Err(NrtError::corruption(format!(
            "{file_name}: bad magic {magic:#010x}"
        )));
    }
    let version = reader.read_u8()?;
    if version != SEGMENT_VERSION {
        return Err(NrtError::corruption(format!(
            "{file_name}: unsupported version {version}"
        )));
    }

    let generation = reader.read_u64()?;
    let origin = match reader.read_u8()? {
        ORIGIN_FLUSH => SegmentOrigin::Flush,
        ORIGIN_MERGE => SegmentOrigin::Merge,
        other => {
            return Err(NrtError::corruption(format!(
                "{file_name}: unknown origin {other}"
            )));
        }
    };

    let doc_count = reader.read_varint()?;
    let mut records = Vec::with_capacity(doc_count.min(1 << 20) as usize);
    for _ in 0..doc_count {
        let id = reader.read_string()?;
        let field_count = reader.read_varint()?;
        let mut fields = Vec::with_capacity(field_count.min(256) as usize);
        for _ in 0..field_count {
            let name = reader.read_string()?;
            let value = match reader.read_u8()? {
                TAG_TEXT => FieldValue::Text(reader.read_string()?),
                TAG_INTEGER => FieldValue::Integer(reader.read_i64()?),
                TAG_FLOAT => FieldValue::Float(reader.read_f64()?),
                tag => {
                    return Err(NrtError::corruption(format!(
                        "{file_name}: unknown field tag {tag}"
                    )));
                }
            };
            fields.push((name, value));
        }
        records.push(Record::new(id, fields));
    }

    reader.verify_checksum()?;

    Ok(SegmentData {
        generation,
        origin,
        records,
        size_bytes,
    })
}
