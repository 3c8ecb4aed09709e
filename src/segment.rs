//! Immutable segments and the bookkeeping around them.
//!
//! A segment is written once, by a flush or a merge, and is never modified
//! afterwards. Deletions are tracked separately in copy-on-write [`LiveDocs`]
//! so that a snapshot keeps seeing the deletions that existed when it was
//! built.

use std::fmt;
use std::sync::Arc;

use bit_vec::BitVec;
use serde::{Deserialize, Serialize};

pub mod codec;
pub mod deleter;
pub mod pool;
pub mod reader;

pub use codec::{read_segment, write_segment};
pub use deleter::FileDeleter;
pub use pool::ReaderPool;
pub use reader::SegmentReader;

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "nrt";

/// File name of the segment with the given generation.
pub fn segment_file_name(generation: u64) -> String {
    format!("seg_{generation}.{SEGMENT_EXTENSION}")
}

/// Parse a generation back out of a segment file name.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("seg_")?
        .strip_suffix(SEGMENT_EXTENSION)?
        .strip_suffix('.')?
        .parse()
        .ok()
}

/// How a segment came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentOrigin {
    /// Written from the writer's in-memory buffer.
    Flush,
    /// Produced by merging other segments.
    Merge,
}

/// Metadata for one committed segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Unique, monotonically assigned generation. Also names the file.
    pub generation: u64,
    /// Number of records stored, including deleted ones.
    pub doc_count: u32,
    /// Size of the segment file in bytes.
    pub size_bytes: u64,
    /// Flush or merge.
    pub origin: SegmentOrigin,
}

impl SegmentInfo {
    /// Storage file name of this segment.
    pub fn file_name(&self) -> String {
        segment_file_name(self.generation)
    }
}

impl fmt::Display for SegmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seg_{}({:?}, {} docs, {} bytes)",
            self.generation, self.origin, self.doc_count, self.size_bytes
        )
    }
}

/// Copy-on-write bitset of the records of one segment that are not deleted.
///
/// Cloning is a reference-count bump; [`LiveDocs::delete`] copies the bits
/// only while another clone (usually a snapshot) still shares them.
#[derive(Debug, Clone)]
pub struct LiveDocs {
    bits: Arc<BitVec>,
    live: u32,
}

impl LiveDocs {
    /// All `doc_count` records live.
    pub fn all_live(doc_count: u32) -> Self {
        LiveDocs {
            bits: Arc::new(BitVec::from_elem(doc_count as usize, true)),
            live: doc_count,
        }
    }

    /// Wrap existing bits.
    pub fn from_bits(bits: BitVec) -> Self {
        let live = bits.iter().filter(|&live| live).count() as u32;
        LiveDocs {
            bits: Arc::new(bits),
            live,
        }
    }

    /// Whether `doc` is live. Out of range docs are not.
    pub fn is_live(&self, doc: u32) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    /// Mark `doc` deleted. Returns whether it was live before.
    pub fn delete(&mut self, doc: u32) -> bool {
        if !self.is_live(doc) {
            return false;
        }
        Arc::make_mut(&mut self.bits).set(doc as usize, false);
        self.live -= 1;
        true
    }

    /// Number of live records.
    pub fn live_count(&self) -> u32 {
        self.live
    }

    /// Number of records covered, live or not.
    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    /// Whether the segment holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Docs that are live in `earlier` but deleted here.
    pub fn deleted_since(&self, earlier: &LiveDocs) -> Vec<u32> {
        if Arc::ptr_eq(&self.bits, &earlier.bits) {
            return Vec::new();
        }
        (0..self.len())
            .filter(|&doc| earlier.is_live(doc) && !self.is_live(doc))
            .collect()
    }
}
