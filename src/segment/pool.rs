//! Shared cache of open segment readers.

use std::sync::Arc;

use ahash::AHashMap;
use log::debug;
use parking_lot::RwLock;
use rayon::prelude::*;

use crate::error::{NrtError, Result};
use crate::segment::{
    SegmentInfo, SegmentReader, parse_segment_file_name, read_segment, segment_file_name,
};
use crate::storage::Storage;

/// Caches one [`SegmentReader`] per segment generation.
///
/// Snapshots and merges obtain readers here so a segment is decoded once no
/// matter how many snapshots include it. Entries are evicted when the segment
/// file is deleted; snapshots that still hold the `Arc` are unaffected.
#[derive(Debug)]
pub struct ReaderPool {
    storage: Arc<dyn Storage>,
    readers: RwLock<AHashMap<u64, Arc<SegmentReader>>>,
}

impl ReaderPool {
    /// Create an empty pool reading from `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        ReaderPool {
            storage,
            readers: RwLock::new(AHashMap::new()),
        }
    }

    /// The storage readers are opened from.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Pooled reader for `info`, opening it from storage if needed.
    pub fn get(&self, info: &SegmentInfo) -> Result<Arc<SegmentReader>> {
        if let Some(reader) = self.readers.read().get(&info.generation) {
            return Ok(Arc::clone(reader));
        }

        let reader = Arc::new(SegmentReader::open(self.storage.as_ref(), info)?);
        debug!("opened {info}");
        Ok(self.insert(reader))
    }

    /// Readers for every segment in `infos`, in order.
    ///
    /// Segments missing from the pool are opened in parallel. The first open
    /// failure is returned and nothing is partially cached for the caller.
    pub fn get_all(&self, infos: &[SegmentInfo]) -> Result<Vec<Arc<SegmentReader>>> {
        let missing: Vec<&SegmentInfo> = {
            let readers = self.readers.read();
            infos
                .iter()
                .filter(|info| !readers.contains_key(&info.generation))
                .collect()
        };

        if missing.len() > 1 {
            missing
                .par_iter()
                .map(|info| self.get(info).map(|_| ()))
                .collect::<Result<Vec<()>>>()?;
        }

        infos.iter().map(|info| self.get(info)).collect()
    }

    /// Open every complete segment file in storage, ascending by generation.
    ///
    /// Temporary files left behind by an interrupted write are ignored.
    pub fn open_existing(&self) -> Result<Vec<Arc<SegmentReader>>> {
        let mut generations: Vec<u64> = self
            .storage
            .list_files()?
            .iter()
            .filter_map(|name| parse_segment_file_name(name))
            .collect();
        generations.sort_unstable();

        generations
            .into_iter()
            .map(|generation| {
                let name = segment_file_name(generation);
                let data = read_segment(self.storage.as_ref(), &name)?;
                if data.generation != generation {
                    return Err(NrtError::corruption(format!(
                        "{name}: header names generation {}",
                        data.generation
                    )));
                }
                let info = SegmentInfo {
                    generation,
                    doc_count: data.records.len() as u32,
                    size_bytes: data.size_bytes,
                    origin: data.origin,
                };
                Ok(self.insert(Arc::new(SegmentReader::from_records(info, data.records))))
            })
            .collect()
    }

    /// Add an already open reader. An existing entry wins.
    pub fn insert(&self, reader: Arc<SegmentReader>) -> Arc<SegmentReader> {
        let mut readers = self.readers.write();
        Arc::clone(readers.entry(reader.generation()).or_insert(reader))
    }

    /// Drop the reader for `generation`.
    pub fn evict(&self, generation: u64) {
        self.readers.write().remove(&generation);
    }

    /// Whether `generation` is currently pooled.
    pub fn contains(&self, generation: u64) -> bool {
        self.readers.read().contains_key(&generation)
    }

    /// Number of pooled readers.
    pub fn len(&self) -> usize {
        self.readers.read().len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.readers.read().is_empty()
    }
}
