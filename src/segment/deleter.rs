//! Reference counted deletion of segment files.

use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::segment::{ReaderPool, segment_file_name};

/// Tracks who still needs each segment file and deletes it when nobody does.
///
/// The writer's committed segment set holds one reference per segment, and
/// every snapshot that has not been reclaimed holds one more. A file is
/// removed from storage, and its reader evicted from the pool, when its count
/// drops to zero.
#[derive(Debug)]
pub struct FileDeleter {
    pool: Arc<ReaderPool>,
    refs: Mutex<AHashMap<u64, usize>>,
}

impl FileDeleter {
    /// Create a deleter for files in `pool`'s storage.
    pub fn new(pool: Arc<ReaderPool>) -> Self {
        FileDeleter {
            pool,
            refs: Mutex::new(AHashMap::new()),
        }
    }

    /// Add one reference to each generation.
    pub fn inc_ref<I: IntoIterator<Item = u64>>(&self, generations: I) {
        let mut refs = self.refs.lock();
        for generation in generations {
            *refs.entry(generation).or_insert(0) += 1;
        }
    }

    /// Drop one reference from each generation, deleting unreferenced files.
    pub fn dec_ref<I: IntoIterator<Item = u64>>(&self, generations: I) {
        let mut unreferenced = Vec::new();
        {
            let mut refs = self.refs.lock();
            for generation in generations {
                match refs.get_mut(&generation) {
                    Some(count) if *count > 1 => *count -= 1,
                    Some(_) => {
                        refs.remove(&generation);
                        unreferenced.push(generation);
                    }
                    None => warn!("dec_ref of untracked segment generation {generation}"),
                }
            }
        }

        for generation in unreferenced {
            self.delete_now(generation);
        }
    }

    /// Delete a segment file that was never published.
    pub fn delete_now(&self, generation: u64) {
        self.pool.evict(generation);
        let name = segment_file_name(generation);
        match self.pool.storage().delete_file(&name) {
            Ok(()) => debug!("deleted {name}"),
            Err(e) => warn!("failed to delete {name}: {e}"),
        }
    }

    /// Current reference count of `generation`.
    pub fn ref_count(&self, generation: u64) -> usize {
        self.refs.lock().get(&generation).copied().unwrap_or(0)
    }

    /// Generations with at least one reference, ascending.
    pub fn referenced(&self) -> Vec<u64> {
        let mut generations: Vec<u64> = self.refs.lock().keys().copied().collect();
        generations.sort_unstable();
        generations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Record;
    use crate::segment::{SegmentOrigin, write_segment};
    use crate::storage::{MemoryStorage, Storage};

    #[test]
    fn test_file_deleted_at_zero_references() {
        let storage = Arc::new(MemoryStorage::new());
        let records = vec![Record::builder("1").add_text("body", "x").build()];
        let info = write_segment(storage.as_ref(), 1, SegmentOrigin::Flush, &records).unwrap();

        let pool = Arc::new(ReaderPool::new(storage.clone()));
        pool.get(&info).unwrap();
        let deleter = FileDeleter::new(pool.clone());

        deleter.inc_ref([1]);
        deleter.inc_ref([1]);
        assert_eq!(deleter.ref_count(1), 2);

        deleter.dec_ref([1]);
        assert!(storage.file_exists("seg_1.nrt"));
        assert!(pool.contains(1));

        deleter.dec_ref([1]);
        assert_eq!(deleter.ref_count(1), 0);
        assert!(!storage.file_exists("seg_1.nrt"));
        assert!(!pool.contains(1));
        assert!(deleter.referenced().is_empty());
    }

    #[test]
    fn test_untracked_dec_ref_is_ignored() {
        let storage = Arc::new(MemoryStorage::new());
        let deleter = FileDeleter::new(Arc::new(ReaderPool::new(storage)));
        deleter.dec_ref([42]);
        assert_eq!(deleter.ref_count(42), 0);
    }
}
