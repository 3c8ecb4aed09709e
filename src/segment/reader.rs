//! In-memory view of one segment with a term index over its text fields.

use ahash::AHashMap;

use crate::document::Record;
use crate::error::{NrtError, Result};
use crate::segment::codec::read_segment;
use crate::segment::SegmentInfo;
use crate::storage::Storage;

/// A decoded, searchable segment.
///
/// Readers are immutable and shared between snapshots through the
/// [`ReaderPool`](crate::segment::ReaderPool).
#[derive(Debug)]
pub struct SegmentReader {
    info: SegmentInfo,
    records: Vec<Record>,
    postings: AHashMap<String, Vec<u32>>,
    sorted_terms: Vec<String>,
}

impl SegmentReader {
    /// Open and verify segment `info` from storage.
    pub fn open(storage: &dyn Storage, info: &SegmentInfo) -> Result<Self> {
        let data = read_segment(storage, &info.file_name())?;
        if data.generation != info.generation || data.records.len() != info.doc_count as usize {
            return Err(NrtError::corruption(format!(
                "{}: header does not match segment info {info}",
                info.file_name()
            )));
        }
        Ok(Self::from_records(info.clone(), data.records))
    }

    /// Build a reader over already decoded records.
    pub fn from_records(info: SegmentInfo, records: Vec<Record>) -> Self {
        let mut postings: AHashMap<String, Vec<u32>> = AHashMap::new();
        for (doc, record) in records.iter().enumerate() {
            let doc = doc as u32;
            for term in record.terms() {
                let docs = postings.entry(term).or_default();
                // Docs are visited in order, so a repeat is always the tail.
                if docs.last() != Some(&doc) {
                    docs.push(doc);
                }
            }
        }

        let mut sorted_terms: Vec<String> = postings.keys().cloned().collect();
        sorted_terms.sort_unstable();

        SegmentReader {
            info,
            records,
            postings,
            sorted_terms,
        }
    }

    /// Segment metadata.
    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    /// Generation of the underlying segment.
    pub fn generation(&self) -> u64 {
        self.info.generation
    }

    /// Number of stored records, including deleted ones.
    pub fn doc_count(&self) -> u32 {
        self.records.len() as u32
    }

    /// Stored record `doc`.
    pub fn record(&self, doc: u32) -> Option<&Record> {
        self.records.get(doc as usize)
    }

    /// All stored records in doc order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Ascending docs containing `term`.
    pub fn postings(&self, term: &str) -> &[u32] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of docs containing `term`, deleted ones included.
    pub fn doc_freq(&self, term: &str) -> usize {
        self.postings(term).len()
    }

    /// Number of distinct terms.
    pub fn term_count(&self) -> usize {
        self.sorted_terms.len()
    }

    /// Distinct terms in lexicographic order.
    pub fn terms(&self) -> &[String] {
        &self.sorted_terms
    }

    /// Terms starting with `prefix`, in lexicographic order.
    pub fn terms_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let start = self.sorted_terms.partition_point(|term| term.as_str() < prefix);
        self.sorted_terms[start..]
            .iter()
            .take_while(move |term| term.starts_with(prefix))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{SegmentOrigin, write_segment};
    use crate::storage::MemoryStorage;

    fn records() -> Vec<Record> {
        vec![
            Record::builder("a").add_text("body", "united states united").build(),
            Record::builder("b").add_text("body", "united kingdom").build(),
            Record::builder("c").add_text("title", "unity").add_integer("n", 3).build(),
        ]
    }

    #[test]
    fn test_postings_are_deduplicated_and_ordered() {
        let info = SegmentInfo {
            generation: 1,
            doc_count: 3,
            size_bytes: 0,
            origin: SegmentOrigin::Flush,
        };
        let reader = SegmentReader::from_records(info, records());

        assert_eq!(reader.postings("united"), &[0, 1]);
        assert_eq!(reader.postings("unity"), &[2]);
        assert!(reader.postings("missing").is_empty());
        assert_eq!(reader.doc_freq("kingdom"), 1);
        assert_eq!(reader.term_count(), 4);
    }

    #[test]
    fn test_prefix_terms() {
        let info = SegmentInfo {
            generation: 1,
            doc_count: 3,
            size_bytes: 0,
            origin: SegmentOrigin::Flush,
        };
        let reader = SegmentReader::from_records(info, records());

        let terms: Vec<&str> = reader.terms_with_prefix("uni").collect();
        assert_eq!(terms, vec!["united", "unity"]);
        assert_eq!(reader.terms_with_prefix("z").count(), 0);
    }

    #[test]
    fn test_open_from_storage() {
        let storage = MemoryStorage::new();
        let info = write_segment(&storage, 4, SegmentOrigin::Flush, &records()).unwrap();

        let reader = SegmentReader::open(&storage, &info).unwrap();
        assert_eq!(reader.generation(), 4);
        assert_eq!(reader.doc_count(), 3);
        assert_eq!(reader.record(1).unwrap().id(), "b");
    }

    #[test]
    fn test_open_detects_mismatched_info() {
        let storage = MemoryStorage::new();
        let mut info = write_segment(&storage, 4, SegmentOrigin::Flush, &records()).unwrap();
        info.doc_count = 10;

        assert!(matches!(
            SegmentReader::open(&storage, &info),
            Err(NrtError::Corruption(_))
        ));
    }
}
