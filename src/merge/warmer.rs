//! Warming of freshly merged segments.

use crate::error::Result;
use crate::segment::SegmentReader;

/// Runs a representative read against a merged segment before it is
/// committed, so the first snapshot that includes it does not pay for it.
pub trait Warmer: Send + Sync + std::fmt::Debug {
    /// Warm `reader`. Errors are logged by the caller and otherwise ignored.
    fn warm(&self, reader: &SegmentReader) -> Result<()>;
}

/// Canonical term warmer: looks up one term and loads its first hits.
#[derive(Debug, Clone)]
pub struct TermLookupWarmer {
    term: String,
    top_n: usize,
}

impl TermLookupWarmer {
    /// Term looked up when none is configured.
    pub const DEFAULT_TERM: &'static str = "united";

    /// Create a warmer for `term`, loading up to `top_n` matching records.
    pub fn new<S: Into<String>>(term: S, top_n: usize) -> Self {
        TermLookupWarmer {
            term: term.into().to_lowercase(),
            top_n,
        }
    }

    /// The looked up term.
    pub fn term(&self) -> &str {
        &self.term
    }
}

impl Default for TermLookupWarmer {
    fn default() -> Self {
        TermLookupWarmer::new(Self::DEFAULT_TERM, 10)
    }
}

impl Warmer for TermLookupWarmer {
    fn warm(&self, reader: &SegmentReader) -> Result<()> {
        let loaded: usize = reader
            .postings(&self.term)
            .iter()
            .take(self.top_n)
            .filter_map(|&doc| reader.record(doc))
            .map(|record| record.len())
            .sum();
        log::trace!(
            "warmed seg_{} on {:?}: {} fields loaded",
            reader.generation(),
            self.term,
            loaded
        );
        Ok(())
    }
}
