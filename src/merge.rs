//! Background compaction of segments.
//!
//! A [`MergePolicy`] picks candidate segment sets, the [`Compactor`] runs the
//! resulting merges on a bounded worker pool with admission control, and an
//! optional [`Warmer`] touches each merged segment before it is committed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::segment::SegmentInfo;

pub mod compactor;
pub mod policy;
pub mod warmer;

pub use compactor::{Compactor, CompactorConfig, CompactorStats, MergeExecutor, MergeHandle};
pub use policy::{MergeCandidate, MergePolicy, MergePolicyConfig, NoMergePolicy, TieredMergePolicy};
pub use warmer::{TermLookupWarmer, Warmer};

/// A registered merge: its sources and the generation reserved for its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSpec {
    /// Segments being merged, in their committed order.
    pub sources: Vec<SegmentInfo>,
    /// Generation the merged segment will be written under.
    pub output_generation: u64,
}

impl MergeSpec {
    /// Generations of the source segments.
    pub fn source_generations(&self) -> Vec<u64> {
        self.sources.iter().map(|info| info.generation).collect()
    }

    /// Total stored records across sources.
    pub fn total_docs(&self) -> u64 {
        self.sources.iter().map(|info| info.doc_count as u64).sum()
    }
}

/// Result of a committed merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// The new segment, or `None` when every source record was deleted.
    pub output: Option<SegmentInfo>,
    /// Generations that were replaced.
    pub merged_generations: Vec<u64>,
    /// Live records copied into the output.
    pub copied_docs: u32,
    /// Deletions that arrived while the merge ran and were carried over.
    pub carried_deletes: u32,
    /// Whether the output was warmed successfully.
    pub warmed: bool,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Wall time of the successful attempt.
    pub took: Duration,
}
