//! Merge policies for segment management.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{NrtError, Result};
use crate::segment::SegmentInfo;

/// A set of segments a policy wants merged together.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    /// Segments to merge.
    pub segments: Vec<SegmentInfo>,
    /// Higher is more urgent.
    pub priority: f64,
}

/// Trait for defining merge policies.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
    /// Select merges among `segments`, skipping generations in `merging`.
    ///
    /// Returned candidates never share a segment and are ordered by
    /// descending priority.
    fn find_merges(&self, segments: &[SegmentInfo], merging: &AHashSet<u64>) -> Vec<MergeCandidate>;

    /// Short name for logging.
    fn name(&self) -> &'static str;
}

/// Never merges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(&self, _segments: &[SegmentInfo], _merging: &AHashSet<u64>) -> Vec<MergeCandidate> {
        Vec::new()
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Tiered merge policy.
///
/// Segments are grouped by `floor(log_f(doc_count))` with `f =
/// segments_per_merge`, so each tier holds segments of similar size. A tier
/// with at least `segments_per_merge` idle segments merges its smallest ones.
/// Independently, the total segment count is bounded by `max_segments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredMergePolicy {
    /// Number of segments merged at once. Also the tier size factor.
    pub segments_per_merge: usize,

    /// Upper bound on the number of segments.
    pub max_segments: usize,
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        TieredMergePolicy {
            segments_per_merge: 10,
            max_segments: 50,
        }
    }
}

impl TieredMergePolicy {
    /// Create a tiered merge policy.
    pub fn new(segments_per_merge: usize, max_segments: usize) -> Result<Self> {
        let policy = TieredMergePolicy {
            segments_per_merge,
            max_segments,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Check the policy parameters.
    pub fn validate(&self) -> Result<()> {
        if self.segments_per_merge < 2 {
            return Err(NrtError::invalid_config("segments_per_merge must be at least 2"));
        }
        if self.max_segments < 1 {
            return Err(NrtError::invalid_config("max_segments must be positive"));
        }
        Ok(())
    }

    /// Tier of a segment holding `doc_count` records.
    pub fn tier(&self, doc_count: u32) -> u32 {
        let factor = self.segments_per_merge as u64;
        let mut remaining = doc_count.max(1) as u64;
        let mut tier = 0;
        while remaining >= factor {
            remaining /= factor;
            tier += 1;
        }
        tier
    }

    fn by_size(segments: &mut [SegmentInfo]) {
        segments.sort_by_key(|info| (info.doc_count, info.generation));
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(&self, segments: &[SegmentInfo], merging: &AHashSet<u64>) -> Vec<MergeCandidate> {
        let mut tiers: BTreeMap<u32, Vec<SegmentInfo>> = BTreeMap::new();
        for info in segments.iter().filter(|info| !merging.contains(&info.generation)) {
            tiers
                .entry(self.tier(info.doc_count))
                .or_default()
                .push(info.clone());
        }

        let mut candidates = Vec::new();
        let mut leftovers = Vec::new();
        for (tier, mut tier_segments) in tiers {
            Self::by_size(&mut tier_segments);

            let mut rest = tier_segments.as_slice();
            while rest.len() >= self.segments_per_merge {
                let (group, tail) = rest.split_at(self.segments_per_merge);
                candidates.push(MergeCandidate {
                    segments: group.to_vec(),
                    priority: 10.0 + tier_segments.len() as f64 - tier as f64,
                });
                rest = tail;
            }
            leftovers.extend_from_slice(rest);
        }

        // Every planned merge removes segments_per_merge - 1 segments.
        let mut projected = segments
            .len()
            .saturating_sub(candidates.len() * (self.segments_per_merge - 1));
        Self::by_size(&mut leftovers);
        let mut rest = leftovers.as_slice();
        while projected > self.max_segments && rest.len() >= 2 {
            let excess = projected - self.max_segments;
            let take = (excess + 1).min(self.segments_per_merge).min(rest.len());
            let (group, tail) = rest.split_at(take);
            candidates.push(MergeCandidate {
                segments: group.to_vec(),
                priority: 5.0 + excess as f64,
            });
            projected -= take - 1;
            rest = tail;
        }

        candidates.sort_by(|a, b| b.priority.total_cmp(&a.priority));
        candidates
    }

    fn name(&self) -> &'static str {
        "tiered"
    }
}

/// Serializable selection of a merge policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergePolicyConfig {
    /// [`TieredMergePolicy`].
    Tiered(TieredMergePolicy),
    /// [`NoMergePolicy`].
    None,
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        MergePolicyConfig::Tiered(TieredMergePolicy::default())
    }
}

impl MergePolicyConfig {
    /// Build the configured policy.
    pub fn build(&self) -> Result<Arc<dyn MergePolicy>> {
        match self {
            MergePolicyConfig::Tiered(policy) => {
                policy.validate()?;
                Ok(Arc::new(policy.clone()))
            }
            MergePolicyConfig::None => Ok(Arc::new(NoMergePolicy)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentOrigin;

    fn segment(generation: u64, doc_count: u32) -> SegmentInfo {
        SegmentInfo {
            generation,
            doc_count,
            size_bytes: doc_count as u64 * 100,
            origin: SegmentOrigin::Flush,
        }
    }

    fn generations(candidate: &MergeCandidate) -> Vec<u64> {
        candidate.segments.iter().map(|s| s.generation).collect()
    }

    #[test]
    fn test_tier() {
        let policy = TieredMergePolicy::new(10, 50).unwrap();
        assert_eq!(policy.tier(0), 0);
        assert_eq!(policy.tier(9), 0);
        assert_eq!(policy.tier(10), 1);
        assert_eq!(policy.tier(99), 1);
        assert_eq!(policy.tier(100), 2);

        let binary = TieredMergePolicy::new(2, 50).unwrap();
        assert_eq!(binary.tier(1), 0);
        assert_eq!(binary.tier(2), 1);
        assert_eq!(binary.tier(3), 1);
        assert_eq!(binary.tier(4), 2);
    }

    #[test]
    fn test_full_tier_merges_smallest() {
        let policy = TieredMergePolicy::new(3, 50).unwrap();
        let segments = vec![segment(1, 5), segment(2, 3), segment(3, 4), segment(4, 6)];

        let candidates = policy.find_merges(&segments, &AHashSet::new());
        assert_eq!(candidates.len(), 1);
        assert_eq!(generations(&candidates[0]), vec![1, 2, 3]);
    }

    #[test]
    fn test_merging_segments_are_skipped() {
        let policy = TieredMergePolicy::new(2, 50).unwrap();
        let segments = vec![segment(1, 1), segment(2, 1), segment(3, 1)];
        let merging: AHashSet<u64> = [1, 2].into_iter().collect();

        assert!(policy.find_merges(&segments, &merging).is_empty());

        let segments = vec![segment(1, 1), segment(2, 1), segment(3, 1), segment(4, 1)];
        let candidates = policy.find_merges(&segments, &merging);
        assert_eq!(candidates.len(), 1);
        assert_eq!(generations(&candidates[0]), vec![3, 4]);
    }

    #[test]
    fn test_max_segments_bound() {
        let policy = TieredMergePolicy::new(10, 3).unwrap();
        // One segment per tier, so no tier is full.
        let segments = vec![segment(1, 1), segment(2, 10), segment(3, 100), segment(4, 1000), segment(5, 10000)];

        let candidates = policy.find_merges(&segments, &AHashSet::new());
        assert_eq!(candidates.len(), 1);
        assert_eq!(generations(&candidates[0]), vec![1, 2, 3]);
    }

    #[test]
    fn test_no_merge_policy() {
        let segments = vec![segment(1, 1), segment(2, 1)];
        assert!(NoMergePolicy.find_merges(&segments, &AHashSet::new()).is_empty());
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(TieredMergePolicy::new(1, 10).is_err());
        assert!(TieredMergePolicy::new(2, 0).is_err());
    }

    #[test]
    fn test_policy_config_from_json() {
        let config: MergePolicyConfig =
            serde_json::from_str(r#"{"type":"tiered","segments_per_merge":4,"max_segments":20}"#).unwrap();
        assert_eq!(config.build().unwrap().name(), "tiered");

        let config: MergePolicyConfig = serde_json::from_str(r#"{"type":"none"}"#).unwrap();
        assert_eq!(config.build().unwrap().name(), "none");
    }
}
