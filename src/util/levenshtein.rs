//! Bounded edit distance for fuzzy term matching and spell correction.
//!
//! Distances follow the optimal string alignment variant: insertions,
//! deletions, substitutions and adjacent transpositions all cost one.

/// Edit distance between `a` and `b`, or `None` once it exceeds `max`.
pub fn bounded_distance(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    bounded_distance_chars(&a, &b, max)
}

fn bounded_distance_chars(a: &[char], b: &[char], max: usize) -> Option<usize> {
    if a.len().abs_diff(b.len()) > max {
        return None;
    }
    if a.is_empty() || b.is_empty() {
        return Some(a.len().max(b.len()));
    }

    let width = b.len() + 1;
    let mut two_back = vec![0usize; width];
    let mut previous: Vec<usize> = (0..width).collect();
    let mut current = vec![0usize; width];

    for i in 1..=a.len() {
        current[0] = i;
        let mut row_min = current[0];

        for j in 1..width {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            let mut value = (previous[j] + 1)
                .min(current[j - 1] + 1)
                .min(previous[j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                value = value.min(two_back[j - 2] + 1);
            }
            current[j] = value;
            row_min = row_min.min(value);
        }

        // Every later row is at least the current row minimum.
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut two_back, &mut previous);
        std::mem::swap(&mut previous, &mut current);
    }

    let distance = previous[b.len()];
    (distance <= max).then_some(distance)
}

/// Matches candidates against one query term, reusing its decoded chars.
#[derive(Debug, Clone)]
pub struct LevenshteinMatcher {
    term: Vec<char>,
    max_edits: usize,
}

impl LevenshteinMatcher {
    /// Create a matcher accepting candidates within `max_edits`.
    pub fn new(term: &str, max_edits: usize) -> Self {
        LevenshteinMatcher {
            term: term.chars().collect(),
            max_edits,
        }
    }

    /// Distance to `candidate`, if within the edit budget.
    pub fn distance(&self, candidate: &str) -> Option<usize> {
        let candidate: Vec<char> = candidate.chars().collect();
        bounded_distance_chars(&self.term, &candidate, self.max_edits)
    }

    /// Whether `candidate` is within the edit budget.
    pub fn is_match(&self, candidate: &str) -> bool {
        self.distance(candidate).is_some()
    }

    /// Length of the query term in chars.
    pub fn term_len(&self) -> usize {
        self.term.len()
    }
}
