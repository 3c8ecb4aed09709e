//! The task query grammar and its execution against a snapshot.
//!
//! A query is a whitespace separated list of clauses:
//!
//! | clause    | matches                                      |
//! |-----------|----------------------------------------------|
//! | `term`    | records containing `term`                    |
//! | `pre*`    | records containing a term starting with `pre`|
//! | `term~N`  | terms within `N` edits of `term` (N ≤ 2)     |
//! | `+clause` | like `clause`, but every hit must match it   |
//!
//! Without required clauses a hit needs to match at least one clause. Hits
//! are scored by the number of clauses they match and ordered by descending
//! score, then by position in the snapshot.

use std::cmp::Reverse;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use crate::error::{NrtError, Result};
use crate::segment::SegmentReader;
use crate::snapshot::Snapshot;
use crate::util::levenshtein::LevenshteinMatcher;

/// Largest edit distance a fuzzy clause may ask for.
pub const MAX_EDITS: usize = 2;

/// Category whose tasks are spell corrections rather than searches.
pub const RESPELL_CATEGORY: &str = "Respell";

/// What a clause matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClauseKind {
    /// Exact term.
    Term(String),
    /// Any term with this prefix.
    Prefix(String),
    /// Any term within `max_edits` of `term`.
    Fuzzy {
        /// Target term.
        term: String,
        /// Allowed edits.
        max_edits: usize,
    },
}

/// One clause of a search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    /// What the clause matches.
    pub kind: ClauseKind,
    /// Whether every hit must match the clause.
    pub required: bool,
}

impl Clause {
    fn parse(token: &str) -> Result<Self> {
        let (required, body) = match token.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let body = body.to_lowercase();

        let kind = if let Some(prefix) = body.strip_suffix('*') {
            ClauseKind::Prefix(prefix.to_string())
        } else if let Some((term, edits)) = body.split_once('~') {
            let max_edits = if edits.is_empty() {
                MAX_EDITS
            } else {
                edits
                    .parse::<usize>()
                    .map_err(|_| NrtError::query(format!("invalid edit distance in {token:?}")))?
            };
            if max_edits > MAX_EDITS {
                return Err(NrtError::query(format!(
                    "{token:?}: at most {MAX_EDITS} edits are supported"
                )));
            }
            ClauseKind::Fuzzy {
                term: term.to_string(),
                max_edits,
            }
        } else {
            ClauseKind::Term(body)
        };

        let empty = match &kind {
            ClauseKind::Term(term) | ClauseKind::Prefix(term) => term.is_empty(),
            ClauseKind::Fuzzy { term, .. } => term.is_empty(),
        };
        if empty {
            return Err(NrtError::query(format!("empty clause {token:?}")));
        }
        Ok(Clause { kind, required })
    }

    /// Docs of `reader` matching this clause, deleted ones included.
    fn matching_docs(&self, reader: &SegmentReader) -> AHashSet<u32> {
        match &self.kind {
            ClauseKind::Term(term) => reader.postings(term).iter().copied().collect(),
            ClauseKind::Prefix(prefix) => reader
                .terms_with_prefix(prefix)
                .flat_map(|term| reader.postings(term).iter().copied())
                .collect(),
            ClauseKind::Fuzzy { term, max_edits } => {
                let matcher = LevenshteinMatcher::new(term, *max_edits);
                reader
                    .terms()
                    .iter()
                    .filter(|candidate| matcher.is_match(candidate))
                    .flat_map(|candidate| reader.postings(candidate).iter().copied())
                    .collect()
            }
        }
    }
}

/// A parsed task query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskQuery {
    /// Search with the given clauses.
    Search(Vec<Clause>),
    /// Suggest corrections for a single term.
    Respell(String),
}

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Segment holding the record.
    pub generation: u64,
    /// Position within the segment.
    pub doc: u32,
    /// Record id.
    pub id: String,
    /// Matched clauses.
    pub score: u32,
}

/// Result of executing a query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Number of matching records.
    pub total_hits: u64,
    /// Best hits, at most `top_n`.
    pub hits: Vec<Hit>,
    /// Spelling suggestions, best first.
    pub suggestions: Vec<String>,
}

impl TaskQuery {
    /// Parse `text` as a query of `category`.
    pub fn parse(category: &str, text: &str) -> Result<Self> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(NrtError::query("empty query"));
        }

        if category == RESPELL_CATEGORY {
            return match tokens.as_slice() {
                [term] => Ok(TaskQuery::Respell(term.to_lowercase())),
                _ => Err(NrtError::query(format!(
                    "respell takes a single term, got {text:?}"
                ))),
            };
        }

        tokens
            .iter()
            .map(|token| Clause::parse(token))
            .collect::<Result<Vec<_>>>()
            .map(TaskQuery::Search)
    }

    /// Run the query against `snapshot`.
    pub fn execute(&self, snapshot: &Snapshot, top_n: usize) -> QueryResult {
        match self {
            TaskQuery::Search(clauses) => search(clauses, snapshot, top_n),
            TaskQuery::Respell(term) => QueryResult {
                suggestions: respell(term, snapshot, top_n),
                ..QueryResult::default()
            },
        }
    }
}

fn search(clauses: &[Clause], snapshot: &Snapshot, top_n: usize) -> QueryResult {
    let required = clauses.iter().filter(|clause| clause.required).count() as u32;
    let mut total_hits = 0;
    let mut hits = Vec::new();

    for view in snapshot.segments() {
        let reader = view.reader();
        // doc -> (matched clauses, matched required clauses)
        let mut matches: AHashMap<u32, (u32, u32)> = AHashMap::new();
        for clause in clauses {
            for doc in clause.matching_docs(reader) {
                let entry = matches.entry(doc).or_insert((0, 0));
                entry.0 += 1;
                if clause.required {
                    entry.1 += 1;
                }
            }
        }

        for (doc, (score, required_matched)) in matches {
            if required_matched < required || !view.is_live(doc) {
                continue;
            }
            total_hits += 1;
            if let Some(record) = reader.record(doc) {
                hits.push(Hit {
                    generation: reader.generation(),
                    doc,
                    id: record.id().to_string(),
                    score,
                });
            }
        }
    }

    let order: AHashMap<u64, usize> = snapshot
        .segment_generations()
        .into_iter()
        .enumerate()
        .map(|(position, generation)| (generation, position))
        .collect();
    hits.sort_by_key(|hit| {
        (
            Reverse(hit.score),
            order.get(&hit.generation).copied().unwrap_or(usize::MAX),
            hit.doc,
        )
    });
    hits.truncate(top_n);

    QueryResult {
        total_hits,
        hits,
        suggestions: Vec::new(),
    }
}

/// Terms within two edits of `term`, closest and most frequent first.
///
/// A term that already occurs in the snapshot gets no suggestions.
fn respell(term: &str, snapshot: &Snapshot, top_n: usize) -> Vec<String> {
    if snapshot.doc_freq(term) > 0 {
        return Vec::new();
    }

    let matcher = LevenshteinMatcher::new(term, MAX_EDITS);
    let mut candidates: AHashMap<&str, (usize, u64)> = AHashMap::new();
    for view in snapshot.segments() {
        let reader = view.reader();
        for candidate in reader.terms() {
            let Some(distance) = matcher.distance(candidate) else {
                continue;
            };
            let live = reader
                .postings(candidate)
                .iter()
                .filter(|&&doc| view.is_live(doc))
                .count() as u64;
            if live == 0 {
                continue;
            }
            let entry = candidates.entry(candidate.as_str()).or_insert((distance, 0));
            entry.1 += live;
        }
    }

    let mut ranked: Vec<(&str, usize, u64)> = candidates
        .into_iter()
        .map(|(candidate, (distance, freq))| (candidate, distance, freq))
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)).then(a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(top_n)
        .map(|(candidate, _, _)| candidate.to_string())
        .collect()
}
