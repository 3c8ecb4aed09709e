//! Small shared helpers: varint coding for the segment codec and bounded
//! edit distance for fuzzy and respell tasks.

pub mod levenshtein;
pub mod varint;
