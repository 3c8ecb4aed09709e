//! Loading of task logs.
//!
//! A task log is a text file with one task per line:
//!
//! ```text
//! # comment lines and blank lines are skipped
//! AndHighHigh: +united +states
//! Fuzzy1: unitd~1   # trailing comments are dropped
//! Respell: staets
//! ```

use std::fs;
use std::path::Path;

use crate::error::{NrtError, Result};

/// One line of a task log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    /// Category label.
    pub category: String,
    /// Query text.
    pub text: String,
    /// 1-based line in the log.
    pub line: usize,
}

/// An ordered list of task descriptions.
#[derive(Debug, Clone, Default)]
pub struct TaskLog {
    entries: Vec<TaskEntry>,
}

impl TaskLog {
    /// Read and parse the log at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            NrtError::storage(format!("cannot read task log {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Parse log text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let content = raw.split('#').next().unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }

            let (category, query) = content.split_once(':').ok_or_else(|| {
                NrtError::query(format!("task log line {line}: expected `Category: query`"))
            })?;
            let category = category.trim();
            let query = query.trim();
            if category.is_empty() || query.is_empty() {
                return Err(NrtError::query(format!(
                    "task log line {line}: empty category or query"
                )));
            }

            entries.push(TaskEntry {
                category: category.to_string(),
                text: query.to_string(),
                line,
            });
        }
        Ok(TaskLog { entries })
    }

    /// Every entry, in file order.
    pub fn entries(&self) -> &[TaskEntry] {
        &self.entries
    }

    /// Categories in order of first appearance.
    pub fn categories(&self) -> Vec<&str> {
        let mut categories: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !categories.contains(&entry.category.as_str()) {
                categories.push(&entry.category);
            }
        }
        categories
    }

    /// Entries of `category`, in file order.
    pub fn entries_for<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a TaskEntry> + 'a {
        self.entries
            .iter()
            .filter(move |entry| entry.category == category)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const LOG: &str = "\
# benchmark tasks
Term: united

OrHighHigh: united states  # two common terms
Term: states
Respell: staets
";

    #[test]
    fn test_parse() {
        let log = TaskLog::parse(LOG).unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log.categories(), vec!["Term", "OrHighHigh", "Respell"]);

        let terms: Vec<&str> = log.entries_for("Term").map(|e| e.text.as_str()).collect();
        assert_eq!(terms, vec!["united", "states"]);
        assert_eq!(log.entries()[1].text, "united states");
        assert_eq!(log.entries()[1].line, 4);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(TaskLog::parse("no separator"), Err(NrtError::Query(_))));
        assert!(matches!(TaskLog::parse("Term:   "), Err(NrtError::Query(_))));
        assert!(TaskLog::parse("# only comments\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(LOG.as_bytes()).unwrap();
        assert_eq!(TaskLog::load(file.path()).unwrap().len(), 4);
        assert!(TaskLog::load("/nonexistent/tasks.txt").is_err());
    }
}
