//! Document sources consumed by the ingestion pool.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::document::record::Record;
use crate::error::{NrtError, Result};

/// A lazy, restartable sequence of records.
///
/// `next_record` returns `Ok(None)` once a finite source is exhausted. An
/// `Err` describes a single bad record; callers may keep pulling after it.
pub trait DocumentSource: Send + std::fmt::Debug {
    /// Produce the next record.
    fn next_record(&mut self) -> Result<Option<Record>>;

    /// Rewind to the first record.
    fn restart(&mut self) -> Result<()>;
}

impl<S: DocumentSource + ?Sized> DocumentSource for Box<S> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        (**self).next_record()
    }

    fn restart(&mut self) -> Result<()> {
        (**self).restart()
    }
}

/// Header line written by line-doc extraction tools.
const HEADER_PREFIX: &str = "FIELDS_HEADER_INDICATOR###";

/// Reads tab separated `title\tdate\tbody` lines from a file.
///
/// Record ids are the zero based ordinal of the line within the file, so a
/// repeating source revisits the same ids on every pass.
#[derive(Debug)]
pub struct LineFileSource {
    path: PathBuf,
    reader: BufReader<File>,
    repeat: bool,
    ordinal: u64,
    line_number: u64,
    line: String,
}

impl LineFileSource {
    /// Open a line file. With `repeat`, the file is rewound at EOF.
    pub fn open<P: AsRef<Path>>(path: P, repeat: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = Self::open_reader(&path)?;

        Ok(LineFileSource {
            path,
            reader,
            repeat,
            ordinal: 0,
            line_number: 0,
            line: String::new(),
        })
    }

    fn open_reader(path: &Path) -> Result<BufReader<File>> {
        let file = File::open(path).map_err(|e| {
            NrtError::invalid_config(format!("cannot open line file {}: {e}", path.display()))
        })?;
        Ok(BufReader::new(file))
    }

    fn parse_line(&self, line: &str) -> Result<Record> {
        let mut parts = line.splitn(3, '\t');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(title), Some(date), Some(body)) => Ok(Record::builder(self.ordinal.to_string())
                .add_text("title", title)
                .add_text("date", date)
                .add_text("body", body)
                .build()),
            _ => Err(NrtError::malformed_record(format!(
                "{}:{}: expected title, date and body separated by tabs",
                self.path.display(),
                self.line_number
            ))),
        }
    }
}

impl DocumentSource for LineFileSource {
    fn next_record(&mut self) -> Result<Option<Record>> {
        let mut rewound = false;
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line)?;
            if read == 0 {
                // An empty file would otherwise rewind forever.
                if !self.repeat || rewound {
                    return Ok(None);
                }
                self.restart()?;
                rewound = true;
                continue;
            }
            self.line_number += 1;

            let line = self.line.trim_end_matches(['\n', '\r']);
            if line.is_empty() || line.starts_with(HEADER_PREFIX) {
                continue;
            }

            let record = self.parse_line(line);
            self.ordinal += 1;
            return record.map(Some);
        }
    }

    fn restart(&mut self) -> Result<()> {
        self.reader = Self::open_reader(&self.path)?;
        self.ordinal = 0;
        self.line_number = 0;
        Ok(())
    }
}

/// Options for [`GeneratedSource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSourceConfig {
    /// Seed for both the vocabulary and the record stream.
    #[serde(default)]
    pub seed: u64,

    /// Number of distinct words.
    #[serde(default = "default_vocabulary_size")]
    pub vocabulary_size: usize,

    /// Words per title.
    #[serde(default = "default_title_words")]
    pub title_words: usize,

    /// Words per body.
    #[serde(default = "default_body_words")]
    pub body_words: usize,

    /// When set, ids are drawn from `0..id_space` so later records replace
    /// earlier ones in update mode. Otherwise ids are sequential.
    #[serde(default)]
    pub id_space: Option<u64>,

    /// Stop after this many records.
    #[serde(default)]
    pub max_records: Option<u64>,
}

fn default_vocabulary_size() -> usize {
    2000
}

fn default_title_words() -> usize {
    6
}

fn default_body_words() -> usize {
    40
}

impl Default for GeneratedSourceConfig {
    fn default() -> Self {
        GeneratedSourceConfig {
            seed: 0,
            vocabulary_size: default_vocabulary_size(),
            title_words: default_title_words(),
            body_words: default_body_words(),
            id_space: None,
            max_records: None,
        }
    }
}

const SYLLABLES: &[&str] = &[
    "an", "ba", "co", "de", "el", "fu", "ga", "hi", "in", "jo", "ka", "lo", "mi", "ne", "or", "pa",
    "qu", "ru", "sa", "ti", "un", "vo", "wa", "xe", "yo", "ze",
];

/// Seeded pseudo-random records over a generated vocabulary.
///
/// Word frequencies are skewed so that low vocabulary indexes behave like
/// high-frequency terms and high indexes like rare ones.
#[derive(Debug)]
pub struct GeneratedSource {
    config: GeneratedSourceConfig,
    vocabulary: Vec<String>,
    rng: StdRng,
    produced: u64,
}

impl GeneratedSource {
    /// Create a generated source.
    pub fn new(config: GeneratedSourceConfig) -> Result<Self> {
        if config.vocabulary_size == 0 {
            return Err(NrtError::invalid_config("vocabulary_size must be positive"));
        }
        if config.id_space == Some(0) {
            return Err(NrtError::invalid_config("id_space must be positive"));
        }

        let vocabulary = Self::build_vocabulary(config.seed, config.vocabulary_size);
        Ok(GeneratedSource {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            vocabulary,
            produced: 0,
        })
    }

    fn build_vocabulary(seed: u64, size: usize) -> Vec<String> {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed_ab1e);
        let mut seen = ahash::AHashSet::with_capacity(size);
        let mut words = Vec::with_capacity(size);

        while words.len() < size {
            let syllables = 1 + words.len() / SYLLABLES.len().pow(2) + rng.random_range(0..3);
            let word: String = (0..syllables)
                .map(|_| SYLLABLES[rng.random_range(0..SYLLABLES.len())])
                .collect();
            if seen.insert(word.clone()) {
                words.push(word);
            }
        }
        words
    }

    /// The generated words, most frequent first.
    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary
    }

    fn random_text(&mut self, words: usize) -> String {
        let mut text = String::new();
        for i in 0..words {
            if i > 0 {
                text.push(' ');
            }
            let skew: f64 = self.rng.random::<f64>().powi(3);
            let index = ((skew * self.vocabulary.len() as f64) as usize).min(self.vocabulary.len() - 1);
            text.push_str(&self.vocabulary[index]);
        }
        text
    }
}

impl DocumentSource for GeneratedSource {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.config.max_records.is_some_and(|max| self.produced >= max) {
            return Ok(None);
        }

        let id = match self.config.id_space {
            Some(space) => self.rng.random_range(0..space),
            None => self.produced,
        };
        let title = self.random_text(self.config.title_words);
        let body = self.random_text(self.config.body_words);
        let date = self.rng.random_range(0..1_000_000i64);
        self.produced += 1;

        Ok(Some(
            Record::builder(id.to_string())
                .add_text("title", title)
                .add_integer("date", date)
                .add_text("body", body)
                .build(),
        ))
    }

    fn restart(&mut self) -> Result<()> {
        self.rng = StdRng::seed_from_u64(self.config.seed);
        self.produced = 0;
        Ok(())
    }
}

/// An in-memory list of records.
#[derive(Debug, Clone)]
pub struct VecSource {
    records: Vec<Record>,
    position: usize,
    repeat: bool,
}

impl VecSource {
    /// Create a source over `records`, optionally cycling forever.
    pub fn new(records: Vec<Record>, repeat: bool) -> Self {
        VecSource {
            records,
            position: 0,
            repeat,
        }
    }
}

impl DocumentSource for VecSource {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.position >= self.records.len() {
            if !self.repeat || self.records.is_empty() {
                return Ok(None);
            }
            self.position = 0;
        }

        let record = self.records[self.position].clone();
        self.position += 1;
        Ok(Some(record))
    }

    fn restart(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }
}
