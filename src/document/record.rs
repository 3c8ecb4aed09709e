//! The immutable record type.

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// Value of a single record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Text value, tokenized for search.
    Text(String),
    /// Integer value.
    Integer(i64),
    /// Floating point value.
    Float(f64),
}

impl FieldValue {
    /// Convert to text if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to an integer if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Approximate heap footprint, used for the writer's buffer ceiling.
    pub fn estimated_bytes(&self) -> usize {
        match self {
            FieldValue::Text(s) => s.len(),
            FieldValue::Integer(_) | FieldValue::Float(_) => 8,
        }
    }
}

/// An immutable, ordered set of named fields keyed by a string id.
///
/// The id is the primary key used by update mode; adding two records with the
/// same id keeps both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: String,
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    /// Create a record from an id and its fields, in order.
    pub fn new<S: Into<String>>(id: S, fields: Vec<(String, FieldValue)>) -> Self {
        Record {
            id: id.into(),
            fields,
        }
    }

    /// Create a builder for a record with the given id.
    pub fn builder<S: Into<String>>(id: S) -> RecordBuilder {
        RecordBuilder {
            record: Record::new(id, Vec::new()),
        }
    }

    /// The primary key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All fields in insertion order.
    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// First value of the named field.
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Approximate in-memory size of the record.
    pub fn estimated_bytes(&self) -> usize {
        self.id.len()
            + self
                .fields
                .iter()
                .map(|(name, value)| name.len() + value.estimated_bytes())
                .sum::<usize>()
    }

    /// Lowercased terms of every text field, in field order.
    pub fn terms(&self) -> impl Iterator<Item = String> + '_ {
        self.fields
            .iter()
            .filter_map(|(_, value)| value.as_text())
            .flat_map(tokenize)
    }
}

/// Split text into lowercased Unicode words.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.unicode_words().map(|word| word.to_lowercase())
}

/// A builder for constructing records in a fluent manner.
#[derive(Debug)]
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    /// Add a text field.
    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.record
            .fields
            .push((name.into(), FieldValue::Text(value.into())));
        self
    }

    /// Add an integer field.
    pub fn add_integer<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.record
            .fields
            .push((name.into(), FieldValue::Integer(value)));
        self
    }

    /// Add a float field.
    pub fn add_float<S: Into<String>>(mut self, name: S, value: f64) -> Self {
        self.record
            .fields
            .push((name.into(), FieldValue::Float(value)));
        self
    }

    /// Build the record.
    pub fn build(self) -> Record {
        self.record
    }
}
