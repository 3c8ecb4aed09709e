//! Records and the sources that produce them.
//!
//! A [`Record`] is the unit of mutation accepted by the writer. Records are
//! produced by a [`DocumentSource`], which the ingestion pool drains from
//! several threads.
//!
//! # Examples
//!
//! ```
//! use nrtbench::document::{FieldValue, Record};
//!
//! let record = Record::builder("doc-1")
//!     .add_text("title", "Rust Programming Guide")
//!     .add_integer("year", 2024)
//!     .build();
//!
//! assert_eq!(record.id(), "doc-1");
//! assert_eq!(record.get_field("year"), Some(&FieldValue::Integer(2024)));
//! ```

pub mod record;
pub mod source;

pub use record::{FieldValue, Record, RecordBuilder};
pub use source::{DocumentSource, GeneratedSource, GeneratedSourceConfig, LineFileSource, VecSource};
