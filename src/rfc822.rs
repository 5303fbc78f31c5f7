//! Parser for the record-oriented `key: value` text format.
//!
//! The same format carries three kinds of data through the engine:
//!
//! | Producer | Records become |
//! |----------|----------------|
//! | Unit files (`*.pxu`) on disk | Unit definitions |
//! | Stdout of a `resource` job | Resource records |
//! | Stdout of a `local` job | Freshly generated unit definitions |
//!
//! # Format
//!
//! ```text
//! # comment lines start at column zero
//! id: disk/detect
//! plugin: resource
//! command:
//!  udevadm info --export-db
//!  .
//!  echo done
//!
//! id: disk/read
//! ```
//!
//! - Blank lines separate records.
//! - Lines starting with whitespace continue the value of the previous key.
//!   A continuation line consisting of a single `.` stands for an empty line.
//! - A key may appear only once per record.

use std::collections::BTreeMap;

/// Result type for record parsing.
pub type Rfc822Result<T> = Result<T, Rfc822Error>;

/// Errors raised while parsing records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rfc822Error {
    /// A continuation line appeared before any key.
    #[error("line {line}: unexpected multi-line value")]
    UnexpectedContinuation { line: usize },

    /// The same key was given twice in one record.
    #[error("line {line}: duplicate key '{key}'")]
    DuplicateKey { line: usize, key: String },

    /// A non-empty line that is neither a comment, a continuation nor a `key: value` pair.
    #[error("line {line}: unexpected non-empty line")]
    UnexpectedLine { line: usize },
}

/// One parsed record with the line it started on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    /// Field values keyed by field name.
    pub fields: BTreeMap<String, String>,

    /// One-based line number of the first key of the record.
    pub line: usize,
}

impl Record {
    /// Returns the value of a field, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Accumulates one record while the parser walks the input.
#[derive(Default)]
struct Builder {
    record: Record,
    key: Option<String>,
    values: Vec<String>,
}

impl Builder {
    fn commit_value(&mut self) {
        if let Some(key) = self.key.take() {
            let value = join_value(std::mem::take(&mut self.values));
            self.record.fields.insert(key, value);
        }
    }

    fn finish(&mut self) -> Option<Record> {
        self.commit_value();
        if self.record.fields.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.record))
    }
}

/// Parses every record in `text`.
///
/// # Errors
///
/// Returns the first syntax error found; records before it are discarded.
pub fn parse_records(text: &str) -> Rfc822Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut builder = Builder::default();

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;

        if raw.trim().is_empty() {
            if let Some(record) = builder.finish() {
                records.push(record);
            }
            continue;
        }

        if raw.starts_with('#') {
            continue;
        }

        if raw.starts_with(' ') || raw.starts_with('\t') {
            if builder.key.is_none() {
                return Err(Rfc822Error::UnexpectedContinuation { line });
            }
            builder.values.push(raw.trim_end().to_string());
            continue;
        }

        let Some((key, value)) = raw.split_once(':') else {
            return Err(Rfc822Error::UnexpectedLine { line });
        };

        builder.commit_value();
        let key = key.trim().to_string();
        if builder.record.fields.contains_key(&key) {
            return Err(Rfc822Error::DuplicateKey { line, key });
        }
        if builder.record.fields.is_empty() {
            builder.record.line = line;
        }
        builder.key = Some(key);
        builder.values = vec![value.trim().to_string()];
    }

    if let Some(record) = builder.finish() {
        records.push(record);
    }

    Ok(records)
}

/// Joins the first value line and its continuation lines, removing the
/// common indentation of the continuation lines.
fn join_value(values: Vec<String>) -> String {
    let mut iter = values.into_iter();
    let first = iter.next().unwrap_or_default();
    let rest: Vec<String> = iter.collect();

    let indent = rest
        .iter()
        .filter(|l| !l.trim().is_empty() && l.trim() != ".")
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut lines = Vec::with_capacity(rest.len() + 1);
    if !first.is_empty() {
        lines.push(first);
    }
    for line in rest {
        if line.trim() == "." {
            lines.push(String::new());
        } else {
            lines.push(line.get(indent..).unwrap_or("").to_string());
        }
    }

    lines.join("\n").trim_end().to_string()
}
