use std::fmt;

use csv::{ReaderBuilder, StringRecord};

use crate::error::{FeedJobError, Result};

/// Splits one feed line into trimmed fields.
pub trait FeedParser: Send + Sync + fmt::Debug {
    fn parse_line(&self, line: &str) -> Result<Vec<String>>;
}

/// Quote-aware delimited text (CSV, TSV, ...).
///
/// Feeds are read one line at a time, so a record must fit on a single line.
/// A quoted field spanning a line break leaves its quotes unbalanced and is
/// rejected as a parse error instead of being split into two rows.
#[derive(Debug, Clone, Copy)]
pub struct DelimitedTextParser {
    delimiter: u8,
}

impl DelimitedTextParser {
    pub fn new(delimiter: char) -> Result<Self> {
        if !delimiter.is_ascii() || delimiter == '"' || delimiter == '\n' {
            return Err(FeedJobError::Validation(format!(
                "unsupported feed delimiter {delimiter:?}"
            )));
        }
        Ok(Self {
            delimiter: delimiter as u8,
        })
    }
}

impl FeedParser for DelimitedTextParser {
    fn parse_line(&self, line: &str) -> Result<Vec<String>> {
        if line.bytes().filter(|b| *b == b'"').count() % 2 == 1 {
            return Err(FeedJobError::Parse(format!(
                "unterminated quoted field in line {line:?}"
            )));
        }
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(line.as_bytes());

        let mut record = StringRecord::new();
        if !reader.read_record(&mut record)? {
            return Ok(Vec::new());
        }
        Ok(record.iter().map(|field| field.trim().to_string()).collect())
    }
}

/// Lines that precede the header: comments and anything starting with
/// whitespace (including blank lines).
pub(crate) fn is_preamble(line: &str) -> bool {
    line.is_empty() || line.starts_with('#') || line.starts_with(char::is_whitespace)
}

/// Lines skipped between data rows.
pub(crate) fn is_ignorable(line: &str) -> bool {
    line.trim().is_empty() || line.starts_with('#')
}
