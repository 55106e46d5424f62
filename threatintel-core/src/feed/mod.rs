//! Remote indicator feeds: metadata, download and row parsing.

pub mod catalog;
pub mod fetch;
pub mod parser;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FeedJobError, Result};

pub use catalog::{FeedCatalog, ManifestFeedCatalog, StaticFeedCatalog};
pub use fetch::{FeedFetcher, FeedReader, IndicatorRow};
pub use parser::{DelimitedTextParser, FeedParser};

/// Wire format of a feed. Each variant maps to one parser strategy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedFormat {
    DelimitedText {
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
}

fn default_delimiter() -> char {
    ','
}

impl Default for FeedFormat {
    fn default() -> Self {
        FeedFormat::DelimitedText {
            delimiter: default_delimiter(),
        }
    }
}

impl FeedFormat {
    pub fn parser(&self) -> Result<Box<dyn FeedParser>> {
        match self {
            FeedFormat::DelimitedText { delimiter } => {
                Ok(Box::new(DelimitedTextParser::new(*delimiter)?))
            }
        }
    }
}

/// Describes one remote feed. Loaded fresh for every run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub feed_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub description: String,
    pub url: Url,
    #[serde(default)]
    pub format: FeedFormat,
    #[serde(default = "default_has_header")]
    pub has_header: bool,
    /// Column holding the indicator value. The header label is never consulted.
    #[serde(default)]
    pub indicator_column: usize,
    /// Stored as `ioc_type` on every indicator document.
    #[serde(default = "default_indicator_type")]
    pub indicator_type: String,
}

fn default_has_header() -> bool {
    true
}

fn default_indicator_type() -> String {
    "ip".to_string()
}

impl FeedMetadata {
    /// A delimited-text feed with a header row and the indicator in column 0.
    pub fn delimited(feed_id: impl Into<String>, url: Url) -> Self {
        let feed_id = feed_id.into();
        Self {
            name: feed_id.clone(),
            feed_id,
            organization: String::new(),
            description: String::new(),
            url,
            format: FeedFormat::default(),
            has_header: true,
            indicator_column: 0,
            indicator_type: default_indicator_type(),
        }
    }
}

/// A refresh may add fields but never drop one a previous generation had.
pub fn validate_header_superset(previous: &[String], current: &[String]) -> Result<()> {
    let missing: Vec<String> = previous
        .iter()
        .filter(|field| !current.contains(field))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FeedJobError::IncompatibleFields { missing })
    }
}
