use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use futures::{Stream, TryStreamExt};
use reqwest::Client;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio_util::io::StreamReader;
use tracing::{debug, trace};

use super::parser::{FeedParser, is_ignorable, is_preamble};
use super::FeedMetadata;
use crate::config::FetchConfig;
use crate::error::{FeedJobError, Result};

/// One parsed data line, fields in header order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndicatorRow {
    pub fields: Vec<String>,
}

impl IndicatorRow {
    /// The indicator cell, `None` when the row is too short or the cell blank.
    pub fn indicator(&self, column: usize) -> Option<&str> {
        self.fields
            .get(column)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }
}

pub type RowStream = Pin<Box<dyn Stream<Item = Result<IndicatorRow>> + Send>>;

/// An open feed download: the header has been read, rows are pulled lazily
/// from the live connection and cannot be replayed.
pub struct FeedReader {
    fields: Vec<String>,
    rows: RowStream,
}

impl fmt::Debug for FeedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedReader")
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

impl FeedReader {
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn into_parts(self) -> (Vec<String>, RowStream) {
        (self.fields, self.rows)
    }
}

/// Downloads feeds over HTTP(S).
#[derive(Clone, Debug)]
pub struct FeedFetcher {
    client: Client,
}

impl FeedFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Starts the download and reads up to and including the header.
    pub async fn open(&self, feed: &FeedMetadata) -> Result<FeedReader> {
        debug!(feed_id = %feed.feed_id, url = %feed.url, "opening feed");
        let response = self
            .client
            .get(feed.url.clone())
            .send()
            .await?
            .error_for_status()?;

        let bytes = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
        let lines = StreamReader::new(bytes).lines();
        read_feed(lines, feed).await
    }
}

async fn read_feed<R>(mut lines: Lines<R>, feed: &FeedMetadata) -> Result<FeedReader>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let parser: Arc<dyn FeedParser> = Arc::from(feed.format.parser()?);

    let first = loop {
        match lines.next_line().await.map_err(read_error)? {
            Some(line) if is_preamble(&line) => trace!(line = %line, "skipping feed preamble"),
            Some(line) => break line,
            None => {
                return Err(FeedJobError::Parse(format!(
                    "feed {} has no header or data",
                    feed.feed_id
                )));
            }
        }
    };

    let first_fields = parser.parse_line(&first)?;
    if first_fields.iter().all(String::is_empty) {
        return Err(FeedJobError::Parse(format!(
            "feed {} has an empty header",
            feed.feed_id
        )));
    }

    let (fields, pending) = if feed.has_header {
        (first_fields, None)
    } else {
        let synthesized = (0..first_fields.len()).map(|i| format!("column_{i}")).collect();
        (synthesized, Some(IndicatorRow { fields: first_fields }))
    };

    if feed.indicator_column >= fields.len() {
        return Err(FeedJobError::Parse(format!(
            "feed {} has {} columns, indicator column is {}",
            feed.feed_id,
            fields.len(),
            feed.indicator_column
        )));
    }

    Ok(FeedReader {
        fields,
        rows: Box::pin(rows(lines, pending, parser)),
    })
}

fn rows<R>(
    mut lines: Lines<R>,
    pending: Option<IndicatorRow>,
    parser: Arc<dyn FeedParser>,
) -> impl Stream<Item = Result<IndicatorRow>> + Send + 'static
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    try_stream! {
        if let Some(row) = pending {
            yield row;
        }
        while let Some(line) = lines.next_line().await.map_err(read_error)? {
            if is_ignorable(&line) {
                continue;
            }
            let fields = parser.parse_line(&line)?;
            yield IndicatorRow { fields };
        }
    }
}

fn read_error(err: std::io::Error) -> FeedJobError {
    FeedJobError::Fetch(format!("reading feed body: {err}"))
}
