//! Feed download over HTTP.

use futures::TryStreamExt;
use mockito::Server;
use threatintel_core::{
    FeedJobError,
    config::FetchConfig,
    feed::{FeedFetcher, FeedFormat, FeedMetadata},
};
use url::Url;

fn feed(server: &mockito::ServerGuard, path: &str) -> FeedMetadata {
    FeedMetadata::delimited("feed-x", Url::parse(&format!("{}{path}", server.url())).unwrap())
}

#[tokio::test]
async fn streams_rows_after_header() {
    //* Given
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/feed.csv")
        .with_status(200)
        .with_header("content-type", "text/csv")
        .with_body("# abuse feed\n# updated daily\nip,tag\n1.2.3.4,bad\n5.6.7.8,\"c2, botnet\"\n")
        .create_async()
        .await;
    let fetcher = FeedFetcher::new(&FetchConfig::default()).unwrap();

    //* When
    let reader = fetcher.open(&feed(&server, "/feed.csv")).await.unwrap();
    let (fields, rows) = reader.into_parts();
    let rows: Vec<_> = rows.try_collect().await.unwrap();

    //* Then
    mock.assert_async().await;
    assert_eq!(fields, vec!["ip", "tag"]);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].fields, vec!["5.6.7.8", "c2, botnet"]);
}

#[tokio::test]
async fn http_error_status_is_a_fetch_error() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/gone.csv")
        .with_status(404)
        .create_async()
        .await;
    let fetcher = FeedFetcher::new(&FetchConfig::default()).unwrap();

    let err = fetcher.open(&feed(&server, "/gone.csv")).await.unwrap_err();
    assert!(matches!(err, FeedJobError::Fetch(_)), "{err}");
}

#[tokio::test]
async fn tab_delimited_feed_without_header() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/tor.tsv")
        .with_status(200)
        .with_body("185.220.101.1\texit\n185.220.101.2\texit\n")
        .create_async()
        .await;
    let mut metadata = feed(&server, "/tor.tsv");
    metadata.has_header = false;
    metadata.format = FeedFormat::DelimitedText { delimiter: '\t' };

    let fetcher = FeedFetcher::new(&FetchConfig::default()).unwrap();
    let reader = fetcher.open(&metadata).await.unwrap();
    assert_eq!(reader.fields(), ["column_0", "column_1"]);
    let (_, rows) = reader.into_parts();
    let values: Vec<String> = rows
        .map_ok(|row| row.fields[0].clone())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(values, vec!["185.220.101.1", "185.220.101.2"]);
}
