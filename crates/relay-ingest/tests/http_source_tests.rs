//! HTTP source tests against a local mock server
//!
//! **Running tests**:
//! ```bash
//! cargo test --test http_source_tests
//! ```

mod common;

use common::*;
use relay_ingest::{
    ArchiveMode, Destination, HttpSource, IngestError, IngestionRunner, MemoryBlobStore,
    RouteContext, SinkConfig, SourceAdapter, SourceKind,
};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn source(urls: Vec<String>) -> HttpSource {
    HttpSource::new(urls, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_open_streams_body_and_names_archive() {
    let server = MockServer::start().await;
    let archive = build_zip(&[("a.xml", b"<a/>")]);

    Mock::given(method("GET"))
        .and(path("/download"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", "attachment; filename=\"bods_bulk.zip\"")
                .set_body_bytes(archive.clone()),
        )
        .mount(&server)
        .await;

    let source = source(vec![format!("{}/download", server.uri())]);
    let items = source.discover().await.unwrap();
    assert_eq!(items.len(), 1);

    let mut acquired = source.open(&items[0]).await.unwrap();
    assert_eq!(acquired.name, "bods_bulk.zip");
    assert_eq!(acquired.kind, SourceKind::Archive);
    assert!(acquired.buffered.is_none());

    let mut body = Vec::new();
    acquired.body.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, archive);
}

#[tokio::test]
async fn test_error_status_fails_before_ingestion() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing.zip"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let source = source(vec![format!("{}/missing.zip", server.uri())]);
    let items = source.discover().await.unwrap();
    let err = source.open(&items[0]).await.unwrap_err();

    assert!(matches!(err, IngestError::Source(ref msg) if msg.contains("404")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_ingests_every_url() {
    init_tracing();
    let server = MockServer::start().await;

    for (route, entry) in [("/bulk.zip", "bulk.xml"), ("/coach.zip", "coach.xml")] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(build_zip(&[(entry, b"<x/>")])))
            .expect(1)
            .mount(&server)
            .await;
    }

    let store = MemoryBlobStore::new();
    let runner = IngestionRunner::new(
        orchestrator(&store, policy(ArchiveMode::Extract), SinkConfig::default()),
        RouteContext::root(DATE, "bods"),
    );
    let source = source(vec![
        format!("{}/bulk.zip", server.uri()),
        format!("{}/coach.zip", server.uri()),
    ]);

    let report = runner.run(&source).await.unwrap();

    assert_eq!(report.sources.len(), 2);
    assert_eq!(report.key_prefix, "20240101/bods/");
    assert_eq!(report.totals.uploads_completed, 2);
    assert_eq!(
        store.destinations().await,
        vec![
            Destination::new(XML_BUCKET, "20240101/bods/bulk.xml"),
            Destination::new(XML_BUCKET, "20240101/bods/coach.xml"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_stops_at_first_failed_url() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/gone.zip"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/never.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(build_zip(&[("n.xml", b"<n/>")])))
        .expect(0)
        .mount(&server)
        .await;

    let store = MemoryBlobStore::new();
    let runner = IngestionRunner::new(
        orchestrator(&store, policy(ArchiveMode::Extract), SinkConfig::default()),
        RouteContext::root(DATE, FEED),
    );
    let source = source(vec![
        format!("{}/gone.zip", server.uri()),
        format!("{}/never.zip", server.uri()),
    ]);

    let err = runner.run(&source).await.unwrap_err();

    assert!(matches!(err, IngestError::Source(_)));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_unnamed_download_is_treated_as_archive() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/timetable/bulk_archive"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(build_zip(&[("a.xml", b"<a/>")])))
        .mount(&server)
        .await;

    let source = source(vec![format!("{}/timetable/bulk_archive", server.uri())]);
    let items = source.discover().await.unwrap();
    let acquired = source.open(&items[0]).await.unwrap();

    assert_eq!(acquired.name, "bulk_archive");
    assert_eq!(acquired.kind, SourceKind::Archive);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_zip_attachment_is_stored_verbatim() {
    let server = MockServer::start().await;
    let document = xml_payload("NaPTAN", 20 * 1024);

    Mock::given(method("GET"))
        .and(path("/naptan/export"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", "attachment; filename=\"NaPTAN.xml\"")
                .set_body_bytes(document.clone()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = MemoryBlobStore::new();
    let runner = IngestionRunner::new(
        orchestrator(&store, policy(ArchiveMode::Extract), small_parts(2)),
        RouteContext::root(DATE, "naptan"),
    );
    let source = source(vec![format!("{}/naptan/export", server.uri())]);

    let report = runner.run(&source).await.unwrap();

    let destination = Destination::new(XML_BUCKET, "20240101/naptan/NaPTAN.xml");
    assert_eq!(store.destinations().await, vec![destination.clone()]);
    let stored = store.get(&destination).await.unwrap();
    assert_eq!(stored.data, document);
    assert_eq!(stored.content_type, "application/xml");
    assert!(stored.parts > 1);

    assert_eq!(report.totals.uploads_completed, 1);
    assert_eq!(report.totals.bytes_uploaded, document.len() as u64);
    assert_eq!(report.totals.entries_seen, 0);
    assert_eq!(report.sources[0].name, "NaPTAN.xml");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_zip_attachment_takes_target_entry_name() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/stops"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", "attachment; filename=Stops_20240101.xml")
                .set_body_bytes(b"<stops/>".to_vec()),
        )
        .mount(&server)
        .await;

    let store = MemoryBlobStore::new();
    let policy = policy(ArchiveMode::Extract).with_target_entry(Some("Stops.xml".to_string()));
    let runner = IngestionRunner::new(
        orchestrator(&store, policy, SinkConfig::default()),
        RouteContext::root(DATE, FEED),
    );
    let source = source(vec![format!("{}/stops", server.uri())]);

    runner.run(&source).await.unwrap();

    assert_eq!(
        store.destinations().await,
        vec![Destination::new(XML_BUCKET, "20240101/feed/Stops.xml")]
    );
}

#[test]
fn test_source_needs_urls() {
    let result = HttpSource::new(Vec::new(), Duration::from_secs(1));
    assert!(matches!(result, Err(IngestError::Configuration(_))));
}
