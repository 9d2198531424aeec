//! S3 blob store integration tests
//!
//! **Requirements**:
//! - MinIO or S3 must be running and accessible
//! - S3_ENDPOINT environment variable must be set (e.g., "http://localhost:9000")
//! - TEST_BUCKET must name an existing bucket (defaults to "relay-test")
//! - Tests will be skipped if S3_ENDPOINT is not configured
//!
//! **Running tests**:
//! ```bash
//! cargo test --test s3_storage_tests
//! ```

use bytes::Bytes;
use relay_common::checksum::sha256_hex;
use relay_ingest::sink::PartStream;
use relay_ingest::{BlobStore, Destination, S3BlobStore, S3Config};
use tokio::io::AsyncReadExt;
use uuid::Uuid;

/// Setup helper that creates a store if MinIO is available
async fn setup_store() -> Option<(S3BlobStore, String)> {
    if std::env::var("S3_ENDPOINT").is_err() {
        return None;
    }

    let config = match S3Config::from_env() {
        Ok(cfg) => cfg,
        Err(_) => return None,
    };

    match S3BlobStore::new(config).await {
        Ok(store) => Some((store, std::env::var("TEST_BUCKET").unwrap_or_else(|_| "relay-test".to_string()))),
        Err(e) => {
            eprintln!("Failed to create S3 client: {}", e);
            None
        },
    }
}

fn test_key(test_name: &str, suffix: &str) -> String {
    format!("test/{}/{}/{}", test_name, Uuid::new_v4(), suffix)
}

async fn read_back(store: &S3BlobStore, bucket: &str, key: &str) -> Vec<u8> {
    let mut body = Vec::new();
    store
        .get_stream(bucket, key)
        .await
        .unwrap()
        .read_to_end(&mut body)
        .await
        .unwrap();
    body
}

#[tokio::test]
async fn test_single_part_put() {
    let Some((store, bucket)) = setup_store().await else {
        println!("Skipping test: S3_ENDPOINT not configured");
        return;
    };

    let destination = Destination::new(&bucket, test_key("single", "a.xml"));
    let mut parts = PartStream::from_bytes(Bytes::from_static(b"<a/>"), 5 * 1024 * 1024);
    store.put_stream(&destination, "application/xml", &mut parts).await.unwrap();

    assert_eq!(read_back(&store, &bucket, &destination.key).await, b"<a/>");
}

#[tokio::test]
async fn test_empty_put() {
    let Some((store, bucket)) = setup_store().await else {
        println!("Skipping test: S3_ENDPOINT not configured");
        return;
    };

    let destination = Destination::new(&bucket, test_key("empty", "empty.xml"));
    let mut parts = PartStream::from_bytes(Bytes::new(), 5 * 1024 * 1024);
    store.put_stream(&destination, "application/xml", &mut parts).await.unwrap();

    assert!(read_back(&store, &bucket, &destination.key).await.is_empty());
}

#[tokio::test]
async fn test_multipart_put() {
    let Some((store, bucket)) = setup_store().await else {
        println!("Skipping test: S3_ENDPOINT not configured");
        return;
    };

    // Three parts; S3 needs every part but the last to be at least 5 MiB
    let part_size = 5 * 1024 * 1024;
    let data: Vec<u8> = (0..(part_size * 2 + 1234)).map(|i| (i % 251) as u8).collect();
    let destination = Destination::new(&bucket, test_key("multipart", "big.zip"));
    let mut parts = PartStream::from_bytes(Bytes::from(data.clone()), part_size);

    store.put_stream(&destination, "application/zip", &mut parts).await.unwrap();

    assert_eq!(parts.parts(), 3);
    let stored = read_back(&store, &bucket, &destination.key).await;
    assert_eq!(sha256_hex(&stored), sha256_hex(&data));
}

#[tokio::test]
async fn test_get_missing_object() {
    let Some((store, bucket)) = setup_store().await else {
        println!("Skipping test: S3_ENDPOINT not configured");
        return;
    };

    let result = store.get_stream(&bucket, &test_key("missing", "nothing.zip")).await;
    assert!(result.is_err());
}
