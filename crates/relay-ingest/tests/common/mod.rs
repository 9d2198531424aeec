//! Shared helpers for relay-ingest integration tests
//!
//! Archives are built in memory with the `zip` writer; uploads land in a
//! [`MemoryBlobStore`] so every test can inspect exactly what was written.

#![allow(dead_code)]

use relay_ingest::{
    ArchiveMode, BlobStore, DestinationMap, MemoryBlobStore, Orchestrator, RoutingPolicy,
    SinkConfig, UploadSink,
};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};
use std::io::{Cursor, Write};
use std::sync::Arc;
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

pub const XML_BUCKET: &str = "xml-bucket";
pub const ARCHIVE_BUCKET: &str = "archive-bucket";
pub const DATE: &str = "20240101";
pub const FEED: &str = "feed";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,relay_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Build a zip from `(path, contents)` pairs; paths ending in `/` become directories
pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    build_zip_with(entries, CompressionMethod::Deflated)
}

pub fn build_zip_with(entries: &[(&str, &[u8])], method: CompressionMethod) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(method);

    for (path, contents) in entries {
        if path.ends_with('/') {
            writer.add_directory(*path, options).unwrap();
        } else {
            writer.start_file(*path, options).unwrap();
            writer.write_all(contents).unwrap();
        }
    }

    writer.finish().unwrap().into_inner()
}

/// Build a zip the way single-pass writers do: every entry deflated, its
/// CRC and sizes in a data descriptor after the payload, no central directory
pub fn build_streamed_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();

    for (path, contents) in entries {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(contents).unwrap();
        let compressed = encoder.finish().unwrap();
        let mut crc = Crc::new();
        crc.update(contents);

        out.extend_from_slice(b"PK\x03\x04");
        out.extend_from_slice(&20u16.to_le_bytes()); // version needed
        out.extend_from_slice(&0x0008u16.to_le_bytes()); // data descriptor follows
        out.extend_from_slice(&8u16.to_le_bytes()); // deflate
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&(path.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(path.as_bytes());
        out.extend_from_slice(&compressed);

        out.extend_from_slice(b"PK\x07\x08");
        out.extend_from_slice(&crc.sum().to_le_bytes());
        out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        out.extend_from_slice(&(contents.len() as u32).to_le_bytes());
    }

    out.extend_from_slice(b"PK\x05\x06");
    out.extend_from_slice(&[0u8; 18]);
    out
}

/// Deterministic XML payload of roughly `len` bytes
pub fn xml_payload(tag: &str, len: usize) -> Vec<u8> {
    let mut body = format!("<{}>", tag).into_bytes();
    let mut i = 0usize;
    while body.len() + tag.len() + 3 < len {
        body.extend_from_slice(format!("<v>{}</v>", i % 997).as_bytes());
        i += 1;
    }
    body.extend_from_slice(format!("</{}>", tag).as_bytes());
    body
}

pub fn destinations() -> DestinationMap {
    DestinationMap::new(XML_BUCKET).with_zipped_bundles(ARCHIVE_BUCKET)
}

pub fn policy(mode: ArchiveMode) -> RoutingPolicy {
    RoutingPolicy::new(destinations()).with_mode(mode)
}

/// Orchestrator writing into `store`; call from inside a tokio runtime
pub fn orchestrator(store: &MemoryBlobStore, policy: RoutingPolicy, sink: SinkConfig) -> Orchestrator {
    let store: Arc<dyn BlobStore> = Arc::new(store.clone());
    Orchestrator::new(policy, UploadSink::new(store, sink).unwrap())
}

/// Small parts so multipart behaviour shows up in tests
pub fn small_parts(limit: usize) -> SinkConfig {
    SinkConfig::default()
        .with_part_size(1024)
        .with_max_in_flight_uploads(limit)
}
