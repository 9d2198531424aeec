//! Relay Ingest Library
//!
//! Streams zip archives from HTTP, FTP or object storage and routes their
//! entries into S3 buckets, decoding nested archives in place.
//!
//! Keys follow `<YYYYMMDD>/<feed>/<entry path>`; an entry inside a nested
//! archive gets the nested archive's name (without `.zip`) as an extra path
//! segment unless nesting is flattened.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_ingest::{
//!     DestinationMap, HttpSource, IngestionRunner, MemoryBlobStore, Orchestrator,
//!     RouteContext, RoutingPolicy, SinkConfig, UploadSink,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let sink = UploadSink::new(Arc::new(MemoryBlobStore::new()), SinkConfig::default())?;
//!     let policy = RoutingPolicy::new(DestinationMap::new("xml-bucket"));
//!     let runner = IngestionRunner::new(
//!         Orchestrator::new(policy, sink),
//!         RouteContext::root("20240101", "bods"),
//!     );
//!
//!     let source = HttpSource::new(
//!         vec!["https://data.example.com/bulk.zip".to_string()],
//!         std::time::Duration::from_secs(30),
//!     )?;
//!     let report = runner.run(&source).await?;
//!     println!("{} objects uploaded", report.totals.uploads_completed);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod archive;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod routing;
pub mod runner;
pub mod sink;
pub mod sources;
pub mod storage;

pub use archive::{ArchiveEntry, EntryKind, EntryReader};
pub use config::RelayConfig;
pub use error::{IngestError, Result};
pub use orchestrator::{IngestStats, Orchestrator};
pub use routing::{
    ArchiveMode, Destination, DestinationMap, RouteContext, RoutingDecision, RoutingPolicy,
};
pub use runner::{IngestionRunner, RunReport, SourceReport};
pub use sink::{BlobStore, MemoryBlobStore, SinkConfig, UploadReceipt, UploadSink};
pub use sources::{
    AcquiredSource, FtpSource, HttpSource, ObjectRef, ObjectSource, SourceAdapter, SourceItem,
    SourceKind, SourceStream, StorageEvent,
};
pub use storage::{S3BlobStore, S3Config};
