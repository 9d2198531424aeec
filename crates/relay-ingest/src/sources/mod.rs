//! Source acquisition
//!
//! An adapter first lists what it is going to deliver, then opens one item at
//! a time. The orchestrator only ever sees a [`SourceStream`], whether that
//! is a live HTTP body, an S3 object body or an FTP download held in memory.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::routing::RouteContext;

pub mod ftp;
pub mod http;
pub mod object;

pub use ftp::{FtpConfig, FtpEntry, FtpSource};
pub use http::HttpSource;
pub use object::{ObjectRef, ObjectSource, StorageEvent};

/// Forward-only archive bytes
pub type SourceStream = Box<dyn AsyncRead + Send + Unpin>;

/// Something an adapter can deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    /// URL, remote file name or object key
    pub name: String,
    /// Size announced by the remote side, when known up front
    pub declared_size: Option<u64>,
}

impl SourceItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_size: None,
        }
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.declared_size = size;
        self
    }
}

/// What the bytes of an opened item are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// A zip archive to decode entry by entry
    #[default]
    Archive,
    /// A single file stored as one object without decoding
    Document,
}

/// An opened item, ready for ingestion
pub struct AcquiredSource {
    pub name: String,
    pub kind: SourceKind,
    pub body: SourceStream,
    /// Key context for the archive's entries; `None` uses `<date>/<feed>/`
    pub context: Option<RouteContext>,
    /// Whole archive, when the adapter had to buffer it anyway
    pub buffered: Option<Bytes>,
}

impl AcquiredSource {
    pub fn streaming(name: impl Into<String>, body: SourceStream) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::Archive,
            body,
            context: None,
            buffered: None,
        }
    }

    /// A downloaded file that is not an archive
    pub fn document(name: impl Into<String>, body: SourceStream) -> Self {
        Self {
            kind: SourceKind::Document,
            ..Self::streaming(name, body)
        }
    }

    pub fn buffered(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            kind: SourceKind::Archive,
            body: Box::new(std::io::Cursor::new(data.clone())),
            context: None,
            buffered: Some(data),
        }
    }

    pub fn with_context(mut self, context: RouteContext) -> Self {
        self.context = Some(context);
        self
    }
}

impl std::fmt::Debug for AcquiredSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredSource")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("context", &self.context)
            .field("buffered", &self.buffered.as_ref().map(Bytes::len))
            .finish()
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Short label for logs
    fn describe(&self) -> String;

    /// Items this run will ingest, in order
    async fn discover(&self) -> Result<Vec<SourceItem>>;

    /// Open one discovered item
    ///
    /// Transport failures and non-success statuses surface here, before any
    /// archive byte reaches the orchestrator.
    async fn open(&self, item: &SourceItem) -> Result<AcquiredSource>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_buffered_source_streams_same_bytes() {
        let mut source = AcquiredSource::buffered("EA.zip", Bytes::from_static(b"PK\x05\x06"));

        let mut body = Vec::new();
        source.body.read_to_end(&mut body).await.unwrap();

        assert_eq!(body, b"PK\x05\x06");
        assert_eq!(source.buffered.as_deref(), Some(&b"PK\x05\x06"[..]));
        assert_eq!(source.kind, SourceKind::Archive);
        assert!(source.context.is_none());
    }
}
