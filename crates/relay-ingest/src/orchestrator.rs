//! Recursive ingestion
//!
//! One archive level is walked strictly in order on a blocking thread:
//! every entry is routed, then either drained, copied into a freshly started
//! upload, or decoded in place as a nested archive. Uploads are not awaited
//! as they are started; each level awaits its own handles once its entries
//! are exhausted, so when a nested decode returns it has nothing left in
//! flight.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info, instrument, warn, Span};

use crate::archive::{ArchiveEntry, EntryReader};
use crate::error::{classify_read_error, IngestError, Result};
use crate::routing::{Destination, RouteContext, RoutingDecision, RoutingPolicy, ZIP_CONTENT_TYPE};
use crate::sink::{BodyWriter, UploadHandle, UploadReceipt, UploadSink};
use crate::sources::SourceStream;

/// Nested archives deeper than this fail the run
pub const DEFAULT_MAX_DEPTH: usize = 32;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Counters for one ingested archive, nested levels included
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    /// Headers read, directories included
    pub entries_seen: u64,
    pub directories_skipped: u64,
    pub entries_dropped: u64,
    pub archives_recursed: u64,
    /// Nested archives copied verbatim while being decoded
    pub archives_preserved: u64,
    pub uploads_completed: u64,
    pub bytes_uploaded: u64,
    pub receipts: Vec<UploadReceipt>,
}

impl IngestStats {
    pub fn record_upload(&mut self, receipt: UploadReceipt) {
        self.uploads_completed += 1;
        self.bytes_uploaded += receipt.bytes;
        self.receipts.push(receipt);
    }

    pub fn merge(&mut self, other: IngestStats) {
        self.entries_seen += other.entries_seen;
        self.directories_skipped += other.directories_skipped;
        self.entries_dropped += other.entries_dropped;
        self.archives_recursed += other.archives_recursed;
        self.archives_preserved += other.archives_preserved;
        self.uploads_completed += other.uploads_completed;
        self.bytes_uploaded += other.bytes_uploaded;
        self.receipts.extend(other.receipts);
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    policy: Arc<RoutingPolicy>,
    sink: UploadSink,
    max_depth: usize,
}

impl Orchestrator {
    pub fn new(policy: RoutingPolicy, sink: UploadSink) -> Self {
        Self {
            policy: Arc::new(policy),
            sink,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    pub fn sink(&self) -> &UploadSink {
        &self.sink
    }

    /// Ingest an async stream on a blocking thread
    #[instrument(skip(self, source, context), fields(prefix = %context.prefix()))]
    pub async fn ingest_stream(&self, source: SourceStream, context: RouteContext) -> Result<IngestStats> {
        let orchestrator = self.clone();
        let bridge = SyncIoBridge::new(source);
        let span = Span::current();

        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            orchestrator.ingest(bridge, &context)
        })
        .await
        .map_err(|e| IngestError::Source(format!("ingestion task failed: {}", e)))?
    }

    /// Ingest a synchronous stream
    ///
    /// Blocks on upload completion, so it must not be called from async
    /// code; use [`Orchestrator::ingest_stream`] there.
    pub fn ingest<R: Read>(&self, mut source: R, context: &RouteContext) -> Result<IngestStats> {
        let mut stats = IngestStats::default();
        self.ingest_level(&mut source, context, 0, &mut stats)?;

        info!(
            entries = stats.entries_seen,
            uploads = stats.uploads_completed,
            bytes = stats.bytes_uploaded,
            dropped = stats.entries_dropped,
            nested = stats.archives_recursed,
            "Archive ingested"
        );
        Ok(stats)
    }

    fn ingest_level(
        &self,
        source: &mut dyn Read,
        context: &RouteContext,
        depth: usize,
        stats: &mut IngestStats,
    ) -> Result<()> {
        let mut pending = Vec::new();
        let walked = self.walk(source, context, depth, stats, &mut pending);
        let settled = self.settle(pending, stats);

        match (walked, settled) {
            (Err(e), Err(upload)) => {
                warn!(error = %upload, "Upload also failed while aborting");
                Err(e)
            },
            (walked, settled) => walked.and(settled),
        }
    }

    fn walk(
        &self,
        source: &mut dyn Read,
        context: &RouteContext,
        depth: usize,
        stats: &mut IngestStats,
        pending: &mut Vec<UploadHandle>,
    ) -> Result<()> {
        let mut reader = EntryReader::new(source);

        while let Some(mut entry) = reader.next_entry()? {
            stats.entries_seen += 1;

            if entry.is_dir() {
                stats.directories_skipped += 1;
                continue;
            }

            match self.policy.route(entry.path(), context) {
                RoutingDecision::Drop => {
                    let drained = entry.drain()?;
                    debug!(path = entry.path(), drained, "Dropped entry");
                    stats.entries_dropped += 1;
                },
                RoutingDecision::Upload {
                    destination,
                    content_type,
                } => {
                    let handle = self.upload_entry(&mut entry, destination, &content_type)?;
                    pending.push(handle);
                },
                RoutingDecision::Recurse {
                    context: nested,
                    verbatim,
                } => {
                    self.recurse(&mut entry, &nested, verbatim, depth + 1, stats, pending)?;
                },
            }
        }

        debug!(depth, entries = reader.entries_read(), "Reached end of archive");
        Ok(())
    }

    fn upload_entry(
        &self,
        entry: &mut ArchiveEntry<'_>,
        destination: Destination,
        content_type: &str,
    ) -> Result<UploadHandle> {
        let (mut writer, handle) = self.sink.start_upload(destination, content_type)?;

        match pump(entry, &mut writer) {
            Ok(bytes) => debug!(path = entry.path(), bytes, "Entry streamed"),
            Err(PumpError::Read(e)) => {
                drop(writer);
                self.discard(handle);
                return Err(classify_read_error(e));
            },
            Err(PumpError::Write(e)) => {
                drop(writer);
                return Err(self.upload_failure(handle, e));
            },
        }

        if let Err(e) = writer.finish() {
            return Err(self.upload_failure(handle, e));
        }
        Ok(handle)
    }

    fn recurse(
        &self,
        entry: &mut ArchiveEntry<'_>,
        nested: &RouteContext,
        verbatim: Option<Destination>,
        depth: usize,
        stats: &mut IngestStats,
        pending: &mut Vec<UploadHandle>,
    ) -> Result<()> {
        if depth > self.max_depth {
            return Err(IngestError::Decode(format!(
                "'{}' is nested more than {} archives deep",
                entry.path(),
                self.max_depth
            )));
        }

        debug!(path = entry.path(), depth, prefix = nested.prefix(), "Descending into nested archive");
        stats.archives_recursed += 1;

        let Some(destination) = verbatim else {
            self.ingest_level(entry, nested, depth, stats)?;
            entry.drain()?;
            return Ok(());
        };

        // Single pass: the verbatim copy is fed from the bytes the nested
        // decode consumes.
        let (writer, handle) = self.sink.start_passthrough_upload(destination, ZIP_CONTENT_TYPE);
        let mut tee = TeeReader::new(entry, writer);
        let decoded = self
            .ingest_level(&mut tee, nested, depth, stats)
            .and_then(|()| tee.drain());
        let (writer, copy_failure) = tee.into_parts();

        if let Some(e) = copy_failure {
            drop(writer);
            return Err(self.upload_failure(handle, e));
        }
        if let Err(e) = decoded {
            drop(writer);
            self.discard(handle);
            return Err(e);
        }
        if let Err(e) = writer.finish() {
            return Err(self.upload_failure(handle, e));
        }

        stats.archives_preserved += 1;
        pending.push(handle);
        Ok(())
    }

    /// Await every handle started at one level; the first failure wins
    fn settle(&self, pending: Vec<UploadHandle>, stats: &mut IngestStats) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        debug!(count = pending.len(), "Awaiting uploads");
        let results = self
            .sink
            .block_on(join_all(pending.into_iter().map(UploadHandle::wait)));

        let mut first_error = None;
        for result in results {
            match result {
                Ok(receipt) => stats.record_upload(receipt),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => warn!(error = %e, "Additional upload failure"),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The upload's own error explains a failed write better than the write
    fn upload_failure(&self, handle: UploadHandle, cause: io::Error) -> IngestError {
        let destination = handle.destination().clone();
        match self.sink.block_on(handle.wait()) {
            Err(e) => e,
            Ok(_) => IngestError::upload(&destination, cause),
        }
    }

    /// Wait for an upload whose body was abandoned to wind down
    fn discard(&self, handle: UploadHandle) {
        let destination = handle.destination().clone();
        if self.sink.block_on(handle.wait()).is_ok() {
            warn!(destination = %destination, "Abandoned upload completed anyway");
        }
    }
}

#[derive(Debug)]
enum PumpError {
    Read(io::Error),
    Write(io::Error),
}

fn pump(reader: &mut dyn Read, writer: &mut dyn Write) -> std::result::Result<u64, PumpError> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PumpError::Read(e)),
        };
        writer.write_all(&buf[..n]).map_err(PumpError::Write)?;
        total += n as u64;
    }
}

/// Copies every byte read through it into a body writer
struct TeeReader<'a> {
    inner: &'a mut dyn Read,
    copy: BodyWriter,
    failed: Option<io::Error>,
}

impl<'a> TeeReader<'a> {
    fn new(inner: &'a mut dyn Read, copy: BodyWriter) -> Self {
        Self {
            inner,
            copy,
            failed: None,
        }
    }

    /// Read whatever the nested decode left behind, e.g. the central directory
    fn drain(&mut self) -> Result<()> {
        io::copy(self, &mut io::sink())
            .map(|_| ())
            .map_err(classify_read_error)
    }

    fn into_parts(self) -> (BodyWriter, Option<io::Error>) {
        (self.copy, self.failed)
    }
}

impl Read for TeeReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Err(e) = self.copy.write_all(&buf[..n]) {
                let message = format!("verbatim copy to {} failed: {}", self.copy.destination(), e);
                self.failed = Some(e);
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, message));
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "cut off"))
        }
    }

    #[test]
    fn test_pump_copies_everything() {
        let data = vec![42u8; COPY_BUFFER_SIZE * 2 + 7];
        let mut out = Vec::new();

        let copied = pump(&mut data.as_slice(), &mut out).unwrap();
        assert_eq!(copied, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_pump_separates_read_and_write_failures() {
        let err = pump(&mut &b"abc"[..], &mut FailingWriter).unwrap_err();
        assert!(matches!(err, PumpError::Write(_)));

        let err = pump(&mut FailingReader, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, PumpError::Read(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_stats_merge() {
        let mut total = IngestStats {
            entries_seen: 2,
            uploads_completed: 1,
            bytes_uploaded: 10,
            ..IngestStats::default()
        };
        total.merge(IngestStats {
            entries_seen: 3,
            entries_dropped: 1,
            uploads_completed: 2,
            bytes_uploaded: 5,
            ..IngestStats::default()
        });

        assert_eq!(total.entries_seen, 5);
        assert_eq!(total.entries_dropped, 1);
        assert_eq!(total.uploads_completed, 3);
        assert_eq!(total.bytes_uploaded, 15);
    }
}
