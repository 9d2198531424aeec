//! Upload sink
//!
//! Every upload runs as its own task on the tokio runtime and receives its
//! body as parts through a bounded channel, so the first part is on the wire
//! while the entry is still being decoded. The decode side is synchronous:
//! it writes into a [`BodyWriter`] from a blocking thread and keeps the
//! returned [`UploadHandle`] to await later.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use relay_common::checksum::Checksum;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{IngestError, Result};
use crate::routing::Destination;
use crate::sources::SourceStream;

pub mod memory;

pub use memory::MemoryBlobStore;

pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_MAX_IN_FLIGHT_UPLOADS: usize = 16;
/// Parts buffered between the decoder and one upload task
pub const DEFAULT_CHANNEL_DEPTH: usize = 2;

/// Destination storage
///
/// Implementations pull parts until `next_part` yields `None`; a part error
/// means the producer gave up and the object must not be committed.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_stream(
        &self,
        destination: &Destination,
        content_type: &str,
        parts: &mut PartStream,
    ) -> Result<()>;

    /// Stream an existing object
    async fn get_stream(&self, bucket: &str, key: &str) -> Result<SourceStream>;
}

#[derive(Debug)]
enum BodyChunk {
    Part(Bytes),
    End,
}

enum PartSource {
    Channel(mpsc::Receiver<BodyChunk>),
    Buffered(VecDeque<Bytes>),
    Reader { body: SourceStream, part_size: usize },
}

/// Ordered parts of one object body
pub struct PartStream {
    source: PartSource,
    checksum: Checksum,
    parts: usize,
    complete: bool,
}

impl PartStream {
    fn channel(rx: mpsc::Receiver<BodyChunk>) -> Self {
        Self::with_source(PartSource::Channel(rx))
    }

    /// Parts for a body that is already in memory
    pub fn from_bytes(data: Bytes, part_size: usize) -> Self {
        let part_size = part_size.max(1);
        let mut remaining = data;
        let mut parts = VecDeque::new();
        while remaining.len() > part_size {
            parts.push_back(remaining.split_to(part_size));
        }
        if !remaining.is_empty() {
            parts.push_back(remaining);
        }
        Self::with_source(PartSource::Buffered(parts))
    }

    /// Parts cut from an async body as it arrives
    pub fn from_reader(body: SourceStream, part_size: usize) -> Self {
        Self::with_source(PartSource::Reader {
            body,
            part_size: part_size.max(1),
        })
    }

    fn with_source(source: PartSource) -> Self {
        Self {
            source,
            checksum: Checksum::new(),
            parts: 0,
            complete: false,
        }
    }

    /// Next part, `Ok(None)` once the body is closed
    ///
    /// Fails with `BrokenPipe` if the producer dropped the body without
    /// finishing it.
    pub async fn next_part(&mut self) -> io::Result<Option<Bytes>> {
        if self.complete {
            return Ok(None);
        }

        let next = match &mut self.source {
            PartSource::Channel(rx) => match rx.recv().await {
                Some(BodyChunk::Part(part)) => Some(part),
                Some(BodyChunk::End) => None,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "body abandoned before completion",
                    ));
                },
            },
            PartSource::Buffered(parts) => parts.pop_front(),
            PartSource::Reader { body, part_size } => {
                let mut part = BytesMut::with_capacity(*part_size);
                while part.len() < *part_size {
                    let wanted = (*part_size - part.len()) as u64;
                    if (&mut *body).take(wanted).read_buf(&mut part).await? == 0 {
                        break;
                    }
                }
                if part.is_empty() {
                    None
                } else {
                    Some(part.freeze())
                }
            },
        };

        match next {
            Some(part) => {
                self.checksum.update(&part);
                self.parts += 1;
                Ok(Some(part))
            },
            None => {
                self.complete = true;
                Ok(None)
            },
        }
    }

    /// Parts handed out so far
    pub fn parts(&self) -> usize {
        self.parts
    }

    pub fn bytes(&self) -> u64 {
        self.checksum.bytes()
    }

    fn into_receipt(self, destination: &Destination) -> Result<UploadReceipt> {
        if !self.complete {
            return Err(IngestError::upload(
                destination,
                "store returned before the body was fully consumed",
            ));
        }
        Ok(UploadReceipt {
            bucket: destination.bucket.clone(),
            key: destination.key.clone(),
            bytes: self.checksum.bytes(),
            sha256: self.checksum.finalize_hex(),
        })
    }
}

/// Proof of a committed object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub bucket: String,
    pub key: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Synchronous writer feeding one upload task
///
/// Buffers up to one part before handing it to the task; blocks while the
/// channel is full. Must be used from a blocking thread, never from async code.
pub struct BodyWriter {
    tx: Option<mpsc::Sender<BodyChunk>>,
    buffer: BytesMut,
    part_size: usize,
    destination: Destination,
}

impl BodyWriter {
    fn new(tx: mpsc::Sender<BodyChunk>, part_size: usize, destination: Destination) -> Self {
        Self {
            tx: Some(tx),
            buffer: BytesMut::with_capacity(part_size),
            part_size,
            destination,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    fn send(&mut self, chunk: BodyChunk) -> io::Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "body already closed"));
        };
        tx.blocking_send(chunk).map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("upload to {} stopped accepting data", self.destination),
            )
        })
    }

    /// Send the buffered tail and close the body
    pub fn finish(mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let tail = self.buffer.split().freeze();
            self.send(BodyChunk::Part(tail))?;
        }
        self.send(BodyChunk::End)?;
        self.tx = None;
        Ok(())
    }
}

impl Write for BodyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.part_size - self.buffer.len();
        let n = room.min(buf.len());
        self.buffer.extend_from_slice(&buf[..n]);
        if self.buffer.len() >= self.part_size {
            let part = self.buffer.split().freeze();
            self.send(BodyChunk::Part(part))?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Awaitable completion of one upload
pub struct UploadHandle {
    destination: Destination,
    task: JoinHandle<Result<UploadReceipt>>,
}

impl UploadHandle {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub async fn wait(self) -> Result<UploadReceipt> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(IngestError::upload(
                &self.destination,
                format!("upload task failed: {}", e),
            )),
        }
    }
}

impl std::fmt::Debug for UploadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadHandle")
            .field("destination", &self.destination)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub part_size: usize,
    pub max_in_flight_uploads: usize,
    pub channel_depth: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            max_in_flight_uploads: DEFAULT_MAX_IN_FLIGHT_UPLOADS,
            channel_depth: DEFAULT_CHANNEL_DEPTH,
        }
    }
}

impl SinkConfig {
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn with_max_in_flight_uploads(mut self, limit: usize) -> Self {
        self.max_in_flight_uploads = limit;
        self
    }
}

/// Starts uploads against a [`BlobStore`] with bounded fan-out
#[derive(Clone)]
pub struct UploadSink {
    store: Arc<dyn BlobStore>,
    runtime: Handle,
    permits: Arc<Semaphore>,
    config: SinkConfig,
}

impl UploadSink {
    /// Create a sink bound to the current tokio runtime
    pub fn new(store: Arc<dyn BlobStore>, config: SinkConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            IngestError::config("upload sink must be created inside a tokio runtime")
        })?;
        Self::with_runtime(store, config, runtime)
    }

    pub fn with_runtime(store: Arc<dyn BlobStore>, config: SinkConfig, runtime: Handle) -> Result<Self> {
        if config.part_size == 0 {
            return Err(IngestError::config("part size must be greater than zero"));
        }
        if config.max_in_flight_uploads == 0 {
            return Err(IngestError::config("max in-flight uploads must be at least 1"));
        }

        Ok(Self {
            store,
            runtime,
            permits: Arc::new(Semaphore::new(config.max_in_flight_uploads)),
            config: SinkConfig {
                channel_depth: config.channel_depth.max(1),
                ..config
            },
        })
    }

    /// Permits not currently held by an upload
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Start a streamed upload, waiting for an in-flight slot first
    ///
    /// Blocking: call from the decode thread only.
    pub fn start_upload(
        &self,
        destination: Destination,
        content_type: &str,
    ) -> Result<(BodyWriter, UploadHandle)> {
        let permit = self
            .runtime
            .block_on(self.permits.clone().acquire_owned())
            .map_err(|_| IngestError::upload(&destination, "upload limiter closed"))?;
        Ok(self.spawn_streamed(destination, content_type, Some(permit)))
    }

    /// Start a streamed upload outside the in-flight limit
    ///
    /// For bodies whose bytes are produced by another decode in progress
    /// (a verbatim copy of a nested archive). Taking a permit there could
    /// starve the nested uploads that must drain before the copy finishes.
    pub fn start_passthrough_upload(
        &self,
        destination: Destination,
        content_type: &str,
    ) -> (BodyWriter, UploadHandle) {
        self.spawn_streamed(destination, content_type, None)
    }

    fn spawn_streamed(
        &self,
        destination: Destination,
        content_type: &str,
        permit: Option<OwnedSemaphorePermit>,
    ) -> (BodyWriter, UploadHandle) {
        let (tx, rx) = mpsc::channel(self.config.channel_depth);
        let handle = self.spawn(destination.clone(), content_type, PartStream::channel(rx), permit);
        let writer = BodyWriter::new(tx, self.config.part_size, destination);
        (writer, handle)
    }

    /// Upload a body already held in memory
    pub async fn upload_bytes(
        &self,
        destination: Destination,
        content_type: &str,
        data: Bytes,
    ) -> Result<UploadHandle> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IngestError::upload(&destination, "upload limiter closed"))?;
        let parts = PartStream::from_bytes(data, self.config.part_size);
        Ok(self.spawn(destination, content_type, parts, Some(permit)))
    }

    /// Upload a body straight from an async source, one part at a time
    pub async fn upload_stream(
        &self,
        destination: Destination,
        content_type: &str,
        body: SourceStream,
    ) -> Result<UploadHandle> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IngestError::upload(&destination, "upload limiter closed"))?;
        let parts = PartStream::from_reader(body, self.config.part_size);
        Ok(self.spawn(destination, content_type, parts, Some(permit)))
    }

    fn spawn(
        &self,
        destination: Destination,
        content_type: &str,
        mut parts: PartStream,
        permit: Option<OwnedSemaphorePermit>,
    ) -> UploadHandle {
        let store = Arc::clone(&self.store);
        let content_type = content_type.to_string();
        let target = destination.clone();

        debug!(destination = %destination, %content_type, "Starting upload");
        let task = self.runtime.spawn(async move {
            let _permit = permit;
            put(store.as_ref(), &target, &content_type, &mut parts).await?;
            parts.into_receipt(&target)
        });

        UploadHandle { destination, task }
    }

    /// Run a future to completion from the decode thread
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

#[instrument(skip(store, destination, parts), fields(destination = %destination))]
async fn put(
    store: &dyn BlobStore,
    destination: &Destination,
    content_type: &str,
    parts: &mut PartStream,
) -> Result<()> {
    match store.put_stream(destination, content_type, parts).await {
        Ok(()) => {
            info!(bytes = parts.bytes(), parts = parts.parts(), "Upload complete");
            Ok(())
        },
        Err(e) => {
            warn!(error = %e, "Upload failed");
            Err(e)
        },
    }
}
