//! In-memory blob store for tests and dry runs

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{BlobStore, PartStream};
use crate::error::{IngestError, Result};
use crate::routing::Destination;
use crate::sources::SourceStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub content_type: String,
    pub data: Bytes,
    /// Parts the body arrived in
    pub parts: usize,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    writes: AtomicUsize,
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Objects keyed by bucket and key; a later write to a key replaces it
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<RwLock<HashMap<Destination, StoredObject>>>,
    counters: Arc<Counters>,
    failing_keys: Vec<String>,
    latency: Option<Duration>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes whose key contains `fragment`
    pub fn failing_on(mut self, fragment: impl Into<String>) -> Self {
        self.failing_keys.push(fragment.into());
        self
    }

    /// Sleep this long per part, to keep uploads in flight
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub async fn get(&self, destination: &Destination) -> Option<StoredObject> {
        self.objects.read().await.get(destination).cloned()
    }

    /// Every stored location, sorted
    pub async fn destinations(&self) -> Vec<Destination> {
        let mut all: Vec<_> = self.objects.read().await.keys().cloned().collect();
        all.sort();
        all
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn insert(&self, destination: Destination, content_type: &str, data: Bytes) {
        let object = StoredObject {
            content_type: content_type.to_string(),
            data,
            parts: 1,
        };
        self.objects.write().await.insert(destination, object);
    }

    /// Highest number of concurrent `put_stream` calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Committed writes, overwrites included
    pub fn write_count(&self) -> usize {
        self.counters.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_stream(
        &self,
        destination: &Destination,
        content_type: &str,
        parts: &mut PartStream,
    ) -> Result<()> {
        let _in_flight = InFlight::enter(&self.counters);

        if self.failing_keys.iter().any(|f| destination.key.contains(f.as_str())) {
            return Err(IngestError::upload(destination, "injected failure"));
        }

        let mut body = BytesMut::new();
        while let Some(part) = parts
            .next_part()
            .await
            .map_err(|e| IngestError::upload(destination, e))?
        {
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            body.extend_from_slice(&part);
        }

        let object = StoredObject {
            content_type: content_type.to_string(),
            data: body.freeze(),
            parts: parts.parts(),
        };
        self.objects.write().await.insert(destination.clone(), object);
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> Result<SourceStream> {
        let destination = Destination::new(bucket, key);
        let object = self
            .get(&destination)
            .await
            .ok_or_else(|| IngestError::Source(format!("object not found: {}", destination)))?;
        Ok(Box::new(Cursor::new(object.data)))
    }
}
