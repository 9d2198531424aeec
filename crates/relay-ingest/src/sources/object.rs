//! Storage-event source: one archive that landed in a bucket

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use super::{AcquiredSource, SourceAdapter, SourceItem};
use crate::error::{IngestError, Result};
use crate::routing::{RouteContext, ARCHIVE_SUFFIX};
use crate::sink::BlobStore;

/// S3 object-created notification, reduced to the fields we read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEntity {
    /// URL-encoded, with spaces as `+`
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl StorageEvent {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| IngestError::config(format!("Invalid storage event: {}", e)))
    }

    /// The object named by the first record
    pub fn first_object(&self) -> Result<ObjectRef> {
        let record = self
            .records
            .first()
            .ok_or_else(|| IngestError::config("Storage event has no records"))?;
        ObjectRef::from_encoded(&record.s3.bucket.name, &record.s3.object.key)
    }
}

/// Bucket and decoded key of one stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket_name: String,
    pub object_key: String,
}

impl ObjectRef {
    pub fn new(bucket_name: impl Into<String>, object_key: impl Into<String>) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            object_key: object_key.into(),
        }
    }

    /// Build from a key as it appears in an event notification
    pub fn from_encoded(bucket_name: &str, encoded_key: &str) -> Result<Self> {
        Ok(Self::new(bucket_name, decode_event_key(encoded_key)?))
    }
}

/// `folder/My+Feed%282%29.zip` -> `folder/My Feed(2).zip`
pub fn decode_event_key(key: &str) -> Result<String> {
    urlencoding::decode(&key.replace('+', " "))
        .map(|decoded| decoded.into_owned())
        .map_err(|e| IngestError::config(format!("Object key '{}' is not valid UTF-8: {}", key, e)))
}

/// Streams a single archive out of the blob store
///
/// Keys that do not end in `.zip` are skipped without touching the store.
/// Entries land under the archive's own key minus its extension, in the
/// extracted bucket: `uploads/feed.zip` yields `uploads/feed/<entry>`.
pub struct ObjectSource {
    store: Arc<dyn BlobStore>,
    object: ObjectRef,
}

impl ObjectSource {
    pub fn new(store: Arc<dyn BlobStore>, object: ObjectRef) -> Self {
        Self { store, object }
    }

    pub fn from_event(store: Arc<dyn BlobStore>, event: &StorageEvent) -> Result<Self> {
        Ok(Self::new(store, event.first_object()?))
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }
}

#[async_trait]
impl SourceAdapter for ObjectSource {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.object.bucket_name, self.object.object_key)
    }

    async fn discover(&self) -> Result<Vec<SourceItem>> {
        if !self.object.object_key.ends_with(ARCHIVE_SUFFIX) {
            info!(key = %self.object.object_key, "Ignoring object that is not an archive");
            return Ok(Vec::new());
        }
        Ok(vec![SourceItem::new(self.object.object_key.as_str())])
    }

    #[instrument(skip(self, item), fields(bucket = %self.object.bucket_name, key = %item.name))]
    async fn open(&self, item: &SourceItem) -> Result<AcquiredSource> {
        let body = self.store.get_stream(&self.object.bucket_name, &item.name).await?;
        info!("Streaming stored archive");
        Ok(AcquiredSource::streaming(item.name.as_str(), body)
            .with_context(RouteContext::for_object_key(&item.name)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sink::MemoryBlobStore;

    const EVENT: &str = r#"{
        "Records": [
            {
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": "txc-zipped" },
                    "object": { "key": "20240101/tnds/East+Anglia%282%29.zip", "size": 1024 }
                }
            }
        ]
    }"#;

    #[test]
    fn test_parse_event() {
        let event = StorageEvent::from_json(EVENT).unwrap();
        let object = event.first_object().unwrap();

        assert_eq!(object.bucket_name, "txc-zipped");
        assert_eq!(object.object_key, "20240101/tnds/East Anglia(2).zip");
        assert_eq!(event.records[0].s3.object.size, Some(1024));
    }

    #[test]
    fn test_event_without_records() {
        let event = StorageEvent::from_json(r#"{"Records": []}"#).unwrap();
        assert!(matches!(event.first_object(), Err(IngestError::Configuration(_))));
        assert!(StorageEvent::from_json("not json").is_err());
    }

    #[test]
    fn test_decode_event_key() {
        assert_eq!(decode_event_key("a+b%2Bc.zip").unwrap(), "a b+c.zip");
        assert!(decode_event_key("bad%FF.zip").is_err());
    }

    #[tokio::test]
    async fn test_non_archive_key_is_ignored() {
        let source = ObjectSource::new(
            Arc::new(MemoryBlobStore::new()),
            ObjectRef::new("txc-zipped", "20240101/tnds/readme.txt"),
        );
        assert!(source.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_key_context() {
        let source = ObjectSource::new(
            Arc::new(MemoryBlobStore::new()),
            ObjectRef::new("txc-zipped", "20240101/tnds/EA.zip"),
        );

        let items = source.discover().await.unwrap();
        assert_eq!(items, vec![SourceItem::new("20240101/tnds/EA.zip")]);
        assert!(matches!(source.open(&items[0]).await, Err(IngestError::Source(_))));
        assert_eq!(source.describe(), "s3://txc-zipped/20240101/tnds/EA.zip");
    }
}
