use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, info, instrument, warn};

use crate::error::{IngestError, Result};
use crate::routing::Destination;
use crate::sink::{BlobStore, PartStream};
use crate::sources::SourceStream;

pub mod config;

pub use config::S3Config;

/// [`BlobStore`] backed by S3 or any S3-compatible endpoint
///
/// A body that fits in one part is sent with `PutObject`; anything larger
/// goes through a multipart upload, which is aborted if any part fails so
/// no orphaned parts are left behind.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
}

impl S3BlobStore {
    pub async fn new(config: S3Config) -> Result<Self> {
        config.validate()?;
        debug!(?config, "Initializing S3 blob store");

        let mut builder = match config.static_credentials() {
            Some((access_key, secret_key)) => {
                let credentials = Credentials::new(access_key, secret_key, None, None, "relay-static");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            None => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(
            region = %config.region,
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            "S3 blob store initialized"
        );

        Ok(Self::from_client(Client::from_conf(builder.build())))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn put_single(&self, destination: &Destination, content_type: &str, body: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .content_type(content_type)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| IngestError::upload(destination, DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        destination: &Destination,
        content_type: &str,
        buffered: VecDeque<Bytes>,
        parts: &mut PartStream,
    ) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| IngestError::upload(destination, DisplayErrorContext(&e)))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| IngestError::upload(destination, "no upload id returned"))?
            .to_string();
        debug!(%upload_id, "Multipart upload created");

        let result = match self.upload_parts(destination, &upload_id, buffered, parts).await {
            Ok(completed) => self.complete(destination, &upload_id, completed).await,
            Err(e) => Err(e),
        };

        if result.is_err() {
            self.abort(destination, &upload_id).await;
        }
        result
    }

    async fn upload_parts(
        &self,
        destination: &Destination,
        upload_id: &str,
        mut buffered: VecDeque<Bytes>,
        parts: &mut PartStream,
    ) -> Result<Vec<CompletedPart>> {
        let mut completed = Vec::new();
        let mut part_number = 1;

        loop {
            let body = match buffered.pop_front() {
                Some(body) => body,
                None => match parts
                    .next_part()
                    .await
                    .map_err(|e| IngestError::upload(destination, e))?
                {
                    Some(body) => body,
                    None => break,
                },
            };

            let size = body.len();
            let response = self
                .client
                .upload_part()
                .bucket(&destination.bucket)
                .key(&destination.key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| IngestError::upload(destination, DisplayErrorContext(&e)))?;

            debug!(part_number, size, "Uploaded part");
            completed.push(
                CompletedPart::builder()
                    .set_e_tag(response.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
        }

        Ok(completed)
    }

    async fn complete(
        &self,
        destination: &Destination,
        upload_id: &str,
        completed: Vec<CompletedPart>,
    ) -> Result<()> {
        self.client
            .complete_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| IngestError::upload(destination, DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn abort(&self, destination: &Destination, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&destination.bucket)
            .key(&destination.key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(
                destination = %destination,
                upload_id,
                error = %DisplayErrorContext(&e),
                "Failed to abort multipart upload"
            );
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, destination, parts), fields(destination = %destination))]
    async fn put_stream(
        &self,
        destination: &Destination,
        content_type: &str,
        parts: &mut PartStream,
    ) -> Result<()> {
        let Some(first) = parts
            .next_part()
            .await
            .map_err(|e| IngestError::upload(destination, e))?
        else {
            return self.put_single(destination, content_type, Bytes::new()).await;
        };
        let Some(second) = parts
            .next_part()
            .await
            .map_err(|e| IngestError::upload(destination, e))?
        else {
            return self.put_single(destination, content_type, first).await;
        };

        self.put_multipart(destination, content_type, VecDeque::from([first, second]), parts)
            .await
    }

    #[instrument(skip(self))]
    async fn get_stream(&self, bucket: &str, key: &str) -> Result<SourceStream> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                IngestError::Source(format!(
                    "Failed to get s3://{}/{}: {}",
                    bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;

        debug!(size = ?response.content_length(), "Streaming object");
        Ok(Box::new(Box::pin(response.body.into_async_read())))
    }
}
