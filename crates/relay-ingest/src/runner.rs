//! Ingestion runs
//!
//! A run drives one [`SourceAdapter`] end to end: every discovered item is
//! opened and ingested in order, and the first failure stops the run. Nothing
//! is checkpointed; a failed run is retried from the start and overwrites
//! whatever objects the earlier attempt committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::orchestrator::{IngestStats, Orchestrator};
use crate::routing::{Destination, RouteContext, ZIP_CONTENT_TYPE};
use crate::sink::UploadReceipt;
use crate::sources::{AcquiredSource, SourceAdapter, SourceItem, SourceKind};

/// Outcome of one ingested source item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub name: String,
    pub key_prefix: String,
    /// Verbatim copy of the downloaded archive, when one was kept
    pub preserved: Option<UploadReceipt>,
    pub stats: IngestStats,
}

/// Summary of a successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: String,
    pub key_prefix: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub totals: IngestStats,
}

impl RunReport {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

pub struct IngestionRunner {
    orchestrator: Orchestrator,
    root: RouteContext,
    archive_bucket: Option<String>,
}

impl IngestionRunner {
    pub fn new(orchestrator: Orchestrator, root: RouteContext) -> Self {
        Self {
            orchestrator,
            root,
            archive_bucket: None,
        }
    }

    /// Keep buffered downloads verbatim under the root prefix of `bucket`
    pub fn with_archive_bucket(mut self, bucket: Option<String>) -> Self {
        self.archive_bucket = bucket;
        self
    }

    pub async fn run(&self, adapter: &dyn SourceAdapter) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let source = adapter.describe();

        match self.run_inner(run_id, &source, adapter).await {
            Ok(report) => {
                info!(
                    %run_id,
                    source = %source,
                    items = report.sources.len(),
                    uploads = report.totals.uploads_completed,
                    bytes = report.totals.bytes_uploaded,
                    duration_ms = report.duration_ms(),
                    "Ingestion run complete"
                );
                Ok(report)
            },
            Err(e) => {
                error!(%run_id, source = %source, kind = e.kind(), error = %e, "Ingestion run failed");
                Err(e)
            },
        }
    }

    #[instrument(skip(self, adapter), fields(prefix = %self.root.prefix()))]
    async fn run_inner(&self, run_id: Uuid, source: &str, adapter: &dyn SourceAdapter) -> Result<RunReport> {
        let started_at = Utc::now();
        info!("Discovering source items");

        let items = adapter.discover().await?;
        if items.is_empty() {
            warn!("Source had nothing to ingest");
        }

        let mut sources = Vec::with_capacity(items.len());
        let mut totals = IngestStats::default();

        for item in &items {
            let report = self.ingest_item(adapter, item).await?;
            totals.merge(report.stats.clone());
            if let Some(receipt) = &report.preserved {
                totals.record_upload(receipt.clone());
            }
            sources.push(report);
        }

        Ok(RunReport {
            run_id,
            source: source.to_string(),
            key_prefix: self.root.prefix().to_string(),
            started_at,
            finished_at: Utc::now(),
            sources,
            totals,
        })
    }

    #[instrument(skip(self, adapter, item), fields(item = %item.name))]
    async fn ingest_item(&self, adapter: &dyn SourceAdapter, item: &SourceItem) -> Result<SourceReport> {
        let acquired = adapter.open(item).await?;
        let context = acquired.context.clone().unwrap_or_else(|| self.root.clone());
        if acquired.kind == SourceKind::Document {
            return self.store_document(acquired, context).await;
        }

        let preserved = match (&self.archive_bucket, acquired.buffered.clone()) {
            (Some(bucket), Some(data)) => {
                let destination = Destination::new(bucket.clone(), self.root.key_for(&acquired.name));
                info!(destination = %destination, bytes = data.len(), "Preserving downloaded archive");
                Some(
                    self.orchestrator
                        .sink()
                        .upload_bytes(destination, ZIP_CONTENT_TYPE, data)
                        .await?,
                )
            },
            _ => None,
        };

        let ingested = self.orchestrator.ingest_stream(acquired.body, context.clone()).await;

        let preserved = match preserved {
            Some(handle) => match (handle.wait().await, &ingested) {
                (Ok(receipt), _) => Some(receipt),
                (Err(e), Err(_)) => {
                    warn!(error = %e, "Archive copy also failed");
                    None
                },
                (Err(e), Ok(_)) => return Err(e),
            },
            None => None,
        };

        Ok(SourceReport {
            name: acquired.name,
            key_prefix: context.prefix().to_string(),
            preserved,
            stats: ingested?,
        })
    }

    /// Upload a download that is not an archive as one object
    async fn store_document(&self, acquired: AcquiredSource, context: RouteContext) -> Result<SourceReport> {
        let (destination, content_type) = self
            .orchestrator
            .policy()
            .document_destination(&acquired.name, &context);
        info!(destination = %destination, %content_type, "Storing download as a single object");

        let receipt = self
            .orchestrator
            .sink()
            .upload_stream(destination, &content_type, acquired.body)
            .await?
            .wait()
            .await?;

        let mut stats = IngestStats::default();
        stats.record_upload(receipt);
        Ok(SourceReport {
            name: acquired.name,
            key_prefix: context.prefix().to_string(),
            preserved: None,
            stats,
        })
    }
}
