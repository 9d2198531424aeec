//! Relay Ingest - archive relay CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_common::logging::{init_logging, LogConfig, LogLevel};
use relay_ingest::{
    BlobStore, FtpSource, HttpSource, IngestionRunner, MemoryBlobStore, ObjectRef, ObjectSource,
    Orchestrator, RelayConfig, RouteContext, RunReport, S3BlobStore, SourceAdapter,
    StorageEvent, UploadSink,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relay-ingest")]
#[command(author, version, about = "Relay zip archives into S3")]
struct Cli {
    #[command(subcommand)]
    source: Source,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the run report as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Route and decode everything but keep uploads in memory
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand, Debug)]
enum Source {
    /// Pull archives over HTTP(S)
    Http {
        /// Archive URL; repeat to override RELAY_HTTP_URLS
        #[arg(short, long = "url")]
        urls: Vec<String>,
    },

    /// Pull every matching archive from the configured FTP directory
    Ftp,

    /// Ingest one archive already in object storage
    Object {
        /// Bucket holding the archive
        #[arg(long, requires = "key", conflicts_with = "event")]
        bucket: Option<String>,

        /// URL-encoded object key, as delivered in storage notifications
        #[arg(long, requires = "bucket")]
        key: Option<String>,

        /// Storage notification JSON file
        #[arg(long)]
        event: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::from_env_or(
        LogConfig::default()
            .with_level(log_level)
            .with_file_prefix("relay-ingest"),
    )?;
    let _log_guard = init_logging(&log_config)?;

    let config = RelayConfig::from_env().context("Invalid relay configuration")?;
    info!(
        mode = %config.archive_mode,
        xml_bucket = %config.destinations.extracted_xml,
        date_prefix = %config.date_prefix,
        dry_run = cli.dry_run,
        "Relay configured"
    );

    let sink_store: Arc<dyn BlobStore> = if cli.dry_run {
        warn!("Dry run: nothing will be written to S3");
        Arc::new(MemoryBlobStore::new())
    } else {
        Arc::new(S3BlobStore::new(config.s3.clone()).await?)
    };

    let sink = UploadSink::new(sink_store, config.sink_config())?;
    let orchestrator = Orchestrator::new(config.routing_policy(), sink).with_max_depth(config.max_depth);

    let report = match cli.source {
        Source::Http { urls } => {
            let urls = if urls.is_empty() {
                config.http.urls.clone()
            } else {
                urls
            };
            let source = HttpSource::new(urls, config.http.connect_timeout())?;
            let runner = IngestionRunner::new(orchestrator, config.root_context()?);
            run(&runner, &source).await?
        },
        Source::Ftp => {
            let ftp = config.require_ftp()?;
            let source = FtpSource::new(ftp.connection.clone())?;
            let archive_bucket = if ftp.preserve_archives {
                config.destinations.zipped_bundles.clone()
            } else {
                None
            };
            let runner = IngestionRunner::new(orchestrator, config.root_context()?)
                .with_archive_bucket(archive_bucket);
            run(&runner, &source).await?
        },
        Source::Object { bucket, key, event } => {
            let object = match (bucket, key, event) {
                (Some(bucket), Some(key), _) => ObjectRef::from_encoded(&bucket, &key)?,
                (_, _, Some(path)) => {
                    let json = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("Failed to read event file {}", path.display()))?;
                    StorageEvent::from_json(&json)?.first_object()?
                },
                _ => anyhow::bail!("either --bucket and --key or --event is required"),
            };

            // The archive is always read from the real store, even on a dry run
            let reader: Arc<dyn BlobStore> = Arc::new(S3BlobStore::new(config.s3.clone()).await?);
            let root = RouteContext::for_object_key(&object.object_key);
            let source = ObjectSource::new(reader, object);
            let runner = IngestionRunner::new(orchestrator, root);
            run(&runner, &source).await?
        },
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    info!("Ingestion complete");
    Ok(())
}

async fn run(runner: &IngestionRunner, source: &dyn SourceAdapter) -> Result<RunReport> {
    info!(source = %source.describe(), "Starting ingestion run");
    Ok(runner.run(source).await?)
}
