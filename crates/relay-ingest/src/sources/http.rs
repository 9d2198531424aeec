//! HTTP pull: the response body is streamed straight into the decoder

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{header, Client};
use std::io;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument};

use super::{AcquiredSource, SourceAdapter, SourceItem};
use crate::error::{IngestError, Result};
use crate::routing::ARCHIVE_SUFFIX;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("relay-ingest/", env!("CARGO_PKG_VERSION"));

/// GETs each configured URL in turn
///
/// Only the connect phase has a timeout; archive bodies can legitimately take
/// far longer to arrive than any fixed request deadline.
pub struct HttpSource {
    client: Client,
    urls: Vec<String>,
}

impl HttpSource {
    pub fn new(urls: Vec<String>, connect_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Self::with_client(client, urls)
    }

    pub fn with_client(client: Client, urls: Vec<String>) -> Result<Self> {
        if urls.is_empty() {
            return Err(IngestError::config("HTTP source needs at least one URL"));
        }
        Ok(Self { client, urls })
    }
}

#[async_trait]
impl SourceAdapter for HttpSource {
    fn describe(&self) -> String {
        format!("http ({} url{})", self.urls.len(), if self.urls.len() == 1 { "" } else { "s" })
    }

    async fn discover(&self) -> Result<Vec<SourceItem>> {
        Ok(self.urls.iter().map(SourceItem::new).collect())
    }

    #[instrument(skip(self, item), fields(url = %item.name))]
    async fn open(&self, item: &SourceItem) -> Result<AcquiredSource> {
        let response = self.client.get(&item.name).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Source(format!(
                "GET {} returned {}",
                item.name, status
            )));
        }

        let attachment = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition);
        // Only a server-named attachment can declare the body is not a zip;
        // URLs like `.../bulk_archive` carry no usable extension.
        let is_document = attachment
            .as_deref()
            .is_some_and(|name| !name.ends_with(ARCHIVE_SUFFIX));
        let name = attachment
            .or_else(|| filename_from_url(&item.name))
            .unwrap_or_else(|| item.name.clone());

        let content_length = response.content_length();
        let body = response.bytes_stream().map_err(io::Error::other);
        let body = Box::new(StreamReader::new(Box::pin(body)));

        if is_document {
            info!(%name, ?content_length, "Streaming single document");
            Ok(AcquiredSource::document(name, body))
        } else {
            info!(%name, ?content_length, "Streaming archive");
            Ok(AcquiredSource::streaming(name, body))
        }
    }
}

/// `attachment; filename="NaPTAN.zip"` -> `NaPTAN.zip`
pub fn filename_from_disposition(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        let (key, raw) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let name = raw.trim().trim_matches('"');
        if name.is_empty() {
            None
        } else {
            debug!(name, "Filename from Content-Disposition");
            Some(name.to_string())
        }
    })
}

fn filename_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    let (_, segment) = path.rsplit_once('/')?;
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_disposition() {
        assert_eq!(
            filename_from_disposition("attachment; filename=\"NaPTAN.zip\"").as_deref(),
            Some("NaPTAN.zip")
        );
        assert_eq!(
            filename_from_disposition("attachment;filename=Stops.zip").as_deref(),
            Some("Stops.zip")
        );
        assert_eq!(filename_from_disposition("inline"), None);
        assert_eq!(filename_from_disposition("attachment; filename=\"\""), None);
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://data.example.com/timetable/download/bulk_archive?x=1").as_deref(),
            Some("bulk_archive")
        );
        assert_eq!(filename_from_url("https://data.example.com/"), None);
        assert_eq!(filename_from_url("https://data.example.com"), None);
    }

    #[test]
    fn test_requires_url() {
        assert!(matches!(
            HttpSource::with_client(Client::new(), Vec::new()),
            Err(IngestError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_lists_urls_in_order() {
        let source = HttpSource::new(
            vec!["http://a/bods.zip".to_string(), "http://b/coach.zip".to_string()],
            Duration::from_secs(5),
        )
        .unwrap();

        let items = source.discover().await.unwrap();
        let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["http://a/bods.zip", "http://b/coach.zip"]);
        assert_eq!(source.describe(), "http (2 urls)");
    }
}
