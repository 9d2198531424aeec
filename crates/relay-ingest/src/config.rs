//! Run configuration
//!
//! Everything is read from the environment (and `.env`, if present) and
//! validated before any network I/O starts. Unlike a missing optional
//! variable, a variable that is set but malformed is always an error.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::orchestrator::DEFAULT_MAX_DEPTH;
use crate::routing::{ArchiveMode, DestinationMap, RouteContext, RoutingPolicy};
use crate::sink::{SinkConfig, DEFAULT_MAX_IN_FLIGHT_UPLOADS, DEFAULT_PART_SIZE};
use crate::sources::ftp::{self, FtpConfig};
use crate::sources::http::DEFAULT_CONNECT_TIMEOUT_SECS;
use crate::storage::S3Config;

// ============================================================================
// Defaults
// ============================================================================

/// S3 rejects multipart parts smaller than this, except the last one
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Default FTP port.
pub const DEFAULT_FTP_PORT: u16 = 21;

/// Key date stamp format, e.g. `20240101`
pub const DATE_PREFIX_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    pub urls: Vec<String>,
    pub connect_timeout_secs: u64,
}

impl HttpSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct FtpSettings {
    pub connection: FtpConfig,
    /// Also upload each downloaded archive verbatim to the bundle bucket
    pub preserve_archives: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Second key segment, e.g. `bods` in `20240101/bods/...`
    pub feed: Option<String>,
    pub destinations: DestinationMap,
    pub archive_mode: ArchiveMode,
    pub flatten_nested: bool,
    pub target_entry: Option<String>,
    pub max_in_flight_uploads: usize,
    pub part_size_bytes: usize,
    pub max_depth: usize,
    pub date_prefix: String,
    pub http: HttpSettings,
    pub ftp: Option<FtpSettings>,
    pub s3: S3Config,
}

impl RelayConfig {
    /// Load from the process environment and `.env`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let extracted_xml = env.required("RELAY_XML_BUCKET")?;
        let destinations = DestinationMap {
            zipped_bundles: env.text("RELAY_ZIPPED_BUCKET"),
            extracted_xml,
        };

        let date_prefix = match env.text("RELAY_DATE_PREFIX") {
            Some(prefix) => prefix,
            None => today_prefix(),
        };

        let ftp = match env.text("RELAY_FTP_HOST") {
            Some(host) => Some(FtpSettings {
                connection: FtpConfig {
                    host,
                    port: env.parse("RELAY_FTP_PORT", DEFAULT_FTP_PORT)?,
                    username: env
                        .text("RELAY_FTP_USERNAME")
                        .unwrap_or_else(|| FtpConfig::default().username),
                    password: env
                        .text("RELAY_FTP_PASSWORD")
                        .unwrap_or_else(|| FtpConfig::default().password),
                    directory: env.text("RELAY_FTP_DIRECTORY"),
                    suffix: env
                        .text("RELAY_FTP_SUFFIX")
                        .unwrap_or_else(|| ftp::DEFAULT_SUFFIX.to_string()),
                    max_file_bytes: env.parse("RELAY_FTP_MAX_FILE_BYTES", ftp::DEFAULT_MAX_FILE_BYTES)?,
                    ..FtpConfig::default()
                },
                preserve_archives: env.parse("RELAY_FTP_PRESERVE_ARCHIVES", false)?,
            }),
            None => None,
        };

        let config = Self {
            feed: env.text("RELAY_FEED"),
            destinations,
            archive_mode: env.parse("RELAY_ARCHIVE_MODE", ArchiveMode::default())?,
            flatten_nested: env.parse("RELAY_FLATTEN_NESTED", false)?,
            target_entry: env.text("RELAY_TARGET_ENTRY"),
            max_in_flight_uploads: env.parse("RELAY_MAX_IN_FLIGHT_UPLOADS", DEFAULT_MAX_IN_FLIGHT_UPLOADS)?,
            part_size_bytes: env.parse("RELAY_PART_SIZE_BYTES", DEFAULT_PART_SIZE)?,
            max_depth: env.parse("RELAY_MAX_DEPTH", DEFAULT_MAX_DEPTH)?,
            date_prefix,
            http: HttpSettings {
                urls: env
                    .text("RELAY_HTTP_URLS")
                    .map(|urls| {
                        urls.split(',')
                            .map(str::trim)
                            .filter(|u| !u.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                connect_timeout_secs: env.parse("RELAY_HTTP_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
            },
            ftp,
            s3: S3Config::from_lookup(&env.0)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.destinations.extracted_xml.trim().is_empty() {
            return Err(IngestError::config("RELAY_XML_BUCKET must not be empty"));
        }

        if self.archive_mode.preserves() && self.destinations.zipped_bundles.is_none() {
            return Err(IngestError::config(format!(
                "RELAY_ZIPPED_BUCKET is required when RELAY_ARCHIVE_MODE is {}",
                self.archive_mode
            )));
        }

        if let Some(feed) = &self.feed {
            if feed.contains('/') {
                return Err(IngestError::config(format!("RELAY_FEED '{}' must not contain '/'", feed)));
            }
        }

        if self.max_in_flight_uploads == 0 {
            return Err(IngestError::config("RELAY_MAX_IN_FLIGHT_UPLOADS must be at least 1"));
        }

        if self.part_size_bytes < MIN_PART_SIZE {
            return Err(IngestError::config(format!(
                "RELAY_PART_SIZE_BYTES must be at least {} bytes",
                MIN_PART_SIZE
            )));
        }

        if self.max_depth == 0 {
            return Err(IngestError::config("RELAY_MAX_DEPTH must be at least 1"));
        }

        validate_date_prefix(&self.date_prefix)?;

        if let Some(ftp) = &self.ftp {
            ftp.connection.validate()?;
            if ftp.preserve_archives && self.destinations.zipped_bundles.is_none() {
                return Err(IngestError::config(
                    "RELAY_ZIPPED_BUCKET is required when RELAY_FTP_PRESERVE_ARCHIVES is set",
                ));
            }
        }

        Ok(())
    }

    /// Feed name, required by scheduled pulls
    pub fn require_feed(&self) -> Result<&str> {
        self.feed
            .as_deref()
            .ok_or_else(|| IngestError::config("RELAY_FEED must be set for scheduled pulls"))
    }

    pub fn require_ftp(&self) -> Result<&FtpSettings> {
        self.ftp
            .as_ref()
            .ok_or_else(|| IngestError::config("RELAY_FTP_HOST must be set for FTP pulls"))
    }

    /// `<date>/<feed>/`
    pub fn root_context(&self) -> Result<RouteContext> {
        Ok(RouteContext::root(&self.date_prefix, self.require_feed()?))
    }

    pub fn routing_policy(&self) -> RoutingPolicy {
        RoutingPolicy::new(self.destinations.clone())
            .with_mode(self.archive_mode)
            .with_flatten_nested(self.flatten_nested)
            .with_target_entry(self.target_entry.clone())
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig::default()
            .with_part_size(self.part_size_bytes)
            .with_max_in_flight_uploads(self.max_in_flight_uploads)
    }
}

/// Today's UTC date stamp
pub fn today_prefix() -> String {
    Utc::now().format(DATE_PREFIX_FORMAT).to_string()
}

fn validate_date_prefix(prefix: &str) -> Result<()> {
    let well_formed = prefix.len() == 8
        && prefix.bytes().all(|b| b.is_ascii_digit())
        && NaiveDate::parse_from_str(prefix, DATE_PREFIX_FORMAT).is_ok();
    if well_formed {
        Ok(())
    } else {
        Err(IngestError::config(format!(
            "RELAY_DATE_PREFIX '{}' is not a YYYYMMDD date",
            prefix
        )))
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank
    fn text(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.text(name)
            .ok_or_else(|| IngestError::config(format!("{} must be set", name)))
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.text(name) {
            Some(raw) => raw
                .parse()
                .map_err(|e| IngestError::config(format!("Invalid {} '{}': {}", name, raw, e))),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RelayConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = load(&[("RELAY_XML_BUCKET", "xml-bucket"), ("RELAY_FEED", "bods")]).unwrap();

        assert_eq!(config.archive_mode, ArchiveMode::Extract);
        assert_eq!(config.max_in_flight_uploads, DEFAULT_MAX_IN_FLIGHT_UPLOADS);
        assert_eq!(config.part_size_bytes, DEFAULT_PART_SIZE);
        assert_eq!(config.max_depth, DEFAULT_MAX_DEPTH);
        assert_eq!(config.date_prefix.len(), 8);
        assert!(config.http.urls.is_empty());
        assert!(config.ftp.is_none());
        assert_eq!(
            config.root_context().unwrap().prefix(),
            format!("{}/bods/", config.date_prefix)
        );
    }

    #[test]
    fn test_missing_xml_bucket() {
        let err = load(&[("RELAY_FEED", "bods")]).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(ref msg) if msg.contains("RELAY_XML_BUCKET")));
    }

    #[test]
    fn test_malformed_values_are_errors() {
        for (name, value) in [
            ("RELAY_MAX_IN_FLIGHT_UPLOADS", "lots"),
            ("RELAY_ARCHIVE_MODE", "explode"),
            ("RELAY_FLATTEN_NESTED", "yes please"),
            ("RELAY_DATE_PREFIX", "2024-01-01"),
            ("RELAY_DATE_PREFIX", "20241301"),
            ("RELAY_PART_SIZE_BYTES", "1024"),
            ("RELAY_MAX_IN_FLIGHT_UPLOADS", "0"),
        ] {
            let result = load(&[("RELAY_XML_BUCKET", "xml-bucket"), (name, value)]);
            assert!(
                matches!(result, Err(IngestError::Configuration(_))),
                "{}={} should be rejected",
                name,
                value
            );
        }
    }

    #[test]
    fn test_preserving_needs_bundle_bucket() {
        let err = load(&[("RELAY_XML_BUCKET", "xml-bucket"), ("RELAY_ARCHIVE_MODE", "both")]).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(ref msg) if msg.contains("RELAY_ZIPPED_BUCKET")));

        let config = load(&[
            ("RELAY_XML_BUCKET", "xml-bucket"),
            ("RELAY_ZIPPED_BUCKET", "archive-bucket"),
            ("RELAY_ARCHIVE_MODE", "both"),
            ("RELAY_FLATTEN_NESTED", "true"),
        ])
        .unwrap();
        assert_eq!(config.archive_mode, ArchiveMode::Both);
        assert!(config.flatten_nested);
    }

    #[test]
    fn test_http_and_ftp_settings() {
        let config = load(&[
            ("RELAY_XML_BUCKET", "xml-bucket"),
            ("RELAY_ZIPPED_BUCKET", "archive-bucket"),
            ("RELAY_DATE_PREFIX", "20240101"),
            ("RELAY_HTTP_URLS", "https://a.example/bulk, https://b.example/coach ,"),
            ("RELAY_FTP_HOST", "ftp.example.com"),
            ("RELAY_FTP_PORT", "2121"),
            ("RELAY_FTP_PRESERVE_ARCHIVES", "true"),
        ])
        .unwrap();

        assert_eq!(config.date_prefix, "20240101");
        assert_eq!(config.http.urls, vec!["https://a.example/bulk", "https://b.example/coach"]);

        let ftp = config.require_ftp().unwrap();
        assert_eq!(ftp.connection.port, 2121);
        assert_eq!(ftp.connection.suffix, ".zip");
        assert!(ftp.preserve_archives);
    }

    #[test]
    fn test_s3_settings_come_from_the_same_source() {
        let config = load(&[
            ("RELAY_XML_BUCKET", "xml-bucket"),
            ("S3_ENDPOINT", "http://localhost:9000"),
            ("S3_ACCESS_KEY", "minioadmin"),
            ("S3_SECRET_KEY", "minioadmin"),
            ("S3_PATH_STYLE", "true"),
        ])
        .unwrap();
        assert_eq!(config.s3.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.s3.path_style);

        let err = load(&[("RELAY_XML_BUCKET", "xml-bucket"), ("S3_ACCESS_KEY", "only-half")]).unwrap_err();
        assert!(matches!(err, IngestError::Configuration(_)));
    }

    #[test]
    fn test_feed_required_for_pulls() {
        let config = load(&[("RELAY_XML_BUCKET", "xml-bucket")]).unwrap();
        assert!(config.root_context().is_err());
        assert!(config.require_ftp().is_err());
    }

    #[test]
    fn test_validate_date_prefix() {
        assert!(validate_date_prefix("20240229").is_ok());
        assert!(validate_date_prefix("20230229").is_err());
        assert!(validate_date_prefix("2024011").is_err());
        assert!(validate_date_prefix(&today_prefix()).is_ok());
    }
}
