//! FTP pull
//!
//! Lists one remote directory, keeps the files with the configured suffix and
//! downloads each into memory, one at a time, right before it is ingested.
//! The blocking `suppaftp` client runs on `spawn_blocking` with a fresh
//! session per operation.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, Read};
use std::str::FromStr;
use std::time::Duration;
use suppaftp::list::File as ListedFile;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::{debug, info, instrument, warn};

use super::{AcquiredSource, SourceAdapter, SourceItem};
use crate::error::{IngestError, Result};

/// Maximum number of attempts for one FTP operation
pub const MAX_RETRIES: u32 = 3;

/// Base delay between attempts, multiplied by the attempt number
pub const RETRY_DELAY_SECS: u64 = 5;

pub const DEFAULT_SUFFIX: &str = ".zip";
pub const DEFAULT_MAX_FILE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Directory to change into before listing; the login directory if unset
    pub directory: Option<String>,
    /// Only files ending with this are downloaded
    pub suffix: String,
    /// Largest file that may be buffered
    pub max_file_bytes: u64,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for FtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 21,
            username: "anonymous".to_string(),
            password: "anonymous@example.com".to_string(),
            directory: None,
            suffix: DEFAULT_SUFFIX.to_string(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_retries: MAX_RETRIES,
            retry_delay: Duration::from_secs(RETRY_DELAY_SECS),
        }
    }
}

impl FtpConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(IngestError::config("FTP host must be set"));
        }
        if self.suffix.is_empty() {
            return Err(IngestError::config("FTP suffix must not be empty"));
        }
        if self.max_file_bytes == 0 {
            return Err(IngestError::config("FTP max file size must be greater than zero"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("directory", &self.directory)
            .field("suffix", &self.suffix)
            .field("max_file_bytes", &self.max_file_bytes)
            .finish()
    }
}

pub struct FtpSource {
    config: FtpConfig,
}

impl FtpSource {
    pub fn new(config: FtpConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &FtpConfig {
        &self.config
    }

    /// Run a blocking FTP operation, retrying with a linear backoff
    async fn with_retries<T, F>(&self, operation: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&FtpConfig) -> std::result::Result<T, FtpError> + Clone + Send + 'static,
    {
        let attempts = self.config.max_retries.max(1);

        for attempt in 1..=attempts {
            debug!(operation, attempt, attempts, "FTP attempt");

            let config = self.config.clone();
            let op = op.clone();
            match tokio::task::spawn_blocking(move || op(&config)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if attempt < attempts => {
                    let delay = self.config.retry_delay * attempt;
                    warn!(
                        operation,
                        attempt,
                        error = %e,
                        "FTP attempt failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                },
                Ok(Err(e)) => {
                    return Err(IngestError::Source(format!(
                        "FTP {} failed after {} attempts: {}",
                        operation, attempts, e
                    )));
                },
                Err(e) => {
                    return Err(IngestError::Source(format!(
                        "FTP {} task panicked: {}",
                        operation, e
                    )));
                },
            }
        }

        Err(IngestError::Source(format!("FTP {} was never attempted", operation)))
    }
}

#[async_trait]
impl SourceAdapter for FtpSource {
    fn describe(&self) -> String {
        format!(
            "ftp://{}/{}",
            self.config.address(),
            self.config.directory.as_deref().unwrap_or("").trim_start_matches('/')
        )
    }

    #[instrument(skip(self), fields(host = %self.config.host))]
    async fn discover(&self) -> Result<Vec<SourceItem>> {
        let entries = self.with_retries("LIST", list_sync).await?;
        let items = select_archives(entries, &self.config.suffix, self.config.max_file_bytes)?;
        info!(count = items.len(), suffix = %self.config.suffix, "Selected remote files");
        Ok(items)
    }

    #[instrument(skip(self, item), fields(file = %item.name))]
    async fn open(&self, item: &SourceItem) -> Result<AcquiredSource> {
        let name = item.name.clone();
        let declared = item.declared_size;

        let data = self
            .with_retries("RETR", move |config| download_sync(config, &name, declared))
            .await?;

        info!(bytes = data.len(), "Downloaded remote file");
        Ok(AcquiredSource::buffered(item.name.clone(), Bytes::from(data)))
    }
}

/// Files ending in `suffix`, in listing order
///
/// A file whose listed size is over `max_file_bytes` fails the whole run
/// before anything is downloaded.
pub fn select_archives(entries: Vec<FtpEntry>, suffix: &str, max_file_bytes: u64) -> Result<Vec<SourceItem>> {
    let mut items = Vec::new();
    for entry in entries {
        if entry.is_directory || !entry.name.ends_with(suffix) {
            continue;
        }
        if let Some(size) = entry.size.filter(|size| *size > max_file_bytes) {
            return Err(IngestError::Source(format!(
                "remote file {} is {} bytes, over the {} byte limit",
                entry.name, size, max_file_bytes
            )));
        }
        items.push(SourceItem::new(entry.name).with_size(entry.size));
    }
    Ok(items)
}

fn connect(config: &FtpConfig) -> std::result::Result<FtpStream, FtpError> {
    debug!(address = %config.address(), "Connecting to FTP server");
    let mut ftp_stream = FtpStream::connect(config.address())?;

    // EPSV behaves better behind NAT
    ftp_stream.set_mode(Mode::ExtendedPassive);

    debug!(username = %config.username, "Logging in");
    ftp_stream.login(&config.username, &config.password)?;
    ftp_stream.transfer_type(FileType::Binary)?;

    if let Some(directory) = &config.directory {
        ftp_stream.cwd(directory)?;
    }
    Ok(ftp_stream)
}

fn quit(mut ftp_stream: FtpStream) {
    if let Err(e) = ftp_stream.quit() {
        warn!(error = %e, "Failed to quit FTP session gracefully");
    }
}

fn list_sync(config: &FtpConfig) -> std::result::Result<Vec<FtpEntry>, FtpError> {
    let mut ftp_stream = connect(config)?;
    let lines = ftp_stream.list(None)?;
    quit(ftp_stream);

    Ok(lines.iter().filter_map(|line| FtpEntry::parse(line)).collect())
}

fn download_sync(
    config: &FtpConfig,
    name: &str,
    declared: Option<u64>,
) -> std::result::Result<Vec<u8>, FtpError> {
    let limit = config.max_file_bytes;
    let capacity = usize::try_from(declared.unwrap_or(0).min(limit)).unwrap_or(0);

    let mut ftp_stream = connect(config)?;
    debug!(name, capacity, "Downloading file");

    let data = ftp_stream.retr(name, |reader| {
        let mut data = Vec::with_capacity(capacity);
        reader
            .take(limit + 1)
            .read_to_end(&mut data)
            .map_err(FtpError::ConnectionError)?;
        if data.len() as u64 > limit {
            return Err(FtpError::ConnectionError(io::Error::other(format!(
                "{} is larger than the {} byte limit",
                name, limit
            ))));
        }
        Ok(data)
    })?;

    quit(ftp_stream);
    Ok(data)
}

/// One line of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpEntry {
    pub name: String,
    pub is_directory: bool,
    /// Size in bytes; unknown for symlinks, whose listed size is the link's
    pub size: Option<u64>,
}

impl FtpEntry {
    /// Parse a Unix or DOS style LIST line; `total` lines and noise yield `None`
    pub fn parse(line: &str) -> Option<Self> {
        let file = ListedFile::from_str(line.trim_end()).ok()?;
        let size = if file.is_symlink() {
            None
        } else {
            Some(file.size() as u64)
        };

        Some(Self {
            name: file.name().to_string(),
            is_directory: file.is_directory(),
            size,
        })
    }
}
