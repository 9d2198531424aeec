//! Error taxonomy for ingestion runs
//!
//! Every variant is fatal to the run that raised it. Nothing is retried at
//! this layer; callers re-trigger the whole run, which is safe because
//! destination keys are deterministic.

use std::fmt::Display;
use std::io;

use crate::routing::Destination;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Malformed archive container
    #[error("Malformed archive: {0}")]
    Decode(String),

    /// The source ended before the archive did
    #[error("Archive input ended early: {0}")]
    IncompleteInput(String),

    /// A destination write failed
    #[error("Upload to {destination} failed: {message}")]
    Upload { destination: String, message: String },

    /// Missing or malformed configuration, raised before any I/O
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Source acquisition failed (HTTP status, FTP session, object fetch)
    #[error("Source error: {0}")]
    Source(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl IngestError {
    pub fn upload(destination: &Destination, message: impl Display) -> Self {
        IngestError::Upload {
            destination: destination.to_string(),
            message: message.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        IngestError::Configuration(message.into())
    }

    /// Short machine-friendly label used in structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Decode(_) => "decode",
            IngestError::IncompleteInput(_) => "incomplete_input",
            IngestError::Upload { .. } => "upload",
            IngestError::Configuration(_) => "configuration",
            IngestError::Source(_) => "source",
            IngestError::Io(_) => "io",
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Source(err.to_string())
    }
}

/// Map a failed read from an archive cursor onto the taxonomy
///
/// Truncation shows up as `UnexpectedEof`; corrupt deflate streams and CRC
/// mismatches as `InvalidData`/`InvalidInput`. Anything else is the
/// transport underneath failing.
pub fn classify_read_error(err: io::Error) -> IngestError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => IngestError::IncompleteInput(err.to_string()),
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
            IngestError::Decode(err.to_string())
        },
        _ => IngestError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_read_error() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        assert!(matches!(classify_read_error(eof), IngestError::IncompleteInput(_)));

        let crc = io::Error::new(io::ErrorKind::InvalidData, "Invalid checksum");
        assert!(matches!(classify_read_error(crc), IngestError::Decode(_)));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "peer went away");
        assert!(matches!(classify_read_error(reset), IngestError::Io(_)));
    }

    #[test]
    fn test_upload_error_names_destination() {
        let destination = Destination::new("xml-bucket", "20240101/bods/a.xml");
        let err = IngestError::upload(&destination, "503 Slow Down");

        assert_eq!(err.kind(), "upload");
        assert_eq!(
            err.to_string(),
            "Upload to s3://xml-bucket/20240101/bods/a.xml failed: 503 Slow Down"
        );
    }
}
