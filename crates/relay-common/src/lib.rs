//! Relay Common Library
//!
//! Shared plumbing for the relay workspace members.
//!
//! - **Error Handling**: [`RelayError`] and the [`Result`] alias
//! - **Logging**: environment-driven `tracing` subscriber setup
//! - **Checksums**: incremental SHA-256 used for upload receipts
//!
//! # Example
//!
//! ```no_run
//! use relay_common::checksum::Checksum;
//! use relay_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> relay_common::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!
//!     let mut checksum = Checksum::new();
//!     checksum.update(b"<TransXChange/>");
//!     tracing::info!(sha256 = %checksum.finalize_hex(), "hashed payload");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{RelayError, Result};
