//! Entry routing
//!
//! Maps an entry path onto recurse, upload or drop. Decisions depend only on
//! the path suffix and the route context, never on payload bytes, so the same
//! archive always produces the same set of destination keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

pub const ARCHIVE_SUFFIX: &str = ".zip";
pub const ZIP_CONTENT_TYPE: &str = "application/zip";
pub const XML_CONTENT_TYPE: &str = "application/xml";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// How nested `.zip` entries are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveMode {
    /// Decode nested archives and route their entries
    #[default]
    Extract,
    /// Upload nested archives verbatim to the bundle bucket
    PreserveNested,
    /// Decode nested archives and keep a verbatim copy
    Both,
}

impl ArchiveMode {
    pub fn recurses(self) -> bool {
        matches!(self, ArchiveMode::Extract | ArchiveMode::Both)
    }

    pub fn preserves(self) -> bool {
        matches!(self, ArchiveMode::PreserveNested | ArchiveMode::Both)
    }
}

impl FromStr for ArchiveMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "extract" => Ok(ArchiveMode::Extract),
            "preserve-nested" | "preserve_nested" | "preserve" => Ok(ArchiveMode::PreserveNested),
            "both" => Ok(ArchiveMode::Both),
            other => Err(IngestError::config(format!(
                "Invalid archive mode '{}' (expected extract, preserve-nested or both)",
                other
            ))),
        }
    }
}

impl fmt::Display for ArchiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveMode::Extract => "extract",
            ArchiveMode::PreserveNested => "preserve-nested",
            ArchiveMode::Both => "both",
        };
        f.write_str(name)
    }
}

/// Buckets a feed writes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationMap {
    /// Verbatim nested archives; only needed when the mode preserves them
    pub zipped_bundles: Option<String>,
    pub extracted_xml: String,
}

impl DestinationMap {
    pub fn new(extracted_xml: impl Into<String>) -> Self {
        Self {
            zipped_bundles: None,
            extracted_xml: extracted_xml.into(),
        }
    }

    pub fn with_zipped_bundles(mut self, bucket: impl Into<String>) -> Self {
        self.zipped_bundles = Some(bucket.into());
        self
    }
}

/// A single object location
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination {
    pub bucket: String,
    pub key: String,
}

impl Destination {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Key prefix for the archive level currently being decoded
///
/// Always empty or ending in `/`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteContext {
    prefix: String,
}

impl RouteContext {
    /// `<date>/<feed>/` context for a scheduled pull
    pub fn root(date_prefix: &str, feed: &str) -> Self {
        let mut prefix = String::new();
        for segment in [date_prefix, feed] {
            let segment = segment.trim_matches('/');
            if !segment.is_empty() {
                prefix.push_str(segment);
                prefix.push('/');
            }
        }
        Self { prefix }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    /// Context for an archive located at a storage key: `a/b/feed.zip` -> `a/b/feed/`
    pub fn for_object_key(key: &str) -> Self {
        Self::with_prefix(strip_extension(key))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Context for the entries of a nested archive at `entry_path`
    ///
    /// Without flattening the nested path, minus its extension, becomes a new
    /// key segment: `sub/inner.zip` under `20240101/feed/` decodes into
    /// `20240101/feed/sub/inner/`.
    pub fn nested(&self, entry_path: &str, flatten: bool) -> Self {
        if flatten {
            return self.clone();
        }
        let stem = strip_extension(entry_path);
        if stem.is_empty() {
            return self.clone();
        }
        Self::with_prefix(format!("{}{}", self.prefix, stem))
    }

    /// Sanitised object key for `entry_path` at this level
    pub fn key_for(&self, entry_path: &str) -> String {
        sanitize_key(&format!("{}{}", self.prefix, entry_path))
    }
}

fn strip_extension(path: &str) -> &str {
    match path.rfind('.') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Replace every character outside `[A-Za-z0-9._!*'()/-]` with `_`
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '!' | '*' | '\'' | '(' | ')' | '/'
            | '-' => c,
            _ => '_',
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Decode the entry as a nested archive under `context`, optionally
    /// teeing its bytes into a verbatim copy
    Recurse {
        context: RouteContext,
        verbatim: Option<Destination>,
    },
    Upload {
        destination: Destination,
        content_type: String,
    },
    Drop,
}

/// Suffix-based routing for one feed
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    destinations: DestinationMap,
    mode: ArchiveMode,
    content_types: Vec<(String, String)>,
    flatten_nested: bool,
    target_entry: Option<String>,
}

impl RoutingPolicy {
    pub fn new(destinations: DestinationMap) -> Self {
        Self {
            destinations,
            mode: ArchiveMode::default(),
            content_types: vec![(".xml".to_string(), XML_CONTENT_TYPE.to_string())],
            flatten_nested: false,
            target_entry: None,
        }
    }

    pub fn with_mode(mut self, mode: ArchiveMode) -> Self {
        self.mode = mode;
        self
    }

    /// Route entries ending in `suffix` to the extracted bucket
    pub fn with_content_type(mut self, suffix: impl Into<String>, content_type: impl Into<String>) -> Self {
        let suffix = suffix.into();
        let content_type = content_type.into();
        match self.content_types.iter_mut().find(|(s, _)| *s == suffix) {
            Some(existing) => existing.1 = content_type,
            None => self.content_types.push((suffix, content_type)),
        }
        self
    }

    pub fn with_flatten_nested(mut self, flatten: bool) -> Self {
        self.flatten_nested = flatten;
        self
    }

    /// Only upload the extracted entry named `name` (full path or file name)
    pub fn with_target_entry(mut self, name: Option<String>) -> Self {
        self.target_entry = name.filter(|n| !n.is_empty());
        self
    }

    /// Bundle bucket, if verbatim copies of nested archives are kept
    fn bundle_bucket(&self) -> Option<&str> {
        if self.mode.preserves() {
            self.destinations.zipped_bundles.as_deref()
        } else {
            None
        }
    }

    pub fn route(&self, entry_path: &str, context: &RouteContext) -> RoutingDecision {
        if entry_path.ends_with('/') {
            return RoutingDecision::Drop;
        }

        if entry_path.ends_with(ARCHIVE_SUFFIX) {
            let verbatim = self
                .bundle_bucket()
                .map(|bucket| Destination::new(bucket, context.key_for(entry_path)));

            return match (self.mode.recurses(), verbatim) {
                (false, Some(destination)) => RoutingDecision::Upload {
                    destination,
                    content_type: ZIP_CONTENT_TYPE.to_string(),
                },
                (_, verbatim) => RoutingDecision::Recurse {
                    context: context.nested(entry_path, self.flatten_nested),
                    verbatim,
                },
            };
        }

        let Some((_, content_type)) = self
            .content_types
            .iter()
            .find(|(suffix, _)| entry_path.ends_with(suffix.as_str()))
        else {
            return RoutingDecision::Drop;
        };

        if !self.matches_target(entry_path) {
            return RoutingDecision::Drop;
        }

        RoutingDecision::Upload {
            destination: Destination::new(
                self.destinations.extracted_xml.as_str(),
                context.key_for(entry_path),
            ),
            content_type: content_type.clone(),
        }
    }

    /// Where a downloaded file that is not an archive is stored
    ///
    /// The object is named after the target entry when one is set, else
    /// after the download, and lands in the extracted bucket.
    pub fn document_destination(&self, name: &str, context: &RouteContext) -> (Destination, String) {
        let file_name = self.target_entry.as_deref().unwrap_or(name);
        let content_type = self
            .content_types
            .iter()
            .find(|(suffix, _)| file_name.ends_with(suffix.as_str()))
            .map_or(DEFAULT_CONTENT_TYPE, |(_, content_type)| content_type.as_str());

        (
            Destination::new(self.destinations.extracted_xml.as_str(), context.key_for(file_name)),
            content_type.to_string(),
        )
    }

    fn matches_target(&self, entry_path: &str) -> bool {
        match &self.target_entry {
            None => true,
            Some(target) => {
                entry_path == target || entry_path.rsplit('/').next() == Some(target.as_str())
            },
        }
    }
}
