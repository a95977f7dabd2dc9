use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;

/// Stream of bytes for blob content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// User-defined metadata attached to a blob
pub type Metadata = BTreeMap<String, String>;

/// Identity of a blob: the container it lives in and its name.
///
/// Blobs never hold a reference back to a client or container; everything
/// that needs the owner resolves it through this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobKey {
    pub container: String,
    pub name: String,
}

impl BlobKey {
    pub fn new<C: Into<String>, N: Into<String>>(container: C, name: N) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for BlobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// Opaque block identifier as it travels on the wire (base64 text)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl BlockId {
    /// Create from an already-encoded id
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Encode raw id bytes
    pub fn encode(raw: &[u8]) -> Self {
        Self(STANDARD.encode(raw))
    }

    /// Id derived from a small integer, as commonly used when staging blocks by hand
    pub fn from_index(index: u16) -> Self {
        Self::encode(&index.to_le_bytes())
    }

    /// Decode back to the raw id bytes
    pub fn decode(&self) -> Option<Vec<u8>> {
        STANDARD.decode(self.0.as_bytes()).ok()
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the encoded id
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the service should look a block up when committing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockMode {
    Committed,
    Uncommitted,
    /// Staged version if one exists, otherwise the committed one
    Latest,
}

/// Filter for block list reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockListFilter {
    Committed,
    Uncommitted,
    All,
}

impl BlockListFilter {
    pub fn includes_committed(&self) -> bool {
        matches!(self, Self::Committed | Self::All)
    }

    pub fn includes_uncommitted(&self) -> bool {
        matches!(self, Self::Uncommitted | Self::All)
    }
}

/// One entry of a block list sent for commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockListItem {
    pub id: BlockId,
    pub mode: BlockMode,
}

impl BlockListItem {
    /// Entry resolved against the latest version of the block
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            mode: BlockMode::Latest,
        }
    }

    pub fn with_mode(id: BlockId, mode: BlockMode) -> Self {
        Self { id, mode }
    }
}

/// Block as reported by a block list read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub id: BlockId,
    pub size: u64,
    /// Only `Committed` or `Uncommitted` is ever reported
    pub mode: BlockMode,
}

/// Properties the service maintains for a blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobProperties {
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_md5: Option<String>,
    pub content_type: Option<String>,
    pub length: u64,
}

/// Content settings sent along with a commit or single-shot upload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHeaders {
    pub content_type: Option<String>,
    pub content_md5: Option<String>,
}

impl BlobHeaders {
    pub fn from_properties(properties: &BlobProperties) -> Self {
        Self {
            content_type: properties.content_type.clone(),
            content_md5: properties.content_md5.clone(),
        }
    }
}

/// Properties and metadata of a blob as read back from the service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobAttributes {
    pub properties: BlobProperties,
    pub metadata: Metadata,
}

/// Outcome of a successful commit or single-shot upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// Precondition attached to a mutating request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessCondition {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<DateTime<Utc>>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
}

impl AccessCondition {
    /// No precondition
    pub fn none() -> Self {
        Self::default()
    }

    /// Succeed only while the blob still carries `etag`
    pub fn if_match<S: Into<String>>(etag: S) -> Self {
        Self {
            if_match: Some(etag.into()),
            ..Self::default()
        }
    }

    /// Succeed only if the blob does not carry `etag` (`"*"` means "does not exist")
    pub fn if_none_match<S: Into<String>>(etag: S) -> Self {
        Self {
            if_none_match: Some(etag.into()),
            ..Self::default()
        }
    }

    pub fn with_if_modified_since(mut self, at: DateTime<Utc>) -> Self {
        self.if_modified_since = Some(at);
        self
    }

    pub fn with_if_unmodified_since(mut self, at: DateTime<Utc>) -> Self {
        self.if_unmodified_since = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.if_match.is_none()
            && self.if_none_match.is_none()
            && self.if_modified_since.is_none()
            && self.if_unmodified_since.is_none()
    }
}

/// Byte range for partial content requests (inclusive end)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>, // None means "to end of blob"
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn length(&self, total_size: u64) -> u64 {
        match self.end {
            Some(end) => end.min(total_size.saturating_sub(1)).saturating_sub(self.start) + 1,
            None => total_size.saturating_sub(self.start),
        }
    }

    pub fn is_valid(&self, total_size: u64) -> bool {
        if self.start >= total_size {
            return false;
        }
        match self.end {
            Some(end) => end >= self.start,
            None => true,
        }
    }
}

/// Content returned by a download
#[derive(Debug, Clone)]
pub struct DownloadedContent {
    pub data: Bytes,
    pub attributes: BlobAttributes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_ids_share_one_length() {
        let lengths: Vec<usize> = [0u16, 1, 9, 255, 4096, u16::MAX]
            .iter()
            .map(|i| BlockId::from_index(*i).len())
            .collect();

        assert!(lengths.iter().all(|l| *l == lengths[0]));
        assert_eq!(BlockId::from_index(7).decode(), Some(vec![7, 0]));
    }

    #[test]
    fn byte_range_clamps_to_blob() {
        let range = ByteRange::new(2, Some(100));
        assert!(range.is_valid(10));
        assert_eq!(range.length(10), 8);
        assert!(!ByteRange::from_start(10).is_valid(10));
    }
}
