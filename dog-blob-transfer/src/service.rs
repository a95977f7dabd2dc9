use async_trait::async_trait;
use bytes::Bytes;

use crate::{
    AccessCondition, BlobAttributes, BlobHeaders, BlobKey, BlockId, BlockInfo, BlockListFilter,
    BlockListItem, ByteRange, CommitResult, DownloadedContent, Metadata, TransferResult,
};

/// Block-blob wire operations. Implementations own request encoding, signing
/// and HTTP; the engine only sees the typed outcome.
///
/// Failures are reported as [`crate::TransferError::Protocol`] with a code that
/// tells transient failures (network faults, 5xx, digest mismatch) from
/// permanent ones (bad id, failed precondition, oversized block).
#[async_trait]
pub trait BlockBlobService: Send + Sync {
    /// Stage one block. `content_md5` goes out verbatim as the request digest.
    async fn put_block(
        &self,
        blob: &BlobKey,
        block_id: &BlockId,
        data: Bytes,
        content_md5: Option<&str>,
    ) -> TransferResult<()>;

    /// Atomically replace blob content with the listed blocks
    async fn put_block_list(
        &self,
        blob: &BlobKey,
        blocks: &[BlockListItem],
        headers: &BlobHeaders,
        metadata: &Metadata,
        condition: &AccessCondition,
    ) -> TransferResult<CommitResult>;

    /// Read the block list, filtered
    async fn get_block_list(
        &self,
        blob: &BlobKey,
        filter: BlockListFilter,
    ) -> TransferResult<Vec<BlockInfo>>;

    /// Read committed content, optionally a range of it
    async fn get_content(
        &self,
        blob: &BlobKey,
        range: Option<ByteRange>,
        condition: &AccessCondition,
    ) -> TransferResult<DownloadedContent>;

    /// Replace blob content in one request, no block protocol involved
    async fn put_blob(
        &self,
        blob: &BlobKey,
        data: Bytes,
        content_md5: Option<&str>,
        headers: &BlobHeaders,
        metadata: &Metadata,
        condition: &AccessCondition,
    ) -> TransferResult<CommitResult>;

    /// Read properties and metadata without content
    async fn get_properties(&self, blob: &BlobKey) -> TransferResult<BlobAttributes>;

    /// Overwrite content settings and metadata without touching content
    async fn set_properties(
        &self,
        blob: &BlobKey,
        headers: &BlobHeaders,
        metadata: &Metadata,
        condition: &AccessCondition,
    ) -> TransferResult<CommitResult>;
}
