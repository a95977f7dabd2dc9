use tracing::{debug, instrument};

use crate::context::{OperationContext, WireOperation, WireRequest};
use crate::governor::ExecutionGovernor;
use crate::integrity::IntegrityVerifier;
use crate::retry::{run_request, RetryPolicy};
use crate::{
    AccessCondition, BlobKey, BlockBlobService, BlockInfo, BlockListFilter, ByteRange,
    DownloadedContent, TransferResult,
};

/// Reads committed state back: content and block lists
pub struct DownloadAssembler<'a> {
    service: &'a dyn BlockBlobService,
    blob: &'a BlobKey,
}

impl<'a> DownloadAssembler<'a> {
    pub fn new(service: &'a dyn BlockBlobService, blob: &'a BlobKey) -> Self {
        Self { service, blob }
    }

    /// Fetch content, checking a full download against the stored content MD5.
    ///
    /// Ranged reads are never checked: the stored digest covers the whole blob.
    #[instrument(skip_all, fields(blob = %self.blob, range = ?range))]
    pub async fn content(
        &self,
        range: Option<ByteRange>,
        condition: &AccessCondition,
        integrity: IntegrityVerifier,
        governor: &ExecutionGovernor,
        policy: &dyn RetryPolicy,
        ctx: &OperationContext,
    ) -> TransferResult<DownloadedContent> {
        let full = range.is_none();
        let downloaded = run_request(governor, policy, || {
            let wire = WireRequest::new(WireOperation::GetContent, self.blob);
            ctx.observe(wire, self.service.get_content(self.blob, range.clone(), condition))
        })
        .await?;

        if full {
            integrity.verify_download(
                &downloaded.data,
                downloaded.attributes.properties.content_md5.as_deref(),
            )?;
        }
        debug!(bytes = downloaded.data.len(), "Downloaded content");
        Ok(downloaded)
    }

    /// Filtered block list: committed entries in commit order, then staged
    /// entries in upload order
    #[instrument(skip_all, fields(blob = %self.blob, ?filter))]
    pub async fn block_list(
        &self,
        filter: BlockListFilter,
        governor: &ExecutionGovernor,
        policy: &dyn RetryPolicy,
        ctx: &OperationContext,
    ) -> TransferResult<Vec<BlockInfo>> {
        run_request(governor, policy, || {
            let wire = WireRequest::new(WireOperation::GetBlockList, self.blob);
            ctx.observe(wire, self.service.get_block_list(self.blob, filter))
        })
        .await
    }
}
