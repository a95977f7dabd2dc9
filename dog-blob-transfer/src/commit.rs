use tracing::{info, instrument};

use crate::block_id::validate_block_list;
use crate::context::{OperationContext, WireOperation, WireRequest};
use crate::governor::ExecutionGovernor;
use crate::retry::{run_request, RetryPolicy};
use crate::{
    AccessCondition, BlobHeaders, BlobKey, BlockBlobService, BlockListItem, CommitResult, Metadata,
    ServiceLimits, TransferError, TransferResult,
};

/// Everything a commit sends besides the block list itself
#[derive(Debug, Clone, Default)]
pub struct CommitRequest {
    pub headers: BlobHeaders,
    pub metadata: Metadata,
    pub condition: AccessCondition,
}

/// Issues the block-list commit that fixes a blob's content and properties
pub struct CommitCoordinator<'a> {
    service: &'a dyn BlockBlobService,
    blob: &'a BlobKey,
    limits: &'a ServiceLimits,
}

impl<'a> CommitCoordinator<'a> {
    pub fn new(
        service: &'a dyn BlockBlobService,
        blob: &'a BlobKey,
        limits: &'a ServiceLimits,
    ) -> Self {
        Self { service, blob, limits }
    }

    /// Pre-flight checks on a list about to be committed
    pub fn check(&self, blocks: &[BlockListItem]) -> TransferResult<()> {
        if blocks.len() as u64 > u64::from(self.limits.max_block_count) {
            return Err(TransferError::validation(format!(
                "Block list has {} entries, limit is {}",
                blocks.len(),
                self.limits.max_block_count
            )));
        }
        validate_block_list(blocks, self.limits.max_block_id_length)
    }

    /// Commit `blocks` in order. A failed precondition leaves the blob untouched.
    #[instrument(skip_all, fields(blob = %self.blob, blocks = blocks.len()))]
    pub async fn commit(
        &self,
        blocks: &[BlockListItem],
        request: &CommitRequest,
        governor: &ExecutionGovernor,
        policy: &dyn RetryPolicy,
        ctx: &OperationContext,
    ) -> TransferResult<CommitResult> {
        self.check(blocks)?;

        let result = run_request(governor, policy, || {
            let wire = WireRequest::new(WireOperation::PutBlockList, self.blob)
                .with_content_md5(request.headers.content_md5.as_deref());
            ctx.observe(
                wire,
                self.service.put_block_list(
                    self.blob,
                    blocks,
                    &request.headers,
                    &request.metadata,
                    &request.condition,
                ),
            )
        })
        .await?;

        info!(etag = %result.etag, "Committed block list");
        Ok(result)
    }
}
