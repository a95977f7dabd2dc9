use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{info, instrument};

use crate::commit::{CommitCoordinator, CommitRequest};
use crate::context::{OperationContext, WireOperation, WireRequest};
use crate::dispatcher::{ChunkTransfer, Dispatcher};
use crate::download::DownloadAssembler;
use crate::governor::ExecutionGovernor;
use crate::integrity::IntegrityVerifier;
use crate::planner::{plan, ChunkReader, PlanMode, PlannedChunk, UploadSource};
use crate::retry::run_request;
use crate::{
    AccessCondition, BlobAttributes, BlobHeaders, BlobKey, BlobProperties, BlockBlobService,
    BlockId, BlockIdSequencer, BlockInfo, BlockListFilter, BlockListItem, BlockMode, ByteRange,
    CommitResult, Metadata, TransferError, TransferOptions, TransferResult,
};

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Client-side handle on one block blob.
///
/// Holds the blob's key and a cached copy of its properties and metadata.
/// Commits send the cached metadata and content settings; reads refresh them.
pub struct BlockBlob {
    service: Arc<dyn BlockBlobService>,
    key: BlobKey,
    properties: BlobProperties,
    metadata: Metadata,
}

impl BlockBlob {
    pub fn new(service: Arc<dyn BlockBlobService>, key: BlobKey) -> Self {
        Self {
            service,
            key,
            properties: BlobProperties::default(),
            metadata: Metadata::new(),
        }
    }

    pub fn key(&self) -> &BlobKey {
        &self.key
    }

    pub fn properties(&self) -> &BlobProperties {
        &self.properties
    }

    /// Content settings to send with the next commit
    pub fn properties_mut(&mut self) -> &mut BlobProperties {
        &mut self.properties
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Metadata to send with the next commit
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn governor(&self, options: &TransferOptions, ctx: &OperationContext) -> ExecutionGovernor {
        ExecutionGovernor::new(options.maximum_execution_time, ctx.cancellation().clone())
    }

    fn apply_commit(&mut self, result: &CommitResult) {
        self.properties.etag = Some(result.etag.clone());
        self.properties.last_modified = Some(result.last_modified);
    }

    fn apply_attributes(&mut self, attributes: BlobAttributes) {
        self.properties = attributes.properties;
        self.metadata = attributes.metadata;
    }

    /// Stage one block under a caller-chosen id.
    ///
    /// A supplied `content_md5` is sent exactly as given; otherwise one is
    /// computed when transactional MD5 is on.
    #[instrument(skip_all, fields(blob = %self.key, block_id = %id, bytes = data.len()))]
    pub async fn upload_block(
        &self,
        id: &BlockId,
        data: Bytes,
        content_md5: Option<&str>,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<()> {
        options.validate()?;
        if data.len() as u64 > options.limits.max_block_size {
            return Err(TransferError::validation(format!(
                "Block of {} bytes exceeds maximum block size {}",
                data.len(),
                options.limits.max_block_size
            )));
        }
        let digest = IntegrityVerifier::from_options(options).request_digest(&data, content_md5);
        let governor = self.governor(options, ctx);

        run_request(&governor, options.retry_policy.as_ref(), || {
            let wire = WireRequest::new(WireOperation::PutBlock, &self.key)
                .with_block_id(id)
                .with_content_md5(digest.as_deref())
                .with_content_length(data.len() as u64);
            ctx.observe(
                wire,
                self.service.put_block(&self.key, id, data.clone(), digest.as_deref()),
            )
        })
        .await
    }

    /// Commit `blocks` as the blob's content, together with the cached
    /// content settings and metadata
    #[instrument(skip_all, fields(blob = %self.key, blocks = blocks.len()))]
    pub async fn upload_block_list(
        &mut self,
        blocks: &[BlockListItem],
        access: &AccessCondition,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<CommitResult> {
        options.validate()?;
        let governor = self.governor(options, ctx);
        let request = CommitRequest {
            headers: BlobHeaders::from_properties(&self.properties),
            metadata: self.metadata.clone(),
            condition: access.clone(),
        };

        let result = CommitCoordinator::new(self.service.as_ref(), &self.key, &options.limits)
            .commit(blocks, &request, &governor, options.retry_policy.as_ref(), ctx)
            .await?;
        self.apply_commit(&result);
        Ok(result)
    }

    pub async fn download_block_list(
        &self,
        filter: BlockListFilter,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<Vec<BlockInfo>> {
        let governor = self.governor(options, ctx);
        DownloadAssembler::new(self.service.as_ref(), &self.key)
            .block_list(filter, &governor, options.retry_policy.as_ref(), ctx)
            .await
    }

    /// Upload `source` as the blob's new content.
    ///
    /// Small sized content goes up in one PUT. Everything else is cut into
    /// blocks, staged in parallel and committed in order; if any block fails
    /// nothing is committed and staged blocks are left for the service to
    /// collect.
    #[instrument(skip_all, fields(blob = %self.key, source = ?source))]
    pub async fn upload_from_source(
        &mut self,
        source: UploadSource,
        access: &AccessCondition,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<CommitResult> {
        let plan = plan(&source, options)?;
        let governor = Arc::new(self.governor(options, ctx));
        let mut reader = ChunkReader::new(source, &plan, options);

        let mut headers = BlobHeaders::from_properties(&self.properties);
        if !options.store_blob_content_md5 {
            headers.content_md5 = None;
        }
        let result = match plan.mode {
            PlanMode::SinglePut { .. } => {
                let data = reader.next_chunk().await?.map(|c| c.data).unwrap_or_default();
                let request_md5 =
                    IntegrityVerifier::from_options(options).request_digest(&data, None);
                if let Some(digest) = reader.finish_digest() {
                    headers.content_md5 = Some(digest);
                }

                let result = run_request(&governor, options.retry_policy.as_ref(), || {
                    let wire = WireRequest::new(WireOperation::PutBlob, &self.key)
                        .with_content_md5(request_md5.as_deref())
                        .with_content_length(data.len() as u64);
                    ctx.observe(
                        wire,
                        self.service.put_blob(
                            &self.key,
                            data.clone(),
                            request_md5.as_deref(),
                            &headers,
                            &self.metadata,
                            access,
                        ),
                    )
                })
                .await?;
                if headers.content_md5.is_none() {
                    headers.content_md5 = request_md5;
                }
                result
            }
            PlanMode::Blocks { .. } | PlanMode::Sequential { .. } => {
                let ids = BlockIdSequencer::new();
                let count = plan.chunk_count().unwrap_or(options.limits.max_block_count);
                ids.check_compatible(count, &[], options.limits.max_block_id_length)?;
                let stage = StageBlock {
                    service: self.service.clone(),
                    blob: self.key.clone(),
                    ids,
                    ctx: ctx.clone(),
                };
                let dispatcher = Dispatcher::new(
                    stage,
                    governor.clone(),
                    options.retry_policy.clone(),
                    plan.parallelism,
                );
                let ids = dispatcher.run(&mut reader).await?;

                if let Some(digest) = reader.finish_digest() {
                    headers.content_md5 = Some(digest);
                }
                let blocks: Vec<BlockListItem> = ids
                    .into_iter()
                    .map(|id| BlockListItem::with_mode(id, BlockMode::Uncommitted))
                    .collect();
                let request = CommitRequest {
                    headers: headers.clone(),
                    metadata: self.metadata.clone(),
                    condition: access.clone(),
                };
                CommitCoordinator::new(self.service.as_ref(), &self.key, &options.limits)
                    .commit(&blocks, &request, &governor, options.retry_policy.as_ref(), ctx)
                    .await?
            }
        };

        self.apply_commit(&result);
        self.properties.content_md5 = headers.content_md5;
        self.properties.length = reader.bytes_read();
        info!(
            bytes = reader.bytes_read(),
            chunks = reader.chunks_read(),
            attempts = governor.attempts(),
            elapsed = ?governor.elapsed(),
            "Upload complete"
        );
        Ok(result)
    }

    pub async fn upload_from_bytes<B: Into<Bytes>>(
        &mut self,
        data: B,
        access: &AccessCondition,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<CommitResult> {
        self.upload_from_source(UploadSource::from_bytes(data), access, options, ctx).await
    }

    /// Upload UTF-8 text, defaulting the content type to plain text
    pub async fn upload_text(
        &mut self,
        text: &str,
        access: &AccessCondition,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<CommitResult> {
        if self.properties.content_type.is_none() {
            self.properties.content_type = Some(TEXT_CONTENT_TYPE.to_string());
        }
        self.upload_from_bytes(Bytes::copy_from_slice(text.as_bytes()), access, options, ctx).await
    }

    /// Download content, or a range of it, refreshing the cached attributes
    #[instrument(skip_all, fields(blob = %self.key))]
    pub async fn download_to_bytes(
        &mut self,
        range: Option<ByteRange>,
        access: &AccessCondition,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<Bytes> {
        let governor = self.governor(options, ctx);
        let downloaded = DownloadAssembler::new(self.service.as_ref(), &self.key)
            .content(
                range,
                access,
                IntegrityVerifier::from_options(options),
                &governor,
                options.retry_policy.as_ref(),
                ctx,
            )
            .await?;
        self.apply_attributes(downloaded.attributes);
        Ok(downloaded.data)
    }

    pub async fn download_text(
        &mut self,
        access: &AccessCondition,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<String> {
        let data = self.download_to_bytes(None, access, options, ctx).await?;
        String::from_utf8(data.to_vec())
            .map_err(|e| {
                TransferError::validation(format!("Blob content is not valid UTF-8: {}", e))
            })
    }

    /// Refresh cached properties and metadata from the service
    pub async fn download_attributes(
        &mut self,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<BlobAttributes> {
        let governor = self.governor(options, ctx);
        let attributes = run_request(&governor, options.retry_policy.as_ref(), || {
            ctx.observe(
                WireRequest::new(WireOperation::GetProperties, &self.key),
                self.service.get_properties(&self.key),
            )
        })
        .await?;
        self.apply_attributes(attributes.clone());
        Ok(attributes)
    }

    /// Push the cached content settings to the service
    pub async fn upload_properties(
        &mut self,
        access: &AccessCondition,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<CommitResult> {
        self.set_attributes(access, options, ctx).await
    }

    /// Push the cached metadata to the service
    pub async fn upload_metadata(
        &mut self,
        access: &AccessCondition,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<CommitResult> {
        self.set_attributes(access, options, ctx).await
    }

    async fn set_attributes(
        &mut self,
        access: &AccessCondition,
        options: &TransferOptions,
        ctx: &OperationContext,
    ) -> TransferResult<CommitResult> {
        let governor = self.governor(options, ctx);
        let headers = BlobHeaders::from_properties(&self.properties);
        let result = run_request(&governor, options.retry_policy.as_ref(), || {
            let wire = WireRequest::new(WireOperation::SetProperties, &self.key)
                .with_content_md5(headers.content_md5.as_deref());
            ctx.observe(
                wire,
                self.service.set_properties(&self.key, &headers, &self.metadata, access),
            )
        })
        .await?;
        self.apply_commit(&result);
        Ok(result)
    }
}

impl std::fmt::Debug for BlockBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBlob")
            .field("key", &self.key)
            .field("properties", &self.properties)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Stages one planned chunk as a block named after its position
struct StageBlock {
    service: Arc<dyn BlockBlobService>,
    blob: BlobKey,
    ids: BlockIdSequencer,
    ctx: OperationContext,
}

#[async_trait]
impl ChunkTransfer for StageBlock {
    type Output = BlockId;

    async fn attempt(&self, chunk: &PlannedChunk) -> TransferResult<BlockId> {
        let id = self.ids.id_for(chunk.position);
        let md5 = chunk.content_md5.as_deref();
        let wire = WireRequest::new(WireOperation::PutBlock, &self.blob)
            .with_block_id(&id)
            .with_content_md5(md5)
            .with_content_length(chunk.data.len() as u64);
        self.ctx
            .observe(wire, self.service.put_block(&self.blob, &id, chunk.data.clone(), md5))
            .await?;
        Ok(id)
    }
}
