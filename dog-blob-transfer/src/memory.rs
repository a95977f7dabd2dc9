use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::integrity::md5_base64;
use crate::{
    AccessCondition, BlobAttributes, BlobHeaders, BlobKey, BlobProperties, BlockBlobService,
    BlockId, BlockInfo, BlockListFilter, BlockListItem, BlockMode, ByteRange, CommitResult,
    DownloadedContent, Metadata, ProtocolCode, ServiceLimits, TransferError, TransferResult,
    WireOperation,
};

#[derive(Debug, Clone)]
struct StoredBlock {
    id: BlockId,
    data: Bytes,
}

#[derive(Debug, Default)]
struct StoredBlob {
    committed: Vec<StoredBlock>,
    /// Staged blocks in upload order
    uncommitted: Vec<StoredBlock>,
    content: Bytes,
    properties: BlobProperties,
    metadata: Metadata,
    /// Set once any commit or single-shot upload succeeded
    exists: bool,
}

#[derive(Debug, Default)]
struct Faults {
    transient: HashMap<WireOperation, u32>,
    corrupt_blocks: u32,
    latency: HashMap<WireOperation, Duration>,
    default_latency: Duration,
}

/// In-memory block blob service for testing and development
pub struct MemoryBlockBlobService {
    blobs: Arc<RwLock<HashMap<BlobKey, StoredBlob>>>,
    faults: Mutex<Faults>,
    limits: ServiceLimits,
    calls: Mutex<HashMap<WireOperation, u32>>,
    received_block_md5: Mutex<Vec<Option<String>>>,
    etag_counter: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a request leaves the service
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryBlockBlobService {
    pub fn new() -> Self {
        Self::with_limits(ServiceLimits::default())
    }

    pub fn with_limits(limits: ServiceLimits) -> Self {
        Self {
            blobs: Arc::new(RwLock::new(HashMap::new())),
            faults: Mutex::new(Faults::default()),
            limits,
            calls: Mutex::new(HashMap::new()),
            received_block_md5: Mutex::new(Vec::new()),
            etag_counter: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every response by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.faults.lock().default_latency = latency;
        self
    }

    /// Delay responses of one operation
    pub fn set_latency(&self, operation: WireOperation, latency: Duration) {
        self.faults.lock().latency.insert(operation, latency);
    }

    /// Fail the next `times` calls of `operation` with a transient error
    pub fn fail_next(&self, operation: WireOperation, times: u32) {
        *self.faults.lock().transient.entry(operation).or_default() += times;
    }

    /// Flip a byte in the body of the next `times` staged blocks
    pub fn corrupt_next_blocks(&self, times: u32) {
        self.faults.lock().corrupt_blocks += times;
    }

    /// Calls received for `operation`, failed ones included
    pub fn calls(&self, operation: WireOperation) -> u32 {
        self.calls.lock().get(&operation).copied().unwrap_or(0)
    }

    /// Highest number of block or blob uploads seen in flight at once
    pub fn max_concurrent_uploads(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Content-MD5 values received with staged blocks, in arrival order
    pub fn received_block_md5s(&self) -> Vec<Option<String>> {
        self.received_block_md5.lock().clone()
    }

    /// Committed content, bypassing the wire
    pub fn content_of(&self, blob: &BlobKey) -> Option<Bytes> {
        self.blobs
            .read()
            .get(blob)
            .filter(|b| b.exists)
            .map(|b| b.content.clone())
    }

    fn next_etag(&self) -> String {
        format!("\"0x{:016X}\"", self.etag_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Common request prologue: count the call, wait out latency, inject failures
    async fn enter(&self, operation: WireOperation) -> TransferResult<()> {
        *self.calls.lock().entry(operation).or_default() += 1;

        let (latency, fail) = {
            let mut faults = self.faults.lock();
            let latency = faults.latency.get(&operation).copied().unwrap_or(faults.default_latency);
            let fail = match faults.transient.get_mut(&operation) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            };
            (latency, fail)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            debug!(?operation, "Injecting transient failure");
            return Err(TransferError::protocol(ProtocolCode::ServerBusy, "The server is busy"));
        }
        Ok(())
    }

    fn track_upload(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    fn check_block_id(&self, id: &BlockId) -> TransferResult<()> {
        match id.decode() {
            Some(raw) if !raw.is_empty() && raw.len() <= self.limits.max_block_id_length => Ok(()),
            _ => Err(TransferError::protocol(
                ProtocolCode::InvalidBlockId,
                format!("The specified block id {:?} is invalid", id.as_str()),
            )),
        }
    }
}

impl Default for MemoryBlockBlobService {
    fn default() -> Self {
        Self::new()
    }
}

fn check_md5(data: &[u8], content_md5: Option<&str>) -> TransferResult<()> {
    if let Some(expected) = content_md5 {
        let actual = md5_base64(data);
        if actual != expected {
            return Err(TransferError::protocol(
                ProtocolCode::Md5Mismatch,
                format!("Content-MD5 {} does not match computed {}", expected, actual),
            ));
        }
    }
    Ok(())
}

fn check_condition(blob: Option<&StoredBlob>, condition: &AccessCondition) -> TransferResult<()> {
    let current = blob.filter(|b| b.exists).map(|b| &b.properties);
    let etag = current.and_then(|p| p.etag.as_deref());
    let modified = current.and_then(|p| p.last_modified);

    let met = condition
        .if_match
        .as_deref()
        .map_or(true, |want| current.is_some() && (want == "*" || etag == Some(want)))
        && condition
            .if_none_match
            .as_deref()
            .map_or(true, |want| if want == "*" { current.is_none() } else { etag != Some(want) })
        && condition
            .if_modified_since
            .map_or(true, |since| modified.map_or(false, |m| m > since))
        && condition
            .if_unmodified_since
            .map_or(true, |since| modified.map_or(true, |m| m <= since));

    if met {
        Ok(())
    } else {
        Err(TransferError::protocol(
            ProtocolCode::PreconditionFailed,
            "The condition specified using HTTP conditional header(s) is not met",
        ))
    }
}

fn blob_not_found(blob: &BlobKey) -> TransferError {
    TransferError::protocol(ProtocolCode::BlobNotFound, format!("The blob {} does not exist", blob))
}

#[async_trait]
impl BlockBlobService for MemoryBlockBlobService {
    async fn put_block(
        &self,
        blob: &BlobKey,
        block_id: &BlockId,
        data: Bytes,
        content_md5: Option<&str>,
    ) -> TransferResult<()> {
        let _guard = self.track_upload();
        self.enter(WireOperation::PutBlock).await?;
        self.received_block_md5.lock().push(content_md5.map(str::to_string));

        self.check_block_id(block_id)?;
        if data.len() as u64 > self.limits.max_block_size {
            return Err(TransferError::protocol(
                ProtocolCode::RequestBodyTooLarge,
                format!("Block of {} bytes exceeds {}", data.len(), self.limits.max_block_size),
            ));
        }

        let data = {
            let mut faults = self.faults.lock();
            if faults.corrupt_blocks > 0 && !data.is_empty() {
                faults.corrupt_blocks -= 1;
                let mut corrupted = BytesMut::from(&data[..]);
                corrupted[0] ^= 0xFF;
                corrupted.freeze()
            } else {
                data
            }
        };
        check_md5(&data, content_md5)?;

        let mut blobs = self.blobs.write();
        let stored = blobs.entry(blob.clone()).or_default();
        let block = StoredBlock { id: block_id.clone(), data };
        match stored.uncommitted.iter_mut().find(|b| b.id == *block_id) {
            Some(existing) => *existing = block,
            None => stored.uncommitted.push(block),
        }
        Ok(())
    }

    async fn put_block_list(
        &self,
        blob: &BlobKey,
        blocks: &[BlockListItem],
        headers: &BlobHeaders,
        metadata: &Metadata,
        condition: &AccessCondition,
    ) -> TransferResult<CommitResult> {
        self.enter(WireOperation::PutBlockList).await?;

        if let Some(first) = blocks.first() {
            if blocks.iter().any(|b| b.id.len() != first.id.len()) {
                return Err(TransferError::protocol(
                    ProtocolCode::InvalidBlockList,
                    "All block ids in a block list must have the same length",
                ));
            }
        }
        for item in blocks {
            self.check_block_id(&item.id)?;
        }

        let mut blobs = self.blobs.write();
        check_condition(blobs.get(blob), condition)?;
        let stored = blobs.entry(blob.clone()).or_default();

        let mut resolved = Vec::with_capacity(blocks.len());
        let mut consumed = HashSet::new();
        for item in blocks {
            let staged = || stored.uncommitted.iter().find(|b| b.id == item.id);
            let committed = || stored.committed.iter().find(|b| b.id == item.id);
            let found = match item.mode {
                BlockMode::Uncommitted => staged().map(|b| (b, true)),
                BlockMode::Committed => committed().map(|b| (b, false)),
                BlockMode::Latest => staged()
                    .map(|b| (b, true))
                    .or_else(|| committed().map(|b| (b, false))),
            };
            let (block, from_staging) = found.ok_or_else(|| {
                TransferError::protocol(
                    ProtocolCode::InvalidBlockList,
                    format!("The specified block list is invalid: block {} not found", item.id),
                )
            })?;
            if from_staging {
                consumed.insert(block.id.clone());
            }
            resolved.push(block.clone());
        }

        let mut content = BytesMut::with_capacity(resolved.iter().map(|b| b.data.len()).sum());
        for block in &resolved {
            content.extend_from_slice(&block.data);
        }

        let etag = self.next_etag();
        let last_modified = Utc::now();
        stored.uncommitted.retain(|b| !consumed.contains(&b.id));
        stored.committed = resolved;
        stored.content = content.freeze();
        stored.properties = BlobProperties {
            etag: Some(etag.clone()),
            last_modified: Some(last_modified),
            content_md5: headers.content_md5.clone(),
            content_type: headers.content_type.clone(),
            length: stored.content.len() as u64,
        };
        stored.metadata = metadata.clone();
        stored.exists = true;

        Ok(CommitResult { etag, last_modified })
    }

    async fn get_block_list(
        &self,
        blob: &BlobKey,
        filter: BlockListFilter,
    ) -> TransferResult<Vec<BlockInfo>> {
        self.enter(WireOperation::GetBlockList).await?;

        let blobs = self.blobs.read();
        let stored = blobs.get(blob).ok_or_else(|| blob_not_found(blob))?;

        let describe = |block: &StoredBlock, mode| BlockInfo {
            id: block.id.clone(),
            size: block.data.len() as u64,
            mode,
        };
        let mut list = Vec::new();
        if filter.includes_committed() {
            list.extend(stored.committed.iter().map(|b| describe(b, BlockMode::Committed)));
        }
        if filter.includes_uncommitted() {
            list.extend(stored.uncommitted.iter().map(|b| describe(b, BlockMode::Uncommitted)));
        }
        Ok(list)
    }

    async fn get_content(
        &self,
        blob: &BlobKey,
        range: Option<ByteRange>,
        condition: &AccessCondition,
    ) -> TransferResult<DownloadedContent> {
        self.enter(WireOperation::GetContent).await?;

        let blobs = self.blobs.read();
        let stored = blobs.get(blob).filter(|b| b.exists).ok_or_else(|| blob_not_found(blob))?;
        check_condition(Some(stored), condition)?;

        let total = stored.content.len() as u64;
        let data = match range {
            None => stored.content.clone(),
            Some(range) => {
                if !range.is_valid(total) {
                    return Err(TransferError::protocol(
                        ProtocolCode::InvalidRange,
                        format!("Range {:?} is not satisfiable for {} bytes", range, total),
                    ));
                }
                let start = range.start as usize;
                stored.content.slice(start..start + range.length(total) as usize)
            }
        };

        Ok(DownloadedContent {
            data,
            attributes: BlobAttributes {
                properties: stored.properties.clone(),
                metadata: stored.metadata.clone(),
            },
        })
    }

    async fn put_blob(
        &self,
        blob: &BlobKey,
        data: Bytes,
        content_md5: Option<&str>,
        headers: &BlobHeaders,
        metadata: &Metadata,
        condition: &AccessCondition,
    ) -> TransferResult<CommitResult> {
        let _guard = self.track_upload();
        self.enter(WireOperation::PutBlob).await?;

        if data.len() as u64 > self.limits.max_single_blob_upload_threshold {
            return Err(TransferError::protocol(
                ProtocolCode::RequestBodyTooLarge,
                format!("Blob of {} bytes is too large for a single upload", data.len()),
            ));
        }
        check_md5(&data, content_md5)?;

        let mut blobs = self.blobs.write();
        check_condition(blobs.get(blob), condition)?;
        let stored = blobs.entry(blob.clone()).or_default();

        let etag = self.next_etag();
        let last_modified = Utc::now();
        stored.committed.clear();
        stored.uncommitted.clear();
        stored.properties = BlobProperties {
            etag: Some(etag.clone()),
            last_modified: Some(last_modified),
            content_md5: headers.content_md5.clone().or_else(|| content_md5.map(str::to_string)),
            content_type: headers.content_type.clone(),
            length: data.len() as u64,
        };
        stored.content = data;
        stored.metadata = metadata.clone();
        stored.exists = true;

        Ok(CommitResult { etag, last_modified })
    }

    async fn get_properties(&self, blob: &BlobKey) -> TransferResult<BlobAttributes> {
        self.enter(WireOperation::GetProperties).await?;

        let blobs = self.blobs.read();
        let stored = blobs.get(blob).filter(|b| b.exists).ok_or_else(|| blob_not_found(blob))?;
        Ok(BlobAttributes {
            properties: stored.properties.clone(),
            metadata: stored.metadata.clone(),
        })
    }

    async fn set_properties(
        &self,
        blob: &BlobKey,
        headers: &BlobHeaders,
        metadata: &Metadata,
        condition: &AccessCondition,
    ) -> TransferResult<CommitResult> {
        self.enter(WireOperation::SetProperties).await?;

        let mut blobs = self.blobs.write();
        check_condition(blobs.get(blob), condition)?;
        let stored = blobs.get_mut(blob).filter(|b| b.exists).ok_or_else(|| blob_not_found(blob))?;

        let etag = self.next_etag();
        let last_modified = Utc::now();
        stored.properties.etag = Some(etag.clone());
        stored.properties.last_modified = Some(last_modified);
        stored.properties.content_md5 = headers.content_md5.clone();
        stored.properties.content_type = headers.content_type.clone();
        stored.metadata = metadata.clone();

        Ok(CommitResult { etag, last_modified })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> BlobKey {
        BlobKey::new("container", "blob")
    }

    async fn stage(service: &MemoryBlockBlobService, index: u16, body: &'static str) -> BlockId {
        let id = BlockId::from_index(index);
        service.put_block(&key(), &id, Bytes::from_static(body.as_bytes()), None).await.unwrap();
        id
    }

    async fn commit(
        service: &MemoryBlockBlobService,
        list: &[BlockListItem],
    ) -> TransferResult<CommitResult> {
        let headers = BlobHeaders::default();
        service
            .put_block_list(&key(), list, &headers, &Metadata::new(), &AccessCondition::none())
            .await
    }

    async fn put(
        service: &MemoryBlockBlobService,
        body: &'static [u8],
        condition: &AccessCondition,
    ) -> TransferResult<CommitResult> {
        let headers = BlobHeaders::default();
        service
            .put_blob(&key(), Bytes::from_static(body), None, &headers, &Metadata::new(), condition)
            .await
    }

    async fn uncommitted(service: &MemoryBlockBlobService) -> Vec<BlockInfo> {
        service.get_block_list(&key(), BlockListFilter::Uncommitted).await.unwrap()
    }

    #[tokio::test]
    async fn commit_concatenates_in_list_order_with_repeats() {
        let service = MemoryBlockBlobService::new();
        let ids = vec![
            stage(&service, 0, "0").await,
            stage(&service, 1, "1").await,
            stage(&service, 2, "2").await,
        ];
        let list: Vec<_> = [2, 0, 1, 2]
            .iter()
            .map(|i| BlockListItem::new(ids[*i].clone()))
            .collect();

        commit(&service, &list).await.unwrap();

        assert_eq!(service.content_of(&key()).unwrap(), Bytes::from_static(b"2012"));
        let committed = service.get_block_list(&key(), BlockListFilter::Committed).await.unwrap();
        assert_eq!(committed.len(), 4);
        assert!(uncommitted(&service).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_block_rejects_whole_commit() {
        let service = MemoryBlockBlobService::new();
        let id = stage(&service, 0, "0").await;
        let list = vec![BlockListItem::new(id), BlockListItem::new(BlockId::from_index(9))];

        let err = commit(&service, &list).await.unwrap_err();

        assert_eq!(err.protocol_code(), Some(ProtocolCode::InvalidBlockList));
        assert!(service.content_of(&key()).is_none());
        assert_eq!(uncommitted(&service).await.len(), 1);
    }

    #[tokio::test]
    async fn committed_mode_ignores_staged_blocks() {
        let service = MemoryBlockBlobService::new();
        let id = stage(&service, 0, "0").await;
        let list = vec![BlockListItem::with_mode(id, BlockMode::Committed)];

        let err = commit(&service, &list).await.unwrap_err();
        assert_eq!(err.protocol_code(), Some(ProtocolCode::InvalidBlockList));
    }

    #[tokio::test]
    async fn transactional_md5_is_checked() {
        let service = MemoryBlockBlobService::new();
        let id = BlockId::from_index(0);

        let err = service
            .put_block(&key(), &id, Bytes::from_static(b"abc"), Some("MDAwMA=="))
            .await
            .unwrap_err();
        assert_eq!(err.protocol_code(), Some(ProtocolCode::Md5Mismatch));

        let md5 = md5_base64(b"abc");
        service.put_block(&key(), &id, Bytes::from_static(b"abc"), Some(&md5)).await.unwrap();
        assert_eq!(service.received_block_md5s(), vec![Some("MDAwMA==".to_string()), Some(md5)]);
    }

    #[tokio::test]
    async fn conditions_are_evaluated_against_current_etag() {
        let service = MemoryBlockBlobService::new();
        let first = put(&service, b"v1", &AccessCondition::none()).await.unwrap();

        let stale = AccessCondition::if_match("\"0xDEAD\"");
        let err = put(&service, b"v2", &stale).await.unwrap_err();
        assert_eq!(err.protocol_code(), Some(ProtocolCode::PreconditionFailed));

        let second = put(&service, b"v2", &AccessCondition::if_match(first.etag.clone()))
            .await
            .unwrap();
        assert_ne!(first.etag, second.etag);

        let create_only = AccessCondition::if_none_match("*");
        assert!(put(&service, b"v3", &create_only).await.is_err());
        assert_eq!(service.content_of(&key()).unwrap(), Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let service = MemoryBlockBlobService::new();
        service.fail_next(WireOperation::PutBlock, 1);
        let id = BlockId::from_index(0);

        let err = service.put_block(&key(), &id, Bytes::from_static(b"x"), None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(service.put_block(&key(), &id, Bytes::from_static(b"x"), None).await.is_ok());
        assert_eq!(service.calls(WireOperation::PutBlock), 2);
    }

    #[tokio::test]
    async fn ranged_reads() {
        let service = MemoryBlockBlobService::new();
        put(&service, b"0123456789", &AccessCondition::none()).await.unwrap();

        let part = service
            .get_content(&key(), Some(ByteRange::new(2, Some(4))), &AccessCondition::none())
            .await
            .unwrap();
        assert_eq!(part.data, Bytes::from_static(b"234"));

        let err = service
            .get_content(&key(), Some(ByteRange::from_start(10)), &AccessCondition::none())
            .await
            .unwrap_err();
        assert_eq!(err.protocol_code(), Some(ProtocolCode::InvalidRange));
    }
}
