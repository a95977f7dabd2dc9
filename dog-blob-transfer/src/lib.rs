//! # dog-blob-transfer: Chunked parallel block-blob transfers
//!
//! `dog-blob-transfer` moves large objects to and from a block-oriented object store.
//! Content is cut into blocks, staged with bounded parallelism and made visible by one
//! atomic block-list commit, so a blob is never observed half-written.
//!
//! ## Key Features
//!
//! - **Bounded parallelism**: up to `parallelism_factor` blocks in flight, reassembled by
//!   position
//! - **Integrity**: per-request transactional MD5 and a whole-object content MD5
//! - **Execution budgets**: one deadline across every attempt of an operation, checked
//!   before each attempt
//! - **Pluggable wire layer**: anything implementing [`BlockBlobService`], with an
//!   in-memory one for tests
//! - **Observable**: request hooks and per-request results on [`OperationContext`],
//!   `tracing` spans throughout
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_blob_transfer::prelude::*;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> TransferResult<()> {
//! let service = Arc::new(MemoryBlockBlobService::new());
//! let mut blob = BlockBlob::new(service, BlobKey::new("media", "movie.mp4"));
//!
//! let options = TransferOptions::new()
//!     .with_stream_write_size(4 * 1024 * 1024)
//!     .with_single_blob_upload_threshold(8 * 1024 * 1024)
//!     .with_parallelism(4)
//!     .with_transactional_md5(true);
//! let ctx = OperationContext::new();
//!
//! let content = vec![7u8; 20 * 1024 * 1024];
//! blob.upload_from_bytes(content.clone(), &AccessCondition::none(), &options, &ctx).await?;
//!
//! let downloaded = blob.download_to_bytes(None, &AccessCondition::none(), &options, &ctx).await?;
//! assert_eq!(downloaded.len(), content.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │      BlockBlob       │  ← upload / download / block list operations
//! ├──────────────────────┤
//! │ Planner, Dispatcher, │  ← chunking, parallel staging, commit, reads
//! │ Commit, Download     │
//! ├──────────────────────┤
//! │   BlockBlobService   │  ← wire operations (HTTP and signing live here)
//! └──────────────────────┘
//! ```

pub mod blob;
pub mod block_id;
pub mod commit;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod governor;
pub mod integrity;
pub mod memory;
#[cfg(feature = "tracing-basic")]
pub mod observability;
pub mod planner;
pub mod retry;
pub mod service;
pub mod state;
pub mod types;

pub use blob::BlockBlob;
pub use block_id::{validate_block_list, BlockIdSequencer};
pub use commit::{CommitCoordinator, CommitRequest};
pub use config::{ServiceLimits, TransferOptions};
pub use context::{OperationContext, RequestResult, WireOperation, WireRequest};
pub use dispatcher::{ChunkTransfer, Dispatcher};
pub use download::DownloadAssembler;
pub use error::{ProtocolCode, TransferError, TransferResult};
pub use governor::ExecutionGovernor;
pub use integrity::{md5_base64, IntegrityVerifier, ObjectDigest};
pub use memory::MemoryBlockBlobService;
pub use planner::{plan, Chunk, ChunkReader, PlanMode, PlannedChunk, TransferPlan, UploadSource};
pub use retry::{ExponentialRetry, NoRetry, RetryContext, RetryDecision, RetryPolicy};
pub use service::BlockBlobService;
pub use state::TransferState;
pub use types::*;

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        AccessCondition, BlobKey, BlockBlob, BlockBlobService, BlockId, BlockListFilter,
        BlockListItem, BlockMode, ByteRange, ExponentialRetry, MemoryBlockBlobService, NoRetry,
        OperationContext, ProtocolCode, TransferError, TransferOptions, TransferResult,
        UploadSource,
    };
}
