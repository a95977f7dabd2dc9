use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;

use crate::integrity::{IntegrityVerifier, ObjectDigest};
use crate::{ByteStream, TransferError, TransferOptions, TransferResult};

enum SourceKind {
    /// Re-readable content with a statically known size
    Buffer(Bytes),
    /// Forward-only content of unknown size
    Stream(ByteStream),
}

/// Content to upload, optionally narrowed to an explicit sub-range
pub struct UploadSource {
    kind: SourceKind,
    offset: u64,
    length: Option<u64>,
}

impl UploadSource {
    pub fn from_bytes<B: Into<Bytes>>(data: B) -> Self {
        Self {
            kind: SourceKind::Buffer(data.into()),
            offset: 0,
            length: None,
        }
    }

    pub fn from_stream(stream: ByteStream) -> Self {
        Self {
            kind: SourceKind::Stream(stream),
            offset: 0,
            length: None,
        }
    }

    /// Skip the first `offset` bytes of the source
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Upload exactly `length` bytes, starting at the offset
    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    /// Whether the source can be read again and sized before sending
    pub fn is_rereadable(&self) -> bool {
        matches!(self.kind, SourceKind::Buffer(_))
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Explicitly requested length, if any
    pub fn requested_length(&self) -> Option<u64> {
        self.length
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            SourceKind::Buffer(data) => format!("Buffer({} bytes)", data.len()),
            SourceKind::Stream(_) => "Stream".to_string(),
        };
        f.debug_struct("UploadSource")
            .field("kind", &kind)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

/// Planned contiguous byte range of the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub position: u32,
    /// Offset relative to the start of the uploaded range
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanMode {
    /// One direct PUT, no block protocol
    SinglePut { length: u64 },
    /// Known chunk layout, dispatched in parallel
    Blocks { chunks: Vec<Chunk> },
    /// Unknown length: chunks are cut while reading, one at a time
    Sequential { chunk_size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub mode: PlanMode,
    /// Chunk transfers allowed in flight at once
    pub parallelism: usize,
    /// Total length when it is known before reading
    pub length: Option<u64>,
}

impl TransferPlan {
    pub fn chunk_count(&self) -> Option<u32> {
        match &self.mode {
            PlanMode::SinglePut { .. } => Some(1),
            PlanMode::Blocks { chunks } => Some(chunks.len() as u32),
            PlanMode::Sequential { .. } => None,
        }
    }

    pub fn is_single_put(&self) -> bool {
        matches!(self.mode, PlanMode::SinglePut { .. })
    }
}

/// Split `length` bytes into chunks of `chunk_size`, the last one truncated
pub fn split_into_chunks(length: u64, chunk_size: u64) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(length.div_ceil(chunk_size) as usize);
    let mut offset = 0;
    while offset < length {
        let len = chunk_size.min(length - offset);
        chunks.push(Chunk {
            position: chunks.len() as u32,
            offset,
            length: len,
        });
        offset += len;
    }
    chunks
}

/// Plan a transfer. Every check here happens before any request is made.
pub fn plan(source: &UploadSource, options: &TransferOptions) -> TransferResult<TransferPlan> {
    options.validate()?;
    let chunk_size = options.stream_write_size_in_bytes;

    let available = match &source.kind {
        SourceKind::Buffer(data) => data.len() as u64,
        SourceKind::Stream(_) => {
            if options.use_transactional_md5 {
                return Err(TransferError::unsupported(
                    "Transactional MD5 requires a source whose length is known before sending",
                ));
            }
            return Ok(TransferPlan {
                mode: PlanMode::Sequential { chunk_size },
                parallelism: 1,
                length: None,
            });
        }
    };

    if source.offset > available {
        return Err(TransferError::validation(format!(
            "Offset {} is past the end of a {} byte source",
            source.offset, available
        )));
    }
    let remaining = available - source.offset;
    let length = match source.length {
        Some(requested) if requested > remaining => {
            return Err(TransferError::validation(format!(
                "Requested length {} exceeds the {} bytes available from offset {}",
                requested, remaining, source.offset
            )));
        }
        Some(requested) => requested,
        None => remaining,
    };

    if length <= options.single_blob_upload_threshold_in_bytes {
        if options.use_transactional_md5 && !options.store_blob_content_md5 {
            return Err(TransferError::unsupported(
                "A single-shot upload stores its request MD5; \
                 use_transactional_md5 requires store_blob_content_md5",
            ));
        }
        return Ok(TransferPlan {
            mode: PlanMode::SinglePut { length },
            parallelism: 1,
            length: Some(length),
        });
    }

    let chunks = split_into_chunks(length, chunk_size);
    if chunks.len() as u64 > u64::from(options.limits.max_block_count) {
        return Err(TransferError::validation(format!(
            "{} bytes in {} byte chunks needs {} blocks, limit is {}",
            length,
            chunk_size,
            chunks.len(),
            options.limits.max_block_count
        )));
    }
    let parallelism = options.parallelism_factor.min(chunks.len()).max(1);
    Ok(TransferPlan {
        mode: PlanMode::Blocks { chunks },
        parallelism,
        length: Some(length),
    })
}

/// One chunk read from the source, ready to send
#[derive(Debug, Clone)]
pub struct PlannedChunk {
    pub position: u32,
    pub offset: u64,
    pub data: Bytes,
    /// Per-request digest, when one is to be sent
    pub content_md5: Option<String>,
}

/// Forward-only view over a byte stream that hands out exact-size pieces
struct StreamCursor {
    stream: ByteStream,
    pending: Bytes,
}

impl StreamCursor {
    async fn refill(&mut self) -> TransferResult<bool> {
        while self.pending.is_empty() {
            match self.stream.next().await {
                Some(next) => self.pending = next?,
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Up to `want` bytes; fewer only when the stream ends
    async fn take(&mut self, want: usize) -> TransferResult<Bytes> {
        if !self.refill().await? {
            return Ok(Bytes::new());
        }
        if self.pending.len() >= want {
            return Ok(self.pending.split_to(want));
        }
        let mut out = BytesMut::with_capacity(want);
        while out.len() < want && self.refill().await? {
            let n = (want - out.len()).min(self.pending.len());
            out.extend_from_slice(&self.pending[..n]);
            self.pending.advance(n);
        }
        Ok(out.freeze())
    }

    /// Discard up to `count` bytes, returning how many were skipped
    async fn skip(&mut self, count: u64) -> TransferResult<u64> {
        let mut skipped = 0;
        while skipped < count && self.refill().await? {
            let n = (count - skipped).min(self.pending.len() as u64) as usize;
            self.pending.advance(n);
            skipped += n as u64;
        }
        Ok(skipped)
    }
}

enum ReaderKind {
    Buffer { data: Bytes, chunks: std::vec::IntoIter<Chunk> },
    Stream {
        cursor: StreamCursor,
        chunk_size: u64,
        to_skip: u64,
        limit: Option<u64>,
        finished: bool,
    },
}

/// Reads planned chunks in content order, feeding the digests as it goes
pub struct ChunkReader {
    kind: ReaderKind,
    integrity: IntegrityVerifier,
    digest: Option<ObjectDigest>,
    next_position: u32,
    read_bytes: u64,
    max_chunks: u32,
}

impl ChunkReader {
    pub fn new(source: UploadSource, plan: &TransferPlan, options: &TransferOptions) -> Self {
        let integrity = IntegrityVerifier::from_options(options);
        let kind = match source.kind {
            SourceKind::Buffer(data) => {
                let start = source.offset as usize;
                let length = plan
                    .length
                    .unwrap_or((data.len() as u64).saturating_sub(source.offset)) as usize;
                let data = data.slice(start..start + length);
                let chunks = match &plan.mode {
                    PlanMode::Blocks { chunks } => chunks.clone(),
                    _ => split_into_chunks(length as u64, (length as u64).max(1)),
                };
                ReaderKind::Buffer { data, chunks: chunks.into_iter() }
            }
            SourceKind::Stream(stream) => ReaderKind::Stream {
                cursor: StreamCursor { stream, pending: Bytes::new() },
                chunk_size: options.stream_write_size_in_bytes,
                to_skip: source.offset,
                limit: source.length,
                finished: false,
            },
        };
        Self {
            kind,
            integrity,
            digest: integrity.object_digest(),
            next_position: 0,
            read_bytes: 0,
            max_chunks: options.limits.max_block_count,
        }
    }

    /// Next chunk in content order, or `None` once the source is used up
    pub async fn next_chunk(&mut self) -> TransferResult<Option<PlannedChunk>> {
        let position = self.next_position;
        let (offset, data) = match &mut self.kind {
            ReaderKind::Buffer { data, chunks } => match chunks.next() {
                Some(chunk) => {
                    let start = chunk.offset as usize;
                    (chunk.offset, data.slice(start..start + chunk.length as usize))
                }
                None => return Ok(None),
            },
            ReaderKind::Stream { cursor, chunk_size, to_skip, limit, finished } => {
                if *finished {
                    return Ok(None);
                }
                if *to_skip > 0 {
                    let skipped = cursor.skip(*to_skip).await?;
                    if skipped < *to_skip {
                        if let Some(expected) = *limit {
                            return Err(TransferError::SourceExhausted { expected, actual: 0 });
                        }
                    }
                    *to_skip = 0;
                }

                let want = match *limit {
                    Some(limit) => (limit - self.read_bytes).min(*chunk_size),
                    None => *chunk_size,
                };
                if want == 0 {
                    *finished = true;
                    return Ok(None);
                }
                let data = cursor.take(want as usize).await?;
                if (data.len() as u64) < want {
                    if let Some(expected) = *limit {
                        return Err(TransferError::SourceExhausted {
                            expected,
                            actual: self.read_bytes + data.len() as u64,
                        });
                    }
                    *finished = true;
                    if data.is_empty() {
                        return Ok(None);
                    }
                }
                if position >= self.max_chunks {
                    return Err(TransferError::validation(format!(
                        "Source needs more than {} blocks",
                        self.max_chunks
                    )));
                }
                (self.read_bytes, data)
            }
        };

        if let Some(digest) = self.digest.as_mut() {
            digest.update(&data);
        }
        self.read_bytes += data.len() as u64;
        self.next_position += 1;
        Ok(Some(PlannedChunk {
            position,
            offset,
            content_md5: self.integrity.request_digest(&data, None),
            data,
        }))
    }

    pub fn chunks_read(&self) -> u32 {
        self.next_position
    }

    pub fn bytes_read(&self) -> u64 {
        self.read_bytes
    }

    /// Whole-object digest over everything read, if one was requested
    pub fn finish_digest(&mut self) -> Option<String> {
        self.digest.take().map(ObjectDigest::finish)
    }
}
