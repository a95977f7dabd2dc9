use std::future::Future;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{BlobKey, BlockId, ProtocolCode, TransferResult};

/// Wire operations consumed from the service collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireOperation {
    PutBlock,
    PutBlockList,
    GetBlockList,
    GetContent,
    PutBlob,
    GetProperties,
    SetProperties,
}

/// Description of one request as it is about to go on the wire
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub operation: WireOperation,
    pub blob: BlobKey,
    pub block_id: Option<BlockId>,
    /// Content-MD5 header value, exactly as sent
    pub content_md5: Option<String>,
    pub content_length: Option<u64>,
}

impl WireRequest {
    pub fn new(operation: WireOperation, blob: &BlobKey) -> Self {
        Self {
            operation,
            blob: blob.clone(),
            block_id: None,
            content_md5: None,
            content_length: None,
        }
    }

    pub fn with_block_id(mut self, id: &BlockId) -> Self {
        self.block_id = Some(id.clone());
        self
    }

    pub fn with_content_md5(mut self, md5: Option<&str>) -> Self {
        self.content_md5 = md5.map(str::to_string);
        self
    }

    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }
}

/// Record of one completed request
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub operation: WireOperation,
    pub block_id: Option<BlockId>,
    pub content_md5: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error_code: Option<ProtocolCode>,
    pub error_message: Option<String>,
}

impl RequestResult {
    pub fn succeeded(&self) -> bool {
        self.error_message.is_none()
    }
}

type SendingHook = Arc<dyn Fn(&WireRequest) + Send + Sync>;
type ResponseHook = Arc<dyn Fn(&WireRequest, &RequestResult) + Send + Sync>;

/// Per-operation context: request id, cancellation, observer hooks and the
/// log of every request the operation issued.
#[derive(Clone)]
pub struct OperationContext {
    client_request_id: String,
    cancellation: CancellationToken,
    sending_request: Option<SendingHook>,
    response_received: Option<ResponseHook>,
    results: Arc<Mutex<Vec<RequestResult>>>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self {
            client_request_id: Uuid::new_v4().to_string(),
            cancellation: CancellationToken::new(),
            sending_request: None,
            response_received: None,
            results: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_client_request_id<S: Into<String>>(mut self, id: S) -> Self {
        self.client_request_id = id.into();
        self
    }

    /// External cancellation, checked before every attempt
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Called just before each request is handed to the service
    pub fn on_sending_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WireRequest) + Send + Sync + 'static,
    {
        self.sending_request = Some(Arc::new(hook));
        self
    }

    /// Called once each request has a response (or failed)
    pub fn on_response_received<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WireRequest, &RequestResult) + Send + Sync + 'static,
    {
        self.response_received = Some(Arc::new(hook));
        self
    }

    pub fn client_request_id(&self) -> &str {
        &self.client_request_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Snapshot of every request issued so far, in completion order
    pub fn request_results(&self) -> Vec<RequestResult> {
        self.results.lock().clone()
    }

    /// Number of requests issued so far
    pub fn request_count(&self) -> usize {
        self.results.lock().len()
    }

    pub fn clear_request_results(&self) {
        self.results.lock().clear();
    }

    /// Run one wire call, firing the hooks around it and recording its outcome
    pub(crate) async fn observe<T, Fut>(&self, request: WireRequest, call: Fut) -> TransferResult<T>
    where
        Fut: Future<Output = TransferResult<T>>,
    {
        if let Some(hook) = &self.sending_request {
            hook(&request);
        }
        let started_at = Utc::now();
        let outcome = call.await;

        let (error_code, error_message) = match &outcome {
            Ok(_) => (None, None),
            Err(e) => (e.protocol_code(), Some(e.to_string())),
        };
        let result = RequestResult {
            operation: request.operation,
            block_id: request.block_id.clone(),
            content_md5: request.content_md5.clone(),
            started_at,
            finished_at: Utc::now(),
            error_code,
            error_message,
        };
        if let Some(hook) = &self.response_received {
            hook(&request, &result);
        }
        self.results.lock().push(result);
        outcome
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("client_request_id", &self.client_request_id)
            .field("requests", &self.request_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransferError;

    #[tokio::test]
    async fn hooks_see_every_request() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let ctx = OperationContext::new().on_sending_request(move |req| {
            sink.lock().push(req.content_md5.clone());
        });
        let key = BlobKey::new("c", "b");

        let ok: TransferResult<u32> = ctx
            .observe(
                WireRequest::new(WireOperation::PutBlock, &key).with_content_md5(Some("abc=")),
                async { Ok(1) },
            )
            .await;
        let failed: TransferResult<u32> = ctx
            .observe(WireRequest::new(WireOperation::PutBlockList, &key), async {
                Err(TransferError::protocol(ProtocolCode::PreconditionFailed, "etag"))
            })
            .await;

        assert!(ok.is_ok());
        assert!(failed.is_err());
        assert_eq!(*seen.lock(), vec![Some("abc=".to_string()), None]);

        let results = ctx.request_results();
        assert_eq!(results.len(), 2);
        assert!(results[0].succeeded());
        assert_eq!(results[1].error_code, Some(ProtocolCode::PreconditionFailed));
    }
}
