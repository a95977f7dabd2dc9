use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::retry::{ExponentialRetry, RetryPolicy};
use crate::{TransferError, TransferResult};

/// Options controlling a single transfer operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Chunk size used when content is split into blocks
    pub stream_write_size_in_bytes: u64,

    /// Content at or below this size goes up in one direct PUT
    pub single_blob_upload_threshold_in_bytes: u64,

    /// Maximum number of chunk transfers in flight at once
    pub parallelism_factor: usize,

    /// Send a per-request MD5 so the service can reject corrupted bytes
    pub use_transactional_md5: bool,

    /// Compute the whole-object MD5 and store it as the blob's content MD5
    pub store_blob_content_md5: bool,

    /// Skip checking downloaded content against the stored content MD5
    pub disable_content_md5_validation: bool,

    /// Wall-clock budget across every attempt of the operation
    #[serde(with = "millis")]
    pub maximum_execution_time: Option<Duration>,

    /// Decides whether failed attempts are retried
    #[serde(skip, default = "default_retry_policy")]
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// Service-version constants the engine checks against
    pub limits: ServiceLimits,
}

/// Size ceilings imposed by the service version in use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceLimits {
    pub max_block_size: u64,
    pub max_block_count: u32,
    pub max_single_blob_upload_threshold: u64,
    /// Upper bound on the raw (decoded) block id length
    pub max_block_id_length: usize,
}

impl Default for ServiceLimits {
    fn default() -> Self {
        Self {
            max_block_size: 100 * 1024 * 1024,                   // 100MB
            max_block_count: 50_000,
            max_single_blob_upload_threshold: 256 * 1024 * 1024, // 256MB
            max_block_id_length: 64,
        }
    }
}

fn default_retry_policy() -> Arc<dyn RetryPolicy> {
    Arc::new(ExponentialRetry::default())
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            stream_write_size_in_bytes: 4 * 1024 * 1024,             // 4MB
            single_blob_upload_threshold_in_bytes: 32 * 1024 * 1024, // 32MB
            parallelism_factor: 1,
            use_transactional_md5: false,
            store_blob_content_md5: true,
            disable_content_md5_validation: false,
            maximum_execution_time: None,
            retry_policy: default_retry_policy(),
            limits: ServiceLimits::default(),
        }
    }
}

impl TransferOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON document; missing fields keep their defaults
    pub fn from_json(json: &str) -> TransferResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| TransferError::validation(format!("Invalid transfer options: {}", e)))
    }

    /// Set chunk size
    pub fn with_stream_write_size(mut self, bytes: u64) -> Self {
        self.stream_write_size_in_bytes = bytes;
        self
    }

    /// Set single-shot upload threshold
    pub fn with_single_blob_upload_threshold(mut self, bytes: u64) -> Self {
        self.single_blob_upload_threshold_in_bytes = bytes;
        self
    }

    /// Set parallelism factor
    pub fn with_parallelism(mut self, factor: usize) -> Self {
        self.parallelism_factor = factor;
        self
    }

    pub fn with_transactional_md5(mut self, enabled: bool) -> Self {
        self.use_transactional_md5 = enabled;
        self
    }

    pub fn with_store_content_md5(mut self, enabled: bool) -> Self {
        self.store_blob_content_md5 = enabled;
        self
    }

    pub fn without_content_md5_validation(mut self) -> Self {
        self.disable_content_md5_validation = true;
        self
    }

    /// Bound the whole operation, retries included
    pub fn with_maximum_execution_time(mut self, budget: Duration) -> Self {
        self.maximum_execution_time = Some(budget);
        self
    }

    pub fn with_retry_policy<P: RetryPolicy + 'static>(mut self, policy: P) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    pub fn with_limits(mut self, limits: ServiceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Pre-flight checks on the option values themselves
    pub fn validate(&self) -> TransferResult<()> {
        if self.stream_write_size_in_bytes == 0 {
            return Err(TransferError::validation(
                "stream_write_size_in_bytes must be greater than 0",
            ));
        }
        if self.stream_write_size_in_bytes > self.limits.max_block_size {
            return Err(TransferError::validation(format!(
                "stream_write_size_in_bytes {} exceeds maximum block size {}",
                self.stream_write_size_in_bytes, self.limits.max_block_size
            )));
        }
        let max_threshold = self.limits.max_single_blob_upload_threshold;
        if self.single_blob_upload_threshold_in_bytes > max_threshold {
            return Err(TransferError::validation(format!(
                "single_blob_upload_threshold_in_bytes {} exceeds maximum {}",
                self.single_blob_upload_threshold_in_bytes, max_threshold
            )));
        }
        if self.parallelism_factor == 0 {
            return Err(TransferError::validation("parallelism_factor must be at least 1"));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let options = TransferOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.parallelism_factor, 1);
        assert!(options.store_blob_content_md5);
        assert!(!options.use_transactional_md5);
    }

    #[test]
    fn rejects_zero_parallelism_and_oversize_chunks() {
        let options = TransferOptions::new().with_parallelism(0);
        assert!(matches!(options.validate(), Err(TransferError::Validation { .. })));

        let options = TransferOptions::new()
            .with_limits(ServiceLimits { max_block_size: 1024, ..ServiceLimits::default() })
            .with_stream_write_size(2048);
        assert!(matches!(options.validate(), Err(TransferError::Validation { .. })));
    }

    #[test]
    fn loads_from_json_with_defaults() {
        let options = TransferOptions::from_json(
            r#"{
                "parallelism_factor": 8,
                "use_transactional_md5": true,
                "maximum_execution_time": 1500
            }"#,
        )
        .unwrap();

        assert_eq!(options.parallelism_factor, 8);
        assert!(options.use_transactional_md5);
        assert_eq!(options.maximum_execution_time, Some(Duration::from_millis(1500)));
        assert_eq!(options.stream_write_size_in_bytes, 4 * 1024 * 1024);

        assert!(TransferOptions::from_json("{ \"parallelism_factor\": \"many\" }").is_err());
    }
}
