use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::{ProtocolCode, TransferError, TransferOptions, TransferResult};

/// Base64 MD5 of `data`, the form the service expects in Content-MD5
pub fn md5_base64(data: &[u8]) -> String {
    STANDARD.encode(md5::compute(data).0)
}

/// Running MD5 over the full logical content, fed in content order
pub struct ObjectDigest {
    context: md5::Context,
    bytes: u64,
}

impl ObjectDigest {
    pub fn new() -> Self {
        Self {
            context: md5::Context::new(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
        self.bytes += data.len() as u64;
    }

    /// Bytes digested so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> String {
        STANDARD.encode(self.context.compute().0)
    }
}

impl Default for ObjectDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDigest").field("bytes", &self.bytes).finish()
    }
}

/// Decides which digests accompany a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityVerifier {
    transactional: bool,
    store_content_md5: bool,
    validate_downloads: bool,
}

impl IntegrityVerifier {
    pub fn from_options(options: &TransferOptions) -> Self {
        Self {
            transactional: options.use_transactional_md5,
            store_content_md5: options.store_blob_content_md5,
            validate_downloads: !options.disable_content_md5_validation,
        }
    }

    pub fn transactional(&self) -> bool {
        self.transactional
    }

    pub fn stores_content_md5(&self) -> bool {
        self.store_content_md5
    }

    /// Digest to send with one request body.
    ///
    /// A caller-supplied digest always wins and is passed through untouched,
    /// even when it does not match the bytes.
    pub fn request_digest(&self, data: &[u8], supplied: Option<&str>) -> Option<String> {
        match supplied {
            Some(digest) => Some(digest.to_string()),
            None if self.transactional => Some(md5_base64(data)),
            None => None,
        }
    }

    /// Fresh whole-object digest if one is to be stored
    pub fn object_digest(&self) -> Option<ObjectDigest> {
        self.store_content_md5.then(ObjectDigest::new)
    }

    /// Check downloaded content against the blob's stored content MD5
    pub fn verify_download(&self, data: &[u8], stored: Option<&str>) -> TransferResult<()> {
        let Some(expected) = stored.filter(|_| self.validate_downloads) else {
            return Ok(());
        };
        let actual = md5_base64(data);
        if actual != expected {
            return Err(TransferError::protocol(
                ProtocolCode::Md5Mismatch,
                format!("Downloaded content MD5 {} does not match stored {}", actual, expected),
            ));
        }
        Ok(())
    }
}
