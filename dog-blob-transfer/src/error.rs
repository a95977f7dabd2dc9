use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors that can occur while moving blob content to or from the service
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Unsupported configuration: {message}")]
    UnsupportedConfiguration { message: String },

    /// The source ran dry before the requested length could be read.
    /// Only raised when the length could not be checked up front.
    #[error("Source ended early: expected {expected} bytes, read {actual}")]
    SourceExhausted { expected: u64, actual: u64 },

    #[error("Protocol error ({code}): {message}")]
    Protocol { code: ProtocolCode, message: String },

    #[error("Maximum execution time of {budget:?} exceeded after {attempts} attempts")]
    Timeout { budget: Duration, attempts: u32 },

    #[error("Transfer of chunk {position} failed after {attempts} attempts: {source}")]
    Aggregate {
        position: u32,
        attempts: u32,
        #[source]
        source: Box<TransferError>,
    },

    #[error("Operation canceled")]
    Canceled,

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Server-side rejection reasons reported by the wire collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolCode {
    InvalidBlockId,
    InvalidBlockList,
    BlobNotFound,
    PreconditionFailed,
    Md5Mismatch,
    RequestBodyTooLarge,
    InvalidRange,
    ServerBusy,
    InternalError,
    Network,
}

impl ProtocolCode {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Md5Mismatch | Self::ServerBusy | Self::InternalError | Self::Network
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidBlockId => "InvalidBlockId",
            Self::InvalidBlockList => "InvalidBlockList",
            Self::BlobNotFound => "BlobNotFound",
            Self::PreconditionFailed => "ConditionNotMet",
            Self::Md5Mismatch => "Md5Mismatch",
            Self::RequestBodyTooLarge => "RequestBodyTooLarge",
            Self::InvalidRange => "InvalidRange",
            Self::ServerBusy => "ServerBusy",
            Self::InternalError => "InternalError",
            Self::Network => "NetworkFailure",
        }
    }
}

impl fmt::Display for ProtocolCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TransferError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an unsupported configuration error
    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        Self::UnsupportedConfiguration {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(code: ProtocolCode, message: S) -> Self {
        Self::Protocol {
            code,
            message: message.into(),
        }
    }

    /// Whether another attempt of the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Protocol { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    /// Protocol code of this error or of the error it wraps
    pub fn protocol_code(&self) -> Option<ProtocolCode> {
        match self.root_cause() {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Innermost error, looking through `Aggregate` wrappers
    pub fn root_cause(&self) -> &TransferError {
        let mut current = self;
        while let Self::Aggregate { source, .. } = current {
            current = source;
        }
        current
    }

    /// Terminal outcomes that are reported as-is rather than wrapped per chunk
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_codes() {
        assert!(ProtocolCode::Md5Mismatch.is_retryable());
        assert!(ProtocolCode::ServerBusy.is_retryable());
        assert!(!ProtocolCode::PreconditionFailed.is_retryable());
        assert!(!ProtocolCode::InvalidBlockList.is_retryable());
    }

    #[test]
    fn root_cause_unwraps_aggregate() {
        let err = TransferError::Aggregate {
            position: 2,
            attempts: 3,
            source: Box::new(TransferError::protocol(ProtocolCode::Md5Mismatch, "bad digest")),
        };

        assert_eq!(err.protocol_code(), Some(ProtocolCode::Md5Mismatch));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("chunk 2"));
    }
}
