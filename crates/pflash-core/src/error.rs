//! Error taxonomy of a partial flashing attempt.

use thiserror::Error;

use crate::diff::DiffError;
use crate::hex::HexError;
use crate::transport::TransportError;

/// What the caller does with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Resend at block level, within the retry budget.
    Retry,
    /// Abandon partial flashing and run the full update.
    Fallback,
    /// Stop without any further action.
    Cancel,
}

/// Failures of a partial flashing attempt.
#[derive(Debug, Error)]
pub enum PartialFlashError {
    /// The image could not be read far enough to be used.
    #[error("malformed image: {0}")]
    MalformedImage(String),

    /// No marker/hash block in the image.
    #[error("image carries no partial flashing information")]
    NoDiffAvailable,

    /// The diff was built against a different runtime.
    #[error("baseline mismatch: image expects {expected}, device has {actual}")]
    BaselineMismatch { expected: String, actual: String },

    #[error("too many changes: {count} chunks exceed the limit of {max}")]
    TooManyChanges { count: usize, max: usize },

    #[error("write failed: {0}")]
    TransportWriteFailure(String),

    #[error("no acknowledgment within {timeout_ms}ms")]
    AcknowledgmentTimeout { timeout_ms: u64 },

    #[error("transfer exceeded {timeout_secs}s")]
    SessionTimeout { timeout_secs: u64 },

    #[error("device disconnected unexpectedly")]
    UnexpectedDisconnect,

    #[error("device did not return after mode switch: {0}")]
    ReconnectFailed(String),

    #[error("block {block} still rejected after {attempts} attempts")]
    RetriesExhausted { block: usize, attempts: usize },

    #[error("device rejected write with status 0x{status:02X}")]
    DeviceRejected { status: u8 },

    #[error("cancelled by user")]
    UserCancelled,
}

impl PartialFlashError {
    pub fn disposition(&self) -> Disposition {
        match self {
            PartialFlashError::UserCancelled => Disposition::Cancel,
            PartialFlashError::TransportWriteFailure(_) => Disposition::Retry,
            _ => Disposition::Fallback,
        }
    }

    /// Expected conditions that are not worth an error-level log line.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            PartialFlashError::NoDiffAvailable | PartialFlashError::UserCancelled
        )
    }
}

impl From<DiffError> for PartialFlashError {
    fn from(err: DiffError) -> Self {
        match err {
            DiffError::NoDiffAvailable => PartialFlashError::NoDiffAvailable,
            DiffError::TooManyChanges { count, max } => {
                PartialFlashError::TooManyChanges { count, max }
            }
        }
    }
}

impl From<HexError> for PartialFlashError {
    fn from(err: HexError) -> Self {
        PartialFlashError::MalformedImage(err.to_string())
    }
}

impl From<TransportError> for PartialFlashError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => PartialFlashError::UnexpectedDisconnect,
            TransportError::Timeout { timeout_ms } => {
                PartialFlashError::AcknowledgmentTimeout { timeout_ms }
            }
            TransportError::ReconnectTimeout { .. } => {
                PartialFlashError::ReconnectFailed(err.to_string())
            }
            other => PartialFlashError::TransportWriteFailure(other.to_string()),
        }
    }
}

/// Lower-case hex rendering of a hash.
pub(crate) fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispositions() {
        assert_eq!(
            PartialFlashError::UserCancelled.disposition(),
            Disposition::Cancel
        );
        assert_eq!(
            PartialFlashError::TransportWriteFailure("x".into()).disposition(),
            Disposition::Retry
        );
        for err in [
            PartialFlashError::NoDiffAvailable,
            PartialFlashError::UnexpectedDisconnect,
            PartialFlashError::AcknowledgmentTimeout { timeout_ms: 1 },
            PartialFlashError::SessionTimeout { timeout_secs: 1 },
            PartialFlashError::TooManyChanges { count: 2, max: 1 },
        ] {
            assert_eq!(err.disposition(), Disposition::Fallback);
        }
    }

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(
            PartialFlashError::from(TransportError::Disconnected),
            PartialFlashError::UnexpectedDisconnect
        ));
        assert!(matches!(
            PartialFlashError::from(TransportError::Timeout { timeout_ms: 5 }),
            PartialFlashError::AcknowledgmentTimeout { timeout_ms: 5 }
        ));
        assert!(matches!(
            PartialFlashError::from(TransportError::WriteFailed("gatt".into())),
            PartialFlashError::TransportWriteFailure(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = PartialFlashError::BaselineMismatch {
            expected: hex_string(&[0xAB, 0x01]),
            actual: hex_string(&[0x00, 0x02]),
        };
        assert_eq!(
            err.to_string(),
            "baseline mismatch: image expects ab01, device has 0002"
        );
    }
}
