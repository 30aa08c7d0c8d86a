//! Error types for ember operations.

use std::io;
use thiserror::Error;

/// Broad classification of an [`EmberError`], used by retry policies and
/// transaction logic to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Safe to retry: the server did not apply the request.
    Transient,
    /// A concurrent writer won. Retrying the same request will fail again.
    Conflict,
    /// The request may or may not have been applied.
    Ambiguous,
    /// The client or connection cannot make progress.
    Fatal,
    /// The server gave a definite answer.
    Definite,
}

/// The main error type for ember operations.
#[derive(Debug, Error)]
pub enum EmberError {
    /// Connection-related errors (network failures, disconnections).
    #[error("connection error: {0}")]
    Connection(String),

    /// The target node is marked unreachable and is not accepting requests.
    #[error("node unavailable: {0}")]
    NodeUnavailable(String),

    /// Malformed or corrupted protocol data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an opcode or status this client does not understand.
    #[error("unexpected response: opcode 0x{opcode:02x}, status 0x{status:04x}")]
    UnknownStatus {
        /// Raw opcode of the response.
        opcode: u8,
        /// Raw status of the response.
        status: u16,
    },

    /// The operation did not complete before its deadline and was not applied.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// The operation timed out after being written; it may have been applied.
    #[error("ambiguous timeout: {0}")]
    AmbiguousTimeout(String),

    /// The contacted node does not own the vbucket.
    #[error("not my vbucket: vbucket {vbucket}")]
    NotMyVbucket {
        /// The vbucket the request was routed to.
        vbucket: u16,
    },

    /// The server is temporarily unable to handle the request.
    #[error("temporary failure: {0}")]
    TemporaryFailure(String),

    /// The supplied CAS no longer matches the stored document.
    #[error("cas mismatch for document '{key}'")]
    CasMismatch {
        /// Document key.
        key: String,
    },

    /// The document does not exist.
    #[error("document not found: '{key}'")]
    DocumentNotFound {
        /// Document key.
        key: String,
    },

    /// The document already exists.
    #[error("document exists: '{key}'")]
    DocumentExists {
        /// Document key.
        key: String,
    },

    /// The document is locked by another holder.
    #[error("document locked: '{key}'")]
    DocumentLocked {
        /// Document key.
        key: String,
    },

    /// The value exceeds the server's size limit.
    #[error("value too large for document '{key}'")]
    ValueTooLarge {
        /// Document key.
        key: String,
    },

    /// The request was rejected as malformed by the server or the client.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A sub-document path does not exist.
    #[error("path not found: '{path}'")]
    PathNotFound {
        /// The sub-document path.
        path: String,
    },

    /// A sub-document path already exists.
    #[error("path exists: '{path}'")]
    PathExists {
        /// The sub-document path.
        path: String,
    },

    /// A sub-document path does not match the document structure.
    #[error("path mismatch: '{path}'")]
    PathMismatch {
        /// The sub-document path.
        path: String,
    },

    /// The collection is not present in the manifest.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// No bootstrap address produced a usable cluster configuration.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Authentication errors (invalid credentials, failed login).
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Configuration errors (invalid settings).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Another live transaction has staged a change to the same document.
    #[error("write-write conflict on '{key}': {reason}")]
    WriteWriteConflict {
        /// Document key.
        key: String,
        /// What the conflict was detected against.
        reason: String,
    },

    /// The transaction passed its expiration before reaching the commit point.
    #[error("transaction expired: {0}")]
    TransactionExpired(String),

    /// The commit point write could not be confirmed either way.
    #[error("transaction commit ambiguous: {0}")]
    CommitAmbiguous(String),

    /// The transaction failed and was rolled back.
    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl EmberError {
    /// Returns the broad category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection(_)
            | Self::NodeUnavailable(_)
            | Self::NotMyVbucket { .. }
            | Self::TemporaryFailure(_) => ErrorCategory::Transient,
            Self::CasMismatch { .. }
            | Self::DocumentLocked { .. }
            | Self::WriteWriteConflict { .. } => ErrorCategory::Conflict,
            Self::AmbiguousTimeout(_) | Self::CommitAmbiguous(_) => ErrorCategory::Ambiguous,
            Self::Protocol(_)
            | Self::Bootstrap(_)
            | Self::Authentication(_)
            | Self::Configuration(_)
            | Self::Io(_) => ErrorCategory::Fatal,
            Self::UnknownStatus { .. }
            | Self::Timeout(_)
            | Self::DocumentNotFound { .. }
            | Self::DocumentExists { .. }
            | Self::ValueTooLarge { .. }
            | Self::InvalidArgument(_)
            | Self::PathNotFound { .. }
            | Self::PathExists { .. }
            | Self::PathMismatch { .. }
            | Self::UnknownCollection(_)
            | Self::TransactionExpired(_)
            | Self::TransactionFailed(_) => ErrorCategory::Definite,
        }
    }

    /// Returns `true` if the error is safe to retry without risk of double application.
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Returns `true` if the outcome of the failed request is unknown.
    pub fn is_ambiguous(&self) -> bool {
        self.category() == ErrorCategory::Ambiguous
    }
}

/// A specialized `Result` type for ember operations.
pub type Result<T> = std::result::Result<T, EmberError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = EmberError::Connection("failed to connect to server".to_string());
        assert_eq!(
            err.to_string(),
            "connection error: failed to connect to server"
        );
    }

    #[test]
    fn test_unknown_status_display() {
        let err = EmberError::UnknownStatus {
            opcode: 0x00,
            status: 0x00fe,
        };
        assert_eq!(
            err.to_string(),
            "unexpected response: opcode 0x00, status 0x00fe"
        );
    }

    #[test]
    fn test_cas_mismatch_display() {
        let err = EmberError::CasMismatch {
            key: "user::1".to_string(),
        };
        assert_eq!(err.to_string(), "cas mismatch for document 'user::1'");
    }

    #[test]
    fn test_write_write_conflict_display() {
        let err = EmberError::WriteWriteConflict {
            key: "acct::7".to_string(),
            reason: "staged by another transaction".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "write-write conflict on 'acct::7': staged by another transaction"
        );
    }

    #[test]
    fn test_not_my_vbucket_display() {
        let err = EmberError::NotMyVbucket { vbucket: 17 };
        assert_eq!(err.to_string(), "not my vbucket: vbucket 17");
    }

    #[test]
    fn test_transient_category() {
        assert!(EmberError::Connection("reset".into()).is_transient());
        assert!(EmberError::TemporaryFailure("busy".into()).is_transient());
        assert!(EmberError::NodeUnavailable("n1".into()).is_transient());
        assert!(EmberError::NotMyVbucket { vbucket: 1 }.is_transient());
    }

    #[test]
    fn test_ambiguous_category() {
        assert!(EmberError::AmbiguousTimeout("after write".into()).is_ambiguous());
        assert!(EmberError::CommitAmbiguous("atr".into()).is_ambiguous());
        assert!(!EmberError::Timeout("before write".into()).is_ambiguous());
    }

    #[test]
    fn test_conflict_and_fatal_categories() {
        let conflict = EmberError::CasMismatch { key: "k".into() };
        assert_eq!(conflict.category(), ErrorCategory::Conflict);

        let fatal = EmberError::Authentication("bad password".into());
        assert_eq!(fatal.category(), ErrorCategory::Fatal);

        let definite = EmberError::DocumentNotFound { key: "k".into() };
        assert_eq!(definite.category(), ErrorCategory::Definite);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let err: EmberError = io_err.into();
        assert!(matches!(err, EmberError::Io(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EmberError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(EmberError::Timeout("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
