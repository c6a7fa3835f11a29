//! Error types for the torrent session
//!
//! Every operation on a [`TorrentHandle`](crate::session::TorrentHandle) or
//! [`Session`](crate::session::Session) reports failure through
//! [`TorrentError`]; nothing is signalled by panicking.

use crate::torrent::InfoHash;

/// Result type used by session and handle operations
pub type Result<T> = std::result::Result<T, TorrentError>;

/// Errors surfaced to callers of the session and its handles
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TorrentError {
    /// The session is gone, or no longer contains the transfer the handle names
    #[error("invalid torrent handle used")]
    InvalidHandle,

    /// A transfer with the same info hash already exists in the session
    #[error("torrent already exists in session (info hash: {info_hash})")]
    DuplicateTransfer { info_hash: InfoHash },

    /// An argument was outside its valid domain
    #[error("Invalid argument: {message}{}", field_suffix(.field))]
    InvalidArgument {
        message: String,
        field: Option<String>,
    },

    /// Storage could not be moved; the original location is retained
    #[error("Storage move failed: {message} (path: {path}){}", detail_suffix(.detail))]
    StorageMoveFailed {
        message: String,
        path: String,
        detail: Option<String>,
    },

    /// Persisted progress does not belong to this transfer
    #[error("Resume data mismatch: {message}")]
    ResumeMismatch { message: String },

    /// Metadata or resume payload could not be decoded
    #[error("Parse error: {message}{}", detail_suffix(.detail))]
    ParseError {
        message: String,
        detail: Option<String>,
    },

    /// File I/O and storage collaborator errors
    #[error("Storage error: {message}{}{}", path_suffix(.path), detail_suffix(.detail))]
    StorageError {
        message: String,
        path: Option<String>,
        detail: Option<String>,
    },

    /// Configuration errors
    #[error("Config error: {message}{}", field_suffix(.field))]
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

fn field_suffix(field: &Option<String>) -> String {
    field
        .as_ref()
        .map(|f| format!(" (field: {})", f))
        .unwrap_or_default()
}

fn path_suffix(path: &Option<String>) -> String {
    path.as_ref()
        .map(|p| format!(" (path: {})", p))
        .unwrap_or_default()
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_ref()
        .map(|d| format!(" (source: {})", d))
        .unwrap_or_default()
}

impl TorrentError {
    /// Create a new InvalidArgument error naming the offending field
    pub fn invalid_argument_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::InvalidArgument {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new StorageMoveFailed error
    pub fn storage_move_failed(
        message: impl Into<String>,
        path: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        TorrentError::StorageMoveFailed {
            message: message.into(),
            path: path.into(),
            detail: Some(detail.into()),
        }
    }

    /// Create a new ResumeMismatch error
    pub fn resume_mismatch(message: impl Into<String>) -> Self {
        TorrentError::ResumeMismatch {
            message: message.into(),
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            detail: Some(source.into()),
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(
        message: impl Into<String>,
        path: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            detail: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::ParseError { detail, .. }
            | TorrentError::StorageError { detail, .. }
            | TorrentError::StorageMoveFailed { detail, .. } => {
                *detail = Some(detail.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            _ => {}
        }
        self
    }
}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::StorageError {
            message: err.to_string(),
            path: None,
            detail: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to parse bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to parse resume data", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_handle_message() {
        let err = TorrentError::InvalidHandle;
        assert_eq!(err.to_string(), "invalid torrent handle used");
    }

    #[test]
    fn test_duplicate_transfer_names_hash() {
        let err = TorrentError::DuplicateTransfer {
            info_hash: InfoHash::new([0xab; 20]),
        };
        assert!(err.to_string().contains("already exists"));
        assert!(err.to_string().contains(&"ab".repeat(20)));
    }

    #[test]
    fn test_invalid_argument_with_field() {
        let err = TorrentError::invalid_argument_with_field("ratio must be 0 or >= 1", "ratio");
        assert!(err.to_string().contains("Invalid argument"));
        assert!(err.to_string().contains("(field: ratio)"));

        let err = TorrentError::invalid_argument_with_field("piece 9 out of range", "index");
        assert_eq!(err.to_string(), "Invalid argument: piece 9 out of range (field: index)");
    }

    #[test]
    fn test_storage_move_failed() {
        let err = TorrentError::storage_move_failed("target not writable", "/readonly", "permission denied");
        assert!(err.to_string().contains("/readonly"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_storage_error_full() {
        let err = TorrentError::storage_error_full("File not found", "/path/to/file", "os error 2");
        assert_eq!(err.to_string(), "Storage error: File not found (path: /path/to/file) (source: os error 2)");
    }

    #[test]
    fn test_with_context() {
        let err = TorrentError::parse_error_with_source("Invalid data", "eof").with_context("while decoding resume data");
        assert!(err.to_string().ends_with("(source: eof: while decoding resume data)"));

        // Variants without a detail slot are left untouched
        let err = TorrentError::InvalidHandle.with_context("ignored");
        assert_eq!(err, TorrentError::InvalidHandle);
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::StorageError { .. }));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_slice::<u32>(b"not json").unwrap_err();
        let err: TorrentError = json_err.into();
        assert!(matches!(err, TorrentError::ParseError { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = TorrentError::config_error_with_field("must be positive", "block_size");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("block_size"));
    }
}
