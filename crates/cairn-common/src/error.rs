//! Error types for Cairn.

use thiserror::Error;

/// Result type alias using CairnError.
pub type Result<T> = std::result::Result<T, CairnError>;

/// Errors that can occur in Cairn operations.
#[derive(Debug, Error)]
pub enum CairnError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Block collection errors
    #[error("out of blocks: allocation bitmap is full")]
    OutOfBlocks,

    #[error("block handle out of bounds: {handle}")]
    HandleOutOfBounds { handle: u64 },

    #[error("block collection is not open")]
    NotOpen,

    #[error("block collection is not writable")]
    ReadOnly,

    #[error("block size mismatch: expected {expected}, got {actual}")]
    BlockSizeMismatch { expected: usize, actual: usize },

    // B+ tree errors
    #[error("key not found")]
    KeyNotFound,

    #[error("value not found")]
    ValueNotFound,

    #[error(
        "bad tree parameters: node ({node_min}, {node_max}), leaf ({leaf_min}, {leaf_max})"
    )]
    BadParameters {
        node_min: u64,
        node_max: u64,
        leaf_min: u64,
        leaf_max: u64,
    },

    // Builder errors
    #[error("builder is sealed: {0}")]
    BuilderSealed(&'static str),

    // Internal errors
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: CairnError = io_err.into();
        assert!(matches!(err, CairnError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_out_of_blocks_display() {
        let err = CairnError::OutOfBlocks;
        assert_eq!(err.to_string(), "out of blocks: allocation bitmap is full");
    }

    #[test]
    fn test_handle_out_of_bounds_display() {
        let err = CairnError::HandleOutOfBounds { handle: 131072 };
        assert_eq!(err.to_string(), "block handle out of bounds: 131072");
    }

    #[test]
    fn test_open_state_errors_display() {
        assert_eq!(
            CairnError::NotOpen.to_string(),
            "block collection is not open"
        );
        assert_eq!(
            CairnError::ReadOnly.to_string(),
            "block collection is not writable"
        );
    }

    #[test]
    fn test_block_size_mismatch_display() {
        let err = CairnError::BlockSizeMismatch {
            expected: 16384,
            actual: 8192,
        };
        assert_eq!(
            err.to_string(),
            "block size mismatch: expected 16384, got 8192"
        );
    }

    #[test]
    fn test_tree_errors_display() {
        assert_eq!(CairnError::KeyNotFound.to_string(), "key not found");
        assert_eq!(CairnError::ValueNotFound.to_string(), "value not found");
    }

    #[test]
    fn test_bad_parameters_display() {
        let err = CairnError::BadParameters {
            node_min: 1,
            node_max: 4,
            leaf_min: 2,
            leaf_max: 4,
        };
        assert_eq!(
            err.to_string(),
            "bad tree parameters: node (1, 4), leaf (2, 4)"
        );
    }

    #[test]
    fn test_builder_sealed_display() {
        let err = CairnError::BuilderSealed("push after end");
        assert_eq!(err.to_string(), "builder is sealed: push after end");
    }

    #[test]
    fn test_invariant_violation_display() {
        let err = CairnError::InvariantViolation("split of a non-full leaf");
        assert_eq!(
            err.to_string(),
            "invariant violation: split of a non-full leaf"
        );
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(CairnError::KeyNotFound)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CairnError>();
    }
}
