//! Error types for ruleset and trace loading

use thiserror::Error;

/// Errors surfaced while reading rule or trace files.
///
/// The classifier core itself never fails; every input problem is caught at
/// the loader boundary.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Line did not match the expected record shape.
    #[error("malformed rule at line {line}: {reason}")]
    MalformedRule {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// IP prefix length outside `0..=32`.
    #[error("prefix length {len} out of range at line {line}")]
    PrefixOutOfRange {
        /// 1-based line number.
        line: usize,
        /// Offending length.
        len: u32,
    },

    /// Protocol mask other than `0x00` or `0xFF`.
    #[error("invalid protocol mask {mask:#04x} at line {line}")]
    InvalidProtocolMask {
        /// 1-based line number.
        line: usize,
        /// Offending mask.
        mask: u32,
    },

    /// Trace record did not hold seven decimal fields.
    #[error("malformed trace record at line {line}")]
    MalformedTrace {
        /// 1-based line number.
        line: usize,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;
