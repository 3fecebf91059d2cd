//! Custom error types for cramstream operations.

use thiserror::Error;

/// Result type alias for cramstream operations
pub type Result<T> = std::result::Result<T, CramError>;

/// Error type for cramstream operations
#[derive(Error, Debug)]
pub enum CramError {
    /// An underlying stream (output sink, index sink, or a local reference
    /// file) failed during a read, write, flush or close
    #[error("I/O error: {0}")]
    SinkIo(#[from] std::io::Error),

    /// The reference provider could not supply bases for a sequence
    #[error("Failed to fetch reference sequence {sequence_index}: {reason}")]
    ReferenceFetch {
        /// Index of the sequence in the header dictionary
        sequence_index: usize,
        /// Explanation of the failure
        reason: String,
    },

    /// A track-requiring lossy policy was configured but the batch spans
    /// more than one reference sequence
    #[error(
        "Cannot apply reference-based lossy compression to a multi-reference container"
    )]
    LossyMultiRefNotSupported,

    /// Paranoid-mode round-trip restoration produced a record that differs
    /// from the original
    #[error("Round-trip mismatch for record '{read_name}': {field} differs after restore")]
    RoundTripMismatch {
        /// Name of the offending read
        read_name: String,
        /// Which field failed the comparison
        field: &'static str,
    },

    /// `write_alignment` was called before `write_header`
    #[error("write_alignment called before write_header")]
    HeaderNotYetWritten,

    /// `write_header` was called a second time
    #[error("write_header must be called exactly once")]
    HeaderAlreadyWritten,

    /// The textual SAM header could not be parsed
    #[error("Invalid SAM header: {0}")]
    InvalidHeader(String),

    /// A quality preservation policy string could not be parsed
    #[error("Invalid quality preservation policy '{policy}': {reason}")]
    InvalidPreservationPolicy {
        /// The offending policy string
        policy: String,
        /// Explanation of why it's invalid
        reason: String,
    },
}
