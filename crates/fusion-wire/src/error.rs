//! Error types for the frame format

use thiserror::Error;

/// Errors raised while encoding or decoding frames
#[derive(Debug, Error)]
pub enum WireError {
    /// Invalid magic bytes (expected "FUSN")
    #[error("Invalid magic: expected 'FUSN', got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Frame written by an incompatible peer
    #[error("Unsupported frame version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version this build speaks
        expected: u8,
        /// Version found in the frame
        found: u8,
    },

    /// Data is too short to hold a frame header
    #[error("Truncated frame: expected at least {expected} bytes, got {actual} bytes")]
    Truncated {
        /// Minimum frame size
        expected: usize,
        /// Actual data size
        actual: usize,
    },

    /// Encoded frame exceeds the datagram limit
    #[error("Frame of {size} bytes exceeds maximum of {max} bytes")]
    TooLarge {
        /// Encoded size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Bytes left over after the frame body
    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),

    /// Binary read/write error
    #[error("Binary format error: {0}")]
    Codec(#[from] binrw::Error),
}

/// Result type for frame operations
pub type Result<T> = std::result::Result<T, WireError>;
