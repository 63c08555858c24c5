//! Error types for cryptographic operations

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid key size
    #[error("Invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize {
        /// Expected key size in bytes
        expected: &'static str,
        /// Actual key size in bytes
        actual: usize,
    },

    /// Invalid IV size
    #[error("Invalid IV size: expected {expected}, got {actual}")]
    InvalidIvSize {
        /// Expected IV size in bytes
        expected: usize,
        /// Actual IV size in bytes
        actual: usize,
    },

    /// Input is not a whole number of cipher blocks
    #[error("Invalid data length: {0} is not a multiple of the 16-byte block size")]
    InvalidDataLength(usize),

    /// Caller-provided output buffer cannot hold the result
    #[error("Output buffer too small: need {needed} bytes, got {actual}")]
    OutputTooSmall {
        /// Required output size in bytes
        needed: usize,
        /// Provided output size in bytes
        actual: usize,
    },

    /// PKCS#7 padding is missing or inconsistent
    #[error("Invalid PKCS#7 padding")]
    InvalidPadding,

    /// The CPU does not expose the AES instruction set
    #[error("AES-NI and SSE2 are required but not available on this CPU")]
    HardwareUnsupported,

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// An RSA input block is numerically not smaller than the modulus
    #[error("RSA input block {block} is too large for the key modulus")]
    RsaBlockTooLarge {
        /// Zero-based index of the offending block
        block: usize,
    },
}
