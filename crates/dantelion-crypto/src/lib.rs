//! Cryptographic primitives for BHD5/BDT archives
//!
//! This crate provides the building blocks needed to open the split archives
//! shipped by several action-RPG titles: an RSA-encrypted header (`.bhd`) and
//! a companion data file (`.bdt`) with AES-encrypted ranges inside some files.
//!
//! # Components
//!
//! - **Cipher**: [`AesEngine`], an AES-NI AES-128/256 engine with ECB decrypt
//!   and CBC encrypt/decrypt
//! - **Header decryption**: [`RsaHeaderKey`] implementing [`HeaderDecryptor`]
//! - **Hashing**: [`HeaderDigest`] (MD5) for cache validation, [`FileHash32`]
//!   and [`FileHash64`] for path lookups
//!
//! # Examples
//!
//! ## Path hashing
//!
//! ```
//! use dantelion_crypto::path_hash::{FileHash64, PathHashKind};
//!
//! let hash = FileHash64::hash("/regulation.bin");
//! assert_eq!(hash, PathHashKind::Bits64.hash("/REGULATION.BIN"));
//! ```
//!
//! ## Header digests
//!
//! ```
//! use dantelion_crypto::md5::HeaderDigest;
//!
//! let digest = HeaderDigest::from_data(b"encrypted header bytes");
//! println!("Header digest: {}", digest);
//! ```

#![warn(missing_docs)]

pub mod aes;
pub mod error;
pub mod md5;
pub mod path_hash;
pub mod rsa;

pub use crate::error::CryptoError;

// Re-export commonly used types
pub use crate::aes::{AesEngine, AesKeySize, BLOCK_SIZE, pkcs7_unpad};
pub use crate::md5::HeaderDigest;
pub use crate::path_hash::{FileHash32, FileHash64, FilePathHash, PathHashKind, fold_case};
pub use crate::rsa::{HeaderDecryptor, RsaHeaderKey};
