//! RSA decryption of archive headers
//!
//! `.bhd` headers are encrypted block-by-block with raw (unpadded) RSA. Each
//! input block is exactly one modulus long; each decrypted block is written
//! out left-padded with zeros to the output block size, which is one byte
//! shorter than the modulus. A short final input block is decrypted as-is and
//! padded the same way.
//!
//! The key files shipped for these archives hold PKCS#1 public keys
//! (`BEGIN RSA PUBLIC KEY`); private keys are accepted as well so that test
//! fixtures and re-encrypted headers can be handled with the same type.

use rsa::BigUint;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::CryptoError;

/// Something that can turn an encrypted header into its plaintext.
///
/// The header cache is written against this trait so the expensive RSA step
/// can be observed or replaced in tests.
pub trait HeaderDecryptor: Send + Sync {
    /// Decrypt a complete encrypted header
    fn decrypt_header(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Raw RSA key used to decrypt a header
#[derive(Debug, Clone)]
pub struct RsaHeaderKey {
    modulus: BigUint,
    exponent: BigUint,
    modulus_bits: usize,
}

impl RsaHeaderKey {
    /// Parse a PEM key. Accepts PKCS#1 and PKCS#8, public or private.
    ///
    /// Line endings and indentation are normalized first, since keys read
    /// back from the key store may carry `\r\n` or stray whitespace.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let normalized = pem
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        let invalid = |e: &dyn std::fmt::Display| CryptoError::InvalidKeyFormat(e.to_string());

        if normalized.contains("BEGIN RSA PUBLIC KEY") {
            RsaPublicKey::from_pkcs1_pem(&normalized)
                .map(|key| Self::from_public_key(&key))
                .map_err(|e| invalid(&e))
        } else if normalized.contains("BEGIN PUBLIC KEY") {
            RsaPublicKey::from_public_key_pem(&normalized)
                .map(|key| Self::from_public_key(&key))
                .map_err(|e| invalid(&e))
        } else if normalized.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(&normalized)
                .map(|key| Self::from_private_key(&key))
                .map_err(|e| invalid(&e))
        } else if normalized.contains("BEGIN PRIVATE KEY") {
            RsaPrivateKey::from_pkcs8_pem(&normalized)
                .map(|key| Self::from_private_key(&key))
                .map_err(|e| invalid(&e))
        } else {
            Err(CryptoError::InvalidKeyFormat(
                "no PEM RSA key block found".to_string(),
            ))
        }
    }

    /// Decrypt with the public exponent
    pub fn from_public_key(key: &RsaPublicKey) -> Self {
        Self::from_parts(key.n().clone(), key.e().clone())
    }

    /// Decrypt with the private exponent
    pub fn from_private_key(key: &RsaPrivateKey) -> Self {
        Self::from_parts(key.n().clone(), key.d().clone())
    }

    fn from_parts(modulus: BigUint, exponent: BigUint) -> Self {
        let modulus_bits = modulus.bits();
        Self {
            modulus,
            exponent,
            modulus_bits,
        }
    }

    /// Size of one encrypted block in bytes (the modulus length)
    pub const fn input_block_size(&self) -> usize {
        self.modulus_bits.div_ceil(8)
    }

    /// Size of one decrypted block in bytes
    pub const fn output_block_size(&self) -> usize {
        self.modulus_bits.saturating_sub(1) / 8
    }

    /// Decrypt `encrypted` block-by-block
    pub fn decrypt_blocks(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let input_size = self.input_block_size();
        let output_size = self.output_block_size();
        if input_size == 0 {
            return Err(CryptoError::InvalidKeyFormat("empty modulus".to_string()));
        }

        let mut output = Vec::with_capacity(encrypted.len().div_ceil(input_size) * output_size);
        for (index, block) in encrypted.chunks(input_size).enumerate() {
            let c = BigUint::from_bytes_be(block);
            if c >= self.modulus {
                return Err(CryptoError::RsaBlockTooLarge { block: index });
            }

            let m = c.modpow(&self.exponent, &self.modulus);
            let bytes = m.to_bytes_be();
            let significant = strip_leading_zeros(&bytes);

            if significant.len() < output_size {
                output.resize(output.len() + output_size - significant.len(), 0);
            }
            output.extend_from_slice(significant);
        }

        Ok(output)
    }
}

impl HeaderDecryptor for RsaHeaderKey {
    fn decrypt_header(&self, encrypted: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_blocks(encrypted)
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}
