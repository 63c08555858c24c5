//! Hardware-accelerated AES block cipher
//!
//! Supports AES-128 and AES-256 with two modes:
//! - ECB decryption, used for the per-file encrypted ranges inside `.bdt` data
//! - CBC encryption (PKCS#7) and decryption
//!
//! There is no software fallback. [`AesEngine::new`] fails with
//! [`CryptoError::HardwareUnsupported`] when the CPU lacks AES-NI.
//!
//! # Round keys
//!
//! The encrypt schedule follows FIPS-197. The decrypt schedule uses the
//! Equivalent Inverse Cipher: decrypt key 0 is the last encrypt key, decrypt
//! key `N` is the first, and every key in between is `InvMixColumns` of the
//! matching encrypt key in reverse order. Both directions therefore share the
//! same loop shape: whitening XOR, `N - 1` full rounds, one final round.
//!
//! # Example
//!
//! ```no_run
//! use dantelion_crypto::aes::AesEngine;
//!
//! let engine = AesEngine::new(&[0u8; 16])?;
//! let ciphertext = engine.cbc_encrypt_to_vec(b"hello", &[0u8; 16])?;
//! let plaintext = engine.cbc_decrypt(&ciphertext, &[0u8; 16])?;
//! assert_eq!(plaintext, b"hello");
//! # Ok::<(), dantelion_crypto::CryptoError>(())
//! ```

use std::fmt;

use crate::error::CryptoError;

#[cfg_attr(target_arch = "x86_64", path = "ni.rs")]
#[cfg_attr(not(target_arch = "x86_64"), path = "unsupported.rs")]
mod ni;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Number of blocks processed together in the parallel (ECB/CBC-decrypt) loops
pub(crate) const BATCH_BLOCKS: usize = 8;

/// Round keys for the largest supported key (AES-256: 14 rounds + whitening)
const MAX_ROUND_KEYS: usize = 15;

/// One 128-bit round key, aligned for direct vector loads
#[derive(Clone, Copy, Default)]
#[repr(C, align(16))]
pub(crate) struct RoundKey(pub(crate) [u8; BLOCK_SIZE]);

/// Supported AES key sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AesKeySize {
    /// 16-byte key, 10 rounds
    Aes128,
    /// 32-byte key, 14 rounds
    Aes256,
}

impl AesKeySize {
    /// Select the key size for a raw key length
    pub const fn from_key_len(len: usize) -> Result<Self, CryptoError> {
        match len {
            16 => Ok(Self::Aes128),
            32 => Ok(Self::Aes256),
            actual => Err(CryptoError::InvalidKeySize {
                expected: "16 or 32",
                actual,
            }),
        }
    }

    /// Key length in bytes
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes256 => 32,
        }
    }

    /// Number of cipher rounds
    pub const fn rounds(self) -> usize {
        match self {
            Self::Aes128 => 10,
            Self::Aes256 => 14,
        }
    }
}

/// AES cipher context with expanded encrypt and decrypt round keys.
///
/// The schedule is computed once in [`AesEngine::new`] and never mutated, so
/// an engine can be shared between threads behind an `Arc`.
pub struct AesEngine {
    key_size: AesKeySize,
    enc: [RoundKey; MAX_ROUND_KEYS],
    dec: [RoundKey; MAX_ROUND_KEYS],
}

impl AesEngine {
    /// Expand `key` (16 or 32 bytes) into a new engine.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let key_size = AesKeySize::from_key_len(key.len())?;
        if !Self::is_supported() {
            return Err(CryptoError::HardwareUnsupported);
        }

        let mut enc = [RoundKey::default(); MAX_ROUND_KEYS];
        let mut dec = [RoundKey::default(); MAX_ROUND_KEYS];

        // SAFETY: `is_supported` confirmed AES-NI and SSE2 above.
        #[allow(unsafe_code)]
        unsafe {
            match key_size {
                AesKeySize::Aes128 => ni::expand_key_128(key, &mut enc),
                AesKeySize::Aes256 => ni::expand_key_256(key, &mut enc),
            }
            ni::invert_schedule(&enc, &mut dec, key_size.rounds());
        }

        Ok(Self { key_size, enc, dec })
    }

    /// Whether this CPU provides the instructions the engine needs
    pub fn is_supported() -> bool {
        ni::is_supported()
    }

    /// Key size this engine was built for
    pub const fn key_size(&self) -> AesKeySize {
        self.key_size
    }

    fn encrypt_keys(&self) -> &[RoundKey] {
        &self.enc[..=self.key_size.rounds()]
    }

    fn decrypt_keys(&self) -> &[RoundKey] {
        &self.dec[..=self.key_size.rounds()]
    }

    /// Decrypt `data` in place in ECB mode.
    ///
    /// `data` must be a whole number of blocks. Blocks are independent, so
    /// this is also what the selective range decryption calls per range.
    pub fn ecb_decrypt_in_place(&self, data: &mut [u8]) -> Result<(), CryptoError> {
        check_block_multiple(data.len())?;

        // SAFETY: an engine only exists on CPUs that passed `is_supported`,
        // and the length was validated above.
        #[allow(unsafe_code)]
        unsafe {
            ni::ecb_decrypt(self.decrypt_keys(), data);
        }
        Ok(())
    }

    /// Encrypt `plaintext` in CBC mode with PKCS#7 padding into `output`.
    ///
    /// `output` must hold at least [`cbc_ciphertext_len`] bytes. Returns the
    /// number of bytes written.
    pub fn cbc_encrypt(
        &self,
        plaintext: &[u8],
        iv: &[u8],
        output: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let iv = check_iv(iv)?;
        let needed = cbc_ciphertext_len(plaintext.len());
        if output.len() < needed {
            return Err(CryptoError::OutputTooSmall {
                needed,
                actual: output.len(),
            });
        }

        // SAFETY: engine existence implies hardware support; `output` holds
        // `needed` bytes.
        #[allow(unsafe_code)]
        unsafe {
            ni::cbc_encrypt(self.encrypt_keys(), iv, plaintext, &mut output[..needed]);
        }
        Ok(needed)
    }

    /// Encrypt `plaintext` in CBC mode with PKCS#7 padding into a new buffer
    pub fn cbc_encrypt_to_vec(&self, plaintext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut output = vec![0u8; cbc_ciphertext_len(plaintext.len())];
        self.cbc_encrypt(plaintext, iv, &mut output)?;
        Ok(output)
    }

    /// Decrypt `data` in place in CBC mode without touching padding
    pub fn cbc_decrypt_in_place(&self, data: &mut [u8], iv: &[u8]) -> Result<(), CryptoError> {
        let iv = check_iv(iv)?;
        check_block_multiple(data.len())?;

        // SAFETY: engine existence implies hardware support; length validated.
        #[allow(unsafe_code)]
        unsafe {
            ni::cbc_decrypt(self.decrypt_keys(), iv, data);
        }
        Ok(())
    }

    /// Decrypt CBC `ciphertext` and strip its PKCS#7 padding
    pub fn cbc_decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut data = ciphertext.to_vec();
        self.cbc_decrypt_in_place(&mut data, iv)?;
        let len = pkcs7_unpad(&data)?.len();
        data.truncate(len);
        Ok(data)
    }
}

impl fmt::Debug for AesEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesEngine")
            .field("key_size", &self.key_size)
            .finish_non_exhaustive()
    }
}

/// Size of the CBC ciphertext produced for `plaintext_len` bytes.
///
/// PKCS#7 always adds between 1 and 16 bytes, so a block-aligned plaintext
/// gains a whole extra block.
pub const fn cbc_ciphertext_len(plaintext_len: usize) -> usize {
    (plaintext_len / BLOCK_SIZE + 1) * BLOCK_SIZE
}

/// Return `data` without its trailing PKCS#7 padding
pub fn pkcs7_unpad(data: &[u8]) -> Result<&[u8], CryptoError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidPadding);
    }
    let pad = usize::from(data[data.len() - 1]);
    if pad == 0 || pad > BLOCK_SIZE {
        return Err(CryptoError::InvalidPadding);
    }
    let (body, padding) = data.split_at(data.len() - pad);
    if padding.iter().any(|&b| usize::from(b) != pad) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(body)
}

fn check_block_multiple(len: usize) -> Result<(), CryptoError> {
    if len % BLOCK_SIZE == 0 {
        Ok(())
    } else {
        Err(CryptoError::InvalidDataLength(len))
    }
}

fn check_iv(iv: &[u8]) -> Result<&[u8; BLOCK_SIZE], CryptoError> {
    iv.try_into().map_err(|_| CryptoError::InvalidIvSize {
        expected: BLOCK_SIZE,
        actual: iv.len(),
    })
}
