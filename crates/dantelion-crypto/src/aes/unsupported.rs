//! Targets without AES-NI.
//!
//! [`is_supported`] is always false here, so [`super::AesEngine::new`] fails
//! before any of the kernels below could be reached.

#![allow(unsafe_code)]
#![allow(clippy::missing_const_for_fn)]

use super::{BLOCK_SIZE, RoundKey};

pub fn is_supported() -> bool {
    false
}

pub unsafe fn expand_key_128(_key: &[u8], _out: &mut [RoundKey; 15]) {}

pub unsafe fn expand_key_256(_key: &[u8], _out: &mut [RoundKey; 15]) {}

pub unsafe fn invert_schedule(_enc: &[RoundKey; 15], _dec: &mut [RoundKey; 15], _rounds: usize) {}

pub unsafe fn ecb_decrypt(_keys: &[RoundKey], _data: &mut [u8]) {}

pub unsafe fn cbc_encrypt(
    _keys: &[RoundKey],
    _iv: &[u8; BLOCK_SIZE],
    _input: &[u8],
    _output: &mut [u8],
) {
}

pub unsafe fn cbc_decrypt(_keys: &[RoundKey], _iv: &[u8; BLOCK_SIZE], _data: &mut [u8]) {}
