//! AES-NI kernels for x86_64
//!
//! Every function here requires the `aes` and `sse2` target features. Callers
//! guarantee that by only reaching these through an [`super::AesEngine`],
//! which cannot be built unless [`is_supported`] returned true.
//!
//! Length preconditions are checked once by the engine. Inside the loops the
//! data is walked with `chunks_exact`, so there are no per-block bounds checks.

#![allow(unsafe_code)]
#![allow(unused_unsafe)]
#![allow(clippy::cast_ptr_alignment)]

use std::arch::x86_64::{
    __m128i, _mm_aesdec_si128, _mm_aesdeclast_si128, _mm_aesenc_si128, _mm_aesenclast_si128,
    _mm_aesimc_si128, _mm_aeskeygenassist_si128, _mm_load_si128, _mm_loadu_si128,
    _mm_setzero_si128, _mm_shuffle_epi32, _mm_slli_si128, _mm_store_si128, _mm_storeu_si128,
    _mm_xor_si128,
};

use super::{BATCH_BLOCKS, BLOCK_SIZE, RoundKey};

const BATCH_BYTES: usize = BATCH_BLOCKS * BLOCK_SIZE;

pub fn is_supported() -> bool {
    is_x86_feature_detected!("aes") && is_x86_feature_detected!("sse2")
}

#[inline]
#[target_feature(enable = "sse2")]
unsafe fn load_key(key: &RoundKey) -> __m128i {
    // RoundKey is 16-byte aligned
    unsafe { _mm_load_si128(key.0.as_ptr().cast::<__m128i>()) }
}

#[inline]
#[target_feature(enable = "sse2")]
unsafe fn store_key(key: &mut RoundKey, value: __m128i) {
    unsafe { _mm_store_si128(key.0.as_mut_ptr().cast::<__m128i>(), value) }
}

#[inline]
#[target_feature(enable = "sse2")]
unsafe fn load_block(block: &[u8]) -> __m128i {
    debug_assert_eq!(block.len(), BLOCK_SIZE);
    unsafe { _mm_loadu_si128(block.as_ptr().cast::<__m128i>()) }
}

#[inline]
#[target_feature(enable = "sse2")]
unsafe fn store_block(block: &mut [u8], value: __m128i) {
    debug_assert_eq!(block.len(), BLOCK_SIZE);
    unsafe { _mm_storeu_si128(block.as_mut_ptr().cast::<__m128i>(), value) }
}

/// `key ^= key << 32 ^ key << 64 ^ key << 96`, then XOR in the assist word
#[inline]
#[target_feature(enable = "sse2")]
unsafe fn expand_step(key: __m128i, assist: __m128i) -> __m128i {
    unsafe {
        let mut key = key;
        let mut shifted = _mm_slli_si128::<4>(key);
        key = _mm_xor_si128(key, shifted);
        shifted = _mm_slli_si128::<4>(shifted);
        key = _mm_xor_si128(key, shifted);
        shifted = _mm_slli_si128::<4>(shifted);
        key = _mm_xor_si128(key, shifted);
        _mm_xor_si128(key, assist)
    }
}

/// Expand a 16-byte key into 11 encrypt round keys
#[target_feature(enable = "aes,sse2")]
pub unsafe fn expand_key_128(key: &[u8], out: &mut [RoundKey; 15]) {
    unsafe {
        let mut k = load_block(&key[..BLOCK_SIZE]);
        store_key(&mut out[0], k);

        macro_rules! round {
            ($i:literal, $rcon:literal) => {
                k = expand_step(
                    k,
                    _mm_shuffle_epi32::<0xff>(_mm_aeskeygenassist_si128::<$rcon>(k)),
                );
                store_key(&mut out[$i], k);
            };
        }

        round!(1, 0x01);
        round!(2, 0x02);
        round!(3, 0x04);
        round!(4, 0x08);
        round!(5, 0x10);
        round!(6, 0x20);
        round!(7, 0x40);
        round!(8, 0x80);
        round!(9, 0x1b);
        round!(10, 0x36);
    }
}

/// Expand a 32-byte key into 15 encrypt round keys.
///
/// Even round keys take RotWord + SubWord + Rcon of the previous odd key.
/// Odd round keys take SubWord only (assist with Rcon 0, word 2 broadcast).
#[target_feature(enable = "aes,sse2")]
pub unsafe fn expand_key_256(key: &[u8], out: &mut [RoundKey; 15]) {
    unsafe {
        let mut even = load_block(&key[..BLOCK_SIZE]);
        let mut odd = load_block(&key[BLOCK_SIZE..2 * BLOCK_SIZE]);
        store_key(&mut out[0], even);
        store_key(&mut out[1], odd);

        macro_rules! pair {
            ($i:literal, $rcon:literal) => {
                even = expand_step(
                    even,
                    _mm_shuffle_epi32::<0xff>(_mm_aeskeygenassist_si128::<$rcon>(odd)),
                );
                store_key(&mut out[$i], even);
                odd = expand_step(
                    odd,
                    _mm_shuffle_epi32::<0xaa>(_mm_aeskeygenassist_si128::<0x00>(even)),
                );
                store_key(&mut out[$i + 1], odd);
            };
        }

        pair!(2, 0x01);
        pair!(4, 0x02);
        pair!(6, 0x04);
        pair!(8, 0x08);
        pair!(10, 0x10);
        pair!(12, 0x20);

        even = expand_step(
            even,
            _mm_shuffle_epi32::<0xff>(_mm_aeskeygenassist_si128::<0x40>(odd)),
        );
        store_key(&mut out[14], even);
    }
}

/// Derive the Equivalent Inverse Cipher schedule from the encrypt schedule
#[target_feature(enable = "aes,sse2")]
pub unsafe fn invert_schedule(enc: &[RoundKey; 15], dec: &mut [RoundKey; 15], rounds: usize) {
    dec[0] = enc[rounds];
    dec[rounds] = enc[0];
    for i in 1..rounds {
        unsafe { store_key(&mut dec[i], _mm_aesimc_si128(load_key(&enc[rounds - i]))) };
    }
}

#[inline]
#[target_feature(enable = "aes,sse2")]
unsafe fn encrypt_block(keys: &[RoundKey], block: __m128i) -> __m128i {
    let last = keys.len() - 1;
    unsafe {
        let mut b = _mm_xor_si128(block, load_key(&keys[0]));
        for key in &keys[1..last] {
            b = _mm_aesenc_si128(b, load_key(key));
        }
        _mm_aesenclast_si128(b, load_key(&keys[last]))
    }
}

#[inline]
#[target_feature(enable = "aes,sse2")]
unsafe fn decrypt_block(keys: &[RoundKey], block: __m128i) -> __m128i {
    let last = keys.len() - 1;
    unsafe {
        let mut b = _mm_xor_si128(block, load_key(&keys[0]));
        for key in &keys[1..last] {
            b = _mm_aesdec_si128(b, load_key(key));
        }
        _mm_aesdeclast_si128(b, load_key(&keys[last]))
    }
}

/// Run the inverse cipher over a full batch, interleaved so the AES units
/// stay busy while earlier blocks are still in flight
#[inline]
#[target_feature(enable = "aes,sse2")]
unsafe fn decrypt_batch(keys: &[RoundKey], blocks: &mut [__m128i; BATCH_BLOCKS]) {
    let last = keys.len() - 1;
    unsafe {
        let k = load_key(&keys[0]);
        for b in blocks.iter_mut() {
            *b = _mm_xor_si128(*b, k);
        }
        for key in &keys[1..last] {
            let k = load_key(key);
            for b in blocks.iter_mut() {
                *b = _mm_aesdec_si128(*b, k);
            }
        }
        let k = load_key(&keys[last]);
        for b in blocks.iter_mut() {
            *b = _mm_aesdeclast_si128(*b, k);
        }
    }
}

#[inline]
#[target_feature(enable = "sse2")]
unsafe fn load_batch(batch: &[u8]) -> [__m128i; BATCH_BLOCKS] {
    unsafe {
        let mut blocks = [_mm_setzero_si128(); BATCH_BLOCKS];
        for (b, chunk) in blocks.iter_mut().zip(batch.chunks_exact(BLOCK_SIZE)) {
            *b = load_block(chunk);
        }
        blocks
    }
}

#[inline]
#[target_feature(enable = "sse2")]
unsafe fn store_batch(batch: &mut [u8], blocks: &[__m128i; BATCH_BLOCKS]) {
    for (chunk, b) in batch.chunks_exact_mut(BLOCK_SIZE).zip(blocks) {
        unsafe { store_block(chunk, *b) };
    }
}

/// ECB-decrypt `data` in place. `data.len()` is a multiple of 16.
#[target_feature(enable = "aes,sse2")]
pub unsafe fn ecb_decrypt(keys: &[RoundKey], data: &mut [u8]) {
    let mut batches = data.chunks_exact_mut(BATCH_BYTES);
    for batch in &mut batches {
        unsafe {
            let mut blocks = load_batch(batch);
            decrypt_batch(keys, &mut blocks);
            store_batch(batch, &blocks);
        }
    }

    for block in batches.into_remainder().chunks_exact_mut(BLOCK_SIZE) {
        unsafe {
            let b = decrypt_block(keys, load_block(block));
            store_block(block, b);
        }
    }
}

/// CBC-encrypt `input` with PKCS#7 into `output`.
/// `output.len()` is exactly `(input.len() / 16 + 1) * 16`.
#[target_feature(enable = "aes,sse2")]
pub unsafe fn cbc_encrypt(keys: &[RoundKey], iv: &[u8; BLOCK_SIZE], input: &[u8], output: &mut [u8]) {
    unsafe {
        let mut feedback = load_block(iv);
        let mut out_blocks = output.chunks_exact_mut(BLOCK_SIZE);
        let in_blocks = input.chunks_exact(BLOCK_SIZE);
        let tail = in_blocks.remainder();

        for (src, dst) in in_blocks.zip(&mut out_blocks) {
            feedback = encrypt_block(keys, _mm_xor_si128(load_block(src), feedback));
            store_block(dst, feedback);
        }

        let pad = (BLOCK_SIZE - tail.len()) as u8;
        let mut last = [pad; BLOCK_SIZE];
        last[..tail.len()].copy_from_slice(tail);
        if let Some(dst) = out_blocks.next() {
            let b = encrypt_block(keys, _mm_xor_si128(load_block(&last), feedback));
            store_block(dst, b);
        }
    }
}

/// CBC-decrypt `data` in place. `data.len()` is a multiple of 16.
///
/// Each batch is decrypted independently first, then chained: block `i` is
/// XORed with ciphertext `i - 1`, and the batch's last ciphertext block is
/// carried forward as the IV of the next batch.
#[target_feature(enable = "aes,sse2")]
pub unsafe fn cbc_decrypt(keys: &[RoundKey], iv: &[u8; BLOCK_SIZE], data: &mut [u8]) {
    unsafe {
        let mut carry = load_block(iv);
        let mut batches = data.chunks_exact_mut(BATCH_BYTES);

        for batch in &mut batches {
            let ciphertext = load_batch(batch);
            let mut blocks = ciphertext;
            decrypt_batch(keys, &mut blocks);

            blocks[0] = _mm_xor_si128(blocks[0], carry);
            for i in 1..BATCH_BLOCKS {
                blocks[i] = _mm_xor_si128(blocks[i], ciphertext[i - 1]);
            }
            carry = ciphertext[BATCH_BLOCKS - 1];

            store_batch(batch, &blocks);
        }

        for block in batches.into_remainder().chunks_exact_mut(BLOCK_SIZE) {
            let ciphertext = load_block(block);
            let plain = _mm_xor_si128(decrypt_block(keys, ciphertext), carry);
            carry = ciphertext;
            store_block(block, plain);
        }
    }
}
