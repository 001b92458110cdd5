// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Cryptographic building blocks: the AES-XTS decryption context used for
//! sectors and encrypted metadata, AES Key Wrap (RFC 3394) unwrapping, the
//! PBKDF2 password derivation and the XTS tweak-key derivation.
//!
//! The key-unwrap here intentionally does not validate the integrity value
//! `A` against `0xA6A6A6A6A6A6A6A6`; the format validates key material
//! downstream by probing the decrypted volume instead.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use sha2::{Digest, Sha256};
use xts_mode::{Xts128, get_tweak_default};

use crate::MEMORY_MAXIMUM_ALLOCATION_SIZE;
use crate::error::{Error, Result};

/// AES-128-XTS decryption context holding the data and tweak key schedules
pub struct XtsContext {
    cipher: Xts128<Aes128>,
}

impl XtsContext {
    /// Creates a decryption context from the data key and the tweak key
    pub fn new(key: &[u8; 16], tweak_key: &[u8; 16]) -> Self {
        let cipher = Xts128::new(
            Aes128::new(GenericArray::from_slice(key)),
            Aes128::new(GenericArray::from_slice(tweak_key)),
        );
        Self { cipher }
    }

    /// Decrypts one unit in place, with the 16-byte tweak being the
    /// little-endian encoding of `tweak_value` padded with zeros.
    pub fn decrypt(&self, data: &mut [u8], tweak_value: u64) -> Result<()> {
        if data.is_empty() || data.len() % 16 != 0 {
            return Err(Error::InvalidArgument {
                reason: "XTS data size is not a multiple of 16",
            });
        }
        self.cipher
            .decrypt_sector(data, get_tweak_default(tweak_value as u128));
        Ok(())
    }
}

impl std::fmt::Debug for XtsContext {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("XtsContext").finish_non_exhaustive()
    }
}

enum UnwrapCipher {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

impl UnwrapCipher {
    fn decrypt_block(&self, block: &mut [u8; 16]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(cipher) => cipher.decrypt_block(block),
            Self::Aes192(cipher) => cipher.decrypt_block(block),
            Self::Aes256(cipher) => cipher.decrypt_block(block),
        }
    }
}

/// Unwraps `wrapped` with AES Key Wrap (RFC 3394) under `key`.
///
/// `key` must be 16, 24 or 32 bytes; `wrapped` must be a multiple of 8
/// larger than 8 bytes. Returns the `wrapped.len() - 8` payload bytes; the
/// integrity value is discarded without validation.
pub fn aes_key_unwrap(key: &[u8], wrapped: &[u8]) -> Result<Vec<u8>> {
    let cipher = match key.len() {
        16 => UnwrapCipher::Aes128(Aes128::new(GenericArray::from_slice(key))),
        24 => UnwrapCipher::Aes192(Aes192::new(GenericArray::from_slice(key))),
        32 => UnwrapCipher::Aes256(Aes256::new(GenericArray::from_slice(key))),
        _ => {
            return Err(Error::InvalidArgument {
                reason: "key unwrap key size is not 128, 192 or 256 bits",
            });
        }
    };
    if wrapped.len() <= 8 || wrapped.len() % 8 != 0 {
        return Err(Error::InvalidArgument {
            reason: "wrapped data size is not a positive multiple of 8 above 8",
        });
    }
    let number_of_blocks = wrapped.len() / 8;

    let mut vector: [u8; 8] = wrapped[..8].try_into().expect("8-byte slice");
    let mut blocks = wrapped[8..].to_vec();

    let mut block_data = [0u8; 16];
    for round_index in (0..=5u64).rev() {
        for block_index in (1..number_of_blocks as u64).rev() {
            let counter = round_index * (number_of_blocks as u64 - 1) + block_index;
            let counter_bytes = counter.to_be_bytes();

            for (byte, &counter_byte) in block_data[..8].iter_mut().zip(&counter_bytes) {
                *byte = counter_byte;
            }
            for (byte, &vector_byte) in block_data[..8].iter_mut().zip(&vector) {
                *byte ^= vector_byte;
            }
            let block_offset = (block_index as usize - 1) * 8;
            block_data[8..].copy_from_slice(&blocks[block_offset..block_offset + 8]);

            cipher.decrypt_block(&mut block_data);

            vector.copy_from_slice(&block_data[..8]);
            blocks[block_offset..block_offset + 8].copy_from_slice(&block_data[8..]);
        }
    }
    Ok(blocks)
}

/// Derives a key from a password with PBKDF2-HMAC-SHA256
pub fn pbkdf2_sha256(
    password: &[u8],
    salt: &[u8],
    number_of_iterations: u32,
    output: &mut [u8],
) -> Result<()> {
    if number_of_iterations == 0 {
        return Err(Error::InvalidArgument {
            reason: "PBKDF2 iteration count is zero",
        });
    }
    if salt.len() > MEMORY_MAXIMUM_ALLOCATION_SIZE - 4 {
        return Err(Error::InvalidArgument {
            reason: "PBKDF2 salt size exceeds the memory limit",
        });
    }
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, number_of_iterations, output);
    Ok(())
}

/// Derives the XTS tweak key: the first 16 bytes of
/// `SHA256(volume_master_key ‖ family_identifier)`
pub fn derive_tweak_key(volume_master_key: &[u8; 16], family_identifier: &[u8; 16]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(volume_master_key);
    hasher.update(family_identifier);
    let digest = hasher.finalize();
    digest[..16].try_into().expect("32-byte digest")
}
