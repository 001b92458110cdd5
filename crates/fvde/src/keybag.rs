// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The encryption-context plist: the keybag holding wrapped key material.
//!
//! The same document appears in two places: embedded in the encrypted
//! metadata (record type 0x0019) and as the `EncryptedRoot.plist` file an
//! operator can supply out of band. Its `CryptoUsers` entries carry a
//! passphrase-wrapped KEK each (PBKDF2 salt, iteration count, 24 wrapped
//! bytes); `WrappedVolumeKeys` carries the KEK-wrapped volume master key.
//! Recovering a VMK runs PBKDF2 → unwrap KEK → unwrap VMK.

use zeroize::Zeroizing;

use crate::crypto::{aes_key_unwrap, pbkdf2_sha256};
use crate::error::{Error, Result};
use crate::plist::{self, Value};

/// Size of a serialized passphrase-wrapped KEK struct
pub const PASSPHRASE_WRAPPED_KEK_STRUCT_SIZE: usize = 284;

/// Size of a serialized KEK-wrapped volume key struct
pub const KEK_WRAPPED_VOLUME_KEY_STRUCT_SIZE: usize = 140;

/// One `CryptoUsers` entry: a user secret wrapping the KEK
#[derive(Debug, Clone)]
pub struct CryptoUser {
    /// User identifier when present
    pub identifier: Option<[u8; 16]>,
    /// User type tag; interpreted opaquely
    pub user_type: Option<i64>,
    /// PBKDF2 salt
    pub salt: [u8; 16],
    /// PBKDF2 iteration count
    pub number_of_iterations: u32,
    /// AES-wrapped key encryption key
    pub wrapped_kek: [u8; 24],
}

/// One `WrappedVolumeKeys` entry: the KEK wrapping the volume master key
#[derive(Debug, Clone)]
pub struct WrappedVolumeKey {
    /// AES-wrapped volume master key
    pub wrapped_volume_master_key: [u8; 24],
}

/// A parsed encryption-context plist
#[derive(Debug, Default)]
pub struct EncryptionContextPlist {
    /// Family this keybag belongs to, when the document names one
    pub family_identifier: Option<[u8; 16]>,
    /// Secret-holding users able to release the KEK
    pub crypto_users: Vec<CryptoUser>,
    /// Wrapped copies of the volume master key
    pub wrapped_volume_keys: Vec<WrappedVolumeKey>,
}

impl EncryptionContextPlist {
    /// Parses the XML document
    pub fn read(data: &[u8]) -> Result<Self> {
        let root = plist::parse(data)?;

        let family_identifier = root
            .get("com.apple.corestorage.lvf.uuid")
            .and_then(Value::as_uuid);

        let mut crypto_users = Vec::new();
        if let Some(users) = root.get("CryptoUsers").and_then(Value::as_array) {
            for user in users {
                crypto_users.push(read_crypto_user(user)?);
            }
        }
        let mut wrapped_volume_keys = Vec::new();
        if let Some(keys) = root.get("WrappedVolumeKeys").and_then(Value::as_array) {
            for key in keys {
                wrapped_volume_keys.push(read_wrapped_volume_key(key)?);
            }
        }
        if crypto_users.is_empty() || wrapped_volume_keys.is_empty() {
            return Err(Error::Malformed {
                what: "encryption context without usable key material",
            });
        }
        Ok(Self {
            family_identifier,
            crypto_users,
            wrapped_volume_keys,
        })
    }

    /// True when this keybag can serve the given volume family.
    ///
    /// A document without a family annotation serves any family.
    pub fn matches_family(&self, family_identifier: &[u8; 16]) -> bool {
        self.family_identifier
            .map(|identifier| identifier == *family_identifier)
            .unwrap_or(true)
    }

    /// Runs the unwrap chain for every crypto user with the given secret,
    /// yielding each candidate volume master key.
    ///
    /// Which candidate is correct is decided by the caller probing the
    /// volume; the wrap algorithm itself carries no integrity check here.
    pub fn candidate_master_keys(&self, secret: &[u8]) -> Result<Vec<Zeroizing<[u8; 16]>>> {
        let mut candidates = Vec::new();
        for user in &self.crypto_users {
            let mut kek = Zeroizing::new([0u8; 16]);
            pbkdf2_sha256(secret, &user.salt, user.number_of_iterations, &mut *kek)?;

            let unwrapped_kek = Zeroizing::new(aes_key_unwrap(&*kek, &user.wrapped_kek)?);
            for wrapped_key in &self.wrapped_volume_keys {
                let volume_master_key = Zeroizing::new(aes_key_unwrap(
                    &unwrapped_kek,
                    &wrapped_key.wrapped_volume_master_key,
                )?);
                let mut candidate = Zeroizing::new([0u8; 16]);
                candidate.copy_from_slice(&volume_master_key[..16]);
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }
}

fn read_crypto_user(user: &Value) -> Result<CryptoUser> {
    let blob = user
        .get("PassphraseWrappedKEKStruct")
        .and_then(Value::as_data)
        .ok_or(Error::Malformed {
            what: "crypto user without a passphrase-wrapped KEK",
        })?;
    if blob.len() != PASSPHRASE_WRAPPED_KEK_STRUCT_SIZE {
        return Err(Error::Malformed {
            what: "passphrase-wrapped KEK struct size",
        });
    }
    let number_of_iterations = u32::from_le_bytes(blob[4..8].try_into().expect("4 bytes"));
    if number_of_iterations == 0 {
        return Err(Error::Malformed {
            what: "zero PBKDF2 iteration count",
        });
    }
    Ok(CryptoUser {
        identifier: user.get("UserIdentifier").and_then(Value::as_uuid),
        user_type: user.get("UserType").and_then(Value::as_integer),
        salt: blob[8..24].try_into().expect("16 bytes"),
        number_of_iterations,
        wrapped_kek: blob[24..48].try_into().expect("24 bytes"),
    })
}

fn read_wrapped_volume_key(key: &Value) -> Result<WrappedVolumeKey> {
    let blob = key
        .get("KEKWrappedVolumeKeyStruct")
        .and_then(Value::as_data)
        .ok_or(Error::Malformed {
            what: "wrapped volume key entry without a KEK-wrapped struct",
        })?;
    if blob.len() != KEK_WRAPPED_VOLUME_KEY_STRUCT_SIZE {
        return Err(Error::Malformed {
            what: "KEK-wrapped volume key struct size",
        });
    }
    Ok(WrappedVolumeKey {
        wrapped_volume_master_key: blob[4..28].try_into().expect("24 bytes"),
    })
}

/// Serializes a passphrase-wrapped KEK struct, test and fixture support
#[doc(hidden)]
pub fn build_passphrase_wrapped_kek_struct(
    number_of_iterations: u32,
    salt: &[u8; 16],
    wrapped_kek: &[u8; 24],
) -> [u8; PASSPHRASE_WRAPPED_KEK_STRUCT_SIZE] {
    let mut blob = [0u8; PASSPHRASE_WRAPPED_KEK_STRUCT_SIZE];
    blob[0..4].copy_from_slice(&1u32.to_le_bytes());
    blob[4..8].copy_from_slice(&number_of_iterations.to_le_bytes());
    blob[8..24].copy_from_slice(salt);
    blob[24..48].copy_from_slice(wrapped_kek);
    blob
}

/// Serializes a KEK-wrapped volume key struct, test and fixture support
#[doc(hidden)]
pub fn build_kek_wrapped_volume_key_struct(
    wrapped_volume_master_key: &[u8; 24],
) -> [u8; KEK_WRAPPED_VOLUME_KEY_STRUCT_SIZE] {
    let mut blob = [0u8; KEK_WRAPPED_VOLUME_KEY_STRUCT_SIZE];
    blob[0..4].copy_from_slice(&1u32.to_le_bytes());
    blob[4..28].copy_from_slice(wrapped_volume_master_key);
    blob
}
