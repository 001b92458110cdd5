// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-sector decryption.
//!
//! A sector's XTS tweak is its logical sector index within the volume,
//! counted from offset 0; the physical location plays no part. Sparse
//! sectors never reach the codec, and a volume marked unencrypted passes
//! raw bytes through.

use crate::crypto::XtsContext;
use crate::error::Result;

/// Decrypts sectors of one logical volume
#[derive(Debug)]
pub struct SectorCodec {
    context: Option<XtsContext>,
    bytes_per_sector: usize,
}

impl SectorCodec {
    /// Codec for an encrypted volume
    pub fn new(context: XtsContext, bytes_per_sector: usize) -> Self {
        Self {
            context: Some(context),
            bytes_per_sector,
        }
    }

    /// Pass-through codec for an unencrypted volume
    pub fn new_unencrypted(bytes_per_sector: usize) -> Self {
        Self {
            context: None,
            bytes_per_sector,
        }
    }

    /// Sector size in bytes
    pub fn bytes_per_sector(&self) -> usize {
        self.bytes_per_sector
    }

    /// Decrypts one sector in place with its logical index as the tweak.
    ///
    /// For an unencrypted volume the data is returned untouched.
    pub fn decrypt_sector(&self, data: &mut [u8], sector_index: u64) -> Result<()> {
        debug_assert_eq!(data.len(), self.bytes_per_sector);
        match &self.context {
            Some(context) => context.decrypt(data, sector_index),
            None => Ok(()),
        }
    }

    /// An all-zero sector, the content of sparse regions
    pub fn zero_sector(&self) -> Vec<u8> {
        vec![0u8; self.bytes_per_sector]
    }
}
