// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! In-memory key material for an unlocked logical volume.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// The derived AES-XTS keys of a logical volume.
///
/// Never persisted; the buffers are scrubbed when the keyring is dropped,
/// including on error paths that abandon a partially derived set.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keyring {
    /// The 128-bit volume master key (the XTS data key)
    pub volume_master_key: [u8; 16],
    /// The 128-bit XTS tweak key
    pub volume_tweak_key: [u8; 16],
}

impl Keyring {
    /// Assembles a keyring from the master key and its derived tweak key
    pub fn new(volume_master_key: [u8; 16], volume_tweak_key: [u8; 16]) -> Self {
        Self {
            volume_master_key,
            volume_tweak_key,
        }
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        formatter.debug_struct("Keyring").finish_non_exhaustive()
    }
}
