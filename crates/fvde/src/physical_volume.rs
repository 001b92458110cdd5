// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Read-only view of one physical volume in a group.

use uuid::Uuid;

use crate::volume_header::VolumeHeader;

/// Physical-volume encryption methods the format defines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    /// AES-XTS with a 128-bit key, the only method this crate supports
    Aes128Xts,
}

/// A member physical volume of a volume group
#[derive(Debug, Clone, Copy)]
pub struct PhysicalVolume<'a> {
    header: &'a VolumeHeader,
}

impl<'a> PhysicalVolume<'a> {
    pub(crate) fn new(header: &'a VolumeHeader) -> Self {
        Self { header }
    }

    /// Identifier of this physical volume
    pub fn identifier(&self) -> Uuid {
        self.header.physical_volume_uuid()
    }

    /// Size of the physical volume in bytes
    pub fn size(&self) -> u64 {
        self.header.physical_volume_size
    }

    /// Sector size in bytes
    pub fn bytes_per_sector(&self) -> u32 {
        self.header.bytes_per_sector
    }

    /// Encryption method protecting the volume
    pub fn encryption_method(&self) -> EncryptionMethod {
        // The header parser rejects everything but method 2.
        EncryptionMethod::Aes128Xts
    }
}
