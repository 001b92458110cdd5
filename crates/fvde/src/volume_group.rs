// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The volume group: the container's logical structure.
//!
//! A group is available once the encrypted metadata has been decrypted and
//! walked; it enumerates the member physical volumes and the logical
//! volumes they publish.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::io::BlockPool;
use crate::logical_volume::LogicalVolume;
use crate::physical_volume::PhysicalVolume;
use crate::volume::Volume;

/// View over the volume group of an opened container
#[derive(Debug)]
pub struct VolumeGroup<'a, P: BlockPool> {
    volume: &'a Volume<P>,
}

impl<'a, P: BlockPool> VolumeGroup<'a, P> {
    pub(crate) fn new(volume: &'a Volume<P>) -> Self {
        Self { volume }
    }

    /// Identifier of the volume group
    pub fn identifier(&self) -> Uuid {
        self.volume.metadata().volume_group_uuid()
    }

    /// Name of the volume group
    pub fn name(&self) -> &str {
        &self.volume.metadata().volume_group_name
    }

    /// Name of the volume group as UTF-16 code units
    pub fn name_utf16(&self) -> Vec<u16> {
        self.name().encode_utf16().collect()
    }

    /// Number of member physical volumes
    pub fn number_of_physical_volumes(&self) -> usize {
        self.volume.metadata().physical_volume_descriptors.len()
    }

    /// The physical volume at `index`, in volume group order
    pub fn physical_volume(&self, index: usize) -> Result<PhysicalVolume<'a>> {
        let pool_entry = *self
            .volume
            .pool_entry_by_pv_index()
            .get(index)
            .ok_or(Error::OutOfBounds {
                what: "physical volume index",
            })?;
        Ok(PhysicalVolume::new(self.volume.header(pool_entry)))
    }

    /// Number of logical volumes the group publishes
    pub fn number_of_logical_volumes(&self) -> usize {
        self.volume
            .encrypted_metadata()
            .logical_volume_descriptors
            .len()
    }

    /// Constructs the reader for the logical volume at `index`.
    ///
    /// The volume starts locked unless its content is stored in plaintext.
    pub fn logical_volume(&self, index: usize) -> Result<LogicalVolume<'a, P>> {
        let descriptor = self
            .volume
            .encrypted_metadata()
            .logical_volume_descriptors
            .get(index)
            .ok_or(Error::OutOfBounds {
                what: "logical volume index",
            })?;
        self.volume.build_logical_volume(descriptor)
    }
}
