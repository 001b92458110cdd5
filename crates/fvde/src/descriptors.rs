// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Descriptors reconstructed from metadata: physical volume membership,
//! logical volumes and their segment maps.

use uuid::Uuid;

use crate::error::{Error, Result};

/// A physical volume as listed in the volume group plist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalVolumeDescriptor {
    /// Identifier of the physical volume, big-endian UUID bytes
    pub identifier: [u8; 16],
}

impl PhysicalVolumeDescriptor {
    /// The identifier as a UUID
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.identifier)
    }
}

/// One contiguous extent mapping logical blocks to a physical volume range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// First logical block this extent covers
    pub logical_block_number: u64,
    /// Physical volume holding the extent
    pub physical_volume_index: u16,
    /// First physical block, relative to the descriptor base
    pub physical_block_number: u64,
    /// Extent length in blocks, never zero
    pub number_of_blocks: u64,
}

/// A logical volume described by the encrypted metadata
#[derive(Debug, Clone)]
pub struct LogicalVolumeDescriptor {
    /// Object identifier linking the metadata records together
    pub object_identifier: u64,
    /// Stable identity exposed to callers
    pub identifier: [u8; 16],
    /// Volume family, mixed into the tweak-key derivation
    pub family_identifier: [u8; 16],
    /// Volume name, UTF-8
    pub name: String,
    /// Declared logical size in bytes
    pub size: u64,
    /// Physical block offset segment extents are measured from
    pub base_physical_block_number: u64,
    /// Extents ordered by logical block number
    pub segment_descriptors: Vec<SegmentDescriptor>,
}

impl LogicalVolumeDescriptor {
    /// The volume identifier as a UUID
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.identifier)
    }

    /// The family identifier as a UUID
    pub fn family_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.family_identifier)
    }

    /// Physical volume index and absolute physical block of the first extent
    pub fn first_block_number(&self) -> Result<(u16, u64)> {
        let segment = self.segment_descriptors.first().ok_or(Error::Malformed {
            what: "logical volume without segment descriptors",
        })?;
        Ok((
            segment.physical_volume_index,
            self.base_physical_block_number + segment.physical_block_number,
        ))
    }

    /// Sorts the extents and checks the map invariants: strictly
    /// non-decreasing logical block numbers, no zero-length extents, no
    /// overlap between consecutive extents
    pub fn finalize_segments(&mut self) -> Result<()> {
        self.segment_descriptors
            .sort_by_key(|segment| segment.logical_block_number);

        let mut expected_logical_block = 0u64;
        for segment in &self.segment_descriptors {
            if segment.number_of_blocks == 0 {
                return Err(Error::Malformed {
                    what: "zero-length segment descriptor",
                });
            }
            if segment.logical_block_number < expected_logical_block {
                return Err(Error::Malformed {
                    what: "overlapping segment descriptors",
                });
            }
            expected_logical_block = segment
                .logical_block_number
                .checked_add(segment.number_of_blocks)
                .ok_or(Error::Malformed {
                    what: "segment descriptor extent overflow",
                })?;
        }
        Ok(())
    }
}
