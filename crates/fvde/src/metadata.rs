// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Plaintext metadata: the type 0x0011 block.
//!
//! The block announces where the encrypted metadata lives (two redundant
//! copies, each a packed physical-volume index plus block number) and embeds
//! the volume group XML plist naming the group and its member physical
//! volumes.

use log;
use uuid::Uuid;

use crate::bytestream::{read_u16_le, read_u32_le, read_u64_le};
use crate::descriptors::PhysicalVolumeDescriptor;
use crate::error::{Error, Result};
use crate::metadata_block::MetadataBlock;
use crate::plist::{self, Value};
use crate::volume_header::VolumeHeader;

/// Location of one encrypted-metadata copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedMetadataLocation {
    /// Physical volume holding the copy
    pub physical_volume_index: u16,
    /// Absolute byte offset of the copy within that volume
    pub byte_offset: u64,
}

/// One entry of the metadata block-number table
#[derive(Debug, Clone, Copy)]
pub struct MetadataEntry {
    /// Transaction the referenced block belongs to
    pub transaction_identifier: u64,
    /// Metadata block number
    pub metadata_block_number: u64,
}

/// Parsed plaintext metadata
#[derive(Debug)]
pub struct Metadata {
    /// Transaction of the 0x0011 block itself
    pub transaction_identifier: u64,
    /// Index of the physical volume the block was read from
    pub physical_volume_index: u16,
    /// Size of the encrypted metadata region in bytes
    pub encrypted_metadata_size: u64,
    /// Primary encrypted-metadata copy
    pub encrypted_metadata1: EncryptedMetadataLocation,
    /// Secondary encrypted-metadata copy
    pub encrypted_metadata2: EncryptedMetadataLocation,
    /// Volume group identifier from the embedded plist
    pub volume_group_identifier: [u8; 16],
    /// Volume group name from the embedded plist
    pub volume_group_name: String,
    /// Member physical volumes in plist order
    pub physical_volume_descriptors: Vec<PhysicalVolumeDescriptor>,
    /// Metadata block-number table entries
    pub entries: Vec<MetadataEntry>,
}

const PACKED_BLOCK_NUMBER_MASK: u64 = 0x0000ffffffffffff;

/// Smallest offset a descriptor or plist pointer may carry; everything
/// below is still inside the fixed part of the block
const MINIMUM_PAYLOAD_OFFSET: u32 = 248;

impl Metadata {
    /// Parses a framed type-0x0011 metadata block
    pub fn read(block: &MetadataBlock<'_>, volume_header: &VolumeHeader) -> Result<Self> {
        if block.block_type != 0x0011 {
            return Err(Error::Unsupported {
                what: "metadata block type, expected 0x0011",
            });
        }
        if block.serial_number != volume_header.serial_number {
            log::debug!(
                "metadata serial number 0x{:08x} differs from header serial 0x{:08x}",
                block.serial_number,
                volume_header.serial_number
            );
        }
        let data = block.data;

        let metadata_size = read_u32_le(data, 0)?;
        if metadata_size != volume_header.metadata_size {
            return Err(Error::Malformed {
                what: "metadata size mismatch with volume header",
            });
        }
        let volume_groups_descriptor_offset = read_u32_le(data, 156)?;
        let xml_offset = read_u32_le(data, 160)?;
        let physical_volume_index = read_u16_le(data, 174)?;
        let number_of_entries = read_u32_le(data, 184)?;

        let entry_area = data.len().saturating_sub(192);
        if number_of_entries as usize > entry_area / 24 {
            return Err(Error::OutOfBounds {
                what: "metadata entry count",
            });
        }
        let mut entries = Vec::with_capacity(number_of_entries as usize);
        for entry_index in 0..number_of_entries as usize {
            let entry_offset = 192 + entry_index * 24;
            entries.push(MetadataEntry {
                transaction_identifier: read_u64_le(data, entry_offset)?,
                metadata_block_number: read_u64_le(data, entry_offset + 16)?,
            });
        }
        if volume_groups_descriptor_offset < MINIMUM_PAYLOAD_OFFSET
            || volume_groups_descriptor_offset > metadata_size
        {
            return Err(Error::OutOfBounds {
                what: "volume groups descriptor offset",
            });
        }
        // Offsets in the block are relative to its start; the payload
        // begins after the 64-byte frame header.
        let descriptor_offset = volume_groups_descriptor_offset as usize - 64;

        let encrypted_metadata_block_count = read_u64_le(data, descriptor_offset + 8)?;
        let packed1 = read_u64_le(data, descriptor_offset + 32)?;
        let packed2 = read_u64_le(data, descriptor_offset + 40)?;

        let block_size = volume_header.block_size as u64;
        let encrypted_metadata_size = encrypted_metadata_block_count
            .checked_mul(block_size)
            .ok_or(Error::OutOfBounds {
                what: "encrypted metadata size",
            })?;

        if xml_offset < MINIMUM_PAYLOAD_OFFSET || xml_offset > metadata_size {
            return Err(Error::OutOfBounds {
                what: "volume group XML offset",
            });
        }
        let (volume_group_identifier, volume_group_name, physical_volume_descriptors) =
            read_volume_group_plist(&data[xml_offset as usize - 64..])?;

        let metadata = Self {
            transaction_identifier: block.transaction_identifier,
            physical_volume_index,
            encrypted_metadata_size,
            encrypted_metadata1: unpack_location(packed1, block_size)?,
            encrypted_metadata2: unpack_location(packed2, block_size)?,
            volume_group_identifier,
            volume_group_name,
            physical_volume_descriptors,
            entries,
        };
        log::trace!(
            "plaintext metadata: group \"{}\" ({}), encrypted metadata {} bytes at {:?} / {:?}",
            metadata.volume_group_name,
            Uuid::from_bytes(metadata.volume_group_identifier),
            metadata.encrypted_metadata_size,
            metadata.encrypted_metadata1,
            metadata.encrypted_metadata2,
        );
        Ok(metadata)
    }

    /// The volume group identifier as a UUID
    pub fn volume_group_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.volume_group_identifier)
    }
}

fn unpack_location(packed: u64, block_size: u64) -> Result<EncryptedMetadataLocation> {
    let physical_volume_index = (packed >> 48) as u16;
    let block_number = packed & PACKED_BLOCK_NUMBER_MASK;
    let byte_offset = block_number
        .checked_mul(block_size)
        .ok_or(Error::OutOfBounds {
            what: "encrypted metadata block number",
        })?;
    Ok(EncryptedMetadataLocation {
        physical_volume_index,
        byte_offset,
    })
}

fn read_volume_group_plist(
    plist_data: &[u8],
) -> Result<([u8; 16], String, Vec<PhysicalVolumeDescriptor>)> {
    let root = plist::parse(plist_data)?;

    let volume_group_identifier = root
        .get("com.apple.corestorage.lvg.uuid")
        .and_then(Value::as_uuid)
        .ok_or(Error::Malformed {
            what: "volume group plist without a group UUID",
        })?;
    let volume_group_name = root
        .get("com.apple.corestorage.lvg.name")
        .and_then(Value::as_string)
        .ok_or(Error::Malformed {
            what: "volume group plist without a group name",
        })?
        .to_owned();

    let members = root
        .get("com.apple.corestorage.lvg.physicalVolumes")
        .and_then(Value::as_array)
        .ok_or(Error::Malformed {
            what: "volume group plist without a physical volume list",
        })?;
    let mut physical_volume_descriptors = Vec::with_capacity(members.len());
    for member in members {
        let identifier = member.as_uuid().ok_or(Error::Malformed {
            what: "physical volume entry is not a UUID string",
        })?;
        physical_volume_descriptors.push(PhysicalVolumeDescriptor { identifier });
    }
    Ok((
        volume_group_identifier,
        volume_group_name,
        physical_volume_descriptors,
    ))
}

/// Serializes a type-0x0011 payload, test and fixture support
#[doc(hidden)]
pub fn build_type_0x0011_payload(
    metadata_size: u32,
    physical_volume_index: u16,
    encrypted_metadata_block_count: u64,
    encrypted_metadata1_packed: u64,
    encrypted_metadata2_packed: u64,
    volume_group_plist: &[u8],
) -> Vec<u8> {
    let descriptor_offset = 256u32;
    let xml_offset = descriptor_offset + 48;

    let mut payload = vec![0u8; (xml_offset as usize - 64) + volume_group_plist.len() + 1];
    payload[0..4].copy_from_slice(&metadata_size.to_le_bytes());
    payload[156..160].copy_from_slice(&descriptor_offset.to_le_bytes());
    payload[160..164].copy_from_slice(&xml_offset.to_le_bytes());
    payload[164..168].copy_from_slice(&(volume_group_plist.len() as u32 + 1).to_le_bytes());
    payload[174..176].copy_from_slice(&physical_volume_index.to_le_bytes());
    payload[184..188].copy_from_slice(&0u32.to_le_bytes());

    let base = descriptor_offset as usize - 64;
    payload[base + 8..base + 16].copy_from_slice(&encrypted_metadata_block_count.to_le_bytes());
    payload[base + 32..base + 40].copy_from_slice(&encrypted_metadata1_packed.to_le_bytes());
    payload[base + 40..base + 48].copy_from_slice(&encrypted_metadata2_packed.to_le_bytes());

    let xml_base = xml_offset as usize - 64;
    payload[xml_base..xml_base + volume_group_plist.len()].copy_from_slice(volume_group_plist);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_block::frame_block;

    fn test_header(block_size: u32, metadata_size: u32) -> VolumeHeader {
        VolumeHeader {
            serial_number: 0x1234,
            bytes_per_sector: 512,
            physical_volume_size: 1 << 26,
            block_size,
            metadata_size,
            metadata_offsets: [0; 4],
            key_data: [0; 16],
            physical_volume_identifier: [0; 16],
            volume_group_identifier: [0; 16],
        }
    }

    fn group_plist() -> Vec<u8> {
        br#"<dict>
            <key>com.apple.corestorage.lvg.uuid</key>
            <string>11111111-2222-3333-4444-555555555555</string>
            <key>com.apple.corestorage.lvg.name</key>
            <string>TestGroup</string>
            <key>com.apple.corestorage.lvg.physicalVolumes</key>
            <array><string>aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee</string></array>
        </dict>"#
            .to_vec()
    }

    #[test_log::test]
    fn parses_locations_and_group_plist() {
        let header = test_header(4096, 0x4000);
        // Secondary copy on PV 1, block 99.
        let packed2 = (1u64 << 48) | 99;
        let payload =
            build_type_0x0011_payload(0x4000, 0, 16, 50, packed2, &group_plist());
        let block_data = frame_block(0x0011, 0x1234, 8, 0, 0, &payload);
        let block = MetadataBlock::read(&block_data).unwrap();
        let metadata = Metadata::read(&block, &header).unwrap();

        assert_eq!(metadata.transaction_identifier, 8);
        assert_eq!(metadata.encrypted_metadata_size, 16 * 4096);
        assert_eq!(
            metadata.encrypted_metadata1,
            EncryptedMetadataLocation {
                physical_volume_index: 0,
                byte_offset: 50 * 4096,
            }
        );
        assert_eq!(
            metadata.encrypted_metadata2,
            EncryptedMetadataLocation {
                physical_volume_index: 1,
                byte_offset: 99 * 4096,
            }
        );
        assert_eq!(metadata.volume_group_name, "TestGroup");
        assert_eq!(
            metadata.volume_group_uuid().to_string(),
            "11111111-2222-3333-4444-555555555555"
        );
        assert_eq!(metadata.physical_volume_descriptors.len(), 1);
    }

    #[test_log::test]
    fn wrong_block_type_is_unsupported() {
        let header = test_header(4096, 0x4000);
        let payload = build_type_0x0011_payload(0x4000, 0, 1, 1, 1, &group_plist());
        let block_data = frame_block(0x0019, 0x1234, 0, 0, 0, &payload);
        let block = MetadataBlock::read(&block_data).unwrap();
        assert!(matches!(
            Metadata::read(&block, &header),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test_log::test]
    fn metadata_size_mismatch_is_malformed() {
        let header = test_header(4096, 0x8000);
        let payload = build_type_0x0011_payload(0x4000, 0, 1, 1, 1, &group_plist());
        let block_data = frame_block(0x0011, 0x1234, 0, 0, 0, &payload);
        let block = MetadataBlock::read(&block_data).unwrap();
        assert!(matches!(
            Metadata::read(&block, &header),
            Err(Error::Malformed { .. })
        ));
    }

    #[test_log::test]
    fn descriptor_offset_below_minimum_is_rejected() {
        let header = test_header(4096, 0x4000);
        let mut payload = build_type_0x0011_payload(0x4000, 0, 1, 1, 1, &group_plist());
        payload[156..160].copy_from_slice(&100u32.to_le_bytes());
        let block_data = frame_block(0x0011, 0x1234, 0, 0, 0, &payload);
        let block = MetadataBlock::read(&block_data).unwrap();
        assert!(matches!(
            Metadata::read(&block, &header),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test_log::test]
    fn oversized_entry_count_is_rejected() {
        let header = test_header(4096, 0x4000);
        let mut payload = build_type_0x0011_payload(0x4000, 0, 1, 1, 1, &group_plist());
        payload[184..188].copy_from_slice(&u32::MAX.to_le_bytes());
        let block_data = frame_block(0x0011, 0x1234, 0, 0, 0, &payload);
        let block = MetadataBlock::read(&block_data).unwrap();
        assert!(matches!(
            Metadata::read(&block, &header),
            Err(Error::OutOfBounds { .. })
        ));
    }
}
