// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The encrypted metadata region and its record walker.
//!
//! The region is a run of 8192-byte blocks, AES-XTS encrypted under the
//! volume header's key data with the physical volume identifier as the
//! tweak key; each block's tweak value is its zero-based index within the
//! region. Decrypted blocks are framed like plaintext metadata. The records
//! walked here describe the logical volumes:
//!
//! * `0x001A`: logical volume identifiers, size and name
//! * `0x0019`: volume family record, may embed the (optionally
//!   zlib-compressed) encryption-context plist
//! * `0x0305`: segment table header joining a logical volume to its map
//! * `0x0505`: segment map entries
//!
//! The container keeps two redundant copies; the caller retries the
//! secondary copy when this walker rejects the primary.

use std::collections::HashMap;

use log;
use uuid::Uuid;

use crate::MEMORY_MAXIMUM_ALLOCATION_SIZE;
use crate::bytestream::{is_uniform_block, read_u32_le, read_u64_le, read_bytes};
use crate::crypto::XtsContext;
use crate::deflate::decompress_zlib;
use crate::descriptors::{LogicalVolumeDescriptor, SegmentDescriptor};
use crate::error::{Error, Result};
use crate::io::BlockPool;
use crate::keybag::EncryptionContextPlist;
use crate::metadata_block::{METADATA_BLOCK_SIZE, MetadataBlock};
use crate::volume_header::VolumeHeader;

/// Compression method tag for an uncompressed embedded plist
pub const COMPRESSION_METHOD_NONE: u32 = 0;
/// Compression method tag for a zlib-compressed embedded plist
pub const COMPRESSION_METHOD_DEFLATE: u32 = 1;

const PACKED_BLOCK_NUMBER_MASK: u64 = 0x0000ffffffffffff;

/// Logical volumes and key material recovered from one metadata copy
#[derive(Debug, Default)]
pub struct EncryptedMetadata {
    /// Reconstructed logical volume descriptors
    pub logical_volume_descriptors: Vec<LogicalVolumeDescriptor>,
    /// Embedded keybags by family identifier
    pub encryption_contexts: Vec<([u8; 16], EncryptionContextPlist)>,
}

struct SegmentTableHeader {
    logical_volume_object_identifier: u64,
    base_physical_block_number: u64,
    content_object_identifier: u64,
}

struct SegmentTableEntries {
    table_object_identifier: u64,
    segments: Vec<SegmentDescriptor>,
}

impl EncryptedMetadata {
    /// Reads and decrypts one metadata copy from the pool, then walks its
    /// records into logical volume descriptors
    pub fn read<P: BlockPool>(
        pool: &P,
        physical_volume_index: u16,
        byte_offset: u64,
        size: u64,
        volume_header: &VolumeHeader,
    ) -> Result<Self> {
        if size == 0 || size % METADATA_BLOCK_SIZE as u64 != 0 {
            return Err(Error::Malformed {
                what: "encrypted metadata size is not a multiple of the block size",
            });
        }
        if size > MEMORY_MAXIMUM_ALLOCATION_SIZE as u64 {
            return Err(Error::Memory { requested: size });
        }
        let mut region = vec![0u8; size as usize];
        pool.read_exact_at(physical_volume_index, byte_offset, &mut region)
            .map_err(|source| Error::Io { source })?;

        let context = XtsContext::new(
            &volume_header.key_data,
            &volume_header.physical_volume_identifier,
        );
        for (block_index, block) in region.chunks_exact_mut(METADATA_BLOCK_SIZE).enumerate() {
            context.decrypt(block, block_index as u64)?;
        }
        Self::from_decrypted_region(&region)
    }

    /// Walks an already decrypted region
    pub fn from_decrypted_region(region: &[u8]) -> Result<Self> {
        let mut descriptors_by_object: Vec<LogicalVolumeDescriptor> = Vec::new();
        let mut table_headers: Vec<SegmentTableHeader> = Vec::new();
        let mut table_entries: Vec<SegmentTableEntries> = Vec::new();
        let mut encryption_contexts = Vec::new();

        for (block_index, block_data) in region.chunks_exact(METADATA_BLOCK_SIZE).enumerate() {
            if is_uniform_block(block_data) {
                continue;
            }
            let block = MetadataBlock::read(block_data)?;
            if block.is_lvf_wiped {
                continue;
            }
            match block.block_type {
                0x001a => {
                    descriptors_by_object.push(read_type_0x001a(&block)?);
                }
                0x0019 => {
                    if let Some((family_identifier, keybag)) = read_type_0x0019(&block)? {
                        encryption_contexts.push((family_identifier, keybag));
                    }
                }
                0x0305 => {
                    table_headers.push(read_type_0x0305(&block)?);
                }
                0x0505 => {
                    table_entries.push(read_type_0x0505(&block)?);
                }
                other => {
                    log::trace!(
                        "skipping encrypted metadata block {block_index} of type 0x{other:04x}"
                    );
                }
            }
        }
        let mut entries_by_table: HashMap<u64, Vec<SegmentDescriptor>> = HashMap::new();
        for entries in table_entries {
            entries_by_table
                .entry(entries.table_object_identifier)
                .or_default()
                .extend(entries.segments);
        }
        for descriptor in &mut descriptors_by_object {
            let object_identifier = descriptor.object_identifier;
            for header in table_headers
                .iter()
                .filter(|header| header.logical_volume_object_identifier == object_identifier)
            {
                descriptor.base_physical_block_number = header.base_physical_block_number;
                if let Some(segments) =
                    entries_by_table.remove(&header.content_object_identifier)
                {
                    descriptor.segment_descriptors.extend(segments);
                }
            }
            descriptor.finalize_segments()?;
            if descriptor.segment_descriptors.is_empty() {
                return Err(Error::Malformed {
                    what: "logical volume without a segment map",
                });
            }
            log::trace!(
                "logical volume \"{}\" ({}): {} bytes in {} segments",
                descriptor.name,
                Uuid::from_bytes(descriptor.identifier),
                descriptor.size,
                descriptor.segment_descriptors.len()
            );
        }
        Ok(Self {
            logical_volume_descriptors: descriptors_by_object,
            encryption_contexts,
        })
    }

    /// The keybag serving a family, preferring an exact match
    pub fn encryption_context_for_family(
        &self,
        family_identifier: &[u8; 16],
    ) -> Option<&EncryptionContextPlist> {
        self.encryption_contexts
            .iter()
            .find(|(family, _)| family == family_identifier)
            .map(|(_, keybag)| keybag)
            .or_else(|| {
                self.encryption_contexts
                    .iter()
                    .find(|(_, keybag)| keybag.matches_family(family_identifier))
                    .map(|(_, keybag)| keybag)
            })
    }
}

fn read_type_0x001a(block: &MetadataBlock<'_>) -> Result<LogicalVolumeDescriptor> {
    let data = block.data;
    let identifier: [u8; 16] = read_bytes(data, 0)?;
    let family_identifier: [u8; 16] = read_bytes(data, 16)?;
    let size = read_u64_le(data, 32)?;
    let name_size = read_u32_le(data, 40)? as usize;

    let name_bytes = data
        .get(44..44 + name_size)
        .ok_or(Error::OutOfBounds {
            what: "logical volume name length",
        })?;
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| Error::Malformed {
            what: "logical volume name is not UTF-8",
        })?
        .to_owned();

    Ok(LogicalVolumeDescriptor {
        object_identifier: block.object_identifier,
        identifier,
        family_identifier,
        name,
        size,
        base_physical_block_number: 0,
        segment_descriptors: Vec::new(),
    })
}

fn read_type_0x0019(
    block: &MetadataBlock<'_>,
) -> Result<Option<([u8; 16], EncryptionContextPlist)>> {
    let data = block.data;
    let family_identifier: [u8; 16] = read_bytes(data, 8)?;
    let compression_method = read_u32_le(data, 24)?;
    let uncompressed_size = read_u32_le(data, 28)? as usize;
    let stored_size = read_u32_le(data, 32)? as usize;

    if stored_size == 0 {
        // A family record without an embedded keybag.
        return Ok(None);
    }
    let stored = data.get(40..40 + stored_size).ok_or(Error::OutOfBounds {
        what: "embedded encryption context size",
    })?;
    if uncompressed_size > MEMORY_MAXIMUM_ALLOCATION_SIZE {
        return Err(Error::Memory {
            requested: uncompressed_size as u64,
        });
    }
    let keybag = match compression_method {
        COMPRESSION_METHOD_NONE => EncryptionContextPlist::read(stored)?,
        COMPRESSION_METHOD_DEFLATE => {
            let decompressed = decompress_zlib(stored, uncompressed_size)?;
            EncryptionContextPlist::read(&decompressed)?
        }
        _ => {
            return Err(Error::Unsupported {
                what: "encryption context compression method",
            });
        }
    };
    Ok(Some((family_identifier, keybag)))
}

fn read_type_0x0305(block: &MetadataBlock<'_>) -> Result<SegmentTableHeader> {
    let data = block.data;
    Ok(SegmentTableHeader {
        logical_volume_object_identifier: read_u64_le(data, 0)?,
        base_physical_block_number: read_u64_le(data, 8)?,
        content_object_identifier: read_u64_le(data, 16)?,
    })
}

fn read_type_0x0505(block: &MetadataBlock<'_>) -> Result<SegmentTableEntries> {
    let data = block.data;
    let table_object_identifier = read_u64_le(data, 0)?;
    let number_of_entries = read_u32_le(data, 8)? as usize;

    let entry_area = data.len().saturating_sub(16);
    if number_of_entries > entry_area / 24 {
        return Err(Error::OutOfBounds {
            what: "segment map entry count",
        });
    }
    let mut segments = Vec::with_capacity(number_of_entries);
    for entry_index in 0..number_of_entries {
        let entry_offset = 16 + entry_index * 24;
        let logical_block_number = read_u64_le(data, entry_offset)?;
        let packed_physical = read_u64_le(data, entry_offset + 8)?;
        let number_of_blocks = read_u64_le(data, entry_offset + 16)?;

        segments.push(SegmentDescriptor {
            logical_block_number,
            physical_volume_index: (packed_physical >> 48) as u16,
            physical_block_number: packed_physical & PACKED_BLOCK_NUMBER_MASK,
            number_of_blocks,
        });
    }
    Ok(SegmentTableEntries {
        table_object_identifier,
        segments,
    })
}

/// Serializers for the record payloads, test and fixture support
#[doc(hidden)]
pub mod build {
    use super::*;

    pub fn type_0x001a_payload(
        identifier: &[u8; 16],
        family_identifier: &[u8; 16],
        size: u64,
        name: &str,
    ) -> Vec<u8> {
        let mut payload = vec![0u8; 44 + name.len()];
        payload[0..16].copy_from_slice(identifier);
        payload[16..32].copy_from_slice(family_identifier);
        payload[32..40].copy_from_slice(&size.to_le_bytes());
        payload[40..44].copy_from_slice(&(name.len() as u32).to_le_bytes());
        payload[44..].copy_from_slice(name.as_bytes());
        payload
    }

    pub fn type_0x0019_payload(
        family_object_identifier: u64,
        family_identifier: &[u8; 16],
        compression_method: u32,
        uncompressed_size: u32,
        stored: &[u8],
    ) -> Vec<u8> {
        let mut payload = vec![0u8; 40 + stored.len()];
        payload[0..8].copy_from_slice(&family_object_identifier.to_le_bytes());
        payload[8..24].copy_from_slice(family_identifier);
        payload[24..28].copy_from_slice(&compression_method.to_le_bytes());
        payload[28..32].copy_from_slice(&uncompressed_size.to_le_bytes());
        payload[32..36].copy_from_slice(&(stored.len() as u32).to_le_bytes());
        payload[40..].copy_from_slice(stored);
        payload
    }

    pub fn type_0x0305_payload(
        logical_volume_object_identifier: u64,
        base_physical_block_number: u64,
        content_object_identifier: u64,
    ) -> Vec<u8> {
        let mut payload = vec![0u8; 24];
        payload[0..8].copy_from_slice(&logical_volume_object_identifier.to_le_bytes());
        payload[8..16].copy_from_slice(&base_physical_block_number.to_le_bytes());
        payload[16..24].copy_from_slice(&content_object_identifier.to_le_bytes());
        payload
    }

    pub fn type_0x0505_payload(
        table_object_identifier: u64,
        segments: &[SegmentDescriptor],
    ) -> Vec<u8> {
        let mut payload = vec![0u8; 16 + segments.len() * 24];
        payload[0..8].copy_from_slice(&table_object_identifier.to_le_bytes());
        payload[8..12].copy_from_slice(&(segments.len() as u32).to_le_bytes());
        for (index, segment) in segments.iter().enumerate() {
            let offset = 16 + index * 24;
            let packed = ((segment.physical_volume_index as u64) << 48)
                | (segment.physical_block_number & PACKED_BLOCK_NUMBER_MASK);
            payload[offset..offset + 8].copy_from_slice(&segment.logical_block_number.to_le_bytes());
            payload[offset + 8..offset + 16].copy_from_slice(&packed.to_le_bytes());
            payload[offset + 16..offset + 24]
                .copy_from_slice(&segment.number_of_blocks.to_le_bytes());
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_block::frame_block;

    fn region_with_volume(segments: Vec<SegmentDescriptor>) -> Vec<u8> {
        let lv_payload =
            build::type_0x001a_payload(&[0xaa; 16], &[0xbb; 16], 1 << 20, "Macintosh HD");
        let table_payload = build::type_0x0305_payload(100, 2048, 200);
        let entries_payload = build::type_0x0505_payload(200, &segments);

        let mut region = Vec::new();
        region.extend_from_slice(&frame_block(0x001a, 1, 1, 100, 0, &lv_payload));
        region.extend_from_slice(&frame_block(0x0305, 1, 1, 0, 1, &table_payload));
        region.extend_from_slice(&frame_block(0x0505, 1, 1, 0, 2, &entries_payload));
        // One empty block, skipped by the walker.
        region.extend_from_slice(&[0u8; METADATA_BLOCK_SIZE]);
        region
    }

    fn sample_segments() -> Vec<SegmentDescriptor> {
        vec![
            SegmentDescriptor {
                logical_block_number: 16,
                physical_volume_index: 0,
                physical_block_number: 500,
                number_of_blocks: 16,
            },
            SegmentDescriptor {
                logical_block_number: 0,
                physical_volume_index: 0,
                physical_block_number: 400,
                number_of_blocks: 16,
            },
        ]
    }

    #[test_log::test]
    fn reconstructs_a_logical_volume() {
        let region = region_with_volume(sample_segments());
        let metadata = EncryptedMetadata::from_decrypted_region(&region).unwrap();

        assert_eq!(metadata.logical_volume_descriptors.len(), 1);
        let descriptor = &metadata.logical_volume_descriptors[0];
        assert_eq!(descriptor.name, "Macintosh HD");
        assert_eq!(descriptor.size, 1 << 20);
        assert_eq!(descriptor.base_physical_block_number, 2048);
        assert_eq!(descriptor.segment_descriptors.len(), 2);
        // Sorted by logical block number after the walk.
        assert_eq!(descriptor.segment_descriptors[0].logical_block_number, 0);
        assert_eq!(descriptor.segment_descriptors[1].logical_block_number, 16);
        assert_eq!(descriptor.first_block_number().unwrap(), (0, 2048 + 400));
    }

    #[test_log::test]
    fn corrupt_block_is_rejected() {
        let mut region = region_with_volume(sample_segments());
        region[100] ^= 0x01;
        assert!(EncryptedMetadata::from_decrypted_region(&region).is_err());
    }

    #[test_log::test]
    fn volume_without_segments_is_malformed() {
        let lv_payload = build::type_0x001a_payload(&[0xaa; 16], &[0xbb; 16], 1 << 20, "LV");
        let region = frame_block(0x001a, 1, 1, 100, 0, &lv_payload);
        assert!(matches!(
            EncryptedMetadata::from_decrypted_region(&region),
            Err(Error::Malformed { .. })
        ));
    }

    #[test_log::test]
    fn embedded_keybag_is_decompressed() {
        use flate2::Compression;
        use flate2::write::ZlibEncoder;
        use std::io::Write;

        let document = crate::keybag::tests::keybag_plist(
            "bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbbbb",
            7,
            &[1; 16],
            &[2; 24],
            &[3; 24],
        );
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&document).unwrap();
        let compressed = encoder.finish().unwrap();

        let family = [0xbb; 16];
        let payload = build::type_0x0019_payload(
            300,
            &family,
            COMPRESSION_METHOD_DEFLATE,
            document.len() as u32,
            &compressed,
        );
        let mut region = region_with_volume(sample_segments());
        region.extend_from_slice(&frame_block(0x0019, 1, 1, 300, 3, &payload));

        let metadata = EncryptedMetadata::from_decrypted_region(&region).unwrap();
        assert_eq!(metadata.encryption_contexts.len(), 1);
        assert!(metadata.encryption_context_for_family(&family).is_some());
        // The keybag also answers for unknown families only when it does
        // not pin one; this one pins 0xbb.
        assert!(metadata.encryption_context_for_family(&[0x01; 16]).is_none());
    }
}
