// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Framing shared by every 8192-byte metadata block.
//!
//! A block carries a 64-byte header (checksum, version, type, serial,
//! transaction/object identifiers, size) followed by 8128 payload bytes.
//! Blocks whose first 8 bytes read `LVFwiped` were invalidated on purpose;
//! they skip checksum validation.

use zerocopy::*;

use crate::checksum::weak_crc32;
use crate::error::{Error, Result};

/// Size in bytes of a framed metadata block
pub const METADATA_BLOCK_SIZE: usize = 8192;

/// Size in bytes of the frame header
pub const METADATA_BLOCK_HEADER_SIZE: usize = 64;

/// Marker replacing the checksum fields of a wiped block
pub const LVF_WIPED_SIGNATURE: [u8; 8] = *b"LVFwiped";

/// On-disk layout of the metadata block header
#[derive(FromBytes, Unaligned)]
#[repr(C, packed)]
struct RawMetadataBlockHeader {
    /// Weak CRC-32 over bytes 8..8192
    checksum: U32<LittleEndian>,
    /// Initial checksum value, always 0xffffffff
    initial_value: U32<LittleEndian>,
    /// Format version, always 1
    version: U16<LittleEndian>,
    /// Record type (0x0010, 0x0011, 0x0019, 0x001A, 0x0305, 0x0505, ...)
    block_type: U16<LittleEndian>,
    serial_number: U32<LittleEndian>,
    transaction_identifier: U64<LittleEndian>,
    object_identifier: U64<LittleEndian>,
    number: U64<LittleEndian>,
    reserved1: [u8; 8],
    /// Block size, always 8192
    block_size: U32<LittleEndian>,
    reserved2: [u8; 4],
    reserved3: [u8; 8],
}

/// A validated metadata block borrowing its backing buffer
#[derive(Debug)]
pub struct MetadataBlock<'a> {
    /// Record type of this block
    pub block_type: u16,
    /// Serial number, matches the volume header serial
    pub serial_number: u32,
    /// Transaction this block was committed under
    pub transaction_identifier: u64,
    /// Object identifier cross-referencing other records
    pub object_identifier: u64,
    /// Block number within its metadata area
    pub number: u64,
    /// True when the block carries the `LVFwiped` marker
    pub is_lvf_wiped: bool,
    /// Payload after the 64-byte frame header
    pub data: &'a [u8],
}

impl<'a> MetadataBlock<'a> {
    /// Validates the frame of an 8192-byte metadata block
    pub fn read(block_data: &'a [u8]) -> Result<Self> {
        if block_data.len() < METADATA_BLOCK_SIZE {
            return Err(Error::OutOfBounds {
                what: "metadata block shorter than 8192 bytes",
            });
        }
        let raw = RawMetadataBlockHeader::read_from_bytes(&block_data[..METADATA_BLOCK_HEADER_SIZE])
            .map_err(|_| Error::Malformed {
                what: "metadata block header",
            })?;

        let is_lvf_wiped = block_data[..8] == LVF_WIPED_SIGNATURE;

        if raw.block_size.get() as usize != METADATA_BLOCK_SIZE {
            return Err(Error::Unsupported {
                what: "metadata block size",
            });
        }
        if !is_lvf_wiped {
            if raw.version.get() != 1 {
                return Err(Error::Unsupported {
                    what: "metadata block version",
                });
            }
            if raw.initial_value.get() != 0xffffffff {
                return Err(Error::Unsupported {
                    what: "metadata block checksum initial value",
                });
            }
            let stored = raw.checksum.get();
            let computed = weak_crc32(&block_data[8..METADATA_BLOCK_SIZE], raw.initial_value.get());
            if stored != computed {
                return Err(Error::ChecksumMismatch {
                    what: "metadata block",
                    stored,
                    computed,
                });
            }
        }
        Ok(Self {
            block_type: raw.block_type.get(),
            serial_number: raw.serial_number.get(),
            transaction_identifier: raw.transaction_identifier.get(),
            object_identifier: raw.object_identifier.get(),
            number: raw.number.get(),
            is_lvf_wiped,
            data: &block_data[METADATA_BLOCK_HEADER_SIZE..METADATA_BLOCK_SIZE],
        })
    }
}

/// Serializes a frame header and checksum around `payload`, test and
/// fixture support for the parsers above
#[doc(hidden)]
pub fn frame_block(
    block_type: u16,
    serial_number: u32,
    transaction_identifier: u64,
    object_identifier: u64,
    number: u64,
    payload: &[u8],
) -> Vec<u8> {
    assert!(payload.len() <= METADATA_BLOCK_SIZE - METADATA_BLOCK_HEADER_SIZE);
    let mut block = vec![0u8; METADATA_BLOCK_SIZE];
    block[4..8].copy_from_slice(&0xffffffffu32.to_le_bytes());
    block[8..10].copy_from_slice(&1u16.to_le_bytes());
    block[10..12].copy_from_slice(&block_type.to_le_bytes());
    block[12..16].copy_from_slice(&serial_number.to_le_bytes());
    block[16..24].copy_from_slice(&transaction_identifier.to_le_bytes());
    block[24..32].copy_from_slice(&object_identifier.to_le_bytes());
    block[32..40].copy_from_slice(&number.to_le_bytes());
    block[48..52].copy_from_slice(&(METADATA_BLOCK_SIZE as u32).to_le_bytes());
    block[METADATA_BLOCK_HEADER_SIZE..METADATA_BLOCK_HEADER_SIZE + payload.len()]
        .copy_from_slice(payload);

    let checksum = weak_crc32(&block[8..], 0xffffffff);
    block[0..4].copy_from_slice(&checksum.to_le_bytes());
    block
}
