// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The CoreStorage physical volume header.
//!
//! Each physical volume starts with a 512-byte header carrying the "CS"
//! signature, the sector and block geometry, the byte offsets of the four
//! primary metadata blocks, the key data seeding the metadata decryption and
//! the physical volume / volume group identifiers. The header checksum is
//! the weak CRC-32 over bytes 8..512 with initial value `0xffffffff`.

use log;
use uuid::Uuid;
use zerocopy::*;

use crate::checksum::weak_crc32;
use crate::error::{Error, Result};

/// Size in bytes of the on-disk volume header
pub const VOLUME_HEADER_SIZE: usize = 512;

/// The CoreStorage signature at byte 88
pub const CORE_STORAGE_SIGNATURE: [u8; 2] = *b"CS";

/// On-disk layout of the volume header
#[derive(FromBytes, Unaligned)]
#[repr(C, packed)]
struct RawVolumeHeader {
    /// Weak CRC-32 over bytes 8..512
    checksum: U32<LittleEndian>,
    /// Initial checksum value, always 0xffffffff
    initial_value: U32<LittleEndian>,
    /// Format version, always 1
    format_version: U16<LittleEndian>,
    /// Block type, 0x0010 for the volume header
    block_type: U16<LittleEndian>,
    serial_number: U32<LittleEndian>,
    reserved1: [u8; 8],
    reserved2: [u8; 24],
    bytes_per_sector: U32<LittleEndian>,
    reserved3: [u8; 4],
    reserved4: [u8; 8],
    /// Size of the physical volume in bytes
    volume_size: U64<LittleEndian>,
    /// Possibly resize flags, treated as opaque
    reserved5: [u8; 16],
    core_storage_signature: [u8; 2],
    checksum_algorithm: U32<LittleEndian>,
    /// Possibly disk-label iterations, treated as opaque
    reserved6: [u8; 2],
    block_size: U32<LittleEndian>,
    metadata_size: U32<LittleEndian>,
    /// Block numbers of the four primary metadata blocks
    metadata_block_numbers: [U64<LittleEndian>; 4],
    reserved7: [u8; 32],
    key_data_size: U32<LittleEndian>,
    encryption_method: U32<LittleEndian>,
    key_data: [u8; 128],
    physical_volume_identifier: [u8; 16],
    volume_group_identifier: [u8; 16],
    reserved8: [u8; 176],
}

/// Parsed and validated volume header
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    /// Serial number shared with the metadata blocks
    pub serial_number: u32,
    /// Sector size in bytes, 512 on every known container
    pub bytes_per_sector: u32,
    /// Size of this physical volume in bytes
    pub physical_volume_size: u64,
    /// Volume block size in bytes, the unit segment extents count in
    pub block_size: u32,
    /// Size of one metadata area in bytes
    pub metadata_size: u32,
    /// Byte offsets of the four primary metadata blocks within this volume
    pub metadata_offsets: [u64; 4],
    /// First 16 bytes of the header key data, the metadata XTS key
    pub key_data: [u8; 16],
    /// Identifier of this physical volume
    pub physical_volume_identifier: [u8; 16],
    /// Identifier of the owning volume group
    pub volume_group_identifier: [u8; 16],
}

impl VolumeHeader {
    /// Parses and validates a 512-byte volume header
    pub fn read(data: &[u8]) -> Result<Self> {
        let raw = RawVolumeHeader::read_from_bytes(
            data.get(..VOLUME_HEADER_SIZE).ok_or(Error::OutOfBounds {
                what: "volume header shorter than 512 bytes",
            })?,
        )
        .map_err(|_| Error::Malformed {
            what: "volume header",
        })?;

        if raw.core_storage_signature != CORE_STORAGE_SIGNATURE {
            return Err(Error::Unsupported {
                what: "core storage signature",
            });
        }
        if raw.format_version.get() != 1 {
            return Err(Error::Unsupported {
                what: "volume header format version",
            });
        }
        if raw.checksum_algorithm.get() != 1 {
            return Err(Error::Unsupported {
                what: "volume header checksum algorithm",
            });
        }
        if raw.initial_value.get() != 0xffffffff {
            return Err(Error::Unsupported {
                what: "volume header checksum initial value",
            });
        }
        let stored = raw.checksum.get();
        let computed = weak_crc32(&data[8..VOLUME_HEADER_SIZE], raw.initial_value.get());
        if stored != computed {
            return Err(Error::ChecksumMismatch {
                what: "volume header",
                stored,
                computed,
            });
        }
        if raw.block_type.get() != 0x0010 {
            return Err(Error::Unsupported {
                what: "volume header block type",
            });
        }
        if raw.encryption_method.get() != 2 {
            return Err(Error::Unsupported {
                what: "physical volume encryption method",
            });
        }
        if raw.bytes_per_sector.get() == 0 {
            return Err(Error::Unsupported {
                what: "zero bytes per sector",
            });
        }
        if raw.block_size.get() == 0 {
            return Err(Error::Unsupported {
                what: "zero block size",
            });
        }
        let block_size = raw.block_size.get() as u64;
        let mut metadata_offsets = [0u64; 4];
        for (offset, block_number) in metadata_offsets.iter_mut().zip(&raw.metadata_block_numbers) {
            let block_number = block_number.get();
            if block_number > i64::MAX as u64 / block_size {
                return Err(Error::OutOfBounds {
                    what: "metadata block number",
                });
            }
            *offset = block_number * block_size;
        }
        let key_data = raw.key_data[..16].try_into().expect("16-byte key data");

        let header = Self {
            serial_number: raw.serial_number.get(),
            bytes_per_sector: raw.bytes_per_sector.get(),
            physical_volume_size: raw.volume_size.get(),
            block_size: raw.block_size.get(),
            metadata_size: raw.metadata_size.get(),
            metadata_offsets,
            key_data,
            physical_volume_identifier: raw.physical_volume_identifier,
            volume_group_identifier: raw.volume_group_identifier,
        };
        log::trace!(
            "volume header accepted: PV {}, group {}, {} bytes",
            header.physical_volume_uuid(),
            header.volume_group_uuid(),
            header.physical_volume_size
        );
        Ok(header)
    }

    /// The physical volume identifier as a UUID
    pub fn physical_volume_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.physical_volume_identifier)
    }

    /// The volume group identifier as a UUID
    pub fn volume_group_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.volume_group_identifier)
    }
}
