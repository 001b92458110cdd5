// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The top-level container facade.
//!
//! Opening a volume parses every physical volume header in the pool and the
//! plaintext metadata of the primary member; the encrypted metadata is
//! decrypted lazily on the first [`Volume::group`] call, falling back to
//! the secondary copy when the primary is corrupt. All secrets and reads go
//! through the [`crate::logical_volume::LogicalVolume`] views the group
//! hands out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log;

use crate::MEMORY_MAXIMUM_ALLOCATION_SIZE;
use crate::encrypted_metadata::EncryptedMetadata;
use crate::error::{Error, Result};
use crate::io::BlockPool;
use crate::keybag::EncryptionContextPlist;
use crate::logical_volume::LogicalVolume;
use crate::metadata::{EncryptedMetadataLocation, Metadata};
use crate::metadata_block::{METADATA_BLOCK_SIZE, MetadataBlock};
use crate::volume_group::VolumeGroup;
use crate::volume_header::{VOLUME_HEADER_SIZE, VolumeHeader};
use crate::descriptors::LogicalVolumeDescriptor;

/// Cooperative cancellation flag shared with in-flight reads.
///
/// Cloneable and safe to trigger from any thread; readers notice at the
/// next sector boundary and return the bytes produced so far.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Requests in-flight reads to stop early
    pub fn abort(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Clears the flag so new reads run to completion again
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    /// True when an abort is pending
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// An opened CoreStorage container
pub struct Volume<P: BlockPool> {
    pool: P,
    headers: Vec<VolumeHeader>,
    metadata: Metadata,
    encrypted_metadata: Option<EncryptedMetadata>,
    external_keybag: Option<EncryptionContextPlist>,
    pool_entry_by_pv_index: Vec<u16>,
    abort: AbortHandle,
}

impl<P: BlockPool> Volume<P> {
    /// Opens a container from a pool of physical volume readers.
    ///
    /// Parses every member's volume header and the plaintext metadata of
    /// the primary member, and resolves the plist's physical volume order
    /// against the pool.
    pub fn open(pool: P) -> Result<Self> {
        if pool.number_of_entries() == 0 {
            return Err(Error::InvalidArgument {
                reason: "empty physical volume pool",
            });
        }
        if pool.number_of_entries() > u16::MAX as usize {
            return Err(Error::InvalidArgument {
                reason: "too many physical volumes in the pool",
            });
        }
        let mut headers = Vec::with_capacity(pool.number_of_entries());
        for entry in 0..pool.number_of_entries() as u16 {
            let mut header_data = [0u8; VOLUME_HEADER_SIZE];
            pool.read_exact_at(entry, 0, &mut header_data)
                .map_err(|source| Error::Io { source })?;
            headers.push(VolumeHeader::read(&header_data)?);
        }
        let group_identifier = headers[0].volume_group_identifier;
        if headers
            .iter()
            .any(|header| header.volume_group_identifier != group_identifier)
        {
            return Err(Error::Unsupported {
                what: "pool members belong to different volume groups",
            });
        }
        let metadata = read_newest_plaintext_metadata(&pool, &headers[0])?;

        // The plist lists the group members in volume group order; match
        // each to the pool entry carrying that physical volume.
        let mut pool_entry_by_pv_index = Vec::with_capacity(
            metadata.physical_volume_descriptors.len(),
        );
        for descriptor in &metadata.physical_volume_descriptors {
            let entry = headers
                .iter()
                .position(|header| header.physical_volume_identifier == descriptor.identifier)
                .ok_or(Error::Malformed {
                    what: "pool is missing a physical volume named by the metadata",
                })?;
            pool_entry_by_pv_index.push(entry as u16);
        }
        Ok(Self {
            pool,
            headers,
            metadata,
            encrypted_metadata: None,
            external_keybag: None,
            pool_entry_by_pv_index,
            abort: AbortHandle::default(),
        })
    }

    /// Attaches an `EncryptedRoot.plist` keybag supplied out of band.
    ///
    /// Used when the encrypted metadata does not embed an encryption
    /// context; an embedded context takes precedence.
    pub fn set_encryption_context_plist(&mut self, data: &[u8]) -> Result<()> {
        self.external_keybag = Some(EncryptionContextPlist::read(data)?);
        Ok(())
    }

    /// Handle for aborting in-flight reads from another thread
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// The volume group, decrypting and walking the encrypted metadata on
    /// first use.
    ///
    /// The primary metadata copy is tried first; on structural or checksum
    /// failure the secondary copy is read before giving up.
    pub fn group(&mut self) -> Result<VolumeGroup<'_, P>> {
        if self.encrypted_metadata.is_none() {
            self.encrypted_metadata = Some(self.read_encrypted_metadata()?);
        }
        Ok(VolumeGroup::new(self))
    }

    fn read_encrypted_metadata(&self) -> Result<EncryptedMetadata> {
        let primary = self.metadata.encrypted_metadata1;
        let secondary = self.metadata.encrypted_metadata2;

        match self.read_encrypted_metadata_copy(primary) {
            Ok(metadata) => Ok(metadata),
            Err(error @ Error::Io { .. }) => Err(error),
            Err(error) => {
                log::warn!(
                    "primary encrypted metadata rejected ({error}), trying the secondary copy"
                );
                self.read_encrypted_metadata_copy(secondary)
                    .map_err(|_| Error::Malformed {
                        what: "both encrypted metadata copies",
                    })
            }
        }
    }

    fn read_encrypted_metadata_copy(
        &self,
        location: EncryptedMetadataLocation,
    ) -> Result<EncryptedMetadata> {
        let pool_entry = *self
            .pool_entry_by_pv_index
            .get(location.physical_volume_index as usize)
            .ok_or(Error::OutOfBounds {
                what: "encrypted metadata physical volume index",
            })?;
        let header = &self.headers[pool_entry as usize];
        EncryptedMetadata::read(
            &self.pool,
            pool_entry,
            location.byte_offset,
            self.metadata.encrypted_metadata_size,
            header,
        )
    }

    pub(crate) fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub(crate) fn encrypted_metadata(&self) -> &EncryptedMetadata {
        self.encrypted_metadata
            .as_ref()
            .expect("group() walks the encrypted metadata first")
    }

    pub(crate) fn header(&self, pool_entry: u16) -> &VolumeHeader {
        &self.headers[pool_entry as usize]
    }

    pub(crate) fn pool_entry_by_pv_index(&self) -> &[u16] {
        &self.pool_entry_by_pv_index
    }

    pub(crate) fn build_logical_volume<'a>(
        &'a self,
        descriptor: &'a LogicalVolumeDescriptor,
    ) -> Result<LogicalVolume<'a, P>> {
        let header = &self.headers[0];
        LogicalVolume::new(
            &self.pool,
            descriptor,
            self.encrypted_metadata(),
            self.external_keybag.as_ref(),
            &self.pool_entry_by_pv_index,
            header.bytes_per_sector,
            header.block_size,
            &self.abort.flag,
        )
    }
}

impl<P: BlockPool> std::fmt::Debug for Volume<P> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Volume")
            .field("volume_group", &self.metadata.volume_group_uuid())
            .field("physical_volumes", &self.headers.len())
            .finish()
    }
}

/// Reads the four redundant plaintext metadata copies and keeps the most
/// recently committed one; copies that fail validation are skipped.
fn read_newest_plaintext_metadata<P: BlockPool>(
    pool: &P,
    header: &VolumeHeader,
) -> Result<Metadata> {
    let mut newest: Option<Metadata> = None;
    let mut first_error: Option<Error> = None;

    for &metadata_offset in &header.metadata_offsets {
        match read_plaintext_metadata(pool, header, metadata_offset) {
            Ok(metadata) => {
                let is_newer = newest
                    .as_ref()
                    .map(|current| metadata.transaction_identifier > current.transaction_identifier)
                    .unwrap_or(true);
                if is_newer {
                    newest = Some(metadata);
                }
            }
            Err(error @ Error::Io { .. }) => return Err(error),
            Err(error) => {
                log::warn!("plaintext metadata copy at {metadata_offset} rejected: {error}");
                first_error.get_or_insert(error);
            }
        }
    }
    match (newest, first_error) {
        (Some(metadata), _) => Ok(metadata),
        (None, Some(error)) => Err(error),
        (None, None) => Err(Error::Malformed {
            what: "volume without plaintext metadata",
        }),
    }
}

fn read_plaintext_metadata<P: BlockPool>(
    pool: &P,
    header: &VolumeHeader,
    metadata_offset: u64,
) -> Result<Metadata> {
    if header.metadata_size == 0
        || header.metadata_size as usize > MEMORY_MAXIMUM_ALLOCATION_SIZE
    {
        return Err(Error::Memory {
            requested: header.metadata_size as u64,
        });
    }
    if (header.metadata_size as usize) < METADATA_BLOCK_SIZE {
        return Err(Error::Malformed {
            what: "metadata area smaller than one block",
        });
    }
    let mut metadata_data = vec![0u8; header.metadata_size as usize];
    pool.read_exact_at(0, metadata_offset, &mut metadata_data)
        .map_err(|source| Error::Io { source })?;

    let block = MetadataBlock::read(&metadata_data[..METADATA_BLOCK_SIZE])?;
    Metadata::read(&block, header)
}
