// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Random-access reads against one logical volume.
//!
//! The segment map is flattened into a run table over logical sectors:
//! mapped runs point into a physical volume, sparse runs cover the gaps
//! between extents and any tail short of the declared volume size and read
//! as zeros. Decrypted sectors go through a per-volume LRU cache. All
//! mutable state (offset, lock flag, codec, cache, secrets) sits behind one
//! read-write lock; reads serialize per volume while distinct volumes
//! proceed independently.

use std::io::SeekFrom;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use log;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::bytestream::read_u16_be;
use crate::crypto::{XtsContext, derive_tweak_key};
use crate::descriptors::LogicalVolumeDescriptor;
use crate::encrypted_metadata::EncryptedMetadata;
use crate::error::{Error, Result};
use crate::io::BlockPool;
use crate::cache::LruCache;
use crate::keybag::EncryptionContextPlist;
use crate::keyring::Keyring;
use crate::sector::SectorCodec;

/// Default number of decrypted sectors kept per volume
pub const SECTOR_CACHE_SIZE: usize = 1024;

/// Disk label signatures accepted by the unlock probe (HFS+ and HFSX)
const DISK_LABEL_SIGNATURES: [u16; 2] = [0x482b, 0x4858];

/// Byte offset of the disk label within the logical volume
const DISK_LABEL_OFFSET: u64 = 1024;

#[derive(Debug, Clone, Copy)]
enum RunKind {
    /// Zero-filled, not backed by storage
    Sparse,
    /// Backed by a physical volume extent
    Mapped {
        pool_entry: u16,
        /// Absolute byte offset of the run start within the pool entry
        byte_offset: u64,
    },
}

#[derive(Debug, Clone, Copy)]
struct SectorRun {
    first_sector: u64,
    number_of_sectors: u64,
    kind: RunKind,
}

struct LvState {
    current_offset: u64,
    is_locked: bool,
    codec: Option<SectorCodec>,
    keyring: Option<Keyring>,
    cache: LruCache<(u16, u64), Vec<u8>>,
    user_password: Option<Zeroizing<Vec<u8>>>,
    recovery_password: Option<Zeroizing<Vec<u8>>>,
    volume_master_key: Option<Zeroizing<[u8; 16]>>,
}

/// A logical volume view with `read`/`seek` semantics
pub struct LogicalVolume<'a, P: BlockPool> {
    pool: &'a P,
    descriptor: &'a LogicalVolumeDescriptor,
    encrypted_metadata: &'a EncryptedMetadata,
    external_keybag: Option<&'a EncryptionContextPlist>,
    abort: &'a AtomicBool,
    bytes_per_sector: u64,
    runs: Vec<SectorRun>,
    total_sectors: u64,
    state: RwLock<LvState>,
}

impl<'a, P: BlockPool> LogicalVolume<'a, P> {
    /// Builds the reader for a descriptor; the volume starts locked unless
    /// its first sectors already carry a plaintext disk label
    pub(crate) fn new(
        pool: &'a P,
        descriptor: &'a LogicalVolumeDescriptor,
        encrypted_metadata: &'a EncryptedMetadata,
        external_keybag: Option<&'a EncryptionContextPlist>,
        pool_entry_by_pv_index: &[u16],
        bytes_per_sector: u32,
        block_size: u32,
        abort: &'a AtomicBool,
    ) -> Result<Self> {
        let (runs, total_sectors) = build_sector_runs(
            descriptor,
            pool_entry_by_pv_index,
            bytes_per_sector as u64,
            block_size as u64,
        )?;
        let volume = Self {
            pool,
            descriptor,
            encrypted_metadata,
            external_keybag,
            abort,
            bytes_per_sector: bytes_per_sector as u64,
            runs,
            total_sectors,
            state: RwLock::new(LvState {
                current_offset: 0,
                is_locked: true,
                codec: None,
                keyring: None,
                cache: LruCache::new(SECTOR_CACHE_SIZE),
                user_password: None,
                recovery_password: None,
                volume_master_key: None,
            }),
        };
        // A plaintext volume carries its disk label unencrypted; such a
        // volume opens unlocked with a pass-through codec.
        let plaintext_codec = SectorCodec::new_unencrypted(bytes_per_sector as usize);
        if volume.probe_disk_label(&plaintext_codec)? == Some(true) {
            log::debug!(
                "logical volume {} is not encrypted",
                volume.descriptor.uuid()
            );
            let mut state = volume.state_write();
            state.codec = Some(plaintext_codec);
            state.is_locked = false;
        }
        Ok(volume)
    }

    fn state_write(&self) -> std::sync::RwLockWriteGuard<'_, LvState> {
        self.state.write().expect("logical volume lock poisoned")
    }

    /// Stable identifier of this logical volume
    pub fn identifier(&self) -> Uuid {
        self.descriptor.uuid()
    }

    /// Volume name from the metadata
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Volume name as UTF-16 code units
    pub fn name_utf16(&self) -> Vec<u16> {
        self.name().encode_utf16().collect()
    }

    /// Declared size in bytes
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    /// True until a successful `unlock`
    pub fn is_locked(&self) -> bool {
        self.state.read().expect("logical volume lock poisoned").is_locked
    }

    /// Current read offset
    pub fn offset(&self) -> u64 {
        self.state
            .read()
            .expect("logical volume lock poisoned")
            .current_offset
    }

    /// Supplies the user password used at the next `unlock`
    pub fn set_password(&self, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "empty password",
            });
        }
        let mut state = self.state_write();
        state.user_password = Some(Zeroizing::new(password.as_bytes().to_vec()));
        Ok(())
    }

    /// Supplies the user password from UTF-16 code units
    pub fn set_password_utf16(&self, password: &[u16]) -> Result<()> {
        let password = String::from_utf16(password).map_err(|_| Error::InvalidArgument {
            reason: "password is not valid UTF-16",
        })?;
        self.set_password(&password)
    }

    /// Supplies the recovery password used at the next `unlock`
    pub fn set_recovery_password(&self, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(Error::InvalidArgument {
                reason: "empty recovery password",
            });
        }
        let mut state = self.state_write();
        state.recovery_password = Some(Zeroizing::new(password.as_bytes().to_vec()));
        Ok(())
    }

    /// Supplies the recovery password from UTF-16 code units
    pub fn set_recovery_password_utf16(&self, password: &[u16]) -> Result<()> {
        let password = String::from_utf16(password).map_err(|_| Error::InvalidArgument {
            reason: "recovery password is not valid UTF-16",
        })?;
        self.set_recovery_password(&password)
    }

    /// Supplies the raw 16-byte volume master key, bypassing the keybag
    pub fn set_key(&self, volume_master_key: &[u8]) -> Result<()> {
        let volume_master_key: [u8; 16] =
            volume_master_key
                .try_into()
                .map_err(|_| Error::InvalidArgument {
                    reason: "volume master key is not 16 bytes",
                })?;
        let mut state = self.state_write();
        state.volume_master_key = Some(Zeroizing::new(volume_master_key));
        Ok(())
    }

    /// Attempts to unlock the volume with the supplied secrets.
    ///
    /// Returns `Ok(false)` when no supplied secret yields a readable
    /// volume; a raw master key that fails the disk-label probe is an
    /// [`Error::AuthenticationFailed`] instead, since the caller asserted
    /// key material rather than guessed a password.
    pub fn unlock(&self) -> Result<bool> {
        let mut state = self.state_write();
        if !state.is_locked {
            return Ok(true);
        }
        if let Some(volume_master_key) = state.volume_master_key.clone() {
            if let Some(codec) = self.try_master_key(&volume_master_key)? {
                self.mark_unlocked(&mut state, codec, &volume_master_key);
                return Ok(true);
            }
            return Err(Error::AuthenticationFailed);
        }
        let keybag = self
            .encrypted_metadata
            .encryption_context_for_family(&self.descriptor.family_identifier)
            .or(self.external_keybag);
        let Some(keybag) = keybag else {
            log::debug!(
                "no keybag available for family {}",
                self.descriptor.family_uuid()
            );
            return Ok(false);
        };
        let secrets = [state.user_password.clone(), state.recovery_password.clone()];
        for secret in secrets.into_iter().flatten() {
            for candidate in keybag.candidate_master_keys(&secret)? {
                if let Some(codec) = self.try_master_key(&candidate)? {
                    self.mark_unlocked(&mut state, codec, &candidate);
                    return Ok(true);
                }
            }
        }
        log::debug!(
            "unlock failed for logical volume {}",
            self.descriptor.uuid()
        );
        Ok(false)
    }

    fn mark_unlocked(
        &self,
        state: &mut LvState,
        codec: SectorCodec,
        volume_master_key: &[u8; 16],
    ) {
        let tweak_key = derive_tweak_key(volume_master_key, &self.descriptor.family_identifier);
        state.keyring = Some(Keyring::new(*volume_master_key, tweak_key));
        state.codec = Some(codec);
        state.is_locked = false;
        state.cache.clear();
        log::debug!("unlocked logical volume {}", self.descriptor.uuid());
    }

    /// Builds a codec from a master key and probes the disk label with it.
    ///
    /// A sparse label sector cannot disprove the key; such a probe counts
    /// as a pass.
    fn try_master_key(&self, volume_master_key: &[u8; 16]) -> Result<Option<SectorCodec>> {
        let tweak_key = derive_tweak_key(volume_master_key, &self.descriptor.family_identifier);
        let codec = SectorCodec::new(
            XtsContext::new(volume_master_key, &tweak_key),
            self.bytes_per_sector as usize,
        );
        match self.probe_disk_label(&codec)? {
            Some(false) => Ok(None),
            _ => Ok(Some(codec)),
        }
    }

    /// Reads the sector at the disk-label offset with `codec` and checks
    /// for an HFS+/HFSX signature.
    ///
    /// Returns `None` when the sector is sparse or the volume is too small
    /// to hold a label; there is nothing to validate against then.
    fn probe_disk_label(&self, codec: &SectorCodec) -> Result<Option<bool>> {
        let sector_index = DISK_LABEL_OFFSET / self.bytes_per_sector;
        if sector_index >= self.total_sectors {
            return Ok(None);
        }
        let Some(sector) = self.load_sector_uncached(codec, sector_index)? else {
            return Ok(None);
        };
        let signature = read_u16_be(&sector, 0)?;
        Ok(Some(DISK_LABEL_SIGNATURES.contains(&signature)))
    }

    /// Reads one sector without consulting the cache; `None` for sparse
    fn load_sector_uncached(
        &self,
        codec: &SectorCodec,
        sector_index: u64,
    ) -> Result<Option<Vec<u8>>> {
        let run = self.run_containing(sector_index)?;
        match run.kind {
            RunKind::Sparse => Ok(None),
            RunKind::Mapped {
                pool_entry,
                byte_offset,
            } => {
                let sector_offset =
                    byte_offset + (sector_index - run.first_sector) * self.bytes_per_sector;
                let mut sector = vec![0u8; self.bytes_per_sector as usize];
                self.pool
                    .read_exact_at(pool_entry, sector_offset, &mut sector)
                    .map_err(|source| Error::Io { source })?;
                codec.decrypt_sector(&mut sector, sector_index)?;
                Ok(Some(sector))
            }
        }
    }

    fn run_containing(&self, sector_index: u64) -> Result<SectorRun> {
        let position = self
            .runs
            .partition_point(|run| run.first_sector + run.number_of_sectors <= sector_index);
        self.runs
            .get(position)
            .filter(|run| run.first_sector <= sector_index)
            .copied()
            .ok_or(Error::OutOfBounds {
                what: "sector index outside the volume",
            })
    }

    /// Reads from the current offset, advancing it.
    ///
    /// Returns the number of bytes produced, which falls short of the
    /// buffer when the volume ends, the pool reports end of data, or an
    /// abort is requested; an abort mid-read is not an error.
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        let mut state = self.state_write();
        self.read_locked(&mut state, buffer)
    }

    /// Seeks to `offset` and reads, like `seek` followed by `read`
    pub fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        let mut state = self.state_write();
        state.current_offset = offset;
        self.read_locked(&mut state, buffer)
    }

    fn read_locked(&self, state: &mut LvState, buffer: &mut [u8]) -> Result<usize> {
        if state.is_locked {
            return Err(Error::Locked);
        }
        let volume_size = self.descriptor.size;
        if state.current_offset >= volume_size {
            return Ok(0);
        }
        let LvState {
            current_offset,
            codec,
            cache,
            ..
        } = state;
        let codec = codec.as_ref().expect("unlocked volume has a codec");
        let remaining_in_volume = volume_size - *current_offset;
        let read_size = (buffer.len() as u64).min(remaining_in_volume) as usize;

        let mut buffer_offset = 0usize;
        let mut result = Ok(());

        while buffer_offset < read_size {
            let sector_index = *current_offset / self.bytes_per_sector;
            let sector_offset = (*current_offset % self.bytes_per_sector) as usize;

            let copy_size =
                (read_size - buffer_offset).min(self.bytes_per_sector as usize - sector_offset);

            match self.sector_for_read(codec, cache, sector_index) {
                Ok(sector) => {
                    buffer[buffer_offset..buffer_offset + copy_size]
                        .copy_from_slice(&sector[sector_offset..sector_offset + copy_size]);
                }
                Err(error) => {
                    result = Err(error);
                    break;
                }
            }
            buffer_offset += copy_size;
            *current_offset += copy_size as u64;

            if self.abort.load(Ordering::Relaxed) {
                log::debug!("read aborted after {buffer_offset} bytes");
                break;
            }
        }
        // An error before any byte was produced surfaces; a partial read
        // returns the bytes already transferred.
        match result {
            Err(error) if buffer_offset == 0 => Err(error),
            _ => Ok(buffer_offset),
        }
    }

    fn sector_for_read(
        &self,
        codec: &SectorCodec,
        cache: &mut LruCache<(u16, u64), Vec<u8>>,
        sector_index: u64,
    ) -> Result<Vec<u8>> {
        let run = self.run_containing(sector_index)?;
        match run.kind {
            RunKind::Sparse => Ok(codec.zero_sector()),
            RunKind::Mapped {
                pool_entry,
                byte_offset,
            } => {
                let sector_offset =
                    byte_offset + (sector_index - run.first_sector) * self.bytes_per_sector;
                let key = (pool_entry, sector_offset);
                if let Some(sector) = cache.get(&key) {
                    return Ok(sector.clone());
                }
                let mut sector = vec![0u8; self.bytes_per_sector as usize];
                self.pool
                    .read_exact_at(pool_entry, sector_offset, &mut sector)
                    .map_err(|source| Error::Io { source })?;
                codec.decrypt_sector(&mut sector, sector_index)?;
                cache.put(key, sector.clone());
                Ok(sector)
            }
        }
    }

    /// Moves the read offset with `SEEK_SET`/`SEEK_CUR`/`SEEK_END`
    /// semantics; seeking past the volume size is allowed and subsequent
    /// reads return 0
    pub fn seek(&self, position: SeekFrom) -> Result<u64> {
        let mut state = self.state_write();
        let base = match position {
            SeekFrom::Start(offset) => {
                state.current_offset = offset;
                return Ok(offset);
            }
            SeekFrom::Current(delta) => (state.current_offset, delta),
            SeekFrom::End(delta) => (self.descriptor.size, delta),
        };
        let (origin, delta) = base;
        let target = origin
            .checked_add_signed(delta)
            .ok_or(Error::InvalidArgument {
                reason: "seek to a negative offset",
            })?;
        state.current_offset = target;
        Ok(target)
    }
}

impl<P: BlockPool> std::fmt::Debug for LogicalVolume<'_, P> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("LogicalVolume")
            .field("identifier", &self.identifier())
            .field("name", &self.name())
            .field("size", &self.size())
            .field("is_locked", &self.is_locked())
            .finish()
    }
}

/// Flattens segment descriptors into a run table covering the whole
/// logical volume, synthesizing sparse runs for gaps and the tail
fn build_sector_runs(
    descriptor: &LogicalVolumeDescriptor,
    pool_entry_by_pv_index: &[u16],
    bytes_per_sector: u64,
    block_size: u64,
) -> Result<(Vec<SectorRun>, u64)> {
    let sectors_per_block = block_size / bytes_per_sector;
    if sectors_per_block == 0 || block_size % bytes_per_sector != 0 {
        return Err(Error::Unsupported {
            what: "block size is not a multiple of the sector size",
        });
    }
    let total_sectors = descriptor.size.div_ceil(bytes_per_sector);

    let mut runs = Vec::with_capacity(descriptor.segment_descriptors.len() + 2);
    let mut expected_logical_block = 0u64;

    let sectors_of = |blocks: u64| {
        blocks.checked_mul(sectors_per_block).ok_or(Error::OutOfBounds {
            what: "segment map sector count",
        })
    };
    for segment in &descriptor.segment_descriptors {
        if segment.logical_block_number > expected_logical_block {
            let gap_blocks = segment.logical_block_number - expected_logical_block;
            runs.push(SectorRun {
                first_sector: sectors_of(expected_logical_block)?,
                number_of_sectors: sectors_of(gap_blocks)?,
                kind: RunKind::Sparse,
            });
        }
        let pool_entry = *pool_entry_by_pv_index
            .get(segment.physical_volume_index as usize)
            .ok_or(Error::OutOfBounds {
                what: "segment physical volume index",
            })?;
        let physical_block = descriptor
            .base_physical_block_number
            .checked_add(segment.physical_block_number)
            .ok_or(Error::OutOfBounds {
                what: "segment physical block number",
            })?;
        let byte_offset = physical_block
            .checked_mul(block_size)
            .ok_or(Error::OutOfBounds {
                what: "segment physical byte offset",
            })?;
        runs.push(SectorRun {
            first_sector: sectors_of(segment.logical_block_number)?,
            number_of_sectors: sectors_of(segment.number_of_blocks)?,
            kind: RunKind::Mapped {
                pool_entry,
                byte_offset,
            },
        });
        expected_logical_block = segment
            .logical_block_number
            .checked_add(segment.number_of_blocks)
            .ok_or(Error::OutOfBounds {
                what: "segment map extent end",
            })?;
    }
    let mapped_sectors = sectors_of(expected_logical_block)?;
    if mapped_sectors < total_sectors {
        runs.push(SectorRun {
            first_sector: mapped_sectors,
            number_of_sectors: total_sectors - mapped_sectors,
            kind: RunKind::Sparse,
        });
    }
    Ok((runs, total_sectors.max(mapped_sectors)))
}
