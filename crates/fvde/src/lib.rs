// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! # FVDE / CoreStorage volume reading
//!
//! Read-only access to Apple CoreStorage containers, including FileVault 2
//! full-disk-encrypted volumes. A container aggregates one or more physical
//! volumes into a volume group publishing logical volumes whose content is
//! transparently AES-128-XTS encrypted; this crate parses the on-disk
//! metadata, derives the volume keys from a password, recovery password or
//! raw volume master key, and serves random-access reads with on-the-fly
//! sector decryption.
//!
//! ```no_run
//! use std::fs::File;
//! use fvde::{ReaderPool, Volume};
//!
//! # fn main() -> fvde::Result<()> {
//! let pool = ReaderPool::new(vec![File::open("/images/corestorage.raw")?]);
//! let mut volume = Volume::open(pool)?;
//! let group = volume.group()?;
//!
//! let logical_volume = group.logical_volume(0)?;
//! logical_volume.set_password("fvde-TEST")?;
//! if logical_volume.unlock()? {
//!     let mut first_bytes = [0u8; 16];
//!     logical_volume.read_at(0, &mut first_bytes)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Writing, repairing corrupt containers and interpreting the filesystem
//! inside a logical volume are out of scope.

pub mod bitstream;
pub mod bytestream;
pub mod cache;
pub mod checksum;
pub mod crypto;
pub mod deflate;
pub mod descriptors;
pub mod encrypted_metadata;
mod error;
pub mod huffman;
pub mod io;
pub mod keybag;
pub mod keyring;
pub mod logical_volume;
pub mod metadata;
pub mod metadata_block;
pub mod physical_volume;
pub mod plist;
pub mod sector;
pub mod volume;
pub mod volume_group;
pub mod volume_header;

pub use error::{Error, Result};
pub use io::{BlockPool, ReaderPool};
pub use logical_volume::LogicalVolume;
pub use physical_volume::PhysicalVolume;
pub use volume::{AbortHandle, Volume};
pub use volume_group::VolumeGroup;

/// Ceiling applied to any allocation whose size comes from parsed data
pub const MEMORY_MAXIMUM_ALLOCATION_SIZE: usize = 256 * 1024 * 1024;
