// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Byte-stream primitives: fixed-width integer decoding out of untrusted
//! buffers and the uniform-byte block scan used to detect empty metadata
//! blocks.
//!
//! The decoders return [`Error::OutOfBounds`] instead of panicking when the
//! requested range does not fit the buffer; the dynamic offsets in metadata
//! payloads come straight from disk.

use crate::error::{Error, Result};

fn take<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    data.get(offset..offset + N)
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .ok_or(Error::OutOfBounds {
            what: "integer read past end of buffer",
        })
}

/// Reads a little-endian u16 at `offset`
pub fn read_u16_le(data: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(take(data, offset)?))
}

/// Reads a little-endian u32 at `offset`
pub fn read_u32_le(data: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(take(data, offset)?))
}

/// Reads a little-endian u64 at `offset`
pub fn read_u64_le(data: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(take(data, offset)?))
}

/// Reads a big-endian u16 at `offset`
pub fn read_u16_be(data: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_be_bytes(take(data, offset)?))
}

/// Reads a big-endian u32 at `offset`
pub fn read_u32_be(data: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(take(data, offset)?))
}

/// Copies a fixed-size byte array at `offset`
pub fn read_bytes<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N]> {
    take(data, offset)
}

/// Returns true iff every byte in `data` equals the first byte.
///
/// Compares eight bytes per step; the result is identical to a plain
/// byte-wise comparison.
pub fn is_uniform_block(data: &[u8]) -> bool {
    let Some((&first, rest)) = data.split_first() else {
        return true;
    };
    let word = [first; 8];

    let mut chunks = rest.chunks_exact(8);
    chunks.by_ref().all(|chunk| chunk == word)
        && chunks.remainder().iter().all(|&b| b == first)
}
