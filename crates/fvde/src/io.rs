// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The injected block-device abstraction.
//!
//! A [`BlockPool`] hands out random-access reads against the physical
//! volumes backing a container, one pool entry per physical volume file.
//! The library never writes. Implementations must allow concurrent reads of
//! distinct offsets from multiple threads (`&self` receivers plus
//! `Send + Sync`).

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;

/// A pool of seekable, random-access readers, one per physical volume
pub trait BlockPool: Send + Sync {
    /// Number of physical volumes in the pool
    fn number_of_entries(&self) -> usize;

    /// Reads up to `buffer.len()` bytes from `entry` at the absolute byte
    /// `offset`, returning the number of bytes produced
    fn read_at(&self, entry: u16, offset: u64, buffer: &mut [u8]) -> io::Result<usize>;

    /// Reads exactly `buffer.len()` bytes or fails
    fn read_exact_at(&self, entry: u16, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buffer.len() {
            let count = self.read_at(entry, offset + filled as u64, &mut buffer[filled..])?;
            if count == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "physical volume ended mid-read",
                ));
            }
            filled += count;
        }
        Ok(())
    }
}

/// Adapts any set of `Read + Seek` handles into a [`BlockPool`].
///
/// Each handle sits behind its own mutex, so reads of distinct entries
/// proceed in parallel while reads of the same entry serialize.
pub struct ReaderPool<R> {
    readers: Vec<Mutex<R>>,
}

impl<R: Read + Seek + Send> ReaderPool<R> {
    /// Builds a pool from one reader per physical volume
    pub fn new(readers: Vec<R>) -> Self {
        Self {
            readers: readers.into_iter().map(Mutex::new).collect(),
        }
    }
}

impl<R: Read + Seek + Send> BlockPool for ReaderPool<R> {
    fn number_of_entries(&self) -> usize {
        self.readers.len()
    }

    fn read_at(&self, entry: u16, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        let reader = self.readers.get(entry as usize).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no such physical volume entry")
        })?;
        let mut reader = reader.lock().expect("reader mutex poisoned");
        reader.seek(SeekFrom::Start(offset))?;
        reader.read(buffer)
    }
}

impl<R> std::fmt::Debug for ReaderPool<R> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ReaderPool")
            .field("entries", &self.readers.len())
            .finish()
    }
}
