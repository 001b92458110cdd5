// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Error type shared by the whole crate.

use std::io;

use snafu::Snafu;

/// Errors surfaced by volume parsing, key derivation and reads
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Caller misuse of an API
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: &'static str },

    /// A format feature or magic/version the crate does not handle
    #[snafu(display("unsupported: {what}"))]
    Unsupported { what: &'static str },

    /// Indexing past a buffer or an entity count
    #[snafu(display("out of bounds: {what}"))]
    OutOfBounds { what: &'static str },

    /// Structurally invalid data that no version difference explains
    #[snafu(display("malformed {what}"))]
    Malformed { what: &'static str },

    /// A stored CRC-32 or Adler-32 does not match the computed value
    #[snafu(display("checksum mismatch in {what} (stored 0x{stored:08x}, computed 0x{computed:08x})"))]
    ChecksumMismatch {
        what: &'static str,
        stored: u32,
        computed: u32,
    },

    /// Derived keys do not decrypt to a recognized plaintext
    #[snafu(display("authentication failed: derived keys do not decrypt the volume"))]
    AuthenticationFailed,

    /// The operation requires a prior successful `unlock`
    #[snafu(display("logical volume is locked"))]
    Locked,

    /// A read from the injected pool failed
    #[snafu(display("io"), context(false))]
    Io { source: io::Error },

    /// A parsed size exceeds the allocation ceiling
    #[snafu(display("allocation of {requested} bytes exceeds the memory limit"))]
    Memory { requested: u64 },
}

/// Crate-wide result alias
pub type Result<T, E = Error> = std::result::Result<T, E>;
