// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Canonical Huffman tree with dense-array representation.
//!
//! The tree is stored as the per-length code counts plus the symbols sorted
//! by (code length, symbol value); decoding walks the stream one bit at a
//! time and resolves the symbol as soon as the accumulated code falls inside
//! the current length's range.

use crate::bitstream::BitStream;
use crate::error::{Error, Result};

/// Upper bound on the number of symbols a tree can hold
pub const MAXIMUM_NUMBER_OF_SYMBOLS: usize = 1024;
/// Upper bound on the code size in bits
pub const MAXIMUM_CODE_SIZE: u8 = 32;

/// Canonical Huffman tree built from a code-length array
#[derive(Debug)]
pub struct HuffmanTree {
    symbols: Vec<u16>,
    code_size_counts: Vec<u32>,
    maximum_code_size: u8,
}

impl HuffmanTree {
    /// Builds a tree from `code_sizes`, where `code_sizes[symbol]` is the
    /// code length in bits and 0 marks an absent symbol.
    ///
    /// Returns `Ok(None)` when every length is zero (an empty tree).
    pub fn build(code_sizes: &[u8], maximum_code_size: u8) -> Result<Option<Self>> {
        if code_sizes.len() > MAXIMUM_NUMBER_OF_SYMBOLS {
            return Err(Error::InvalidArgument {
                reason: "too many Huffman symbols",
            });
        }
        if maximum_code_size == 0 || maximum_code_size > MAXIMUM_CODE_SIZE {
            return Err(Error::InvalidArgument {
                reason: "Huffman maximum code size out of range",
            });
        }
        let mut code_size_counts = vec![0u32; maximum_code_size as usize + 1];
        for &code_size in code_sizes {
            if code_size > maximum_code_size {
                return Err(Error::OutOfBounds {
                    what: "Huffman code size exceeds maximum",
                });
            }
            code_size_counts[code_size as usize] += 1;
        }
        if code_size_counts[0] as usize == code_sizes.len() {
            return Ok(None);
        }
        // An over-subscribed set of lengths cannot form a prefix code.
        let mut left: i64 = 1;
        for bit_index in 1..=maximum_code_size as usize {
            left = (left << 1) - code_size_counts[bit_index] as i64;
            if left < 0 {
                return Err(Error::Malformed {
                    what: "over-subscribed Huffman code sizes",
                });
            }
        }
        let mut symbol_offsets = vec![0usize; maximum_code_size as usize + 2];
        for bit_index in 1..maximum_code_size as usize {
            symbol_offsets[bit_index + 1] =
                symbol_offsets[bit_index] + code_size_counts[bit_index] as usize;
        }
        let mut symbols = vec![0u16; code_sizes.len()];
        for (symbol, &code_size) in code_sizes.iter().enumerate() {
            if code_size == 0 {
                continue;
            }
            symbols[symbol_offsets[code_size as usize]] = symbol as u16;
            symbol_offsets[code_size as usize] += 1;
        }
        Ok(Some(Self {
            symbols,
            code_size_counts,
            maximum_code_size,
        }))
    }

    /// Reads one Huffman-coded symbol from the bit stream
    pub fn read_symbol(&self, bit_stream: &mut BitStream<'_>) -> Result<u16> {
        let mut code: u32 = 0;
        let mut first_code: u32 = 0;
        let mut first_index: u32 = 0;

        for bit_index in 1..=self.maximum_code_size as usize {
            code = (code << 1) | bit_stream.get_value(1)?;

            let count = self.code_size_counts[bit_index];
            if (code as i64 - count as i64) < first_code as i64 {
                let symbol_index = first_index + (code - first_code);
                return Ok(self.symbols[symbol_index as usize]);
            }
            first_code = (first_code + count) << 1;
            first_index += count;
        }
        Err(Error::OutOfBounds {
            what: "unresolvable Huffman code",
        })
    }
}
