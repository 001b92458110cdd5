// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! DEFLATE (RFC 1951) decompression with the zlib (RFC 1950) wrapper.
//!
//! One metadata region in the encrypted metadata is stored zlib-compressed;
//! this decoder exists for that blob alone and only decompresses. The
//! trailing Adler-32 is always verified against the produced output.

use crate::bitstream::{BitStream, StorageOrder};
use crate::error::{Error, Result};
use crate::huffman::HuffmanTree;

/// Largest window size the zlib header may announce
const MAXIMUM_WINDOW_SIZE: u32 = 32768;

/// Literal/length alphabet size
const NUMBER_OF_LITERAL_CODES: usize = 288;
/// Distance alphabet size
const NUMBER_OF_DISTANCE_CODES: usize = 30;

/// Base lengths for codes 257..=285 (and the 258 terminator quirk)
const LITERAL_CODE_BASES: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];

const LITERAL_CODE_EXTRA_BITS: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];

const DISTANCE_CODE_BASES: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];

const DISTANCE_CODE_EXTRA_BITS: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

/// Order in which the code-length-code lengths are stored
const CODE_SIZES_PERMUTATION: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

/// Computes the Adler-32 of `data` starting from `initial_value`.
///
/// Uses the 5552-byte deferred-modulo form; the result matches the
/// definitional byte-at-a-time computation.
pub fn adler32(data: &[u8], initial_value: u32) -> u32 {
    const MODULO: u32 = 65521;
    const BLOCK: usize = 5552;

    let mut lower = initial_value & 0xffff;
    let mut upper = (initial_value >> 16) & 0xffff;

    for chunk in data.chunks(BLOCK) {
        for &byte in chunk {
            lower += byte as u32;
            upper += lower;
        }
        lower %= MODULO;
        upper %= MODULO;
    }
    (upper << 16) | lower
}

/// Decompresses a zlib stream, verifying the header and the trailing
/// Adler-32. `maximum_uncompressed_size` bounds the output allocation.
pub fn decompress_zlib(compressed: &[u8], maximum_uncompressed_size: usize) -> Result<Vec<u8>> {
    if compressed.len() < 6 {
        return Err(Error::Malformed {
            what: "zlib stream shorter than header and checksum",
        });
    }
    let cmf = compressed[0];
    let flg = compressed[1];
    if cmf & 0x0f != 8 {
        return Err(Error::Unsupported {
            what: "zlib compression method",
        });
    }
    let window_size = 1u32 << (((cmf >> 4) as u32) + 8);
    if window_size > MAXIMUM_WINDOW_SIZE {
        return Err(Error::Unsupported {
            what: "zlib window size",
        });
    }
    let mut body = &compressed[2..];
    if flg & 0x20 != 0 {
        // Preset dictionary identifier; the format never uses one.
        if body.len() < 4 {
            return Err(Error::Malformed {
                what: "truncated zlib dictionary identifier",
            });
        }
        body = &body[4..];
    }
    if body.len() < 4 {
        return Err(Error::Malformed {
            what: "zlib stream missing Adler-32",
        });
    }
    let (deflate_data, trailer) = body.split_at(body.len() - 4);
    let stored_checksum = u32::from_be_bytes(trailer.try_into().expect("4-byte trailer"));

    let uncompressed = decompress_deflate(deflate_data, maximum_uncompressed_size)?;

    let computed_checksum = adler32(&uncompressed, 1);
    if computed_checksum != stored_checksum {
        return Err(Error::ChecksumMismatch {
            what: "zlib Adler-32",
            stored: stored_checksum,
            computed: computed_checksum,
        });
    }
    Ok(uncompressed)
}

/// Decompresses a raw DEFLATE stream
pub fn decompress_deflate(compressed: &[u8], maximum_uncompressed_size: usize) -> Result<Vec<u8>> {
    let mut bit_stream = BitStream::new(compressed, StorageOrder::ByteBackToFront);
    let mut output: Vec<u8> = Vec::new();
    let mut fixed_trees: Option<(HuffmanTree, HuffmanTree)> = None;

    loop {
        let last_block = bit_stream.get_value(1)? != 0;
        let block_type = bit_stream.get_value(2)?;

        match block_type {
            0 => read_stored_block(&mut bit_stream, &mut output, maximum_uncompressed_size)?,
            1 => {
                let (literal_tree, distance_tree) =
                    fixed_trees.get_or_insert_with(build_fixed_trees);
                read_compressed_block(
                    &mut bit_stream,
                    literal_tree,
                    Some(&*distance_tree),
                    &mut output,
                    maximum_uncompressed_size,
                )?;
            }
            2 => {
                let (literal_tree, distance_tree) = read_dynamic_trees(&mut bit_stream)?;
                read_compressed_block(
                    &mut bit_stream,
                    &literal_tree,
                    distance_tree.as_ref(),
                    &mut output,
                    maximum_uncompressed_size,
                )?;
            }
            _ => {
                return Err(Error::Malformed {
                    what: "reserved DEFLATE block type",
                });
            }
        }
        if last_block {
            break;
        }
    }
    Ok(output)
}

fn read_stored_block(
    bit_stream: &mut BitStream<'_>,
    output: &mut Vec<u8>,
    maximum_uncompressed_size: usize,
) -> Result<()> {
    bit_stream.align_to_byte();

    let value = bit_stream.get_value(32)?;
    let length = (value & 0xffff) as usize;
    let complement = (value >> 16) as u16;
    if length as u16 != !complement {
        return Err(Error::Malformed {
            what: "stored block length complement",
        });
    }
    if output.len() + length > maximum_uncompressed_size {
        return Err(Error::OutOfBounds {
            what: "stored block exceeds uncompressed size limit",
        });
    }
    output.extend_from_slice(bit_stream.read_bytes(length)?);
    Ok(())
}

fn build_fixed_trees() -> (HuffmanTree, HuffmanTree) {
    let mut literal_sizes = [0u8; NUMBER_OF_LITERAL_CODES];
    for (symbol, size) in literal_sizes.iter_mut().enumerate() {
        *size = match symbol {
            0..=143 => 8,
            144..=255 => 9,
            256..=279 => 7,
            _ => 8,
        };
    }
    let distance_sizes = [5u8; NUMBER_OF_DISTANCE_CODES];

    let literal_tree = HuffmanTree::build(&literal_sizes, 15)
        .expect("fixed literal lengths form a prefix code")
        .expect("fixed literal tree is never empty");
    let distance_tree = HuffmanTree::build(&distance_sizes, 15)
        .expect("fixed distance lengths form a prefix code")
        .expect("fixed distance tree is never empty");
    (literal_tree, distance_tree)
}

fn read_dynamic_trees(
    bit_stream: &mut BitStream<'_>,
) -> Result<(HuffmanTree, Option<HuffmanTree>)> {
    let number_of_literal_codes = bit_stream.get_value(5)? as usize + 257;
    let number_of_distance_codes = bit_stream.get_value(5)? as usize + 1;
    let number_of_code_sizes = bit_stream.get_value(4)? as usize + 4;

    if number_of_literal_codes > NUMBER_OF_LITERAL_CODES {
        return Err(Error::Malformed {
            what: "dynamic block literal code count",
        });
    }
    if number_of_distance_codes > NUMBER_OF_DISTANCE_CODES + 2 {
        return Err(Error::Malformed {
            what: "dynamic block distance code count",
        });
    }
    let mut code_size_sizes = [0u8; 19];
    for &position in CODE_SIZES_PERMUTATION.iter().take(number_of_code_sizes) {
        code_size_sizes[position] = bit_stream.get_value(3)? as u8;
    }
    let code_sizes_tree = HuffmanTree::build(&code_size_sizes, 7)?.ok_or(Error::Malformed {
        what: "empty code-sizes tree",
    })?;

    let total_codes = number_of_literal_codes + number_of_distance_codes;
    let mut code_sizes = vec![0u8; total_codes];
    let mut index = 0;
    while index < total_codes {
        let symbol = code_sizes_tree.read_symbol(bit_stream)?;
        match symbol {
            0..=15 => {
                code_sizes[index] = symbol as u8;
                index += 1;
            }
            16 => {
                if index == 0 {
                    return Err(Error::Malformed {
                        what: "code-size repeat with no previous length",
                    });
                }
                let previous = code_sizes[index - 1];
                let repeat = bit_stream.get_value(2)? as usize + 3;
                if index + repeat > total_codes {
                    return Err(Error::Malformed {
                        what: "code-size repeat overruns the table",
                    });
                }
                code_sizes[index..index + repeat].fill(previous);
                index += repeat;
            }
            17 | 18 => {
                let repeat = if symbol == 17 {
                    bit_stream.get_value(3)? as usize + 3
                } else {
                    bit_stream.get_value(7)? as usize + 11
                };
                if index + repeat > total_codes {
                    return Err(Error::Malformed {
                        what: "zero-length run overruns the table",
                    });
                }
                index += repeat;
            }
            _ => {
                return Err(Error::Malformed {
                    what: "code-sizes alphabet symbol",
                });
            }
        }
    }
    let literal_tree = HuffmanTree::build(&code_sizes[..number_of_literal_codes], 15)?.ok_or(
        Error::Malformed {
            what: "empty literal tree",
        },
    )?;
    // A literal-only block may carry an all-zero distance table.
    let distance_tree = HuffmanTree::build(&code_sizes[number_of_literal_codes..], 15)?;
    Ok((literal_tree, distance_tree))
}

fn read_compressed_block(
    bit_stream: &mut BitStream<'_>,
    literal_tree: &HuffmanTree,
    distance_tree: Option<&HuffmanTree>,
    output: &mut Vec<u8>,
    maximum_uncompressed_size: usize,
) -> Result<()> {
    loop {
        let symbol = literal_tree.read_symbol(bit_stream)?;
        match symbol {
            0..=255 => {
                if output.len() >= maximum_uncompressed_size {
                    return Err(Error::OutOfBounds {
                        what: "literal exceeds uncompressed size limit",
                    });
                }
                output.push(symbol as u8);
            }
            256 => return Ok(()),
            257..=285 => {
                let code_index = symbol as usize - 257;
                let extra = bit_stream.get_value(LITERAL_CODE_EXTRA_BITS[code_index])?;
                let length = LITERAL_CODE_BASES[code_index] as usize + extra as usize;

                let distance_tree = distance_tree.ok_or(Error::Malformed {
                    what: "match in a block without distance codes",
                })?;
                let distance_symbol = distance_tree.read_symbol(bit_stream)? as usize;
                if distance_symbol >= NUMBER_OF_DISTANCE_CODES {
                    return Err(Error::Malformed {
                        what: "DEFLATE distance symbol",
                    });
                }
                let extra = bit_stream.get_value(DISTANCE_CODE_EXTRA_BITS[distance_symbol])?;
                let distance = DISTANCE_CODE_BASES[distance_symbol] as usize + extra as usize;

                if distance > output.len() {
                    return Err(Error::Malformed {
                        what: "DEFLATE distance before start of output",
                    });
                }
                if output.len() + length > maximum_uncompressed_size {
                    return Err(Error::OutOfBounds {
                        what: "match exceeds uncompressed size limit",
                    });
                }
                // Matches may overlap their own output; copy byte-wise.
                let start = output.len() - distance;
                for offset in 0..length {
                    let byte = output[start + offset];
                    output.push(byte);
                }
            }
            _ => {
                return Err(Error::Malformed {
                    what: "DEFLATE literal symbol",
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn zlib_compress(data: &[u8], level: Compression) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), level);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test_log::test]
    fn adler32_definition() {
        // "Wikipedia" is the classic known-answer input.
        assert_eq!(adler32(b"Wikipedia", 1), 0x11e60398);
        assert_eq!(adler32(&[], 1), 1);
    }

    #[test_log::test]
    fn adler32_deferred_modulo_matches_definition() {
        let mut rng = XorShift(0x9e3779b97f4a7c15);
        let data: Vec<u8> = (0..20000).map(|_| rng.next() as u8).collect();

        let mut lower = 1u32;
        let mut upper = 0u32;
        for &byte in &data {
            lower = (lower + byte as u32) % 65521;
            upper = (upper + lower) % 65521;
        }
        assert_eq!(adler32(&data, 1), (upper << 16) | lower);
    }

    #[test_log::test]
    fn stored_blocks_round_trip() {
        let data = b"stored block payload, incompressible enough".to_vec();
        let compressed = zlib_compress(&data, Compression::none());
        assert_eq!(decompress_zlib(&compressed, 1 << 16).unwrap(), data);
    }

    #[test_log::test]
    fn fixed_and_dynamic_blocks_round_trip() {
        let repetitive: Vec<u8> = b"abcabcabcabc".iter().copied().cycle().take(4096).collect();
        for level in [Compression::fast(), Compression::best()] {
            let compressed = zlib_compress(&repetitive, level);
            assert_eq!(decompress_zlib(&compressed, 1 << 16).unwrap(), repetitive);
        }
    }

    #[test_log::test]
    fn corrupted_checksum_is_rejected() {
        let data = b"checksummed".to_vec();
        let mut compressed = zlib_compress(&data, Compression::default());
        let last = compressed.len() - 1;
        compressed[last] ^= 0x01;
        assert!(matches!(
            decompress_zlib(&compressed, 1 << 16),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test_log::test]
    fn reserved_block_type_is_rejected() {
        // BFINAL=1, BTYPE=3.
        assert!(matches!(
            decompress_deflate(&[0x07], 1 << 16),
            Err(Error::Malformed { .. })
        ));
    }

    #[test_log::test]
    fn bad_zlib_method_is_unsupported() {
        assert!(matches!(
            decompress_zlib(&[0x79, 0x9c, 0, 0, 0, 0], 1 << 16),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test_log::test]
    fn random_corpus_round_trips() {
        let mut rng = XorShift(0x2545f4914f6cdd1d);
        for round in 0..1000 {
            let length = (rng.next() % 65536) as usize;
            let data: Vec<u8> = if round % 3 == 0 {
                // Byte-repeat-heavy input exercises the match paths.
                (0..length).map(|_| (rng.next() % 7) as u8).collect()
            } else {
                (0..length).map(|_| rng.next() as u8).collect()
            };
            let compressed = zlib_compress(&data, Compression::default());
            let decompressed = decompress_zlib(&compressed, 65536).unwrap();
            assert_eq!(decompressed, data, "round {round} length {length}");
        }
    }
}
