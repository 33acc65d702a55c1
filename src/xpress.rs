//! XPRESS Huffman decompressor
//!
//! The variant used by system compression: a single canonical Huffman code
//! over a 512-symbol alphabet (256 literals plus 256 match headers), whose
//! codeword lengths are transmitted as packed nibbles ahead of the
//! entropy-coded body.

use crate::bitstream::Bitstream;
use crate::huffman::DecodeTable;
use crate::lz::lz_copy;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

/// Alphabet size: 256 literals + 256 match headers
const NUM_SYMS: usize = 512;
/// Bits resolved by the direct decode table
const TABLE_BITS: u32 = 12;
/// Longest allowed codeword
const MAX_CODEWORD_LEN: u32 = 15;
/// Shortest possible match
const MIN_MATCH_LEN: usize = 3;

/// A reusable XPRESS chunk decompressor
///
/// Holds the codeword length array and the decode table so that repeated
/// chunk decodes do not reallocate
pub struct XpressDecompressor {
    lens: [u8; NUM_SYMS],
    table: DecodeTable<NUM_SYMS, 5120>,
}

impl XpressDecompressor {
    pub fn new() -> Self {
        Self {
            lens: [0u8; NUM_SYMS],
            table: DecodeTable::new(TABLE_BITS, MAX_CODEWORD_LEN),
        }
    }

    /// Decompresses one XPRESS chunk into `out`, filling it exactly
    pub fn decompress(&mut self, compressed: &[u8], out: &mut [u8]) -> Result<(), std::io::Error> {
        let corrupt = |msg| Err(std::io::Error::new(std::io::ErrorKind::InvalidData, msg));

        // One nibble of codeword length per alphabet symbol
        if compressed.len() < NUM_SYMS / 2 {
            return corrupt("Truncated XPRESS chunk");
        }
        for (i, b) in compressed[0..(NUM_SYMS / 2)].iter().enumerate() {
            self.lens[i * 2] = b & 0xf;
            self.lens[i * 2 + 1] = b >> 4;
        }
        self.table.rebuild(&self.lens)?;

        let mut is = Bitstream::new(&compressed[(NUM_SYMS / 2)..]);
        let mut pos = 0usize;
        while pos < out.len() {
            let sym = usize::from(self.table.decode(&mut is));
            if sym < 256 {
                // Literal
                out[pos] = sym as u8;
                pos += 1;
                continue;
            }

            // Match: the header carries an offset slot and a length base
            let offset_bits = ((sym - 256) >> 4) as u32;
            let mut length = (sym - 256) & 0xf;
            is.ensure_bits(16);
            let offset = (1usize << offset_bits) | is.pop_bits(offset_bits) as usize;
            if length == 0xf {
                // Escaped length: one literal byte, then a full u16
                let b = is.read_byte();
                if b == 0xff {
                    length = usize::from(is.read_u16());
                } else {
                    length += usize::from(b);
                }
            }
            length += MIN_MATCH_LEN;

            if offset > pos {
                return corrupt("XPRESS match offset underflows the output");
            }
            if length > out.len() - pos {
                return corrupt("XPRESS match length overflows the output");
            }
            pos = lz_copy(out, pos, length, offset);
        }
        trace!("decoded XPRESS chunk of {} bytes", out.len());
        Ok(())
    }
}
