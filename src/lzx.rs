//! LZX decompressor (the 32 KiB-window WIM variant used by system
//! compression)
//!
//! Every chunk is an independent LZX stream: the recent-offsets queue and
//! the carried codeword lengths reset at each chunk, and the E8 call
//! translation of the CAB flavour does not exist here. A chunk holds one
//! or more blocks (verbatim, aligned-offset or uncompressed); the codeword
//! lengths of the main and length codes are themselves compressed with
//! per-run pre-codes and transmitted as mod-17 deltas against the previous
//! block's lengths.

use crate::bitstream::Bitstream;
use crate::huffman::DecodeTable;
use crate::lz::lz_copy;
use lazy_static::lazy_static;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

/// Number of literal symbols in the main alphabet
const NUM_CHARS: usize = 256;
/// Position slots for the 32 KiB window
const NUM_POSITION_SLOTS: usize = 30;
/// Main alphabet: literals plus 8 match headers per position slot
const MAINCODE_NUM_SYMS: usize = NUM_CHARS + 8 * NUM_POSITION_SLOTS;
/// Length alphabet
const LENCODE_NUM_SYMS: usize = 249;
/// Pre-code alphabet
const PRECODE_NUM_SYMS: usize = 20;
/// Aligned-offset alphabet
const ALIGNEDCODE_NUM_SYMS: usize = 8;

const MAINCODE_TABLE_BITS: u32 = 11;
const LENCODE_TABLE_BITS: u32 = 10;
const PRECODE_TABLE_BITS: u32 = 6;
const ALIGNEDCODE_TABLE_BITS: u32 = 7;

const MAX_MAIN_CODEWORD_LEN: u32 = 16;
const MAX_LEN_CODEWORD_LEN: u32 = 15;
const MAX_PRE_CODEWORD_LEN: u32 = 15;
const MAX_ALIGNED_CODEWORD_LEN: u32 = 7;

/// Shortest possible match
const MIN_MATCH_LEN: usize = 2;
/// Block size implied by the default-size flag (one whole chunk)
const DEFAULT_BLOCK_SIZE: usize = 32768;
/// Position slots 0..2 name entries of the recent-offsets queue
const NUM_RECENT_OFFSETS: usize = 3;

const BLOCKTYPE_VERBATIM: u32 = 1;
const BLOCKTYPE_ALIGNED: u32 = 2;
const BLOCKTYPE_UNCOMPRESSED: u32 = 3;

/// Extra offset bits carried by each position slot
const EXTRA_OFFSET_BITS: [u32; NUM_POSITION_SLOTS] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

lazy_static! {
    /// Base formatted offset of each position slot (the cumulative sums of
    /// the per-slot extra-bit ranges)
    static ref OFFSET_SLOT_BASE: [u32; NUM_POSITION_SLOTS] = {
        let mut base = [0u32; NUM_POSITION_SLOTS];
        let mut offset = 0u32;
        for (slot, v) in base.iter_mut().enumerate() {
            *v = offset;
            offset += 1 << EXTRA_OFFSET_BITS[slot];
        }
        base
    };
}

/// Applies a pre-code delta to a carried codeword length
#[inline]
fn delta_len(prev: u8, presym: u32) -> u8 {
    (i32::from(prev) - presym as i32).rem_euclid(17) as u8
}

/// A reusable LZX chunk decompressor
///
/// Owns the length arrays and decode tables of all four codes so that
/// repeated chunk decodes do not reallocate
pub struct LzxDecompressor {
    main_lens: [u8; MAINCODE_NUM_SYMS],
    len_lens: [u8; LENCODE_NUM_SYMS],
    precode_lens: [u8; PRECODE_NUM_SYMS],
    aligned_lens: [u8; ALIGNEDCODE_NUM_SYMS],
    main_table: DecodeTable<MAINCODE_NUM_SYMS, 3040>,
    len_table: DecodeTable<LENCODE_NUM_SYMS, 1522>,
    precode_table: DecodeTable<PRECODE_NUM_SYMS, 104>,
    aligned_table: DecodeTable<ALIGNEDCODE_NUM_SYMS, 144>,
}

impl LzxDecompressor {
    pub fn new() -> Self {
        Self {
            main_lens: [0u8; MAINCODE_NUM_SYMS],
            len_lens: [0u8; LENCODE_NUM_SYMS],
            precode_lens: [0u8; PRECODE_NUM_SYMS],
            aligned_lens: [0u8; ALIGNEDCODE_NUM_SYMS],
            main_table: DecodeTable::new(MAINCODE_TABLE_BITS, MAX_MAIN_CODEWORD_LEN),
            len_table: DecodeTable::new(LENCODE_TABLE_BITS, MAX_LEN_CODEWORD_LEN),
            precode_table: DecodeTable::new(PRECODE_TABLE_BITS, MAX_PRE_CODEWORD_LEN),
            aligned_table: DecodeTable::new(ALIGNEDCODE_TABLE_BITS, MAX_ALIGNED_CODEWORD_LEN),
        }
    }

    /// Reads one pre-code and the run of codeword lengths it compresses
    ///
    /// The lengths in `lens` are the ones carried over from the previous
    /// block (zeroes at chunk start); pre-code symbols 0..16 replace them
    /// with mod-17 deltas, 17 and 18 clear runs, 19 repeats a delta
    fn read_codeword_lens(
        precode_lens: &mut [u8; PRECODE_NUM_SYMS],
        precode_table: &mut DecodeTable<PRECODE_NUM_SYMS, 104>,
        is: &mut Bitstream,
        lens: &mut [u8],
    ) -> Result<(), std::io::Error> {
        for len in precode_lens.iter_mut() {
            *len = is.read_bits(4) as u8;
        }
        precode_table.rebuild(precode_lens)?;

        let mut i = 0usize;
        while i < lens.len() {
            let presym = u32::from(precode_table.decode(is));
            if presym < 17 {
                lens[i] = delta_len(lens[i], presym);
                i += 1;
                continue;
            }
            let (value, run) = match presym {
                17 => (0u8, 4 + is.read_bits(4) as usize),
                18 => (0u8, 20 + is.read_bits(5) as usize),
                _ => {
                    let run = 4 + is.read_bits(1) as usize;
                    let nested = u32::from(precode_table.decode(is));
                    (delta_len(lens[i], nested), run)
                }
            };
            if run > lens.len() - i {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "LZX codeword length run overflows its code",
                ));
            }
            lens[i..(i + run)].fill(value);
            i += run;
        }
        Ok(())
    }

    /// Decompresses one LZX chunk into `out`, filling it exactly
    pub fn decompress(&mut self, compressed: &[u8], out: &mut [u8]) -> Result<(), std::io::Error> {
        let corrupt = |msg| Err(std::io::Error::new(std::io::ErrorKind::InvalidData, msg));
        if out.len() > DEFAULT_BLOCK_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "LZX chunks cannot exceed the 32 KiB window",
            ));
        }

        // Codeword lengths and recent offsets start afresh on every chunk
        self.main_lens.fill(0);
        self.len_lens.fill(0);
        let mut recent_offsets = [1usize; NUM_RECENT_OFFSETS];

        let mut is = Bitstream::new(compressed);
        let mut pos = 0usize;
        while pos < out.len() {
            // Block type, then the size: one flag bit for the default
            // whole-chunk size, else an explicit 24-bit size
            is.ensure_bits(4);
            let block_type = is.pop_bits(3);
            let block_size = if is.pop_bits(1) != 0 {
                DEFAULT_BLOCK_SIZE
            } else {
                let high = is.read_bits(16) as usize;
                (high << 8) | is.read_bits(8) as usize
            };
            if block_size == 0 || block_size > out.len() - pos {
                return corrupt("LZX block size overflows the chunk");
            }
            let block_end = pos + block_size;
            trace!("LZX block type {} of {} bytes", block_type, block_size);

            match block_type {
                BLOCKTYPE_VERBATIM | BLOCKTYPE_ALIGNED => {
                    let aligned = block_type == BLOCKTYPE_ALIGNED;
                    if aligned {
                        for len in self.aligned_lens.iter_mut() {
                            *len = is.read_bits(3) as u8;
                        }
                        self.aligned_table.rebuild(&self.aligned_lens)?;
                    }
                    // The main code lengths arrive as two pre-code runs
                    // (literals, then match headers), the length code as a
                    // third; each run has its own pre-code
                    Self::read_codeword_lens(
                        &mut self.precode_lens,
                        &mut self.precode_table,
                        &mut is,
                        &mut self.main_lens[0..NUM_CHARS],
                    )?;
                    Self::read_codeword_lens(
                        &mut self.precode_lens,
                        &mut self.precode_table,
                        &mut is,
                        &mut self.main_lens[NUM_CHARS..],
                    )?;
                    Self::read_codeword_lens(
                        &mut self.precode_lens,
                        &mut self.precode_table,
                        &mut is,
                        &mut self.len_lens,
                    )?;
                    self.main_table.rebuild(&self.main_lens)?;
                    self.len_table.rebuild(&self.len_lens)?;

                    while pos < block_end {
                        let mainsym = usize::from(self.main_table.decode(&mut is));
                        if mainsym < NUM_CHARS {
                            // Literal
                            out[pos] = mainsym as u8;
                            pos += 1;
                            continue;
                        }

                        let match_hdr = mainsym - NUM_CHARS;
                        let mut length = match_hdr & 0x7;
                        if length == 0x7 {
                            length += usize::from(self.len_table.decode(&mut is));
                        }
                        length += MIN_MATCH_LEN;

                        let offset_slot = match_hdr >> 3;
                        let offset = if offset_slot < NUM_RECENT_OFFSETS {
                            // Repeat offset: swap with the queue front
                            let offset = recent_offsets[offset_slot];
                            recent_offsets[offset_slot] = recent_offsets[0];
                            offset
                        } else {
                            let extra_bits = EXTRA_OFFSET_BITS[offset_slot];
                            let mut formatted = OFFSET_SLOT_BASE[offset_slot] as usize;
                            if aligned && extra_bits >= 3 {
                                // The low three offset bits are themselves
                                // entropy coded
                                formatted +=
                                    (is.read_bits(extra_bits - 3) as usize) << 3;
                                formatted += usize::from(self.aligned_table.decode(&mut is));
                            } else {
                                formatted += is.read_bits(extra_bits) as usize;
                            }
                            recent_offsets[2] = recent_offsets[1];
                            recent_offsets[1] = recent_offsets[0];
                            formatted - 2
                        };
                        recent_offsets[0] = offset;

                        if offset > pos {
                            return corrupt("LZX match offset underflows the output");
                        }
                        if length > block_end - pos {
                            return corrupt("LZX match length overflows its block");
                        }
                        pos = lz_copy(out, pos, length, offset);
                    }
                }
                BLOCKTYPE_UNCOMPRESSED => {
                    // Realign on a coding unit; a stream that is already
                    // aligned skips a full unit instead
                    if is.bits_buffered() == 0 {
                        is.skip_bytes(2);
                    } else {
                        is.align();
                    }
                    for offset in recent_offsets.iter_mut() {
                        let v = is.read_u32() as usize;
                        if v == 0 {
                            return corrupt("Zero recent offset in uncompressed LZX block");
                        }
                        *offset = v;
                    }
                    if is.read_bytes(&mut out[pos..block_end]).is_none() {
                        return corrupt("Truncated uncompressed LZX block");
                    }
                    pos = block_end;
                    // Uncompressed blocks are padded to an even length
                    if block_size % 2 != 0 {
                        is.read_byte();
                    }
                }
                _ => return corrupt("Invalid LZX block type"),
            }
        }
        trace!("decoded LZX chunk of {} bytes", out.len());
        Ok(())
    }
}
