//! WOF system-compression decompressor
//!
//! Written from scratch, based on [MS-XCA] and the LZXD specification
//!
//! # Design goals and implementation #
//!
//! Windows "system compressed" files keep their data out of band: a WOF
//! reparse point names the compression algorithm and the original file
//! size, and a named alternate data stream holds a chunk-offset table
//! followed by the individually compressed chunks. This crate is the
//! decoding side of that scheme: given the algorithm, the original size
//! and random access to the raw stream, it serves arbitrary
//! `(position, count)` reads of the original file content.
//!
//! Locating the reparse point and the alternate data stream is the
//! caller's business; nothing here touches a filesystem.
//!
//! Two interfaces are provided:
//! - [`SystemDecompressionCtx`]: the random-access reader over a whole
//!   compressed stream
//! - [`xpress::XpressDecompressor`] and [`lzx::LzxDecompressor`]: one-shot
//!   decoders for a single compressed chunk
//!
//! Supported formats:
//! - XPRESS Huffman with 4, 8 or 16 KiB chunks
//! - LZX (the 32 KiB-window WIM variant, no E8 translation)
//!
//! # Examples #
//! ```no_run
//! use ctxwof::{CompressionFormat, SystemDecompressionCtx};
//!
//! let ads = std::fs::File::open("WofCompressedData").unwrap();
//! let format = CompressionFormat::from_wof_algorithm(0).unwrap();
//! let mut ctx = SystemDecompressionCtx::new(ads, format, 123456).unwrap();
//! let mut buf = vec![0u8; 4096];
//! let got = ctx.read(8192, &mut buf).unwrap();
//! assert!(got <= 4096);
//! ```

mod bitstream;
mod huffman;
mod lz;
pub mod lzx;
mod utils;
pub mod xpress;

use std::io::{Read, Seek, SeekFrom};
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};
use utils::{rdu32le, rdu64le};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The compression algorithm of a system-compressed file
///
/// Picked by Windows at compression time and recorded in the WOF reparse
/// data; the variant fixes both the chunk size and the chunk decoder
pub enum CompressionFormat {
    Xpress4K,
    Xpress8K,
    Xpress16K,
    Lzx32K,
}

impl CompressionFormat {
    /// Maps a FILE_PROVIDER compression code from the WOF reparse data
    ///
    /// Returns `None` for codes this crate cannot decode; that is not an
    /// error but "not a supported system-compressed file"
    pub fn from_wof_algorithm(algorithm: u32) -> Option<Self> {
        match algorithm {
            0 => Some(Self::Xpress4K),
            1 => Some(Self::Lzx32K),
            2 => Some(Self::Xpress8K),
            3 => Some(Self::Xpress16K),
            _ => None,
        }
    }

    /// The chunk size used by this format
    pub fn chunk_size(&self) -> u32 {
        match self {
            Self::Xpress4K => 4096,
            Self::Xpress8K => 8192,
            Self::Xpress16K => 16384,
            Self::Lzx32K => 32768,
        }
    }
}

#[derive(Debug)]
/// The chunk-offset table at the start of a compressed stream
///
/// Maps each logical chunk to the byte range of its compressed form.
/// Immutable once parsed
pub struct ChunkIndex {
    uncompressed_size: u64,
    chunk_size: u32,
    /// Absolute start positions of each chunk's compressed bytes, with the
    /// stream length appended as a sentinel (`num_chunks + 1` entries;
    /// empty for a zero-sized file)
    offsets: Vec<u64>,
}

impl ChunkIndex {
    /// Reads and validates the chunk-offset table
    ///
    /// The stored entries cover chunks 1 and up (the first chunk starts
    /// right after the table) and are relative to the end of the table;
    /// they are 4 bytes each, or 8 when the uncompressed size does not fit
    /// in 32 bits
    pub fn parse<R: Read + Seek>(
        r: &mut R,
        uncompressed_size: u64,
        chunk_size: u32,
    ) -> Result<Self, std::io::Error> {
        let corrupt = |msg| Err(std::io::Error::new(std::io::ErrorKind::InvalidData, msg));
        let stream_len = r.seek(SeekFrom::End(0))?;
        let num_chunks = uncompressed_size.div_euclid(u64::from(chunk_size))
            + u64::from(uncompressed_size % u64::from(chunk_size) != 0);
        if num_chunks == 0 {
            return Ok(Self {
                uncompressed_size,
                chunk_size,
                offsets: Vec::new(),
            });
        }

        let entry_size: u64 = if uncompressed_size > u64::from(u32::MAX) {
            8
        } else {
            4
        };
        let table_size = (num_chunks - 1) * entry_size;
        if table_size >= stream_len {
            return corrupt("Chunk offset table extends past the end of the stream");
        }
        debug!(
            "chunk offset table: {} chunks of {} bytes, {}-byte entries",
            num_chunks, chunk_size, entry_size
        );

        r.seek(SeekFrom::Start(0))?;
        let mut offsets: Vec<u64> = Vec::with_capacity(num_chunks as usize + 1);
        offsets.push(table_size);
        for _ in 1..num_chunks {
            let relative = if entry_size == 8 {
                rdu64le(r)?
            } else {
                u64::from(rdu32le(r)?)
            };
            match table_size.checked_add(relative) {
                Some(absolute) => offsets.push(absolute),
                None => return corrupt("Chunk offset overflow"),
            }
        }
        offsets.push(stream_len);
        if offsets.windows(2).any(|w| w[0] >= w[1]) {
            return corrupt("Chunk offsets are not monotonically increasing");
        }
        Ok(Self {
            uncompressed_size,
            chunk_size,
            offsets,
        })
    }

    /// Number of chunks in the stream
    pub fn num_chunks(&self) -> u64 {
        (self.offsets.len() as u64).saturating_sub(1)
    }

    /// Absolute chunk start positions plus the end-of-stream sentinel
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Byte range of the chunk's compressed form within the stream
    fn chunk_compressed_range(&self, chunk: u64) -> (u64, u64) {
        let start = self.offsets[chunk as usize];
        (start, self.offsets[chunk as usize + 1] - start)
    }

    /// Number of logical file bytes the chunk covers (the last chunk may
    /// fall short of the chunk size)
    fn chunk_logical_size(&self, chunk: u64) -> usize {
        let start = chunk * u64::from(self.chunk_size);
        (self.uncompressed_size - start).min(u64::from(self.chunk_size)) as usize
    }
}

/// The per-format chunk decoder
enum Decompressor {
    Xpress(Box<xpress::XpressDecompressor>),
    Lzx(Box<lzx::LzxDecompressor>),
}

/// Random-access reader over a system-compressed stream
///
/// Owns the chunk index, a buffer for raw compressed chunks and a cache
/// holding the most recently decoded chunk, so that sequential short reads
/// do not decode the same chunk over and over. Not meant for shared use:
/// every read may mutate the cache. Independent contexts over the same
/// stream are fine
pub struct SystemDecompressionCtx<R: Read + Seek> {
    r: R,
    index: ChunkIndex,
    decompressor: Decompressor,
    /// Raw bytes of the chunk being decoded
    temp: Vec<u8>,
    /// Most recently decoded chunk
    cache: Vec<u8>,
    /// Which chunk the cache holds, if any
    cached_chunk: Option<u64>,
}

impl<R: Read + Seek> SystemDecompressionCtx<R> {
    /// Creates the reader: parses the chunk-offset table and sets up the
    /// decoder for `format`
    pub fn new(
        mut r: R,
        format: CompressionFormat,
        uncompressed_size: u64,
    ) -> Result<Self, std::io::Error> {
        let index = ChunkIndex::parse(&mut r, uncompressed_size, format.chunk_size())?;
        let decompressor = match format {
            CompressionFormat::Lzx32K => Decompressor::Lzx(Box::new(lzx::LzxDecompressor::new())),
            _ => Decompressor::Xpress(Box::new(xpress::XpressDecompressor::new())),
        };
        Ok(Self {
            r,
            index,
            decompressor,
            temp: Vec::new(),
            cache: vec![0u8; format.chunk_size() as usize],
            cached_chunk: None,
        })
    }

    /// The uncompressed file size
    pub fn size(&self) -> u64 {
        self.index.uncompressed_size
    }

    /// Reads uncompressed file content from `pos` into `buf`, returning
    /// the number of bytes read
    ///
    /// Reads are clamped at the end of the file (a read at or past it
    /// returns 0). Any other shortfall is an error: a corrupt chunk or a
    /// failing raw reader fails the whole call, though the context remains
    /// usable for ranges not touching the bad chunk
    pub fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        if pos >= self.index.uncompressed_size || buf.is_empty() {
            return Ok(0);
        }
        let count = u64::min(buf.len() as u64, self.index.uncompressed_size - pos) as usize;
        let chunk_size = u64::from(self.index.chunk_size);

        let mut done = 0usize;
        while done < count {
            let p = pos + done as u64;
            let chunk = p / chunk_size;
            let offset_in_chunk = (p % chunk_size) as usize;
            let valid = self.load_chunk(chunk)?;
            let n = usize::min(valid - offset_in_chunk, count - done);
            buf[done..(done + n)]
                .copy_from_slice(&self.cache[offset_in_chunk..(offset_in_chunk + n)]);
            done += n;
        }
        Ok(done)
    }

    /// Makes sure the cache holds the decoded chunk, returning its
    /// logical size
    fn load_chunk(&mut self, chunk: u64) -> Result<usize, std::io::Error> {
        let logical_size = self.index.chunk_logical_size(chunk);
        if self.cached_chunk == Some(chunk) {
            return Ok(logical_size);
        }
        self.cached_chunk = None;

        let (start, compressed_size) = self.index.chunk_compressed_range(chunk);
        if compressed_size == 0 || compressed_size > logical_size as u64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Chunk {} has an invalid compressed size", chunk),
            ));
        }
        let compressed_size = compressed_size as usize;
        self.temp.resize(compressed_size, 0);
        self.r.seek(SeekFrom::Start(start))?;
        self.r.read_exact(&mut self.temp)?;

        if compressed_size == logical_size {
            // The chunk did not compress and is stored as is
            self.cache[0..logical_size].copy_from_slice(&self.temp);
        } else {
            match &mut self.decompressor {
                Decompressor::Xpress(d) => {
                    d.decompress(&self.temp, &mut self.cache[0..logical_size])?
                }
                Decompressor::Lzx(d) => {
                    d.decompress(&self.temp, &mut self.cache[0..logical_size])?
                }
            }
        }
        self.cached_chunk = Some(chunk);
        Ok(logical_size)
    }
}
