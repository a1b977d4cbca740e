//! DEFLATE block codec and CRC-32 combination.
//!
//! Each file block is compressed through a fresh raw-deflate stream.
//! Interior blocks are terminated with a `Block` flush (an empty stored
//! block that ends on a byte boundary while leaving the stream open) and
//! the last block of a file with `Finish`, so the concatenation of the
//! per-block outputs is a single valid DEFLATE stream.

use flate2::{Compress, Compression, FlushCompress, Status};

use crate::error::{Result, ZipError};

/// Flush mode for [`BlockCompressor::compress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Keep buffering; more input for this block follows.
    None,
    /// End of an interior block: emit a sync flush.
    Block,
    /// End of the file's last block: seal the stream.
    Finish,
}

/// Worst-case compressed size for `len` input bytes, including the sync
/// flush marker. Mirrors the deflate bound formula.
pub fn deflate_bound(len: u64) -> usize {
    (len + (len >> 12) + (len >> 14) + (len >> 25) + 13 + 16) as usize
}

/// One raw-deflate stream (no zlib header, the ZIP wire format).
pub struct BlockCompressor {
    inner: Compress,
}

impl BlockCompressor {
    pub fn new(level: u32) -> Self {
        BlockCompressor {
            inner: Compress::new(Compression::new(level.min(9)), false),
        }
    }

    /// Consume all of `input`, appending compressed bytes to `out`.
    ///
    /// With `Flush::Block`/`Flush::Finish` the stream is flushed so that
    /// `out` ends on a block boundary; `out` grows as needed.
    pub fn compress(&mut self, input: &[u8], out: &mut Vec<u8>, flush: Flush) -> Result<()> {
        let mode = match flush {
            Flush::None => FlushCompress::None,
            Flush::Block => FlushCompress::Sync,
            Flush::Finish => FlushCompress::Finish,
        };

        let mut input = input;
        loop {
            if out.capacity() == out.len() {
                out.reserve(16 * 1024);
            }
            let before = self.inner.total_in();
            let status = self
                .inner
                .compress_vec(input, out, mode)
                .map_err(|e| ZipError::InvalidFormat(format!("deflate failed: {}", e)))?;
            let consumed = (self.inner.total_in() - before) as usize;
            input = &input[consumed..];

            match status {
                Status::StreamEnd => return Ok(()),
                Status::Ok | Status::BufError => {
                    if input.is_empty() {
                        match mode {
                            FlushCompress::None => return Ok(()),
                            // a flush is complete once deflate left spare
                            // output room instead of filling the buffer
                            _ if out.len() < out.capacity() => return Ok(()),
                            _ => {}
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CRC-32 combination
// ---------------------------------------------------------------------------

const CRC32_POLY_REFLECTED: u32 = 0xEDB8_8320;

fn gf2_matrix_times(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0u32;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for n in 0..32 {
        square[n] = gf2_matrix_times(mat, mat[n]);
    }
}

/// CRC of `A || B` from `crc(A)`, `crc(B)` and `|B|`, in O(log |B|).
///
/// Builds the GF(2) operator that advances a CRC register over one zero
/// byte, then applies its binary powers selected by the bits of `len2`.
pub fn crc32_combine(crc1: u32, crc2: u32, len2: u64) -> u32 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u32; 32]; // operator for 2^k zero bits, k even
    let mut odd = [0u32; 32]; // operator for 2^k zero bits, k odd

    // operator for one zero bit
    odd[0] = CRC32_POLY_REFLECTED;
    let mut row = 1u32;
    for entry in odd.iter_mut().skip(1) {
        *entry = row;
        row <<= 1;
    }
    gf2_matrix_square(&mut even, &odd); // two zero bits
    gf2_matrix_square(&mut odd, &even); // four zero bits

    let mut crc1 = crc1;
    let mut len2 = len2;
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}
