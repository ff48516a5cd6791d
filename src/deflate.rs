//! Raw deflate encoding of individual blocks.
//!
//! Each block starts from a fresh encoder state, so blocks share no
//! dictionary and can be compressed in any order. A non-final block ends in
//! a sync flush: the stream is left byte-aligned behind an empty stored
//! block (`00 00 FF FF`), so the next block's output can follow directly. The
//! final block ends in a finish flush, which sets BFINAL and terminates the
//! stream.
use flate2::{Compress, FlushCompress, Status};

use crate::ParGzError;

/// An empty final deflate block: BFINAL set, fixed Huffman codes, no symbols.
///
/// Appending it to a sync-flushed stream terminates the stream without
/// changing the decoded bytes.
pub(crate) const EMPTY_FINAL_BLOCK: [u8; 2] = [0x03, 0x00];

/// Fractional headroom on the output buffer so small or incompressible
/// blocks can spill past the input length and still flush in one call.
const SPILL: f64 = 0.1;

#[inline]
fn output_capacity(input_len: usize) -> usize {
    input_len + std::cmp::max(128, (input_len as f64 * SPILL) as usize)
}

/// Compress one block as raw deflate, sync-flushed unless `is_last`.
///
/// The encoder is reset afterwards, ready for the next block.
pub(crate) fn compress_block(
    input: &[u8],
    encoder: &mut Compress,
    is_last: bool,
) -> Result<Vec<u8>, ParGzError> {
    let flush = if is_last {
        FlushCompress::Finish
    } else {
        FlushCompress::Sync
    };
    let mut buffer = Vec::with_capacity(output_capacity(input.len()));
    loop {
        let consumed = encoder.total_in() as usize;
        let status = encoder.compress_vec(&input[consumed..], &mut buffer, flush)?;
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                // A sync flush is done once all input is consumed and the
                // encoder stopped short of the available output space.
                if !is_last
                    && encoder.total_in() as usize == input.len()
                    && buffer.len() < buffer.capacity()
                {
                    break;
                }
                buffer.reserve(std::cmp::max(128, buffer.len() / 2));
            }
        }
    }
    encoder.reset();
    Ok(buffer)
}

#[cfg(test)]
mod test {
    use flate2::{Compression, Decompress, FlushDecompress};

    use super::*;

    fn inflate_raw(input: &[u8]) -> Vec<u8> {
        let mut decoder = Decompress::new(false);
        let mut out = Vec::with_capacity(input.len() * 4 + 1024);
        loop {
            let consumed = decoder.total_in() as usize;
            let status = decoder
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Finish)
                .unwrap();
            match status {
                Status::StreamEnd => break,
                _ if decoder.total_in() as usize == input.len() && out.len() < out.capacity() => {
                    break
                }
                _ => out.reserve(out.capacity()),
            }
        }
        out
    }

    #[test]
    fn test_sync_flush_ends_with_stored_block_marker() {
        let mut encoder = Compress::new(Compression::new(6), false);
        let block = compress_block(b"some bytes worth compressing", &mut encoder, false).unwrap();
        assert_eq!(&block[block.len() - 4..], &[0x00, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn test_finish_terminates_stream() {
        let mut encoder = Compress::new(Compression::new(6), false);
        let block = compress_block(b"the last block", &mut encoder, true).unwrap();
        assert_eq!(inflate_raw(&block), b"the last block");
    }

    #[test]
    fn test_empty_last_block_round_trips() {
        let mut encoder = Compress::new(Compression::new(6), false);
        let block = compress_block(b"", &mut encoder, true).unwrap();
        assert!(inflate_raw(&block).is_empty());
    }

    #[test]
    fn test_blocks_concatenate_into_one_stream() {
        let mut encoder = Compress::new(Compression::new(6), false);
        let mut stream = compress_block(b"first block, ", &mut encoder, false).unwrap();
        stream.extend(compress_block(b"second block", &mut encoder, false).unwrap());
        stream.extend(EMPTY_FINAL_BLOCK);
        assert_eq!(inflate_raw(&stream), b"first block, second block");
    }

    #[test]
    fn test_encoder_reuse_has_no_dictionary_carry_over() {
        let mut fresh = Compress::new(Compression::new(6), false);
        let mut reused = Compress::new(Compression::new(6), false);
        compress_block(b"unrelated earlier data", &mut reused, false).unwrap();

        let a = compress_block(b"repeatable block", &mut fresh, true).unwrap();
        let b = compress_block(b"repeatable block", &mut reused, true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_incompressible_block_still_flushes() {
        // A pseudo-random block forces stored-block output larger than the input.
        let mut state = 0x2545_f491_4f6c_dd1d_u64;
        let input: Vec<u8> = (0..100_000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();
        let mut encoder = Compress::new(Compression::new(1), false);
        let block = compress_block(&input, &mut encoder, false).unwrap();
        assert_eq!(&block[block.len() - 4..], &[0x00, 0x00, 0xff, 0xff]);

        let mut stream = block;
        stream.extend(EMPTY_FINAL_BLOCK);
        assert_eq!(inflate_raw(&stream), input);
    }
}
