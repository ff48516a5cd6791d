//! Parallel gzip compression.
//!
//! This crate compresses a byte source into a single gzip (RFC 1952) member
//! by splitting the input into fixed-size blocks, compressing the blocks
//! independently on a pool of worker threads, and stitching the results back
//! together in input order. This is the same trick
//! [`pigz`](https://zlib.net/pigz/) uses: every block except the last ends in
//! a sync flush, which leaves the deflate stream byte-aligned and resumable,
//! so the concatenation of the per-block streams is itself one valid deflate
//! stream. Any stock gzip decoder can read the output.
//!
//! Throughput scales with cores while the output stays a plain `.gz` file.
//! The cost is a few bytes of flush overhead per block and slightly worse
//! compression than single-stream gzip, since blocks share no dictionary.
//!
//! # Examples
//!
//! ```
//! use pargz::{ParGz, SourceMeta};
//!
//! let mut output = Vec::new();
//! let par_gz = ParGz::builder().build();
//! par_gz
//!     .compress(&b"This is a first test line\n"[..], &mut output, SourceMeta::default())
//!     .unwrap();
//! assert_eq!(&output[..2], &[0x1f, 0x8b]);
//! ```
//!
//! Compressing a file on disk records its name and mtime in the member
//! header and writes `<path>.gz` next to it:
//!
//! ```no_run
//! use pargz::ParGz;
//!
//! let gz_path = ParGz::builder().build().compress_path("big.log").unwrap();
//! assert_eq!(gz_path.file_name().unwrap(), "big.log.gz");
//! ```
//!
//! # References
//!
//! - [pigz](https://zlib.net/pigz/)
//! - [RFC 1952](https://datatracker.ietf.org/doc/html/rfc1952)
use std::io;

use thiserror::Error;

mod deflate;
mod gz;
mod pipeline;

pub use crate::gz::SourceMeta;
pub use crate::pipeline::{ParGz, ParGzBuilder};

/// Default block size, 128 000 bytes of uncompressed input per block.
pub const DEFAULT_BLOCK_SIZE: usize = 128_000;

/// Default compression level, 9 is slowest and best.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

#[derive(Error, Debug)]
pub enum ParGzError {
    #[error("compression level {0} is outside 1-9")]
    CompressionLevel(u32),
    #[error("block size must be at least 1 byte, got {0}")]
    BlockSize(usize),
    #[error("at least 1 worker is required, got {0}")]
    NumWorkers(usize),
    #[error("failed to read input")]
    InputRead(#[source] io::Error),
    #[error("failed to write output")]
    OutputWrite(#[source] io::Error),
    #[error(transparent)]
    Compression(#[from] flate2::CompressError),
    #[error("pipeline stage hung up before the final block")]
    Disconnected,
}
