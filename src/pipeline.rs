//! The parallel compression pipeline.
//!
//! Three kinds of thread cooperate over bounded channels:
//!
//! - one reader, slicing the input into numbered blocks;
//! - `num_workers` workers, each compressing blocks as they arrive;
//! - one writer (the calling thread), restoring sequence order, folding each
//!   block's raw bytes into the running CRC-32, and emitting the member.
//!
//! Workers finish out of order; the writer parks early arrivals in a min-heap
//! keyed by sequence number and only writes the block it is waiting for. The
//! channels are bounded at twice the worker count, which caps the blocks in
//! flight and stalls the reader when the writer falls behind.
//!
//! The reader publishes the final sequence number when it hits end of input.
//! A worker holding that block may have compressed it before the publication
//! and sync-flushed it like any middle block; the writer repairs this by
//! appending an empty final deflate block before the trailer.
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use bytes::{Bytes, BytesMut};
use flate2::{Compress, Compression, Crc};
use flume::{bounded, Receiver, Sender};

use crate::deflate::{self, EMPTY_FINAL_BLOCK};
use crate::gz::{self, SourceMeta};
use crate::{ParGzError, DEFAULT_BLOCK_SIZE, DEFAULT_COMPRESSION_LEVEL};

/// A numbered slice of the input. Sequence numbers start at 1.
#[derive(Debug)]
struct Block {
    seq: u64,
    raw: Bytes,
}

/// A compressed block queued for ordered write-out.
///
/// The raw bytes ride along because the running CRC-32 is computed over
/// uncompressed data, and that has to happen in sequence order, which only
/// the writer sees.
#[derive(Debug)]
struct CompressedBlock {
    seq: u64,
    compressed: Vec<u8>,
    raw: Bytes,
    is_last: bool,
}

// Heap ordering is by sequence number alone.
impl PartialEq for CompressedBlock {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for CompressedBlock {}

impl PartialOrd for CompressedBlock {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CompressedBlock {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

/// Sequence number of the final block, published exactly once by the reader.
///
/// `None` until end of input has been seen; `Some(0)` for an empty input.
#[derive(Debug, Default)]
struct LastSeq(Mutex<Option<u64>>);

impl LastSeq {
    fn publish(&self, seq: u64) {
        *self.0.lock().unwrap() = Some(seq);
    }

    fn get(&self) -> Option<u64> {
        *self.0.lock().unwrap()
    }
}

/// Single-shot error slot shared by all stages. The first error wins; later
/// ones are dropped.
#[derive(Debug, Default)]
struct ErrorSlot(Mutex<Option<ParGzError>>);

impl ErrorSlot {
    fn record(&self, err: ParGzError) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(&self) -> Option<ParGzError> {
        self.0.lock().unwrap().take()
    }
}

/// The [`ParGz`] builder.
#[derive(Debug)]
pub struct ParGzBuilder {
    /// The compression level of the output, 1 is fastest, 9 is best.
    compression_level: u32,
    /// Bytes of uncompressed input per block.
    block_size: usize,
    /// The number of compression workers. Defaults to all available cores.
    num_workers: usize,
}

impl ParGzBuilder {
    /// Create a new [`ParGzBuilder`] object.
    pub fn new() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            block_size: DEFAULT_BLOCK_SIZE,
            num_workers: num_cpus::get(),
        }
    }

    /// Set the [`compression_level`](ParGzBuilder.compression_level).
    ///
    /// # Errors
    /// - [`ParGzError::CompressionLevel`] if the level is outside `1..=9`.
    pub fn compression_level(mut self, compression_level: u32) -> Result<Self, ParGzError> {
        if !(1..=9).contains(&compression_level) {
            return Err(ParGzError::CompressionLevel(compression_level));
        }
        self.compression_level = compression_level;
        Ok(self)
    }

    /// Set the [`block_size`](ParGzBuilder.block_size).
    ///
    /// # Errors
    /// - [`ParGzError::BlockSize`] if the size is 0.
    pub fn block_size(mut self, block_size: usize) -> Result<Self, ParGzError> {
        if block_size == 0 {
            return Err(ParGzError::BlockSize(block_size));
        }
        self.block_size = block_size;
        Ok(self)
    }

    /// Set the [`num_workers`](ParGzBuilder.num_workers) that will be used
    /// for compression.
    ///
    /// One reader thread is spun up in addition; the calling thread acts as
    /// the writer.
    ///
    /// # Errors
    /// - [`ParGzError::NumWorkers`] if 0 workers are selected.
    pub fn num_workers(mut self, num_workers: usize) -> Result<Self, ParGzError> {
        if num_workers == 0 {
            return Err(ParGzError::NumWorkers(num_workers));
        }
        self.num_workers = num_workers;
        Ok(self)
    }

    /// Create a configured [`ParGz`] object.
    pub fn build(self) -> ParGz {
        ParGz {
            compression_level: Compression::new(self.compression_level),
            block_size: self.block_size,
            num_workers: self.num_workers,
        }
    }
}

impl Default for ParGzBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A parallel gzip compressor. Cheap to build and reusable across inputs.
#[derive(Debug)]
pub struct ParGz {
    compression_level: Compression,
    block_size: usize,
    num_workers: usize,
}

impl ParGz {
    /// Create a builder to configure a [`ParGz`].
    pub fn builder() -> ParGzBuilder {
        ParGzBuilder::new()
    }

    /// Compress `input` into `output` as a single gzip member.
    ///
    /// Blocks until the trailer has been written and `output` flushed, so a
    /// successful return means the member is complete on the sink.
    ///
    /// # Errors
    /// - [`ParGzError::InputRead`] / [`ParGzError::OutputWrite`] on I/O failure
    /// - [`ParGzError::Compression`] if the deflate encoder fails
    ///
    /// On any error the pipeline shuts down cooperatively and the partial
    /// output is not a valid member; cleanup of the sink is the caller's
    /// business.
    pub fn compress<R, W>(&self, input: R, mut output: W, meta: SourceMeta) -> Result<(), ParGzError>
    where
        R: Read + Send,
        W: Write,
    {
        output
            .write_all(&gz::member_header(self.compression_level, &meta))
            .map_err(ParGzError::OutputWrite)?;

        let (tx_work, rx_work) = bounded::<Block>(self.num_workers * 2);
        let (tx_done, rx_done) = bounded::<CompressedBlock>(self.num_workers * 2);
        let last_seq = &LastSeq::default();
        let errors = &ErrorSlot::default();
        let block_size = self.block_size;
        let compression_level = self.compression_level;

        let written = thread::scope(|scope| {
            scope.spawn(move || read_blocks(input, block_size, tx_work, last_seq, errors));
            for _ in 0..self.num_workers {
                let rx = rx_work.clone();
                let tx = tx_done.clone();
                scope.spawn(move || compress_blocks(rx, tx, compression_level, last_seq, errors));
            }
            drop(rx_work);
            drop(tx_done);
            write_blocks(&mut output, rx_done, last_seq)
        });

        if let Some(err) = errors.take() {
            return Err(err);
        }
        written?;
        output.flush().map_err(ParGzError::OutputWrite)
    }

    /// Compress the file at `path` into a sibling `<path>.gz`, returning the
    /// path written.
    ///
    /// The member header records the file's name and mtime. The input file is
    /// left in place.
    ///
    /// # Errors
    /// - [`ParGzError::InputRead`] if the file can not be opened (directories
    ///   included), plus everything [`compress`](ParGz::compress) can return.
    pub fn compress_path<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf, ParGzError> {
        let path = path.as_ref();
        let meta = SourceMeta::for_path(path);
        let input = BufReader::new(File::open(path).map_err(ParGzError::InputRead)?);

        let mut gz_path = path.as_os_str().to_os_string();
        gz_path.push(".gz");
        let gz_path = PathBuf::from(gz_path);
        let output = BufWriter::new(File::create(&gz_path).map_err(ParGzError::OutputWrite)?);

        self.compress(input, output, meta)?;
        Ok(gz_path)
    }
}

/// Reader stage: slice the input into numbered blocks and publish the final
/// sequence number once end of input is seen.
fn read_blocks<R: Read>(
    mut input: R,
    block_size: usize,
    work: Sender<Block>,
    last_seq: &LastSeq,
    errors: &ErrorSlot,
) {
    let mut seq = 0;
    loop {
        let raw = match read_block(&mut input, block_size) {
            Ok(raw) => raw,
            Err(err) => {
                errors.record(ParGzError::InputRead(err));
                return;
            }
        };
        if raw.is_empty() {
            last_seq.publish(seq);
            return;
        }
        seq += 1;
        if work.send(Block { seq, raw }).is_err() {
            // Workers only hang up after a failure elsewhere; that error is
            // already in the slot.
            return;
        }
    }
}

/// Read up to `block_size` bytes, short only at end of input.
fn read_block<R: Read>(input: &mut R, block_size: usize) -> io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(block_size);
    let mut filled = 0;
    while filled < block_size {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    buf.truncate(filled);
    Ok(buf.freeze())
}

/// Worker stage: compress blocks as they arrive, flagging the block the
/// reader has marked final.
fn compress_blocks(
    work: Receiver<Block>,
    done: Sender<CompressedBlock>,
    compression_level: Compression,
    last_seq: &LastSeq,
    errors: &ErrorSlot,
) {
    let mut encoder = Compress::new(compression_level, false);
    while let Ok(Block { seq, raw }) = work.recv() {
        // The final sequence number is only published once the reader hits
        // end of input, so the true last block can race past this check and
        // get sync-flushed; the writer repairs the stream termination.
        let is_last = last_seq.get() == Some(seq);
        let compressed = match deflate::compress_block(&raw, &mut encoder, is_last) {
            Ok(compressed) => compressed,
            Err(err) => {
                errors.record(err);
                return;
            }
        };
        let block = CompressedBlock {
            seq,
            compressed,
            raw,
            is_last,
        };
        if done.send(block).is_err() {
            return;
        }
    }
}

/// Writer stage: restore sequence order, fold each block's raw bytes into the
/// running checksum, write its compressed bytes, and terminate the member.
fn write_blocks<W: Write>(
    output: &mut W,
    done: Receiver<CompressedBlock>,
    last_seq: &LastSeq,
) -> Result<(), ParGzError> {
    let mut pending: BinaryHeap<Reverse<CompressedBlock>> = BinaryHeap::new();
    let mut next_seq: u64 = 1;
    let mut crc = Crc::new();
    let mut input_size: u64 = 0;

    while let Ok(block) = done.recv() {
        pending.push(Reverse(block));
        while pending
            .peek()
            .map_or(false, |Reverse(block)| block.seq == next_seq)
        {
            let Reverse(block) = pending.pop().unwrap();
            crc.update(&block.raw);
            input_size += block.raw.len() as u64;
            output
                .write_all(&block.compressed)
                .map_err(ParGzError::OutputWrite)?;

            if last_seq.get() == Some(block.seq) {
                if !block.is_last {
                    // The worker compressed this block before the reader
                    // published the final sequence number, so it ends in a
                    // sync flush; terminate the stream explicitly.
                    output
                        .write_all(&EMPTY_FINAL_BLOCK)
                        .map_err(ParGzError::OutputWrite)?;
                }
                return write_trailer(output, &crc, input_size);
            }
            next_seq += 1;
        }
    }

    // Every sender has hung up. Either the input was empty, or the final
    // block went through before the reader published its number, or a stage
    // failed and the member can not be completed.
    match last_seq.get() {
        Some(last) if next_seq == last + 1 => {
            output
                .write_all(&EMPTY_FINAL_BLOCK)
                .map_err(ParGzError::OutputWrite)?;
            write_trailer(output, &crc, input_size)
        }
        _ => Err(ParGzError::Disconnected),
    }
}

fn write_trailer<W: Write>(output: &mut W, crc: &Crc, input_size: u64) -> Result<(), ParGzError> {
    output
        .write_all(&gz::member_trailer(crc.sum(), input_size))
        .map_err(ParGzError::OutputWrite)
}
