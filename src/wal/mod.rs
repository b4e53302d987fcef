//! Write-Ahead Logging (WAL) Module
//!
//! Implements the **durable**, **append-only** record log that mirrors
//! every memtable mutation, and doubles as the framing for the MANIFEST
//! descriptor file.
//!
//! # On-disk layout
//!
//! A log file is a sequence of 32 KiB blocks. Records are framed with a
//! 7-byte header and fragmented across block boundaries:
//!
//! ```text
//! [crc32_le (4 B)][length_le (2 B)][type (1 B)][payload ...]
//! ```
//!
//! - `crc32` covers the type byte and the payload.
//! - `length` is the payload byte count (fits in a block by construction).
//! - `type` is one of `Full`, `First`, `Middle`, `Last`; a record that
//!   fits in the current block is written as a single `Full` fragment,
//!   anything larger is `First`, zero or more `Middle`, then `Last`.
//!
//! When fewer than 7 bytes remain in a block, the tail is zero-padded and
//! the next fragment starts on the following block boundary. Readers rely
//! on this to resynchronize from any block.
//!
//! # Corruption handling
//!
//! The reader validates every checksum. A damaged fragment is reported
//! through the [`CorruptionReporter`] callback and the rest of its block is
//! skipped — replay continues at the next block, so one torn write never
//! hides later intact records. An `initial_offset` lets recovery resume at
//! a saved position.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};

use thiserror::Error;
use tracing::{trace, warn};

// ------------------------------------------------------------------------------------------------
// Format constants
// ------------------------------------------------------------------------------------------------

/// Size of a log block.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Fragment header: crc32 (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 7;

/// Physical fragment types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Reserved for preallocated (zeroed) regions; never written.
    Zero = 0,
    /// The whole record in one fragment.
    Full = 1,
    /// First fragment of a spanning record.
    First = 2,
    /// Interior fragment.
    Middle = 3,
    /// Final fragment of a spanning record.
    Last = 4,
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by log reading and writing.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Unrecoverable framing damage escalated by a caller's reporter.
    #[error("log corruption: {0}")]
    Corruption(String),
}

/// Receives notice of skipped bytes during replay.
///
/// Recovery installs a reporter that either logs and continues (default)
/// or records the damage as fatal (`paranoid_checks`).
pub trait CorruptionReporter: Send {
    /// `bytes` were dropped for `reason`.
    fn corruption(&mut self, bytes: usize, reason: &str);
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Appends framed records to a log file.
///
/// Writes are buffered; [`LogWriter::sync`] flushes and forces the file to
/// stable storage. One writer per file — the engine's writer queue (and
/// the version set for the MANIFEST) serialize access by ownership.
pub struct LogWriter {
    dest: BufWriter<File>,
    /// Byte offset within the current block.
    block_offset: usize,
}

impl LogWriter {
    /// Wrap a freshly created (empty) log file.
    pub fn new(file: File) -> Self {
        Self {
            dest: BufWriter::new(file),
            block_offset: 0,
        }
    }

    /// Append one logical record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, data: &[u8]) -> Result<(), WalError> {
        let mut remaining = data;
        let mut begin = true;
        loop {
            let block_left = BLOCK_SIZE - self.block_offset;
            if block_left < HEADER_SIZE {
                // Not even a header fits; zero-pad and open a new block.
                if block_left > 0 {
                    const ZEROES: [u8; HEADER_SIZE - 1] = [0; HEADER_SIZE - 1];
                    self.dest.write_all(&ZEROES[..block_left])?;
                }
                self.block_offset = 0;
            }

            let payload_room = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = remaining.len().min(payload_room);
            let end = fragment_len == remaining.len();

            let ty = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true) => RecordType::Last,
            };

            self.emit_physical_record(ty, &remaining[..fragment_len])?;
            remaining = &remaining[fragment_len..];
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    /// Flush buffered bytes and force them to stable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.dest.flush()?;
        self.dest.get_ref().sync_all()?;
        Ok(())
    }

    /// Flush buffered bytes to the OS without an fsync.
    pub fn flush(&mut self) -> Result<(), WalError> {
        self.dest.flush()?;
        Ok(())
    }

    fn emit_physical_record(&mut self, ty: RecordType, payload: &[u8]) -> Result<(), WalError> {
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[ty as u8]);
        hasher.update(payload);
        let crc = hasher.finalize();

        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        header[6] = ty as u8;

        self.dest.write_all(&header)?;
        self.dest.write_all(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();

        trace!(len = payload.len(), ty = ?ty, "log fragment appended");
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Outcome of reading one physical fragment.
enum Physical {
    Record {
        ty: u8,
        data: Vec<u8>,
        /// File offset of the fragment header.
        offset: u64,
    },
    Eof,
    Bad,
}

/// Sequential reader over a framed log file.
pub struct LogReader {
    file: File,
    reporter: Option<Box<dyn CorruptionReporter>>,
    /// Unconsumed tail of the current block.
    buffer: Vec<u8>,
    buffer_pos: usize,
    /// File offset just past the bytes in `buffer`.
    end_of_buffer_offset: u64,
    /// Replay starts at the first record at or after this offset.
    initial_offset: u64,
    /// Offset of the first fragment of the most recent complete record.
    last_record_offset: u64,
    eof: bool,
    /// Skipping fragments from a record that began before
    /// `initial_offset`.
    resyncing: bool,
}

impl LogReader {
    pub fn new(
        file: File,
        reporter: Option<Box<dyn CorruptionReporter>>,
        initial_offset: u64,
    ) -> Self {
        Self {
            file,
            reporter,
            buffer: Vec::new(),
            buffer_pos: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            last_record_offset: 0,
            eof: false,
            resyncing: initial_offset > 0,
        }
    }

    /// Offset of the first fragment of the last record returned.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    /// Read the next logical record, reassembling fragments.
    ///
    /// Returns `Ok(None)` at clean end of file. Corrupted stretches are
    /// reported and skipped, not returned as errors.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        if self.last_record_offset < self.initial_offset {
            self.skip_to_initial_block()?;
        }

        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;
        // Offset of the First fragment of the record being assembled.
        let mut prospective_offset = 0u64;

        loop {
            match self.read_physical_record()? {
                Physical::Record { ty, data, offset } => {
                    if self.resyncing {
                        match ty {
                            t if t == RecordType::Middle as u8 => continue,
                            t if t == RecordType::Last as u8 => {
                                self.resyncing = false;
                                continue;
                            }
                            _ => self.resyncing = false,
                        }
                    }

                    match ty {
                        t if t == RecordType::Full as u8 => {
                            if in_fragmented_record {
                                self.report(scratch.len(), "partial record without end(1)");
                            }
                            self.last_record_offset = offset;
                            return Ok(Some(data));
                        }
                        t if t == RecordType::First as u8 => {
                            if in_fragmented_record {
                                self.report(scratch.len(), "partial record without end(2)");
                            }
                            prospective_offset = offset;
                            scratch = data;
                            in_fragmented_record = true;
                        }
                        t if t == RecordType::Middle as u8 => {
                            if !in_fragmented_record {
                                self.report(data.len(), "missing start of fragmented record(1)");
                            } else {
                                scratch.extend_from_slice(&data);
                            }
                        }
                        t if t == RecordType::Last as u8 => {
                            if !in_fragmented_record {
                                self.report(data.len(), "missing start of fragmented record(2)");
                            } else {
                                scratch.extend_from_slice(&data);
                                self.last_record_offset = prospective_offset;
                                return Ok(Some(scratch));
                            }
                        }
                        other => {
                            self.report(
                                data.len() + scratch.len(),
                                &format!("unknown record type {other}"),
                            );
                            in_fragmented_record = false;
                            scratch.clear();
                        }
                    }
                }
                Physical::Eof => {
                    // A fragmented record cut off by EOF means the writer
                    // died mid-record; drop it silently.
                    return Ok(None);
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report(scratch.len(), "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                }
            }
        }
    }

    fn report(&mut self, bytes: usize, reason: &str) {
        warn!(bytes, reason, "log corruption skipped");
        if let Some(reporter) = self.reporter.as_deref_mut() {
            reporter.corruption(bytes, reason);
        }
    }

    /// Seek to the block containing `initial_offset`.
    fn skip_to_initial_block(&mut self) -> Result<(), WalError> {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start = self.initial_offset - offset_in_block;

        // An offset inside a block's trailer belongs to the next block.
        if offset_in_block > (BLOCK_SIZE - HEADER_SIZE + 1) as u64 {
            block_start += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start;
        if block_start > 0 {
            self.file.seek(SeekFrom::Start(block_start))?;
        }
        Ok(())
    }

    fn read_physical_record(&mut self) -> Result<Physical, WalError> {
        loop {
            let available = self.buffer.len() - self.buffer_pos;
            if available < HEADER_SIZE {
                if !self.eof {
                    // Last block was exhausted; pull the next one.
                    self.buffer.clear();
                    self.buffer_pos = 0;
                    let mut block = vec![0u8; BLOCK_SIZE];
                    let n = read_full(&mut self.file, &mut block)?;
                    block.truncate(n);
                    self.end_of_buffer_offset += n as u64;
                    self.buffer = block;
                    if self.buffer.len() < BLOCK_SIZE {
                        self.eof = true;
                    }
                    continue;
                }
                // Truncated header at file end: the writer died mid-write.
                return Ok(Physical::Eof);
            }

            let header = &self.buffer[self.buffer_pos..self.buffer_pos + HEADER_SIZE];
            let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let ty = header[6];

            if HEADER_SIZE + length > available {
                let dropped = available;
                self.buffer_pos = self.buffer.len();
                if !self.eof {
                    self.report(dropped, "bad record length");
                    return Ok(Physical::Bad);
                }
                // Truncated payload at file end: treat like a torn write.
                return Ok(Physical::Eof);
            }

            if ty == RecordType::Zero as u8 && length == 0 {
                // Zero-padded block tail (or preallocated region): skip
                // the rest of this block without reporting.
                self.buffer_pos = self.buffer.len();
                return Ok(Physical::Bad);
            }

            let payload_start = self.buffer_pos + HEADER_SIZE;
            let payload = &self.buffer[payload_start..payload_start + length];

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&[ty]);
            hasher.update(payload);
            if hasher.finalize() != crc {
                let dropped = self.buffer.len() - self.buffer_pos;
                self.buffer_pos = self.buffer.len();
                self.report(dropped, "checksum mismatch");
                return Ok(Physical::Bad);
            }

            let data = payload.to_vec();
            self.buffer_pos += HEADER_SIZE + length;

            let fragment_offset =
                self.end_of_buffer_offset - (self.buffer.len() - self.buffer_pos + HEADER_SIZE + length) as u64;

            // Fragments that end before the requested start are invisible.
            if fragment_offset < self.initial_offset {
                continue;
            }

            return Ok(Physical::Record {
                ty,
                data,
                offset: fragment_offset,
            });
        }
    }
}

/// Read until `buf` is full or EOF; returns the byte count read.
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
