// Log Storage Abstraction
//
// Defines the append/read contract for change log files and the framed
// file implementation used for input, working and output logs.
//
// Frame layout (little endian):
//   magic u32 | payload length u32 | crc32 of payload u32 | payload

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::LogError;

/// Magic constant identifying a frame (`"PITR"`).
pub const FRAME_MAGIC: u32 = 0x5049_5452;

/// Header bytes in front of every payload.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Upper bound on a single payload; anything larger is treated as corruption.
pub const MAX_FRAME_SIZE: u32 = 256 * 1024 * 1024;

/// Storage backend for change log files.
///
/// Implementations MUST:
/// - append frames in call order
/// - return frames from a reader in the order they were written
/// - report a clean end of log as `Ok(None)`, never as an error
pub trait LogStore: Send + Sync {
    /// Create (or truncate) a log file for appending.
    fn open_for_write(&self, path: &Path) -> Result<Box<dyn LogWriter>, LogError>;

    /// Open a log file for a single sequential pass.
    fn open_for_read(&self, path: &Path) -> Result<Box<dyn LogReader>, LogError>;
}

pub trait LogWriter: Send {
    /// Append one payload and return the offset its frame starts at.
    fn write(&mut self, payload: &[u8]) -> Result<u64, LogError>;

    /// Flush buffered frames and sync them to durable storage.
    fn close(&mut self) -> Result<(), LogError>;
}

pub trait LogReader: Send {
    /// Next payload, `None` at a clean end of log.
    ///
    /// Any other failure is fatal for the file.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, LogError>;
}

/// Local file system log store.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileLogStore;

impl LogStore for FileLogStore {
    fn open_for_write(&self, path: &Path) -> Result<Box<dyn LogWriter>, LogError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Box::new(FileLogWriter {
            file: BufWriter::new(file),
            offset: 0,
        }))
    }

    fn open_for_read(&self, path: &Path) -> Result<Box<dyn LogReader>, LogError> {
        let file = File::open(path)?;
        Ok(Box::new(FileLogReader {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
        }))
    }
}

struct FileLogWriter {
    file: BufWriter<File>,
    offset: u64,
}

impl LogWriter for FileLogWriter {
    fn write(&mut self, payload: &[u8]) -> Result<u64, LogError> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_SIZE)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "frame payload too large")
            })?;

        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&len.to_le_bytes());
        header[8..12].copy_from_slice(&crc32fast::hash(payload).to_le_bytes());

        self.file.write_all(&header)?;
        self.file.write_all(payload)?;

        let position = self.offset;
        self.offset += (FRAME_HEADER_SIZE + payload.len()) as u64;
        Ok(position)
    }

    fn close(&mut self) -> Result<(), LogError> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}

struct FileLogReader {
    path: PathBuf,
    reader: BufReader<File>,
}

impl FileLogReader {
    fn corrupt(&self, reason: &'static str) -> LogError {
        LogError::Corrupt {
            path: self.path.clone(),
            reason,
        }
    }

    /// Read until `buf` is full or the file ends; returns the bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, LogError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(filled)
    }
}

impl LogReader for FileLogReader {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, LogError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match self.fill(&mut header)? {
            0 => return Ok(None),
            FRAME_HEADER_SIZE => {}
            _ => return Err(self.corrupt("frame header truncated")),
        }

        let word = |at: usize| {
            u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]])
        };
        if word(0) != FRAME_MAGIC {
            return Err(self.corrupt("frame magic mismatch"));
        }
        let len = word(4);
        if len > MAX_FRAME_SIZE {
            return Err(self.corrupt("frame length exceeds limit"));
        }

        let mut payload = vec![0u8; len as usize];
        if self.fill(&mut payload)? != payload.len() {
            return Err(self.corrupt("frame payload truncated"));
        }
        if crc32fast::hash(&payload) != word(8) {
            return Err(self.corrupt("frame payload checksum mismatch"));
        }

        Ok(Some(payload))
    }
}
