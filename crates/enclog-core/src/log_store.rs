//! Append-only store of fixed-size encrypted records.
//!
//! The log is a flat byte stream with no header or index; record `i` occupies bytes
//! `[n*i, n*i + n)` for record size `n`. Every operation acquires the backend for its
//! own duration and keeps no cached view of the log.

use std::{
    fmt,
    io::{self, Read, Write},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    error::IoError,
    record::{RECORD_LEN, Record},
    storage::StorageBackend,
};

/// Bytes per hex dump chunk.
pub const DUMP_CHUNK_LEN: usize = 32;

pub struct LogStore {
    backend: Arc<dyn StorageBackend>,
    record_len: usize,
    lock: Mutex<()>,
}

impl LogStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_record_len(backend, RECORD_LEN)
    }

    pub fn with_record_len(backend: Arc<dyn StorageBackend>, record_len: usize) -> Self {
        Self {
            backend,
            record_len,
            lock: Mutex::new(()),
        }
    }

    pub fn location(&self) -> String {
        self.backend.describe()
    }

    pub fn record_len(&self) -> usize {
        self.record_len
    }

    pub fn append(&self, record: &Record) -> Result<(), IoError> {
        let bytes = record.to_bytes();
        if bytes.len() != self.record_len {
            return Err(IoError::RecordSizeMismatch {
                expected: self.record_len,
                actual: bytes.len(),
            });
        }
        let _guard = self.lock.lock();
        let mut writer = self
            .backend
            .open_append()
            .map_err(|err| IoError::open(self.location(), err))?;
        writer
            .write_all(&bytes)
            .and_then(|_| writer.flush())
            .map_err(|err| IoError::write(self.location(), err))?;
        debug!(location = %self.location(), len = bytes.len(), "record appended");
        Ok(())
    }

    /// Truncates the log to zero length. Succeeds on an empty or missing log.
    pub fn clear(&self) -> Result<(), IoError> {
        let _guard = self.lock.lock();
        self.backend
            .truncate()
            .map_err(|err| IoError::open(self.location(), err))?;
        info!(location = %self.location(), "log cleared");
        Ok(())
    }

    /// Lazily renders the log as hex chunks, from the start on every call.
    pub fn dump_hex(&self) -> Result<HexDump, IoError> {
        match self.backend.open_read() {
            Ok(Some(reader)) => Ok(HexDump {
                reader: Some(reader),
                target: self.location(),
                offset: 0,
                missing: false,
            }),
            Ok(None) => Ok(HexDump {
                reader: None,
                target: self.location(),
                offset: 0,
                missing: true,
            }),
            Err(err) => Err(IoError::open(self.location(), err)),
        }
    }

    /// Size of the log in bytes; a missing log counts as empty.
    pub fn len_bytes(&self) -> Result<u64, IoError> {
        self.backend
            .size()
            .map(|size| size.unwrap_or(0))
            .map_err(|err| IoError::read(self.location(), err))
    }

    pub fn record_count(&self) -> Result<u64, IoError> {
        Ok(self.len_bytes()? / self.record_len as u64)
    }

    /// Reads every record back in append order.
    pub fn records(&self) -> Result<Vec<Record>, IoError> {
        let Some(mut reader) = self
            .backend
            .open_read()
            .map_err(|err| IoError::open(self.location(), err))?
        else {
            return Ok(Vec::new());
        };
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|err| IoError::read(self.location(), err))?;

        let chunks = bytes.chunks_exact(self.record_len);
        if !chunks.remainder().is_empty() {
            let trailing = chunks.remainder().len();
            return Err(IoError::read(
                self.location(),
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{trailing} trailing bytes after last whole record"),
                ),
            ));
        }
        Ok(chunks.filter_map(Record::from_bytes).collect())
    }
}

/// One rendered chunk of a hex dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexChunk {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

impl HexChunk {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl fmt::Display for HexChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:", self.offset)?;
        for byte in &self.bytes {
            write!(f, " {byte:02x}")?;
        }
        Ok(())
    }
}

/// Iterator over [`DUMP_CHUNK_LEN`]-byte chunks of the log. Empty when the log is
/// missing; check [`HexDump::is_missing`] to tell that apart from an empty log.
pub struct HexDump {
    reader: Option<Box<dyn Read + Send>>,
    target: String,
    offset: u64,
    missing: bool,
}

impl HexDump {
    pub fn is_missing(&self) -> bool {
        self.missing
    }
}

impl Iterator for HexDump {
    type Item = Result<HexChunk, IoError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        let mut buf = [0u8; DUMP_CHUNK_LEN];
        let mut filled = 0;
        while filled < DUMP_CHUNK_LEN {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.reader = None;
                    return Some(Err(IoError::read(self.target.clone(), err)));
                }
            }
        }
        if filled == 0 {
            self.reader = None;
            return None;
        }
        let chunk = HexChunk {
            offset: self.offset,
            bytes: buf[..filled].to_vec(),
        };
        self.offset += filled as u64;
        Some(Ok(chunk))
    }
}
