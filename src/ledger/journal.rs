//! Append-only per-job journal.
//!
//! Layout: `[magic u32][version u32]` followed by frames of
//! `[len u32][crc32 u32][bincode payload]`, all little-endian. Every append
//! is synced before it returns; a failed append is cut back off the file
//! so later frames never land behind a torn one. Replay stops at the first
//! short or checksum-failing frame and truncates the file there.

use crate::error::{MigrationError, Result};
use crate::model::{CutoverRecord, MigrationJob, MigrationUnit, StatusChange, UnitId, UnitState};
use bincode::{Decode, Encode};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{error, warn};

const JOURNAL_MAGIC: u32 = 0x504D_4C47; // "PMLG"
const JOURNAL_VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;
const FRAME_HEADER_LEN: usize = 8;
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub(crate) enum LedgerRecord {
    JobCreated {
        job: MigrationJob,
        units: Vec<MigrationUnit>,
    },
    UnitTransition {
        unit_id: UnitId,
        to: UnitState,
        error: Option<String>,
        at: SystemTime,
    },
    JobStatus {
        change: StatusChange,
    },
    Cutover {
        record: CutoverRecord,
    },
}

pub(crate) struct Journal {
    path: PathBuf,
    file: File,
    /// End of the last synced frame.
    len: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
    /// Write only this many bytes of the next frame, then fail.
    #[cfg(test)]
    torn_write: Option<usize>,
}

fn frame_checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

impl Journal {
    /// Creates a new journal; fails if one already exists at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&JOURNAL_MAGIC.to_le_bytes())?;
        file.write_all(&JOURNAL_VERSION.to_le_bytes())?;
        file.sync_all()?;
        Ok(Self::new(path, file, HEADER_LEN))
    }

    fn new(path: PathBuf, file: File, len: u64) -> Self {
        Self {
            path,
            file,
            len,
            poisoned: false,
            #[cfg(test)]
            torn_write: None,
        }
    }

    /// Opens an existing journal and returns every intact record.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, Vec<LedgerRecord>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header).map_err(|_| {
            MigrationError::LedgerCorrupted(format!("{}: missing journal header", path.display()))
        })?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if magic != JOURNAL_MAGIC {
            return Err(MigrationError::LedgerCorrupted(format!(
                "{}: bad journal magic {:08x}",
                path.display(),
                magic
            )));
        }
        if version != JOURNAL_VERSION {
            return Err(MigrationError::LedgerCorrupted(format!(
                "{}: unsupported journal version {}",
                path.display(),
                version
            )));
        }

        let mut body = Vec::new();
        file.read_to_end(&mut body)?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while body.len() - offset >= FRAME_HEADER_LEN {
            let len = u32::from_le_bytes([
                body[offset],
                body[offset + 1],
                body[offset + 2],
                body[offset + 3],
            ]);
            let crc = u32::from_le_bytes([
                body[offset + 4],
                body[offset + 5],
                body[offset + 6],
                body[offset + 7],
            ]);
            let start = offset + FRAME_HEADER_LEN;
            let end = start + len as usize;
            if len > MAX_FRAME_LEN || end > body.len() {
                break;
            }
            let payload = &body[start..end];
            if frame_checksum(payload) != crc {
                break;
            }
            let (record, _): (LedgerRecord, usize) =
                bincode::decode_from_slice(payload, bincode::config::standard())?;
            records.push(record);
            offset = end;
        }

        if offset < body.len() {
            warn!(
                path = %path.display(),
                valid_bytes = offset,
                discarded_bytes = body.len() - offset,
                "Truncating torn journal tail"
            );
            file.set_len(HEADER_LEN + offset as u64)?;
            file.sync_all()?;
        }
        let len = HEADER_LEN + offset as u64;
        file.seek(SeekFrom::Start(len))?;

        Ok((Self::new(path, file, len), records))
    }

    pub fn append(&mut self, record: &LedgerRecord) -> Result<()> {
        if self.poisoned {
            return Err(MigrationError::LedgerCorrupted(format!(
                "{}: journal holds an unrecoverable partial write",
                self.path.display()
            )));
        }
        let payload = bincode::encode_to_vec(record, bincode::config::standard())?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&frame_checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        if let Err(e) = self.write_frame(&frame) {
            if let Err(rollback) = self.rollback() {
                error!(path = %self.path.display(), error = %rollback, "Could not cut failed append off journal");
                self.poisoned = true;
            }
            return Err(e.into());
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        if let Some(limit) = self.injected_tear() {
            self.file.write_all(&frame[..limit.min(frame.len())])?;
            return Err(std::io::Error::other("no space left on device"));
        }
        self.file.write_all(frame)?;
        self.file.sync_data()
    }

    #[cfg(test)]
    fn injected_tear(&mut self) -> Option<usize> {
        self.torn_write.take()
    }

    #[cfg(not(test))]
    fn injected_tear(&mut self) -> Option<usize> {
        None
    }

    fn rollback(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.len)?;
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
