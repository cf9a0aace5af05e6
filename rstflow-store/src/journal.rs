//! Commit journal.
//!
//! Every committed transaction is appended as one framed record before it is
//! applied, so a commit is either fully replayed or not at all:
//!
//! ```text
//! +----------+----------+----------+---------------------+------------------+
//! | magic    | length   | crc32c   | sequence            | payload (JSON)   |
//! | 4 bytes  | 4 bytes  | 4 bytes  | 8 bytes             | length bytes     |
//! +----------+----------+----------+---------------------+------------------+
//! ```
//!
//! On open the journal is scanned front to back. The first torn or corrupt
//! frame ends the scan and everything from it onwards is truncated.
//!
//! A failed append is cut back off the file before the error is returned,
//! so the file only ever holds acknowledged commits. If that cut fails too,
//! the journal refuses all further appends.

use crate::error::StoreError;
use crate::records::{HistoryRecord, WorkflowRecord};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for journal frames: "RFJL"
pub const JOURNAL_MAGIC: [u8; 4] = *b"RFJL";

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 20;

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// When the journal file is fsynced.
///
/// Written as `every_commit`, `never` or `every_n:N`; `{every_n: N}` is
/// accepted too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "FsyncPolicyRepr", into = "String")]
pub enum FsyncPolicy {
    /// Fsync after every commit (safest, slowest).
    #[default]
    EveryCommit,
    /// Fsync after N commits.
    EveryN(u32),
    /// Leave flushing to the OS.
    Never,
}

impl FsyncPolicy {
    /// Parses `every_commit`, `never` or `every_n:N`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "every_commit" => Some(FsyncPolicy::EveryCommit),
            "never" => Some(FsyncPolicy::Never),
            other => other
                .strip_prefix("every_n:")
                .and_then(|n| n.parse().ok())
                .filter(|n: &u32| *n > 0)
                .map(FsyncPolicy::EveryN),
        }
    }
}

impl fmt::Display for FsyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsyncPolicy::EveryCommit => write!(f, "every_commit"),
            FsyncPolicy::EveryN(n) => write!(f, "every_n:{}", n),
            FsyncPolicy::Never => write!(f, "never"),
        }
    }
}

impl From<FsyncPolicy> for String {
    fn from(policy: FsyncPolicy) -> Self {
        policy.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FsyncPolicyRepr {
    Text(String),
    EveryN { every_n: u32 },
}

impl TryFrom<FsyncPolicyRepr> for FsyncPolicy {
    type Error = String;

    fn try_from(repr: FsyncPolicyRepr) -> Result<Self, Self::Error> {
        match repr {
            FsyncPolicyRepr::Text(s) => FsyncPolicy::parse(&s).ok_or_else(|| {
                format!(
                    "invalid fsync policy '{}' (expected every_commit, never or every_n:N)",
                    s
                )
            }),
            FsyncPolicyRepr::EveryN { every_n: 0 } => {
                Err("fsync policy every_n needs N > 0".to_string())
            }
            FsyncPolicyRepr::EveryN { every_n } => Ok(FsyncPolicy::EveryN(every_n)),
        }
    }
}

/// A live row written by a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEntry {
    pub table: String,
    pub record: WorkflowRecord,
}

/// A history row written by a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub table: String,
    pub record: HistoryRecord,
}

/// All writes of one committed transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub live: Vec<LiveEntry>,
    pub history: Vec<HistoryEntry>,
}

impl CommitRecord {
    pub fn is_empty(&self) -> bool {
        self.live.is_empty() && self.history.is_empty()
    }
}

/// One frame as stored on disk.
#[derive(Debug, Clone)]
pub struct JournalFrame {
    pub sequence: u64,
    pub payload: Bytes,
}

impl JournalFrame {
    pub fn new(sequence: u64, payload: Bytes) -> Self {
        Self { sequence, payload }
    }

    pub fn encode(&self) -> Result<BytesMut, StoreError> {
        if self.payload.len() > MAX_FRAME_SIZE {
            return Err(StoreError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.disk_size());
        buf.put_slice(&JOURNAL_MAGIC);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(crc32c::crc32c(&self.payload));
        buf.put_u64(self.sequence);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a frame.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, StoreError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        if buf[0..4] != JOURNAL_MAGIC {
            return Err(StoreError::Corruption {
                offset,
                reason: format!("invalid magic: {:?}", &buf[0..4]),
            });
        }

        let mut header = &buf[4..FRAME_HEADER_SIZE];
        let payload_len = header.get_u32() as usize;
        let crc_expected = header.get_u32();
        let sequence = header.get_u64();

        if payload_len > MAX_FRAME_SIZE {
            return Err(StoreError::Corruption {
                offset,
                reason: format!("frame length {} exceeds {}", payload_len, MAX_FRAME_SIZE),
            });
        }
        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(StoreError::Corruption {
                offset,
                reason: format!(
                    "CRC mismatch (expected {:#x}, got {:#x})",
                    crc_expected, crc_actual
                ),
            });
        }

        Ok(Some(Self { sequence, payload }))
    }

    pub fn disk_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// What was recovered when the journal was opened.
#[derive(Debug, Default)]
pub struct Replay {
    pub commits: Vec<CommitRecord>,
    pub bytes_truncated: u64,
    pub last_sequence: u64,
}

/// Append-only journal file.
pub struct Journal {
    path: PathBuf,
    file: File,
    policy: FsyncPolicy,
    next_sequence: u64,
    commits_since_sync: u32,
    /// Length of the file up to the last acknowledged frame.
    len: u64,
    poisoned: bool,
    #[cfg(test)]
    faults: Faults,
}

impl Journal {
    /// Opens or creates the journal, replaying and repairing it.
    pub fn open(path: impl AsRef<Path>, policy: FsyncPolicy) -> Result<(Self, Replay), StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut raw = Vec::new();
        if path.exists() {
            File::open(&path)?.read_to_end(&mut raw)?;
        }
        let file_size = raw.len() as u64;

        let mut replay = Replay::default();
        let mut buf = BytesMut::from(&raw[..]);
        let mut offset = 0u64;

        loop {
            let frame = match JournalFrame::decode(&mut buf, offset) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "journal scan stopped at corrupt frame");
                    break;
                }
            };

            let commit: CommitRecord = match serde_json::from_slice(&frame.payload) {
                Ok(commit) => commit,
                Err(e) => {
                    tracing::warn!(offset, error = %e, "journal frame holds undecodable commit");
                    break;
                }
            };

            offset += frame.disk_size() as u64;
            replay.last_sequence = frame.sequence;
            replay.commits.push(commit);
        }

        replay.bytes_truncated = file_size - offset;
        if replay.bytes_truncated > 0 {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(offset)?;
            file.sync_all()?;
            tracing::warn!(
                path = %path.display(),
                offset,
                bytes = replay.bytes_truncated,
                "truncated torn journal tail"
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        if !replay.commits.is_empty() {
            tracing::info!(
                path = %path.display(),
                commits = replay.commits.len(),
                last_sequence = replay.last_sequence,
                "journal replayed"
            );
        }

        let journal = Self {
            path,
            file,
            policy,
            next_sequence: replay.last_sequence + 1,
            commits_since_sync: 0,
            len: offset,
            poisoned: false,
            #[cfg(test)]
            faults: Faults::default(),
        };
        Ok((journal, replay))
    }

    /// Appends one commit, returning its sequence number.
    ///
    /// On error nothing of the commit remains in the file.
    pub fn append(&mut self, commit: &CommitRecord) -> Result<u64, StoreError> {
        if self.poisoned {
            return Err(StoreError::JournalPoisoned {
                path: self.path.clone(),
            });
        }

        let payload = serde_json::to_vec(commit)?;
        let sequence = self.next_sequence;
        let frame = JournalFrame::new(sequence, Bytes::from(payload)).encode()?;

        if let Err(e) = self.write_frame(&frame) {
            self.undo_append();
            return Err(e);
        }

        self.len += frame.len() as u64;
        self.next_sequence += 1;
        Ok(sequence)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), StoreError> {
        self.write_bytes(frame)?;

        self.commits_since_sync += 1;
        match self.policy {
            FsyncPolicy::EveryCommit => self.sync()?,
            FsyncPolicy::EveryN(n) if self.commits_since_sync >= n => self.sync()?,
            _ => {}
        }
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        #[cfg(test)]
        if let Some(n) = self.faults.torn_write.take() {
            self.file.write_all(&bytes[..n.min(bytes.len())])?;
            return Err(injected("torn write"));
        }
        self.file.write_all(bytes)
    }

    /// Cuts the file back to the last acknowledged frame.
    fn undo_append(&mut self) {
        match self.truncate_to(self.len) {
            Ok(()) => {
                tracing::warn!(
                    path = %self.path.display(),
                    len = self.len,
                    "failed journal append rolled back"
                );
            }
            Err(e) => {
                self.poisoned = true;
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "failed journal append could not be rolled back, journal poisoned"
                );
            }
        }
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        #[cfg(test)]
        self.faults.check(|f| &mut f.fail_truncate, "truncate")?;
        self.file.set_len(len)?;
        self.file.sync_all()
    }

    /// Forces a sync to disk.
    pub fn sync(&mut self) -> Result<(), StoreError> {
        #[cfg(test)]
        self.faults.check(|f| &mut f.fail_sync, "sync")?;
        self.file.sync_data()?;
        self.commits_since_sync = 0;
        Ok(())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence number the next commit will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

/// One-shot I/O failures for exercising the append error paths.
#[cfg(test)]
#[derive(Debug, Default)]
struct Faults {
    /// Write only this many bytes of the next frame, then fail.
    torn_write: Option<usize>,
    fail_sync: bool,
    fail_truncate: bool,
}

#[cfg(test)]
impl Faults {
    fn check(&mut self, flag: impl Fn(&mut Self) -> &mut bool, what: &str) -> io::Result<()> {
        if std::mem::take(flag(self)) {
            return Err(injected(what));
        }
        Ok(())
    }
}

#[cfg(test)]
fn injected(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("injected {} failure", what))
}
