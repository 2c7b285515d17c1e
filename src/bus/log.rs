//! Append-only event log backends.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::bus::message::{Message, MessageDraft};
use crate::error::{Error, Result};
use crate::util::{with_suffix, FileLock};
use crate::{hlog_debug, hlog_error, hlog_warn};

/// Ordered, append-only message storage.
///
/// `append` assigns the next sequence number under a single lock, so
/// concurrent publishers never interleave or reuse a number.
pub trait EventLog: Send + Sync {
    fn append(&self, draft: MessageDraft) -> Result<Message>;

    /// Up to `limit` messages with `seq > after`, in log order.
    fn read_after(&self, after: u64, limit: usize) -> Result<Vec<Message>>;

    /// Sequence number of the newest message, 0 when empty.
    fn last_seq(&self) -> Result<u64>;
}

fn poisoned<T>(_: T) -> Error {
    Error::StorageUnavailable("message log lock poisoned".into())
}

#[derive(Default)]
pub struct MemoryLog {
    messages: Mutex<Vec<Message>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLog for MemoryLog {
    fn append(&self, draft: MessageDraft) -> Result<Message> {
        let mut messages = self.messages.lock().map_err(poisoned)?;
        let msg = draft.seal(messages.len() as u64 + 1);
        messages.push(msg.clone());
        Ok(msg)
    }

    fn read_after(&self, after: u64, limit: usize) -> Result<Vec<Message>> {
        let messages = self.messages.lock().map_err(poisoned)?;
        // seq == index + 1
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(messages.len());
        Ok(messages[start..].iter().take(limit).cloned().collect())
    }

    fn last_seq(&self) -> Result<u64> {
        Ok(self.messages.lock().map_err(poisoned)?.len() as u64)
    }
}

/// Byte offsets of the readable records scanned so far.
#[derive(Default)]
struct Index {
    /// End of the last complete line scanned.
    scanned: u64,
    /// `(seq, offset of the line)` in log order, strictly increasing seq.
    entries: Vec<(u64, u64)>,
}

impl Index {
    fn last_seq(&self) -> u64 {
        self.entries.last().map(|(seq, _)| *seq).unwrap_or(0)
    }
}

struct LogState {
    file: File,
    index: Index,
}

/// One JSON message per line, shareable between processes.
///
/// Appends hold an exclusive lock on `<path>.lock` and take the next
/// sequence number from the file itself, so two `hive` processes writing
/// the same log never reuse a number. Reads hold the shared lock.
/// Complete lines are indexed by byte offset as they are first seen, which
/// lets `read_after` seek straight to its cursor. Unreadable lines (a torn
/// record left by a crash) are skipped with a warning.
pub struct JsonlLog {
    path: PathBuf,
    lock_path: PathBuf,
    state: Mutex<LogState>,
}

impl JsonlLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(Error::storage)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(Error::storage)?;

        let log = Self {
            lock_path: with_suffix(&path, "lock"),
            path,
            state: Mutex::new(LogState {
                file,
                index: Index::default(),
            }),
        };
        let last = log.last_seq()?;
        hlog_debug!("JsonlLog::open path={} last_seq={}", log.path.display(), last);
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, exclusive: bool) -> Result<FileLock> {
        let lock = if exclusive {
            FileLock::exclusive(&self.lock_path)
        } else {
            FileLock::shared(&self.lock_path)
        };
        lock.map_err(|e| {
            hlog_error!("message log lock failed: {}: {}", self.lock_path.display(), e);
            Error::storage(e)
        })
    }

    /// Index lines appended since the last scan, by this or any process.
    fn refresh(&self, state: &mut LogState) -> Result<()> {
        let len = state.file.metadata().map_err(Error::storage)?.len();
        if len < state.index.scanned {
            hlog_warn!("{} shrank, rescanning", self.path.display());
            state.index = Index::default();
        }
        if len == state.index.scanned {
            return Ok(());
        }

        let mut file = &state.file;
        file.seek(SeekFrom::Start(state.index.scanned))
            .map_err(Error::storage)?;
        let mut reader = BufReader::new(file);
        let mut offset = state.index.scanned;
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).map_err(Error::storage)?;
            // A line without its newline is still being written or was
            // torn; it is picked up once terminated.
            if n == 0 || !line.ends_with('\n') {
                break;
            }
            let start = offset;
            offset += n as u64;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(msg) if msg.seq > state.index.last_seq() => {
                    state.index.entries.push((msg.seq, start))
                }
                Ok(msg) => hlog_warn!(
                    "{}@{}: skipping out-of-order message seq={}",
                    self.path.display(),
                    start,
                    msg.seq
                ),
                Err(e) => hlog_warn!(
                    "{}@{}: skipping unreadable message: {}",
                    self.path.display(),
                    start,
                    e
                ),
            }
        }
        state.index.scanned = offset;
        Ok(())
    }
}

/// Start the next append on a fresh line if the file ends mid-record.
fn terminate_last_line(file: &File) -> Result<()> {
    let len = file.metadata().map_err(Error::storage)?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    let mut handle = file;
    handle
        .seek(SeekFrom::Start(len - 1))
        .and_then(|_| handle.read_exact(&mut last))
        .map_err(Error::storage)?;
    if last[0] != b'\n' {
        handle.write_all(b"\n").map_err(Error::storage)?;
    }
    Ok(())
}

/// Append `bytes` with `write`. If the write fails partway the file is cut
/// back to its previous length, so a retried append starts on a clean line.
/// Returns the offset the bytes were written at.
fn append_or_rewind<F>(file: &File, bytes: &[u8], write: F) -> std::io::Result<u64>
where
    F: FnOnce(&mut &File, &[u8]) -> std::io::Result<()>,
{
    let start = file.metadata()?.len();
    let mut handle = file;
    if let Err(e) = write(&mut handle, bytes).and_then(|_| handle.flush()) {
        if let Err(trunc) = file.set_len(start) {
            hlog_error!("message log rewind to {} failed: {}", start, trunc);
        }
        return Err(e);
    }
    Ok(start)
}

impl EventLog for JsonlLog {
    fn append(&self, draft: MessageDraft) -> Result<Message> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let _lock = self.lock(true)?;

        terminate_last_line(&state.file)?;
        self.refresh(&mut state)?;
        let msg = draft.seal(state.index.last_seq() + 1);
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');

        let start = append_or_rewind(&state.file, line.as_bytes(), |f, b| f.write_all(b))
            .map_err(|e| {
                hlog_error!("message log append failed: {}: {}", self.path.display(), e);
                Error::storage(e)
            })?;
        state.index.entries.push((msg.seq, start));
        state.index.scanned = start + line.len() as u64;
        Ok(msg)
    }

    fn read_after(&self, after: u64, limit: usize) -> Result<Vec<Message>> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let _lock = self.lock(false)?;
        self.refresh(&mut state)?;

        let first = state.index.entries.partition_point(|(seq, _)| *seq <= after);
        let end = first.saturating_add(limit).min(state.index.entries.len());
        let wanted = &state.index.entries[first..end];
        let Some(&(_, from)) = wanted.first() else {
            return Ok(Vec::new());
        };

        let mut file = &state.file;
        file.seek(SeekFrom::Start(from)).map_err(Error::storage)?;
        let mut reader = BufReader::new(file);
        let mut offset = from;
        let mut line = String::new();
        let mut out = Vec::with_capacity(wanted.len());
        for &(_, at) in wanted {
            // Skip lines the index left out.
            while offset < at {
                line.clear();
                offset += reader.read_line(&mut line).map_err(Error::storage)? as u64;
            }
            line.clear();
            offset += reader.read_line(&mut line).map_err(Error::storage)? as u64;
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }

    fn last_seq(&self) -> Result<u64> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let _lock = self.lock(false)?;
        self.refresh(&mut state)?;
        Ok(state.index.last_seq())
    }
}
