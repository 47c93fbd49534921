//! Append-only fixed-record completion log (C6).
//!
//! Every record is the same size, so `write` is one `write_all` call (no
//! torn writes) and `read_all` can compute offsets without an index.
//! Variable-length `command_line` is length-prefixed and zero-padded
//! inside the fixed buffer rather than stored as a separate length-coded
//! stream, matching spec §9's preference for explicit field-by-field
//! (de)serialization over a reinterpret-cast record.

use crate::error::{Error, Result};
use crate::logging::LogLevel;
use crate::task::{Stage, TaggedTask, Timestamp, NUM_STAGES};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

const STAGES: [Stage; NUM_STAGES] = [
    Stage::Sent,
    Stage::Arrived,
    Stage::Dispatched,
    Stage::Ended,
    Stage::Completed,
];

/// Large enough to hold any command line that could have arrived over
/// the wire (bounded by `wire::IPC_MAX`), so a legitimately-submitted
/// task's command line can never overflow a record.
pub const LOG_COMMAND_LINE_CAP: usize = crate::wire::IPC_MAX;

const TIMES_LEN: usize = NUM_STAGES * 8;
const HEADER_LEN: usize = 4 + 4 + 4 + 1 + TIMES_LEN;
pub const RECORD_LEN: usize = HEADER_LEN + LOG_COMMAND_LINE_CAP;

pub struct LogFile {
    file: std::fs::File,
    task_count: usize,
}

impl LogFile {
    /// `writable = true` truncates the file on open (a fresh run starts
    /// a fresh log); `writable = false` opens an existing log read-only.
    /// The fd is marked close-on-exec so a spawned pipeline stage never
    /// inherits it (spec §4.8).
    pub fn open(path: &Path, writable: bool) -> Result<LogFile> {
        let mut opts = OpenOptions::new();
        opts.read(true);
        if writable {
            opts.write(true).create(true).truncate(true).mode(0o640);
        }
        let file = opts.open(path).map_err(|e| {
            log!(LogLevel::LogError, "could not open log file {}: {}", path.display(), e);
            Error::FatalStartup
        })?;
        fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        Ok(LogFile { file, task_count: 0 })
    }

    /// Opens an independent read-only handle to the log, pre-seeded with
    /// a caller-supplied `task_count` rather than discovering it from
    /// zero.
    ///
    /// `fork` duplicates the fd table, but a duplicated fd shares the
    /// *same open file description* (and hence the same seek offset) as
    /// the parent's. A status child reading through a forked copy of the
    /// orchestrator's writable `LogFile` would race the orchestrator's
    /// concurrent `write` calls over that shared offset. This constructor
    /// opens a brand-new fd instead, so the child's replay cursor is its
    /// own (spec §4.9, §5).
    pub fn open_snapshot(path: &Path, task_count: usize) -> Result<LogFile> {
        let mut log = LogFile::open(path, false)?;
        log.task_count = task_count;
        Ok(log)
    }

    /// Records written in this process's lifetime. A forked reader
    /// captures this value at fork time and never reads past it, even if
    /// the writer appends more afterward (spec §4.6).
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn write(&mut self, task: &TaggedTask, error: bool) -> Result<()> {
        let record = encode_record(task, error);
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&record)?;
        self.file.flush()?;
        self.task_count += 1;
        Ok(())
    }

    /// Streams records from the start, invoking `callback(task, error)`
    /// for each. Stops early if `callback` returns non-zero, or once
    /// `task_count` records have been delivered regardless of how long
    /// the file on disk actually is.
    pub fn read_all(&mut self, mut callback: impl FnMut(&TaggedTask, bool) -> i32) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; RECORD_LEN];
        for _ in 0..self.task_count {
            self.file.read_exact(&mut buf)?;
            match decode_record(&buf) {
                Some((task, error)) => {
                    if callback(&task, error) != 0 {
                        break;
                    }
                }
                None => {
                    self.file.seek(SeekFrom::End(0))?;
                    log!(LogLevel::LogError, "malformed log record; stopping replay");
                    return Err(Error::InvalidSequence);
                }
            }
        }
        Ok(())
    }
}

fn encode_record(task: &TaggedTask, error: bool) -> Vec<u8> {
    let cmd = task.command_line();
    debug_assert!(
        cmd.len() <= LOG_COMMAND_LINE_CAP,
        "command line longer than the wire protocol ever allows through"
    );
    let mut buf = vec![0u8; RECORD_LEN];
    let mut pos = 0;
    buf[pos..pos + 4].copy_from_slice(&task.id().to_ne_bytes());
    pos += 4;
    buf[pos..pos + 4].copy_from_slice(&(cmd.len() as u32).to_ne_bytes());
    pos += 4;
    buf[pos..pos + 4].copy_from_slice(&task.expected_time_ms().to_ne_bytes());
    pos += 4;
    buf[pos] = error as u8;
    pos += 1;
    for stage in STAGES {
        let nanos = task.time(stage).map(|t| t.as_nanos()).unwrap_or(0);
        buf[pos..pos + 8].copy_from_slice(&nanos.to_ne_bytes());
        pos += 8;
    }
    let cmd = &cmd[..cmd.len().min(LOG_COMMAND_LINE_CAP)];
    buf[pos..pos + cmd.len()].copy_from_slice(cmd);
    buf
}

fn decode_record(buf: &[u8]) -> Option<(TaggedTask, bool)> {
    if buf.len() != RECORD_LEN {
        return None;
    }
    let mut pos = 0;
    let id = u32::from_ne_bytes(buf[pos..pos + 4].try_into().ok()?);
    pos += 4;
    let command_length = u32::from_ne_bytes(buf[pos..pos + 4].try_into().ok()?) as usize;
    pos += 4;
    let expected_time_ms = u32::from_ne_bytes(buf[pos..pos + 4].try_into().ok()?);
    pos += 4;
    let error = buf[pos] != 0;
    pos += 1;
    let mut times = [Timestamp::UNSET; NUM_STAGES];
    for t in times.iter_mut() {
        let nanos = u64::from_ne_bytes(buf[pos..pos + 8].try_into().ok()?);
        *t = Timestamp::from_nanos(nanos);
        pos += 8;
    }
    if command_length > LOG_COMMAND_LINE_CAP || pos + command_length > buf.len() {
        return None;
    }
    let command_line = buf[pos..pos + command_length].to_vec();
    Some((
        TaggedTask::from_log_record(id, command_line, expected_time_ms, times),
        error,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use tempfile::tempdir;

    fn sample_task(id: u32) -> TaggedTask {
        let mut t = TaggedTask::new(id, Task::Pipeline(vec![vec![b"echo".to_vec()]]), b"echo hi".to_vec(), 42);
        t.set_time(Stage::Sent, Some(Timestamp::from_nanos(1)));
        t.set_time(Stage::Arrived, Some(Timestamp::from_nanos(2)));
        t.set_time(Stage::Dispatched, Some(Timestamp::from_nanos(3)));
        t.set_time(Stage::Ended, Some(Timestamp::from_nanos(4)));
        t.set_time(Stage::Completed, Some(Timestamp::from_nanos(5)));
        t
    }

    #[test]
    fn write_then_read_all_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut log = LogFile::open(&path, true).unwrap();
        log.write(&sample_task(1), false).unwrap();
        log.write(&sample_task(2), true).unwrap();

        let mut seen = Vec::new();
        log.read_all(|task, error| {
            seen.push((task.id(), error, task.command_line().to_vec()));
            0
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![(1, false, b"echo hi".to_vec()), (2, true, b"echo hi".to_vec())]
        );
    }

    #[test]
    fn read_all_stops_early_when_callback_returns_nonzero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut log = LogFile::open(&path, true).unwrap();
        log.write(&sample_task(1), false).unwrap();
        log.write(&sample_task(2), false).unwrap();

        let mut count = 0;
        log.read_all(|_task, _error| {
            count += 1;
            1
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn read_all_never_reads_past_captured_task_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut log = LogFile::open(&path, true).unwrap();
        log.write(&sample_task(1), false).unwrap();
        let captured_count = log.task_count();

        // Simulate a record appended after a reader's `task_count` was
        // captured (e.g. at fork): bypass `write` to append raw bytes
        // without bumping `task_count`.
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&encode_record(&sample_task(2), false)).unwrap();
        }

        let mut reader = LogFile {
            file: std::fs::OpenOptions::new().read(true).open(&path).unwrap(),
            task_count: captured_count,
        };
        let mut seen = Vec::new();
        reader
            .read_all(|task, _error| {
                seen.push(task.id());
                0
            })
            .unwrap();
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn timestamps_round_trip_through_a_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.bin");
        let mut log = LogFile::open(&path, true).unwrap();
        log.write(&sample_task(7), false).unwrap();

        let mut ids = Vec::new();
        let mut times_seen = Vec::new();
        log.read_all(|task, _error| {
            ids.push(task.id());
            times_seen.push(task.time(Stage::Completed));
            0
        })
        .unwrap();
        assert_eq!(ids, vec![7]);
        assert_eq!(times_seen, vec![Some(Timestamp::from_nanos(5))]);
    }
}
