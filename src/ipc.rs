//! Framed named-pipe transport (C1).
//!
//! Two roles, SERVER and CLIENT, each own a FIFO they read from; the path
//! of the FIFO they write to is either fixed (the server's well-known
//! path, for a client) or derived from a remembered peer pid (a client's
//! path, for the server, set by `server_open_sending`). Every frame is a
//! signature, a length, and a payload, written in a single syscall so it
//! stays inside one atomic pipe write (spec §4.1).

use crate::error::{Error, Result};
use crate::logging::LogLevel;
use nix::fcntl::{open, OFlag};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{close, getpid, mkfifo, read as nix_read, unlink, write as nix_write, Pid};
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Minimum guaranteed atomic single-`write(2)` size to a pipe on Linux.
pub const PIPE_BUF: usize = libc::PIPE_BUF as usize;

const SIGNATURE: u32 = 0xFEED_FEED;
const HEADER_LEN: usize = 8;
const RECV_BUF_LEN: usize = 4 * PIPE_BUF;

pub const SERVER_FIFO_PATH: &str = "/tmp/orchestrator.fifo";

pub fn client_fifo_path(pid: Pid) -> PathBuf {
    PathBuf::from(format!("/tmp/client{}.fifo", pid.as_raw()))
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Role {
    Server,
    Client,
}

/// A named-pipe endpoint. Owns the FIFO at `own_path` (read side) and,
/// while a send direction is open, a write fd to some peer FIFO.
///
/// The send-direction fields use interior mutability so `listen` (which
/// only ever needs `own_path`) can take `&self` and a single `Connection`
/// can be shared via a plain `Rc` with callers that reply from inside a
/// `listen` callback, without a borrow-checked wrapper whose guard would
/// have to span the entire receive loop.
pub struct Connection {
    role: Role,
    own_path: PathBuf,
    send_fd: Cell<Option<RawFd>>,
    send_path: RefCell<Option<PathBuf>>,
}

impl Connection {
    /// Creates the endpoint's own FIFO (and, for a client, opens the
    /// server's FIFO for writing). `Error::FatalStartup` covers both the
    /// server-fifo-already-exists and client-cannot-find-server cases
    /// from spec §4.1 (`AlreadyExists` / `NotFound`); both are terminal
    /// for the calling process either way.
    pub fn new(role: Role) -> Result<Connection> {
        unsafe {
            // The default action for a write to a peer that has gone away
            // is process termination; `send`/`send_retry` observe `EPIPE`
            // explicitly instead (spec §9, "Signal handling").
            let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        }
        match role {
            Role::Server => {
                let path = PathBuf::from(SERVER_FIFO_PATH);
                match mkfifo(&path, Mode::from_bits_truncate(0o620)) {
                    Ok(()) => {}
                    Err(nix::Error::EEXIST) => {
                        log!(
                            LogLevel::LogError,
                            "server fifo {} already exists",
                            path.display()
                        );
                        return Err(Error::FatalStartup);
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(Connection {
                    role,
                    own_path: path,
                    send_fd: Cell::new(None),
                    send_path: RefCell::new(None),
                })
            }
            Role::Client => {
                let own_path = client_fifo_path(getpid());
                if let Err(e) = mkfifo(&own_path, Mode::from_bits_truncate(0o622)) {
                    log!(
                        LogLevel::LogError,
                        "client fifo {} could not be created: {}",
                        own_path.display(),
                        e
                    );
                    return Err(Error::FatalStartup);
                }
                let server_path = PathBuf::from(SERVER_FIFO_PATH);
                let fd = match open(&server_path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())
                {
                    Ok(fd) => fd,
                    Err(_) => {
                        let _ = unlink(&own_path);
                        log!(
                            LogLevel::LogError,
                            "server fifo {} not found",
                            server_path.display()
                        );
                        return Err(Error::FatalStartup);
                    }
                };
                Ok(Connection {
                    role,
                    own_path,
                    send_fd: Cell::new(Some(fd)),
                    send_path: RefCell::new(Some(server_path)),
                })
            }
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn own_path(&self) -> &Path {
        &self.own_path
    }

    /// Wraps `bytes` in a frame and writes it in one syscall. Requires a
    /// send direction to already be open (client: from construction;
    /// server: via `server_open_sending`).
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if bytes.len() > crate::wire::IPC_MAX {
            return Err(Error::MessageTooLong);
        }
        let fd = self.send_fd.get().ok_or(Error::InvalidArgument)?;
        let mut frame = Vec::with_capacity(HEADER_LEN + bytes.len());
        frame.extend_from_slice(&SIGNATURE.to_ne_bytes());
        frame.extend_from_slice(&(bytes.len() as u32).to_ne_bytes());
        frame.extend_from_slice(bytes);
        write_frame(fd, &frame)
    }

    /// As `send`, but on `BrokenPipe`/`Interrupted` reopens the peer FIFO
    /// and retries, up to `max_tries` total attempts. Mandatory for
    /// child-to-parent `TASK_DONE` notifications (spec §4.1): losing one
    /// costs the orchestrator a slot forever.
    pub fn send_retry(&self, bytes: &[u8], max_tries: u32) -> Result<()> {
        let mut last_err = Error::Timeout;
        for attempt in 0..max_tries.max(1) {
            match self.send(bytes) {
                Ok(()) => return Ok(()),
                Err(Error::BrokenPipe) | Err(Error::Interrupted) => {
                    log!(
                        LogLevel::LogWarn,
                        "send attempt {} failed, reopening peer fifo",
                        attempt + 1
                    );
                    if let Err(e) = self.reopen_send() {
                        last_err = e;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    fn reopen_send(&self) -> Result<()> {
        let path = self.send_path.borrow().clone().ok_or(Error::InvalidArgument)?;
        if let Some(fd) = self.send_fd.take() {
            let _ = close(fd);
        }
        let fd = open(&path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;
        self.send_fd.set(Some(fd));
        Ok(())
    }

    /// Opens the write side of `client_pid`'s FIFO. Server-only.
    pub fn server_open_sending(&self, client_pid: Pid) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::InvalidArgument);
        }
        let path = client_fifo_path(client_pid);
        let fd = open(&path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;
        self.send_fd.set(Some(fd));
        *self.send_path.borrow_mut() = Some(path);
        Ok(())
    }

    /// Releases the send direction opened by `server_open_sending`. Safe
    /// to call even if no send direction is open.
    pub fn server_close_sending(&self) {
        if let Some(fd) = self.send_fd.take() {
            let _ = close(fd);
        }
        *self.send_path.borrow_mut() = None;
    }

    /// Drives the receive loop. Opens `own_path` for reading (blocking
    /// until a writer appears), decodes frames in arrival order and
    /// invokes `on_message` for each payload. On EOF, closes the read fd
    /// and invokes `on_before_block`; a non-zero return ends the loop
    /// with that value.
    pub fn listen<S>(
        &self,
        mut on_message: impl FnMut(&[u8], &mut S),
        mut on_before_block: impl FnMut(&mut S) -> i32,
        state: &mut S,
    ) -> Result<i32> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        'outer: loop {
            let fd = open(&self.own_path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
            let mut filled = 0usize;
            loop {
                let n = match nix_read(fd, &mut buf[filled..]) {
                    Ok(n) => n,
                    Err(nix::Error::EINTR) => continue,
                    Err(e) => {
                        log!(LogLevel::LogError, "read on {} failed: {}", self.own_path.display(), e);
                        let _ = close(fd);
                        continue 'outer;
                    }
                };
                if n == 0 {
                    if filled > 0 {
                        log!(
                            LogLevel::LogWarn,
                            "dropping {} trailing byte(s) of a frame never completed before eof",
                            filled
                        );
                    }
                    break;
                }
                filled += n;
                loop {
                    match decode_one(&buf[..filled]) {
                        DecodeOutcome::Need => break,
                        DecodeOutcome::Valid { len } => {
                            on_message(&buf[HEADER_LEN..HEADER_LEN + len], state);
                            let consumed = HEADER_LEN + len;
                            buf.copy_within(consumed..filled, 0);
                            filled -= consumed;
                        }
                        DecodeOutcome::Invalid => {
                            log!(
                                LogLevel::LogWarn,
                                "invalid frame on {}; draining and reopening",
                                self.own_path.display()
                            );
                            drain_and_close(fd);
                            continue 'outer;
                        }
                    }
                }
            }
            let _ = close(fd);
            let rc = on_before_block(state);
            if rc != 0 {
                return Ok(rc);
            }
        }
    }
}

/// Default `send_retry` attempt budget for a `TASK_DONE` notification;
/// losing one costs the orchestrator a slot forever (spec §4.1).
pub const DEFAULT_MAX_TRIES: u32 = 5;

/// A minimal send-only handle to the server's FIFO, used by forked
/// children (the task runner, the status subprogram) to report their
/// completion. Unlike `Connection` it owns no FIFO of its own to create
/// or unlink.
pub struct ChildSender {
    fd: Option<RawFd>,
}

impl ChildSender {
    pub fn connect() -> Result<ChildSender> {
        let fd = open(
            Path::new(SERVER_FIFO_PATH),
            OFlag::O_WRONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok(ChildSender { fd: Some(fd) })
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::InvalidArgument);
        }
        if bytes.len() > crate::wire::IPC_MAX {
            return Err(Error::MessageTooLong);
        }
        let fd = self.fd.ok_or(Error::InvalidArgument)?;
        let mut frame = Vec::with_capacity(HEADER_LEN + bytes.len());
        frame.extend_from_slice(&SIGNATURE.to_ne_bytes());
        frame.extend_from_slice(&(bytes.len() as u32).to_ne_bytes());
        frame.extend_from_slice(bytes);
        write_frame(fd, &frame)
    }

    pub fn send_retry(&mut self, bytes: &[u8], max_tries: u32) -> Result<()> {
        let mut last_err = Error::Timeout;
        for attempt in 0..max_tries.max(1) {
            match self.send(bytes) {
                Ok(()) => return Ok(()),
                Err(Error::BrokenPipe) | Err(Error::Interrupted) => {
                    log!(
                        LogLevel::LogWarn,
                        "send attempt {} to server fifo failed, reopening",
                        attempt + 1
                    );
                    if let Some(fd) = self.fd.take() {
                        let _ = close(fd);
                    }
                    match open(
                        Path::new(SERVER_FIFO_PATH),
                        OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                        Mode::empty(),
                    ) {
                        Ok(fd) => self.fd = Some(fd),
                        Err(e) => last_err = e.into(),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }
}

impl Drop for ChildSender {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            let _ = close(fd);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(fd) = self.send_fd.take() {
            let _ = close(fd);
        }
        let _ = unlink(&self.own_path);
    }
}

fn write_frame(fd: RawFd, frame: &[u8]) -> Result<()> {
    loop {
        match nix_write(fd, frame) {
            Ok(n) if n == frame.len() => return Ok(()),
            Ok(_) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "short write on a pipe that should have been atomic",
                )))
            }
            Err(nix::Error::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

enum DecodeOutcome {
    Need,
    Valid { len: usize },
    Invalid,
}

fn decode_one(buf: &[u8]) -> DecodeOutcome {
    if buf.len() < HEADER_LEN {
        return DecodeOutcome::Need;
    }
    let sig = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    if sig != SIGNATURE {
        return DecodeOutcome::Invalid;
    }
    let len = u32::from_ne_bytes(buf[4..8].try_into().unwrap()) as usize;
    if len == 0 || len > crate::wire::IPC_MAX {
        return DecodeOutcome::Invalid;
    }
    if buf.len() < HEADER_LEN + len {
        return DecodeOutcome::Need;
    }
    DecodeOutcome::Valid { len }
}

fn drain_and_close(fd: RawFd) {
    let mut trash = [0u8; 4096];
    loop {
        match nix_read(fd, &mut trash) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(nix::Error::EINTR) => continue,
            Err(_) => break,
        }
    }
    let _ = close(fd);
}
