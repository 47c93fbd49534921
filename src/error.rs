//! Crate-wide error kinds.
//!
//! Mirrors the teacher's habit of returning plain `io::Result<()>` from
//! command objects rather than reaching for an error-handling crate: this is
//! one flat enum with a variant per failure kind named in the spec, plus two
//! wrapping variants for the only two external fallible layers this crate
//! actually touches (`std::io` and `nix`).

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Caller passed a null/out-of-range value. Always local, never sent
    /// over the wire.
    InvalidArgument,
    /// A decoded frame's payload length was above `ipc::IPC_MAX`.
    MessageTooLong,
    /// A decoded frame's payload length was zero, or fewer bytes remained
    /// in the stream than the frame's header claimed.
    TooShort,
    /// Allocation failed during setup or dispatch.
    OutOfMemory,
    /// The tokenizer rejected a command line.
    ParseFailure,
    /// The status scheduler had no free slot.
    CapacityExceeded,
    /// A send hit `EPIPE`; only returned once `send_retry` exhausts its
    /// attempts.
    BrokenPipe,
    /// A send was interrupted by a signal; only returned once `send_retry`
    /// exhausts its attempts.
    Interrupted,
    /// `send_retry` exhausted `max_tries` without a successful write.
    Timeout,
    /// A log record's on-disk length field was inconsistent with the
    /// record layout.
    InvalidSequence,
    /// Startup failed in a way that should terminate the process: the
    /// server FIFO already exists, the output directory is unwritable, or
    /// the log file could not be opened.
    FatalStartup,
    /// A scheduler slot index was out of range, or named a vacant slot.
    Range,
    Io(std::io::Error),
    Sys(nix::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::MessageTooLong => write!(f, "message too long for a single frame"),
            Error::TooShort => write!(f, "message shorter than its declared length"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::ParseFailure => write!(f, "parsing failure"),
            Error::CapacityExceeded => write!(f, "no capacity available"),
            Error::BrokenPipe => write!(f, "broken pipe"),
            Error::Interrupted => write!(f, "interrupted"),
            Error::Timeout => write!(f, "timed out retrying a send"),
            Error::InvalidSequence => write!(f, "invalid sequence in log file"),
            Error::FatalStartup => write!(f, "fatal startup error"),
            Error::Range => write!(f, "slot index out of range or vacant"),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Sys(e) => write!(f, "system call error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Sys(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        match e {
            nix::Error::EPIPE => Error::BrokenPipe,
            nix::Error::EINTR => Error::Interrupted,
            nix::Error::ENOMEM => Error::OutOfMemory,
            other => Error::Sys(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
