//! Typed messages with bit-exact wire layouts (C2).
//!
//! Struct layouts are packed and serialized field-by-field in host byte
//! order, never reinterpret-cast over a buffer (spec §9, "Manual
//! fixed-size serialization with packed structs"). `IPC_MAX` bounds every
//! encoded message so it fits in a single atomic pipe write.

use crate::error::{Error, Result};
use crate::task::Timestamp;
use nix::unistd::Pid;

/// `PIPE_BUF` minus the 8-byte frame header (signature + length).
pub const IPC_MAX: usize = crate::ipc::PIPE_BUF - 8;

// Client -> server tags.
const TAG_SEND_PROGRAM: u8 = 0;
const TAG_SEND_TASK: u8 = 1;
const TAG_TASK_DONE: u8 = 2;
const TAG_STATUS: u8 = 3;

// Server -> client tags.
const TAG_ERROR: u8 = 0;
const TAG_TASK_ID: u8 = 1;
const TAG_STATUS_REPLY: u8 = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    /// `SEND_PROGRAM`: the parsed task must have exactly one stage; that
    /// invariant is enforced by the orchestrator after parsing, not here.
    SendProgram {
        client_pid: Pid,
        time_sent: Timestamp,
        expected_time_ms: u32,
        command_line: Vec<u8>,
    },
    /// `SEND_TASK`: pipelines are allowed.
    SendTask {
        client_pid: Pid,
        time_sent: Timestamp,
        expected_time_ms: u32,
        command_line: Vec<u8>,
    },
    TaskDone {
        slot: u32,
        time_ended: Timestamp,
        is_status: bool,
        error: bool,
    },
    Status {
        client_pid: Pid,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskStatus {
    Done,
    Executing,
    Queued,
}

impl TaskStatus {
    fn to_wire(self) -> u8 {
        match self {
            TaskStatus::Done => 0,
            TaskStatus::Executing => 1,
            TaskStatus::Queued => 2,
        }
    }

    fn from_wire(b: u8) -> Result<TaskStatus> {
        match b {
            0 => Ok(TaskStatus::Done),
            1 => Ok(TaskStatus::Executing),
            2 => Ok(TaskStatus::Queued),
            _ => Err(Error::TooShort),
        }
    }
}

/// Microsecond timing, `NaN` when undefined (e.g. a `QUEUED` task has no
/// executing time). Kept as `f64` rather than an `Option` so the wire
/// layout stays a flat run of doubles, matching the spec's literal
/// description of the `STATUS` reply.
pub type MicrosOrNan = f64;

#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    Error {
        message: String,
    },
    TaskId {
        id: u32,
    },
    Status {
        status: TaskStatus,
        id: u32,
        error: bool,
        time_c2s_fifo: MicrosOrNan,
        time_waiting: MicrosOrNan,
        time_executing: MicrosOrNan,
        time_s2s_fifo: MicrosOrNan,
        command_line: Vec<u8>,
    },
}

fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}
fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}
fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_ne_bytes());
}
fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_ne_bytes());
}
fn put_bytes(buf: &mut Vec<u8>, v: &[u8]) {
    buf.extend_from_slice(v);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < self.pos + n {
            return Err(Error::TooShort);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Remainder of the buffer: used for the trailing variable-length
    /// `command_line` field, whose length is implied by the frame size
    /// rather than length-prefixed.
    fn rest(&mut self) -> &'a [u8] {
        let s = &self.buf[self.pos..];
        self.pos = self.buf.len();
        s
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32);
        match self {
            ClientMessage::SendProgram {
                client_pid,
                time_sent,
                expected_time_ms,
                command_line,
            } => {
                put_u8(&mut buf, TAG_SEND_PROGRAM);
                put_u32(&mut buf, client_pid.as_raw() as u32);
                put_u64(&mut buf, time_sent.as_nanos());
                put_u32(&mut buf, *expected_time_ms);
                put_bytes(&mut buf, command_line);
            }
            ClientMessage::SendTask {
                client_pid,
                time_sent,
                expected_time_ms,
                command_line,
            } => {
                put_u8(&mut buf, TAG_SEND_TASK);
                put_u32(&mut buf, client_pid.as_raw() as u32);
                put_u64(&mut buf, time_sent.as_nanos());
                put_u32(&mut buf, *expected_time_ms);
                put_bytes(&mut buf, command_line);
            }
            ClientMessage::TaskDone {
                slot,
                time_ended,
                is_status,
                error,
            } => {
                put_u8(&mut buf, TAG_TASK_DONE);
                put_u32(&mut buf, *slot);
                put_u64(&mut buf, time_ended.as_nanos());
                put_u8(&mut buf, *is_status as u8);
                put_u8(&mut buf, *error as u8);
            }
            ClientMessage::Status { client_pid } => {
                put_u8(&mut buf, TAG_STATUS);
                put_u32(&mut buf, client_pid.as_raw() as u32);
            }
        }
        if buf.len() > IPC_MAX {
            return Err(Error::MessageTooLong);
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<ClientMessage> {
        if bytes.is_empty() {
            return Err(Error::TooShort);
        }
        if bytes.len() > IPC_MAX {
            return Err(Error::MessageTooLong);
        }
        let mut c = Cursor::new(bytes);
        let tag = c.u8()?;
        match tag {
            TAG_SEND_PROGRAM | TAG_SEND_TASK => {
                let client_pid = Pid::from_raw(c.u32()? as i32);
                let time_sent = Timestamp::from_nanos(c.u64()?);
                let expected_time_ms = c.u32()?;
                let command_line = c.rest().to_vec();
                Ok(if tag == TAG_SEND_PROGRAM {
                    ClientMessage::SendProgram {
                        client_pid,
                        time_sent,
                        expected_time_ms,
                        command_line,
                    }
                } else {
                    ClientMessage::SendTask {
                        client_pid,
                        time_sent,
                        expected_time_ms,
                        command_line,
                    }
                })
            }
            TAG_TASK_DONE => {
                let slot = c.u32()?;
                let time_ended = Timestamp::from_nanos(c.u64()?);
                let is_status = c.u8()? != 0;
                let error = c.u8()? != 0;
                Ok(ClientMessage::TaskDone {
                    slot,
                    time_ended,
                    is_status,
                    error,
                })
            }
            TAG_STATUS => {
                let client_pid = Pid::from_raw(c.u32()? as i32);
                Ok(ClientMessage::Status { client_pid })
            }
            _ => Err(Error::TooShort),
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(32);
        match self {
            ServerMessage::Error { message } => {
                put_u8(&mut buf, TAG_ERROR);
                put_bytes(&mut buf, message.as_bytes());
            }
            ServerMessage::TaskId { id } => {
                put_u8(&mut buf, TAG_TASK_ID);
                put_u32(&mut buf, *id);
            }
            ServerMessage::Status {
                status,
                id,
                error,
                time_c2s_fifo,
                time_waiting,
                time_executing,
                time_s2s_fifo,
                command_line,
            } => {
                put_u8(&mut buf, TAG_STATUS_REPLY);
                put_u8(&mut buf, status.to_wire());
                put_u32(&mut buf, *id);
                put_u8(&mut buf, *error as u8);
                put_f64(&mut buf, *time_c2s_fifo);
                put_f64(&mut buf, *time_waiting);
                put_f64(&mut buf, *time_executing);
                put_f64(&mut buf, *time_s2s_fifo);
                put_bytes(&mut buf, command_line);
            }
        }
        if buf.len() > IPC_MAX {
            return Err(Error::MessageTooLong);
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<ServerMessage> {
        if bytes.is_empty() {
            return Err(Error::TooShort);
        }
        if bytes.len() > IPC_MAX {
            return Err(Error::MessageTooLong);
        }
        let mut c = Cursor::new(bytes);
        let tag = c.u8()?;
        match tag {
            TAG_ERROR => {
                let message = String::from_utf8_lossy(c.rest()).into_owned();
                Ok(ServerMessage::Error { message })
            }
            TAG_TASK_ID => Ok(ServerMessage::TaskId { id: c.u32()? }),
            TAG_STATUS_REPLY => {
                let status = TaskStatus::from_wire(c.u8()?)?;
                let id = c.u32()?;
                let error = c.u8()? != 0;
                let time_c2s_fifo = c.f64()?;
                let time_waiting = c.f64()?;
                let time_executing = c.f64()?;
                let time_s2s_fifo = c.f64()?;
                let command_line = c.rest().to_vec();
                Ok(ServerMessage::Status {
                    status,
                    id,
                    error,
                    time_c2s_fifo,
                    time_waiting,
                    time_executing,
                    time_s2s_fifo,
                    command_line,
                })
            }
            _ => Err(Error::TooShort),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_task_round_trips() {
        let msg = ClientMessage::SendTask {
            client_pid: Pid::from_raw(1234),
            time_sent: Timestamp::from_nanos(999),
            expected_time_ms: 500,
            command_line: b"echo hi".to_vec(),
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn task_done_round_trips() {
        let msg = ClientMessage::TaskDone {
            slot: 3,
            time_ended: Timestamp::from_nanos(42),
            is_status: true,
            error: false,
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn status_reply_round_trips_with_nan_timings() {
        let msg = ServerMessage::Status {
            status: TaskStatus::Queued,
            id: 7,
            error: false,
            time_c2s_fifo: 12.5,
            time_waiting: f64::NAN,
            time_executing: f64::NAN,
            time_s2s_fifo: f64::NAN,
            command_line: b"sleep 1".to_vec(),
        };
        let encoded = msg.encode().unwrap();
        match ServerMessage::decode(&encoded).unwrap() {
            ServerMessage::Status {
                status,
                id,
                time_c2s_fifo,
                time_waiting,
                ..
            } => {
                assert_eq!(status, TaskStatus::Queued);
                assert_eq!(id, 7);
                assert_eq!(time_c2s_fifo, 12.5);
                assert!(time_waiting.is_nan());
            }
            other => panic!("wrong variant decoded: {:?}", other),
        }
    }

    #[test]
    fn error_message_round_trips() {
        let msg = ServerMessage::Error {
            message: "Parsing failure!".to_string(),
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(ServerMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn oversized_command_line_is_rejected_at_encode() {
        let msg = ClientMessage::SendTask {
            client_pid: Pid::from_raw(1),
            time_sent: Timestamp::from_nanos(0),
            expected_time_ms: 0,
            command_line: vec![b'x'; IPC_MAX + 1],
        };
        assert!(matches!(msg.encode(), Err(Error::MessageTooLong)));
    }

    #[test]
    fn empty_payload_is_rejected_at_decode() {
        assert!(matches!(ClientMessage::decode(&[]), Err(Error::TooShort)));
    }
}
