//! Control-message codec.
//!
//! A message on the wire is a single operation byte followed by the payload:
//!
//! ```text
//! +-----------+---------------------+
//! | operation | payload (variable)  |
//! |  1 byte   |                     |
//! +-----------+---------------------+
//! ```
//!
//! There is no length prefix. The transport preserves message boundaries and
//! the receiver knows from the operation how to read the remainder.

use std::fmt;

use crate::error::{EcdysisError, Result};

/// Operating system process id.
pub type Pid = u32;

/// Closed set of control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    /// Bind or adopt listeners and begin serving. Payload: listener snapshot.
    Start = 10,
    /// Replace the running child with a fresh one. Payload: none.
    Restart = 20,
    /// Drain and exit. Payload: none.
    Shutdown = 30,
    /// A child was forked. Payload: pid.
    NewFork = 40,
    /// A child has exited. Payload: pid.
    RemoveChild = 50,
    /// Liveness signal. Payload: timestamp in milliseconds.
    Heartbeat = 60,
}

impl Operation {
    /// Every operation, in wire order.
    pub const ALL: [Operation; 6] = [
        Operation::Start,
        Operation::Restart,
        Operation::Shutdown,
        Operation::NewFork,
        Operation::RemoveChild,
        Operation::Heartbeat,
    ];

    /// Wire tag of this operation.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Operation {
    type Error = EcdysisError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            10 => Ok(Operation::Start),
            20 => Ok(Operation::Restart),
            30 => Ok(Operation::Shutdown),
            40 => Ok(Operation::NewFork),
            50 => Ok(Operation::RemoveChild),
            60 => Ok(Operation::Heartbeat),
            other => Err(EcdysisError::UnknownOperation(other)),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Start => "start",
            Operation::Restart => "restart",
            Operation::Shutdown => "shutdown",
            Operation::NewFork => "new-fork",
            Operation::RemoveChild => "remove-child",
            Operation::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

/// A decoded control message. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Pid of the sending process
    pub sender: Pid,
    /// What the sender asks for
    pub operation: Operation,
    /// Operation-specific payload
    pub payload: Vec<u8>,
}

impl ControlMessage {
    /// Decode a message received from `sender`.
    pub fn decode_from(sender: Pid, bytes: &[u8]) -> Result<Self> {
        let (operation, payload) = decode(bytes)?;
        Ok(Self {
            sender,
            operation,
            payload,
        })
    }

    /// Encode this message for the wire. The sender travels in the transport frame.
    pub fn encode(&self) -> Vec<u8> {
        encode(self.operation, &self.payload)
    }

    /// Read the payload as a pid, falling back to the sender when it is empty.
    pub fn pid_or_sender(&self) -> Result<Pid> {
        if self.payload.is_empty() {
            Ok(self.sender)
        } else {
            decode_pid(&self.payload)
        }
    }
}

/// Encode an operation and payload as `[operation][payload]`.
pub fn encode(operation: Operation, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.len());
    buf.push(operation.as_u8());
    buf.extend_from_slice(payload);
    buf
}

/// Inverse of [`encode`].
///
/// # Errors
///
/// [`EcdysisError::MalformedMessage`] for empty input and
/// [`EcdysisError::UnknownOperation`] for a tag outside the closed set.
pub fn decode(bytes: &[u8]) -> Result<(Operation, Vec<u8>)> {
    let (tag, payload) = bytes
        .split_first()
        .ok_or_else(|| EcdysisError::malformed("empty control message"))?;
    let operation = Operation::try_from(*tag)?;
    Ok((operation, payload.to_vec()))
}

/// Encode a pid payload (4 bytes, big-endian).
pub fn encode_pid(pid: Pid) -> Vec<u8> {
    pid.to_be_bytes().to_vec()
}

/// Decode a pid payload.
pub fn decode_pid(payload: &[u8]) -> Result<Pid> {
    let bytes: [u8; 4] = payload.try_into().map_err(|_| {
        EcdysisError::malformed(format!("pid payload must be 4 bytes, got {}", payload.len()))
    })?;
    Ok(Pid::from_be_bytes(bytes))
}

/// Encode a heartbeat timestamp payload (8 bytes, big-endian milliseconds).
pub fn encode_timestamp(now_ms: u64) -> Vec<u8> {
    now_ms.to_be_bytes().to_vec()
}

/// Decode a heartbeat timestamp payload.
pub fn decode_timestamp(payload: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = payload.try_into().map_err(|_| {
        EcdysisError::malformed(format!(
            "timestamp payload must be 8 bytes, got {}",
            payload.len()
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}
