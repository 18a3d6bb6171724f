//! Message types framed onto the wire between two connected nodes.
//!
//! Every message except `Control` belongs to a pipe, identified by a
//! 16-bit id unique within the session. The high bit of a pipe id
//! belongs to whichever endpoint was designated primary during the
//! handshake, letting both sides allocate ids concurrently without
//! coordination.

pub mod value;

use std::fmt;

use uuid::Uuid;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::asq::error::*;
use crate::asq::protocol::value::Value;

/// The id of a pipe within one session.
///
/// Id `0` is reserved for `Control` messages and never identifies a
/// pipe.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct PipeId(u16);

impl PipeId {
    /// The reserved id carried by `Control` frames.
    pub const CONTROL: PipeId = PipeId(0);

    /// The bit owned by the primary endpoint of a session.
    pub const PRIMARY_MASK: u16 = 0x8000;

    /// Whether this is the reserved control id.
    #[inline]
    pub fn is_control(self) -> bool {
        self.0 == 0
    }

    /// Whether the primary endpoint allocated this id.
    #[inline]
    pub fn on_primary_side(self) -> bool {
        self.0 & Self::PRIMARY_MASK != 0
    }
}

impl From<u16> for PipeId {
    #[inline]
    fn from(id: u16) -> PipeId {
        PipeId(id)
    }
}

impl From<PipeId> for u16 {
    #[inline]
    fn from(id: PipeId) -> u16 {
        id.0
    }
}

impl From<PipeId> for u64 {
    #[inline]
    fn from(id: PipeId) -> u64 {
        id.0 as u64
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:04x}", self.0)
    }
}

/// The `Message` type encompasses all frames traded between two
/// connected nodes.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum Message {
    /// Start a call to a remote function on a new pipe.
    Open(Open),
    /// The terminal message of a pipe in each direction.
    Close(Close),
    /// Streaming payload between `Open` and `Close`.
    Block(Block),
    /// Session level signalling; never belongs to a pipe.
    Control(Control),
}

impl Message {
    /// Returns the pipe this message belongs to.
    ///
    /// `Control` messages report the reserved id `PipeId::CONTROL`.
    pub fn pipe_id(&self) -> PipeId {
        match self {
            Message::Open(m) => m.pipe_id,
            Message::Close(m) => m.pipe_id,
            Message::Block(m) => m.pipe_id,
            Message::Control(_) => PipeId::CONTROL,
        }
    }
}

/// The intent "start a call to function `function_id` with these
/// arguments on the new pipe `pipe_id`".
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Open {
    pub(crate) pipe_id: PipeId,
    pub(crate) priority: i8,
    pub(crate) function_id: u16,
    pub(crate) params: Vec<Value>,
}

impl Open {
    /// Creates a new `Open` message.
    pub fn new(pipe_id: PipeId, priority: i8, function_id: u16, params: Vec<Value>) -> Self {
        Self {
            pipe_id,
            priority,
            function_id,
            params,
        }
    }

    pub fn pipe_id(&self) -> PipeId {
        self.pipe_id
    }

    pub fn priority(&self) -> i8 {
        self.priority
    }

    pub fn function_id(&self) -> u16 {
        self.function_id
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

/// A normal remote-call failure, surfaced on the pipe's future via
/// `Close`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Abort {
    pub(crate) code: i32,
    pub(crate) message: String,
}

impl Abort {
    /// Not an error; only valid inside the ok variant of a `Close`.
    pub const SUCCESS: i32 = 0;
    /// The peer reported a failure without a meaningful code.
    pub const UNEXPECTED: i32 = -1;
    /// The session is shutting down while the call was in flight.
    pub const SESSION_CLOSING: i32 = -2;
    /// The peer doesn't host the requested service.
    pub const SERVICE_UNDEFINED: i32 = 100;
    /// The service doesn't define the requested function.
    pub const FUNCTION_UNDEFINED: i32 = 101;
    /// The function ran and reported a failure.
    pub const FUNCTION_FAILED: i32 = 102;
    /// A `Block` reached a pipe that never declared stream reception.
    pub const FUNCTION_CANNOT_RECEIVE_BLOCK: i32 = 103;
    /// A `Block` reached a pipe id with no live pipe behind it.
    pub const DESTINATION_PIPE_UNREACHABLE: i32 = 104;

    /// Creates a new `Abort` with the given code and message.
    pub fn new<S: Into<String>>(code: i32, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "abort({}): {}", self.code, self.message)
    }
}

impl std::error::Error for Abort {}

/// The terminal message of a pipe, carrying the final result of the
/// call in one direction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Close {
    pub(crate) pipe_id: PipeId,
    pub(crate) result: std::result::Result<Value, Abort>,
}

impl Close {
    /// Creates a `Close` reporting the successful result `value`.
    pub fn with_success(pipe_id: PipeId, value: Value) -> Self {
        Self {
            pipe_id,
            result: Ok(value),
        }
    }

    /// Creates a `Close` reporting a failure with `code` and `message`.
    pub fn with_error<S: Into<String>>(pipe_id: PipeId, code: i32, message: S) -> Self {
        Self::with_abort(pipe_id, Abort::new(code, message))
    }

    /// Creates a `Close` reporting the failure `abort`.
    pub fn with_abort(pipe_id: PipeId, abort: Abort) -> Self {
        Self {
            pipe_id,
            result: Err(abort),
        }
    }

    pub fn pipe_id(&self) -> PipeId {
        self.pipe_id
    }

    pub fn result(&self) -> &std::result::Result<Value, Abort> {
        &self.result
    }

    pub fn into_result(self) -> std::result::Result<Value, Abort> {
        self.result
    }
}

/// Streaming payload carried by a pipe between `Open` and `Close`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Block {
    pub(crate) pipe_id: PipeId,
    pub(crate) eof: bool,
    pub(crate) loss: u8,
    pub(crate) payload: Vec<u8>,
}

impl Block {
    /// Maximum payload length of a single `Block`.
    pub const MAX_PAYLOAD: usize = 61_439;

    /// Maximum drop-tolerance hint; `0` means never drop.
    pub const MAX_LOSS: u8 = 0x7F;

    /// Creates a new, non-terminal `Block` carrying `payload`.
    pub fn new(pipe_id: PipeId, payload: Vec<u8>) -> Self {
        Self {
            pipe_id,
            eof: false,
            loss: 0,
            payload,
        }
    }

    /// Creates the terminal `Block` of a stream, with an empty payload.
    pub fn eof(pipe_id: PipeId) -> Self {
        Self {
            pipe_id,
            eof: true,
            loss: 0,
            payload: Vec::new(),
        }
    }

    /// Attaches a drop-tolerance hint for intermediaries.
    ///
    /// The hint is carried and range checked, but nothing in this
    /// crate drops lossy blocks.
    pub fn with_loss(mut self, loss: u8) -> Self {
        self.loss = loss;
        self
    }

    pub fn pipe_id(&self) -> PipeId {
        self.pipe_id
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn loss(&self) -> u8 {
        self.loss
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Packs the eof flag and loss hint into the wire status byte.
    pub(crate) fn status(&self) -> u8 {
        ((self.eof as u8) << 7) | (self.loss & Self::MAX_LOSS)
    }

    /// Splits the wire status byte back into eof flag and loss hint.
    pub(crate) fn split_status(status: u8) -> (bool, u8) {
        (status & 0x80 != 0, status & Self::MAX_LOSS)
    }
}

/// Session level signalling outside the pipe space.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct Control {
    pub(crate) code: u8,
    pub(crate) data: Vec<u8>,
}

impl Control {
    /// Handshake exchange; the first frame in both directions.
    pub const SYNC_SESSION: u8 = 0x51;

    /// Orderly session teardown.
    pub const CLOSE: u8 = 0x43;

    /// Terminal queue marker. Reserved: never sent on the wire, and
    /// the frame codec refuses to encode it.
    pub const END_OF_MESSAGE: u8 = 0x45;

    /// Creates a new `Control` message.
    pub fn new(code: u8, data: Vec<u8>) -> Self {
        Self { code, data }
    }

    /// Creates the orderly session teardown message.
    pub fn close() -> Self {
        Self::new(Self::CLOSE, Vec::new())
    }

    /// Creates the internal terminal queue marker.
    pub(crate) fn end_of_message() -> Self {
        Self::new(Self::END_OF_MESSAGE, Vec::new())
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// The handshake payload exchanged inside a `Control{SyncSession}`
/// frame, as the first message on an established wire in both
/// directions.
///
/// The body is a fixed layout independent of the value codec:
///
/// ```text
/// u16 version
/// 16B local node UUID
/// 16B session UUID (zero when sent by the secondary)
/// u8  service id length, followed by that many UTF-8 bytes
/// i64 utc time millis
/// i32 ping interval seconds
/// i32 session timeout seconds
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct SyncSession {
    pub version: u16,
    pub node_id: Uuid,
    pub session_id: Uuid,
    pub service_id: String,
    pub utc_time: i64,
    pub ping_interval: i32,
    pub session_timeout: i32,
}

impl SyncSession {
    /// Protocol version 1.0.
    pub const VERSION_1_0: u16 = 0x0100;

    /// Maximum UTF-8 length of a service id.
    pub const MAX_SERVICE_ID: usize = 255;

    /// Length of the body with an empty service id.
    pub const MIN_LENGTH: usize = 2 + 16 + 16 + 1 + 8 + 4 + 4;

    /// Serializes this handshake into its `Control` frame.
    ///
    /// Fails if the service id exceeds `MAX_SERVICE_ID` UTF-8 bytes.
    pub fn to_control(&self) -> Result<Control> {
        let service = self.service_id.as_bytes();
        if service.len() > Self::MAX_SERVICE_ID {
            return Err("Service id exceeds 255 bytes").wrapped(ErrorKind::Protocol);
        }
        let mut data = Vec::with_capacity(Self::MIN_LENGTH + service.len());
        data.extend_from_slice(&self.version.to_be_bytes());
        data.extend_from_slice(self.node_id.as_bytes());
        data.extend_from_slice(self.session_id.as_bytes());
        data.push(service.len() as u8);
        data.extend_from_slice(service);
        data.extend_from_slice(&self.utc_time.to_be_bytes());
        data.extend_from_slice(&self.ping_interval.to_be_bytes());
        data.extend_from_slice(&self.session_timeout.to_be_bytes());
        Ok(Control::new(Control::SYNC_SESSION, data))
    }

    /// Parses a handshake back out of a `Control` frame.
    pub fn from_control(control: &Control) -> Result<Self> {
        if control.code != Control::SYNC_SESSION {
            return Err("Control frame is not a session handshake").wrapped(ErrorKind::Protocol);
        }
        let body = &control.data[..];
        if body.len() < Self::MIN_LENGTH {
            return Err("Handshake body is shorter than the fixed layout")
                .wrapped(ErrorKind::Protocol);
        }
        let version = u16::from_be_bytes([body[0], body[1]]);
        let node_id = Uuid::from_bytes(read_16(&body[2..18]));
        let session_id = Uuid::from_bytes(read_16(&body[18..34]));
        let service_len = body[34] as usize;
        if body.len() < Self::MIN_LENGTH + service_len {
            return Err("Declared service id length exceeds the handshake body")
                .wrapped(ErrorKind::Protocol);
        }
        let service_id = std::str::from_utf8(&body[35..35 + service_len])
            .wrapped_msg(ErrorKind::Protocol, "Service id is not valid UTF-8")?
            .to_owned();
        let rest = &body[35 + service_len..];
        let utc_time = i64::from_be_bytes(read_8(&rest[..8]));
        let ping_interval = i32::from_be_bytes(read_4(&rest[8..12]));
        let session_timeout = i32::from_be_bytes(read_4(&rest[12..16]));
        Ok(Self {
            version,
            node_id,
            session_id,
            service_id,
            utc_time,
            ping_interval,
            session_timeout,
        })
    }
}

fn read_16(buf: &[u8]) -> [u8; 16] {
    let mut out = [0; 16];
    out.copy_from_slice(&buf[..16]);
    out
}

fn read_8(buf: &[u8]) -> [u8; 8] {
    let mut out = [0; 8];
    out.copy_from_slice(&buf[..8]);
    out
}

fn read_4(buf: &[u8]) -> [u8; 4] {
    let mut out = [0; 4];
    out.copy_from_slice(&buf[..4]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_id_sides() {
        assert!(PipeId::from(0x8001).on_primary_side());
        assert!(!PipeId::from(0x0001).on_primary_side());
        assert!(PipeId::from(0).is_control());
        assert!(!PipeId::from(1).is_control());
    }

    #[test]
    fn block_status_round_trip() {
        let block = Block::new(PipeId::from(9), vec![1, 2, 3]).with_loss(5);
        assert_eq!(Block::split_status(block.status()), (false, 5));
        let eof = Block::eof(PipeId::from(9));
        assert_eq!(Block::split_status(eof.status()), (true, 0));
    }

    #[test]
    fn sync_session_round_trip() {
        let sync = SyncSession {
            version: SyncSession::VERSION_1_0,
            node_id: Uuid::new_v4(),
            session_id: Uuid::nil(),
            service_id: "echo".into(),
            utc_time: 1_234_567_890,
            ping_interval: 10,
            session_timeout: 30,
        };
        let control = sync.to_control().expect("serialize failed");
        let parsed = SyncSession::from_control(&control).expect("parse failed");
        assert_eq!(sync, parsed);
    }

    #[test]
    fn sync_session_rejects_short_body() {
        let control = Control::new(Control::SYNC_SESSION, vec![0; SyncSession::MIN_LENGTH - 1]);
        assert!(SyncSession::from_control(&control).is_err());
    }

    #[test]
    fn sync_session_rejects_truncated_service_id() {
        let sync = SyncSession {
            version: SyncSession::VERSION_1_0,
            node_id: Uuid::nil(),
            session_id: Uuid::nil(),
            service_id: String::new(),
            utc_time: 0,
            ping_interval: 1,
            session_timeout: 1,
        };
        let mut control = sync.to_control().unwrap();
        // declare a longer service id than the body holds
        control.data[34] = 200;
        assert!(SyncSession::from_control(&control).is_err());
    }

    #[test]
    fn sync_session_rejects_oversize_service_id() {
        let sync = SyncSession {
            version: SyncSession::VERSION_1_0,
            node_id: Uuid::nil(),
            session_id: Uuid::nil(),
            service_id: "x".repeat(256),
            utc_time: 0,
            ping_interval: 1,
            session_timeout: 1,
        };
        assert!(sync.to_control().is_err());
    }

    #[test]
    fn sync_session_service_id_at_cap() {
        let sync = SyncSession {
            version: SyncSession::VERSION_1_0,
            node_id: Uuid::nil(),
            session_id: Uuid::nil(),
            service_id: "x".repeat(255),
            utc_time: 0,
            ping_interval: 1,
            session_timeout: 1,
        };
        let control = sync.to_control().expect("serialize failed");
        let parsed = SyncSession::from_control(&control).expect("parse failed");
        assert_eq!(parsed.service_id.len(), 255);
    }
}
