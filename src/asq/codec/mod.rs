//! The framed binary wire format.
//!
//! Exactly one `Message` maps onto one contiguous frame. The first
//! byte selects the message kind; the remainder is the per-kind field
//! list, all multi-byte integers big-endian. Frames are bounded by
//! `MAX_FRAME_SIZE`, small enough to survive an IPv4 payload.
//!
//! Decoding is incremental: a buffer holding less than a whole frame
//! decodes to `None` without consuming anything, so a transport can
//! feed partial reads back in as bytes arrive.

pub mod convert;

use crate::asq::error::*;
use crate::asq::protocol::value::{Tuple, Value};
use crate::asq::protocol::{Block, Close, Control, Message, Open, PipeId};

/// Maximum length of one encoded frame.
pub const MAX_FRAME_SIZE: usize = 65_507;

/// Maximum cardinality of an encoded list or map.
pub const MAX_CARDINALITY: usize = 65_535;

/// Maximum byte length of an encoded string or binary field.
pub const MAX_CHUNK: usize = 65_535;

/// Maximum nesting depth of an encoded `Value`.
///
/// Deeper structures are rejected rather than decoded recursively
/// into a stack overflow.
pub const MAX_DEPTH: usize = 64;

// frame kind tags
const KIND_OPEN: u8 = b'(';
const KIND_CLOSE: u8 = b')';
const KIND_BLOCK: u8 = b'#';
const KIND_CONTROL: u8 = b'*';

// value tags
const TAG_NULL: u8 = 0;
const TAG_TRUE: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_INT8: u8 = 3;
const TAG_INT16: u8 = 4;
const TAG_INT32: u8 = 5;
const TAG_INT64: u8 = 6;
const TAG_FLOAT32: u8 = 7;
const TAG_FLOAT64: u8 = 8;
const TAG_BINARY: u8 = 10;
const TAG_STRING: u8 = 11;
const TAG_UUID: u8 = 12;
const TAG_LIST: u8 = 32;
const TAG_MAP: u8 = 33;
const TAG_TUPLE: u8 = 34;

// reads that run off the end of the buffer yield `None`
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

/// Encodes one message into a single contiguous frame.
///
/// Fails if any field is out of range or the produced frame would
/// exceed `MAX_FRAME_SIZE`; nothing is emitted on failure.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(32);
    match message {
        Message::Open(open) => {
            check_pipe_id(open.pipe_id)?;
            buf.push(KIND_OPEN);
            buf.extend_from_slice(&u16::from(open.pipe_id).to_be_bytes());
            buf.push(open.priority as u8);
            buf.extend_from_slice(&open.function_id.to_be_bytes());
            write_value(&mut buf, &Value::List(open.params.clone()), 0)?;
        }
        Message::Close(close) => {
            check_pipe_id(close.pipe_id)?;
            buf.push(KIND_CLOSE);
            buf.extend_from_slice(&u16::from(close.pipe_id).to_be_bytes());
            match &close.result {
                Ok(value) => {
                    buf.push(TAG_TRUE);
                    write_value(&mut buf, value, 0)?;
                }
                Err(abort) => {
                    buf.push(TAG_FALSE);
                    buf.extend_from_slice(&abort.code.to_be_bytes());
                    write_chunk(&mut buf, abort.message.as_bytes())?;
                }
            }
        }
        Message::Block(block) => {
            check_pipe_id(block.pipe_id)?;
            if block.payload.len() > Block::MAX_PAYLOAD {
                return Err("Block payload exceeds the maximum size").wrapped(ErrorKind::Codec);
            }
            buf.push(KIND_BLOCK);
            buf.extend_from_slice(&u16::from(block.pipe_id).to_be_bytes());
            buf.push(block.status());
            write_chunk(&mut buf, &block.payload)?;
        }
        Message::Control(control) => {
            if control.code == Control::END_OF_MESSAGE {
                return Err("The end-of-message control is never encoded")
                    .wrapped(ErrorKind::Codec);
            }
            buf.push(KIND_CONTROL);
            buf.push(control.code);
            write_chunk(&mut buf, &control.data)?;
        }
    }
    if buf.len() > MAX_FRAME_SIZE {
        return Err("Encoded frame exceeds the maximum size").wrapped(ErrorKind::Codec);
    }
    Ok(buf)
}

/// Decodes one message from the start of `buf`.
///
/// Returns `None` when the buffer doesn't yet hold a whole frame,
/// otherwise the message and the number of bytes consumed. Malformed
/// frames fail with a codec error.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>> {
    let mut reader = Reader::new(buf);
    let kind = need!(reader.u8());
    let message = match kind {
        KIND_OPEN => {
            let pipe_id = decode_pipe_id(need!(reader.u16()))?;
            let priority = need!(reader.u8()) as i8;
            let function_id = need!(reader.u16());
            let params = match need!(read_value(&mut reader, 0)?) {
                Value::List(params) => params,
                _ => {
                    return Err("Open parameters are not a list").wrapped(ErrorKind::Codec);
                }
            };
            Message::Open(Open::new(pipe_id, priority, function_id, params))
        }
        KIND_CLOSE => {
            let pipe_id = decode_pipe_id(need!(reader.u16()))?;
            match need!(reader.u8()) {
                TAG_TRUE => {
                    let value = need!(read_value(&mut reader, 0)?);
                    Message::Close(Close::with_success(pipe_id, value))
                }
                TAG_FALSE => {
                    let code = need!(reader.i32());
                    let message = need!(reader.chunk());
                    let message = std::str::from_utf8(message)
                        .wrapped_msg(ErrorKind::Codec, "Abort message is not valid UTF-8")?;
                    Message::Close(Close::with_error(pipe_id, code, message))
                }
                _ => {
                    return Err("Invalid boolean tag inside Close").wrapped(ErrorKind::Codec);
                }
            }
        }
        KIND_BLOCK => {
            let pipe_id = decode_pipe_id(need!(reader.u16()))?;
            let status = need!(reader.u8());
            let len = need!(reader.u16()) as usize;
            if len > Block::MAX_PAYLOAD {
                // reject the declared length without waiting for the bytes
                return Err("Block payload exceeds the maximum size").wrapped(ErrorKind::Codec);
            }
            let payload = need!(reader.take(len));
            let (eof, loss) = Block::split_status(status);
            let mut block = Block::new(pipe_id, payload.to_vec()).with_loss(loss);
            block.eof = eof;
            Message::Block(block)
        }
        KIND_CONTROL => {
            let code = need!(reader.u8());
            let data = need!(reader.chunk());
            Message::Control(Control::new(code, data.to_vec()))
        }
        _ => {
            return Err("Unknown frame kind tag").wrapped(ErrorKind::Codec);
        }
    };
    if reader.pos > MAX_FRAME_SIZE {
        return Err("Decoded frame exceeds the maximum size").wrapped(ErrorKind::Codec);
    }
    Ok(Some((message, reader.pos)))
}

/// Encodes a single tagged value, outside any frame.
///
/// Used by diagnostic tooling; `encode` drives the same routine for
/// `Open` parameters and `Close` results.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(16);
    write_value(&mut buf, value, 0)?;
    Ok(buf)
}

/// Decodes a single tagged value, outside any frame.
pub fn decode_value(buf: &[u8]) -> Result<Option<(Value, usize)>> {
    let mut reader = Reader::new(buf);
    let value = need!(read_value(&mut reader, 0)?);
    Ok(Some((value, reader.pos)))
}

fn check_pipe_id(pipe_id: PipeId) -> Result<()> {
    if pipe_id.is_control() {
        return Err("Pipe id 0 is reserved for Control frames").wrapped(ErrorKind::Codec);
    }
    Ok(())
}

fn decode_pipe_id(raw: u16) -> Result<PipeId> {
    let pipe_id = PipeId::from(raw);
    check_pipe_id(pipe_id)?;
    Ok(pipe_id)
}

fn write_chunk(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_CHUNK {
        return Err("Field exceeds the maximum chunk size").wrapped(ErrorKind::Codec);
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn write_value(buf: &mut Vec<u8>, value: &Value, depth: usize) -> Result<()> {
    if depth >= MAX_DEPTH {
        return Err("Value nesting exceeds the maximum depth").wrapped(ErrorKind::Codec);
    }
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(true) => buf.push(TAG_TRUE),
        Value::Bool(false) => buf.push(TAG_FALSE),
        Value::Int8(v) => {
            buf.push(TAG_INT8);
            buf.push(*v as u8);
        }
        Value::Int16(v) => {
            buf.push(TAG_INT16);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Int32(v) => {
            buf.push(TAG_INT32);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Int64(v) => {
            buf.push(TAG_INT64);
            buf.extend_from_slice(&v.to_be_bytes());
        }
        Value::Float32(v) => {
            buf.push(TAG_FLOAT32);
            buf.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::Float64(v) => {
            buf.push(TAG_FLOAT64);
            buf.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::Binary(bytes) => {
            buf.push(TAG_BINARY);
            write_chunk(buf, bytes)?;
        }
        Value::Text(text) => {
            buf.push(TAG_STRING);
            write_chunk(buf, text.as_bytes())?;
        }
        Value::Uuid(uuid) => {
            buf.push(TAG_UUID);
            buf.extend_from_slice(uuid.as_bytes());
        }
        Value::List(items) => {
            write_cardinality(buf, TAG_LIST, items.len())?;
            for item in items {
                write_value(buf, item, depth + 1)?;
            }
        }
        Value::Map(pairs) => {
            write_cardinality(buf, TAG_MAP, pairs.len())?;
            for (key, val) in pairs {
                write_value(buf, key, depth + 1)?;
                write_value(buf, val, depth + 1)?;
            }
        }
        Value::Tuple(tuple) => {
            if tuple.arity() > Tuple::MAX_ARITY {
                return Err("Tuple arity exceeds the maximum").wrapped(ErrorKind::Codec);
            }
            buf.push(TAG_TUPLE);
            buf.push(tuple.arity() as u8);
            for field in tuple.fields() {
                write_value(buf, field, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn write_cardinality(buf: &mut Vec<u8>, tag: u8, len: usize) -> Result<()> {
    if len > MAX_CARDINALITY {
        return Err("Cardinality exceeds the maximum").wrapped(ErrorKind::Codec);
    }
    buf.push(tag);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    Ok(())
}

fn read_value(reader: &mut Reader<'_>, depth: usize) -> Result<Option<Value>> {
    if depth >= MAX_DEPTH {
        return Err("Value nesting exceeds the maximum depth").wrapped(ErrorKind::Codec);
    }
    let value = match need!(reader.u8()) {
        TAG_NULL => Value::Null,
        TAG_TRUE => Value::Bool(true),
        TAG_FALSE => Value::Bool(false),
        TAG_INT8 => Value::Int8(need!(reader.u8()) as i8),
        TAG_INT16 => Value::Int16(need!(reader.u16()) as i16),
        TAG_INT32 => Value::Int32(need!(reader.i32())),
        TAG_INT64 => Value::Int64(need!(reader.i64())),
        TAG_FLOAT32 => Value::Float32(f32::from_bits(need!(reader.u32()))),
        TAG_FLOAT64 => Value::Float64(f64::from_bits(need!(reader.u64()))),
        TAG_BINARY => Value::Binary(need!(reader.chunk()).to_vec()),
        TAG_STRING => {
            let bytes = need!(reader.chunk());
            let text = std::str::from_utf8(bytes)
                .wrapped_msg(ErrorKind::Codec, "String field is not valid UTF-8")?;
            Value::Text(text.to_owned())
        }
        TAG_UUID => {
            let bytes = need!(reader.take(16));
            let mut raw = [0; 16];
            raw.copy_from_slice(bytes);
            Value::Uuid(uuid::Uuid::from_bytes(raw))
        }
        TAG_LIST => {
            let count = need!(reader.u16()) as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(need!(read_value(reader, depth + 1)?));
            }
            Value::List(items)
        }
        TAG_MAP => {
            let count = need!(reader.u16()) as usize;
            let mut pairs = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let key = need!(read_value(reader, depth + 1)?);
                let val = need!(read_value(reader, depth + 1)?);
                pairs.push((key, val));
            }
            Value::Map(pairs)
        }
        TAG_TUPLE => {
            let arity = need!(reader.u8()) as usize;
            let mut fields = Vec::with_capacity(arity);
            for _ in 0..arity {
                fields.push(need!(read_value(reader, depth + 1)?));
            }
            Value::Tuple(Tuple::new(fields))
        }
        _ => {
            return Err("Unknown value tag").wrapped(ErrorKind::Codec);
        }
    };
    Ok(Some(value))
}

/// Cursor over a byte buffer; every read reports `None` on
/// truncation so partial frames surface as "not enough bytes yet".
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| {
            u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    fn i32(&mut self) -> Option<i32> {
        self.u32().map(|v| v as i32)
    }

    fn i64(&mut self) -> Option<i64> {
        self.u64().map(|v| v as i64)
    }

    /// A length-prefixed byte field: u16 length, then that many bytes.
    fn chunk(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asq::protocol::Abort;
    use uuid::Uuid;

    fn round_trip(message: Message) {
        let encoded = encode(&message).expect("encode failed");
        let (decoded, advance) = decode(&encoded)
            .expect("decode failed")
            .expect("frame was complete");
        assert_eq!(advance, encoded.len());
        assert_eq!(decoded, message);
    }

    fn every_value() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int8(-8),
            Value::Int16(-1616),
            Value::Int32(-32_3232),
            Value::Int64(-64_646_464),
            Value::Float32(1.5),
            Value::Float64(-2.25),
            Value::Binary(vec![0xDE, 0xAD]),
            Value::Text("草薙".into()),
            Value::Uuid(Uuid::new_v4()),
            Value::List(vec![Value::Int8(1), Value::Null]),
            Value::Map(vec![(Value::Text("k".into()), Value::Int32(9))]),
            Value::Tuple(Tuple::new(vec![Value::Bool(true), Value::Int64(7)])),
        ]
    }

    #[test]
    fn open_round_trip() {
        round_trip(Message::Open(Open::new(
            PipeId::from(0x8001),
            -1,
            10,
            every_value(),
        )));
        round_trip(Message::Open(Open::new(PipeId::from(1), 0, 0, vec![])));
    }

    #[test]
    fn close_round_trip_every_result_tag() {
        for value in every_value() {
            round_trip(Message::Close(Close::with_success(PipeId::from(7), value)));
        }
        round_trip(Message::Close(Close::with_error(
            PipeId::from(7),
            Abort::FUNCTION_UNDEFINED,
            "no such function",
        )));
    }

    #[test]
    fn block_round_trip() {
        round_trip(Message::Block(
            Block::new(PipeId::from(2), vec![1, 2, 3]).with_loss(31),
        ));
        round_trip(Message::Block(Block::eof(PipeId::from(2))));
    }

    #[test]
    fn control_round_trip() {
        round_trip(Message::Control(Control::new(Control::CLOSE, vec![])));
        round_trip(Message::Control(Control::new(
            Control::SYNC_SESSION,
            vec![0; 51],
        )));
    }

    #[test]
    fn end_of_message_is_never_encoded() {
        let msg = Message::Control(Control::end_of_message());
        assert!(encode(&msg).is_err());
    }

    #[test]
    fn nonzero_pipe_id_is_enforced() {
        let msg = Message::Block(Block::new(PipeId::from(0), vec![]));
        assert!(encode(&msg).is_err());

        // hand-craft a Block frame with pipe id 0
        let bad = [KIND_BLOCK, 0, 0, 0, 0, 0];
        assert!(decode(&bad[..]).is_err());
    }

    #[test]
    fn block_payload_boundary() {
        let ok = Message::Block(Block::new(PipeId::from(1), vec![0; Block::MAX_PAYLOAD]));
        assert!(encode(&ok).is_ok());

        let over = Message::Block(Block::new(
            PipeId::from(1),
            vec![0; Block::MAX_PAYLOAD + 1],
        ));
        assert!(encode(&over).is_err());
    }

    #[test]
    fn list_cardinality_boundary() {
        let ok = Value::List(vec![Value::Null; MAX_CARDINALITY]);
        assert!(encode_value(&ok).is_ok());

        let over = Value::List(vec![Value::Null; MAX_CARDINALITY + 1]);
        assert!(encode_value(&over).is_err());
    }

    #[test]
    fn tuple_arity_boundary() {
        let ok = Value::Tuple(Tuple::new(vec![Value::Null; Tuple::MAX_ARITY]));
        assert!(encode_value(&ok).is_ok());

        let over = Value::Tuple(Tuple::new(vec![Value::Null; Tuple::MAX_ARITY + 1]));
        assert!(encode_value(&over).is_err());
    }

    #[test]
    fn oversize_frame_is_rejected_before_emission() {
        // params big enough to push the frame past the cap
        let params = vec![Value::Binary(vec![0; MAX_CHUNK]); 2];
        let msg = Message::Open(Open::new(PipeId::from(1), 0, 1, params));
        assert!(encode(&msg).is_err());
    }

    #[test]
    fn incomplete_frames_decode_to_none() {
        let frame = encode(&Message::Block(Block::new(
            PipeId::from(5),
            vec![9; 100],
        )))
        .unwrap();
        for cut in 0..frame.len() {
            assert!(decode(&frame[..cut]).expect("partial frame is not an error").is_none());
        }
    }

    #[test]
    fn back_to_back_frames_advance_correctly() {
        let first = encode(&Message::Control(Control::close())).unwrap();
        let second = encode(&Message::Block(Block::eof(PipeId::from(3)))).unwrap();
        let mut buf = first.clone();
        buf.extend_from_slice(&second);

        let (msg, advance) = decode(&buf).unwrap().unwrap();
        assert_eq!(msg, Message::Control(Control::close()));
        assert_eq!(advance, first.len());

        let (msg, advance) = decode(&buf[first.len()..]).unwrap().unwrap();
        assert_eq!(msg, Message::Block(Block::eof(PipeId::from(3))));
        assert_eq!(advance, second.len());
    }

    #[test]
    fn unknown_tags_are_malformed() {
        assert!(decode(&[0xFF, 0, 0][..]).is_err());
        assert!(decode_value(&[99][..]).is_err());
    }

    #[test]
    fn invalid_close_bool_tag_is_malformed() {
        let bad = [KIND_CLOSE, 0, 7, 42];
        assert!(decode(&bad[..]).is_err());
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let mut value = Value::Null;
        for _ in 0..(MAX_DEPTH + 4) {
            value = Value::List(vec![value]);
        }
        assert!(encode_value(&value).is_err());

        // hand-craft a too-deep byte stream: 70 nested single-item lists
        let mut bytes = Vec::new();
        for _ in 0..70 {
            bytes.extend_from_slice(&[TAG_LIST, 0, 1]);
        }
        bytes.push(TAG_NULL);
        assert!(decode_value(&bytes).is_err());
    }
}
