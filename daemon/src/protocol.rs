//! Wire protocol shared by direct and proxied sessions.
//!
//! Every message is a MessagePack array whose first element is a short ASCII
//! command tag, carried in a frame prefixed by its u32 little-endian length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rmpv::Value;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frames are capped at 16 MiB so a hostile length prefix cannot force a huge allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const LEN_PREFIX: usize = 4;

pub const CMD_NOOP: &str = "nop";
pub const CMD_TERMINATE: &str = "xxx";
pub const CMD_AUTH: &str = "aut";
pub const CMD_SUBSCRIBE_CMD: &str = "sub";
pub const CMD_SUBSCRIBE_GROUP: &str = "grp";
pub const CMD_QUERY: &str = "qry";
pub const CMD_VALUE: &str = "val";
pub const CMD_VALUE_SET: &str = "set";
pub const CMD_MISSING: &str = "mis";
pub const CMD_COMMAND: &str = "cmd";
pub const CMD_UNKNOWN: &str = "unk";
pub const CMD_RESPONSE: &str = "rsp";
pub const CMD_LOG: &str = "log";
pub const CMD_SCREENSHOT: &str = "scr";
pub const CMD_SHOW_SCREEN_IDS: &str = "ids";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success = 0,
    Error = 1,
    Unknown = 2,
    Data = 3,
}

impl ResponseCode {
    pub fn from_wire(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::Error),
            2 => Some(Self::Unknown),
            3 => Some(Self::Data),
            _ => None,
        }
    }
}

impl From<ResponseCode> for Value {
    fn from(code: ResponseCode) -> Self {
        Value::from(code as i64)
    }
}

/// Declared type of a positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Bool,
    Int,
    StringList,
    Bytes,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgKind::String => "String",
            ArgKind::Bool => "Bool",
            ArgKind::Int => "Int",
            ArgKind::StringList => "StringList",
            ArgKind::Bytes => "ByteArray",
        };
        f.write_str(name)
    }
}

/// Malformed traffic. Always fatal to the session that sent it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("Short packet from client {client} command:{command} size:{size}")]
    ShortPacket {
        client: String,
        command: String,
        size: usize,
    },

    #[error("Wrong variant type from client {client} command:{command} index:{index} should be {expected}")]
    WrongType {
        client: String,
        command: String,
        index: usize,
        expected: ArgKind,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// `[u32 LE length][payload]` framing. Partial input is buffered until the
/// whole payload has arrived; several frames in one read decode in order.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame,
            });
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.len() > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame,
            });
        }
        dst.reserve(LEN_PREFIX + item.len());
        dst.put_u32_le(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Prepends the length prefix to an already-encoded payload.
pub fn frame_bytes(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

// ── Messages ──────────────────────────────────────────────────────────────────

pub fn encode_message(items: Vec<Value>) -> Bytes {
    let mut buf = Vec::new();
    // Writing into a Vec only fails on allocation failure.
    if let Err(e) = rmpv::encode::write_value(&mut buf, &Value::Array(items)) {
        tracing::error!("failed to encode message: {e}");
    }
    Bytes::from(buf)
}

/// Decodes a frame payload into its element list. The list must be non-empty
/// and start with a string command tag.
pub fn decode_message(payload: &[u8]) -> Result<Vec<Value>, ProtocolError> {
    let mut cursor = payload;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    match value {
        Value::Array(items) if items.first().map(Value::is_str).unwrap_or(false) => Ok(items),
        Value::Array(_) => Err(ProtocolError::Malformed(
            "message does not start with a command tag".to_string(),
        )),
        _ => Err(ProtocolError::Malformed("message is not a list".to_string())),
    }
}

// ── Positional argument parsing ───────────────────────────────────────────────

/// Reads typed arguments one at a time from a fixed offset. The first short
/// or mistyped argument fails the whole command.
pub struct ArgParser<'a> {
    command: &'a str,
    client: &'a str,
    items: &'a [Value],
    index: usize,
}

impl<'a> ArgParser<'a> {
    pub fn new(command: &'a str, client: &'a str, items: &'a [Value], offset: usize) -> Self {
        Self {
            command,
            client,
            items,
            index: offset,
        }
    }

    fn next(&mut self) -> Result<(usize, &'a Value), ProtocolError> {
        let index = self.index;
        let value = self.items.get(index).ok_or_else(|| ProtocolError::ShortPacket {
            client: self.client.to_string(),
            command: self.command.to_string(),
            size: self.items.len(),
        })?;
        self.index += 1;
        Ok((index, value))
    }

    fn wrong(&self, index: usize, expected: ArgKind) -> ProtocolError {
        ProtocolError::WrongType {
            client: self.client.to_string(),
            command: self.command.to_string(),
            index,
            expected,
        }
    }

    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let (index, v) = self.next()?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| self.wrong(index, ArgKind::String))
    }

    pub fn bool(&mut self) -> Result<bool, ProtocolError> {
        let (index, v) = self.next()?;
        v.as_bool().ok_or_else(|| self.wrong(index, ArgKind::Bool))
    }

    pub fn int(&mut self) -> Result<i64, ProtocolError> {
        let (index, v) = self.next()?;
        v.as_i64().ok_or_else(|| self.wrong(index, ArgKind::Int))
    }

    pub fn string_list(&mut self) -> Result<Vec<String>, ProtocolError> {
        let (index, v) = self.next()?;
        let items = v
            .as_array()
            .ok_or_else(|| self.wrong(index, ArgKind::StringList))?;
        items
            .iter()
            .map(|s| {
                s.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.wrong(index, ArgKind::StringList))
            })
            .collect()
    }

    /// Binary blob. Nil is accepted as an empty blob.
    pub fn bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let (index, v) = self.next()?;
        match v {
            Value::Binary(b) => Ok(b.clone()),
            Value::Nil => Ok(Vec::new()),
            _ => Err(self.wrong(index, ArgKind::Bytes)),
        }
    }

    /// Any value at all, untyped. Used for `set` payloads whose type depends
    /// on the property.
    pub fn value(&mut self) -> Result<Value, ProtocolError> {
        self.next().map(|(_, v)| v.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(items: Vec<Value>) -> Bytes {
        encode_message(items)
    }

    // ── FrameCodec ────────────────────────────────────────────────────────────

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0, b'h', b'e'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"llo");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_yields_multiple_frames_from_one_read_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        for payload in [&b"one"[..], b"two", b""] {
            codec.encode(Bytes::copy_from_slice(payload), &mut buf).unwrap();
        }
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::from_static(b"two"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Bytes::new());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_oversized_length_before_buffering() {
        let mut codec = FrameCodec::with_max_frame(8);
        let mut buf = BytesMut::from(&[9u8, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { size: 9, max: 8 })
        ));
    }

    #[test]
    fn length_prefix_is_little_endian() {
        let framed = frame_bytes(&[0xAA; 258]);
        assert_eq!(&framed[..4], &[2, 1, 0, 0]);
        assert_eq!(framed.len(), 262);
    }

    // ── messages ──────────────────────────────────────────────────────────────

    #[test]
    fn decode_message_returns_element_list() {
        let bytes = msg(vec![Value::from("qry"), Value::from("app"), Value::from("")]);
        let items = decode_message(&bytes).unwrap();
        assert_eq!(items[0].as_str(), Some("qry"));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn decode_message_rejects_non_list_and_empty_list() {
        assert!(decode_message(&msg(vec![])).is_err());
        let mut scalar = Vec::new();
        rmpv::encode::write_value(&mut scalar, &Value::from(7)).unwrap();
        assert!(decode_message(&scalar).is_err());
        assert!(decode_message(&[0xc1]).is_err());
    }

    #[test]
    fn decode_message_rejects_non_string_tag() {
        assert!(decode_message(&msg(vec![Value::from(1), Value::from("x")])).is_err());
    }

    // ── ArgParser ─────────────────────────────────────────────────────────────

    #[test]
    fn parser_reads_typed_arguments_from_offset() {
        let items = vec![
            Value::from("cmd"),
            Value::from("app"),
            Value::from("startAppVars"),
            Value::from("web"),
            Value::Array(vec![Value::from("PORT=80")]),
            Value::from(true),
            Value::from(42),
            Value::Binary(vec![1, 2]),
        ];
        let mut p = ArgParser::new("startAppVars", "TCP:1.2.3.4:5", &items, 3);
        assert_eq!(p.string().unwrap(), "web");
        assert_eq!(p.string_list().unwrap(), vec!["PORT=80"]);
        assert!(p.bool().unwrap());
        assert_eq!(p.int().unwrap(), 42);
        assert_eq!(p.bytes().unwrap(), vec![1, 2]);
    }

    #[test]
    fn parser_reports_short_packet() {
        let items = vec![Value::from("cmd"), Value::from("app"), Value::from("addApp")];
        let mut p = ArgParser::new("addApp", "TCP:h:1", &items, 3);
        let err = p.string().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Short packet from client TCP:h:1 command:addApp size:3"
        );
    }

    #[test]
    fn parser_reports_wrong_type_with_index() {
        let items = vec![Value::from("aut"), Value::from(3)];
        let mut p = ArgParser::new("aut", "TCP:h:1", &items, 1);
        let err = p.string().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::WrongType { index: 1, expected: ArgKind::String, .. }
        ));
    }

    #[test]
    fn parser_accepts_nil_as_empty_bytes() {
        let items = vec![Value::Nil];
        let mut p = ArgParser::new("execute", "c", &items, 0);
        assert!(p.bytes().unwrap().is_empty());
    }

    #[test]
    fn response_codes_round_trip_through_wire_ints() {
        for code in [
            ResponseCode::Success,
            ResponseCode::Error,
            ResponseCode::Unknown,
            ResponseCode::Data,
        ] {
            let v: Value = code.into();
            assert_eq!(ResponseCode::from_wire(v.as_i64().unwrap()), Some(code));
        }
        assert_eq!(ResponseCode::from_wire(9), None);
    }
}
