//! Virtual connections over one TLS link to a backend proxy.
//!
//! Wire unit: `[u8 type][3 reserved][u32 LE id][u32 LE length][payload]`.
//! Connection data carries the dispatcher's own length-prefixed frames, so a
//! frame may arrive split across several data units and is reassembled per
//! connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::protocol::{frame_bytes, FrameCodec, ProtocolError, MAX_FRAME_SIZE};

pub const UNIT_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnitType {
    Datagram = 0,
    NewConnection = 1,
    ConnectionClosed = 2,
    ConnectionData = 3,
}

impl UnitType {
    fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(UnitType::Datagram),
            1 => Some(UnitType::NewConnection),
            2 => Some(UnitType::ConnectionClosed),
            3 => Some(UnitType::ConnectionData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub kind: UnitType,
    pub id: u32,
    pub payload: Bytes,
}

impl Unit {
    pub fn datagram(id: u32, payload: Bytes) -> Self {
        Self {
            kind: UnitType::Datagram,
            id,
            payload,
        }
    }

    pub fn new_connection(id: u32, address: &str) -> Self {
        Self {
            kind: UnitType::NewConnection,
            id,
            payload: Bytes::copy_from_slice(address.as_bytes()),
        }
    }

    pub fn closed(id: u32) -> Self {
        Self {
            kind: UnitType::ConnectionClosed,
            id,
            payload: Bytes::new(),
        }
    }

    /// Wraps one dispatcher message in its length prefix.
    pub fn frame(id: u32, message: &[u8]) -> Self {
        Self {
            kind: UnitType::ConnectionData,
            id,
            payload: frame_bytes(message),
        }
    }
}

// ── MuxCodec ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct MuxCodec {
    max_unit: usize,
}

impl MuxCodec {
    pub fn new() -> Self {
        Self {
            max_unit: MAX_FRAME_SIZE + 4,
        }
    }
}

impl Default for MuxCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MuxCodec {
    type Item = Unit;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Unit>, ProtocolError> {
        if src.len() < UNIT_HEADER_LEN {
            return Ok(None);
        }
        let tag = src[0];
        let id = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        let len = u32::from_le_bytes([src[8], src[9], src[10], src[11]]) as usize;
        let kind = UnitType::from_wire(tag)
            .ok_or_else(|| ProtocolError::Malformed(format!("unknown multiplex unit type {tag}")))?;
        if len > self.max_unit {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_unit,
            });
        }
        if src.len() < UNIT_HEADER_LEN + len {
            src.reserve(UNIT_HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(UNIT_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Unit { kind, id, payload }))
    }
}

impl Encoder<Unit> for MuxCodec {
    type Error = ProtocolError;

    fn encode(&mut self, unit: Unit, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if unit.payload.len() > self.max_unit {
            return Err(ProtocolError::FrameTooLarge {
                size: unit.payload.len(),
                max: self.max_unit,
            });
        }
        dst.reserve(UNIT_HEADER_LEN + unit.payload.len());
        dst.put_u8(unit.kind as u8);
        dst.put_bytes(0, 3);
        dst.put_u32_le(unit.id);
        dst.put_u32_le(unit.payload.len() as u32);
        dst.extend_from_slice(&unit.payload);
        Ok(())
    }
}

// ── Multiplexer ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct VirtualConnection {
    address: String,
    buffer: BytesMut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    Opened { id: u32, address: String },
    /// One complete dispatcher message.
    Frame { id: u32, payload: Bytes },
    /// The connection is gone. `notify_peer` is set when the far side does
    /// not know yet and a closed unit must be sent.
    Closed { id: u32, notify_peer: bool },
    Datagram { id: u32, payload: Bytes },
}

/// Connection table and per-connection reassembly. Pure state: the caller
/// owns the socket and acts on the returned events and units.
#[derive(Debug)]
pub struct Multiplexer {
    next_id: u32,
    connections: BTreeMap<u32, VirtualConnection>,
    codec: FrameCodec,
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            connections: BTreeMap::new(),
            codec: FrameCodec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn address(&self, id: u32) -> Option<&str> {
        self.connections.get(&id).map(|c| c.address.as_str())
    }

    /// Opens a locally initiated connection, returning its id and the unit
    /// announcing it.
    pub fn open(&mut self, address: &str) -> (u32, Unit) {
        let mut id = self.next_id;
        while id == 0 || self.connections.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);
        self.connections.insert(
            id,
            VirtualConnection {
                address: address.to_string(),
                buffer: BytesMut::new(),
            },
        );
        (id, Unit::new_connection(id, address))
    }

    /// Closes a connection from this side. Returns the unit to send, or
    /// `None` if the connection was already gone.
    pub fn close(&mut self, id: u32) -> Option<Unit> {
        self.connections.remove(&id).map(|_| Unit::closed(id))
    }

    pub fn receive(&mut self, unit: Unit) -> Vec<MuxEvent> {
        let mut events = Vec::new();
        match unit.kind {
            UnitType::Datagram => events.push(MuxEvent::Datagram {
                id: unit.id,
                payload: unit.payload,
            }),
            UnitType::NewConnection => {
                if self.connections.remove(&unit.id).is_some() {
                    debug!("multiplex id {} reopened, dropping the old connection", unit.id);
                    events.push(MuxEvent::Closed {
                        id: unit.id,
                        notify_peer: false,
                    });
                }
                let address = String::from_utf8_lossy(&unit.payload).into_owned();
                self.connections.insert(
                    unit.id,
                    VirtualConnection {
                        address: address.clone(),
                        buffer: BytesMut::new(),
                    },
                );
                events.push(MuxEvent::Opened { id: unit.id, address });
            }
            UnitType::ConnectionClosed => {
                if self.connections.remove(&unit.id).is_some() {
                    events.push(MuxEvent::Closed {
                        id: unit.id,
                        notify_peer: false,
                    });
                }
            }
            UnitType::ConnectionData => {
                let Some(conn) = self.connections.get_mut(&unit.id) else {
                    debug!("data for unknown multiplex id {}", unit.id);
                    return events;
                };
                conn.buffer.extend_from_slice(&unit.payload);
                loop {
                    match self.codec.decode(&mut conn.buffer) {
                        Ok(Some(payload)) => events.push(MuxEvent::Frame { id: unit.id, payload }),
                        Ok(None) => break,
                        Err(e) => {
                            debug!("multiplex id {}: {e}", unit.id);
                            self.connections.remove(&unit.id);
                            events.push(MuxEvent::Closed {
                                id: unit.id,
                                notify_peer: true,
                            });
                            break;
                        }
                    }
                }
            }
        }
        events
    }

    /// The underlying link is gone: every connection closes exactly once.
    pub fn disconnect_all(&mut self) -> Vec<MuxEvent> {
        std::mem::take(&mut self.connections)
            .into_keys()
            .map(|id| MuxEvent::Closed {
                id,
                notify_peer: false,
            })
            .collect()
    }
}
