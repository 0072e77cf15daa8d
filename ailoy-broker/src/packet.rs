//! The broker packet and its framed binary encoding.
//!
//! Wire layout, in order: packet type (`u8`), flags (`u8`), transaction id
//! (`u64`, big-endian), component id (16 bytes, all-zero when absent), then
//! a `u32` length prefix and the body encoded as JSON.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use ailoy_types::Value;

use crate::error::BrokerError;

/// Fixed header size: type + flags + tx id + component uuid + body length.
const HEADER_LEN: usize = 1 + 1 + 8 + 16 + 4;

/// Flag bit reserved for MessagePack-encoded bodies. Not produced by this
/// implementation; rejected on receive.
pub const FLAG_MSGPACK: u8 = 0b0000_0001;

/// The kind of a broker packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Create a component.
    Define = 1,
    /// Destroy a component.
    Delete = 2,
    /// Invoke a stateless module operator.
    Call = 3,
    /// Invoke an instant component method (one response frame).
    CallMethod = 4,
    /// Invoke an iterative component method (partial* then final/error).
    IterMethod = 5,
    /// Cancel an in-flight iterative call.
    Cancel = 6,
    /// Successful single response.
    Ok = 7,
    /// Failed response; body is `{kind, message}`.
    Error = 8,
    /// One frame of an iterative response.
    Partial = 9,
    /// Terminal frame of an iterative response.
    Final = 10,
}

impl PacketType {
    /// Decode from the wire byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => PacketType::Define,
            2 => PacketType::Delete,
            3 => PacketType::Call,
            4 => PacketType::CallMethod,
            5 => PacketType::IterMethod,
            6 => PacketType::Cancel,
            7 => PacketType::Ok,
            8 => PacketType::Error,
            9 => PacketType::Partial,
            10 => PacketType::Final,
            _ => return None,
        })
    }

    /// True for packets that originate on the client side.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            PacketType::Define
                | PacketType::Delete
                | PacketType::Call
                | PacketType::CallMethod
                | PacketType::IterMethod
                | PacketType::Cancel
        )
    }
}

/// A typed packet routed by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// The packet kind.
    pub ptype: PacketType,
    /// Reserved flag bits; zero in this implementation.
    pub flags: u8,
    /// Client-scoped transaction id correlating responses to requests.
    pub tx_id: u64,
    /// Addressed component, when the operation targets one.
    pub component_id: Option<Uuid>,
    /// The payload.
    pub body: Value,
}

impl Packet {
    /// A request/response packet without a component address.
    pub fn new(ptype: PacketType, tx_id: u64, body: Value) -> Self {
        Self {
            ptype,
            flags: 0,
            tx_id,
            component_id: None,
            body,
        }
    }

    /// A packet addressed to a component.
    pub fn to_component(ptype: PacketType, tx_id: u64, component_id: Uuid, body: Value) -> Self {
        Self {
            ptype,
            flags: 0,
            tx_id,
            component_id: Some(component_id),
            body,
        }
    }

    /// Encode into a single wire frame.
    pub fn encode(&self) -> Bytes {
        let body = serde_json::to_vec(&self.body).unwrap_or_else(|_| b"null".to_vec());
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_u8(self.ptype as u8);
        buf.put_u8(self.flags);
        buf.put_u64(self.tx_id);
        buf.put_slice(self.component_id.unwrap_or(Uuid::nil()).as_bytes());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        buf.freeze()
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; the buffer is left untouched in that case.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, BrokerError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([
            buf[HEADER_LEN - 4],
            buf[HEADER_LEN - 3],
            buf[HEADER_LEN - 2],
            buf[HEADER_LEN - 1],
        ]) as usize;
        if buf.len() < HEADER_LEN + body_len {
            return Ok(None);
        }

        let type_byte = buf.get_u8();
        let ptype = PacketType::from_u8(type_byte)
            .ok_or_else(|| BrokerError::Codec(format!("unknown packet type {type_byte}")))?;
        let flags = buf.get_u8();
        if flags & FLAG_MSGPACK != 0 {
            return Err(BrokerError::Codec("msgpack bodies not supported".into()));
        }
        let tx_id = buf.get_u64();
        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let uuid = Uuid::from_bytes(uuid_bytes);
        let component_id = (!uuid.is_nil()).then_some(uuid);
        let _ = buf.get_u32();
        let body_bytes = buf.split_to(body_len);
        let body: Value = serde_json::from_slice(&body_bytes)
            .map_err(|e| BrokerError::Codec(format!("invalid packet body: {e}")))?;

        Ok(Some(Packet {
            ptype,
            flags,
            tx_id,
            component_id,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_component_id() {
        let id = Uuid::new_v4();
        let packet = Packet::to_component(
            PacketType::CallMethod,
            42,
            id,
            Value::map([("method", Value::from("infer"))]),
        );
        let mut buf = BytesMut::from(&packet.encode()[..]);
        let decoded = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn nil_uuid_decodes_as_absent() {
        let packet = Packet::new(PacketType::Ok, 7, Value::Null);
        let mut buf = BytesMut::from(&packet.encode()[..]);
        let decoded = Packet::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.component_id, None);
    }

    #[test]
    fn partial_frame_leaves_buffer_untouched() {
        let packet = Packet::new(PacketType::Partial, 1, Value::from("chunk"));
        let frame = packet.encode();
        let mut buf = BytesMut::from(&frame[..frame.len() - 3]);
        let before = buf.len();
        assert!(Packet::decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn two_frames_decode_in_order() {
        let first = Packet::new(PacketType::Partial, 5, Value::Int(1));
        let second = Packet::new(PacketType::Final, 5, Value::Null);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first.encode());
        buf.extend_from_slice(&second.encode());
        assert_eq!(Packet::decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(Packet::decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_type_is_a_codec_error() {
        let mut frame = BytesMut::from(&Packet::new(PacketType::Ok, 1, Value::Null).encode()[..]);
        frame[0] = 0xff;
        assert!(matches!(
            Packet::decode(&mut frame),
            Err(BrokerError::Codec(_))
        ));
    }

    #[test]
    fn request_classification() {
        assert!(PacketType::IterMethod.is_request());
        assert!(!PacketType::Partial.is_request());
    }
}
