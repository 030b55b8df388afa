// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Wire framing.
//!
//! Every frame is a fixed 12-byte header followed by an opaque body:
//!
//! | offset | size | field            |
//! |--------|------|------------------|
//! | 0      | 1    | magic `0xCC`     |
//! | 1      | 1    | version `0x01`   |
//! | 2      | 1    | message type     |
//! | 3      | 4    | sequence id, BE  |
//! | 7      | 1    | compress (0)     |
//! | 8      | 4    | body length, BE  |
//! | 12     | n    | body             |
//!
//! Message-type discriminants are part of the wire contract; reordering
//! the enum breaks interop.

use crate::buffer::{ByteArray, ByteArrayError};

pub const MAGIC: u8 = 0xCC;
pub const VERSION: u8 = 0x01;

/// Header size in bytes.
pub const BASE_LENGTH: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad magic byte 0x{0:02x}")]
    BadMagic(u8),

    #[error("unknown message type {0}")]
    UnknownMsgType(u8),

    #[error("truncated frame")]
    Truncated(#[from] ByteArrayError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::FromRepr)]
#[repr(u8)]
pub enum MsgType {
    HeartbeatPacket = 0,
    RpcProvider = 1,
    RpcConsumer = 2,
    RpcMethodRequest = 3,
    RpcMethodResponse = 4,
    RpcServiceRegister = 5,
    RpcServiceRegisterResponse = 6,
    RpcServiceDiscover = 7,
    RpcServiceDiscoverResponse = 8,
    RpcSubscribeRequest = 9,
    RpcSubscribeResponse = 10,
    RpcPublishRequest = 11,
    RpcPublishResponse = 12,
}

/// Decoded frame header; the body is read separately so a session can
/// size-check before allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub msg_type: MsgType,
    pub sequence_id: u32,
    pub compress: u8,
    pub content_length: u32,
}

impl FrameHeader {
    /// Parse the 12 header bytes at the buffer's cursor; rejects a wrong
    /// magic byte.
    pub fn decode(buffer: &mut ByteArray) -> Result<Self, ProtocolError> {
        let magic = buffer.read_u8()?;
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let version = buffer.read_u8()?;
        let raw_type = buffer.read_u8()?;
        let msg_type =
            MsgType::from_repr(raw_type).ok_or(ProtocolError::UnknownMsgType(raw_type))?;
        let sequence_id = buffer.read_fu32()?;
        let compress = buffer.read_u8()?;
        let content_length = buffer.read_fu32()?;
        Ok(Self {
            version,
            msg_type,
            sequence_id,
            compress,
            content_length,
        })
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    msg_type: MsgType,
    sequence_id: u32,
    compress: u8,
    content: Vec<u8>,
}

impl Protocol {
    #[must_use]
    pub fn new(msg_type: MsgType, content: Vec<u8>, sequence_id: u32) -> Self {
        Self {
            msg_type,
            sequence_id,
            compress: 0,
            content,
        }
    }

    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(MsgType::HeartbeatPacket, Vec::new(), 0)
    }

    pub(crate) fn from_parts(header: FrameHeader, content: Vec<u8>) -> Self {
        Self {
            msg_type: header.msg_type,
            sequence_id: header.sequence_id,
            compress: header.compress,
            content,
        }
    }

    #[must_use]
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    #[must_use]
    pub fn sequence_id(&self) -> u32 {
        self.sequence_id
    }

    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    #[must_use]
    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    /// Serialize into a fresh buffer, cursor rewound and ready to write to
    /// a socket.
    #[must_use]
    pub fn encode(&self) -> ByteArray {
        let mut buffer = ByteArray::new();
        buffer.write_u8(MAGIC);
        buffer.write_u8(VERSION);
        buffer.write_u8(self.msg_type as u8);
        buffer.write_fu32(self.sequence_id);
        buffer.write_u8(self.compress);
        buffer.write_fu32(self.content.len() as u32);
        buffer.write(&self.content);
        buffer.set_position(0).expect("position 0 is always valid");
        buffer
    }

    /// Parse a whole frame (header + body) from the buffer's cursor.
    pub fn decode(buffer: &mut ByteArray) -> Result<Self, ProtocolError> {
        let header = FrameHeader::decode(buffer)?;
        let mut content = vec![0u8; header.content_length as usize];
        buffer.read(&mut content)?;
        Ok(Self::from_parts(header, content))
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{} seq={} len={}]",
            self.msg_type,
            self.sequence_id,
            self.content.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_round_trip() {
        let frame = Protocol::new(MsgType::RpcMethodRequest, b"payload".to_vec(), 77);
        let mut encoded = frame.encode();
        assert_eq!(encoded.size(), BASE_LENGTH + 7);
        let back = Protocol::decode(&mut encoded).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn empty_body_frame_is_just_the_header() {
        let frame = Protocol::heartbeat();
        let mut encoded = frame.encode();
        assert_eq!(encoded.size(), BASE_LENGTH);
        let back = Protocol::decode(&mut encoded).unwrap();
        assert_eq!(back.msg_type(), MsgType::HeartbeatPacket);
        assert!(back.content().is_empty());
    }

    #[test]
    fn header_layout_is_bit_exact() {
        let frame = Protocol::new(MsgType::RpcMethodResponse, vec![0xAA, 0xBB], 0x0102_0304);
        let encoded = frame.encode();
        let bytes = encoded.to_bytes();
        assert_eq!(
            bytes,
            vec![
                0xCC, // magic
                0x01, // version
                0x04, // RpcMethodResponse
                0x01, 0x02, 0x03, 0x04, // sequence id, big-endian
                0x00, // compress
                0x00, 0x00, 0x00, 0x02, // content length, big-endian
                0xAA, 0xBB,
            ]
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let frame = Protocol::heartbeat();
        let bytes = {
            let encoded = frame.encode();
            let mut raw = encoded.to_bytes();
            raw[0] = 0x00;
            raw
        };
        let mut buffer = ByteArray::from_bytes(&bytes);
        assert!(matches!(
            FrameHeader::decode(&mut buffer),
            Err(ProtocolError::BadMagic(0x00))
        ));
    }

    #[test]
    fn msg_type_discriminants_are_wire_stable() {
        assert_eq!(MsgType::HeartbeatPacket as u8, 0);
        assert_eq!(MsgType::RpcProvider as u8, 1);
        assert_eq!(MsgType::RpcConsumer as u8, 2);
        assert_eq!(MsgType::RpcMethodRequest as u8, 3);
        assert_eq!(MsgType::RpcMethodResponse as u8, 4);
        assert_eq!(MsgType::RpcServiceRegister as u8, 5);
        assert_eq!(MsgType::RpcServiceRegisterResponse as u8, 6);
        assert_eq!(MsgType::RpcServiceDiscover as u8, 7);
        assert_eq!(MsgType::RpcServiceDiscoverResponse as u8, 8);
        assert_eq!(MsgType::RpcSubscribeRequest as u8, 9);
        assert_eq!(MsgType::RpcSubscribeResponse as u8, 10);
        assert_eq!(MsgType::RpcPublishRequest as u8, 11);
        assert_eq!(MsgType::RpcPublishResponse as u8, 12);
    }
}
