// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Framed send/recv over one stream socket.
//!
//! Receiving is single-reader by construction (each connection has one
//! reader task); sending is serialized by a [`CoMutex`] so any number of
//! tasks may publish or request on the same connection and frames never
//! interleave byte-wise.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::ByteArray;
use crate::net::TcpStream;
use crate::sync::CoMutex;

use super::protocol::{BASE_LENGTH, FrameHeader, Protocol};

#[derive(Debug)]
pub struct RpcSession {
    stream: TcpStream,
    send_lock: CoMutex<()>,
}

impl RpcSession {
    #[must_use]
    pub fn new(stream: TcpStream) -> Arc<Self> {
        Arc::new(Self {
            stream,
            send_lock: CoMutex::new(()),
        })
    }

    #[must_use]
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.stream.is_closed()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Shut the underlying stream down; parked reads and writes unwind
    /// with EOF / closed errors.
    pub fn close(&self) {
        self.stream.shutdown();
    }

    /// Read one frame. `Ok(None)` on clean EOF, receive timeout, or a
    /// garbage header (the connection is useless either way; callers drop
    /// it).
    pub async fn recv_protocol(&self) -> io::Result<Option<Protocol>> {
        let mut head = ByteArray::new();
        match self.stream.read_exact_buf(&mut head, BASE_LENGTH).await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                tracing::debug!("session receive timed out");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        head.set_position(0).expect("position 0 is always valid");
        let header = match FrameHeader::decode(&mut head) {
            Ok(header) => header,
            Err(error) => {
                tracing::warn!(%error, "dropping session on malformed frame header");
                return Ok(None);
            }
        };

        if header.content_length == 0 {
            return Ok(Some(Protocol::from_parts(header, Vec::new())));
        }

        let mut body = ByteArray::new();
        match self
            .stream
            .read_exact_buf(&mut body, header.content_length as usize)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => return Err(e),
        }
        body.set_position(0).expect("position 0 is always valid");
        Ok(Some(Protocol::from_parts(header, body.to_bytes())))
    }

    /// Write one whole frame under the session send lock.
    pub async fn send_protocol(&self, frame: &Protocol) -> io::Result<()> {
        let mut encoded = frame.encode();
        let _guard = self.send_lock.lock().await;
        self.stream.write_all_buf(&mut encoded).await
    }
}
