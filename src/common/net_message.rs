//! Wire framing for the jam protocol.
//!
//! Every message on the TCP stream is a 5 byte header followed by the payload:
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0 | 1 | message type |
//! | 1 | 4 | payload length (little endian) |
//! | 5 | len | payload |
//!
//! The framing layer never looks inside the payload.  That is the job of
//! [`crate::common::message_body`].
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

use super::jam_error::JamError;

pub const HEADER_SIZE: usize = 5;
pub const MAX_PAYLOAD: usize = 16384;

pub const MESSAGE_KEEPALIVE: u8 = 0xFD;
pub const MESSAGE_EXTENDED: u8 = 0xFE;
pub const MESSAGE_INVALID: u8 = 0xFF;

/// One framed message.  The type and size invariants are checked on construction
/// so a `NetMessage` that exists is always sendable.
#[derive(Debug, Clone, PartialEq)]
pub struct NetMessage {
    msg_type: u8,
    payload: Vec<u8>,
}

impl NetMessage {
    pub fn new(msg_type: u8, payload: Vec<u8>) -> Result<NetMessage, JamError> {
        if msg_type == MESSAGE_INVALID {
            return Err(JamError::Protocol("invalid message type".to_string()));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(JamError::Protocol(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                MAX_PAYLOAD
            )));
        }
        Ok(NetMessage { msg_type, payload })
    }
    pub fn keepalive() -> NetMessage {
        NetMessage {
            msg_type: MESSAGE_KEEPALIVE,
            payload: vec![],
        }
    }
    pub fn get_type(&self) -> u8 {
        self.msg_type
    }
    pub fn get_payload(&self) -> &[u8] {
        &self.payload
    }
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
    pub fn is_keepalive(&self) -> bool {
        self.msg_type == MESSAGE_KEEPALIVE
    }
    /// header + payload, ready for the socket
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&encode_header(self.msg_type, self.payload.len()));
        buf.extend_from_slice(&self.payload);
        buf
    }
}

impl fmt::Display for NetMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ type: 0x{:02x}, len: {} }}",
            self.msg_type,
            self.payload.len()
        )
    }
}

pub fn encode_header(msg_type: u8, size: usize) -> [u8; HEADER_SIZE] {
    let mut hdr = [0; HEADER_SIZE];
    hdr[0] = msg_type;
    LittleEndian::write_u32(&mut hdr[1..], size as u32);
    hdr
}

#[derive(Debug, PartialEq)]
pub enum HeaderResult {
    NeedMore,
    Invalid,
    Header { msg_type: u8, size: usize },
}

/// Look at the front of `bytes` for a header.  Only the first 5 bytes are examined.
pub fn parse_header(bytes: &[u8]) -> HeaderResult {
    if bytes.len() < HEADER_SIZE {
        return HeaderResult::NeedMore;
    }
    let msg_type = bytes[0];
    let size = LittleEndian::read_u32(&bytes[1..HEADER_SIZE]) as usize;
    if msg_type == MESSAGE_INVALID || size > MAX_PAYLOAD {
        return HeaderResult::Invalid;
    }
    HeaderResult::Header { msg_type, size }
}

enum ParseState {
    HeaderPending,
    PayloadPending { msg_type: u8, size: usize },
}

/// Incremental message parser.  Feed it whatever the socket hands over, in any
/// chunk size, and it hands back the complete messages in order.
pub struct MessageParser {
    header: [u8; HEADER_SIZE],
    header_len: usize,
    payload: Vec<u8>,
    state: ParseState,
}

impl MessageParser {
    pub fn new() -> MessageParser {
        MessageParser {
            header: [0; HEADER_SIZE],
            header_len: 0,
            payload: vec![],
            state: ParseState::HeaderPending,
        }
    }

    /// Push payload bytes for the message whose header has been parsed.  Returns
    /// how many bytes were taken.  Nothing is taken while a header is pending.
    pub fn feed_payload(&mut self, bytes: &[u8]) -> usize {
        match self.state {
            ParseState::HeaderPending => 0,
            ParseState::PayloadPending { size, .. } => {
                let want = size - self.payload.len();
                let take = want.min(bytes.len());
                self.payload.extend_from_slice(&bytes[..take]);
                take
            }
        }
    }

    /// Run a chunk of stream bytes through the parser.  A bad header is fatal for
    /// the stream and leaves the parser reset.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<Vec<NetMessage>, JamError> {
        let mut messages = vec![];
        while !bytes.is_empty() {
            match self.state {
                ParseState::HeaderPending => {
                    let take = (HEADER_SIZE - self.header_len).min(bytes.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&bytes[..take]);
                    self.header_len += take;
                    bytes = &bytes[take..];
                    match parse_header(&self.header[..self.header_len]) {
                        HeaderResult::NeedMore => (),
                        HeaderResult::Invalid => {
                            let msg_type = self.header[0];
                            self.reset();
                            return Err(JamError::Protocol(format!(
                                "bad message header (type 0x{:02x})",
                                msg_type
                            )));
                        }
                        HeaderResult::Header { msg_type, size } => {
                            self.header_len = 0;
                            self.payload = Vec::with_capacity(size);
                            self.state = ParseState::PayloadPending { msg_type, size };
                        }
                    }
                }
                ParseState::PayloadPending { .. } => {
                    let used = self.feed_payload(bytes);
                    bytes = &bytes[used..];
                }
            }
            if let Some(msg) = self.take_complete() {
                messages.push(msg);
            }
        }
        // a zero length message completes as soon as its header does
        if let Some(msg) = self.take_complete() {
            messages.push(msg);
        }
        Ok(messages)
    }

    fn take_complete(&mut self) -> Option<NetMessage> {
        if let ParseState::PayloadPending { msg_type, size } = self.state {
            if self.payload.len() == size {
                self.state = ParseState::HeaderPending;
                return Some(NetMessage {
                    msg_type,
                    payload: std::mem::take(&mut self.payload),
                });
            }
        }
        None
    }

    /// true if some bytes of a message have arrived but not all of them
    pub fn has_partial(&self) -> bool {
        self.header_len > 0 || matches!(self.state, ParseState::PayloadPending { .. })
    }

    /// drop any partially received message
    pub fn reset(&mut self) {
        self.header_len = 0;
        self.payload = vec![];
        self.state = ParseState::HeaderPending;
    }
}
