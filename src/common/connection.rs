//! One end of a jam protocol stream.
//!
//! A [`NetConnection`] owns its [`Transport`], runs the incoming bytes through a
//! [`MessageParser`] and keeps an outbound queue.  Nothing blocks: the owner calls
//! [`NetConnection::poll`] from its loop and gets back whatever complete messages
//! have arrived.
//!
//! Keepalives: with an interval of K seconds a keepalive goes out whenever
//! nothing else has been sent for K, and a peer that sends nothing at all for
//! 3K is dropped.
use log::{debug, trace};
use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
};

#[cfg(test)]
use mockall::automock;

use super::{
    jam_error::JamError,
    micro_timer::MicroTimer,
    net_message::{MessageParser, NetMessage, MAX_PAYLOAD},
};

/// keepalive interval used when the negotiated value is 0
pub const DEFAULT_KEEPALIVE_SECS: u32 = 3;
/// most messages that may sit in the outbound queue
pub const MAX_QUEUED_MESSAGES: usize = 512;
/// how long a closing connection gets to flush what it has queued
const FLUSH_TIMEOUT: u128 = 5_000_000;

/// The byte stream under a connection.  `recv` returning `Ok(0)` means the peer
/// closed, `WouldBlock` means nothing is available right now.
#[cfg_attr(test, automock)]
pub trait Transport: Send {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn close(&mut self);
    fn remote_address(&self) -> Option<SocketAddr>;
}

impl Transport for TcpStream {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
    fn close(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }
    fn remote_address(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

pub struct NetConnection {
    transport: Box<dyn Transport>,
    parser: MessageParser,
    outbound: VecDeque<Vec<u8>>,
    out_offset: usize,
    keepalive_secs: u32,
    send_timer: MicroTimer,
    recv_timer: MicroTimer,
    closing: Option<MicroTimer>,
    closed: Option<JamError>,
    remote: Option<SocketAddr>,
}

impl NetConnection {
    pub fn new(transport: Box<dyn Transport>, keepalive_secs: u32, now: u128) -> NetConnection {
        let remote = transport.remote_address();
        let mut con = NetConnection {
            transport,
            parser: MessageParser::new(),
            outbound: VecDeque::new(),
            out_offset: 0,
            keepalive_secs: 0,
            send_timer: MicroTimer::new(now, 0),
            recv_timer: MicroTimer::new(now, 0),
            closing: None,
            closed: None,
            remote,
        };
        con.set_keepalive(keepalive_secs, now);
        con
    }

    /// (re)arm the keepalive timers.  0 selects the default interval.
    pub fn set_keepalive(&mut self, secs: u32, now: u128) {
        self.keepalive_secs = if secs == 0 { DEFAULT_KEEPALIVE_SECS } else { secs };
        let k = self.keepalive_secs as u128 * 1_000_000;
        self.send_timer = MicroTimer::new(now, k);
        self.recv_timer = MicroTimer::new(now, 3 * k);
    }

    pub fn get_keepalive(&self) -> u32 {
        self.keepalive_secs
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<&JamError> {
        self.closed.as_ref()
    }

    pub fn queued_messages(&self) -> usize {
        self.outbound.len()
    }

    /// Queue a message.  A full queue is reported, not silently dropped.
    pub fn send(&mut self, msg: &NetMessage, now: u128) -> Result<(), JamError> {
        if self.closed.is_some() || self.closing.is_some() {
            return Err(JamError::Io(io::Error::new(
                ErrorKind::NotConnected,
                "connection is closing",
            )));
        }
        if self.outbound.len() >= MAX_QUEUED_MESSAGES {
            return Err(JamError::ResourceLimit(format!(
                "send queue full ({} messages)",
                self.outbound.len()
            )));
        }
        self.outbound.push_back(msg.encode());
        self.send_timer.reset(now);
        Ok(())
    }

    /// Stop accepting new messages, flush what is queued, then close.  Used to
    /// get a reject or kick message out before the socket goes away.
    pub fn close_after_flush(&mut self, now: u128) {
        if self.closed.is_none() && self.closing.is_none() {
            self.closing = Some(MicroTimer::new(now, FLUSH_TIMEOUT));
        }
    }

    /// Tear the connection down right now.  Anything half-read or queued is lost.
    pub fn close(&mut self, reason: JamError) {
        if self.closed.is_some() {
            return;
        }
        debug!("closing connection {:?}: {}", self.remote, reason);
        self.parser.reset();
        self.outbound.clear();
        self.out_offset = 0;
        self.transport.close();
        self.closed = Some(reason);
    }

    /// Do the I/O: flush what can be flushed, read what is there, check the timers.
    /// Returns the complete messages received, keepalives excluded.
    pub fn poll(&mut self, now: u128) -> Vec<NetMessage> {
        let mut messages = vec![];
        if self.closed.is_some() {
            return messages;
        }
        if let Err(e) = self.flush() {
            self.close(e);
            return messages;
        }
        if let Some(flush_expired) = self.closing.as_ref().map(|t| t.expired(now)) {
            if self.outbound.is_empty() {
                self.close(JamError::Io(io::Error::new(ErrorKind::NotConnected, "closed locally")));
            } else if flush_expired {
                self.close(JamError::Timeout("flush before close".to_string()));
            }
            return messages;
        }
        let mut buf = [0u8; MAX_PAYLOAD];
        loop {
            match self.transport.recv(&mut buf) {
                Ok(0) => {
                    // the peer is gone; hand over what completed before the close
                    self.close(JamError::Io(io::Error::new(
                        ErrorKind::ConnectionReset,
                        "connection closed by peer",
                    )));
                    return messages;
                }
                Ok(n) => match self.parser.feed(&buf[..n]) {
                    Ok(msgs) => {
                        for m in msgs {
                            self.recv_timer.reset(now);
                            if m.is_keepalive() {
                                trace!("keepalive from {:?}", self.remote);
                            } else {
                                messages.push(m);
                            }
                        }
                    }
                    Err(e) => {
                        self.close(e);
                        return messages;
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(JamError::Io(e));
                    return messages;
                }
            }
        }
        if self.recv_timer.expired(now) {
            self.close(JamError::Timeout(format!(
                "nothing received for {} seconds",
                3 * self.keepalive_secs
            )));
            return messages;
        }
        if self.send_timer.expired(now) && self.outbound.is_empty() {
            self.outbound.push_back(NetMessage::keepalive().encode());
            self.send_timer.reset(now);
            if let Err(e) = self.flush() {
                self.close(e);
            }
        }
        messages
    }

    fn flush(&mut self) -> Result<(), JamError> {
        while let Some(front) = self.outbound.front() {
            match self.transport.send(&front[self.out_offset..]) {
                Ok(0) => {
                    return Err(JamError::Io(io::Error::new(
                        ErrorKind::WriteZero,
                        "peer stopped accepting data",
                    )))
                }
                Ok(n) => {
                    self.out_offset += n;
                    if self.out_offset >= front.len() {
                        self.outbound.pop_front();
                        self.out_offset = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(JamError::Io(e)),
            }
        }
        Ok(())
    }
}

impl Drop for NetConnection {
    fn drop(&mut self) {
        if self.closed.is_none() {
            self.transport.close();
        }
    }
}


#[cfg(test)]
mod test_connection {
    use super::pipe::pair;
    use super::*;
    use crate::common::net_message::encode_header;

    const SEC: u128 = 1_000_000;

    #[test]
    fn messages_cross_the_pipe() {
        let (a, b) = pair("10.0.0.1:5000");
        let mut ca = NetConnection::new(Box::new(a), 0, 0);
        let mut cb = NetConnection::new(Box::new(b), 0, 0);
        assert_eq!(ca.get_keepalive(), DEFAULT_KEEPALIVE_SECS);
        let m = NetMessage::new(0xC0, b"MSG\0hi\0".to_vec()).unwrap();
        ca.send(&m, 0).unwrap();
        assert!(cb.poll(1).is_empty());
        ca.poll(2);
        assert_eq!(cb.poll(3), vec![m]);
        assert_eq!(ca.remote_address().unwrap().port(), 5000);
    }

    #[test]
    fn keepalive_sent_when_idle() {
        let (a, b) = pair("10.0.0.1:5000");
        let mut ca = NetConnection::new(Box::new(a), 2, 0);
        let mut cb = NetConnection::new(Box::new(b), 2, 0);
        ca.poll(2 * SEC + 1);
        // keepalives are swallowed, but they keep the receiver alive
        assert!(cb.poll(5 * SEC).is_empty());
        assert!(cb.poll(7 * SEC).is_empty());
        assert!(!cb.is_closed());
    }

    #[test]
    fn silent_peer_times_out_and_partial_is_discarded() {
        let (mut a, b) = pair("10.0.0.1:5000");
        let mut cb = NetConnection::new(Box::new(b), 1, 0);
        // half a message arrives, then nothing
        let mut bytes = encode_header(0x05, 100).to_vec();
        bytes.extend_from_slice(&[1; 40]);
        a.send(&bytes).unwrap();
        assert!(cb.poll(SEC / 2).is_empty());
        assert!(!cb.is_closed());
        assert!(cb.poll(3 * SEC + 1).is_empty());
        assert!(cb.is_closed());
        match cb.close_reason() {
            Some(JamError::Timeout(_)) => (),
            other => panic!("expected timeout, got {:?}", other),
        }
        // the rest of the message shows up too late to matter
        assert!(cb.poll(4 * SEC).is_empty());
    }

    #[test]
    fn bad_header_closes() {
        let (mut a, b) = pair("10.0.0.1:5000");
        let mut cb = NetConnection::new(Box::new(b), 0, 0);
        a.send(&encode_header(0xFF, 0)).unwrap();
        cb.poll(1);
        assert!(cb.is_closed());
        assert!(matches!(cb.close_reason(), Some(JamError::Protocol(_))));
    }

    #[test]
    fn full_queue_is_resource_limit() {
        let mut t = MockTransport::new();
        t.expect_remote_address().returning(|| None);
        t.expect_close().returning(|| ());
        let mut con = NetConnection::new(Box::new(t), 0, 0);
        for _ in 0..MAX_QUEUED_MESSAGES {
            con.send(&NetMessage::keepalive(), 0).unwrap();
        }
        match con.send(&NetMessage::keepalive(), 0) {
            Err(JamError::ResourceLimit(_)) => (),
            other => panic!("expected resource limit, got {:?}", other),
        }
    }

    #[test]
    fn close_discards_queue() {
        let mut t = MockTransport::new();
        t.expect_remote_address().returning(|| None);
        t.expect_close().times(1).returning(|| ());
        let mut con = NetConnection::new(Box::new(t), 0, 0);
        con.send(&NetMessage::keepalive(), 0).unwrap();
        con.close(JamError::Timeout("test".to_string()));
        assert_eq!(con.queued_messages(), 0);
        assert!(con.send(&NetMessage::keepalive(), 0).is_err());
    }

    #[test]
    fn flush_then_close_delivers_last_words() {
        let (a, b) = pair("10.0.0.1:5000");
        let mut ca = NetConnection::new(Box::new(a), 0, 0);
        let mut cb = NetConnection::new(Box::new(b), 0, 0);
        let bye = NetMessage::new(0x01, b"\0invalid login/password\0\0".to_vec()).unwrap();
        ca.send(&bye, 0).unwrap();
        ca.close_after_flush(0);
        ca.poll(1);
        assert!(ca.is_closed());
        // the peer sees the message and then the close, in one poll
        assert_eq!(cb.poll(2), vec![bye]);
        assert!(cb.is_closed());
    }
}
