//! Typed message bodies carried inside a [`NetMessage`].
//!
//! All integers are little endian.  Strings are NUL terminated.  Each body type
//! knows its [`MessageType`] and can `build` itself into a `NetMessage` or
//! `parse` one back out.  A body that runs short is a protocol error.
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num::FromPrimitive;
use std::io::Cursor;

use super::{
    guid::{Guid, GUID_SIZE},
    jam_error::JamError,
    net_message::{NetMessage, MAX_PAYLOAD},
    passhash::{CHALLENGE_SIZE, PASSHASH_SIZE},
};

pub const PROTO_VER_MIN: u32 = 0x0002_0000;
pub const PROTO_VER_MAX: u32 = 0x0002_ffff;
pub const PROTO_VER_CUR: u32 = 0x0002_0000;

pub const SERVER_CAP_LICENSE: u32 = 1;
pub const CLIENT_CAP_LICENSE_AGREED: u32 = 1;
/// set on the last write of an interval
pub const WRITE_FLAG_END: u8 = 1;
pub const MAX_CHAT_PARMS: usize = 5;

#[derive(FromPrimitive, ToPrimitive, PartialEq, Debug, Clone, Copy)]
pub enum MessageType {
    ServerAuthChallenge = 0x00,
    ServerAuthReply = 0x01,
    ServerConfigChangeNotify = 0x02,
    ServerUserInfoChangeNotify = 0x03,
    ServerDownloadIntervalBegin = 0x04,
    ServerDownloadIntervalWrite = 0x05,
    ClientAuthUser = 0x80,
    ClientSetUsermask = 0x81,
    ClientSetChannelInfo = 0x82,
    ClientUploadIntervalBegin = 0x83,
    ClientUploadIntervalWrite = 0x84,
    ChatMessage = 0xC0,
    Keepalive = 0xFD,
    Extended = 0xFE,
}

impl MessageType {
    pub fn of(msg: &NetMessage) -> Option<MessageType> {
        FromPrimitive::from_u8(msg.get_type())
    }
}

/// four character codec tag, first character in the low byte
pub const fn make_fourcc(tag: &[u8; 4]) -> u32 {
    tag[0] as u32 | (tag[1] as u32) << 8 | (tag[2] as u32) << 16 | (tag[3] as u32) << 24
}

/// file extension for an archived interval
pub fn fourcc_to_ext(fourcc: u32) -> String {
    let bytes = fourcc.to_le_bytes();
    let ext: String = bytes[..3]
        .iter()
        .map(|b| (*b as char).to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if ext.is_empty() {
        "raw".to_string()
    } else {
        ext
    }
}

/// Cursor over a payload with protocol-error reads
pub struct BodyReader<'a> {
    cur: Cursor<&'a [u8]>,
}

fn short(what: &str) -> JamError {
    JamError::Protocol(format!("message body too short reading {}", what))
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> BodyReader<'a> {
        BodyReader {
            cur: Cursor::new(buf),
        }
    }
    pub fn remaining(&self) -> usize {
        let buf = self.cur.get_ref();
        buf.len().saturating_sub(self.cur.position() as usize)
    }
    pub fn read_u8(&mut self) -> Result<u8, JamError> {
        self.cur.read_u8().map_err(|_| short("u8"))
    }
    pub fn read_i8(&mut self) -> Result<i8, JamError> {
        self.cur.read_i8().map_err(|_| short("i8"))
    }
    pub fn read_u16(&mut self) -> Result<u16, JamError> {
        self.cur.read_u16::<LittleEndian>().map_err(|_| short("u16"))
    }
    pub fn read_i16(&mut self) -> Result<i16, JamError> {
        self.cur.read_i16::<LittleEndian>().map_err(|_| short("i16"))
    }
    pub fn read_u32(&mut self) -> Result<u32, JamError> {
        self.cur.read_u32::<LittleEndian>().map_err(|_| short("u32"))
    }
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], JamError> {
        if self.remaining() < n {
            return Err(short("bytes"));
        }
        let pos = self.cur.position() as usize;
        let buf: &'a [u8] = *self.cur.get_ref();
        self.cur.set_position((pos + n) as u64);
        Ok(&buf[pos..pos + n])
    }
    pub fn read_guid(&mut self) -> Result<Guid, JamError> {
        let bytes = self.read_bytes(GUID_SIZE)?;
        Guid::from_slice(bytes).ok_or_else(|| short("guid"))
    }
    /// NUL terminated string.  A missing terminator at the very end is tolerated.
    pub fn read_string(&mut self) -> Result<String, JamError> {
        if self.remaining() == 0 {
            return Err(short("string"));
        }
        let pos = self.cur.position() as usize;
        let buf: &'a [u8] = *self.cur.get_ref();
        let rest = &buf[pos..];
        let (s, used) = match rest.iter().position(|b| *b == 0) {
            Some(n) => (&rest[..n], n + 1),
            None => (rest, rest.len()),
        };
        self.cur.set_position((pos + used) as u64);
        Ok(String::from_utf8_lossy(s).into_owned())
    }
    pub fn read_rest(&mut self) -> &'a [u8] {
        let pos = self.cur.position() as usize;
        let buf: &'a [u8] = *self.cur.get_ref();
        self.cur.set_position(buf.len() as u64);
        &buf[pos.min(buf.len())..]
    }
}

fn write_string(w: &mut Vec<u8>, s: &str) {
    w.extend_from_slice(s.as_bytes());
    w.push(0);
}

// Writes into a Vec<u8> cannot fail, so the io::Result from byteorder is dropped.
fn write_u16(w: &mut Vec<u8>, v: u16) {
    let _ = w.write_u16::<LittleEndian>(v);
}
fn write_i16(w: &mut Vec<u8>, v: i16) {
    let _ = w.write_i16::<LittleEndian>(v);
}
fn write_u32(w: &mut Vec<u8>, v: u32) {
    let _ = w.write_u32::<LittleEndian>(v);
}

pub trait MessageBody: Sized {
    const TYPE: MessageType;
    fn write_body(&self, w: &mut Vec<u8>);
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError>;

    fn build(&self) -> Result<NetMessage, JamError> {
        let mut payload = vec![];
        self.write_body(&mut payload);
        NetMessage::new(Self::TYPE as u8, payload)
    }
    fn parse(msg: &NetMessage) -> Result<Self, JamError> {
        if msg.get_type() != Self::TYPE as u8 {
            return Err(JamError::Protocol(format!(
                "expected {:?}, got type 0x{:02x}",
                Self::TYPE,
                msg.get_type()
            )));
        }
        Self::read_body(&mut BodyReader::new(msg.get_payload()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthChallenge {
    pub challenge: [u8; CHALLENGE_SIZE],
    pub server_caps: u32,
    pub protocol_version: u32,
    pub license: Option<String>,
}

impl AuthChallenge {
    /// keepalive interval in seconds, 0 means use the default
    pub fn keepalive(&self) -> u32 {
        (self.server_caps >> 8) & 0xff
    }
    pub fn caps_for(keepalive: u32, has_license: bool) -> u32 {
        let mut caps = (keepalive & 0xff) << 8;
        if has_license {
            caps |= SERVER_CAP_LICENSE;
        }
        caps
    }
}

impl MessageBody for AuthChallenge {
    const TYPE: MessageType = MessageType::ServerAuthChallenge;
    fn write_body(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.challenge);
        let mut caps = self.server_caps & !SERVER_CAP_LICENSE;
        if self.license.is_some() {
            caps |= SERVER_CAP_LICENSE;
        }
        write_u32(w, caps);
        write_u32(w, self.protocol_version);
        if let Some(lic) = &self.license {
            write_string(w, lic);
        }
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        let mut challenge = [0; CHALLENGE_SIZE];
        challenge.copy_from_slice(r.read_bytes(CHALLENGE_SIZE)?);
        let server_caps = r.read_u32()?;
        let protocol_version = r.read_u32()?;
        let license = if server_caps & SERVER_CAP_LICENSE != 0 {
            Some(r.read_string()?)
        } else {
            None
        };
        Ok(AuthChallenge {
            challenge,
            server_caps,
            protocol_version,
            license,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthReply {
    pub flag: u8,
    /// error text on reject, the (possibly decorated) username on accept
    pub errmsg: String,
    pub maxchan: u8,
}

impl AuthReply {
    pub fn is_accepted(&self) -> bool {
        self.flag & 1 != 0
    }
}

impl MessageBody for AuthReply {
    const TYPE: MessageType = MessageType::ServerAuthReply;
    fn write_body(&self, w: &mut Vec<u8>) {
        w.push(self.flag);
        write_string(w, &self.errmsg);
        w.push(self.maxchan);
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        let flag = r.read_u8()?;
        let errmsg = if r.remaining() > 0 {
            r.read_string()?
        } else {
            String::new()
        };
        let maxchan = if r.remaining() > 0 { r.read_u8()? } else { 0 };
        Ok(AuthReply {
            flag,
            errmsg,
            maxchan,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChangeNotify {
    pub bpm: u16,
    pub bpi: u16,
}

impl MessageBody for ConfigChangeNotify {
    const TYPE: MessageType = MessageType::ServerConfigChangeNotify;
    fn write_body(&self, w: &mut Vec<u8>) {
        write_u16(w, self.bpm);
        write_u16(w, self.bpi);
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        Ok(ConfigChangeNotify {
            bpm: r.read_u16()?,
            bpi: r.read_u16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserInfoRecord {
    pub active: bool,
    pub channel_index: u8,
    pub volume: i16,
    pub pan: i8,
    pub flags: u8,
    pub username: String,
    pub channel_name: String,
}

impl UserInfoRecord {
    fn encoded_len(&self) -> usize {
        6 + self.username.len() + 1 + self.channel_name.len() + 1
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserInfoChangeNotify {
    pub records: Vec<UserInfoRecord>,
}

impl UserInfoChangeNotify {
    /// Split a long record list into as many messages as it takes to stay under
    /// the payload limit.
    pub fn build_all(records: &[UserInfoRecord]) -> Result<Vec<NetMessage>, JamError> {
        let mut msgs = vec![];
        let mut batch = UserInfoChangeNotify::default();
        let mut size = 0;
        for rec in records {
            if size + rec.encoded_len() > MAX_PAYLOAD && !batch.records.is_empty() {
                msgs.push(batch.build()?);
                batch = UserInfoChangeNotify::default();
                size = 0;
            }
            size += rec.encoded_len();
            batch.records.push(rec.clone());
        }
        if !batch.records.is_empty() {
            msgs.push(batch.build()?);
        }
        Ok(msgs)
    }
}

impl MessageBody for UserInfoChangeNotify {
    const TYPE: MessageType = MessageType::ServerUserInfoChangeNotify;
    fn write_body(&self, w: &mut Vec<u8>) {
        for rec in &self.records {
            w.push(rec.active as u8);
            w.push(rec.channel_index);
            write_i16(w, rec.volume);
            w.push(rec.pan as u8);
            w.push(rec.flags);
            write_string(w, &rec.username);
            write_string(w, &rec.channel_name);
        }
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        let mut records = vec![];
        while r.remaining() > 0 {
            let active = r.read_u8()? != 0;
            let channel_index = r.read_u8()?;
            let volume = r.read_i16()?;
            let pan = r.read_i8()?;
            let flags = r.read_u8()?;
            let username = r.read_string()?;
            let channel_name = if r.remaining() > 0 {
                r.read_string()?
            } else {
                String::new()
            };
            records.push(UserInfoRecord {
                active,
                channel_index,
                volume,
                pan,
                flags,
                username,
                channel_name,
            });
        }
        Ok(UserInfoChangeNotify { records })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadIntervalBegin {
    pub guid: Guid,
    pub estsize: u32,
    pub fourcc: u32,
    pub channel_index: u8,
    pub username: String,
}

impl MessageBody for DownloadIntervalBegin {
    const TYPE: MessageType = MessageType::ServerDownloadIntervalBegin;
    fn write_body(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.guid.as_bytes());
        write_u32(w, self.estsize);
        write_u32(w, self.fourcc);
        w.push(self.channel_index);
        write_string(w, &self.username);
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        Ok(DownloadIntervalBegin {
            guid: r.read_guid()?,
            estsize: r.read_u32()?,
            fourcc: r.read_u32()?,
            channel_index: r.read_u8()?,
            username: r.read_string()?,
        })
    }
}

/// The upload and download write bodies are the same bytes, only the type differs.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalWrite {
    pub guid: Guid,
    pub flags: u8,
    pub data: Vec<u8>,
}

impl IntervalWrite {
    pub fn is_end(&self) -> bool {
        self.flags & WRITE_FLAG_END != 0
    }
    fn write(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.guid.as_bytes());
        w.push(self.flags);
        w.extend_from_slice(&self.data);
    }
    fn read(r: &mut BodyReader) -> Result<Self, JamError> {
        Ok(IntervalWrite {
            guid: r.read_guid()?,
            flags: r.read_u8()?,
            data: r.read_rest().to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadIntervalWrite(pub IntervalWrite);

impl MessageBody for DownloadIntervalWrite {
    const TYPE: MessageType = MessageType::ServerDownloadIntervalWrite;
    fn write_body(&self, w: &mut Vec<u8>) {
        self.0.write(w);
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        Ok(DownloadIntervalWrite(IntervalWrite::read(r)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadIntervalWrite(pub IntervalWrite);

impl MessageBody for UploadIntervalWrite {
    const TYPE: MessageType = MessageType::ClientUploadIntervalWrite;
    fn write_body(&self, w: &mut Vec<u8>) {
        self.0.write(w);
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        Ok(UploadIntervalWrite(IntervalWrite::read(r)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub passhash: [u8; PASSHASH_SIZE],
    pub username: String,
    pub client_caps: u32,
    pub client_version: u32,
}

impl AuthUser {
    pub fn license_agreed(&self) -> bool {
        self.client_caps & CLIENT_CAP_LICENSE_AGREED != 0
    }
}

impl MessageBody for AuthUser {
    const TYPE: MessageType = MessageType::ClientAuthUser;
    fn write_body(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(&self.passhash);
        write_string(w, &self.username);
        write_u32(w, self.client_caps);
        write_u32(w, self.client_version);
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        let mut passhash = [0; PASSHASH_SIZE];
        passhash.copy_from_slice(r.read_bytes(PASSHASH_SIZE)?);
        Ok(AuthUser {
            passhash,
            username: r.read_string()?,
            client_caps: r.read_u32()?,
            client_version: r.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsermaskEntry {
    pub username: String,
    pub mask: u32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SetUsermask {
    pub entries: Vec<UsermaskEntry>,
}

impl MessageBody for SetUsermask {
    const TYPE: MessageType = MessageType::ClientSetUsermask;
    fn write_body(&self, w: &mut Vec<u8>) {
        for e in &self.entries {
            write_string(w, &e.username);
            write_u32(w, e.mask);
        }
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        let mut entries = vec![];
        while r.remaining() > 0 {
            let username = r.read_string()?;
            let mask = r.read_u32()?;
            entries.push(UsermaskEntry { username, mask });
        }
        Ok(SetUsermask { entries })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    pub volume: i16,
    pub pan: i8,
    pub flags: u8,
}

const CHANNEL_PARAM_SIZE: u16 = 4;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SetChannelInfo {
    pub channels: Vec<ChannelInfo>,
}

impl MessageBody for SetChannelInfo {
    const TYPE: MessageType = MessageType::ClientSetChannelInfo;
    fn write_body(&self, w: &mut Vec<u8>) {
        write_u16(w, CHANNEL_PARAM_SIZE);
        for ch in &self.channels {
            write_string(w, &ch.name);
            write_i16(w, ch.volume);
            w.push(ch.pan as u8);
            w.push(ch.flags);
        }
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        let param_size = r.read_u16()? as usize;
        let mut channels = vec![];
        while r.remaining() > 0 {
            let name = r.read_string()?;
            // newer senders may append extra params; only the first 4 bytes are known
            let params = r.read_bytes(param_size)?;
            let mut pr = BodyReader::new(params);
            let volume = pr.read_i16().unwrap_or(0);
            let pan = pr.read_i8().unwrap_or(0);
            let flags = pr.read_u8().unwrap_or(0);
            channels.push(ChannelInfo {
                name,
                volume,
                pan,
                flags,
            });
        }
        Ok(SetChannelInfo { channels })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadIntervalBegin {
    pub guid: Guid,
    pub estsize: u32,
    pub fourcc: u32,
    pub channel_index: u8,
}

impl UploadIntervalBegin {
    /// the "nothing this interval" marker
    pub fn silence(channel_index: u8) -> UploadIntervalBegin {
        UploadIntervalBegin {
            guid: Guid::zero(),
            estsize: 0,
            fourcc: 0,
            channel_index,
        }
    }
}

impl MessageBody for UploadIntervalBegin {
    const TYPE: MessageType = MessageType::ClientUploadIntervalBegin;
    fn write_body(&self, w: &mut Vec<u8>) {
        w.extend_from_slice(self.guid.as_bytes());
        write_u32(w, self.estsize);
        write_u32(w, self.fourcc);
        w.push(self.channel_index);
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        Ok(UploadIntervalBegin {
            guid: r.read_guid()?,
            estsize: r.read_u32()?,
            fourcc: r.read_u32()?,
            channel_index: r.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatMessage {
    pub parms: Vec<String>,
}

impl ChatMessage {
    pub fn new(parms: &[&str]) -> ChatMessage {
        ChatMessage {
            parms: parms
                .iter()
                .take(MAX_CHAT_PARMS)
                .map(|s| s.to_string())
                .collect(),
        }
    }
    /// parameter n, or "" when missing
    pub fn parm(&self, n: usize) -> &str {
        self.parms.get(n).map(|s| s.as_str()).unwrap_or("")
    }
}

impl MessageBody for ChatMessage {
    const TYPE: MessageType = MessageType::ChatMessage;
    fn write_body(&self, w: &mut Vec<u8>) {
        for p in self.parms.iter().take(MAX_CHAT_PARMS) {
            write_string(w, p);
        }
    }
    fn read_body(r: &mut BodyReader) -> Result<Self, JamError> {
        let mut parms = vec![];
        while r.remaining() > 0 && parms.len() < MAX_CHAT_PARMS {
            parms.push(r.read_string()?);
        }
        Ok(ChatMessage { parms })
    }
}
