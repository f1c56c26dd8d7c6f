//! The server's view of one connected client.
//!
//! Holds the connection itself plus everything the registry needs to know about
//! the user behind it: login state, privileges, the channels they publish, who
//! they subscribe to, and the interval transfers in flight both ways.
use log::{debug, warn};
use serde_json::json;
use std::{fs::File, io::Write};

use crate::common::{
    channel_mask::{ChannelMask, MAX_USER_CHANNELS},
    connection::{NetConnection, Transport},
    guid::Guid,
    jam_error::JamError,
    message_body::{AuthChallenge, AuthReply, MessageBody, UserInfoRecord, PROTO_VER_CUR},
    micro_timer::MicroTimer,
    net_message::NetMessage,
    passhash::{new_challenge, CHALLENGE_SIZE},
    privs::Privs,
};

/// how long a client gets to log in
pub const AUTH_TIMEOUT_SECS: u64 = 120;
/// a transfer with no writes for this long is abandoned
pub const TRANSFER_TIMEOUT: u128 = 8_000_000;
pub const MAX_USERNAME_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuthState {
    ChallengeSent,
    LookupPending,
    Authenticated,
    /// rejected or kicked, waiting for the last message to flush
    Dead,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelState {
    pub active: bool,
    pub name: String,
    pub volume: i16,
    pub pan: i8,
    pub flags: u8,
}

/// An interval this user is uploading to us
pub struct RecvTransfer {
    pub guid: Guid,
    pub channel: u8,
    pub fourcc: u32,
    pub timer: MicroTimer,
    pub clip: Option<File>,
}

/// An interval we are relaying to this user
pub struct SendTransfer {
    pub guid: Guid,
    pub timer: MicroTimer,
}

/// only letters, digits and `-_@.` survive, everything else becomes `_`
pub fn sanitize_username(name: &str) -> String {
    name.chars()
        .take(MAX_USERNAME_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || "-_@.".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct UserConnection {
    pub id: u64,
    pub netcon: NetConnection,
    pub state: AuthState,
    pub challenge: [u8; CHALLENGE_SIZE],
    pub auth_timer: MicroTimer,
    /// came in on an ACL reserve entry
    pub reserved: bool,
    /// JOIN went out, so a PART is owed
    pub announced: bool,
    pub username: String,
    pub privs: Privs,
    pub max_channels: usize,
    pub client_version: u32,
    pub channels: Vec<ChannelState>,
    sublist: Vec<(String, ChannelMask)>,
    pub recv_transfers: Vec<RecvTransfer>,
    pub send_transfers: Vec<SendTransfer>,
}

impl UserConnection {
    /// wrap a freshly accepted transport and send it the login challenge
    pub fn new(
        id: u64,
        transport: Box<dyn Transport>,
        keepalive: u32,
        reserved: bool,
        license: Option<&str>,
        now: u128,
    ) -> UserConnection {
        let mut user = UserConnection {
            id,
            netcon: NetConnection::new(transport, keepalive, now),
            state: AuthState::ChallengeSent,
            challenge: new_challenge(),
            auth_timer: MicroTimer::from_secs(now, AUTH_TIMEOUT_SECS),
            reserved,
            announced: false,
            username: String::new(),
            privs: Privs::none(),
            max_channels: 0,
            client_version: 0,
            channels: vec![ChannelState::default(); MAX_USER_CHANNELS],
            sublist: vec![],
            recv_transfers: vec![],
            send_transfers: vec![],
        };
        let challenge = AuthChallenge {
            challenge: user.challenge,
            server_caps: AuthChallenge::caps_for(keepalive, license.is_some()),
            protocol_version: PROTO_VER_CUR,
            license: license.map(|s| s.to_string()),
        };
        match challenge.build() {
            Ok(msg) => user.send(&msg, now),
            Err(e) => {
                // a license too big for one message
                warn!("cannot build challenge: {}", e);
                user.netcon.close(e);
            }
        }
        user
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    pub fn is_hidden(&self) -> bool {
        self.privs.has(Privs::HIDDEN)
    }

    /// Queue a message.  A peer too slow to drain its queue loses the message, not
    /// the connection.
    pub fn send(&mut self, msg: &NetMessage, now: u128) {
        match self.netcon.send(msg, now) {
            Ok(()) => (),
            Err(JamError::ResourceLimit(s)) => warn!("{}: dropping message, {}", self.describe(), s),
            Err(e) => debug!("{}: send failed: {}", self.describe(), e),
        }
    }

    /// answer the login with a refusal and hang up once it is flushed
    pub fn reject(&mut self, why: &str, now: u128) {
        let reply = AuthReply {
            flag: 0,
            errmsg: why.to_string(),
            maxchan: 0,
        };
        if let Ok(msg) = reply.build() {
            self.send(&msg, now);
        }
        self.kill(now);
    }

    /// stop treating this user as live and close after flushing
    pub fn kill(&mut self, now: u128) {
        self.state = AuthState::Dead;
        self.recv_transfers.clear();
        self.send_transfers.clear();
        self.netcon.close_after_flush(now);
    }

    pub fn describe(&self) -> String {
        let addr = self
            .netcon
            .remote_address()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".to_string());
        if self.username.is_empty() {
            format!("#{} ({})", self.id, addr)
        } else {
            format!("{} ({})", self.username, addr)
        }
    }

    pub fn subscription_mask(&self, username: &str) -> ChannelMask {
        self.sublist
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(username))
            .map(|(_, m)| *m)
            .unwrap_or_default()
    }

    /// mask 0 drops the entry
    pub fn set_subscription(&mut self, username: &str, mask: ChannelMask) {
        self.sublist.retain(|(n, _)| !n.eq_ignore_ascii_case(username));
        if !mask.is_empty() {
            self.sublist.push((username.to_string(), mask));
        }
    }

    pub fn active_channels(&self) -> ChannelMask {
        let mut m = ChannelMask::empty();
        for (i, ch) in self.channels.iter().enumerate() {
            m.set(i, ch.active);
        }
        m
    }

    fn record(&self, idx: usize, active: bool) -> UserInfoRecord {
        let ch = &self.channels[idx];
        UserInfoRecord {
            active,
            channel_index: idx as u8,
            volume: ch.volume,
            pan: ch.pan,
            flags: ch.flags,
            username: self.username.clone(),
            channel_name: ch.name.clone(),
        }
    }

    /// Records describing this user's current channels.  When hidden users are
    /// not allowed, someone with no channels still shows up with an empty one.
    pub fn channel_records(&self, allow_hidden_users: bool) -> Vec<UserInfoRecord> {
        let mut recs: Vec<UserInfoRecord> = self
            .active_channels()
            .iter()
            .map(|i| self.record(i, true))
            .collect();
        if recs.is_empty() && !allow_hidden_users {
            recs.push(UserInfoRecord {
                active: true,
                channel_index: 0,
                volume: 0,
                pan: 0,
                flags: 0,
                username: self.username.clone(),
                channel_name: String::new(),
            });
        }
        recs
    }

    /// records that turn every channel off, sent when the user leaves
    pub fn part_records(&self) -> Vec<UserInfoRecord> {
        let mut recs: Vec<UserInfoRecord> = self
            .active_channels()
            .iter()
            .map(|i| self.record(i, false))
            .collect();
        if recs.is_empty() {
            let mut r = self.record(0, false);
            r.channel_name = String::new();
            recs.push(r);
        }
        recs
    }

    /// Apply a channel info update.  Returns records for the channels that changed.
    pub fn update_channels(
        &mut self,
        infos: &[crate::common::message_body::ChannelInfo],
        allow_hidden_users: bool,
    ) -> Vec<UserInfoRecord> {
        let mut changed = vec![];
        for idx in 0..MAX_USER_CHANNELS {
            let new_state = match infos.get(idx) {
                Some(info) if idx < self.max_channels => ChannelState {
                    active: true,
                    name: info.name.clone(),
                    volume: info.volume,
                    pan: info.pan,
                    flags: info.flags,
                },
                _ => ChannelState::default(),
            };
            if self.channels[idx] != new_state {
                let was_active = self.channels[idx].active;
                self.channels[idx] = new_state;
                if self.channels[idx].active {
                    changed.push(self.record(idx, true));
                } else if was_active {
                    let mut r = self.record(idx, false);
                    r.channel_name = String::new();
                    changed.push(r);
                }
            }
        }
        if self.active_channels().is_empty() && !allow_hidden_users && !changed.is_empty() {
            changed.extend(self.channel_records(false));
        }
        changed
    }

    /// Write some bytes into the archive clip for a transfer, if there is one.
    pub fn log_clip_data(&mut self, guid: &Guid, data: &[u8], now: u128) -> Option<bool> {
        let idx = self.recv_transfers.iter().position(|t| t.guid == *guid)?;
        let t = &mut self.recv_transfers[idx];
        t.timer.reset(now);
        if let Some(f) = &mut t.clip {
            if let Err(e) = f.write_all(data) {
                warn!("clip write failed for {}: {}", guid, e);
                t.clip = None;
            }
        }
        Some(true)
    }

    /// forget transfers that stopped getting writes
    pub fn prune_transfers(&mut self, now: u128) {
        let before = self.recv_transfers.len() + self.send_transfers.len();
        self.recv_transfers.retain(|t| !t.timer.expired(now));
        self.send_transfers.retain(|t| !t.timer.expired(now));
        let after = self.recv_transfers.len() + self.send_transfers.len();
        if after < before {
            debug!("{}: {} stalled transfers dropped", self.describe(), before - after);
        }
    }

    pub fn status_json(&self) -> serde_json::Value {
        let chans: Vec<serde_json::Value> = self
            .active_channels()
            .iter()
            .map(|i| json!({ "index": i, "name": self.channels[i].name }))
            .collect();
        json!({
            "name": self.username,
            "privs": self.privs.to_string(),
            "channels": chans,
        })
    }
}
