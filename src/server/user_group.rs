//! The registry of everyone connected to the server.
//!
//! [`UserGroup`] owns every [`UserConnection`] and does all the protocol work
//! for them: logins, the user list, relaying intervals to subscribers, chat and
//! admin commands, tempo votes and the optional session archive.
//!
//! Nothing here blocks.  The server loop calls [`UserGroup::run`] over and
//! over with the current time.
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde_json::json;
use std::{path::PathBuf, sync::mpsc};

use crate::common::{
    channel_mask::{ChannelMask, MAX_USER_CHANNELS},
    connection::Transport,
    guid::Guid,
    jam_error::JamError,
    message_body::{
        AuthReply, AuthUser, ChatMessage, ConfigChangeNotify, DownloadIntervalBegin,
        DownloadIntervalWrite, IntervalWrite, MessageBody, MessageType, SetChannelInfo,
        SetUsermask, UploadIntervalBegin, UploadIntervalWrite, UserInfoChangeNotify,
        UserInfoRecord, PROTO_VER_MAX, PROTO_VER_MIN,
    },
    micro_timer::MicroTimer,
    net_message::NetMessage,
    privs::Privs,
};

use super::{
    acl::{AccessControlList, AclAction},
    server_config::ServerConfig,
    session_archive::SessionArchive,
    user_connection::{
        sanitize_username, AuthState, RecvTransfer, SendTransfer, UserConnection,
        TRANSFER_TIMEOUT,
    },
    user_lookup::{LookupRequest, LookupResult, UserLookup},
    vote::{ThresholdVote, VoteKind, VoteOutcome, VotePolicy},
};

/// admin commands may go further than votes
pub const ADMIN_MIN_BPM: u16 = 20;
pub const ADMIN_MAX_BPM: u16 = 400;
pub const ADMIN_MIN_BPI: u16 = 2;
pub const ADMIN_MAX_BPI: u16 = 1024;
/// most extra logins `name.2` .. `name.16` for ALLOWMULTI users
const MAX_MULTI_LOGINS: usize = 16;

fn chat(parms: &[&str]) -> Option<NetMessage> {
    match ChatMessage::new(parms).build() {
        Ok(m) => Some(m),
        Err(e) => {
            warn!("chat message dropped: {}", e);
            None
        }
    }
}

fn kick_matches(name: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase()),
        None => name.eq_ignore_ascii_case(pattern),
    }
}

pub struct UserGroup {
    users: Vec<UserConnection>,
    next_id: u64,
    bpm: u16,
    bpi: u16,
    keepalive: u32,
    license: Option<String>,
    topic: String,
    max_users: usize,
    allow_hidden_users: bool,
    log_path: Option<PathBuf>,
    lookup: Box<dyn UserLookup>,
    lookup_tx: mpsc::Sender<LookupResult>,
    lookup_rx: mpsc::Receiver<LookupResult>,
    vote: Box<dyn VotePolicy>,
    archive: Option<SessionArchive>,
}

impl UserGroup {
    pub fn new(config: &ServerConfig, lookup: Box<dyn UserLookup>) -> UserGroup {
        let (lookup_tx, lookup_rx) = mpsc::channel();
        UserGroup {
            users: vec![],
            next_id: 1,
            bpm: config.default_bpm,
            bpi: config.default_bpi,
            keepalive: config.keepalive,
            license: config.license.clone(),
            topic: config.topic.clone(),
            max_users: config.max_users,
            allow_hidden_users: config.allow_hidden_users,
            log_path: config.log_path.clone(),
            lookup,
            lookup_tx,
            lookup_rx,
            vote: Box::new(ThresholdVote::new(config.vote_threshold, config.vote_timeout_secs)),
            archive: None,
        }
    }

    pub fn set_vote_policy(&mut self, vote: Box<dyn VotePolicy>) {
        self.vote = vote;
    }

    pub fn set_lookup(&mut self, lookup: Box<dyn UserLookup>) {
        self.lookup = lookup;
    }

    /// Take on new settings without dropping anyone.  Tempo and topic changes
    /// go out to everyone logged in.
    pub fn apply_config(&mut self, config: &ServerConfig, now: u128) {
        self.keepalive = config.keepalive;
        self.license = config.license.clone();
        self.max_users = config.max_users;
        self.allow_hidden_users = config.allow_hidden_users;
        self.log_path = config.log_path.clone();
        self.vote.set_params(config.vote_threshold, config.vote_timeout_secs);
        if config.default_bpm != self.bpm || config.default_bpi != self.bpi {
            self.set_tempo(config.default_bpm, config.default_bpi, now);
        }
        if config.topic != self.topic {
            self.topic = config.topic.clone();
            if let Some(m) = chat(&["TOPIC", "", &self.topic]) {
                self.broadcast(&m, None, now);
            }
        }
    }

    pub fn get_bpm(&self) -> u16 {
        self.bpm
    }

    pub fn get_bpi(&self) -> u16 {
        self.bpi
    }

    pub fn get_topic(&self) -> &str {
        &self.topic
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn authenticated_count(&self) -> usize {
        self.users.iter().filter(|u| u.is_authenticated()).count()
    }

    fn visible_count(&self) -> usize {
        self.users
            .iter()
            .filter(|u| u.is_authenticated() && !u.is_hidden())
            .count()
    }

    /// authenticated user names, hidden ones left out
    pub fn usernames(&self) -> Vec<String> {
        self.users
            .iter()
            .filter(|u| u.is_authenticated() && !u.is_hidden())
            .map(|u| u.username.clone())
            .collect()
    }

    /// Take over a new connection and challenge it.  Returns the connection id.
    pub fn add_connection(&mut self, transport: Box<dyn Transport>, reserved: bool, now: u128) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let user = UserConnection::new(id, transport, self.keepalive, reserved, self.license.as_deref(), now);
        info!("new connection {}", user.describe());
        self.users.push(user);
        id
    }

    /// Send to every logged in user except `except`.
    pub fn broadcast(&mut self, msg: &NetMessage, except: Option<usize>, now: u128) {
        for (idx, u) in self.users.iter_mut().enumerate() {
            if Some(idx) != except && u.is_authenticated() {
                u.send(msg, now);
            }
        }
    }

    fn broadcast_records(&mut self, records: &[UserInfoRecord], except: Option<usize>, now: u128) {
        match UserInfoChangeNotify::build_all(records) {
            Ok(msgs) => {
                for m in msgs {
                    self.broadcast(&m, except, now);
                }
            }
            Err(e) => warn!("user info not sent: {}", e),
        }
    }

    fn reply(&mut self, idx: usize, text: &str, now: u128) {
        if let Some(m) = chat(&["MSG", "", text]) {
            self.users[idx].send(&m, now);
        }
    }

    fn server_says(&mut self, text: &str, now: u128) {
        if let Some(m) = chat(&["MSG", "", text]) {
            self.broadcast(&m, None, now);
        }
    }

    /// Change the tempo and tell everyone.  Clients apply it at their next
    /// interval boundary.
    pub fn set_tempo(&mut self, bpm: u16, bpi: u16, now: u128) {
        self.bpm = bpm;
        self.bpi = bpi;
        info!("tempo is now {} bpm, {} bpi", bpm, bpi);
        match (ConfigChangeNotify { bpm, bpi }).build() {
            Ok(m) => self.broadcast(&m, None, now),
            Err(e) => warn!("config change not sent: {}", e),
        }
    }

    /// Do one pass of work: read and handle messages, finish logins, time out
    /// stalled logins and transfers, and drop anyone whose connection closed.
    pub fn run(&mut self, now: u128) {
        self.drain_lookups(now);
        for idx in 0..self.users.len() {
            let msgs = self.users[idx].netcon.poll(now);
            for m in msgs {
                self.process_message(idx, m, now);
            }
            let u = &mut self.users[idx];
            let waiting = matches!(u.state, AuthState::ChallengeSent | AuthState::LookupPending);
            if waiting && u.auth_timer.expired(now) {
                info!("{}: authorization timeout", u.describe());
                u.reject("authorization timeout", now);
            }
            u.prune_transfers(now);
        }
        self.drain_lookups(now);
        self.remove_dead(now);
        if let Some(a) = &mut self.archive {
            a.tick(now, self.bpm, self.bpi);
        }
    }

    fn drain_lookups(&mut self, now: u128) {
        let results: Vec<LookupResult> = self.lookup_rx.try_iter().collect();
        for r in results {
            self.complete_auth(r, now);
        }
    }

    fn remove_dead(&mut self, now: u128) {
        let mut idx = 0;
        while idx < self.users.len() {
            if self.users[idx].netcon.is_closed() {
                self.announce_part(idx, now);
                let u = self.users.remove(idx);
                match u.netcon.close_reason() {
                    Some(reason) => info!("{} disconnected: {}", u.describe(), reason),
                    None => info!("{} disconnected", u.describe()),
                }
            } else {
                idx += 1;
            }
        }
    }

    /// Tell the others this user's channels are gone.  Safe to call twice.
    fn announce_part(&mut self, idx: usize, now: u128) {
        if !self.users[idx].announced {
            return;
        }
        self.users[idx].announced = false;
        let name = self.users[idx].username.clone();
        let records = self.users[idx].part_records();
        self.broadcast_records(&records, Some(idx), now);
        if let Some(m) = chat(&["PART", &name]) {
            self.broadcast(&m, Some(idx), now);
        }
        self.vote.user_left(&name);
    }

    fn process_message(&mut self, idx: usize, msg: NetMessage, now: u128) {
        match self.users[idx].state {
            AuthState::ChallengeSent => self.on_auth_user(idx, &msg, now),
            AuthState::Authenticated => {
                if let Err(e) = self.on_message(idx, &msg, now) {
                    warn!("{}: {}", self.users[idx].describe(), e);
                    if e.is_fatal() {
                        self.announce_part(idx, now);
                        self.users[idx].netcon.close(e);
                    }
                }
            }
            AuthState::LookupPending | AuthState::Dead => {
                debug!("{}: message 0x{:02x} ignored", self.users[idx].describe(), msg.get_type());
            }
        }
    }

    fn on_auth_user(&mut self, idx: usize, msg: &NetMessage, now: u128) {
        let auth = match AuthUser::parse(msg) {
            Ok(a) => a,
            Err(e) => {
                debug!("{}: bad auth reply: {}", self.users[idx].describe(), e);
                self.users[idx].reject("invalid authorization reply", now);
                return;
            }
        };
        if auth.client_version < PROTO_VER_MIN || auth.client_version > PROTO_VER_MAX {
            self.users[idx].reject("incorrect client version", now);
            return;
        }
        if self.license.is_some() && !auth.license_agreed() {
            self.users[idx].reject("license not agreed to", now);
            return;
        }
        let u = &mut self.users[idx];
        u.state = AuthState::LookupPending;
        u.client_version = auth.client_version;
        let request = LookupRequest {
            conn_id: u.id,
            username: auth.username,
            challenge: u.challenge,
            passhash: auth.passhash,
            remote: u.netcon.remote_address(),
        };
        debug!("{}: looking up {}", u.describe(), request.username);
        self.lookup.start(request, self.lookup_tx.clone());
    }

    fn name_in_use(&self, name: &str, skip: usize) -> bool {
        self.users
            .iter()
            .enumerate()
            .any(|(i, u)| i != skip && u.is_authenticated() && u.username.eq_ignore_ascii_case(name))
    }

    fn complete_auth(&mut self, res: LookupResult, now: u128) {
        let idx = match self
            .users
            .iter()
            .position(|u| u.id == res.conn_id && u.state == AuthState::LookupPending)
        {
            Some(i) => i,
            None => {
                debug!("lookup result for connection {} that went away", res.conn_id);
                return;
            }
        };
        if !res.accepted {
            info!("{}: login refused for {}", self.users[idx].describe(), res.username);
            self.users[idx].reject("invalid login/password", now);
            return;
        }
        if res.is_status {
            self.send_status(idx, now);
            return;
        }

        let mut username = sanitize_username(&res.username);
        let privs = res.privs;
        let multi = privs.has(Privs::ALLOWMULTI);

        if self.max_users > 0 && !privs.has(Privs::RESERVE) && !self.users[idx].reserved {
            let count = self
                .users
                .iter()
                .filter(|u| u.is_authenticated() && !u.is_hidden())
                .filter(|u| multi || !u.username.eq_ignore_ascii_case(&username))
                .count();
            if count >= self.max_users {
                info!("{}: server full", self.users[idx].describe());
                self.users[idx].reject("server full", now);
                return;
            }
        }

        if multi {
            if self.name_in_use(&username, idx) {
                let base = username.clone();
                match (2..=MAX_MULTI_LOGINS)
                    .map(|n| format!("{}.{}", base, n))
                    .find(|n| !self.name_in_use(n, idx))
                {
                    Some(n) => username = n,
                    None => {
                        self.users[idx].reject("server full", now);
                        return;
                    }
                }
            }
        } else {
            for j in 0..self.users.len() {
                if j != idx && self.users[j].is_authenticated() && self.users[j].username.eq_ignore_ascii_case(&username) {
                    info!("{}: replaced by a new login", self.users[j].describe());
                    self.announce_part(j, now);
                    self.users[j].kill(now);
                }
            }
        }

        let max_channels = res.max_channels.min(MAX_USER_CHANNELS);
        {
            let u = &mut self.users[idx];
            u.username = username.clone();
            u.privs = privs;
            u.max_channels = max_channels;
            u.state = AuthState::Authenticated;
            info!("{}: logged in, privs {}", u.describe(), privs);
        }

        let reply = AuthReply {
            flag: 1,
            errmsg: username.clone(),
            maxchan: max_channels as u8,
        };
        let config = ConfigChangeNotify {
            bpm: self.bpm,
            bpi: self.bpi,
        };
        let mut welcome = vec![];
        welcome.extend(reply.build().ok());
        welcome.extend(config.build().ok());
        let others: Vec<UserInfoRecord> = self
            .users
            .iter()
            .enumerate()
            .filter(|(j, u)| *j != idx && u.is_authenticated() && !u.is_hidden())
            .flat_map(|(_, u)| u.channel_records(self.allow_hidden_users))
            .collect();
        if !others.is_empty() {
            match UserInfoChangeNotify::build_all(&others) {
                Ok(msgs) => welcome.extend(msgs),
                Err(e) => warn!("user list not sent: {}", e),
            }
        }
        if !self.topic.is_empty() {
            welcome.extend(chat(&["TOPIC", "", &self.topic]));
        }
        for m in &welcome {
            self.users[idx].send(m, now);
        }

        if !self.users[idx].is_hidden() {
            self.users[idx].announced = true;
            let records = self.users[idx].channel_records(self.allow_hidden_users);
            if !records.is_empty() {
                self.broadcast_records(&records, Some(idx), now);
            }
            if let Some(m) = chat(&["JOIN", &username]) {
                self.broadcast(&m, Some(idx), now);
            }
        }
    }

    /// A status login gets the roster, the tempo, the topic and a user count,
    /// then is hung up on.
    fn send_status(&mut self, idx: usize, now: u128) {
        let records: Vec<UserInfoRecord> = self
            .users
            .iter()
            .filter(|u| u.is_authenticated() && !u.is_hidden())
            .flat_map(|u| u.channel_records(self.allow_hidden_users))
            .collect();
        let mut msgs = vec![];
        if let Ok(r) = UserInfoChangeNotify::build_all(&records) {
            msgs.extend(r);
        }
        msgs.extend(
            ConfigChangeNotify {
                bpm: self.bpm,
                bpi: self.bpi,
            }
            .build()
            .ok(),
        );
        msgs.extend(chat(&["TOPIC", "", &self.topic]));
        let count = self.visible_count().to_string();
        let max = self.max_users.to_string();
        msgs.extend(chat(&["USERCOUNT", &count, &max]));
        let u = &mut self.users[idx];
        info!("{}: status request", u.describe());
        for m in &msgs {
            u.send(m, now);
        }
        u.kill(now);
    }

    fn on_message(&mut self, idx: usize, msg: &NetMessage, now: u128) -> Result<(), JamError> {
        match MessageType::of(msg) {
            Some(MessageType::ClientSetChannelInfo) => {
                let info = SetChannelInfo::parse(msg)?;
                let allow_hidden = self.allow_hidden_users;
                let changed = self.users[idx].update_channels(&info.channels, allow_hidden);
                if !changed.is_empty() && self.users[idx].announced {
                    self.broadcast_records(&changed, Some(idx), now);
                }
            }
            Some(MessageType::ClientSetUsermask) => {
                let masks = SetUsermask::parse(msg)?;
                for e in masks.entries {
                    self.users[idx].set_subscription(&e.username, ChannelMask::from_bits(e.mask));
                }
            }
            Some(MessageType::ClientUploadIntervalBegin) => {
                let begin = UploadIntervalBegin::parse(msg)?;
                self.relay_begin(idx, begin, now)?;
            }
            Some(MessageType::ClientUploadIntervalWrite) => {
                let write = UploadIntervalWrite::parse(msg)?;
                self.relay_write(idx, write.0, now)?;
            }
            Some(MessageType::ChatMessage) => {
                let c = ChatMessage::parse(msg)?;
                self.on_chat(idx, &c, now);
            }
            _ => {
                debug!("{}: message 0x{:02x} ignored", self.users[idx].describe(), msg.get_type());
            }
        }
        Ok(())
    }

    /// Pass an upload begin on to everyone subscribed to that channel, and
    /// start archiving it when the archive is open.
    fn relay_begin(&mut self, idx: usize, begin: UploadIntervalBegin, now: u128) -> Result<(), JamError> {
        let chidx = begin.channel_index;
        if chidx as usize >= self.users[idx].max_channels {
            warn!(
                "{}: upload on channel {} beyond the {} allowed",
                self.users[idx].describe(),
                chidx,
                self.users[idx].max_channels
            );
            return Ok(());
        }
        let username = self.users[idx].username.clone();
        // a new begin on the channel ends whatever was in flight on it
        let retired: Vec<Guid> = self.users[idx]
            .recv_transfers
            .iter()
            .filter(|t| t.channel == chidx)
            .map(|t| t.guid)
            .collect();
        self.users[idx].recv_transfers.retain(|t| t.channel != chidx);
        if !begin.guid.is_zero() && begin.fourcc != 0 {
            let channel_name = self.users[idx].channels[chidx as usize].name.clone();
            let clip = match &mut self.archive {
                Some(a) => a.begin_clip(&begin.guid, begin.fourcc, &username, chidx, &channel_name),
                None => None,
            };
            self.users[idx].recv_transfers.push(RecvTransfer {
                guid: begin.guid,
                channel: chidx,
                fourcc: begin.fourcc,
                timer: MicroTimer::new(now, TRANSFER_TIMEOUT),
                clip,
            });
        }
        let download = DownloadIntervalBegin {
            guid: begin.guid,
            estsize: begin.estsize,
            fourcc: begin.fourcc,
            channel_index: chidx,
            username: username.clone(),
        }
        .build()?;
        for (j, u) in self.users.iter_mut().enumerate() {
            if j == idx || !u.is_authenticated() {
                continue;
            }
            if !retired.is_empty() {
                u.send_transfers.retain(|t| !retired.contains(&t.guid));
            }
            if u.subscription_mask(&username).contains(chidx as usize) {
                u.send(&download, now);
                if !begin.guid.is_zero() {
                    u.send_transfers.retain(|t| t.guid != begin.guid);
                    u.send_transfers.push(SendTransfer {
                        guid: begin.guid,
                        timer: MicroTimer::new(now, TRANSFER_TIMEOUT),
                    });
                }
            }
        }
        Ok(())
    }

    /// Pass an upload write on to whoever got the matching begin.
    fn relay_write(&mut self, idx: usize, write: IntervalWrite, now: u128) -> Result<(), JamError> {
        let guid = write.guid;
        let end = write.is_end();
        if self.users[idx].log_clip_data(&guid, &write.data, now).is_some() && end {
            self.users[idx].recv_transfers.retain(|t| t.guid != guid);
        }
        let download = DownloadIntervalWrite(write).build()?;
        for (j, u) in self.users.iter_mut().enumerate() {
            if j == idx || !u.is_authenticated() {
                continue;
            }
            if let Some(pos) = u.send_transfers.iter().position(|t| t.guid == guid) {
                u.send(&download, now);
                if end {
                    u.send_transfers.remove(pos);
                } else {
                    u.send_transfers[pos].timer.reset(now);
                }
            }
        }
        Ok(())
    }

    fn on_chat(&mut self, idx: usize, c: &ChatMessage, now: u128) {
        let name = self.users[idx].username.clone();
        let privs = self.users[idx].privs;
        match c.parm(0) {
            "MSG" => {
                if !privs.has(Privs::CHATSEND) {
                    self.reply(idx, "No MSG permission", now);
                    return;
                }
                let text = c.parm(1);
                if text.is_empty() {
                    return;
                }
                if let Some(m) = chat(&["MSG", &name, text]) {
                    self.broadcast(&m, None, now);
                }
                if let Some(rest) = text.strip_prefix("!vote") {
                    self.on_vote(idx, rest.trim(), now);
                }
            }
            "PRIVMSG" => {
                if !privs.has(Privs::CHATSEND) {
                    self.reply(idx, "No PRIVMSG permission", now);
                    return;
                }
                let (dest, text) = (c.parm(1), c.parm(2));
                if dest.is_empty() || text.is_empty() {
                    return;
                }
                let target = self
                    .users
                    .iter()
                    .position(|u| u.is_authenticated() && u.username.eq_ignore_ascii_case(dest));
                match (target, chat(&["PRIVMSG", &name, text])) {
                    (Some(j), Some(m)) => self.users[j].send(&m, now),
                    (None, _) => self.reply(idx, &format!("No such user: {}", dest), now),
                    _ => (),
                }
            }
            "SESSION" => {
                if let Some(m) = chat(&["SESSION", &name, c.parm(1), c.parm(2), c.parm(3)]) {
                    self.broadcast(&m, Some(idx), now);
                }
            }
            "TOPIC" => self.set_topic(idx, c.parm(1), now),
            "ADMIN" => self.on_admin(idx, c.parm(1), now),
            other => debug!("{}: unknown chat command {:?}", self.users[idx].describe(), other),
        }
    }

    fn set_topic(&mut self, idx: usize, text: &str, now: u128) {
        if !self.users[idx].privs.has(Privs::TOPIC) {
            self.reply(idx, "No TOPIC permission", now);
            return;
        }
        self.topic = text.to_string();
        let name = self.users[idx].username.clone();
        info!("{} set topic: {}", name, text);
        if let Some(m) = chat(&["TOPIC", &name, text]) {
            self.broadcast(&m, None, now);
        }
    }

    fn on_admin(&mut self, idx: usize, command: &str, now: u128) {
        let command = command.trim();
        let (verb, arg) = match command.split_once(char::is_whitespace) {
            Some((v, a)) => (v, a.trim()),
            None => (command, ""),
        };
        let privs = self.users[idx].privs;
        let name = self.users[idx].username.clone();
        match verb.to_ascii_lowercase().as_str() {
            "topic" => self.set_topic(idx, arg, now),
            "kick" => {
                if !privs.has(Privs::KICK) {
                    self.reply(idx, "No KICK permission", now);
                    return;
                }
                if arg.is_empty() {
                    self.reply(idx, "usage: kick <user>", now);
                    return;
                }
                let targets: Vec<usize> = (0..self.users.len())
                    .filter(|j| *j != idx && self.users[*j].is_authenticated())
                    .filter(|j| kick_matches(&self.users[*j].username, arg))
                    .collect();
                if targets.is_empty() {
                    self.reply(idx, &format!("No such user: {}", arg), now);
                    return;
                }
                for j in targets {
                    let kicked = self.users[j].username.clone();
                    info!("{} kicked {}", name, kicked);
                    self.server_says(&format!("{} kicked {}", name, kicked), now);
                    self.announce_part(j, now);
                    self.users[j].kill(now);
                }
            }
            "bpm" | "bpi" => {
                if !privs.has(Privs::BPM) {
                    self.reply(idx, "No BPM/BPI permission", now);
                    return;
                }
                let is_bpm = verb.eq_ignore_ascii_case("bpm");
                let (lo, hi) = if is_bpm {
                    (ADMIN_MIN_BPM, ADMIN_MAX_BPM)
                } else {
                    (ADMIN_MIN_BPI, ADMIN_MAX_BPI)
                };
                match arg.parse::<u16>() {
                    Ok(v) if v >= lo && v <= hi => {
                        let label = if is_bpm { "BPM" } else { "BPI" };
                        self.server_says(&format!("{} sets {} to {}", name, label, v), now);
                        if is_bpm {
                            self.set_tempo(v, self.bpi, now);
                        } else {
                            self.set_tempo(self.bpm, v, now);
                        }
                    }
                    _ => self.reply(idx, &format!("{} must be between {} and {}", verb, lo, hi), now),
                }
            }
            _ => self.reply(idx, &format!("Unknown command: {}", verb), now),
        }
    }

    fn on_vote(&mut self, idx: usize, arg: &str, now: u128) {
        if !self.users[idx].privs.has(Privs::VOTE) {
            self.reply(idx, "[voting system] No VOTE permission", now);
            return;
        }
        let mut words = arg.split_whitespace();
        let parsed = match (words.next().and_then(VoteKind::from_name), words.next().map(|w| w.parse::<u32>())) {
            (Some(kind), Some(Ok(value))) => Some((kind, value)),
            _ => None,
        };
        let (kind, value) = match parsed {
            Some(p) => p,
            None => {
                self.reply(idx, "[voting system] usage: !vote bpm|bpi <value>", now);
                return;
            }
        };
        let name = self.users[idx].username.clone();
        let visible = self.visible_count();
        match self.vote.cast(&name, kind, value, visible, now) {
            VoteOutcome::Disabled => self.reply(idx, "[voting system] voting is not enabled", now),
            VoteOutcome::Invalid(why) => self.reply(idx, &format!("[voting system] {}", why), now),
            VoteOutcome::Pending {
                kind,
                value,
                votes,
                needed,
            } => {
                let text = format!(
                    "[voting system] leading candidate: {}/{} votes for {} {} [each vote expires in {}s]",
                    votes,
                    needed,
                    value,
                    kind,
                    self.vote.timeout_secs()
                );
                self.server_says(&text, now);
            }
            VoteOutcome::Passed { kind, value } => {
                self.server_says(&format!("[voting system] setting {} to {}", kind, value), now);
                match kind {
                    VoteKind::Bpm => self.set_tempo(value as u16, self.bpi, now),
                    VoteKind::Bpi => self.set_tempo(self.bpm, value as u16, now),
                }
            }
        }
    }

    /// Drop everyone the ACL now denies.  Used after a reconfigure.
    pub fn kick_denied(&mut self, acl: &AccessControlList, now: u128) {
        for idx in 0..self.users.len() {
            let denied = match self.users[idx].netcon.remote_address() {
                Some(addr) => acl.lookup(addr.ip()) == AclAction::Deny,
                None => false,
            };
            if denied && self.users[idx].state != AuthState::Dead {
                info!("{}: no longer allowed in", self.users[idx].describe());
                self.announce_part(idx, now);
                self.users[idx].kill(now);
            }
        }
    }

    pub fn has_archive(&self) -> bool {
        self.archive.is_some()
    }

    /// Close the current archive (if any) and open a fresh one when at least two
    /// users are in and a log path is set.  Called when the session starts,
    /// ends and on every rotation.
    pub fn update_session_archive(&mut self, when: DateTime<Local>) {
        if let Some(a) = self.archive.take() {
            a.close();
        }
        for u in self.users.iter_mut() {
            for t in u.recv_transfers.iter_mut() {
                t.clip = None;
            }
        }
        if self.authenticated_count() < 2 {
            return;
        }
        if let Some(path) = &self.log_path {
            match SessionArchive::open(path, when) {
                Ok(a) => self.archive = Some(a),
                Err(e) => warn!("session archive not started: {}", e),
            }
        }
    }

    pub fn status_json(&self) -> serde_json::Value {
        let users: Vec<serde_json::Value> = self
            .users
            .iter()
            .filter(|u| u.is_authenticated())
            .map(|u| u.status_json())
            .collect();
        json!({
            "bpm": self.bpm,
            "bpi": self.bpi,
            "topic": self.topic,
            "connections": self.users.len(),
            "users": users,
            "archive": self.archive.as_ref().map(|a| a.dir().display().to_string()),
        })
    }
}

#[cfg(test)]
mod test_user_group {
    use super::*;
    use crate::common::{
        connection::{pipe::pair, NetConnection},
        guid::Guid,
        message_body::{
            AuthChallenge, ChannelInfo, UsermaskEntry, PROTO_VER_CUR, WRITE_FLAG_END,
        },
        passhash::passhash,
    };
    use crate::server::{
        server_config::UserEntry,
        user_lookup::{ConfigUserLookup, MockUserLookup},
    };

    const T: u128 = 1_000;
    const SEC: u128 = 1_000_000;

    struct Peer {
        con: NetConnection,
        inbox: Vec<NetMessage>,
    }

    impl Peer {
        fn send<B: MessageBody>(&mut self, body: &B) {
            self.con.send(&body.build().unwrap(), T).unwrap();
        }
        fn take<B: MessageBody>(&mut self) -> Vec<B> {
            let mut out = vec![];
            self.inbox.retain(|m| match B::parse(m) {
                Ok(b) => {
                    out.push(b);
                    false
                }
                Err(_) => true,
            });
            out
        }
        fn chats(&mut self) -> Vec<Vec<String>> {
            self.take::<ChatMessage>().into_iter().map(|c| c.parms).collect()
        }
        fn say(&mut self, parms: &[&str]) {
            self.send(&ChatMessage::new(parms));
        }
    }

    fn pump_at(group: &mut UserGroup, peers: &mut [&mut Peer], now: u128) {
        for p in peers.iter_mut() {
            let msgs = p.con.poll(now);
            p.inbox.extend(msgs);
        }
        group.run(now);
        group.run(now);
        for p in peers.iter_mut() {
            let msgs = p.con.poll(now);
            p.inbox.extend(msgs);
        }
    }

    fn pump(group: &mut UserGroup, peers: &mut [&mut Peer]) {
        pump_at(group, peers, T);
    }

    fn config() -> ServerConfig {
        let mut c = ServerConfig::default();
        for (name, privs) in [("alice", "*"), ("bob", "c"), ("carl", "cv")] {
            c.users.push(UserEntry {
                name: name.to_string(),
                password: format!("{}pw", name),
                privs: Privs::from_letters(privs),
            });
        }
        c
    }

    fn group_with(c: &ServerConfig) -> UserGroup {
        UserGroup::new(c, Box::new(ConfigUserLookup::new(c.clone())))
    }

    fn connect(group: &mut UserGroup) -> Peer {
        let (server_end, client_end) = pair("10.1.1.1:5555");
        group.add_connection(Box::new(server_end), false, T);
        Peer {
            con: NetConnection::new(Box::new(client_end), 0, T),
            inbox: vec![],
        }
    }

    fn answer(group: &mut UserGroup, p: &mut Peer, name: &str, pass: &str, version: u32) {
        pump(group, &mut [p]);
        let ch = p.take::<AuthChallenge>().pop().expect("no challenge");
        p.send(&AuthUser {
            passhash: passhash(name, pass, &ch.challenge),
            username: name.to_string(),
            client_caps: if ch.license.is_some() { 1 } else { 0 },
            client_version: version,
        });
        pump(group, &mut [p]);
    }

    fn login(group: &mut UserGroup, name: &str) -> Peer {
        let mut p = connect(group);
        answer(group, &mut p, name, &format!("{}pw", name), PROTO_VER_CUR);
        let reply = p.take::<AuthReply>().pop().expect("no auth reply");
        assert!(reply.is_accepted(), "{} refused: {}", name, reply.errmsg);
        p
    }

    fn refused(group: &mut UserGroup, name: &str, pass: &str, version: u32) -> String {
        let mut p = connect(group);
        answer(group, &mut p, name, pass, version);
        let reply = p.take::<AuthReply>().pop().expect("no auth reply");
        assert!(!reply.is_accepted());
        assert!(p.con.is_closed());
        reply.errmsg
    }

    #[test]
    fn login_sends_config_and_user_list() {
        let mut c = config();
        c.topic = "tonight: blues".to_string();
        let mut group = group_with(&c);
        let mut alice = login(&mut group, "alice");
        assert_eq!(alice.take::<ConfigChangeNotify>(), vec![ConfigChangeNotify { bpm: 120, bpi: 8 }]);
        assert_eq!(alice.chats(), vec![vec!["TOPIC", "", "tonight: blues"]]);

        let mut bob = login(&mut group, "bob");
        // alice has no channels, so she shows up with an empty channel 0
        let list = bob.take::<UserInfoChangeNotify>();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].records[0].username, "alice");
        assert!(list[0].records[0].active);

        pump(&mut group, &mut [&mut alice]);
        assert_eq!(alice.chats(), vec![vec!["JOIN", "bob"]]);
        assert_eq!(alice.take::<UserInfoChangeNotify>()[0].records[0].username, "bob");
        assert_eq!(group.authenticated_count(), 2);
        assert_eq!(group.usernames(), vec!["alice", "bob"]);
    }

    #[test]
    fn bad_logins_are_refused() {
        let mut group = group_with(&config());
        assert_eq!(refused(&mut group, "bob", "nope", PROTO_VER_CUR), "invalid login/password");
        assert_eq!(refused(&mut group, "bob", "bobpw", 0x0001_0000), "incorrect client version");
        assert_eq!(refused(&mut group, "bob", "bobpw", 0x0003_0000), "incorrect client version");
        group.run(T);
        assert!(group.is_empty());
    }

    #[test]
    fn license_must_be_agreed() {
        let mut c = config();
        c.license = Some("no swearing".to_string());
        let mut group = group_with(&c);
        let mut p = connect(&mut group);
        pump(&mut group, &mut [&mut p]);
        let ch = p.take::<AuthChallenge>().pop().unwrap();
        assert_eq!(ch.license.as_deref(), Some("no swearing"));
        p.send(&AuthUser {
            passhash: passhash("bob", "bobpw", &ch.challenge),
            username: "bob".to_string(),
            client_caps: 0,
            client_version: PROTO_VER_CUR,
        });
        pump(&mut group, &mut [&mut p]);
        assert_eq!(p.take::<AuthReply>()[0].errmsg, "license not agreed to");
    }

    #[test]
    fn garbage_instead_of_auth() {
        let mut group = group_with(&config());
        let mut p = connect(&mut group);
        p.say(&["MSG", "hello?"]);
        pump(&mut group, &mut [&mut p]);
        assert_eq!(p.take::<AuthReply>()[0].errmsg, "invalid authorization reply");
    }

    #[test]
    fn server_full_unless_reserved() {
        let mut c = config();
        c.max_users = 1;
        c.users[0].privs = Privs::from_letters("r");
        let mut group = group_with(&c);
        let _bob = login(&mut group, "bob");
        assert_eq!(refused(&mut group, "carl", "carlpw", PROTO_VER_CUR), "server full");
        // alice holds the reserve privilege
        let _alice = login(&mut group, "alice");
    }

    #[test]
    fn second_login_replaces_first() {
        let mut group = group_with(&config());
        let mut first = login(&mut group, "bob");
        let mut alice = login(&mut group, "alice");
        let _second = login(&mut group, "bob");
        pump(&mut group, &mut [&mut first, &mut alice]);
        assert!(first.con.is_closed());
        let chats = alice.chats();
        assert!(chats.contains(&vec!["PART".to_string(), "bob".to_string()]));
        assert_eq!(chats.last().unwrap(), &vec!["JOIN".to_string(), "bob".to_string()]);
        assert_eq!(group.authenticated_count(), 2);
    }

    #[test]
    fn allow_multi_decorates_name() {
        let mut c = config();
        c.users[1].privs = Privs::from_letters("cm");
        let mut group = group_with(&c);
        let _one = login(&mut group, "bob");
        let mut two = connect(&mut group);
        answer(&mut group, &mut two, "bob", "bobpw", PROTO_VER_CUR);
        assert_eq!(two.take::<AuthReply>()[0].errmsg, "bob.2");
    }

    #[test]
    fn intervals_reach_subscribers_only() {
        let mut group = group_with(&config());
        let mut alice = login(&mut group, "alice");
        let mut bob = login(&mut group, "bob");
        let mut carl = login(&mut group, "carl");

        bob.send(&SetUsermask {
            entries: vec![UsermaskEntry {
                username: "alice".to_string(),
                mask: 1,
            }],
        });
        alice.send(&SetChannelInfo {
            channels: vec![ChannelInfo {
                name: "guitar".to_string(),
                volume: 0,
                pan: 0,
                flags: 0,
            }],
        });
        pump(&mut group, &mut [&mut alice, &mut bob, &mut carl]);
        let recs = carl.take::<UserInfoChangeNotify>();
        assert!(recs
            .iter()
            .flat_map(|n| n.records.iter())
            .any(|r| r.username == "alice" && r.channel_name == "guitar" && r.active));

        let guid = Guid::generate();
        alice.send(&UploadIntervalBegin {
            guid,
            estsize: 0,
            fourcc: crate::common::message_body::make_fourcc(b"OGGv"),
            channel_index: 0,
        });
        alice.send(&UploadIntervalWrite(IntervalWrite {
            guid,
            flags: 0,
            data: vec![1; 500],
        }));
        alice.send(&UploadIntervalWrite(IntervalWrite {
            guid,
            flags: WRITE_FLAG_END,
            data: vec![2; 10],
        }));
        pump(&mut group, &mut [&mut alice, &mut bob, &mut carl]);

        let begins = bob.take::<DownloadIntervalBegin>();
        assert_eq!(begins.len(), 1);
        assert_eq!(begins[0].username, "alice");
        assert_eq!(begins[0].guid, guid);
        let writes = bob.take::<DownloadIntervalWrite>();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].0.is_end());
        assert_eq!(writes[0].0.data.len(), 500);

        assert!(carl.take::<DownloadIntervalBegin>().is_empty());
        assert!(carl.take::<DownloadIntervalWrite>().is_empty());
        assert!(alice.take::<DownloadIntervalWrite>().is_empty());
    }

    #[test]
    fn silent_begin_retires_unfinished_interval() {
        let mut group = group_with(&config());
        let mut alice = login(&mut group, "alice");
        let mut bob = login(&mut group, "bob");
        bob.send(&SetUsermask {
            entries: vec![UsermaskEntry {
                username: "alice".to_string(),
                mask: 1,
            }],
        });
        pump(&mut group, &mut [&mut alice, &mut bob]);

        let guid = Guid::generate();
        alice.send(&UploadIntervalBegin {
            guid,
            estsize: 0,
            fourcc: crate::common::message_body::make_fourcc(b"OGGv"),
            channel_index: 0,
        });
        alice.send(&UploadIntervalWrite(IntervalWrite {
            guid,
            flags: 0,
            data: vec![1; 100],
        }));
        pump(&mut group, &mut [&mut alice, &mut bob]);
        let bob_idx = group
            .users
            .iter()
            .position(|u| u.username == "bob")
            .unwrap();
        assert_eq!(group.users[bob_idx].send_transfers.len(), 1);

        // no end flag, the next interval is silent
        alice.send(&UploadIntervalBegin::silence(0));
        pump(&mut group, &mut [&mut alice, &mut bob]);
        assert!(group.users[bob_idx].send_transfers.is_empty());

        alice.send(&UploadIntervalWrite(IntervalWrite {
            guid,
            flags: WRITE_FLAG_END,
            data: vec![2; 10],
        }));
        pump(&mut group, &mut [&mut alice, &mut bob]);
        let begins = bob.take::<DownloadIntervalBegin>();
        assert_eq!(begins.len(), 2);
        assert!(begins[1].guid.is_zero());
        assert_eq!(bob.take::<DownloadIntervalWrite>().len(), 1);
    }

    #[test]
    fn upload_beyond_max_channels_is_ignored() {
        let mut c = config();
        c.max_channels_user = 1;
        let mut group = group_with(&c);
        let mut alice = login(&mut group, "alice");
        let mut bob = login(&mut group, "bob");
        bob.send(&SetUsermask {
            entries: vec![UsermaskEntry {
                username: "alice".to_string(),
                mask: 0xffff_ffff,
            }],
        });
        pump(&mut group, &mut [&mut alice, &mut bob]);
        alice.send(&UploadIntervalBegin::silence(5));
        alice.send(&UploadIntervalBegin::silence(0));
        pump(&mut group, &mut [&mut alice, &mut bob]);
        let begins = bob.take::<DownloadIntervalBegin>();
        assert_eq!(begins.len(), 1);
        assert_eq!(begins[0].channel_index, 0);
        assert!(!alice.con.is_closed());
    }

    #[test]
    fn chat_and_admin_commands() {
        let mut group = group_with(&config());
        let mut alice = login(&mut group, "alice");
        let mut bob = login(&mut group, "bob");
        pump(&mut group, &mut [&mut alice, &mut bob]);
        alice.inbox.clear();
        bob.inbox.clear();

        bob.say(&["MSG", "hi all"]);
        bob.say(&["ADMIN", "bpm 140"]);
        pump(&mut group, &mut [&mut alice, &mut bob]);
        assert_eq!(alice.chats(), vec![vec!["MSG", "bob", "hi all"]]);
        let bob_sees = bob.chats();
        assert_eq!(bob_sees[1], vec!["MSG", "", "No BPM/BPI permission"]);
        assert!(alice.take::<ConfigChangeNotify>().is_empty());

        alice.say(&["ADMIN", "bpm 140"]);
        alice.say(&["PRIVMSG", "BOB", "psst"]);
        alice.say(&["ADMIN", "topic new song"]);
        pump(&mut group, &mut [&mut alice, &mut bob]);
        assert_eq!(bob.take::<ConfigChangeNotify>(), vec![ConfigChangeNotify { bpm: 140, bpi: 8 }]);
        let bob_sees = bob.chats();
        assert!(bob_sees.contains(&vec!["PRIVMSG".to_string(), "alice".to_string(), "psst".to_string()]));
        assert!(bob_sees.contains(&vec!["TOPIC".to_string(), "alice".to_string(), "new song".to_string()]));
        assert_eq!(group.get_topic(), "new song");
        assert_eq!(group.get_bpm(), 140);

        alice.say(&["ADMIN", "kick b*"]);
        pump(&mut group, &mut [&mut alice, &mut bob]);
        pump(&mut group, &mut [&mut alice, &mut bob]);
        assert!(bob.con.is_closed());
        assert!(alice.chats().contains(&vec!["PART".to_string(), "bob".to_string()]));
        assert_eq!(group.authenticated_count(), 1);
    }

    #[test]
    fn vote_changes_tempo() {
        let mut c = config();
        c.vote_threshold = 50;
        let mut group = group_with(&c);
        let mut alice = login(&mut group, "alice");
        let mut carl = login(&mut group, "carl");
        let mut bob = login(&mut group, "bob");
        bob.say(&["MSG", "!vote bpi 16"]);
        pump(&mut group, &mut [&mut alice, &mut carl, &mut bob]);
        // bob has no vote privilege
        assert!(bob
            .chats()
            .iter()
            .any(|c| c.iter().any(|p| p.contains("No VOTE permission"))));

        // 3 users at 50% needs 2 votes
        carl.say(&["MSG", "!vote bpi 16"]);
        pump(&mut group, &mut [&mut alice, &mut carl, &mut bob]);
        assert_eq!(group.get_bpi(), 8);
        alice.say(&["MSG", "!vote bpi 16"]);
        pump(&mut group, &mut [&mut alice, &mut carl, &mut bob]);
        assert_eq!(group.get_bpi(), 16);
        assert_eq!(bob.take::<ConfigChangeNotify>().last(), Some(&ConfigChangeNotify { bpm: 120, bpi: 16 }));
    }

    #[test]
    fn slow_lookup_times_out() {
        let mut lookup = MockUserLookup::new();
        lookup.expect_start().times(1).return_const(());
        let mut group = UserGroup::new(&config(), Box::new(lookup));
        let mut p = connect(&mut group);
        answer(&mut group, &mut p, "bob", "bobpw", PROTO_VER_CUR);
        assert!(p.take::<AuthReply>().is_empty());
        // keep the connection alive with keepalives until the login deadline
        let mut now = T;
        while now < 122 * SEC {
            now += 2 * SEC;
            pump_at(&mut group, &mut [&mut p], now);
        }
        assert_eq!(p.take::<AuthReply>()[0].errmsg, "authorization timeout");
        assert!(group.is_empty());
    }

    #[test]
    fn status_user_gets_roster_and_leaves() {
        let mut c = config();
        c.status_user = Some(("monitor".to_string(), "mpw".to_string()));
        c.max_users = 5;
        let mut group = group_with(&c);
        let _alice = login(&mut group, "alice");
        let mut status = connect(&mut group);
        answer(&mut group, &mut status, "monitor", "mpw", PROTO_VER_CUR);
        pump(&mut group, &mut [&mut status]);
        assert!(status.con.is_closed());
        assert!(status.take::<AuthReply>().is_empty());
        let chats = status.chats();
        assert!(chats.contains(&vec!["USERCOUNT".to_string(), "1".to_string(), "5".to_string()]));
        assert_eq!(status.take::<UserInfoChangeNotify>()[0].records[0].username, "alice");
        assert_eq!(group.authenticated_count(), 1);
    }

    #[test]
    fn hidden_users_are_not_listed() {
        let mut c = config();
        c.users[2].privs = Privs::from_letters("ch");
        let mut group = group_with(&c);
        let mut alice = login(&mut group, "alice");
        let _carl = login(&mut group, "carl");
        pump(&mut group, &mut [&mut alice]);
        assert!(alice.chats().is_empty());
        assert_eq!(group.usernames(), vec!["alice"]);
    }

    #[test]
    fn denied_address_is_kicked() {
        let mut group = group_with(&config());
        let mut alice = login(&mut group, "alice");
        let mut acl = AccessControlList::new();
        acl.add(crate::server::acl::AclEntry::parse("10.0.0.0/8", "deny").unwrap());
        group.kick_denied(&acl, T);
        pump(&mut group, &mut [&mut alice]);
        assert!(alice.con.is_closed());
        assert!(group.is_empty());
    }

    #[test]
    fn archive_needs_two_users() {
        let base = std::env::temp_dir().join(format!("ninjam_rust_group_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&base);
        let mut c = config();
        c.log_path = Some(base.clone());
        let mut group = group_with(&c);
        let mut alice = login(&mut group, "alice");
        group.update_session_archive(Local::now());
        assert!(!group.has_archive());
        let mut bob = login(&mut group, "bob");
        group.update_session_archive(Local::now());
        assert!(group.has_archive());
        assert!(group.status_json()["archive"].is_string());

        bob.send(&SetUsermask {
            entries: vec![UsermaskEntry {
                username: "alice".to_string(),
                mask: 1,
            }],
        });
        alice.send(&SetChannelInfo {
            channels: vec![ChannelInfo {
                name: "drums".to_string(),
                volume: 0,
                pan: 0,
                flags: 0,
            }],
        });
        let guid = Guid::generate();
        alice.send(&UploadIntervalBegin {
            guid,
            estsize: 0,
            fourcc: crate::common::message_body::make_fourcc(b"OGGv"),
            channel_index: 0,
        });
        alice.send(&UploadIntervalWrite(IntervalWrite {
            guid,
            flags: WRITE_FLAG_END,
            data: b"clipdata".to_vec(),
        }));
        pump(&mut group, &mut [&mut alice, &mut bob]);
        let json = group.status_json();
        let dir = PathBuf::from(json["archive"].as_str().unwrap());
        let hex = guid.to_string();
        let clip = dir.join(hex[..1].to_ascii_lowercase()).join(format!("{}.ogg", hex));
        assert_eq!(std::fs::read(clip).unwrap(), b"clipdata");
        let _ = std::fs::remove_dir_all(&base);
    }
}
