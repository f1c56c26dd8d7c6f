//! the jam client: session state machine plus the top level entry point
//!
//! [`JamClient`] is the network side of the client.  It owns the connection to
//! the server, walks the login handshake, keeps the roster of remote users and
//! their channels, reassembles downloaded intervals and turns captured audio
//! into uploads.  It never touches audio itself; everything the real time side
//! needs goes to the [`JamEngine`] as an [`EngineCommand`].
//!
//! [`run`] is called by main.  It builds the engine, hands it to the jack
//! thread (or a silent stand-in), connects and then loops ticking the client
//! and relaying events to the log.
use log::{debug, error, info, trace, warn};
use simple_error::bail;
use std::{
    collections::BTreeMap,
    sync::mpsc,
    thread::{self, sleep},
    time::Duration,
};

use crate::common::{
    box_error::BoxError,
    channel_mask::MAX_USER_CHANNELS,
    config::Config,
    connection::{NetConnection, Transport},
    get_micro_time,
    jam_error::JamError,
    message_body::{
        AuthChallenge, AuthReply, ChannelInfo, ChatMessage, ConfigChangeNotify,
        DownloadIntervalBegin, DownloadIntervalWrite, MessageBody, MessageType, SetChannelInfo,
        SetUsermask, UserInfoChangeNotify, UserInfoRecord, UsermaskEntry, AuthUser,
        CLIENT_CAP_LICENSE_AGREED, PROTO_VER_CUR, PROTO_VER_MAX, PROTO_VER_MIN,
    },
    net_message::NetMessage,
    passhash::passhash,
    sock_with_tos,
};

use super::{
    codec::PcmEncoder,
    engine_command::EngineCommand,
    jack_thread,
    jam_engine::JamEngine,
    local_channel::LocalChannel,
    remote_download::{DownloadManager, DEFAULT_PREBUFFER},
    remote_user::{RecordChange, RemoteUser, SlotParams},
};

/// keepalive used while the user reads the license
pub const LICENSE_KEEPALIVE_SECS: u32 = 45;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// frames per block when there is no sound card
const HEADLESS_BLOCK: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    PreConnect,
    Connecting,
    CantConnect,
    VersionMismatch,
    Authenticating,
    InvalidAuth,
    Ok,
    Disconnected,
}

impl ClientStatus {
    /// true for the states a session ends in
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ClientStatus::CantConnect
                | ClientStatus::VersionMismatch
                | ClientStatus::InvalidAuth
                | ClientStatus::Disconnected
        )
    }
}

/// What the client tells the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Status(ClientStatus),
    /// the server wants this license accepted, answer with [`JamClient::accept_license`]
    License(String),
    Chat(Vec<String>),
    Tempo { bpm: u16, bpi: u16 },
    UserChannel {
        user: String,
        channel: u8,
        name: String,
        active: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub prebuffer: usize,
    pub auto_subscribe: bool,
    pub metronome_volume: f32,
    pub sample_rate: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            prebuffer: DEFAULT_PREBUFFER,
            auto_subscribe: true,
            metronome_volume: 0.5,
            sample_rate: 48_000,
        }
    }
}

impl ClientConfig {
    /// Read client settings.  Bad values are logged and the default kept.
    pub fn from_config(config: &Config) -> ClientConfig {
        let mut c = ClientConfig::default();
        match config.get_u32_value("prebuffer", Some(c.prebuffer as u32)) {
            Ok(v) => c.prebuffer = v as usize,
            Err(e) => warn!("prebuffer: {}", e),
        }
        match config.get_bool_value("auto_subscribe", Some(c.auto_subscribe)) {
            Ok(v) => c.auto_subscribe = v,
            Err(e) => warn!("auto_subscribe: {}", e),
        }
        match config.get_f64_value("metronome_volume", Some(c.metronome_volume as f64)) {
            Ok(v) if (0.0..=1.0).contains(&v) => c.metronome_volume = v as f32,
            Ok(v) => warn!("metronome_volume {} out of range, using {}", v, c.metronome_volume),
            Err(e) => warn!("metronome_volume: {}", e),
        }
        match config.get_u32_value("sample_rate", Some(c.sample_rate)) {
            Ok(v) if (8_000..=192_000).contains(&v) => c.sample_rate = v,
            Ok(v) => warn!("sample_rate {} out of range, using {}", v, c.sample_rate),
            Err(e) => warn!("sample_rate: {}", e),
        }
        c
    }
}

pub struct JamClient {
    config: ClientConfig,
    status: ClientStatus,
    error: String,
    netcon: Option<NetConnection>,
    user: String,
    pass: String,
    username: String,
    max_channels: usize,
    keepalive: u32,
    license_challenge: Option<AuthChallenge>,
    bpm: u16,
    bpi: u16,
    locals: Vec<LocalChannel>,
    users: BTreeMap<String, RemoteUser>,
    downloads: DownloadManager,
    engine_tx: mpsc::Sender<EngineCommand>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl JamClient {
    pub fn new(
        config: ClientConfig,
        engine_tx: mpsc::Sender<EngineCommand>,
        event_tx: mpsc::Sender<ClientEvent>,
    ) -> JamClient {
        let _ = engine_tx.send(EngineCommand::SetMetronome {
            volume: config.metronome_volume,
        });
        JamClient {
            downloads: DownloadManager::new(config.prebuffer),
            config,
            status: ClientStatus::PreConnect,
            error: String::new(),
            netcon: None,
            user: String::new(),
            pass: String::new(),
            username: String::new(),
            max_channels: MAX_USER_CHANNELS,
            keepalive: 0,
            license_challenge: None,
            bpm: 0,
            bpi: 0,
            locals: vec![],
            users: BTreeMap::new(),
            engine_tx,
            event_tx,
        }
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }
    /// human readable reason for the last failure
    pub fn error_str(&self) -> &str {
        &self.error
    }
    /// the name the server knows us by
    pub fn username(&self) -> &str {
        &self.username
    }
    pub fn max_channels(&self) -> usize {
        self.max_channels
    }
    pub fn get_bpm(&self) -> u16 {
        self.bpm
    }
    pub fn get_bpi(&self) -> u16 {
        self.bpi
    }
    pub fn is_license_pending(&self) -> bool {
        self.license_challenge.is_some()
    }

    fn set_status(&mut self, status: ClientStatus) {
        if self.status != status {
            info!("client status {:?} -> {:?}", self.status, status);
            self.status = status;
            let _ = self.event_tx.send(ClientEvent::Status(status));
        }
    }

    fn engine(&self, cmd: EngineCommand) {
        // the engine going away is noticed by whoever owns it
        let _ = self.engine_tx.send(cmd);
    }

    fn send(&mut self, msg: &NetMessage, now: u128) {
        if let Some(con) = self.netcon.as_mut() {
            if let Err(e) = con.send(msg, now) {
                warn!("send failed: {}", e);
            }
        }
    }

    /// Connect to "host[:port]" and start logging in.
    pub fn connect(&mut self, host: &str, user: &str, pass: &str, now: u128) -> Result<(), JamError> {
        self.disconnect(now);
        self.set_status(ClientStatus::Connecting);
        info!("connecting to {} as {}", host, user);
        match sock_with_tos::connect(host, CONNECT_TIMEOUT) {
            Ok(stream) => {
                self.attach(Box::new(stream), user, pass, now);
                Ok(())
            }
            Err(e) => {
                self.error = format!("cannot connect to {}: {}", host, e);
                warn!("{}", self.error);
                self.set_status(ClientStatus::CantConnect);
                Err(JamError::Io(e))
            }
        }
    }

    /// Start a session over an already connected transport.
    pub fn attach(&mut self, transport: Box<dyn Transport>, user: &str, pass: &str, now: u128) {
        self.user = String::from(user);
        self.pass = String::from(pass);
        self.username = String::from(user);
        self.error.clear();
        self.netcon = Some(NetConnection::new(transport, 0, now));
        self.set_status(ClientStatus::Authenticating);
    }

    /// Hang up.  Leaves the client ready for another connect.
    pub fn disconnect(&mut self, now: u128) {
        if let Some(mut con) = self.netcon.take() {
            con.close_after_flush(now);
            con.poll(now);
        }
        self.teardown();
        self.set_status(ClientStatus::PreConnect);
    }

    fn teardown(&mut self) {
        self.license_challenge = None;
        self.downloads.clear();
        self.users.clear();
        self.engine(EngineCommand::ClearRemote);
    }

    /// Answer the license question raised by a [`ClientEvent::License`].
    pub fn accept_license(&mut self, accept: bool, now: u128) {
        let challenge = match self.license_challenge.take() {
            Some(c) => c,
            None => return,
        };
        if accept {
            if let Some(con) = self.netcon.as_mut() {
                con.set_keepalive(self.keepalive, now);
            }
            self.send_auth(&challenge, true, now);
        } else {
            self.error = String::from("license not accepted");
            if let Some(con) = self.netcon.as_mut() {
                con.close(JamError::Auth(self.error.clone()));
            }
            self.set_status(ClientStatus::InvalidAuth);
        }
    }

    fn send_auth(&mut self, challenge: &AuthChallenge, license_agreed: bool, now: u128) {
        let auth = AuthUser {
            passhash: passhash(&self.user, &self.pass, &challenge.challenge),
            username: self.user.clone(),
            client_caps: if license_agreed {
                CLIENT_CAP_LICENSE_AGREED
            } else {
                0
            },
            client_version: PROTO_VER_CUR,
        };
        match auth.build() {
            Ok(msg) => self.send(&msg, now),
            Err(e) => error!("cannot build auth: {}", e),
        }
    }

    /// One pass of the network loop.  Returns true when anything arrived.
    pub fn run(&mut self, now: u128) -> bool {
        let msgs = match self.netcon.as_mut() {
            Some(con) => con.poll(now),
            None => vec![],
        };
        let busy = !msgs.is_empty();
        for msg in msgs {
            if let Err(e) = self.on_message(&msg, now) {
                warn!("dropping connection: {}", e);
                if self.error.is_empty() {
                    self.error = e.to_string();
                }
                if let Some(con) = self.netcon.as_mut() {
                    con.close(e);
                }
                break;
            }
        }

        let mut out = vec![];
        for ch in self.locals.iter_mut() {
            if let Err(e) = ch.process(&mut out) {
                warn!("channel {} upload: {}", ch.index(), e);
            }
        }
        // while not logged in the captured audio has nowhere to go
        if self.status == ClientStatus::Ok {
            for m in out.iter() {
                self.send(m, now);
            }
        }
        self.downloads.prune(now);
        self.check_closed();
        busy
    }

    fn check_closed(&mut self) {
        let reason = match self.netcon.as_ref() {
            Some(con) if con.is_closed() => con
                .close_reason()
                .map(|e| e.to_string())
                .unwrap_or_default(),
            _ => return,
        };
        self.netcon = None;
        if self.error.is_empty() {
            self.error = reason;
        }
        let next = match self.status {
            ClientStatus::Ok => ClientStatus::Disconnected,
            ClientStatus::Connecting | ClientStatus::Authenticating => ClientStatus::CantConnect,
            s => s,
        };
        info!("connection closed: {}", self.error);
        self.teardown();
        self.set_status(next);
    }

    fn on_message(&mut self, msg: &NetMessage, now: u128) -> Result<(), JamError> {
        let kind = MessageType::of(msg);
        if self.status == ClientStatus::Authenticating {
            return match kind {
                Some(MessageType::ServerAuthChallenge) => {
                    self.on_challenge(AuthChallenge::parse(msg)?, now);
                    Ok(())
                }
                Some(MessageType::ServerAuthReply) => {
                    self.on_auth_reply(AuthReply::parse(msg)?, now);
                    Ok(())
                }
                _ => {
                    trace!("ignoring type {} before login", msg.get_type());
                    Ok(())
                }
            };
        }
        if self.status != ClientStatus::Ok {
            return Ok(());
        }
        match kind {
            Some(MessageType::ServerConfigChangeNotify) => {
                let c = ConfigChangeNotify::parse(msg)?;
                self.bpm = c.bpm;
                self.bpi = c.bpi;
                info!("tempo {} bpm, {} bpi", c.bpm, c.bpi);
                self.engine(EngineCommand::SetTempo {
                    bpm: c.bpm,
                    bpi: c.bpi,
                });
                let _ = self.event_tx.send(ClientEvent::Tempo {
                    bpm: c.bpm,
                    bpi: c.bpi,
                });
            }
            Some(MessageType::ServerUserInfoChangeNotify) => {
                let notify = UserInfoChangeNotify::parse(msg)?;
                self.on_user_info(&notify.records, now);
            }
            Some(MessageType::ServerDownloadIntervalBegin) => {
                let b = DownloadIntervalBegin::parse(msg)?;
                self.on_download_begin(&b, now);
            }
            Some(MessageType::ServerDownloadIntervalWrite) => {
                let w = DownloadIntervalWrite::parse(msg)?;
                if !self.downloads.write(&w.0, now) {
                    trace!("write for unknown download {}", w.0.guid);
                }
            }
            Some(MessageType::ChatMessage) => {
                let chat = ChatMessage::parse(msg)?;
                let _ = self.event_tx.send(ClientEvent::Chat(chat.parms));
            }
            _ => trace!("ignoring message type {}", msg.get_type()),
        }
        Ok(())
    }

    fn on_challenge(&mut self, c: AuthChallenge, now: u128) {
        if c.protocol_version < PROTO_VER_MIN || c.protocol_version > PROTO_VER_MAX {
            self.error = format!(
                "server protocol version {:08x} is not supported",
                c.protocol_version
            );
            warn!("{}", self.error);
            if let Some(con) = self.netcon.as_mut() {
                con.close(JamError::Auth(self.error.clone()));
            }
            self.set_status(ClientStatus::VersionMismatch);
            return;
        }
        self.keepalive = c.keepalive();
        match &c.license {
            Some(text) => {
                debug!("server license needs an answer");
                if let Some(con) = self.netcon.as_mut() {
                    con.set_keepalive(LICENSE_KEEPALIVE_SECS, now);
                }
                let _ = self.event_tx.send(ClientEvent::License(text.clone()));
                self.license_challenge = Some(c);
            }
            None => {
                if let Some(con) = self.netcon.as_mut() {
                    con.set_keepalive(self.keepalive, now);
                }
                self.send_auth(&c, false, now);
            }
        }
    }

    fn on_auth_reply(&mut self, r: AuthReply, now: u128) {
        if !r.is_accepted() {
            self.error = r.errmsg.clone();
            warn!("login refused: {}", r.errmsg);
            if let Some(con) = self.netcon.as_mut() {
                con.close(JamError::Auth(r.errmsg));
            }
            self.set_status(ClientStatus::InvalidAuth);
            return;
        }
        if !r.errmsg.is_empty() {
            self.username = r.errmsg.clone();
        }
        self.max_channels = (r.maxchan as usize).min(MAX_USER_CHANNELS);
        info!(
            "logged in as {} with {} channels",
            self.username, self.max_channels
        );
        self.set_status(ClientStatus::Ok);
        self.notify_channels(now);
    }

    fn on_user_info(&mut self, records: &[UserInfoRecord], now: u128) {
        let mut resubscribe: Vec<String> = vec![];
        for rec in records {
            if rec.username == self.username {
                // our own channels echoed back
                continue;
            }
            let user = self
                .users
                .entry(rec.username.clone())
                .or_insert_with(|| RemoteUser::new(&rec.username));
            let change = user.apply_record(rec, self.config.auto_subscribe);
            match change {
                RecordChange::Added(ch) => {
                    if let (Some(params), Some(c)) = (user.effective_params(ch), user.channel(ch)) {
                        let _ = self.engine_tx.send(EngineCommand::AddRemote {
                            user: rec.username.clone(),
                            channel: ch,
                            pending: c.slot.clone(),
                            params,
                        });
                        if params.subscribed && !resubscribe.contains(&rec.username) {
                            resubscribe.push(rec.username.clone());
                        }
                    }
                }
                RecordChange::Removed(ch) => {
                    let _ = self.engine_tx.send(EngineCommand::RemoveRemote {
                        user: rec.username.clone(),
                        channel: Some(ch),
                    });
                    self.downloads.cancel(&rec.username, Some(ch));
                }
                RecordChange::Updated(_) | RecordChange::Unchanged => {}
            }
            if change != RecordChange::Unchanged {
                let _ = self.event_tx.send(ClientEvent::UserChannel {
                    user: rec.username.clone(),
                    channel: rec.channel_index,
                    name: rec.channel_name.clone(),
                    active: rec.active,
                });
            }
            if user.is_empty() {
                debug!("{} has no channels left", rec.username);
                self.users.remove(&rec.username);
            }
        }
        if !resubscribe.is_empty() {
            self.send_usermask(&resubscribe, now);
        }
    }

    fn send_usermask(&mut self, names: &[String], now: u128) {
        let entries: Vec<UsermaskEntry> = names
            .iter()
            .map(|n| UsermaskEntry {
                username: n.clone(),
                mask: self
                    .users
                    .get(n)
                    .map(|u| u.subscription_mask().bits())
                    .unwrap_or(0),
            })
            .collect();
        match (SetUsermask { entries }).build() {
            Ok(msg) => self.send(&msg, now),
            Err(e) => warn!("cannot build usermask: {}", e),
        }
    }

    fn on_download_begin(&mut self, b: &DownloadIntervalBegin, now: u128) {
        let slot = self
            .users
            .get(&b.username)
            .and_then(|u| u.channel(b.channel_index))
            .filter(|c| c.params.subscribed)
            .map(|c| c.slot.clone());
        match slot {
            Some(slot) => self.downloads.begin(b, &slot, now),
            None => trace!(
                "begin for unsubscribed {} channel {}",
                b.username,
                b.channel_index
            ),
        }
    }

    pub fn send_chat(&mut self, parms: &[&str], now: u128) {
        if self.status != ClientStatus::Ok {
            return;
        }
        match ChatMessage::new(parms).build() {
            Ok(msg) => self.send(&msg, now),
            Err(e) => warn!("chat too long: {}", e),
        }
    }

    // ---- local channels ----

    /// Create or change a local channel.  `broadcast` takes effect at the next interval.
    pub fn set_local_channel_info(
        &mut self,
        index: u8,
        name: &str,
        source: usize,
        bitrate: u32,
        broadcast: bool,
        now: u128,
    ) -> Result<(), JamError> {
        if index as usize >= MAX_USER_CHANNELS {
            return Err(JamError::ResourceLimit(format!(
                "channel {} is past the {} channel limit",
                index, MAX_USER_CHANNELS
            )));
        }
        if self.status == ClientStatus::Ok && index as usize >= self.max_channels {
            return Err(JamError::ResourceLimit(format!(
                "server allows {} channels",
                self.max_channels
            )));
        }
        match self.locals.iter_mut().find(|c| c.index() == index) {
            Some(ch) => {
                ch.set_name(name);
                ch.set_bitrate(bitrate);
                ch.set_broadcasting(broadcast);
                if ch.source() != source {
                    warn!("channel {} keeps input {}", index, ch.source());
                }
            }
            None => {
                let encoder = Box::new(PcmEncoder::new(self.config.sample_rate, 1));
                let (mut ch, input) = LocalChannel::new(index, name, source, encoder);
                ch.set_bitrate(bitrate);
                ch.set_broadcasting(broadcast);
                self.engine(EngineCommand::AddLocal(input));
                self.locals.push(ch);
                self.locals.sort_by_key(|c| c.index());
            }
        }
        self.notify_channels(now);
        Ok(())
    }

    /// Remove a local channel, closing out any interval it was sending.
    pub fn remove_local_channel(&mut self, index: u8, now: u128) {
        let pos = match self.locals.iter().position(|c| c.index() == index) {
            Some(p) => p,
            None => return,
        };
        self.engine(EngineCommand::RemoveLocal(index));
        let mut ch = self.locals.remove(pos);
        let mut out = vec![];
        if let Err(e) = ch.finalize(&mut out) {
            warn!("channel {} final upload: {}", index, e);
        }
        if self.status == ClientStatus::Ok {
            for m in out.iter() {
                self.send(m, now);
            }
        }
        self.notify_channels(now);
    }

    pub fn set_local_channel_monitoring(&mut self, index: u8, volume: f32, pan: f32, mute: bool, solo: bool) {
        self.engine(EngineCommand::SetLocalMonitor {
            index,
            volume,
            pan,
            mute,
            solo,
        });
    }

    pub fn local_channels(&self) -> impl Iterator<Item = &LocalChannel> {
        self.locals.iter()
    }

    /// Channels go to the server by position, so gaps are filled with empty entries.
    fn notify_channels(&mut self, now: u128) {
        if self.status != ClientStatus::Ok {
            return;
        }
        let top = self.locals.iter().map(|c| c.index() as usize + 1).max().unwrap_or(0);
        let mut channels: Vec<ChannelInfo> = (0..top)
            .map(|_| ChannelInfo {
                name: String::new(),
                volume: 0,
                pan: 0,
                flags: 0,
            })
            .collect();
        for ch in self.locals.iter() {
            channels[ch.index() as usize] = ch.channel_info();
        }
        match (SetChannelInfo { channels }).build() {
            Ok(msg) => self.send(&msg, now),
            Err(e) => warn!("cannot build channel info: {}", e),
        }
    }

    // ---- remote users ----

    pub fn users(&self) -> impl Iterator<Item = &RemoteUser> {
        self.users.values()
    }

    pub fn get_user(&self, name: &str) -> Option<&RemoteUser> {
        self.users.get(name)
    }

    pub fn get_user_channel_state(&self, user: &str, channel: u8) -> Option<SlotParams> {
        self.users
            .get(user)
            .and_then(|u| u.channel(channel))
            .map(|c| c.params)
    }

    /// Change subscription and mix settings for one remote channel.
    /// Returns false when the user or channel is unknown.
    pub fn set_user_channel_state(&mut self, user: &str, channel: u8, params: SlotParams, now: u128) -> bool {
        let u = match self.users.get_mut(user) {
            Some(u) => u,
            None => return false,
        };
        let was_subscribed = match u.channel_mut(channel) {
            Some(c) => {
                let was = c.params.subscribed;
                c.params = params;
                if was && !params.subscribed {
                    c.slot.clear();
                }
                was
            }
            None => return false,
        };
        if let Some(effective) = u.effective_params(channel) {
            let _ = self.engine_tx.send(EngineCommand::SetRemote {
                user: String::from(user),
                channel,
                params: effective,
            });
        }
        if was_subscribed != params.subscribed {
            if !params.subscribed {
                self.downloads.cancel(user, Some(channel));
            }
            self.send_usermask(&[String::from(user)], now);
        }
        true
    }

    /// User wide volume, pan and mute, applied on top of each channel's settings.
    pub fn set_user_state(&mut self, user: &str, volume: f32, pan: f32, mute: bool) -> bool {
        let u = match self.users.get_mut(user) {
            Some(u) => u,
            None => return false,
        };
        u.volume = volume;
        u.pan = pan;
        u.mute = mute;
        let idxs: Vec<u8> = u.channels().map(|(i, _)| *i).collect();
        for idx in idxs {
            if let Some(params) = u.effective_params(idx) {
                let _ = self.engine_tx.send(EngineCommand::SetRemote {
                    user: String::from(user),
                    channel: idx,
                    params,
                });
            }
        }
        true
    }

    pub fn set_master(&mut self, volume: f32, pan: f32, mute: bool) {
        self.engine(EngineCommand::SetMaster { volume, pan, mute });
    }

    pub fn set_metronome(&mut self, volume: f32) {
        self.config.metronome_volume = volume;
        self.engine(EngineCommand::SetMetronome { volume });
    }
}

/// Settings for [`run`] that come from the command line.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub user: String,
    pub pass: String,
    pub config_file: Option<String>,
    pub use_jack: bool,
    pub accept_license: bool,
    pub channel_name: String,
}

/// Load the client settings, "client.json" unless a file is given.
pub fn init_config(config_file: Option<&str>) -> Result<ClientConfig, BoxError> {
    let default_params = json::object! {
        "prebuffer": DEFAULT_PREBUFFER,
        "auto_subscribe": true,
        "metronome_volume": 0.5,
        "sample_rate": 48_000,
    };
    let filename = config_file.unwrap_or("client.json");
    info!("Using config file: {}", filename);
    let config = Config::build(String::from(filename), default_params).map_err(|e| {
        error!("Issue with config file or parameter: {}", e);
        e
    })?;
    let client_config = ClientConfig::from_config(&config);
    info!("client config: {:?}", client_config);
    Ok(client_config)
}

fn start_audio_thread(
    engine: JamEngine,
    use_jack: bool,
) -> Result<thread::JoinHandle<()>, BoxError> {
    let handle = thread::Builder::new()
        .name(String::from("audio"))
        .spawn(move || {
            let res = if use_jack {
                jack_thread::run(engine)
            } else {
                jack_thread::run_without_audio(engine, HEADLESS_BLOCK)
            };
            match res {
                Ok(()) => debug!("audio thread ended OK"),
                Err(e) => error!("audio thread exited with error {}", e),
            }
        })?;
    Ok(handle)
}

/// This is the entry point for the jam client.
///
/// Runs until the session ends and returns the reason as an error.
pub fn run(opts: ClientOptions) -> Result<(), BoxError> {
    let config = init_config(opts.config_file.as_deref())?;
    let (status_data_tx, status_data_rx) = mpsc::channel();
    let (command_tx, command_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel();

    let engine = JamEngine::new(config.sample_rate, status_data_tx, command_rx);
    let _audio_handle = start_audio_thread(engine, opts.use_jack)?;

    let mut client = JamClient::new(config, command_tx, event_tx);
    let now = get_micro_time();
    client.set_local_channel_info(0, &opts.channel_name, 0, 64, true, now)?;
    client.connect(&opts.host, &opts.user, &opts.pass, now)?;

    loop {
        let now = get_micro_time();
        client.run(now);
        while let Ok(event) = event_rx.try_recv() {
            match event {
                ClientEvent::License(text) => {
                    info!("server license:\n{}", text);
                    if !opts.accept_license {
                        warn!("license not accepted, pass --accept-license to agree");
                    }
                    client.accept_license(opts.accept_license, now);
                }
                ClientEvent::Chat(parms) => info!("chat: {}", parms.join(" ")),
                ClientEvent::Tempo { bpm, bpi } => info!("tempo: {} bpm / {} bpi", bpm, bpi),
                ClientEvent::UserChannel {
                    user,
                    channel,
                    name,
                    active,
                } => info!(
                    "{} channel {} \"{}\" {}",
                    user,
                    channel,
                    name,
                    if active { "up" } else { "gone" }
                ),
                ClientEvent::Status(s) => info!("status: {:?}", s),
            }
        }
        while let Ok(m) = status_data_rx.try_recv() {
            trace!("audio thread message: {}", m);
        }
        let status = client.status();
        if status.is_final() {
            bail!("{:?}: {}", status, client.error_str());
        }
        sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod test_client {
    use super::*;
    use crate::common::{
        connection::pipe::{pair, PipeEnd},
        guid::Guid,
        message_body::{
            IntervalWrite, UploadIntervalBegin, UploadIntervalWrite, WRITE_FLAG_END,
        },
        passhash::passhash as hash,
    };
    use crate::sound::codec::FOURCC_PCM;

    const T: u128 = 1_000_000;

    struct Harness {
        client: JamClient,
        server: NetConnection,
        engine_rx: mpsc::Receiver<EngineCommand>,
        events: mpsc::Receiver<ClientEvent>,
        inbox: Vec<NetMessage>,
    }

    impl Harness {
        fn new(prebuffer: usize) -> Harness {
            let (engine_tx, engine_rx) = mpsc::channel();
            let (event_tx, events) = mpsc::channel();
            let config = ClientConfig {
                prebuffer,
                ..ClientConfig::default()
            };
            let mut client = JamClient::new(config, engine_tx, event_tx);
            let (client_end, server_end): (PipeEnd, PipeEnd) = pair("10.0.0.2:2049");
            client.attach(Box::new(client_end), "alice", "pw", T);
            Harness {
                client,
                server: NetConnection::new(Box::new(server_end), 0, T),
                engine_rx,
                events,
                inbox: vec![],
            }
        }
        fn serve<B: MessageBody>(&mut self, body: &B) {
            self.server.send(&body.build().unwrap(), T).unwrap();
            self.pump();
        }
        fn pump(&mut self) {
            self.server.poll(T);
            // the second pass flushes what the first one queued
            self.client.run(T);
            self.client.run(T);
            let msgs = self.server.poll(T);
            self.inbox.extend(msgs);
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
        fn events(&self) -> Vec<ClientEvent> {
            self.events.try_iter().collect()
        }
        fn commands(&self) -> Vec<EngineCommand> {
            self.engine_rx.try_iter().collect()
        }
        fn challenge(&mut self, license: Option<&str>, version: u32) -> AuthChallenge {
            let c = AuthChallenge {
                challenge: [9; 8],
                server_caps: AuthChallenge::caps_for(4, license.is_some()),
                protocol_version: version,
                license: license.map(String::from),
            };
            self.serve(&c);
            c
        }
        fn login(&mut self) {
            self.challenge(None, PROTO_VER_CUR);
            self.take::<AuthUser>();
            self.serve(&AuthReply {
                flag: 1,
                errmsg: String::from("alice"),
                maxchan: 2,
            });
            assert_eq!(self.client.status(), ClientStatus::Ok);
        }
        fn add_remote(&mut self, user: &str, ch: u8) {
            self.serve(&UserInfoChangeNotify {
                records: vec![UserInfoRecord {
                    active: true,
                    channel_index: ch,
                    volume: 0,
                    pan: 0,
                    flags: 0,
                    username: String::from(user),
                    channel_name: String::from("gtr"),
                }],
            });
        }
    }

    #[test]
    fn answers_challenge_with_passhash() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        let c = h.challenge(None, PROTO_VER_CUR);
        let auth = h.take::<AuthUser>().pop().expect("no auth");
        assert_eq!(auth.username, "alice");
        assert_eq!(auth.passhash, hash("alice", "pw", &c.challenge));
        assert_eq!(auth.client_version, PROTO_VER_CUR);
        assert!(!auth.license_agreed());
        assert_eq!(h.client.status(), ClientStatus::Authenticating);
    }

    #[test]
    fn accepted_login_sends_channels() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        h.client
            .set_local_channel_info(0, "mic", 0, 64, true, T)
            .unwrap();
        h.login();
        h.pump();
        assert_eq!(h.client.max_channels(), 2);
        let info = h.take::<SetChannelInfo>().pop().expect("no channel info");
        assert_eq!(info.channels.len(), 1);
        assert_eq!(info.channels[0].name, "mic");
        assert!(h.events().contains(&ClientEvent::Status(ClientStatus::Ok)));
        assert!(h
            .client
            .set_local_channel_info(5, "too many", 0, 64, true, T)
            .is_err());
    }

    #[test]
    fn rejected_login() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        h.challenge(None, PROTO_VER_CUR);
        h.serve(&AuthReply {
            flag: 0,
            errmsg: String::from("invalid login/password"),
            maxchan: 0,
        });
        assert_eq!(h.client.status(), ClientStatus::InvalidAuth);
        assert_eq!(h.client.error_str(), "invalid login/password");
        h.pump();
        assert_eq!(h.client.status(), ClientStatus::InvalidAuth);
    }

    #[test]
    fn version_mismatch() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        h.challenge(None, 0x0003_0000);
        assert_eq!(h.client.status(), ClientStatus::VersionMismatch);
        assert!(h.take::<AuthUser>().is_empty());
    }

    #[test]
    fn license_waits_for_answer() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        h.challenge(Some("be nice"), PROTO_VER_CUR);
        assert!(h.take::<AuthUser>().is_empty());
        assert!(h.client.is_license_pending());
        assert!(h.events().contains(&ClientEvent::License(String::from("be nice"))));
        h.client.accept_license(true, T);
        h.pump();
        let auth = h.take::<AuthUser>().pop().expect("no auth");
        assert!(auth.license_agreed());
    }

    #[test]
    fn declined_license() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        h.challenge(Some("be nice"), PROTO_VER_CUR);
        h.client.accept_license(false, T);
        h.pump();
        assert_eq!(h.client.status(), ClientStatus::InvalidAuth);
        assert_eq!(h.client.error_str(), "license not accepted");
    }

    #[test]
    fn tempo_goes_to_engine() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        h.login();
        h.commands();
        h.serve(&ConfigChangeNotify { bpm: 95, bpi: 16 });
        assert_eq!(h.client.get_bpm(), 95);
        assert_eq!(h.client.get_bpi(), 16);
        assert!(h
            .commands()
            .iter()
            .any(|c| matches!(c, EngineCommand::SetTempo { bpm: 95, bpi: 16 })));
    }

    #[test]
    fn new_user_is_subscribed() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        h.login();
        h.commands();
        h.add_remote("bob", 1);
        h.pump();
        let mask = h.take::<SetUsermask>().pop().expect("no usermask");
        assert_eq!(mask.entries[0].username, "bob");
        assert_eq!(mask.entries[0].mask, 0b10);
        assert!(h
            .commands()
            .iter()
            .any(|c| matches!(c, EngineCommand::AddRemote { channel: 1, .. })));
        // channel going away removes the user
        h.serve(&UserInfoChangeNotify {
            records: vec![UserInfoRecord {
                active: false,
                channel_index: 1,
                volume: 0,
                pan: 0,
                flags: 0,
                username: String::from("bob"),
                channel_name: String::new(),
            }],
        });
        assert!(h.client.get_user("bob").is_none());
    }

    #[test]
    fn download_lands_in_pending_slot() {
        let mut h = Harness::new(16);
        h.login();
        h.add_remote("bob", 0);
        let g = Guid::generate();
        h.serve(&DownloadIntervalBegin {
            guid: g,
            estsize: 0,
            fourcc: FOURCC_PCM,
            channel_index: 0,
            username: String::from("bob"),
        });
        h.serve(&DownloadIntervalWrite(IntervalWrite {
            guid: g,
            flags: 0,
            data: vec![0; 32],
        }));
        let slot = h.client.get_user("bob").unwrap().channel(0).unwrap().slot.clone();
        assert_eq!(slot.pending_guid(), Some(g));
        // a zero guid cancels it again
        h.serve(&DownloadIntervalBegin {
            guid: Guid::zero(),
            estsize: 0,
            fourcc: 0,
            channel_index: 0,
            username: String::from("bob"),
        });
        assert!(!slot.is_pending());
    }

    #[test]
    fn unsubscribe_clears_and_updates_mask() {
        let mut h = Harness::new(16);
        h.login();
        h.add_remote("bob", 0);
        h.take::<SetUsermask>();
        let mut params = h.client.get_user_channel_state("bob", 0).unwrap();
        params.subscribed = false;
        assert!(h.client.set_user_channel_state("bob", 0, params, T));
        h.pump();
        let mask = h.take::<SetUsermask>().pop().expect("no usermask");
        assert_eq!(mask.entries[0].mask, 0);
        assert!(!h.client.set_user_channel_state("nobody", 0, params, T));
        assert!(h.client.set_user_state("bob", 0.5, 0.0, false));
    }

    #[test]
    fn chat_events() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        h.login();
        h.events();
        h.serve(&ChatMessage::new(&["MSG", "bob", "hi"]));
        assert_eq!(
            h.events(),
            vec![ClientEvent::Chat(vec![
                String::from("MSG"),
                String::from("bob"),
                String::from("hi")
            ])]
        );
        h.client.send_chat(&["MSG", "hello"], T);
        h.pump();
        assert_eq!(h.take::<ChatMessage>()[0].parm(1), "hello");
    }

    #[test]
    fn server_hangup_is_a_disconnect() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        h.login();
        h.server.close(JamError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "bye",
        )));
        h.pump();
        assert_eq!(h.client.status(), ClientStatus::Disconnected);
        assert!(!h.client.error_str().is_empty());
    }

    #[test]
    fn upload_after_login() {
        let mut h = Harness::new(DEFAULT_PREBUFFER);
        h.login();
        h.client
            .set_local_channel_info(0, "mic", 0, 64, true, T)
            .unwrap();
        // the real time half went to the engine; drive it by hand
        let mut input = match h
            .commands()
            .into_iter()
            .find(|c| matches!(c, EngineCommand::AddLocal(_)))
        {
            Some(EngineCommand::AddLocal(i)) => i,
            _ => panic!("no local input"),
        };
        input.on_interval_boundary();
        input.capture(&[0.1; 64]);
        input.on_interval_boundary();
        h.pump();
        let begins = h.take::<UploadIntervalBegin>();
        let writes = h.take::<UploadIntervalWrite>();
        assert_eq!(begins.len(), 1);
        assert_eq!(begins[0].fourcc, FOURCC_PCM);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0.flags, WRITE_FLAG_END);
        h.client.remove_local_channel(0, T);
        assert_eq!(h.client.local_channels().count(), 0);
    }
}
