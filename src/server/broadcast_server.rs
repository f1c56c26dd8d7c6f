//! entry point called by main to run the jam server
//!
//! One thread does everything: accept connections (checking the ACL), run the
//! [`UserGroup`], keep the session archive rotating and watch the config file
//! for changes.  Every socket is non-blocking, so the loop just polls and takes
//! a short nap between passes.
use chrono::Local;
use log::{debug, info, warn};
use std::{
    fs,
    io::ErrorKind,
    net::TcpListener,
    path::PathBuf,
    thread::sleep,
    time::{Duration, SystemTime},
};

use crate::{
    common::{
        box_error::BoxError,
        get_micro_time,
        micro_timer::MicroTimer,
        sock_with_tos::{new_listener, prepare_stream},
    },
    server::{
        acl::AclAction,
        server_config::ServerConfig,
        user_group::UserGroup,
        user_lookup::ConfigUserLookup,
    },
};

const STATUS_LOG_INTERVAL: u128 = 30_000_000;
const CONFIG_CHECK_INTERVAL: u128 = 5_000_000;

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    group: UserGroup,
    session_timer: MicroTimer,
    status_timer: MicroTimer,
    archive_wanted: bool,
}

impl Server {
    pub fn new(config: ServerConfig, now: u128) -> Result<Server, BoxError> {
        let listener = new_listener(config.port)?;
        info!("listening on port {}", config.port);
        let group = UserGroup::new(&config, Box::new(ConfigUserLookup::new(config.clone())));
        Ok(Server {
            session_timer: MicroTimer::new(now, config.session_length_micros()),
            status_timer: MicroTimer::new(now, STATUS_LOG_INTERVAL),
            config,
            listener,
            group,
            archive_wanted: false,
        })
    }

    /// the port actually bound, useful when the config asked for port 0
    pub fn local_port(&self) -> Option<u16> {
        self.listener.local_addr().ok().map(|a| a.port())
    }

    pub fn group(&self) -> &UserGroup {
        &self.group
    }

    /// One pass of the server loop.  Returns how many connections were accepted.
    pub fn poll_once(&mut self, now: u128) -> usize {
        let accepted = self.accept_new(now);
        self.group.run(now);
        self.update_session_archive(now);
        if self.status_timer.expired(now) {
            self.status_timer.reset(now);
            debug!("status: {}", self.group.status_json());
        }
        accepted
    }

    fn accept_new(&mut self, now: u128) -> usize {
        let mut accepted = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let action = self.config.acl.lookup(addr.ip());
                    if action == AclAction::Deny {
                        info!("{} denied by acl", addr);
                        continue;
                    }
                    if let Err(e) = prepare_stream(&stream) {
                        warn!("{}: cannot set up socket: {}", addr, e);
                        continue;
                    }
                    self.group
                        .add_connection(Box::new(stream), action == AclAction::Reserve, now);
                    accepted += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
        accepted
    }

    /// Open the archive once two users are in, close it when they leave, and
    /// start a new directory every session length.
    fn update_session_archive(&mut self, now: u128) {
        let wanted = self.config.log_path.is_some() && self.group.authenticated_count() >= 2;
        let rotate = wanted && self.session_timer.expired(now);
        if wanted != self.archive_wanted || rotate {
            self.archive_wanted = wanted;
            self.group.update_session_archive(Local::now());
            self.session_timer.reset(now);
        }
    }

    /// Switch to new settings.  The listener is only rebound when the port changed,
    /// and anyone the new ACL denies is dropped.
    pub fn reconfigure(&mut self, config: ServerConfig, now: u128) -> Result<(), BoxError> {
        if config.port != self.config.port {
            self.listener = new_listener(config.port)?;
            info!("now listening on port {}", config.port);
        }
        self.group
            .set_lookup(Box::new(ConfigUserLookup::new(config.clone())));
        self.group.apply_config(&config, now);
        self.group.kick_denied(&config.acl, now);
        self.session_timer.set_interval(config.session_length_micros());
        self.config = config;
        info!("configuration reloaded");
        Ok(())
    }
}

fn modified(path: &str) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn write_pid_file(path: &PathBuf) {
    if let Err(e) = fs::write(path, format!("{}\n", std::process::id())) {
        warn!("cannot write pid file {}: {}", path.display(), e);
    }
}

/// Command line settings that win over the config file, reapplied on every reload
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub log_path: Option<PathBuf>,
}

impl Overrides {
    fn load(&self, config_file: &str) -> Result<ServerConfig, BoxError> {
        let mut config = ServerConfig::load(config_file)?;
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.log_path {
            config.log_path = Some(path.clone());
        }
        Ok(config)
    }
}

/// To start a server, call this function with the name of the json config file.
///
/// It never returns unless the listener cannot be opened.  The config file is
/// checked every few seconds and reloaded when it changes.
pub fn run(config_file: &str, overrides: Overrides) -> Result<(), BoxError> {
    let config = overrides.load(config_file)?;
    if let Some(pid) = &config.pid_file {
        write_pid_file(pid);
    }
    let mut server = Server::new(config, get_micro_time())?;
    let mut config_stamp = modified(config_file);
    let mut config_timer = MicroTimer::new(get_micro_time(), CONFIG_CHECK_INTERVAL);

    loop {
        let now = get_micro_time();
        server.poll_once(now);
        if config_timer.expired(now) {
            config_timer.reset(now);
            let stamp = modified(config_file);
            if stamp != config_stamp {
                config_stamp = stamp;
                match overrides.load(config_file) {
                    Ok(c) => {
                        if let Err(e) = server.reconfigure(c, now) {
                            warn!("reconfigure failed: {}", e);
                        }
                    }
                    Err(e) => warn!("config reload failed: {}", e),
                }
            }
        }
        // This is the timer between polling passes
        sleep(Duration::new(0, 1_000_000));
    }
}
