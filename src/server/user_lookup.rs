//! Credential checks for connecting users.
//!
//! A lookup is started when a client answers the challenge and completes some
//! time later by sending a [`LookupResult`] down an mpsc channel.  The server
//! loop drains that channel, so a slow lookup (a database, a web service) never
//! stalls anyone else.
//!
//! [`ConfigUserLookup`] answers straight from the config file and checks, in order:
//! the status user, the configured users, then anonymous logins.
use log::debug;
use std::{
    net::{IpAddr, SocketAddr},
    sync::mpsc,
};

#[cfg(test)]
use mockall::automock;

use crate::common::{
    channel_mask::MAX_USER_CHANNELS,
    passhash::{passhash, CHALLENGE_SIZE, PASSHASH_SIZE},
    privs::Privs,
};

use super::server_config::ServerConfig;

const ANON_NAME_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub conn_id: u64,
    pub username: String,
    pub challenge: [u8; CHALLENGE_SIZE],
    pub passhash: [u8; PASSHASH_SIZE],
    pub remote: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupResult {
    pub conn_id: u64,
    pub accepted: bool,
    /// status logins get a roster dump and are then dropped
    pub is_status: bool,
    /// name to use from now on, may differ from the one sent
    pub username: String,
    pub privs: Privs,
    pub max_channels: usize,
}

impl LookupResult {
    pub fn reject(conn_id: u64, username: &str) -> LookupResult {
        LookupResult {
            conn_id,
            accepted: false,
            is_status: false,
            username: username.to_string(),
            privs: Privs::none(),
            max_channels: 0,
        }
    }
}

#[cfg_attr(test, automock)]
pub trait UserLookup: Send {
    /// begin checking a login.  The result must eventually be sent on `done`.
    fn start(&self, request: LookupRequest, done: mpsc::Sender<LookupResult>);
}

pub struct ConfigUserLookup {
    config: ServerConfig,
}

/// "anonymous" or "anonymous:<name>", any case
fn anonymous_part(username: &str) -> Option<&str> {
    if username.len() < 9 || !username.is_char_boundary(9) {
        return None;
    }
    let (head, tail) = username.split_at(9);
    if !head.eq_ignore_ascii_case("anonymous") {
        return None;
    }
    if tail.is_empty() {
        return Some("");
    }
    tail.strip_prefix(':')
}

fn anonymous_name(requested: &str, remote: Option<SocketAddr>, mask_ip: bool) -> String {
    let mut name: String = requested
        .chars()
        .take(ANON_NAME_LEN)
        .map(|c| if c == '@' || c == '.' { '_' } else { c })
        .collect();
    if name.is_empty() {
        name = "anon".to_string();
    }
    let ip = match remote.map(|a| a.ip()) {
        Some(IpAddr::V4(v4)) => {
            let o = v4.octets();
            if mask_ip {
                format!("{}.{}.{}.x", o[0], o[1], o[2])
            } else {
                format!("{}.{}.{}.{}", o[0], o[1], o[2], o[3])
            }
        }
        Some(IpAddr::V6(v6)) => v6.to_string(),
        None => "unknown".to_string(),
    };
    format!("{}@{}", name, ip)
}

impl ConfigUserLookup {
    pub fn new(config: ServerConfig) -> ConfigUserLookup {
        ConfigUserLookup { config }
    }

    pub fn check(&self, req: &LookupRequest) -> LookupResult {
        let cfg = &self.config;
        if let Some((status_name, status_pass)) = &cfg.status_user {
            if req.username == *status_name {
                let mut res = LookupResult::reject(req.conn_id, &req.username);
                res.accepted = passhash(status_name, status_pass, &req.challenge) == req.passhash;
                res.is_status = res.accepted;
                return res;
            }
        }
        if let Some(user) = cfg.find_user(&req.username) {
            let ok = passhash(&user.name, &user.password, &req.challenge) == req.passhash;
            debug!("lookup {}: configured user, password {}", req.username, if ok { "ok" } else { "bad" });
            if !ok {
                return LookupResult::reject(req.conn_id, &req.username);
            }
            return LookupResult {
                conn_id: req.conn_id,
                accepted: true,
                is_status: false,
                username: user.name.clone(),
                privs: user.privs,
                max_channels: cfg.max_channels_user.min(MAX_USER_CHANNELS),
            };
        }
        if cfg.allow_anonymous {
            if let Some(requested) = anonymous_part(&req.username) {
                let mut privs = Privs::VOTE;
                if cfg.allow_anonymous_chat {
                    privs = privs.with(Privs::CHATSEND);
                }
                if cfg.allow_anonymous_multi {
                    privs = privs.with(Privs::ALLOWMULTI);
                }
                return LookupResult {
                    conn_id: req.conn_id,
                    accepted: true,
                    is_status: false,
                    username: anonymous_name(requested, req.remote, cfg.anonymous_mask_ip),
                    privs,
                    max_channels: cfg.max_channels_anonymous.min(MAX_USER_CHANNELS),
                };
            }
        }
        LookupResult::reject(req.conn_id, &req.username)
    }
}

impl UserLookup for ConfigUserLookup {
    fn start(&self, request: LookupRequest, done: mpsc::Sender<LookupResult>) {
        // the receiver only goes away when the server is shutting down
        let _ = done.send(self.check(&request));
    }
}

#[cfg(test)]
mod test_user_lookup {
    use super::*;
    use crate::server::server_config::UserEntry;

    const CHALLENGE: [u8; 8] = [8, 7, 6, 5, 4, 3, 2, 1];

    fn config() -> ServerConfig {
        let mut c = ServerConfig::default();
        c.users.push(UserEntry {
            name: "bob".to_string(),
            password: "secret".to_string(),
            privs: Privs::from_letters("ck"),
        });
        c.status_user = Some(("status".to_string(), "spw".to_string()));
        c.allow_anonymous = true;
        c
    }

    fn request(user: &str, pass: &str) -> LookupRequest {
        LookupRequest {
            conn_id: 3,
            username: user.to_string(),
            challenge: CHALLENGE,
            passhash: passhash(user, pass, &CHALLENGE),
            remote: Some("192.168.4.20:3333".parse().unwrap()),
        }
    }

    #[test]
    fn configured_user() {
        let lookup = ConfigUserLookup::new(config());
        let res = lookup.check(&request("bob", "secret"));
        assert!(res.accepted);
        assert!(!res.is_status);
        assert_eq!(res.conn_id, 3);
        assert!(res.privs.has(Privs::KICK));
        assert_eq!(res.max_channels, 32);
        assert!(!lookup.check(&request("bob", "wrong")).accepted);
    }

    #[test]
    fn status_user_first() {
        let lookup = ConfigUserLookup::new(config());
        let res = lookup.check(&request("status", "spw"));
        assert!(res.accepted && res.is_status);
        let bad = lookup.check(&request("status", "nope"));
        assert!(!bad.accepted && !bad.is_status);
    }

    #[test]
    fn anonymous_decoration() {
        let lookup = ConfigUserLookup::new(config());
        let res = lookup.check(&request("anonymous:joe.m@home", "whatever"));
        assert!(res.accepted);
        assert_eq!(res.username, "joe_m_home@192.168.4.20");
        assert_eq!(res.max_channels, 2);
        assert!(res.privs.has(Privs::CHATSEND));
        assert!(!res.privs.has(Privs::KICK));
        let plain = lookup.check(&request("Anonymous", ""));
        assert_eq!(plain.username, "anon@192.168.4.20");
        assert!(!lookup.check(&request("anonymousjoe", "")).accepted);
    }

    #[test]
    fn anonymous_masked_and_disabled() {
        let mut c = config();
        c.anonymous_mask_ip = true;
        c.allow_anonymous_chat = false;
        let res = ConfigUserLookup::new(c.clone()).check(&request("anonymous:x", ""));
        assert_eq!(res.username, "x@192.168.4.x");
        assert!(!res.privs.has(Privs::CHATSEND));
        c.allow_anonymous = false;
        assert!(!ConfigUserLookup::new(c).check(&request("anonymous:x", "")).accepted);
    }

    #[test]
    fn result_arrives_on_channel() {
        let (tx, rx) = mpsc::channel();
        ConfigUserLookup::new(config()).start(request("carl", "pw"), tx);
        let res = rx.try_recv().unwrap();
        assert!(!res.accepted);
        assert_eq!(res.username, "carl");
    }
}
