//! Typed server configuration built from a json settings file.
//!
//! Example file:
//! ```json
//! {
//!   "port": 2049,
//!   "maxUsers": 8,
//!   "bpm": 110, "bpi": 16,
//!   "topic": "friday jam",
//!   "acl": [ { "net": "10.0.0.0/8", "action": "deny" } ],
//!   "users": [ { "name": "bob", "password": "secret", "privs": "cbtk" } ],
//!   "anonymous": true,
//!   "logPath": "archive"
//! }
//! ```
//!
//! Bad values never stop the server.  Each one is logged and the default is kept.
use json::JsonValue;
use log::warn;
use std::path::PathBuf;

use crate::common::{box_error::BoxError, config::Config, privs::Privs};

use super::acl::{AccessControlList, AclEntry};

pub const DEFAULT_PORT: u16 = 2049;
pub const MIN_BPM: u16 = 40;
pub const MAX_BPM: u16 = 400;
pub const MIN_BPI: u16 = 2;
pub const MAX_BPI: u16 = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct UserEntry {
    pub name: String,
    pub password: String,
    pub privs: Privs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    /// 0 means unlimited
    pub max_users: usize,
    pub max_channels_anonymous: usize,
    pub max_channels_user: usize,
    /// seconds, 0 selects the protocol default
    pub keepalive: u32,
    pub default_bpm: u16,
    pub default_bpi: u16,
    /// percent of users that must agree, outside 1..=100 turns voting off
    pub vote_threshold: u32,
    pub vote_timeout_secs: u32,
    pub license: Option<String>,
    pub topic: String,
    pub acl: AccessControlList,
    pub users: Vec<UserEntry>,
    pub allow_anonymous: bool,
    pub allow_anonymous_chat: bool,
    pub allow_anonymous_multi: bool,
    pub anonymous_mask_ip: bool,
    pub allow_hidden_users: bool,
    pub status_user: Option<(String, String)>,
    pub log_path: Option<PathBuf>,
    pub session_length_minutes: f64,
    pub pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            max_users: 0,
            max_channels_anonymous: 2,
            max_channels_user: 32,
            keepalive: 0,
            default_bpm: 120,
            default_bpi: 8,
            vote_threshold: 110,
            vote_timeout_secs: 120,
            license: None,
            topic: String::new(),
            acl: AccessControlList::new(),
            users: vec![],
            allow_anonymous: false,
            allow_anonymous_chat: true,
            allow_anonymous_multi: false,
            anonymous_mask_ip: false,
            allow_hidden_users: false,
            status_user: None,
            log_path: None,
            session_length_minutes: 10.0,
            pid_file: None,
            log_file: None,
        }
    }
}

fn bounded(config: &Config, key: &str, default: u32, min: u32, max: u32) -> u32 {
    if !config.has_setting(key) {
        return default;
    }
    match config.get_u32_value(key, None) {
        Ok(v) if v >= min && v <= max => v,
        Ok(v) => {
            warn!("{} = {} is outside {}..={}, using {}", key, v, min, max, default);
            default
        }
        Err(_) => {
            warn!("{} is not a number, using {}", key, default);
            default
        }
    }
}

fn flag(config: &Config, key: &str, default: bool) -> bool {
    if config.has_setting(key) && config.get_bool_value(key, None).is_err() {
        warn!("{} is not true/false, using {}", key, default);
    }
    config.get_bool_value(key, Some(default)).unwrap_or(default)
}

fn optional_path(config: &Config, key: &str) -> Option<PathBuf> {
    match config.get_str_value(key, Some(String::new())) {
        Ok(s) if !s.is_empty() => Some(PathBuf::from(s)),
        _ => None,
    }
}

fn parse_user(val: &JsonValue) -> Option<UserEntry> {
    let name = val["name"].as_str()?;
    if name.is_empty() {
        return None;
    }
    let password = val["password"].as_str().unwrap_or("");
    let privs = match val["privs"].as_str() {
        Some(letters) if !letters.is_empty() => Privs::from_letters(letters),
        _ => Privs::default_user(),
    };
    Some(UserEntry {
        name: name.to_string(),
        password: password.to_string(),
        privs,
    })
}

impl ServerConfig {
    pub fn from_config(config: &Config) -> ServerConfig {
        let d = ServerConfig::default();
        let mut sc = ServerConfig::default();

        sc.port = bounded(config, "port", d.port as u32, 1, 65535) as u16;
        sc.max_users = bounded(config, "maxUsers", 0, 0, 4096) as usize;
        sc.max_channels_anonymous = bounded(config, "maxChannelsAnonymous", 2, 0, 32) as usize;
        sc.max_channels_user = bounded(config, "maxChannelsUser", 32, 0, 32) as usize;
        sc.keepalive = bounded(config, "keepAlive", 0, 0, 255);
        sc.default_bpm = bounded(config, "bpm", 120, MIN_BPM as u32, MAX_BPM as u32) as u16;
        sc.default_bpi = bounded(config, "bpi", 8, MIN_BPI as u32, MAX_BPI as u32) as u16;
        sc.vote_threshold = bounded(config, "voteThreshold", 110, 0, 1000);
        sc.vote_timeout_secs = bounded(config, "voteTimeout", 120, 1, 3600);

        sc.topic = config.get_str_value("topic", Some(String::new())).unwrap_or_default();
        sc.license = match config.get_str_value("license", Some(String::new())) {
            Ok(s) if !s.is_empty() => Some(s),
            _ => None,
        };
        if let Some(path) = optional_path(config, "licenseFile") {
            match std::fs::read_to_string(&path) {
                Ok(text) => sc.license = Some(text),
                Err(e) => warn!("cannot read license file {}: {}", path.display(), e),
            }
        }

        for (i, entry) in config.get_array("acl").iter().enumerate() {
            let net = entry["net"].as_str().unwrap_or("");
            let action = entry["action"].as_str().unwrap_or("");
            match AclEntry::parse(net, action) {
                Ok(e) => sc.acl.add(e),
                Err(e) => warn!("acl entry {} ignored: {}", i, e),
            }
        }
        for (i, entry) in config.get_array("users").iter().enumerate() {
            match parse_user(entry) {
                Some(u) => sc.users.push(u),
                None => warn!("user entry {} ignored: needs a name", i),
            }
        }

        sc.allow_anonymous = flag(config, "anonymous", d.allow_anonymous);
        sc.allow_anonymous_chat = flag(config, "anonymousChat", d.allow_anonymous_chat);
        sc.allow_anonymous_multi = flag(config, "anonymousMulti", d.allow_anonymous_multi);
        sc.anonymous_mask_ip = flag(config, "anonymousMaskIP", d.anonymous_mask_ip);
        sc.allow_hidden_users = flag(config, "allowHiddenUsers", d.allow_hidden_users);

        let status_user = config.get_str_value("statusUser", Some(String::new())).unwrap_or_default();
        if !status_user.is_empty() {
            let status_pass = config.get_str_value("statusPass", Some(String::new())).unwrap_or_default();
            sc.status_user = Some((status_user, status_pass));
        }

        sc.log_path = optional_path(config, "logPath");
        sc.session_length_minutes = match config.get_f64_value("sessionLength", Some(d.session_length_minutes)) {
            Ok(v) if v >= 0.0 => v,
            _ => {
                warn!("sessionLength must be a positive number of minutes");
                d.session_length_minutes
            }
        };
        sc.pid_file = optional_path(config, "pidFile");
        sc.log_file = optional_path(config, "logFile");
        sc
    }

    /// read a settings file, missing file means all defaults
    pub fn load(filename: &str) -> Result<ServerConfig, BoxError> {
        let config = Config::build(filename.to_string(), json::object! {})?;
        Ok(ServerConfig::from_config(&config))
    }

    pub fn find_user(&self, name: &str) -> Option<&UserEntry> {
        self.users.iter().find(|u| u.name == name)
    }

    /// session rotation period in microseconds, never shorter than 30 seconds
    pub fn session_length_micros(&self) -> u128 {
        if self.session_length_minutes < 1.0 {
            30_000_000
        } else {
            (self.session_length_minutes * 60_000_000.0) as u128
        }
    }
}
