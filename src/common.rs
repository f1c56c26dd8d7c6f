//! These modules are shared among both the client and server sides of the jam protocol.
use std::time::{SystemTime, UNIX_EPOCH};

pub mod box_error;
pub mod channel_mask;
pub mod config;
pub mod connection;
pub mod guid;
pub mod jam_error;
pub mod message_body;
pub mod micro_timer;
pub mod net_message;
pub mod passhash;
pub mod privs;
pub mod sock_with_tos;

/// microseconds since the epoch.  All the timers in the crate run off this.
pub fn get_micro_time() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros(),
        Err(_) => 0,
    }
}
