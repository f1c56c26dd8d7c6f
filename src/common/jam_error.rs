//! Error taxonomy for the jam protocol.
//!
//! Every error is local to one connection or one transfer.  The server loop
//! matches on the variant to decide whether to drop a peer, reject a single
//! request, or just log and carry on.
use std::{error::Error, fmt, io};

#[derive(Debug)]
pub enum JamError {
    /// bad header, oversized payload or a body that does not parse
    Protocol(String),
    /// bad credentials or version mismatch
    Auth(String),
    /// server full, too many channels, outbound queue full
    ResourceLimit(String),
    /// keepalive expiry or a stalled transfer
    Timeout(String),
    /// bad configuration directive
    Config(String),
    /// buffer growth failure
    Allocation(String),
    Io(io::Error),
}

impl JamError {
    /// true when the error should tear down the connection it came from
    pub fn is_fatal(&self) -> bool {
        match self {
            JamError::Protocol(_) | JamError::Auth(_) | JamError::Timeout(_) | JamError::Io(_) => {
                true
            }
            JamError::ResourceLimit(_) | JamError::Config(_) | JamError::Allocation(_) => false,
        }
    }
}

impl fmt::Display for JamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JamError::Protocol(s) => write!(f, "protocol error: {}", s),
            JamError::Auth(s) => write!(f, "auth error: {}", s),
            JamError::ResourceLimit(s) => write!(f, "resource limit: {}", s),
            JamError::Timeout(s) => write!(f, "timeout: {}", s),
            JamError::Config(s) => write!(f, "config error: {}", s),
            JamError::Allocation(s) => write!(f, "allocation failure: {}", s),
            JamError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl Error for JamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            JamError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for JamError {
    fn from(e: io::Error) -> Self {
        JamError::Io(e)
    }
}
