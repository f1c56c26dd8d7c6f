//! Ordered address allow/deny/reserve list checked on every accept.
//!
//! The first entry whose `(addr & mask) == network` decides.  No match means allow.
use num::ToPrimitive;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};

use crate::common::jam_error::JamError;

#[derive(FromPrimitive, ToPrimitive, Debug, Clone, Copy, PartialEq)]
pub enum AclAction {
    Allow = 0,
    Deny = 1,
    Reserve = 2,
}

impl AclAction {
    pub fn from_name(s: &str) -> Option<AclAction> {
        match s.to_ascii_lowercase().as_str() {
            "allow" => Some(AclAction::Allow),
            "deny" => Some(AclAction::Deny),
            "reserve" => Some(AclAction::Reserve),
            _ => None,
        }
    }
    pub fn flag(&self) -> u8 {
        self.to_u8().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AclEntry {
    network: u32,
    mask: u32,
    action: AclAction,
}

fn mask_for_bits(bits: u8) -> u32 {
    if bits == 0 {
        0
    } else {
        u32::MAX << (32 - bits as u32)
    }
}

impl AclEntry {
    pub fn new(network: Ipv4Addr, mask_bits: u8, action: AclAction) -> Result<AclEntry, JamError> {
        if mask_bits > 32 {
            return Err(JamError::Config(format!("bad mask length /{}", mask_bits)));
        }
        let mask = mask_for_bits(mask_bits);
        Ok(AclEntry {
            network: u32::from(network) & mask,
            mask,
            action,
        })
    }

    /// parse "10.0.0.0/8" (a bare address means /32) with an action name
    pub fn parse(cidr: &str, action: &str) -> Result<AclEntry, JamError> {
        let act = AclAction::from_name(action)
            .ok_or_else(|| JamError::Config(format!("unknown acl action '{}'", action)))?;
        let (addr_part, bits) = match cidr.split_once('/') {
            Some((a, b)) => (
                a,
                b.trim()
                    .parse::<u8>()
                    .map_err(|_| JamError::Config(format!("bad mask in '{}'", cidr)))?,
            ),
            None => (cidr, 32),
        };
        let addr: Ipv4Addr = addr_part
            .trim()
            .parse()
            .map_err(|_| JamError::Config(format!("bad address in '{}'", cidr)))?;
        AclEntry::new(addr, bits, act)
    }

    pub fn matches(&self, addr: u32) -> bool {
        addr & self.mask == self.network
    }

    pub fn action(&self) -> AclAction {
        self.action
    }
}

impl fmt::Display for AclEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{} {:?}",
            Ipv4Addr::from(self.network),
            self.mask.count_ones(),
            self.action
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccessControlList {
    entries: Vec<AclEntry>,
}

impl AccessControlList {
    pub fn new() -> AccessControlList {
        AccessControlList { entries: vec![] }
    }
    pub fn add(&mut self, entry: AclEntry) {
        self.entries.push(entry);
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, addr: IpAddr) -> AclAction {
        let v4 = match addr {
            IpAddr::V4(a) => a,
            IpAddr::V6(a) => match a.to_ipv4_mapped() {
                Some(m) => m,
                None => return AclAction::Allow,
            },
        };
        let raw = u32::from(v4);
        self.entries
            .iter()
            .find(|e| e.matches(raw))
            .map(|e| e.action)
            .unwrap_or(AclAction::Allow)
    }
}
