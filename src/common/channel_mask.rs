//! Fixed 32 bit channel set.  A user can never have more than 32 channels,
//! that is baked into the wire format (masks travel as u32).
use std::fmt;

pub const MAX_USER_CHANNELS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelMask(u32);

impl ChannelMask {
    pub fn empty() -> ChannelMask {
        ChannelMask(0)
    }
    pub fn all() -> ChannelMask {
        ChannelMask(u32::MAX)
    }
    pub fn from_bits(bits: u32) -> ChannelMask {
        ChannelMask(bits)
    }
    pub fn bits(&self) -> u32 {
        self.0
    }
    /// out of range channels are never members
    pub fn contains(&self, ch: usize) -> bool {
        ch < MAX_USER_CHANNELS && self.0 & (1 << ch) != 0
    }
    pub fn set(&mut self, ch: usize, on: bool) {
        if ch >= MAX_USER_CHANNELS {
            return;
        }
        if on {
            self.0 |= 1 << ch;
        } else {
            self.0 &= !(1 << ch);
        }
    }
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
    pub fn intersect(&self, other: ChannelMask) -> ChannelMask {
        ChannelMask(self.0 & other.0)
    }
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_USER_CHANNELS).filter(move |ch| self.contains(*ch))
    }
}

impl fmt::Display for ChannelMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}
