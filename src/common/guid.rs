//! 128 bit interval identifier
use rand::RngCore;
use std::fmt;

pub const GUID_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid([u8; GUID_SIZE]);

impl Guid {
    pub fn zero() -> Guid {
        Guid([0; GUID_SIZE])
    }
    /// fresh random id for a new interval
    pub fn generate() -> Guid {
        let mut bytes = [0; GUID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Guid(bytes)
    }
    pub fn from_bytes(bytes: [u8; GUID_SIZE]) -> Guid {
        Guid(bytes)
    }
    pub fn from_slice(bytes: &[u8]) -> Option<Guid> {
        let arr: [u8; GUID_SIZE] = bytes.get(..GUID_SIZE)?.try_into().ok()?;
        Some(Guid(arr))
    }
    pub fn as_bytes(&self) -> &[u8; GUID_SIZE] {
        &self.0
    }
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// upper case hex, 32 characters.  The session archive names files with this.
impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}
