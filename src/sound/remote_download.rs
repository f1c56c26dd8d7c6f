//! reassembly of downloaded intervals
//!
//! Each download-begin opens a transfer keyed by its GUID.  Writes append to
//! the transfer's [`DecodeBuffer`]; once enough bytes are in (or the end flag
//! shows up) a [`DecodeState`] for it is put in the channel's pending slot.
//! The audio thread promotes it at its next interval boundary.
use log::{debug, warn};
use std::sync::Arc;

use crate::common::{
    guid::Guid,
    message_body::{DownloadIntervalBegin, IntervalWrite},
    micro_timer::MicroTimer,
};

use super::decode_state::{DecodeBuffer, DecodeState, PendingSlot};

pub const DEFAULT_PREBUFFER: usize = 8192;
/// a download with no writes for this long is dropped
pub const DOWNLOAD_TIMEOUT: u128 = 8_000_000;

struct Download {
    guid: Guid,
    fourcc: u32,
    username: String,
    channel: u8,
    slot: Arc<PendingSlot>,
    buffer: Arc<DecodeBuffer>,
    bytes: usize,
    promoted: bool,
    timer: MicroTimer,
}

impl Download {
    fn promote(&mut self) {
        self.promoted = true;
        self.slot
            .replace(DecodeState::new(self.guid, self.fourcc, self.buffer.clone()));
    }
}

pub struct DownloadManager {
    downloads: Vec<Download>,
    prebuffer: usize,
}

impl DownloadManager {
    pub fn new(prebuffer: usize) -> DownloadManager {
        DownloadManager {
            downloads: vec![],
            prebuffer,
        }
    }

    pub fn len(&self) -> usize {
        self.downloads.len()
    }
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }

    /// A download-begin for a channel whose slot is `slot`.
    pub fn begin(&mut self, b: &DownloadIntervalBegin, slot: &Arc<PendingSlot>, now: u128) {
        if b.guid.is_zero() {
            // the sender has nothing this interval, whatever was waiting is stale
            slot.clear();
            return;
        }
        if b.fourcc == 0 {
            slot.replace(DecodeState::silent(b.guid));
            return;
        }
        if self.downloads.iter().any(|d| d.guid == b.guid) {
            warn!("duplicate download begin {}", b.guid);
            return;
        }
        debug!(
            "download {} from {} channel {}",
            b.guid, b.username, b.channel_index
        );
        let mut download = Download {
            guid: b.guid,
            fourcc: b.fourcc,
            username: b.username.clone(),
            channel: b.channel_index,
            slot: slot.clone(),
            buffer: DecodeBuffer::new(),
            bytes: 0,
            promoted: false,
            timer: MicroTimer::new(now, DOWNLOAD_TIMEOUT),
        };
        if self.prebuffer == 0 {
            download.promote();
        }
        self.downloads.push(download);
    }

    /// Returns false when the GUID belongs to no open download.
    pub fn write(&mut self, w: &IntervalWrite, now: u128) -> bool {
        let pos = match self.downloads.iter().position(|d| d.guid == w.guid) {
            Some(p) => p,
            None => return false,
        };
        let prebuffer = self.prebuffer;
        let d = &mut self.downloads[pos];
        d.timer.reset(now);
        d.buffer.append(&w.data);
        d.bytes += w.data.len();
        if !d.promoted && (d.bytes >= prebuffer || w.is_end()) {
            d.promote();
        }
        if w.is_end() {
            d.buffer.finish();
            self.downloads.remove(pos);
        }
        true
    }

    /// Drop stalled downloads.  Their decoders see the stream end where it stopped.
    pub fn prune(&mut self, now: u128) {
        self.downloads.retain(|d| {
            if d.timer.expired(now) {
                warn!(
                    "download {} from {} channel {} timed out",
                    d.guid, d.username, d.channel
                );
                d.buffer.finish();
                false
            } else {
                true
            }
        });
    }

    /// Forget downloads for a user, or one of their channels.
    pub fn cancel(&mut self, username: &str, channel: Option<u8>) {
        self.downloads.retain(|d| {
            let hit = d.username == username && channel.map_or(true, |c| c == d.channel);
            if hit {
                d.buffer.finish();
            }
            !hit
        });
    }

    pub fn clear(&mut self) {
        for d in &self.downloads {
            d.buffer.finish();
        }
        self.downloads.clear();
    }
}

#[cfg(test)]
mod test_remote_download {
    use super::*;
    use crate::common::message_body::WRITE_FLAG_END;
    use crate::sound::codec::FOURCC_PCM;

    fn begin(guid: Guid, fourcc: u32) -> DownloadIntervalBegin {
        DownloadIntervalBegin {
            guid,
            estsize: 0,
            fourcc,
            channel_index: 0,
            username: String::from("bob"),
        }
    }

    fn write(guid: Guid, len: usize, end: bool) -> IntervalWrite {
        IntervalWrite {
            guid,
            flags: if end { WRITE_FLAG_END } else { 0 },
            data: vec![0; len],
        }
    }

    #[test]
    fn promotes_after_prebuffer() {
        let slot = PendingSlot::new();
        let mut mgr = DownloadManager::new(100);
        let g = Guid::generate();
        mgr.begin(&begin(g, FOURCC_PCM), &slot, 0);
        assert!(mgr.write(&write(g, 60, false), 10));
        assert!(!slot.is_pending());
        assert!(mgr.write(&write(g, 60, false), 20));
        assert_eq!(slot.pending_guid(), Some(g));
        assert!(mgr.write(&write(g, 10, true), 30));
        assert!(mgr.is_empty());
        assert!(!mgr.write(&write(g, 10, true), 40));
    }

    #[test]
    fn end_flag_promotes_short_interval() {
        let slot = PendingSlot::new();
        let mut mgr = DownloadManager::new(DEFAULT_PREBUFFER);
        let g = Guid::generate();
        mgr.begin(&begin(g, FOURCC_PCM), &slot, 0);
        mgr.write(&write(g, 10, true), 10);
        assert_eq!(slot.pending_guid(), Some(g));
    }

    #[test]
    fn zero_prebuffer_promotes_at_once() {
        let slot = PendingSlot::new();
        let mut mgr = DownloadManager::new(0);
        let g = Guid::generate();
        mgr.begin(&begin(g, FOURCC_PCM), &slot, 0);
        assert_eq!(slot.pending_guid(), Some(g));
    }

    #[test]
    fn zero_guid_clears_pending() {
        let slot = PendingSlot::new();
        let mut mgr = DownloadManager::new(0);
        mgr.begin(&begin(Guid::generate(), FOURCC_PCM), &slot, 0);
        assert!(slot.is_pending());
        mgr.begin(&begin(Guid::zero(), 0), &slot, 0);
        assert!(!slot.is_pending());
    }

    #[test]
    fn zero_fourcc_is_silence() {
        let slot = PendingSlot::new();
        let mut mgr = DownloadManager::new(8192);
        let g = Guid::generate();
        mgr.begin(&begin(g, 0), &slot, 0);
        assert!(mgr.is_empty());
        assert_eq!(slot.pending_guid(), Some(g));
        assert!(slot.take().map(|s| s.is_silent()).unwrap_or(false));
    }

    #[test]
    fn newer_arrival_replaces_pending() {
        let slot = PendingSlot::new();
        let mut mgr = DownloadManager::new(0);
        let a = Guid::generate();
        let b = Guid::generate();
        mgr.begin(&begin(a, FOURCC_PCM), &slot, 0);
        mgr.begin(&begin(b, FOURCC_PCM), &slot, 0);
        assert_eq!(slot.pending_guid(), Some(b));
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn stalled_download_times_out() {
        let slot = PendingSlot::new();
        let mut mgr = DownloadManager::new(DEFAULT_PREBUFFER);
        let g = Guid::generate();
        mgr.begin(&begin(g, FOURCC_PCM), &slot, 0);
        mgr.write(&write(g, 10, false), 1_000_000);
        mgr.prune(DOWNLOAD_TIMEOUT);
        assert_eq!(mgr.len(), 1);
        mgr.prune(1_000_000 + DOWNLOAD_TIMEOUT + 1);
        assert!(mgr.is_empty());
    }

    #[test]
    fn cancel_by_user() {
        let slot = PendingSlot::new();
        let mut mgr = DownloadManager::new(DEFAULT_PREBUFFER);
        mgr.begin(&begin(Guid::generate(), FOURCC_PCM), &slot, 0);
        mgr.cancel("alice", None);
        assert_eq!(mgr.len(), 1);
        mgr.cancel("bob", Some(0));
        assert!(mgr.is_empty());
    }
}
