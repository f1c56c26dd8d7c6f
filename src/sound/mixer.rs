//!
//! mixer used to combine all remote channels into a stereo output
//!
//! Lives on the real time thread.  Each slot owns the decode state it is
//! playing; the network thread only ever touches the slot's pending cell.
use std::sync::Arc;

use super::{
    channel_strip::ChannelStrip,
    decode_state::{DecodeState, PendingSlot},
    remote_user::SlotParams,
};

struct MixerSlot {
    user: String,
    channel: u8,
    subscribed: bool,
    pending: Arc<PendingSlot>,
    current: Option<DecodeState>,
    strip: ChannelStrip,
}

impl MixerSlot {
    fn apply(&mut self, params: &SlotParams) {
        self.strip.set_gain(params.volume);
        self.strip.set_fade(params.pan);
        self.strip.set_mute(params.mute);
        self.strip.set_solo(params.solo);
        self.subscribed = params.subscribed;
    }
}

#[derive(Default)]
pub struct RemoteMixer {
    slots: Vec<MixerSlot>,
    scratch_l: Vec<f32>,
    scratch_r: Vec<f32>,
}

impl RemoteMixer {
    pub fn new() -> RemoteMixer {
        RemoteMixer::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Add a slot, replacing any slot already there for the same user and channel.
    pub fn add_slot(&mut self, user: &str, channel: u8, pending: Arc<PendingSlot>, params: SlotParams) {
        self.remove_slot(user, Some(channel));
        let mut slot = MixerSlot {
            user: String::from(user),
            channel,
            subscribed: true,
            pending,
            current: None,
            strip: ChannelStrip::new(),
        };
        slot.apply(&params);
        self.slots.push(slot);
    }

    /// Remove one channel of a user, or all of them.
    pub fn remove_slot(&mut self, user: &str, channel: Option<u8>) {
        self.slots
            .retain(|s| !(s.user == user && channel.map_or(true, |c| c == s.channel)));
    }

    pub fn set_params(&mut self, user: &str, channel: u8, params: &SlotParams) {
        for s in self
            .slots
            .iter_mut()
            .filter(|s| s.user == user && s.channel == channel)
        {
            s.apply(params);
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn any_solo(&self) -> bool {
        self.slots.iter().any(|s| s.strip.get_solo())
    }

    pub fn is_playing(&self, user: &str, channel: u8) -> bool {
        self.slots
            .iter()
            .any(|s| s.user == user && s.channel == channel && s.current.is_some())
    }

    /// Promote pending to current for subscribed slots; unsubscribed slots go quiet.
    pub fn on_interval_boundary(&mut self) {
        for s in self.slots.iter_mut() {
            let next = s.pending.take();
            s.current = if s.subscribed { next } else { None };
        }
    }

    /// Add every playing slot into the output.  The caller clamps the final mix.
    pub fn mix_into(
        &mut self,
        out_a: &mut [f32],
        out_b: &mut [f32],
        device_rate: u32,
        any_solo: bool,
    ) {
        let frames = out_a.len().min(out_b.len());
        if self.scratch_l.len() < frames {
            self.scratch_l.resize(frames, 0.0);
            self.scratch_r.resize(frames, 0.0);
        }
        for slot in self.slots.iter_mut() {
            let current = match slot.current.as_mut() {
                Some(c) => c,
                None => {
                    slot.strip.idle(frames, device_rate);
                    continue;
                }
            };
            let l = &mut self.scratch_l[..frames];
            let r = &mut self.scratch_r[..frames];
            l.fill(0.0);
            r.fill(0.0);
            current.render(l, r, device_rate);
            slot.strip.mix_into(l, r, out_a, out_b, any_solo, device_rate);
        }
    }

    /// (user, channel, peak) for every slot
    pub fn peaks(&self) -> impl Iterator<Item = (&str, u8, f32)> {
        self.slots
            .iter()
            .map(|s| (s.user.as_str(), s.channel, s.strip.get_peak()))
    }
}

#[cfg(test)]
mod test_mixer {
    use super::*;
    use crate::common::guid::Guid;
    use crate::sound::{
        codec::{AudioEncoder, PcmEncoder, FOURCC_PCM},
        decode_state::DecodeBuffer,
    };

    fn pcm_state(samples: &[f32]) -> DecodeState {
        let mut enc = PcmEncoder::new(48_000, 1);
        let mut bytes = vec![];
        enc.encode(samples, &mut bytes);
        let buf = DecodeBuffer::new();
        buf.append(&bytes);
        buf.finish();
        DecodeState::new(Guid::generate(), FOURCC_PCM, buf)
    }

    fn quantized(v: f32) -> f32 {
        (v * i16::MAX as f32).round() / i16::MAX as f32
    }

    #[test]
    fn sums_two_channels_and_clamps() {
        let mut mixer = RemoteMixer::new();
        let a = PendingSlot::new();
        let b = PendingSlot::new();
        mixer.add_slot("alice", 0, a.clone(), SlotParams::default());
        mixer.add_slot("bob", 0, b.clone(), SlotParams::default());
        a.replace(pcm_state(&[0.25, 0.5, -0.75, 0.5]));
        b.replace(pcm_state(&[0.25, 0.25, -0.5, -0.25]));
        mixer.on_interval_boundary();
        let mut out_a = [0.0; 4];
        let mut out_b = [0.0; 4];
        mixer.mix_into(&mut out_a, &mut out_b, 48_000, false);
        let expect = [
            quantized(0.25) + quantized(0.25),
            quantized(0.5) + quantized(0.25),
            quantized(-0.75) + quantized(-0.5),
            quantized(0.5) + quantized(-0.25),
        ];
        for i in 0..4 {
            let clamped = out_a[i].clamp(-1.0, 1.0);
            assert!((clamped - expect[i].clamp(-1.0, 1.0)).abs() < 1e-6);
            assert_eq!(out_a[i], out_b[i]);
        }
    }

    #[test]
    fn pending_only_plays_after_boundary() {
        let mut mixer = RemoteMixer::new();
        let a = PendingSlot::new();
        mixer.add_slot("alice", 0, a.clone(), SlotParams::default());
        a.replace(pcm_state(&[0.5; 8]));
        let mut out_a = [0.0; 8];
        let mut out_b = [0.0; 8];
        mixer.mix_into(&mut out_a, &mut out_b, 48_000, false);
        assert_eq!(out_a, [0.0; 8]);
        assert!(!mixer.is_playing("alice", 0));
        mixer.on_interval_boundary();
        assert!(mixer.is_playing("alice", 0));
        assert!(!a.is_pending());
        mixer.mix_into(&mut out_a, &mut out_b, 48_000, false);
        assert!(out_a[0] > 0.49);
        // nothing pending at the next boundary means nothing plays
        mixer.on_interval_boundary();
        assert!(!mixer.is_playing("alice", 0));
    }

    #[test]
    fn unsubscribed_slot_discards() {
        let mut mixer = RemoteMixer::new();
        let a = PendingSlot::new();
        let params = SlotParams {
            subscribed: false,
            ..SlotParams::default()
        };
        mixer.add_slot("alice", 0, a.clone(), params);
        a.replace(pcm_state(&[0.5; 8]));
        mixer.on_interval_boundary();
        assert!(!mixer.is_playing("alice", 0));
        assert!(!a.is_pending());
    }

    #[test]
    fn solo_wins_over_everything() {
        let mut mixer = RemoteMixer::new();
        let a = PendingSlot::new();
        let b = PendingSlot::new();
        mixer.add_slot("alice", 0, a.clone(), SlotParams::default());
        let solo = SlotParams {
            solo: true,
            ..SlotParams::default()
        };
        mixer.add_slot("bob", 1, b.clone(), solo);
        assert!(mixer.any_solo());
        a.replace(pcm_state(&[0.5; 4]));
        b.replace(pcm_state(&[0.25; 4]));
        mixer.on_interval_boundary();
        let mut out_a = [0.0; 4];
        let mut out_b = [0.0; 4];
        mixer.mix_into(&mut out_a, &mut out_b, 48_000, mixer.any_solo());
        assert!((out_a[0] - quantized(0.25)).abs() < 1e-6);
        let peaks: Vec<(&str, u8, f32)> = mixer.peaks().collect();
        assert_eq!(peaks.len(), 2);
        // the muted-by-solo channel still meters
        assert!(peaks[0].2 > 0.0);
    }

    #[test]
    fn remove_user_slots() {
        let mut mixer = RemoteMixer::new();
        mixer.add_slot("alice", 0, PendingSlot::new(), SlotParams::default());
        mixer.add_slot("alice", 1, PendingSlot::new(), SlotParams::default());
        mixer.add_slot("alice", 1, PendingSlot::new(), SlotParams::default());
        mixer.add_slot("bob", 0, PendingSlot::new(), SlotParams::default());
        assert_eq!(mixer.len(), 3);
        mixer.remove_slot("alice", None);
        assert_eq!(mixer.len(), 1);
    }
}
