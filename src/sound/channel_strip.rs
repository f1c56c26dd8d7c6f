//! gain, balance, mute/solo and a peak meter for one source
use crate::{dsp::peak_meter::PeakMeter, utils::clip_float};

use super::fader::Fader;

/// loudest gain a strip accepts, about +12 dB
pub const MAX_GAIN: f32 = 4.0;

pub struct ChannelStrip {
    fader: Fader,
    gain: f32,
    mute: bool,
    solo: bool,
    meter: PeakMeter,
}

impl Default for ChannelStrip {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelStrip {
    pub fn new() -> ChannelStrip {
        ChannelStrip {
            fader: Fader::new(),
            gain: 1.0,
            mute: false,
            solo: false,
            meter: PeakMeter::new(),
        }
    }
    pub fn calc_values(&self, in_l: f32, in_r: f32) -> (f32, f32) {
        (
            self.gain * in_l * self.fader.left(),
            self.gain * in_r * self.fader.right(),
        )
    }
    pub fn set_gain(&mut self, v: f32) {
        self.gain = v.clamp(0.0, MAX_GAIN);
    }
    pub fn get_gain(&self) -> f32 {
        self.gain
    }
    pub fn set_fade(&mut self, v: f32) {
        self.fader.set(v);
    }
    pub fn get_fade(&self) -> f32 {
        self.fader.get()
    }
    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }
    pub fn get_mute(&self) -> bool {
        self.mute
    }
    pub fn set_solo(&mut self, solo: bool) {
        self.solo = solo;
    }
    pub fn get_solo(&self) -> bool {
        self.solo
    }
    pub fn get_peak(&self) -> f32 {
        self.meter.get()
    }

    /// with anything soloed only soloed strips play, otherwise unmuted ones do
    pub fn is_audible(&self, any_solo: bool) -> bool {
        if any_solo {
            self.solo
        } else {
            !self.mute
        }
    }

    /// nothing to play this block, let the meter fall
    pub fn idle(&mut self, frames: usize, sample_rate: u32) {
        self.meter.feed(0.0, frames, sample_rate);
    }

    /// Add a stereo source into the output.  Each sample this strip contributes
    /// is clamped to [-1, 1]; the meter sees the signal even when muted.
    pub fn mix_into(
        &mut self,
        src_l: &[f32],
        src_r: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
        any_solo: bool,
        sample_rate: u32,
    ) {
        let audible = self.is_audible(any_solo);
        let mut max = 0.0f32;
        let frames = src_l.len().min(src_r.len()).min(out_a.len()).min(out_b.len());
        for i in 0..frames {
            let (l, r) = self.calc_values(src_l[i], src_r[i]);
            let (l, r) = (clip_float(l), clip_float(r));
            max = max.max(l.abs()).max(r.abs());
            if audible {
                out_a[i] += l;
                out_b[i] += r;
            }
        }
        self.meter.feed(max, frames, sample_rate);
    }
}

#[cfg(test)]
mod test_channel_strip {
    use super::*;

    #[test]
    fn gain_and_balance() {
        let mut strip = ChannelStrip::new();
        strip.set_gain(0.5);
        strip.set_fade(-1.0);
        assert_eq!(strip.calc_values(1.0, 1.0), (0.5, 0.0));
        strip.set_gain(100.0);
        assert_eq!(strip.get_gain(), MAX_GAIN);
    }

    #[test]
    fn contribution_is_clamped() {
        let mut strip = ChannelStrip::new();
        strip.set_gain(2.0);
        let mut a = [0.5; 4];
        let mut b = [0.0; 4];
        strip.mix_into(&[0.9; 4], &[-0.9; 4], &mut a, &mut b, false, 48_000);
        assert_eq!(a, [1.5; 4]);
        assert_eq!(b, [-1.0; 4]);
        assert_eq!(strip.get_peak(), 1.0);
    }

    #[test]
    fn mute_and_solo() {
        let mut strip = ChannelStrip::new();
        let mut a = [0.0; 2];
        let mut b = [0.0; 2];
        strip.set_mute(true);
        strip.mix_into(&[0.3; 2], &[0.3; 2], &mut a, &mut b, false, 48_000);
        assert_eq!(a, [0.0; 2]);
        assert!(strip.get_peak() > 0.0);
        // solo overrides mute
        strip.set_solo(true);
        assert!(strip.is_audible(true));
        strip.set_solo(false);
        strip.set_mute(false);
        assert!(!strip.is_audible(true));
        assert!(strip.is_audible(false));
    }
}
