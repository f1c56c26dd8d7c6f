//! utility functions shared by the sound and dsp code
use num::{Float, FromPrimitive};

/// Coefficient for a one pole smoother with the given time constant (seconds)
/// running at `sample_rate` updates per second.
pub fn get_coef<T: Float + FromPrimitive>(time_const: T, sample_rate: T) -> T {
    let one = T::one();
    if time_const <= T::zero() || sample_rate <= T::zero() {
        return one;
    }
    one - (-one / (time_const * sample_rate)).exp()
}

/// dB to linear gain
pub fn to_lin(db: f32) -> f32 {
    f32::powf(10.0, db / 20.0)
}

/// linear gain to dB, with silence pinned at -100
pub fn to_db(lin: f64) -> f64 {
    if lin <= 0.0 {
        -100.0
    } else {
        20.0 * lin.log10()
    }
}

pub fn clip_float(v: f32) -> f32 {
    v.clamp(-1.0, 1.0)
}

/// Power of a frame in dB (floor of -60)
pub fn get_frame_power_in_db(data: &[f32], gain: f64) -> f64 {
    if data.is_empty() {
        return -60.0;
    }
    let sum: f64 = data.iter().map(|s| (*s as f64 * gain).powi(2)).sum();
    let mean = sum / data.len() as f64;
    if mean <= 0.0 {
        return -60.0;
    }
    f64::max(10.0 * mean.log10(), -60.0)
}

/// Samples in one interval: `round(sample_rate * bpi * 60 / bpm)`
pub fn interval_length_samples(sample_rate: u32, bpm: u16, bpi: u16) -> usize {
    if bpm == 0 {
        return 0;
    }
    (sample_rate as f64 * bpi as f64 * 60.0 / bpm as f64).round() as usize
}

/// Channel volume on the wire is tenths of a dB.
pub fn wire_volume_to_lin(v: i16) -> f32 {
    to_lin(v as f32 / 10.0)
}

pub fn lin_to_wire_volume(lin: f32) -> i16 {
    if lin <= 0.0 {
        return i16::MIN;
    }
    (200.0 * lin.log10()).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Pan on the wire is -128..127 for hard left..hard right.
pub fn wire_pan_to_f32(p: i8) -> f32 {
    (p as f32 / 127.0).clamp(-1.0, 1.0)
}

pub fn f32_to_wire_pan(p: f32) -> i8 {
    (p.clamp(-1.0, 1.0) * 127.0).round() as i8
}
