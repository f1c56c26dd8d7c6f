//! average and peak power of a stream of blocks, in dB
//!
//! Fed once per audio block, so the time constants are in blocks per second.
//! Used for the levels reported in the engine status.
use crate::utils::get_frame_power_in_db;

use super::smoothing_filter::SmoothingFilter;

pub struct PowerMeter {
    peak: f64,
    release: SmoothingFilter<f64>,
    avg: SmoothingFilter<f64>,
}

impl PowerMeter {
    pub fn new(blocks_per_sec: f64) -> PowerMeter {
        let mut release = SmoothingFilter::build(0.5, blocks_per_sec);
        let mut avg = SmoothingFilter::build(0.1, blocks_per_sec);
        release.reset(-60.0);
        avg.reset(-60.0);
        PowerMeter {
            peak: -60.0,
            release,
            avg,
        }
    }
    pub fn get_peak(&self) -> f64 {
        self.peak
    }
    pub fn get_avg(&self) -> f64 {
        self.avg.get_last_output()
    }
    pub fn add_frame(&mut self, data: &[f32], gain: f64) {
        let p = get_frame_power_in_db(data, gain);
        let falling = self.release.get(p);
        // the peak jumps up at once and falls back slowly
        self.peak = if p > falling {
            self.release.reset(p);
            p
        } else {
            falling
        };
        self.avg.get(p);
    }
}
