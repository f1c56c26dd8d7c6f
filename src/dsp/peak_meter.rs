//! decaying linear peak meter
//!
//! `peak = max(|s|, peak * decay)` with the decay scaled to the block length so
//! the meter falls at the same rate regardless of block size.

pub struct PeakMeter {
    peak: f32,
}

impl Default for PeakMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl PeakMeter {
    pub fn new() -> PeakMeter {
        PeakMeter { peak: 0.0 }
    }

    /// decay applied for a block of `len` samples at `sample_rate`
    pub fn decay_for(len: usize, sample_rate: u32) -> f32 {
        if sample_rate == 0 {
            return 0.0;
        }
        0.25f32.powi(3).powf(len as f32 / sample_rate as f32)
    }

    pub fn update(&mut self, block: &[f32], sample_rate: u32) -> f32 {
        let max = block.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        self.feed(max, block.len(), sample_rate)
    }

    /// same as `update` when the caller already has the block's largest magnitude
    pub fn feed(&mut self, max_abs: f32, len: usize, sample_rate: u32) -> f32 {
        let decay = Self::decay_for(len, sample_rate);
        self.peak = max_abs.max(self.peak * decay);
        self.peak
    }

    pub fn get(&self) -> f32 {
        self.peak
    }

    pub fn reset(&mut self) {
        self.peak = 0.0;
    }
}

#[cfg(test)]
mod test_peak_meter {
    use super::*;

    #[test]
    fn holds_the_max() {
        let mut m = PeakMeter::new();
        assert_eq!(m.update(&[0.1, -0.7, 0.3], 48_000), 0.7);
    }

    #[test]
    fn decays_over_a_second() {
        let mut m = PeakMeter::new();
        m.update(&[1.0], 48_000);
        m.update(&vec![0.0; 48_000], 48_000);
        // one second of silence takes it down by 0.25^3
        assert!((m.get() - 0.015625).abs() < 1e-4);
    }

    #[test]
    fn decay_is_block_size_independent() {
        let mut a = PeakMeter::new();
        let mut b = PeakMeter::new();
        a.update(&[1.0], 48_000);
        b.update(&[1.0], 48_000);
        a.update(&vec![0.0; 4800], 48_000);
        for _ in 0..10 {
            b.update(&vec![0.0; 480], 48_000);
        }
        assert!((a.get() - b.get()).abs() < 1e-4);
    }
}
