//! linear interpolating sample rate converter for stereo frames
//!
//! The fractional read position carries over between calls so a stream can be
//! converted a block at a time without clicks at the block edges.
use std::collections::VecDeque;

#[derive(Default)]
pub struct Resampler {
    phase: f64,
}

impl Resampler {
    pub fn new() -> Resampler {
        Resampler { phase: 0.0 }
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
    }

    /// Fill `out_l`/`out_r` from `src` where `ratio` is source rate over output rate.
    ///
    /// Consumed frames are popped off `src`.  When `finished` is set the last
    /// source frame is played out instead of waiting for its successor.
    /// Returns the number of frames written.
    pub fn fill(
        &mut self,
        src: &mut VecDeque<[f32; 2]>,
        ratio: f64,
        finished: bool,
        out_l: &mut [f32],
        out_r: &mut [f32],
    ) -> usize {
        let frames = out_l.len().min(out_r.len());
        if ratio <= 0.0 {
            return 0;
        }
        let mut written = 0;
        while written < frames {
            while self.phase >= 1.0 && src.pop_front().is_some() {
                self.phase -= 1.0;
            }
            if self.phase >= 1.0 {
                break;
            }
            let a = match src.front() {
                Some(f) => *f,
                None => break,
            };
            let b = match src.get(1) {
                Some(f) => *f,
                None if finished || self.phase == 0.0 && ratio == 1.0 => a,
                None => break,
            };
            let t = self.phase as f32;
            out_l[written] = a[0] + (b[0] - a[0]) * t;
            out_r[written] = a[1] + (b[1] - a[1]) * t;
            written += 1;
            self.phase += ratio;
        }
        while self.phase >= 1.0 && src.pop_front().is_some() {
            self.phase -= 1.0;
        }
        written
    }
}

#[cfg(test)]
mod test_resampler {
    use super::*;

    fn ramp(n: usize) -> VecDeque<[f32; 2]> {
        (0..n).map(|i| [i as f32, -(i as f32)]).collect()
    }

    #[test]
    fn unity_ratio_copies() {
        let mut r = Resampler::new();
        let mut src = ramp(8);
        let mut l = [0.0; 8];
        let mut rr = [0.0; 8];
        assert_eq!(r.fill(&mut src, 1.0, false, &mut l, &mut rr), 8);
        assert_eq!(l, [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(rr[3], -3.0);
        assert!(src.is_empty());
    }

    #[test]
    fn upsample_interpolates() {
        let mut r = Resampler::new();
        let mut src = ramp(4);
        let mut l = [0.0; 6];
        let mut rr = [0.0; 6];
        let n = r.fill(&mut src, 0.5, false, &mut l, &mut rr);
        assert_eq!(n, 6);
        assert_eq!(&l[..6], &[0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn phase_carries_between_calls() {
        let mut whole = Resampler::new();
        let mut split = Resampler::new();
        let mut src_a = ramp(100);
        let mut src_b = ramp(100);
        let mut la = vec![0.0; 60];
        let mut ra = vec![0.0; 60];
        whole.fill(&mut src_a, 1.5, false, &mut la, &mut ra);
        let mut lb = vec![0.0; 60];
        let mut rb = vec![0.0; 60];
        let (l1, l2) = lb.split_at_mut(25);
        let (r1, r2) = rb.split_at_mut(25);
        split.fill(&mut src_b, 1.5, false, l1, r1);
        split.fill(&mut src_b, 1.5, false, l2, r2);
        assert_eq!(la, lb);
    }

    #[test]
    fn waits_for_data_unless_finished() {
        let mut r = Resampler::new();
        let mut src = ramp(2);
        let mut l = [0.0; 4];
        let mut rr = [0.0; 4];
        assert_eq!(r.fill(&mut src, 0.5, false, &mut l, &mut rr), 2);
        assert_eq!(r.fill(&mut src, 0.5, true, &mut l, &mut rr), 2);
    }
}
