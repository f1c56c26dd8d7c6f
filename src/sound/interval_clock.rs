//! counts samples through the current interval
//!
//! A tempo change is held until the next boundary so an interval never
//! changes length part way through.  The very first block starts an interval.
use crate::utils::interval_length_samples;

pub const DEFAULT_BPM: u16 = 120;
pub const DEFAULT_BPI: u16 = 8;

pub struct IntervalClock {
    sample_rate: u32,
    bpm: u16,
    bpi: u16,
    next_tempo: Option<(u16, u16)>,
    length: usize,
    position: usize,
    started: bool,
    count: u64,
}

impl IntervalClock {
    pub fn new(sample_rate: u32) -> IntervalClock {
        IntervalClock {
            sample_rate,
            bpm: DEFAULT_BPM,
            bpi: DEFAULT_BPI,
            next_tempo: None,
            length: 0,
            position: 0,
            started: false,
            count: 0,
        }
    }

    /// applied at the next boundary
    pub fn set_tempo(&mut self, bpm: u16, bpi: u16) {
        if bpm > 0 && bpi > 0 {
            self.next_tempo = Some((bpm, bpi));
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    pub fn at_boundary(&self) -> bool {
        !self.started || self.position >= self.length
    }

    /// Start the next interval, picking up any pending tempo.
    pub fn start_interval(&mut self) {
        if let Some((bpm, bpi)) = self.next_tempo.take() {
            self.bpm = bpm;
            self.bpi = bpi;
        }
        self.length = interval_length_samples(self.sample_rate, self.bpm, self.bpi).max(1);
        self.position = 0;
        self.started = true;
        self.count += 1;
    }

    pub fn frames_to_boundary(&self) -> usize {
        self.length.saturating_sub(self.position)
    }

    pub fn advance(&mut self, frames: usize) {
        self.position += frames;
    }

    pub fn bpm(&self) -> u16 {
        self.bpm
    }
    pub fn bpi(&self) -> u16 {
        self.bpi
    }
    pub fn length(&self) -> usize {
        self.length
    }
    pub fn position(&self) -> usize {
        self.position
    }
    /// intervals started so far
    pub fn count(&self) -> u64 {
        self.count
    }

    /// current beat within the interval, 0 based
    pub fn beat(&self) -> u16 {
        if self.length == 0 {
            return 0;
        }
        ((self.position as u64 * self.bpi as u64) / self.length as u64) as u16
    }
}

#[cfg(test)]
mod test_interval_clock {
    use super::*;

    #[test]
    fn first_block_is_a_boundary() {
        let mut clock = IntervalClock::new(48_000);
        assert!(clock.at_boundary());
        clock.start_interval();
        assert_eq!(clock.length(), 192_000);
        assert!(!clock.at_boundary());
        clock.advance(192_000);
        assert!(clock.at_boundary());
    }

    #[test]
    fn tempo_waits_for_boundary() {
        let mut clock = IntervalClock::new(48_000);
        clock.start_interval();
        clock.advance(1000);
        clock.set_tempo(60, 4);
        assert_eq!(clock.length(), 192_000);
        assert_eq!(clock.bpm(), 120);
        clock.advance(clock.frames_to_boundary());
        clock.start_interval();
        assert_eq!(clock.bpm(), 60);
        assert_eq!(clock.length(), 192_000);
        assert_eq!(clock.count(), 2);
    }

    #[test]
    fn beats() {
        let mut clock = IntervalClock::new(48_000);
        clock.start_interval();
        assert_eq!(clock.beat(), 0);
        clock.advance(24_000);
        assert_eq!(clock.beat(), 1);
        clock.advance(23_999);
        assert_eq!(clock.beat(), 1);
        clock.advance(1);
        assert_eq!(clock.beat(), 2);
    }

    #[test]
    fn ignores_zero_tempo() {
        let mut clock = IntervalClock::new(48_000);
        clock.set_tempo(0, 8);
        clock.start_interval();
        assert_eq!(clock.bpm(), DEFAULT_BPM);
    }
}
