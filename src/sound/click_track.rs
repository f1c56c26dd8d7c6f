//!
//! object to provide a click track on beat changes
//!
//! The first beat of each interval gets the higher "tic", the rest get "toc".
//! Beats are found per sample from the interval position, so the click lands
//! on the beat even when it falls in the middle of an audio block.

pub struct ClickTrack {
    gain: f32,
    tic: Vec<f32>,
    toc: Vec<f32>,
    idx: usize,
    accent: bool,
    last_beat: Option<u64>,
}

fn make_click(freq: f32, amp: f32, sample_rate: u32) -> Vec<f32> {
    // 60 msec of sine with an exponential fade
    let len = (sample_rate as usize * 60) / 1000;
    let step = std::f32::consts::PI * 2.0 * freq / sample_rate as f32;
    (0..len)
        .map(|i| {
            let env = (-6.0 * i as f32 / len as f32).exp();
            amp * env * (step * i as f32).sin()
        })
        .collect()
}

impl ClickTrack {
    pub fn new(sample_rate: u32) -> ClickTrack {
        ClickTrack {
            gain: 0.0,
            tic: make_click(1320.0, 1.0, sample_rate),
            toc: make_click(880.0, 0.7, sample_rate),
            idx: usize::MAX,
            accent: false,
            last_beat: None,
        }
    }
    pub fn get_gain(&self) -> f32 {
        self.gain
    }
    /// 0 turns the click off
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 1.0);
    }

    /// Mix clicks for the frames starting at `position` in an interval of
    /// `length` samples and `bpi` beats.
    pub fn mix_into(
        &mut self,
        position: usize,
        length: usize,
        bpi: u16,
        out_a: &mut [f32],
        out_b: &mut [f32],
    ) {
        if length == 0 {
            return;
        }
        for i in 0..out_a.len().min(out_b.len()) {
            let beat = ((position + i) as u64 * bpi as u64) / length as u64;
            if self.last_beat != Some(beat) {
                self.last_beat = Some(beat);
                self.accent = beat == 0;
                self.idx = 0;
            }
            let click = if self.accent { &self.tic } else { &self.toc };
            if let Some(v) = click.get(self.idx) {
                out_a[i] += self.gain * v;
                out_b[i] += self.gain * v;
                self.idx += 1;
            }
        }
    }
}
