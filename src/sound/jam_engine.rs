//! the JamEngine aggregates all the sound components into a single structure.
//!
//! The engine drives off the [`JamEngine::process`] function
use log::{debug, trace};
use serde_json::json;
use std::sync::mpsc;

use crate::{common::box_error::BoxError, dsp::power_meter::PowerMeter, utils::to_db};

use super::{
    channel_strip::ChannelStrip, click_track::ClickTrack, engine_command::EngineCommand,
    interval_clock::IntervalClock, local_channel::LocalInput, mixer::RemoteMixer, SoundCallback,
};

/// how often a status message goes out, in msec of audio
pub const STATUS_INTERVAL_MSEC: usize = 100;

/// Aggregates all the sound components into a single structure
///
/// Once built, the audio host should call the process function with every
/// block of samples to drive the engine.
///
/// The JamEngine maintains:
/// - the interval clock, which decides where interval boundaries fall [`IntervalClock`]
/// - the real time half of every local channel [`LocalInput`]
/// - the mixer for everybody else's channels [`RemoteMixer`]
/// - the metronome [`ClickTrack`] and the master strip
///
/// To avoid having a mutex around the objects in the process loop, the JamEngine is created
/// with a mpsc::Sender and mpsc::Receiver.  The Engine will send json formatted status messages
/// to the Sender and will poll the Receiver every block for any [`EngineCommand`]s.
///
/// # Example
/// ```
/// use std::sync::mpsc;
/// use ninjam_rust::sound::engine_command::EngineCommand;
/// use ninjam_rust::sound::jam_engine::JamEngine;
/// fn main() {
///     let (status_data_tx, _status_data_rx): (
///             mpsc::Sender<serde_json::Value>,
///             mpsc::Receiver<serde_json::Value>,
///         ) = mpsc::channel();
///     let (_command_tx, command_rx): (
///             mpsc::Sender<EngineCommand>,
///             mpsc::Receiver<EngineCommand>
///         ) = mpsc::channel();
///     let mut engine = JamEngine::new(48_000, status_data_tx, command_rx);
///     // At this point some audio host would use engine.process() as the callback for audio frames
///     let in_a = [0.0;128];
///     let in_b = [0.0;128];
///     let mut out_left = [0.0;128];
///     let mut out_right = [0.0;128];
///     engine.process(&in_a, &in_b, &mut out_left, &mut out_right).expect("process");
/// }
/// ```
pub struct JamEngine {
    sample_rate: u32,
    clock: IntervalClock,
    locals: Vec<LocalInput>,
    remote: RemoteMixer,
    master: ChannelStrip,
    master_level: PowerMeter,
    click: ClickTrack,
    status_data_tx: mpsc::Sender<serde_json::Value>,
    command_rx: mpsc::Receiver<EngineCommand>,
    status_countdown: usize,
    mix_a: Vec<f32>,
    mix_b: Vec<f32>,
}

impl JamEngine {
    pub fn new(
        sample_rate: u32,
        tx: mpsc::Sender<serde_json::Value>,
        rx: mpsc::Receiver<EngineCommand>,
    ) -> JamEngine {
        JamEngine {
            sample_rate,
            clock: IntervalClock::new(sample_rate),
            locals: vec![],
            remote: RemoteMixer::new(),
            master: ChannelStrip::new(),
            // meter is fed once per block, assume 128 sample blocks
            master_level: PowerMeter::new(sample_rate as f64 / 128.0),
            click: ClickTrack::new(sample_rate),
            status_data_tx: tx,
            command_rx: rx,
            status_countdown: 0,
            mix_a: vec![],
            mix_b: vec![],
        }
    }

    pub fn get_sample_rate(&self) -> u32 {
        self.sample_rate
    }
    pub fn clock(&self) -> &IntervalClock {
        &self.clock
    }
    pub fn remote(&self) -> &RemoteMixer {
        &self.remote
    }
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// This is the function that the audio host will call with blocks of data.  The four arguments are the
    /// two input channels, and the stereo output.
    ///
    /// All control messages should be sent via the mpsc::Receiver passed into new above.
    pub fn process(
        &mut self,
        in_a: &[f32],
        in_b: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
    ) -> Result<(), BoxError> {
        self.check_command();
        let frames = in_a.len().min(in_b.len()).min(out_a.len()).min(out_b.len());
        if self.mix_a.len() < frames {
            self.mix_a.resize(frames, 0.0);
            self.mix_b.resize(frames, 0.0);
        }
        self.mix_a[..frames].fill(0.0);
        self.mix_b[..frames].fill(0.0);
        let any_solo =
            self.remote.any_solo() || self.locals.iter().any(|l| l.strip.get_solo());

        let mut offset = 0;
        while offset < frames {
            if self.clock.at_boundary() {
                self.on_interval_boundary();
            }
            let n = (frames - offset).min(self.clock.frames_to_boundary());
            let range = offset..offset + n;
            let mix_a = &mut self.mix_a[range.clone()];
            let mix_b = &mut self.mix_b[range.clone()];
            for local in self.locals.iter_mut() {
                let src = match local.source {
                    0 => &in_a[range.clone()],
                    _ => &in_b[range.clone()],
                };
                local.capture(src);
                local
                    .strip
                    .mix_into(src, src, mix_a, mix_b, any_solo, self.sample_rate);
            }
            self.remote
                .mix_into(mix_a, mix_b, self.sample_rate, any_solo);
            self.click.mix_into(
                self.clock.position(),
                self.clock.length(),
                self.clock.bpi(),
                mix_a,
                mix_b,
            );
            self.clock.advance(n);
            offset += n;
        }

        out_a[..frames].fill(0.0);
        out_b[..frames].fill(0.0);
        self.master.mix_into(
            &self.mix_a[..frames],
            &self.mix_b[..frames],
            &mut out_a[..frames],
            &mut out_b[..frames],
            false,
            self.sample_rate,
        );
        self.master_level.add_frame(&out_a[..frames], 1.0);
        self.send_status(frames);
        Ok(())
    }

    fn on_interval_boundary(&mut self) {
        self.clock.start_interval();
        for local in self.locals.iter_mut() {
            local.on_interval_boundary();
        }
        self.remote.on_interval_boundary();
        trace!(
            "interval {} length {} at {}/{}",
            self.clock.count(),
            self.clock.length(),
            self.clock.bpm(),
            self.clock.bpi()
        );
    }

    fn check_command(&mut self) {
        while let Ok(cmd) = self.command_rx.try_recv() {
            debug!("engine command: {}", cmd);
            match cmd {
                EngineCommand::SetTempo { bpm, bpi } => self.clock.set_tempo(bpm, bpi),
                EngineCommand::AddLocal(input) => {
                    let index = input.index;
                    self.locals.retain(|l| l.index != index);
                    self.locals.push(input);
                }
                EngineCommand::RemoveLocal(index) => self.locals.retain(|l| l.index != index),
                EngineCommand::SetLocalMonitor {
                    index,
                    volume,
                    pan,
                    mute,
                    solo,
                } => {
                    for l in self.locals.iter_mut().filter(|l| l.index == index) {
                        l.strip.set_gain(volume);
                        l.strip.set_fade(pan);
                        l.strip.set_mute(mute);
                        l.strip.set_solo(solo);
                    }
                }
                EngineCommand::AddRemote {
                    user,
                    channel,
                    pending,
                    params,
                } => self.remote.add_slot(&user, channel, pending, params),
                EngineCommand::RemoveRemote { user, channel } => {
                    self.remote.remove_slot(&user, channel)
                }
                EngineCommand::SetRemote {
                    user,
                    channel,
                    params,
                } => self.remote.set_params(&user, channel, &params),
                EngineCommand::SetMaster { volume, pan, mute } => {
                    self.master.set_gain(volume);
                    self.master.set_fade(pan);
                    self.master.set_mute(mute);
                }
                EngineCommand::SetMetronome { volume } => self.click.set_gain(volume),
                EngineCommand::ClearRemote => self.remote.clear(),
            }
        }
    }

    fn send_status(&mut self, frames: usize) {
        if self.status_countdown > frames {
            self.status_countdown -= frames;
            return;
        }
        self.status_countdown = self.sample_rate as usize * STATUS_INTERVAL_MSEC / 1000;
        let locals: Vec<serde_json::Value> = self
            .locals
            .iter()
            .map(|l| {
                json!({
                    "index": l.index,
                    "peak": l.strip.get_peak(),
                    "dropped": l.dropped_blocks(),
                })
            })
            .collect();
        let remotes: Vec<serde_json::Value> = self
            .remote
            .peaks()
            .map(|(user, channel, peak)| {
                json!({
                    "user": user,
                    "channel": channel,
                    "peak": peak,
                })
            })
            .collect();
        // a closed receiver just means nobody is listening
        let _ = self.status_data_tx.send(json!({
            "speaker": "JamEngine",
            "bpm": self.clock.bpm(),
            "bpi": self.clock.bpi(),
            "beat": self.clock.beat(),
            "intervalPosition": self.clock.position(),
            "intervalLength": self.clock.length(),
            "masterPeak": self.master.get_peak(),
            "masterPeakDb": to_db(self.master.get_peak() as f64),
            "masterLevel": self.master_level.get_avg(),
            "locals": locals,
            "remotes": remotes,
        }));
    }
}

impl SoundCallback for JamEngine {
    fn get_sample_rate(&self) -> u32 {
        self.sample_rate
    }
    fn process(
        &mut self,
        in_a: &[f32],
        in_b: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
    ) -> Result<(), BoxError> {
        JamEngine::process(self, in_a, in_b, out_a, out_b)
    }
}

#[cfg(test)]
mod test_jam_engine {
    use super::*;
    use crate::common::guid::Guid;
    use crate::common::message_body::{MessageBody, UploadIntervalBegin};
    use crate::sound::{
        codec::{AudioEncoder, PcmEncoder, FOURCC_PCM},
        decode_state::{DecodeBuffer, DecodeState, PendingSlot},
        local_channel::LocalChannel,
        remote_user::SlotParams,
    };

    fn engine(rate: u32) -> (
        JamEngine,
        mpsc::Sender<EngineCommand>,
        mpsc::Receiver<serde_json::Value>,
    ) {
        let (status_tx, status_rx) = mpsc::channel();
        let (cmd_tx, cmd_rx) = mpsc::channel();
        (JamEngine::new(rate, status_tx, cmd_rx), cmd_tx, status_rx)
    }

    fn run_blocks(e: &mut JamEngine, blocks: usize, input: f32) -> (Vec<f32>, Vec<f32>) {
        let in_a = vec![input; 128];
        let in_b = vec![0.0; 128];
        let mut all_a = vec![];
        let mut all_b = vec![];
        for _ in 0..blocks {
            let mut a = vec![0.0; 128];
            let mut b = vec![0.0; 128];
            e.process(&in_a, &in_b, &mut a, &mut b).unwrap();
            all_a.extend(a);
            all_b.extend(b);
        }
        (all_a, all_b)
    }

    #[test]
    fn first_block_starts_an_interval() {
        let (mut e, _tx, status) = engine(48_000);
        run_blocks(&mut e, 1, 0.0);
        assert_eq!(e.clock().count(), 1);
        assert_eq!(e.clock().position(), 128);
        let s = status.try_recv().unwrap();
        assert_eq!(s["bpm"], 120);
    }

    #[test]
    fn tempo_applies_at_boundary() {
        // 1000 Hz, 120 bpm, 2 bpi is 1000 samples per interval
        let (mut e, tx, _status) = engine(1000);
        tx.send(EngineCommand::SetTempo { bpm: 120, bpi: 2 }).unwrap();
        run_blocks(&mut e, 1, 0.0);
        assert_eq!(e.clock().length(), 1000);
        tx.send(EngineCommand::SetTempo { bpm: 60, bpi: 2 }).unwrap();
        run_blocks(&mut e, 6, 0.0);
        assert_eq!(e.clock().length(), 1000);
        assert_eq!(e.clock().count(), 1);
        // block 8 crosses sample 1000
        run_blocks(&mut e, 1, 0.0);
        assert_eq!(e.clock().count(), 2);
        assert_eq!(e.clock().length(), 2000);
        assert_eq!(e.clock().position(), 1024 - 1000);
    }

    #[test]
    fn local_channel_sees_boundaries() {
        let (mut e, tx, _status) = engine(1000);
        tx.send(EngineCommand::SetTempo { bpm: 120, bpi: 2 }).unwrap();
        let (mut ch, input) = LocalChannel::new(0, "mic", 0, Box::new(PcmEncoder::new(1000, 1)));
        tx.send(EngineCommand::AddLocal(input)).unwrap();
        let mut out = vec![];
        // not broadcasting: one silent begin per interval
        run_blocks(&mut e, 16, 0.1);
        ch.process(&mut out).unwrap();
        assert_eq!(out.len(), 3);
        for m in &out {
            assert!(UploadIntervalBegin::parse(m).unwrap().guid.is_zero());
        }
        assert_eq!(e.local_count(), 1);
        tx.send(EngineCommand::RemoveLocal(0)).unwrap();
        run_blocks(&mut e, 1, 0.0);
        assert_eq!(e.local_count(), 0);
    }

    #[test]
    fn local_monitoring_and_master() {
        let (mut e, tx, _status) = engine(48_000);
        let (_ch, input) = LocalChannel::new(0, "mic", 0, Box::new(PcmEncoder::new(48_000, 1)));
        tx.send(EngineCommand::AddLocal(input)).unwrap();
        let (a, b) = run_blocks(&mut e, 1, 0.25);
        assert_eq!(a[10], 0.25);
        assert_eq!(b[10], 0.25);
        tx.send(EngineCommand::SetMaster {
            volume: 1.0,
            pan: 0.0,
            mute: true,
        })
        .unwrap();
        let (a, _) = run_blocks(&mut e, 1, 0.25);
        assert_eq!(a[10], 0.0);
    }

    #[test]
    fn remote_audio_plays_from_next_interval() {
        let (mut e, tx, _status) = engine(1000);
        tx.send(EngineCommand::SetTempo { bpm: 120, bpi: 2 }).unwrap();
        let pending = PendingSlot::new();
        tx.send(EngineCommand::AddRemote {
            user: String::from("bob"),
            channel: 0,
            pending: pending.clone(),
            params: SlotParams::default(),
        })
        .unwrap();
        run_blocks(&mut e, 1, 0.0);
        let mut enc = PcmEncoder::new(1000, 1);
        let mut bytes = vec![];
        enc.encode(&[0.5; 1000], &mut bytes);
        let buf = DecodeBuffer::new();
        buf.append(&bytes);
        buf.finish();
        pending.replace(DecodeState::new(Guid::generate(), FOURCC_PCM, buf));
        // rest of the first interval stays quiet
        let (a, _) = run_blocks(&mut e, 6, 0.0);
        assert!(a.iter().all(|v| *v == 0.0));
        let (a, _) = run_blocks(&mut e, 1, 0.0);
        // 1024 samples in, the second interval began at 1000
        assert_eq!(a[..104].iter().filter(|v| **v == 0.0).count(), 104);
        assert!(a[104..].iter().all(|v| (*v - 0.5).abs() < 1e-3));
        assert!(e.remote().is_playing("bob", 0));
    }
}
