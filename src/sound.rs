//! components used to make the jam client
//!
//! The client is split in two.  The network side ([`client`]) talks to the
//! server, while the real time side ([`jam_engine`]) runs inside the audio
//! callback.  They share nothing but channels, atomics and the pending slots
//! handed over for each remote channel.
use crate::common::box_error::BoxError;

/// Something an audio host can drive with blocks of samples.
pub trait SoundCallback {
    fn get_sample_rate(&self) -> u32;
    fn process(
        &mut self,
        in_a: &[f32],
        in_b: &[f32],
        out_a: &mut [f32],
        out_b: &mut [f32],
    ) -> Result<(), BoxError>;
}

pub mod buffer_queue;
pub mod channel_strip;
pub mod click_track;
pub mod client;
pub mod codec;
pub mod decode_state;
pub mod engine_command;
pub mod fader;
pub mod interval_clock;
pub mod jack_thread;
pub mod jam_engine;
pub mod local_channel;
pub mod mixer;
pub mod remote_download;
pub mod remote_user;
