//! audio codecs selected by the fourcc tag of an interval
//!
//! The only built in codec is 16 bit little endian PCM.  A stream starts with
//! an 8 byte header (sample rate u32, channel count u16, reserved u16) and is
//! followed by interleaved i16 samples.  Vorbis is recognised as a tag but has
//! no decoder here, so those intervals play as silence.
use byteorder::{ByteOrder, LittleEndian};

#[cfg(test)]
use mockall::automock;

use crate::common::message_body::make_fourcc;

pub const FOURCC_PCM: u32 = make_fourcc(b"PCMi");
pub const FOURCC_OGG_VORBIS: u32 = make_fourcc(b"OGGv");

pub const PCM_HEADER_SIZE: usize = 8;

/// Turns captured float samples into the bytes of one interval.
pub trait AudioEncoder: Send {
    fn fourcc(&self) -> u32;
    /// append the encoded form of `samples` (interleaved) to `out`
    fn encode(&mut self, samples: &[f32], out: &mut Vec<u8>);
    /// flush anything held back at the end of an interval
    fn finish(&mut self, out: &mut Vec<u8>);
    /// start a new stream, the next encode writes a fresh header
    fn reset(&mut self);
}

/// Turns the bytes of one interval back into float samples.
///
/// Bytes arrive in arbitrary pieces, so a decoder keeps whatever part of a
/// header or sample it could not use yet.
#[cfg_attr(test, automock)]
pub trait AudioDecoder: Send {
    /// decode `data`, appending interleaved samples to `out`
    fn decode(&mut self, data: &[u8], out: &mut Vec<f32>);
    /// source sample rate, 0 until the stream header has been seen
    fn sample_rate(&self) -> u32;
    /// 0 until the stream header has been seen
    fn channels(&self) -> usize;
}

pub struct PcmEncoder {
    sample_rate: u32,
    channels: u16,
    header_pending: bool,
}

impl PcmEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> PcmEncoder {
        PcmEncoder {
            sample_rate,
            channels,
            header_pending: true,
        }
    }
}

impl AudioEncoder for PcmEncoder {
    fn fourcc(&self) -> u32 {
        FOURCC_PCM
    }
    fn encode(&mut self, samples: &[f32], out: &mut Vec<u8>) {
        if self.header_pending {
            let mut header = [0u8; PCM_HEADER_SIZE];
            LittleEndian::write_u32(&mut header[0..4], self.sample_rate);
            LittleEndian::write_u16(&mut header[4..6], self.channels);
            out.extend_from_slice(&header);
            self.header_pending = false;
        }
        out.reserve(samples.len() * 2);
        for s in samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    fn finish(&mut self, out: &mut Vec<u8>) {
        // a stream with no audio still carries its header
        if self.header_pending {
            self.encode(&[], out);
        }
    }
    fn reset(&mut self) {
        self.header_pending = true;
    }
}

#[derive(Default)]
pub struct PcmDecoder {
    sample_rate: u32,
    channels: usize,
    carry: Vec<u8>,
}

impl PcmDecoder {
    pub fn new() -> PcmDecoder {
        PcmDecoder::default()
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8], out: &mut Vec<f32>) {
        self.carry.extend_from_slice(data);
        let mut pos = 0;
        if self.channels == 0 {
            if self.carry.len() < PCM_HEADER_SIZE {
                return;
            }
            self.sample_rate = LittleEndian::read_u32(&self.carry[0..4]);
            self.channels = LittleEndian::read_u16(&self.carry[4..6]).max(1) as usize;
            pos = PCM_HEADER_SIZE;
        }
        // whole frames only, a split frame waits in carry for the rest
        let frame_bytes = 2 * self.channels;
        let avail = self.carry.len() - pos;
        let usable = avail - avail % frame_bytes;
        for pair in self.carry[pos..pos + usable].chunks_exact(2) {
            out.push(LittleEndian::read_i16(pair) as f32 / i16::MAX as f32);
        }
        self.carry.drain(..pos + usable);
    }
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
    fn channels(&self) -> usize {
        self.channels
    }
}

/// The decoder for a fourcc, or None when the interval should play as silence.
pub fn decoder_for(fourcc: u32) -> Option<Box<dyn AudioDecoder>> {
    match fourcc {
        FOURCC_PCM => Some(Box::new(PcmDecoder::new())),
        _ => None,
    }
}
