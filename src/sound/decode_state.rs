//! decode state for one downloaded interval and the pending slot it waits in
//!
//! The network thread appends bytes to a [`DecodeBuffer`] while the audio
//! thread decodes from it.  The buffer lock is only held to append or to copy
//! out the new bytes, and the audio side only ever tries the lock, so a busy
//! network thread costs it a block of latency at worst, never a stall.
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{common::guid::Guid, dsp::resampler::Resampler};

use super::codec::{decoder_for, AudioDecoder};

/// Reassembled bytes of one interval, shared between the download and the decoder.
#[derive(Default)]
pub struct DecodeBuffer {
    data: Mutex<Vec<u8>>,
    /// mirrors `data.len()` so the audio side can check it without the lock
    length: AtomicUsize,
    finished: AtomicBool,
}

impl DecodeBuffer {
    pub fn new() -> Arc<DecodeBuffer> {
        Arc::new(DecodeBuffer::default())
    }
    pub fn append(&self, bytes: &[u8]) {
        let mut data = self.data.lock();
        data.extend_from_slice(bytes);
        self.length.store(data.len(), Ordering::Release);
    }
    pub fn len(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// no more bytes will arrive, call after the last append
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
    /// Copy anything past `offset` into `out`.  Returns None when the lock is busy.
    pub fn read_from(&self, offset: usize, out: &mut Vec<u8>) -> Option<usize> {
        let data = self.data.try_lock()?;
        if offset >= data.len() {
            return Some(0);
        }
        out.extend_from_slice(&data[offset..]);
        Some(data.len() - offset)
    }
}

pub struct DecodeState {
    guid: Guid,
    fourcc: u32,
    buffer: Option<Arc<DecodeBuffer>>,
    decoder: Option<Box<dyn AudioDecoder>>,
    read_pos: usize,
    bytes: Vec<u8>,
    samples: Vec<f32>,
    frames: VecDeque<[f32; 2]>,
    resampler: Resampler,
}

impl DecodeState {
    pub fn new(guid: Guid, fourcc: u32, buffer: Arc<DecodeBuffer>) -> DecodeState {
        Self::with_decoder(guid, fourcc, buffer, decoder_for(fourcc))
    }

    pub fn with_decoder(
        guid: Guid,
        fourcc: u32,
        buffer: Arc<DecodeBuffer>,
        decoder: Option<Box<dyn AudioDecoder>>,
    ) -> DecodeState {
        DecodeState {
            guid,
            fourcc,
            buffer: Some(buffer),
            decoder,
            read_pos: 0,
            bytes: vec![],
            samples: vec![],
            frames: VecDeque::new(),
            resampler: Resampler::new(),
        }
    }

    /// an interval the sender marked as having no audio
    pub fn silent(guid: Guid) -> DecodeState {
        DecodeState {
            guid,
            fourcc: 0,
            buffer: None,
            decoder: None,
            read_pos: 0,
            bytes: vec![],
            samples: vec![],
            frames: VecDeque::new(),
            resampler: Resampler::new(),
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }
    pub fn fourcc(&self) -> u32 {
        self.fourcc
    }
    pub fn is_silent(&self) -> bool {
        self.decoder.is_none()
    }

    fn pump(&mut self) {
        let (buffer, decoder) = match (&self.buffer, &mut self.decoder) {
            (Some(b), Some(d)) => (b, d),
            _ => return,
        };
        self.bytes.clear();
        if let Some(n) = buffer.read_from(self.read_pos, &mut self.bytes) {
            self.read_pos += n;
        }
        if self.bytes.is_empty() {
            return;
        }
        // samples of a frame split across calls stay behind for the next one
        decoder.decode(&self.bytes, &mut self.samples);
        let n = decoder.channels();
        if n == 0 {
            return;
        }
        let whole = self.samples.len() - self.samples.len() % n;
        match n {
            1 => self.frames.extend(self.samples.iter().map(|s| [*s, *s])),
            _ => self
                .frames
                .extend(self.samples[..whole].chunks_exact(n).map(|f| [f[0], f[1]])),
        }
        self.samples.drain(..whole);
    }

    fn drained(&self) -> bool {
        match &self.buffer {
            Some(b) => b.is_finished() && self.read_pos >= b.len(),
            None => true,
        }
    }

    /// Render up to `out_l.len()` frames at `device_rate`.  Returns the frames
    /// written; the caller treats the rest as silence.
    pub fn render(&mut self, out_l: &mut [f32], out_r: &mut [f32], device_rate: u32) -> usize {
        self.pump();
        let src_rate = match &self.decoder {
            Some(d) => d.sample_rate(),
            None => return 0,
        };
        if src_rate == 0 || device_rate == 0 {
            return 0;
        }
        let finished = self.drained();
        let ratio = src_rate as f64 / device_rate as f64;
        self.resampler
            .fill(&mut self.frames, ratio, finished, out_l, out_r)
    }
}

/// Single slot double buffer.  A new arrival always replaces what is waiting.
#[derive(Default)]
pub struct PendingSlot {
    slot: Mutex<Option<DecodeState>>,
}

impl PendingSlot {
    pub fn new() -> Arc<PendingSlot> {
        Arc::new(PendingSlot::default())
    }

    /// Put a state in the slot, dropping any that was waiting.  Returns true
    /// when something was replaced.
    pub fn replace(&self, state: DecodeState) -> bool {
        let old = self.slot.lock().replace(state);
        // drop outside the lock
        old.is_some()
    }

    pub fn clear(&self) {
        let old = self.slot.lock().take();
        drop(old);
    }

    pub fn take(&self) -> Option<DecodeState> {
        self.slot.lock().take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn pending_guid(&self) -> Option<Guid> {
        self.slot.lock().as_ref().map(|s| s.guid())
    }
}
