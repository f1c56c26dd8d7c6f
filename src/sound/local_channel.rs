//! one local channel: captured audio in, upload messages out
//!
//! A channel is split in two.  [`LocalInput`] lives in the audio engine and
//! pushes captured blocks and interval markers into a [`block_fifo`].
//! [`LocalChannel`] lives on the network thread, drains the FIFO through the
//! encoder and turns the bytes into upload begin/write messages.
//!
//! The begin message for an interval is held back until the encoder has
//! produced enough bytes, then the stream goes out in bounded chunks with the
//! end flag on the last one.
use log::{debug, trace};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::common::{
    guid::Guid,
    jam_error::JamError,
    message_body::{
        ChannelInfo, IntervalWrite, MessageBody, UploadIntervalBegin, UploadIntervalWrite,
        WRITE_FLAG_END,
    },
    net_message::NetMessage,
};

use super::{
    buffer_queue::{block_fifo, Block, BlockReader, BlockWriter},
    channel_strip::ChannelStrip,
    codec::AudioEncoder,
};

pub const MIN_CHUNK: usize = 2048;
pub const MAX_CHUNK: usize = 9216;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum UploadState {
    /// begin message not sent yet for this interval
    NeedHeader,
    Encoding,
    Finalizing,
}

/// The real time half of a local channel.
pub struct LocalInput {
    pub index: u8,
    /// which device input feeds this channel
    pub source: usize,
    pub strip: ChannelStrip,
    writer: BlockWriter,
    broadcasting: Arc<AtomicBool>,
    bcast_active: bool,
}

impl LocalInput {
    /// Close the interval that just ended and decide about the next one.
    pub fn on_interval_boundary(&mut self) {
        if self.bcast_active {
            self.writer.push_marker(Block::EndOfInterval);
        }
        let broadcasting = self.broadcasting.load(Ordering::Relaxed);
        if !broadcasting {
            self.writer.push_marker(Block::Silence);
        }
        self.bcast_active = broadcasting;
    }

    pub fn capture(&mut self, samples: &[f32]) {
        if self.bcast_active {
            self.writer.push(samples);
        } else {
            self.writer.flush_held();
        }
    }

    pub fn dropped_blocks(&self) -> usize {
        self.writer.dropped()
    }
}

/// The network half of a local channel.
pub struct LocalChannel {
    index: u8,
    name: String,
    source: usize,
    bitrate: u32,
    flags: u8,
    broadcasting: Arc<AtomicBool>,
    reader: BlockReader,
    encoder: Box<dyn AudioEncoder>,
    state: UploadState,
    in_interval: bool,
    guid: Guid,
    pending: Vec<u8>,
}

impl LocalChannel {
    pub fn new(
        index: u8,
        name: &str,
        source: usize,
        encoder: Box<dyn AudioEncoder>,
    ) -> (LocalChannel, LocalInput) {
        let (writer, reader) = block_fifo();
        let broadcasting = Arc::new(AtomicBool::new(false));
        (
            LocalChannel {
                index,
                name: String::from(name),
                source,
                bitrate: 64,
                flags: 0,
                broadcasting: broadcasting.clone(),
                reader,
                encoder,
                state: UploadState::NeedHeader,
                in_interval: false,
                guid: Guid::zero(),
                pending: vec![],
            },
            LocalInput {
                index,
                source,
                strip: ChannelStrip::new(),
                writer,
                broadcasting,
                bcast_active: false,
            },
        )
    }

    pub fn index(&self) -> u8 {
        self.index
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn set_name(&mut self, name: &str) {
        self.name = String::from(name);
    }
    pub fn source(&self) -> usize {
        self.source
    }
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }
    pub fn set_bitrate(&mut self, bitrate: u32) {
        self.bitrate = bitrate;
    }
    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }
    pub fn state(&self) -> UploadState {
        self.state
    }
    pub fn guid(&self) -> Guid {
        self.guid
    }
    /// takes effect at the next interval boundary
    pub fn set_broadcasting(&mut self, on: bool) {
        self.broadcasting.store(on, Ordering::Relaxed);
    }
    pub fn is_broadcasting(&self) -> bool {
        self.broadcasting.load(Ordering::Relaxed)
    }

    pub fn channel_info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name.clone(),
            volume: 0,
            pan: 0,
            flags: self.flags,
        }
    }

    /// Drain the FIFO, appending any upload messages to `out`.
    pub fn process(&mut self, out: &mut Vec<NetMessage>) -> Result<(), JamError> {
        while let Some(block) = self.reader.pop() {
            match block {
                Block::Audio(buf) => {
                    if !self.in_interval {
                        self.start_interval();
                    }
                    self.encoder.encode(&buf, &mut self.pending);
                    self.reader.recycle(buf);
                    self.send_chunks(out)?;
                }
                Block::EndOfInterval => {
                    if !self.in_interval {
                        self.start_interval();
                    }
                    self.finish_interval(out)?;
                }
                Block::Silence => {
                    trace!("channel {} silent this interval", self.index);
                    out.push(UploadIntervalBegin::silence(self.index).build()?);
                }
            }
        }
        Ok(())
    }

    /// Drain what is left and close an open interval.  Used when the channel goes away.
    pub fn finalize(&mut self, out: &mut Vec<NetMessage>) -> Result<(), JamError> {
        self.process(out)?;
        if self.in_interval {
            self.finish_interval(out)?;
        }
        Ok(())
    }

    fn start_interval(&mut self) {
        self.guid = Guid::generate();
        self.encoder.reset();
        self.pending.clear();
        self.state = UploadState::NeedHeader;
        self.in_interval = true;
        debug!("channel {} new interval {}", self.index, self.guid);
    }

    fn begin_message(&self) -> Result<NetMessage, JamError> {
        UploadIntervalBegin {
            guid: self.guid,
            estsize: 0,
            fourcc: self.encoder.fourcc(),
            channel_index: self.index,
        }
        .build()
    }

    fn write_message(&mut self, len: usize, flags: u8) -> Result<NetMessage, JamError> {
        UploadIntervalWrite(IntervalWrite {
            guid: self.guid,
            flags,
            data: self.pending.drain(..len).collect(),
        })
        .build()
    }

    fn send_chunks(&mut self, out: &mut Vec<NetMessage>) -> Result<(), JamError> {
        if self.state == UploadState::NeedHeader {
            if self.pending.len() <= MIN_CHUNK * 4 {
                return Ok(());
            }
            out.push(self.begin_message()?);
            self.state = UploadState::Encoding;
        }
        while self.pending.len() > MIN_CHUNK {
            let n = self.pending.len().min(MAX_CHUNK);
            out.push(self.write_message(n, 0)?);
        }
        Ok(())
    }

    fn finish_interval(&mut self, out: &mut Vec<NetMessage>) -> Result<(), JamError> {
        let need_begin = self.state == UploadState::NeedHeader;
        self.state = UploadState::Finalizing;
        self.encoder.finish(&mut self.pending);
        if need_begin {
            out.push(self.begin_message()?);
        }
        loop {
            let n = self.pending.len().min(MAX_CHUNK);
            let last = n == self.pending.len();
            out.push(self.write_message(n, if last { WRITE_FLAG_END } else { 0 })?);
            if last {
                break;
            }
        }
        self.in_interval = false;
        self.state = UploadState::NeedHeader;
        Ok(())
    }
}
