//! the client's picture of the other people in the room
use std::{collections::BTreeMap, sync::Arc};

use crate::{
    common::{channel_mask::ChannelMask, message_body::UserInfoRecord},
    utils::{wire_pan_to_f32, wire_volume_to_lin},
};

use super::decode_state::PendingSlot;

/// What the mixer needs to know about one remote channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotParams {
    pub volume: f32,
    pub pan: f32,
    pub mute: bool,
    pub solo: bool,
    pub subscribed: bool,
}

impl Default for SlotParams {
    fn default() -> Self {
        SlotParams {
            volume: 1.0,
            pan: 0.0,
            mute: false,
            solo: false,
            subscribed: true,
        }
    }
}

pub struct RemoteChannel {
    pub name: String,
    /// the levels the sender advertised for this channel
    pub advertised_volume: f32,
    pub advertised_pan: f32,
    pub flags: u8,
    /// local settings, see [`RemoteUser::effective_params`]
    pub params: SlotParams,
    pub slot: Arc<PendingSlot>,
}

#[derive(Debug, PartialEq)]
pub enum RecordChange {
    Added(u8),
    Updated(u8),
    Removed(u8),
    Unchanged,
}

pub struct RemoteUser {
    pub name: String,
    pub volume: f32,
    pub pan: f32,
    pub mute: bool,
    channels: BTreeMap<u8, RemoteChannel>,
}

impl RemoteUser {
    pub fn new(name: &str) -> RemoteUser {
        RemoteUser {
            name: String::from(name),
            volume: 1.0,
            pan: 0.0,
            mute: false,
            channels: BTreeMap::new(),
        }
    }

    pub fn presence_mask(&self) -> ChannelMask {
        let mut m = ChannelMask::empty();
        for idx in self.channels.keys() {
            m.set(*idx as usize, true);
        }
        m
    }

    pub fn subscription_mask(&self) -> ChannelMask {
        let mut m = ChannelMask::empty();
        for (idx, ch) in self.channels.iter() {
            m.set(*idx as usize, ch.params.subscribed);
        }
        m
    }

    pub fn channel(&self, idx: u8) -> Option<&RemoteChannel> {
        self.channels.get(&idx)
    }
    pub fn channel_mut(&mut self, idx: u8) -> Option<&mut RemoteChannel> {
        self.channels.get_mut(&idx)
    }
    pub fn channels(&self) -> impl Iterator<Item = (&u8, &RemoteChannel)> {
        self.channels.iter()
    }
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Fold one roster record into this user.
    pub fn apply_record(&mut self, rec: &UserInfoRecord, auto_subscribe: bool) -> RecordChange {
        let idx = rec.channel_index;
        if (idx as usize) >= crate::common::channel_mask::MAX_USER_CHANNELS {
            return RecordChange::Unchanged;
        }
        if !rec.active {
            return match self.channels.remove(&idx) {
                Some(_) => RecordChange::Removed(idx),
                None => RecordChange::Unchanged,
            };
        }
        let advertised_volume = wire_volume_to_lin(rec.volume);
        let advertised_pan = wire_pan_to_f32(rec.pan);
        match self.channels.get_mut(&idx) {
            Some(ch) => {
                ch.name = rec.channel_name.clone();
                ch.advertised_volume = advertised_volume;
                ch.advertised_pan = advertised_pan;
                ch.flags = rec.flags;
                RecordChange::Updated(idx)
            }
            None => {
                self.channels.insert(
                    idx,
                    RemoteChannel {
                        name: rec.channel_name.clone(),
                        advertised_volume,
                        advertised_pan,
                        flags: rec.flags,
                        params: SlotParams {
                            subscribed: auto_subscribe,
                            ..SlotParams::default()
                        },
                        slot: PendingSlot::new(),
                    },
                );
                RecordChange::Added(idx)
            }
        }
    }

    /// Channel settings combined with the user wide volume, pan and mute.
    pub fn effective_params(&self, idx: u8) -> Option<SlotParams> {
        self.channels.get(&idx).map(|ch| SlotParams {
            volume: ch.params.volume * self.volume,
            pan: (ch.params.pan + self.pan).clamp(-1.0, 1.0),
            mute: ch.params.mute || self.mute,
            solo: ch.params.solo,
            subscribed: ch.params.subscribed,
        })
    }
}
