//! Messages the network thread sends to the audio engine
//!
//! The engine owns all of its state.  Anything the control side wants to change
//! goes through an mpsc channel that the engine drains at the top of every
//! audio block, so the real time thread never waits on a lock for it.

use std::{fmt, sync::Arc};

use super::{decode_state::PendingSlot, local_channel::LocalInput, remote_user::SlotParams};

pub enum EngineCommand {
    /// new bpm/bpi from the server, used from the next interval on
    SetTempo { bpm: u16, bpi: u16 },
    AddLocal(LocalInput),
    RemoveLocal(u8),
    SetLocalMonitor {
        index: u8,
        volume: f32,
        pan: f32,
        mute: bool,
        solo: bool,
    },
    AddRemote {
        user: String,
        channel: u8,
        pending: Arc<PendingSlot>,
        params: SlotParams,
    },
    /// `channel` None removes every channel of the user
    RemoveRemote { user: String, channel: Option<u8> },
    SetRemote {
        user: String,
        channel: u8,
        params: SlotParams,
    },
    SetMaster { volume: f32, pan: f32, mute: bool },
    SetMetronome { volume: f32 },
    /// drop every remote slot, used on disconnect
    ClearRemote,
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineCommand::SetTempo { bpm, bpi } => write!(f, "SetTempo {{ bpm: {}, bpi: {} }}", bpm, bpi),
            EngineCommand::AddLocal(input) => write!(f, "AddLocal {{ index: {} }}", input.index),
            EngineCommand::RemoveLocal(index) => write!(f, "RemoveLocal {{ index: {} }}", index),
            EngineCommand::SetLocalMonitor {
                index,
                volume,
                pan,
                mute,
                solo,
            } => write!(
                f,
                "SetLocalMonitor {{ index: {}, volume: {}, pan: {}, mute: {}, solo: {} }}",
                index, volume, pan, mute, solo
            ),
            EngineCommand::AddRemote { user, channel, .. } => {
                write!(f, "AddRemote {{ user: {}, channel: {} }}", user, channel)
            }
            EngineCommand::RemoveRemote { user, channel } => {
                write!(f, "RemoveRemote {{ user: {}, channel: {:?} }}", user, channel)
            }
            EngineCommand::SetRemote {
                user,
                channel,
                params,
            } => write!(
                f,
                "SetRemote {{ user: {}, channel: {}, params: {:?} }}",
                user, channel, params
            ),
            EngineCommand::SetMaster { volume, pan, mute } => write!(
                f,
                "SetMaster {{ volume: {}, pan: {}, mute: {} }}",
                volume, pan, mute
            ),
            EngineCommand::SetMetronome { volume } => {
                write!(f, "SetMetronome {{ volume: {} }}", volume)
            }
            EngineCommand::ClearRemote => write!(f, "ClearRemote"),
        }
    }
}
