//! ninjam_rust - interval synchronized jamming
//!
//! Everybody plays along to the previous interval of everybody else.  Audio is
//! captured for a fixed number of beats, compressed, and sent through the
//! server, which relays it to every subscribed user for playback one interval
//! later.  The library provides the broadcast server and the pieces of a
//! client: protocol codec, upload and download handling and the mixing engine.
extern crate json;
#[macro_use]
extern crate num_derive;

pub mod common;
pub mod dsp;
pub mod server;
pub mod sound;
pub mod utils;
