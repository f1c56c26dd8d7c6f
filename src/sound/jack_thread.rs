//! runs a [`SoundCallback`] from the jack server, or from a timer when there is no sound card
use crate::common::box_error::BoxError;

use log::{debug, error, info, warn};
use simple_error::bail;
use std::thread::sleep;
use std::time::{Duration, Instant};

use super::SoundCallback;

const CLIENT_NAME: &str = "ninjam_rust";

/// Connect the engine to jack, wire it to the system ports, and run until jack shuts down.
pub fn run<T: SoundCallback + Send + 'static>(mut engine: T) -> Result<(), BoxError> {
    let (client, _status) = jack::Client::new(CLIENT_NAME, jack::ClientOptions::NO_START_SERVER)?;

    let jack_rate = client.sample_rate() as u32;
    if jack_rate != engine.get_sample_rate() {
        bail!(
            "jack runs at {} but the engine expects {}",
            jack_rate,
            engine.get_sample_rate()
        );
    }

    let in_a = client.register_port("ninjam_in_1", jack::AudioIn::default())?;
    let in_b = client.register_port("ninjam_in_2", jack::AudioIn::default())?;
    let mut out_a = client.register_port("ninjam_out_l", jack::AudioOut::default())?;
    let mut out_b = client.register_port("ninjam_out_r", jack::AudioOut::default())?;

    // The callback gets called by jack whenever we have a frame
    let process_callback = move |_: &jack::Client, ps: &jack::ProcessScope| -> jack::Control {
        let in_a_p = in_a.as_slice(ps);
        let in_b_p = in_b.as_slice(ps);
        let out_a_p = out_a.as_mut_slice(ps);
        let out_b_p = out_b.as_mut_slice(ps);
        match engine.process(in_a_p, in_b_p, out_a_p, out_b_p) {
            Ok(()) => jack::Control::Continue,
            Err(e) => {
                error!("engine process failed: {}", e);
                jack::Control::Quit
            }
        }
    };
    let process = jack::ClosureProcessHandler::new(process_callback);

    // Activate the client, which starts the processing.
    let active_client = client.activate_async(Notifications, process)?;

    // Connect system inputs to us and our outputs to playback
    let ports = [
        ("system:capture_1", "ninjam_rust:ninjam_in_1"),
        ("system:capture_2", "ninjam_rust:ninjam_in_2"),
        ("ninjam_rust:ninjam_out_l", "system:playback_1"),
        ("ninjam_rust:ninjam_out_r", "system:playback_2"),
    ];
    for (from, to) in ports {
        if let Err(e) = active_client.as_client().connect_ports_by_name(from, to) {
            warn!("could not connect {} to {}: {}", from, to, e);
        }
    }

    loop {
        sleep(Duration::new(2, 0));
    }
}

/// Drive the engine with silence at real time pace.  Lets the client jam (and
/// record what it receives) on a box with no audio hardware.
pub fn run_without_audio<T: SoundCallback>(mut engine: T, block_size: usize) -> Result<(), BoxError> {
    let rate = engine.get_sample_rate().max(1) as u64;
    let block_time = Duration::from_micros(block_size as u64 * 1_000_000 / rate);
    info!(
        "no audio device, running {} frame blocks every {:?}",
        block_size, block_time
    );
    let silence = vec![0.0; block_size];
    let mut out_a = vec![0.0; block_size];
    let mut out_b = vec![0.0; block_size];
    let mut next = Instant::now();
    loop {
        engine.process(&silence, &silence, &mut out_a, &mut out_b)?;
        next += block_time;
        let now = Instant::now();
        if next > now {
            sleep(next - now);
        } else {
            debug!("headless engine behind by {:?}", now - next);
            next = now;
        }
    }
}

struct Notifications;

impl jack::NotificationHandler for Notifications {
    fn thread_init(&self, _: &jack::Client) {
        debug!("JACK: thread init");
    }

    fn shutdown(&mut self, status: jack::ClientStatus, reason: &str) {
        warn!(
            "JACK: shutdown with status {:?} because \"{}\"",
            status, reason
        );
    }

    fn freewheel(&mut self, _: &jack::Client, is_enabled: bool) {
        info!(
            "JACK: freewheel mode is {}",
            if is_enabled { "on" } else { "off" }
        );
    }

    fn sample_rate(&mut self, _: &jack::Client, srate: jack::Frames) -> jack::Control {
        // the interval clock is built for one rate
        error!("JACK: sample rate changed to {}, stopping", srate);
        jack::Control::Quit
    }

    fn ports_connected(
        &mut self,
        _: &jack::Client,
        port_id_a: jack::PortId,
        port_id_b: jack::PortId,
        are_connected: bool,
    ) {
        debug!(
            "JACK: ports with id {} and {} are {}",
            port_id_a,
            port_id_b,
            if are_connected {
                "connected"
            } else {
                "disconnected"
            }
        );
    }

    fn xrun(&mut self, _: &jack::Client) -> jack::Control {
        warn!("JACK: xrun occurred");
        jack::Control::Continue
    }
}
