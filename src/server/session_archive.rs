//! Optional on-disk archive of everything played in a session.
//!
//! While two or more users are logged in and a log path is configured, the
//! server keeps a dated directory like `20240131_2015.njsession` holding
//!
//! - `clipsort.log`, one line per event:
//!   - `interval <n> <bpm> <bpi>` at each server-side interval tick
//!   - `user <guid> "<user>" <channel> "<channel name>"` for each logged clip
//!   - `end` when the session closes
//! - sub directories `0`..`f`, each clip stored as `<first hex digit>/<guid>.<ext>`
use chrono::{DateTime, Local};
use log::{info, warn};
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use crate::common::{
    guid::Guid, jam_error::JamError, message_body::fourcc_to_ext, micro_timer::MicroTimer,
};

const MAX_DIR_TRIES: usize = 16;
pub const SESSION_EXT: &str = "njsession";

/// microseconds in one interval at this tempo
pub fn interval_micros(bpm: u16, bpi: u16) -> u128 {
    let bpm = bpm.max(1) as u128;
    bpi as u128 * 60_000_000 / bpm
}

pub struct SessionArchive {
    dir: PathBuf,
    log: File,
    interval_count: u64,
    interval_timer: Option<MicroTimer>,
}

impl SessionArchive {
    /// Create a fresh dated directory under `base`.  Collisions get `_1`, `_2` ...
    pub fn open(base: &Path, when: DateTime<Local>) -> Result<SessionArchive, JamError> {
        fs::create_dir_all(base)?;
        let stamp = when.format("%Y%m%d_%H%M").to_string();
        let mut dir = None;
        for n in 0..MAX_DIR_TRIES {
            let name = if n == 0 {
                format!("{}.{}", stamp, SESSION_EXT)
            } else {
                format!("{}_{}.{}", stamp, n, SESSION_EXT)
            };
            let candidate = base.join(name);
            if fs::create_dir(&candidate).is_ok() {
                dir = Some(candidate);
                break;
            }
        }
        let dir = dir.ok_or_else(|| {
            JamError::ResourceLimit(format!("no free session directory for {} in {}", stamp, base.display()))
        })?;
        for i in 0..16 {
            fs::create_dir_all(dir.join(format!("{:x}", i)))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("clipsort.log"))?;
        info!("session archive opened in {}", dir.display());
        Ok(SessionArchive {
            dir,
            log,
            interval_count: 0,
            interval_timer: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn interval_count(&self) -> u64 {
        self.interval_count
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.log, "{}", line) {
            warn!("clipsort.log write failed: {}", e);
        }
    }

    /// Log an interval line whenever a server-side interval has gone by.
    pub fn tick(&mut self, now: u128, bpm: u16, bpi: u16) {
        let len = interval_micros(bpm, bpi);
        match &mut self.interval_timer {
            None => {
                self.interval_timer = Some(MicroTimer::new(now, len));
            }
            Some(t) => {
                if !t.expired(now) {
                    return;
                }
                t.advance(t.get_interval());
                t.set_interval(len);
                // a long stall should not produce a burst of lines
                if t.expired(now) {
                    t.reset(now);
                }
            }
        }
        let line = format!("interval {} {} {}", self.interval_count, bpm, bpi);
        self.interval_count += 1;
        self.write_line(&line);
    }

    pub fn clip_path(&self, guid: &Guid, fourcc: u32) -> PathBuf {
        let hex = guid.to_string();
        self.dir
            .join(&hex[..1].to_ascii_lowercase())
            .join(format!("{}.{}", hex, fourcc_to_ext(fourcc)))
    }

    /// Start a clip file and note it in the log.  Returns None (after a warning)
    /// if the file cannot be made.
    pub fn begin_clip(&mut self, guid: &Guid, fourcc: u32, username: &str, channel: u8, channel_name: &str) -> Option<File> {
        let path = self.clip_path(guid, fourcc);
        match File::create(&path) {
            Ok(f) => {
                let line = format!("user {} \"{}\" {} \"{}\"", guid, username, channel, channel_name);
                self.write_line(&line);
                Some(f)
            }
            Err(e) => {
                warn!("cannot create clip {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn close(mut self) {
        self.write_line("end");
        info!("session archive closed: {}", self.dir.display());
    }
}
