//! Tempo voting.
//!
//! Users type `!vote bpm 110` or `!vote bpi 16` into chat.  How those votes
//! turn into a tempo change is up to a [`VotePolicy`].  The server ships with
//! [`ThresholdVote`]: the value with the most live votes wins once it has at
//! least `threshold` percent of the visible users behind it.  Votes go stale
//! after the timeout.  A threshold outside 1..=100 switches voting off.
use std::fmt;

use super::server_config::{MAX_BPI, MAX_BPM, MIN_BPI, MIN_BPM};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VoteKind {
    Bpm,
    Bpi,
}

impl VoteKind {
    pub fn from_name(s: &str) -> Option<VoteKind> {
        match s.to_ascii_lowercase().as_str() {
            "bpm" => Some(VoteKind::Bpm),
            "bpi" => Some(VoteKind::Bpi),
            _ => None,
        }
    }
    pub fn range(&self) -> (u32, u32) {
        match self {
            VoteKind::Bpm => (MIN_BPM as u32, MAX_BPM as u32),
            VoteKind::Bpi => (MIN_BPI as u32, MAX_BPI as u32),
        }
    }
}

impl fmt::Display for VoteKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VoteKind::Bpm => write!(f, "BPM"),
            VoteKind::Bpi => write!(f, "BPI"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    Disabled,
    Invalid(String),
    Pending {
        kind: VoteKind,
        value: u32,
        votes: usize,
        needed: usize,
    },
    Passed {
        kind: VoteKind,
        value: u32,
    },
}

pub trait VotePolicy: Send {
    fn set_params(&mut self, threshold: u32, timeout_secs: u32);
    fn timeout_secs(&self) -> u32;
    /// record a vote and report what it did.  `visible_users` counts voters' peers
    /// that are not hidden, the voter included.
    fn cast(&mut self, voter: &str, kind: VoteKind, value: u32, visible_users: usize, now: u128) -> VoteOutcome;
    /// drop anything this user had voted
    fn user_left(&mut self, voter: &str);
}

struct Vote {
    voter: String,
    kind: VoteKind,
    value: u32,
    time: u128,
}

pub struct ThresholdVote {
    threshold: u32,
    timeout_secs: u32,
    votes: Vec<Vote>,
}

impl ThresholdVote {
    pub fn new(threshold: u32, timeout_secs: u32) -> ThresholdVote {
        ThresholdVote {
            threshold,
            timeout_secs,
            votes: vec![],
        }
    }
    pub fn enabled(&self) -> bool {
        self.threshold >= 1 && self.threshold <= 100
    }
}

impl VotePolicy for ThresholdVote {
    fn set_params(&mut self, threshold: u32, timeout_secs: u32) {
        self.threshold = threshold;
        self.timeout_secs = timeout_secs;
        if !self.enabled() {
            self.votes.clear();
        }
    }

    fn timeout_secs(&self) -> u32 {
        self.timeout_secs
    }

    fn cast(&mut self, voter: &str, kind: VoteKind, value: u32, visible_users: usize, now: u128) -> VoteOutcome {
        if !self.enabled() {
            return VoteOutcome::Disabled;
        }
        let (lo, hi) = kind.range();
        if value < lo || value > hi {
            return VoteOutcome::Invalid(format!("{} vote must be between {} and {}", kind, lo, hi));
        }
        let timeout = self.timeout_secs as u128 * 1_000_000;
        self.votes.retain(|v| now.saturating_sub(v.time) <= timeout);
        self.votes.retain(|v| !(v.voter == voter && v.kind == kind));
        self.votes.push(Vote {
            voter: voter.to_string(),
            kind,
            value,
            time: now,
        });

        // plurality among live votes of this kind, ties go to the lower value
        let mut tally: Vec<(u32, usize)> = vec![];
        for v in self.votes.iter().filter(|v| v.kind == kind) {
            match tally.iter_mut().find(|(val, _)| *val == v.value) {
                Some(t) => t.1 += 1,
                None => tally.push((v.value, 1)),
            }
        }
        tally.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let (leader, count) = tally.first().copied().unwrap_or((value, 1));
        let needed = ((visible_users * self.threshold as usize + 50) / 100).max(1);
        if count >= needed {
            self.votes.retain(|v| v.kind != kind);
            VoteOutcome::Passed { kind, value: leader }
        } else {
            VoteOutcome::Pending {
                kind,
                value: leader,
                votes: count,
                needed,
            }
        }
    }

    fn user_left(&mut self, voter: &str) {
        self.votes.retain(|v| v.voter != voter);
    }
}
