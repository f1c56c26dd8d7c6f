//! User privilege bits and their config-file letters.
//!
//! | bit | letter | meaning |
//! |-----|--------|---------|
//! | TOPIC | t | may set the topic |
//! | CHATSEND | c | may send chat |
//! | BPM | b | may set bpm/bpi directly |
//! | KICK | k | may kick users |
//! | RESERVE | r | gets in even when the server is full |
//! | ALLOWMULTI | m | may log in more than once under one name |
//! | HIDDEN | h | not shown in user lists |
//! | VOTE | v | may vote on bpm/bpi |
//!
//! `*` means everything except hidden.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Privs(u32);

impl Privs {
    pub const TOPIC: Privs = Privs(1);
    pub const CHATSEND: Privs = Privs(2);
    pub const BPM: Privs = Privs(4);
    pub const KICK: Privs = Privs(8);
    pub const RESERVE: Privs = Privs(16);
    pub const ALLOWMULTI: Privs = Privs(32);
    pub const HIDDEN: Privs = Privs(64);
    pub const VOTE: Privs = Privs(128);

    const LETTERS: [(char, Privs); 8] = [
        ('t', Privs::TOPIC),
        ('c', Privs::CHATSEND),
        ('b', Privs::BPM),
        ('k', Privs::KICK),
        ('r', Privs::RESERVE),
        ('m', Privs::ALLOWMULTI),
        ('h', Privs::HIDDEN),
        ('v', Privs::VOTE),
    ];

    pub fn none() -> Privs {
        Privs(0)
    }
    pub fn from_bits(bits: u32) -> Privs {
        Privs(bits)
    }
    pub fn bits(&self) -> u32 {
        self.0
    }
    pub fn has(&self, p: Privs) -> bool {
        self.0 & p.0 == p.0
    }
    pub fn with(self, p: Privs) -> Privs {
        Privs(self.0 | p.0)
    }
    pub fn without(self, p: Privs) -> Privs {
        Privs(self.0 & !p.0)
    }
    /// everything a `*` grants
    pub fn all_but_hidden() -> Privs {
        Privs(0xff & !Privs::HIDDEN.0)
    }
    /// what a named user gets when the config gives no letters
    pub fn default_user() -> Privs {
        Privs::CHATSEND.with(Privs::VOTE)
    }

    /// parse a letter string like "cbt" or "*".  Unknown letters are ignored.
    pub fn from_letters(s: &str) -> Privs {
        let mut p = Privs::none();
        for c in s.chars() {
            if c == '*' {
                p = p.with(Privs::all_but_hidden());
                continue;
            }
            let lc = c.to_ascii_lowercase();
            if let Some((_, bit)) = Privs::LETTERS.iter().find(|(l, _)| *l == lc) {
                p = p.with(*bit);
            }
        }
        p
    }
}

impl fmt::Display for Privs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (l, bit) in Privs::LETTERS.iter() {
            if self.has(*bit) {
                write!(f, "{}", l)?;
            }
        }
        Ok(())
    }
}
