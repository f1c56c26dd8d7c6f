//! Challenge/response hashing for logins.
//!
//! Neither side ever sends the password.  The client proves it knows it with
//! `SHA1(SHA1(user ":" pass) + challenge)` and the server does the same sum
//! against its user table.
use openssl::sha::{sha1, Sha1};
use rand::RngCore;

pub const CHALLENGE_SIZE: usize = 8;
pub const PASSHASH_SIZE: usize = 20;

/// the password half of the hash, SHA1(user:pass)
pub fn user_pass_hash(username: &str, password: &str) -> [u8; PASSHASH_SIZE] {
    let mut h = Sha1::new();
    h.update(username.as_bytes());
    h.update(b":");
    h.update(password.as_bytes());
    h.finish()
}

pub fn passhash(
    username: &str,
    password: &str,
    challenge: &[u8; CHALLENGE_SIZE],
) -> [u8; PASSHASH_SIZE] {
    let mut h = Sha1::new();
    h.update(&user_pass_hash(username, password));
    h.update(challenge);
    h.finish()
}

/// first 8 bytes of the SHA1 of some random bytes
pub fn new_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut seed = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut seed);
    let digest = sha1(&seed);
    let mut challenge = [0u8; CHALLENGE_SIZE];
    challenge.copy_from_slice(&digest[..CHALLENGE_SIZE]);
    challenge
}
