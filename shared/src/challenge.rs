//! Short-lived anti-spoofing tokens
//!
//! A peer must echo a token it received at its own address before the server
//! honours a connect or a challenge-mode rcon request. This proves the peer
//! can receive packets at the address it claims, which rules out spoofed
//! source addresses.

use crate::address::NetAddress;
use crate::protocol::CHALLENGE_TIMEOUT_MSEC;
use log::debug;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;

pub const CHALLENGE_LEN: usize = 16;
/// Live challenges kept at once; the oldest is evicted beyond this
pub const MAX_CHALLENGES: usize = 1024;

#[derive(Debug, Clone)]
struct Challenge {
    token: String,
    created: i32,
}

#[derive(Debug)]
pub struct ChallengeManager {
    challenges: HashMap<NetAddress, Challenge>,
    timeout: i32,
}

impl Default for ChallengeManager {
    fn default() -> Self {
        Self::new(CHALLENGE_TIMEOUT_MSEC)
    }
}

impl ChallengeManager {
    pub fn new(timeout: i32) -> Self {
        Self {
            challenges: HashMap::new(),
            timeout,
        }
    }

    /// Validity window in milliseconds
    pub fn timeout(&self) -> i32 {
        self.timeout
    }

    fn is_fresh(&self, challenge: &Challenge, now: i32) -> bool {
        now.wrapping_sub(challenge.created) <= self.timeout
    }

    /// Returns the live token for `address`, creating one if needed
    pub fn generate(&mut self, address: &NetAddress, now: i32) -> String {
        if let Some(existing) = self.challenges.get(address) {
            if self.is_fresh(existing, now) {
                return existing.token.clone();
            }
        }
        if self.challenges.len() >= MAX_CHALLENGES && !self.challenges.contains_key(address) {
            self.evict_oldest();
        }

        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CHALLENGE_LEN)
            .map(char::from)
            .collect();
        debug!("Challenge for {} issued", address);
        self.challenges.insert(
            *address,
            Challenge {
                token: token.clone(),
                created: now,
            },
        );
        token
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .challenges
            .iter()
            .min_by_key(|(_, c)| c.created)
            .map(|(address, _)| *address);
        if let Some(address) = oldest {
            debug!("Challenge table full, dropping the one for {}", address);
            self.challenges.remove(&address);
        }
    }

    /// Checks `token` against the live challenge for `address`
    ///
    /// On success returns the milliseconds since the challenge was issued,
    /// which doubles as a round-trip estimate.
    pub fn matches(&self, address: &NetAddress, token: &str, now: i32) -> Option<i32> {
        let challenge = self.challenges.get(address)?;
        if challenge.token != token || !self.is_fresh(challenge, now) {
            return None;
        }
        Some(now.wrapping_sub(challenge.created))
    }

    /// Like [`matches`](Self::matches) but consumes the challenge on success
    pub fn consume(&mut self, address: &NetAddress, token: &str, now: i32) -> Option<i32> {
        let ping = self.matches(address, token, now)?;
        self.challenges.remove(address);
        Some(ping)
    }

    pub fn clear(&mut self) {
        self.challenges.clear();
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}
