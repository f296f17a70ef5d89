//! Server browser pings
//!
//! A ping is a `getinfo <challenge>` sent to a server; the matching
//! `infoResponse` completes it. At most [`MAX_PINGREQUESTS`] pings are in
//! flight. When every slot is taken the one started first is evicted.

use crate::state::ClientState;
use log::{debug, trace};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::protocol::{GAMENAME_FOR_MASTER, MAX_PINGREQUESTS, PROTOCOL_VERSION};
use shared::{InfoMap, NetAddress};

pub const PING_MAX_ATTEMPTS: usize = 3;
const PING_CHALLENGE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    Waiting,
    /// Round trip in milliseconds
    Complete(i32),
    Timeout,
}

#[derive(Debug, Clone)]
struct PingRequest {
    address: NetAddress,
    start: i32,
    /// Round trip once answered
    time: Option<i32>,
    challenge: String,
    info: InfoMap,
}

/// A server listed in the browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub address: NetAddress,
    pub visible: bool,
    pub status: Option<PingStatus>,
    pub attempts: usize,
    pub info: InfoMap,
}

impl ServerEntry {
    pub fn new(address: NetAddress) -> Self {
        Self {
            address,
            visible: true,
            status: None,
            attempts: 0,
            info: InfoMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self.status, Some(PingStatus::Complete(_)))
    }
}

#[derive(Debug)]
pub struct PingList {
    slots: Vec<Option<PingRequest>>,
    max_ping: i32,
    spacing: [i32; PING_MAX_ATTEMPTS],
    last_send_time: Option<i32>,
}

fn ping_challenge() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PING_CHALLENGE_LEN)
        .map(char::from)
        .collect()
}

impl PingList {
    pub fn new(max_ping: i32, spacing: [i32; PING_MAX_ATTEMPTS]) -> Self {
        Self {
            slots: vec![None; MAX_PINGREQUESTS],
            max_ping,
            spacing,
            last_send_time: None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// A free slot, or the slot of the oldest ping
    fn free_slot(&self) -> usize {
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            return free;
        }

        let mut best = 0;
        let mut oldest = i32::MAX;
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(request) = slot {
                if request.start <= oldest {
                    best = i;
                    oldest = request.start;
                }
            }
        }
        match self.slots[best].as_ref().and_then(|r| r.time) {
            Some(_) => debug!("evicting completed ping record"),
            None => debug!("evicting outstanding ping request"),
        }
        best
    }

    /// Starts a ping and returns the slot and the command to send
    pub fn start(&mut self, address: NetAddress, now: i32) -> (usize, String) {
        let slot = self.free_slot();
        let challenge = ping_challenge();
        let command = format!("getinfo {}", challenge);
        self.slots[slot] = Some(PingRequest {
            address,
            start: now,
            time: None,
            challenge,
            info: InfoMap::new(),
        });
        self.last_send_time = Some(now);
        (slot, command)
    }

    pub fn status(&self, slot: usize, now: i32) -> Option<PingStatus> {
        let request = self.slots.get(slot)?.as_ref()?;
        Some(match request.time {
            Some(time) => PingStatus::Complete(time),
            None if now.wrapping_sub(request.start) >= self.max_ping => PingStatus::Timeout,
            None => PingStatus::Waiting,
        })
    }

    pub fn address(&self, slot: usize) -> Option<NetAddress> {
        self.slots.get(slot)?.as_ref().map(|r| r.address)
    }

    /// Completes the ping an `infoResponse` answers, returning its round trip
    pub fn info_response(&mut self, from: &NetAddress, info: &InfoMap, now: i32) -> Option<i32> {
        if info.value_for("protocol").parse::<i32>().ok() != Some(PROTOCOL_VERSION) {
            trace!("Different protocol info packet: {}", info.value_for("protocol"));
            return None;
        }
        if info.value_for("gamename") != GAMENAME_FOR_MASTER {
            trace!("Different game info packet: {}", info.value_for("gamename"));
            return None;
        }

        let request = self
            .slots
            .iter_mut()
            .flatten()
            .find(|r| r.time.is_none() && r.address == *from)?;
        if request.challenge != info.value_for("challenge") {
            debug!("wrong challenge for ping response from {}", from);
            return None;
        }
        let time = now.wrapping_sub(request.start);
        request.time = Some(time);
        request.info = info.clone();
        debug!("ping time {}ms from {}", time, from);
        Some(time)
    }

    /// Frees every slot that is no longer waiting and reports its outcome
    pub fn harvest(&mut self, now: i32) -> Vec<(NetAddress, PingStatus, InfoMap)> {
        let mut done = Vec::new();
        for slot in 0..self.slots.len() {
            match self.status(slot, now) {
                None | Some(PingStatus::Waiting) => {}
                Some(status) => {
                    if let Some(request) = self.slots[slot].take() {
                        done.push((request.address, status, request.info));
                    }
                }
            }
        }
        done
    }

    /// Attempt tier to work on: all first tries before any retry
    fn attempt_num(&self, servers: &[ServerEntry]) -> usize {
        let mut result = servers
            .iter()
            .filter(|s| s.visible && !s.is_complete())
            .map(|s| s.attempts)
            .min()
            .unwrap_or(PING_MAX_ATTEMPTS)
            .min(PING_MAX_ATTEMPTS);
        while result < PING_MAX_ATTEMPTS && self.spacing[result] < 0 {
            result += 1;
        }
        result
    }

    /// Pings the visible servers that still need one, honouring the spacing
    /// of the current attempt tier
    ///
    /// Returns whether pings are outstanding, and the commands to send.
    pub fn update_visible(&mut self, servers: &mut [ServerEntry], now: i32) -> (bool, Vec<(NetAddress, String)>) {
        let mut out = Vec::new();
        for (address, result, info) in self.harvest(now) {
            if let Some(server) = servers.iter_mut().find(|s| s.address == address) {
                server.status = Some(result);
                if !info.is_empty() {
                    server.info = info;
                }
            }
        }

        let mut used = self.in_flight();
        let mut status = used > 0;

        if used < MAX_PINGREQUESTS {
            let attempt = self.attempt_num(servers);
            if attempt >= PING_MAX_ATTEMPTS {
                return (status, out);
            }
            let spacing = self.spacing[attempt];
            if let Some(last) = self.last_send_time {
                if now < last + spacing {
                    return (true, out);
                }
            }

            for server in servers.iter_mut() {
                if !server.visible || server.is_complete() || server.attempts > attempt {
                    continue;
                }
                let queued = self.slots.iter().flatten().any(|r| r.address == server.address);
                if queued {
                    continue;
                }

                status = true;
                let (_, command) = self.start(server.address, now);
                out.push((server.address, command));
                server.attempts = attempt + 1;
                server.status = Some(PingStatus::Waiting);

                used += 1;
                if used >= MAX_PINGREQUESTS || spacing > 0 {
                    break;
                }
            }
        }

        (status || used > 0, out)
    }
}

impl ClientState {
    /// `ping <server>`
    pub fn ping_server(&mut self, address: NetAddress, now: i32) -> usize {
        let (slot, command) = self.pings.start(address, now);
        self.send_oob(address, &command);
        slot
    }

    pub fn ping_status(&self, slot: usize, now: i32) -> Option<PingStatus> {
        self.pings.status(slot, now)
    }

    /// Drives the browser's pings for this frame
    pub fn update_visible_pings(&mut self, servers: &mut [ServerEntry], now: i32) -> bool {
        let (outstanding, packets) = self.pings.update_visible(servers, now);
        for (address, command) in packets {
            self.send_oob(address, &command);
        }
        outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn server(n: u8) -> NetAddress {
        NetAddress::Ip(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, n), 27960))
    }

    fn reply(challenge: &str) -> InfoMap {
        let mut info = InfoMap::new();
        info.set("challenge", challenge);
        info.set("protocol", &PROTOCOL_VERSION.to_string());
        info.set("gamename", GAMENAME_FOR_MASTER);
        info.set("hostname", "test");
        info
    }

    fn challenge_of(command: &str) -> String {
        command.trim_start_matches("getinfo ").to_string()
    }

    #[test]
    fn test_ping_completes_with_matching_challenge() {
        let mut list = PingList::new(800, [5, 50, 125]);
        let (slot, command) = list.start(server(1), 1000);
        assert_eq!(challenge_of(&command).len(), 8);
        assert_eq!(list.status(slot, 1100), Some(PingStatus::Waiting));

        assert_eq!(list.info_response(&server(1), &reply("wrong"), 1040), None);
        assert_eq!(list.info_response(&server(2), &reply(&challenge_of(&command)), 1040), None);

        let mut other_game = reply(&challenge_of(&command));
        other_game.set("gamename", "Quake3");
        assert_eq!(list.info_response(&server(1), &other_game, 1040), None);

        assert_eq!(list.info_response(&server(1), &reply(&challenge_of(&command)), 1042), Some(42));
        assert_eq!(list.status(slot, 5000), Some(PingStatus::Complete(42)));
    }

    #[test]
    fn test_timeout_after_max_ping() {
        let mut list = PingList::new(800, [5, 50, 125]);
        let (slot, _) = list.start(server(1), 1000);
        assert_eq!(list.status(slot, 1799), Some(PingStatus::Waiting));
        assert_eq!(list.status(slot, 1800), Some(PingStatus::Timeout));

        let done = list.harvest(1800);
        assert_eq!(done.len(), 1);
        assert_eq!(list.in_flight(), 0);
    }

    #[test]
    fn test_full_list_evicts_oldest() {
        let mut list = PingList::new(800, [5, 50, 125]);
        for n in 0..MAX_PINGREQUESTS as u8 {
            list.start(server(n), 1000 + i32::from(n));
        }
        let (slot, _) = list.start(server(100), 2000);
        assert_eq!(slot, 0);
        assert_eq!(list.address(0), Some(server(100)));
        assert_eq!(list.in_flight(), MAX_PINGREQUESTS);
    }

    #[test]
    fn test_spacing_limits_sends() {
        let mut list = PingList::new(800, [5, 50, 125]);
        let mut servers: Vec<ServerEntry> = (1..=3).map(|n| ServerEntry::new(server(n))).collect();

        let (_, sent) = list.update_visible(&mut servers, 1000);
        assert_eq!(sent.len(), 1);
        let (pending, sent) = list.update_visible(&mut servers, 1003);
        assert!(pending);
        assert!(sent.is_empty());
        let (_, sent) = list.update_visible(&mut servers, 1005);
        assert_eq!(sent.len(), 1);
        assert_eq!(servers[1].attempts, 1);
    }

    #[test]
    fn test_disabled_retries_finish_after_first_attempt() {
        let mut list = PingList::new(800, [0, -1, -1]);
        let mut servers: Vec<ServerEntry> = (1..=2).map(|n| ServerEntry::new(server(n))).collect();

        // zero spacing sends everything at once
        let (_, sent) = list.update_visible(&mut servers, 1000);
        assert_eq!(sent.len(), 2);

        // both time out; with retries disabled nothing more is sent
        let (pending, sent) = list.update_visible(&mut servers, 2000);
        assert!(sent.is_empty());
        assert!(!pending);
        assert_eq!(servers[0].status, Some(PingStatus::Timeout));
    }
}
