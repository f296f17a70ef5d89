//! Client slot arena
//!
//! The server owns a fixed number of client slots. A slot's index is the
//! client number the game module and the wire protocol use, wrapped here in
//! the [`ClientNum`] handle. Slots are never removed, only cycled through
//! the connection states:
//!
//! `Free -> Connected -> Primed -> Active -> Zombie -> Free`
//!
//! The derived ordering of [`ClientState`] follows that lifecycle except for
//! `Zombie`, which sorts just above `Free`, so "at least primed" checks are
//! plain comparisons.

use crate::download::Download;
use crate::snapshot::ClientFrame;
use shared::message::UserCmd;
use shared::netchan::{NetChan, NetSource};
use shared::protocol::PACKET_BACKUP;
use shared::reliable::ReliableSender;
use shared::{InfoMap, NetAddress};
use std::fmt;

/// Index of a client slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientNum(pub usize);

impl fmt::Display for ClientNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    /// Slot can be reused
    Free,
    /// Dropped; kept briefly so the final messages can go out
    Zombie,
    /// Handshake accepted, gamestate not yet sent
    Connected,
    /// Gamestate sent, waiting for the first usercmd
    Primed,
    /// In the world
    Active,
}

/// One client slot
#[derive(Debug)]
pub struct Client {
    pub num: ClientNum,
    pub state: ClientState,
    pub name: String,
    pub userinfo: InfoMap,
    pub netchan: NetChan,
    pub is_bot: bool,

    /// Server commands queued for this client
    pub reliable: ReliableSender,
    /// Last client command executed
    pub last_client_command: i32,
    pub last_client_command_string: String,
    /// Earliest time the next game command is accepted when flood protected
    pub next_reliable_time: i32,

    pub last_usercmd: UserCmd,
    /// Last server packet the client acknowledged
    pub message_acknowledge: i32,
    /// Frame to delta the next snapshot from; -1 for none
    pub delta_message: i32,
    /// Channel sequence the last gamestate went out with
    pub gamestate_message_num: i32,

    pub last_packet_time: i32,
    pub last_connect_time: i32,
    pub next_snapshot_time: i32,
    pub timeout_count: i32,
    pub ping: i32,

    /// Bytes per second the client accepts
    pub rate: i32,
    pub snapshot_msec: i32,
    pub rate_delayed: bool,

    pub frames: Vec<ClientFrame>,
    pub download: Download,
}

impl Client {
    pub fn new(num: ClientNum) -> Self {
        Self {
            num,
            state: ClientState::Free,
            name: String::new(),
            userinfo: InfoMap::new(),
            netchan: NetChan::new(NetSource::Server, NetAddress::Bad, 0),
            is_bot: false,
            reliable: ReliableSender::new(),
            last_client_command: 0,
            last_client_command_string: String::new(),
            next_reliable_time: 0,
            last_usercmd: UserCmd::default(),
            message_acknowledge: 0,
            delta_message: -1,
            gamestate_message_num: -1,
            last_packet_time: 0,
            last_connect_time: 0,
            next_snapshot_time: 0,
            timeout_count: 0,
            ping: 0,
            rate: 0,
            snapshot_msec: 50,
            rate_delayed: false,
            frames: vec![ClientFrame::default(); PACKET_BACKUP],
            download: Download::default(),
        }
    }

    /// Resets every field for a fresh connection, keeping the slot number
    pub fn reset(&mut self, address: NetAddress, qport: u16) {
        *self = Client::new(self.num);
        self.netchan = NetChan::new(NetSource::Server, address, qport);
    }

    pub fn address(&self) -> NetAddress {
        self.netchan.remote
    }

    pub fn is_free(&self) -> bool {
        self.state == ClientState::Free
    }

    /// Slot is occupied by a live connection
    pub fn is_connected(&self) -> bool {
        self.state >= ClientState::Connected
    }
}

/// Fixed pool of client slots
#[derive(Debug)]
pub struct ClientManager {
    slots: Vec<Client>,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            slots: (0..max_clients).map(|i| Client::new(ClientNum(i))).collect(),
        }
    }

    pub fn max_clients(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, num: ClientNum) -> Option<&Client> {
        self.slots.get(num.0)
    }

    pub fn get_mut(&mut self, num: ClientNum) -> Option<&mut Client> {
        self.slots.get_mut(num.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        self.slots.iter_mut()
    }

    /// Numbers of the slots in at least `state`
    pub fn nums_at_least(&self, state: ClientState) -> Vec<ClientNum> {
        self.slots
            .iter()
            .filter(|c| c.state >= state)
            .map(|c| c.num)
            .collect()
    }

    /// Live connection for a channel packet from `address` with `qport`
    ///
    /// Matches on the host address and the qport so a client whose NAT
    /// changed its source port is still recognised.
    pub fn find_by_channel(&self, address: &NetAddress, qport: u16) -> Option<ClientNum> {
        self.slots
            .iter()
            .find(|c| {
                !c.is_free()
                    && !c.is_bot
                    && c.netchan.qport == qport
                    && c.address().compare_base(address)
            })
            .map(|c| c.num)
    }

    /// Existing connection from the same client, for reconnect handling
    pub fn find_reconnect(&self, address: &NetAddress, qport: u16) -> Option<ClientNum> {
        self.slots
            .iter()
            .find(|c| {
                !c.is_free()
                    && !c.is_bot
                    && c.address().compare_base(address)
                    && (c.netchan.qport == qport || c.address().port() == address.port())
            })
            .map(|c| c.num)
    }

    /// First free slot in `range`
    pub fn find_free(&self, range: std::ops::Range<usize>) -> Option<ClientNum> {
        self.slots
            .get(range)
            .and_then(|slots| slots.iter().find(|c| c.is_free()))
            .map(|c| c.num)
    }

    pub fn count_at_least(&self, state: ClientState) -> usize {
        self.slots.iter().filter(|c| c.state >= state).count()
    }

    /// Connected humans
    pub fn humans(&self) -> usize {
        self.slots
            .iter()
            .filter(|c| c.is_connected() && !c.is_bot)
            .count()
    }

    pub fn bots(&self) -> usize {
        self.slots
            .iter()
            .filter(|c| c.is_connected() && c.is_bot)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    fn addr(port: u16) -> NetAddress {
        NetAddress::Ip(SocketAddrV4::new([198, 51, 100, 20].into(), port))
    }

    #[test]
    fn test_state_ordering() {
        assert!(ClientState::Active > ClientState::Primed);
        assert!(ClientState::Primed > ClientState::Connected);
        assert!(ClientState::Connected > ClientState::Zombie);
        assert!(ClientState::Zombie > ClientState::Free);
    }

    #[test]
    fn test_find_by_channel_tolerates_port_change() {
        let mut manager = ClientManager::new(4);
        let client = manager.get_mut(ClientNum(2)).unwrap();
        client.reset(addr(5000), 777);
        client.state = ClientState::Active;

        assert_eq!(manager.find_by_channel(&addr(6000), 777), Some(ClientNum(2)));
        assert_eq!(manager.find_by_channel(&addr(5000), 778), None);
    }

    #[test]
    fn test_find_reconnect_matches_qport_or_port() {
        let mut manager = ClientManager::new(2);
        let client = manager.get_mut(ClientNum(0)).unwrap();
        client.reset(addr(5000), 10);
        client.state = ClientState::Connected;

        assert_eq!(manager.find_reconnect(&addr(5000), 99), Some(ClientNum(0)));
        assert_eq!(manager.find_reconnect(&addr(5001), 10), Some(ClientNum(0)));
        assert_eq!(manager.find_reconnect(&addr(5001), 11), None);
    }

    #[test]
    fn test_free_slot_search_and_counts() {
        let mut manager = ClientManager::new(3);
        manager.get_mut(ClientNum(0)).unwrap().state = ClientState::Active;
        let bot = manager.get_mut(ClientNum(1)).unwrap();
        bot.state = ClientState::Active;
        bot.is_bot = true;

        assert_eq!(manager.find_free(0..3), Some(ClientNum(2)));
        assert_eq!(manager.find_free(0..2), None);
        assert_eq!(manager.find_free(5..9), None);
        assert_eq!(manager.humans(), 1);
        assert_eq!(manager.bots(), 1);
        assert_eq!(manager.count_at_least(ClientState::Primed), 2);
    }
}
