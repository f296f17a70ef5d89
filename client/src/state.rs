//! The client's connection state and its frame driver
//!
//! Like the server, the client core is synchronous: the front end hands it
//! datagrams through [`ClientState::packet_event`], calls
//! [`ClientState::frame`] on a timer, and sends whatever
//! [`ClientState::drain_outgoing`] returns. What the game layer would see
//! comes out of [`ClientState::drain_events`].

use crate::config::{ClientConfig, ConfigError};
use crate::demo::{Demo, DemoError};
use crate::download::{DirectoryPakStore, DownloadError, DownloadState, HttpDownloader, NoHttp, PakStore};
use crate::input::{CommandRing, InputState};
use crate::ping::PingList;
use crate::rcon::RconQueue;
use crate::server_commands::BigConfigstring;
use crate::snapshots::{ClientSnapshot, LevelState, OutPacket};
use crate::timing::ServerClock;
use log::{debug, info, warn};
use shared::message::SNAPFLAG_NOT_ACTIVE;
use shared::netchan::NetChan;
use shared::oob;
use shared::protocol::PACKET_BACKUP;
use shared::reliable::{ReliableError, ReliableReceiver, ReliableSender};
use shared::{InfoMap, NetAddress, ProtocolError};
use thiserror::Error;

/// Connection lifecycle, in the order a session moves through it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnState {
    Disconnected,
    /// Asking the server for a challenge
    Connecting,
    /// Sending `connect` with the challenge
    Challenging,
    /// Channel open, waiting for the gamestate
    Connected,
    Downloading,
    Loading,
    /// Level loaded, waiting for the first snapshot
    Primed,
    Active,
}

/// Anything that ends the session
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    Drop(String),

    #[error(transparent)]
    Reliable(#[from] ReliableError),

    #[error("Illegible server message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Demo(#[from] DemoError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// What the game layer and the console get to see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A server command for the game layer
    ServerCommand(String),
    /// Text the server printed to us
    Print(String),
    Popup(String),
    PubkeyDecrypt(String),
    /// Reply to `getstatus`: serverinfo then one line per player
    Status { from: NetAddress, text: String },
    GamestateLoaded,
    /// First snapshot of the level shown
    Activated,
    /// A new snapshot is current
    Snapshot(i32),
    Disconnected(String),
}

/// A datagram the front end should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: NetAddress,
    pub data: Vec<u8>,
}

/// Host names the front end has to resolve before a command can run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostLookup {
    Connect(String),
    Ping(String),
    RconDestination(String),
}

/// Integer at the start of `text`, 0 if there is none
pub(crate) fn leading_int(text: &str) -> i32 {
    let text = text.trim_start();
    let end = text
        .char_indices()
        .take_while(|&(i, c)| c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')))
        .map(|(i, c)| i + c.len_utf8())
        .last()
        .unwrap_or(0);
    text[..end].parse().unwrap_or(0)
}

pub struct ClientState {
    pub config: ClientConfig,
    pub(crate) state: ConnState,
    pub(crate) netchan: Option<NetChan>,
    pub(crate) server_address: NetAddress,
    pub(crate) connect_time: i32,
    pub(crate) connect_packet_count: i32,
    pub(crate) challenge: String,
    pub(crate) last_packet_time: i32,
    pub(crate) last_packet_sent_time: i32,
    pub(crate) timeout_count: i32,
    /// Time of the event being processed
    pub(crate) realtime: i32,
    pub(crate) last_error: String,
    /// Userinfo keys beyond the ones the config carries
    extra_userinfo: InfoMap,
    userinfo_modified: bool,

    pub(crate) reliable: ReliableSender,
    pub(crate) server_commands: ReliableReceiver,
    pub(crate) last_executed_server_command: i32,
    pub(crate) big_configstring: Option<BigConfigstring>,

    pub(crate) level: LevelState,
    pub(crate) server_id: i32,
    pub(crate) server_paks: Vec<String>,
    pub(crate) downloaded_any: bool,
    pub(crate) snap: ClientSnapshot,
    pub(crate) snapshots: Vec<ClientSnapshot>,
    pub(crate) out_packets: Vec<OutPacket>,
    /// Message number of the last snapshot handed to the game layer
    last_snapshot_shown: i32,
    pub(crate) clock: ServerClock,
    pub(crate) cmds: CommandRing,
    pub(crate) input: InputState,

    pub(crate) download: DownloadState,
    pub(crate) paks: Box<dyn PakStore>,
    pub(crate) http: Box<dyn HttpDownloader>,
    pub(crate) pings: PingList,
    pub(crate) rcon: RconQueue,
    pub(crate) rcon_destination: NetAddress,
    pub(crate) demo: Demo,

    pub(crate) events: Vec<ClientEvent>,
    outbox: Vec<Outgoing>,
}

impl ClientState {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            netchan: None,
            state: ConnState::Disconnected,
            server_address: NetAddress::Bad,
            connect_time: 0,
            connect_packet_count: 0,
            challenge: String::new(),
            last_packet_time: 0,
            last_packet_sent_time: -9999,
            timeout_count: 0,
            realtime: 0,
            last_error: String::new(),
            extra_userinfo: InfoMap::new(),
            userinfo_modified: false,
            reliable: ReliableSender::new(),
            server_commands: ReliableReceiver::new(),
            last_executed_server_command: 0,
            big_configstring: None,
            level: LevelState::default(),
            server_id: 0,
            server_paks: Vec::new(),
            downloaded_any: false,
            snap: ClientSnapshot::default(),
            snapshots: vec![ClientSnapshot::default(); PACKET_BACKUP],
            out_packets: vec![OutPacket::default(); PACKET_BACKUP],
            last_snapshot_shown: 0,
            clock: ServerClock::new(),
            cmds: CommandRing::new(),
            input: InputState::default(),
            download: DownloadState::default(),
            paks: Box::new(DirectoryPakStore::new(config.pak_dir.clone())),
            http: Box::new(NoHttp),
            pings: PingList::new(config.max_ping, config.ping_spacing),
            rcon: RconQueue::default(),
            rcon_destination: NetAddress::Bad,
            demo: Demo::Idle,
            events: Vec::new(),
            outbox: Vec::new(),
            config,
        }
    }

    pub fn with_rcon_queue(mut self, rcon: RconQueue) -> Self {
        self.rcon = rcon;
        self
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn server_address(&self) -> NetAddress {
        self.server_address
    }

    /// Reason the last session ended
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    /// Server time presented to the game layer this frame
    pub fn server_time(&self) -> i32 {
        self.clock.server_time
    }

    pub fn configstring(&self, index: usize) -> &str {
        self.level.configstring(index)
    }

    pub fn client_num(&self) -> i32 {
        self.level.client_num
    }

    pub fn download_state(&self) -> &DownloadState {
        &self.download
    }

    pub fn is_demo_playing(&self) -> bool {
        self.demo.is_playing()
    }

    pub fn is_demo_recording(&self) -> bool {
        self.demo.is_recording()
    }

    /// Datagrams produced since the last call
    pub fn drain_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn send_packet(&mut self, to: NetAddress, data: Vec<u8>) {
        self.outbox.push(Outgoing { to, data });
    }

    pub(crate) fn send_oob(&mut self, to: NetAddress, text: &str) {
        self.send_packet(to, oob::encode(text));
    }

    /// Queues a command for reliable delivery to the server
    pub fn add_reliable_command(&mut self, text: &str) {
        match self.reliable.push(text) {
            Ok(sequence) => debug!("reliable command {}: {}", sequence, text),
            Err(ReliableError::TooLong(len)) => {
                warn!("Client command of {} characters is too long, not sent", len)
            }
            Err(e) => {
                debug!("add_reliable_command: {}", e);
                self.drop_connection("Client command overflow");
            }
        }
    }

    /// Input the next usercmd is built from
    pub fn set_input(&mut self, input: InputState) {
        self.input = input;
    }

    /// Userinfo as the server should see it
    pub fn userinfo(&self) -> InfoMap {
        let mut info = self.config.userinfo();
        for (key, value) in self.extra_userinfo.iter() {
            info.set(key, value);
        }
        info
    }

    /// Changes one userinfo value; the server hears about it next frame
    pub fn set_userinfo_value(&mut self, key: &str, value: &str) {
        match key {
            "name" => self.config.name = value.to_string(),
            "rate" => self.config.rate = leading_int(value),
            "snaps" => self.config.snaps = leading_int(value),
            _ => self.extra_userinfo.set(key, value),
        }
        self.userinfo_modified = true;
    }

    /// Runs one client frame at `now`
    pub fn frame(&mut self, now: i32) {
        self.realtime = now;
        if let Err(e) = self.run_frame() {
            self.drop_connection(&e.to_string());
        }
    }

    fn run_frame(&mut self) -> Result<(), ClientError> {
        self.check_userinfo();
        self.check_timeout();
        self.check_for_resend();
        self.poll_http_download()?;
        self.cgame_frame()?;

        self.create_new_commands();
        if self.ready_to_send_packet() {
            self.write_packet();
        }
        Ok(())
    }

    /// Activation, server time and server command execution for this frame
    fn cgame_frame(&mut self) -> Result<(), ClientError> {
        if self.state == ConnState::Primed {
            if self.demo.is_playing() {
                self.demo_frame()?;
            }
            if self.state != ConnState::Primed
                || !self.clock.new_snapshots
                || self.snap.snap_flags & SNAPFLAG_NOT_ACTIVE != 0
            {
                return Ok(());
            }
            self.clock.first_snapshot(self.snap.server_time, self.realtime);
            self.state = ConnState::Active;
            info!("First snapshot received, client active");
            self.events.push(ClientEvent::Activated);
        }
        if self.state != ConnState::Active {
            return Ok(());
        }

        self.clock.set_cgame_time(
            self.snap.server_time,
            self.realtime,
            self.config.time_nudge(),
            &self.config.time_adjust,
            self.demo.is_playing(),
        )?;
        if self.demo.is_playing() {
            self.demo_frame()?;
            if self.state != ConnState::Active {
                return Ok(());
            }
        }

        if self.snap.message_num != self.last_snapshot_shown {
            self.last_snapshot_shown = self.snap.message_num;
            self.execute_new_server_commands(self.snap.server_command_num)?;
            self.events.push(ClientEvent::Snapshot(self.snap.message_num));
        }
        Ok(())
    }

    /// Forgets everything about the current session
    pub(crate) fn reset_session(&mut self) {
        self.state = ConnState::Disconnected;
        self.netchan = None;
        self.connect_packet_count = 0;
        self.challenge.clear();
        self.timeout_count = 0;
        self.reliable = ReliableSender::new();
        self.server_commands = ReliableReceiver::new();
        self.last_executed_server_command = 0;
        self.server_id = 0;
        self.server_paks.clear();
        self.downloaded_any = false;
        self.download = DownloadState::default();
        self.out_packets = vec![OutPacket::default(); PACKET_BACKUP];
        self.last_snapshot_shown = 0;
        self.cmds = CommandRing::new();
        self.last_packet_sent_time = -9999;
        self.clear_level();
    }

    /// Ends the session because of `reason`
    pub fn drop_connection(&mut self, reason: &str) {
        if self.state == ConnState::Disconnected && !self.demo.is_playing() {
            return;
        }
        info!("Disconnected: {}", reason);
        self.last_error = reason.to_string();
        self.events.push(ClientEvent::Disconnected(reason.to_string()));
        self.disconnect();
    }

    fn check_userinfo(&mut self) {
        if self.state < ConnState::Connected || !self.userinfo_modified || self.demo.is_playing() {
            return;
        }
        self.userinfo_modified = false;
        let userinfo = shared::args::escape(&self.userinfo().to_string());
        self.add_reliable_command(&format!("userinfo {}", userinfo));
    }
}
