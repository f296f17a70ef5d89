//! The server's session state and its frame loop
//!
//! [`ServerState`] is a synchronous core: it never touches a socket or a
//! clock. The front end feeds it datagrams with [`ServerState::packet_event`],
//! calls [`ServerState::frame`] on a timer, and drains the datagrams it wants
//! sent with [`ServerState::drain_outgoing`]. Every entry point takes the
//! current time in milliseconds.

use crate::client_manager::{ClientManager, ClientNum, ClientState};
use crate::config::ServerConfig;
use crate::download::{MemorySource, PakSource};
use crate::drdos::DrdosGuard;
use crate::game::{EngineServices, GameModule, GameRequest, GameServices, World};
use crate::heartbeat::Heartbeats;
use crate::rcon::RconState;
use crate::config::ConfigError;
use log::{debug, error, info, warn};
use rand::Rng;
use shared::args::escape;
use shared::challenge::ChallengeManager;
use shared::cmd::CommandQueue;
use shared::dns::AddressBook;
use shared::message::{EntityState, SNAPFLAG_SERVERCOUNT};
use shared::oob;
use shared::protocol::{
    BIG_CONFIGSTRING_CHUNK, CS_SERVERINFO, CS_SYSTEMINFO, HEARTBEAT_FOR_MASTER,
    INITIAL_SERVER_TIME, MAX_CONFIGSTRINGS,
};
use shared::rcon::RconCipher;
use shared::reliable::{ReliableError, MAX_COMMAND_LEN};
use shared::vm::VmError;
use shared::{InfoMap, NetAddress};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Game frames run while a level loads, before clients see it
const SETTLE_FRAMES: usize = 3;
const SETTLE_FRAME_MSEC: i32 = 100;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("game module failed: {0}")]
    Game(#[from] VmError),
}

/// A datagram the front end should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: NetAddress,
    pub data: Vec<u8>,
}

pub struct ServerState {
    pub config: ServerConfig,
    pub clients: ClientManager,
    pub(crate) challenges: ChallengeManager,
    pub(crate) drdos: DrdosGuard,
    pub(crate) rcon: RconState,
    pub(crate) heartbeats: Heartbeats,
    pub(crate) paks: Box<dyn PakSource>,
    pub(crate) commands: Arc<CommandQueue>,
    game: Box<dyn GameModule>,
    game_error: Option<VmError>,

    pub configstrings: Vec<String>,
    pub(crate) baselines: BTreeMap<u16, EntityState>,
    pub world: World,
    pub server_id: i32,
    /// Server id before the last map restart
    pub(crate) restarted_server_id: i32,
    pub level_time: i32,
    pub(crate) snap_flag_server_bit: i32,
    /// Time of the event being processed
    pub(crate) time: i32,
    next_frame_time: i32,
    /// Set while a level loads; configstring changes are not broadcast
    loading: bool,
    running: bool,

    outbox: Vec<Outgoing>,
}

impl ServerState {
    /// Validates `config` and loads its map
    pub fn new(config: ServerConfig, game: Box<dyn GameModule>, now: i32) -> Result<Self, ServerError> {
        config.validate()?;
        let mut state = Self {
            clients: ClientManager::new(config.max_clients),
            challenges: ChallengeManager::default(),
            drdos: DrdosGuard::new(),
            rcon: RconState::new(),
            heartbeats: Heartbeats::new(),
            paks: Box::new(MemorySource::new()),
            commands: Arc::new(CommandQueue::new()),
            game,
            game_error: None,
            configstrings: vec![String::new(); MAX_CONFIGSTRINGS],
            baselines: BTreeMap::new(),
            world: World::default(),
            server_id: 0,
            restarted_server_id: 0,
            level_time: INITIAL_SERVER_TIME,
            snap_flag_server_bit: 0,
            time: now,
            next_frame_time: now,
            loading: false,
            running: false,
            outbox: Vec::new(),
            config,
        };
        let map = state.config.map_name.clone();
        state.spawn_server(&map, now)?;
        Ok(state)
    }

    pub fn with_paks(mut self, paks: Box<dyn PakSource>) -> Self {
        self.paks = paks;
        self
    }

    pub fn with_rcon_cipher(mut self, cipher: Box<dyn RconCipher>) -> Self {
        self.rcon = RconState::with_cipher(cipher);
        self
    }

    /// Resolver for master server names; without one no heartbeats are sent
    pub fn with_address_book(mut self, book: AddressBook) -> Self {
        self.heartbeats = Heartbeats::with_address_book(book);
        self
    }

    /// Queue for console commands typed at the server
    pub fn commands(&self) -> Arc<CommandQueue> {
        Arc::clone(&self.commands)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Datagrams produced since the last call
    pub fn drain_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn send_packet(&mut self, to: NetAddress, data: Vec<u8>) {
        self.outbox.push(Outgoing { to, data });
    }

    pub(crate) fn send_oob(&mut self, to: NetAddress, text: &str) {
        self.send_packet(to, oob::encode(text));
    }

    fn game_failed(&self) -> Result<(), ServerError> {
        match &self.game_error {
            Some(e) => Err(ServerError::Game(e.clone())),
            None => Ok(()),
        }
    }

    /// Runs one game entry point and applies the requests it made
    ///
    /// Returns `None` if the game failed, now or earlier.
    pub(crate) fn call_game<R, F>(&mut self, call: F) -> Option<R>
    where
        F: FnOnce(&mut dyn GameModule, &mut dyn GameServices) -> Result<R, VmError>,
    {
        if self.game_error.is_some() {
            return None;
        }
        let serverinfo = self.configstrings[CS_SERVERINFO].clone();
        let mut services = EngineServices::new(&self.configstrings, &self.clients, serverinfo);
        let result = call(self.game.as_mut(), &mut services);
        let requests = services.into_requests();
        self.apply_game_requests(requests);

        match result {
            Ok(value) => Some(value),
            Err(e) => {
                error!("Game module error: {}", e);
                self.game_error = Some(e);
                None
            }
        }
    }

    fn apply_game_requests(&mut self, requests: Vec<GameRequest>) {
        for request in requests {
            match request {
                GameRequest::DropClient { num, reason } => self.drop_client(num, &reason),
                GameRequest::SendServerCommand { target, text } => {
                    self.send_server_command(target, &text)
                }
                GameRequest::SetConfigstring { index, value } => self.set_configstring(index, &value),
                GameRequest::SetUserinfo { num, userinfo } => self.set_userinfo(num, &userinfo),
                GameRequest::LocateGameData(world) => self.world = world,
                GameRequest::ConsoleCommand(text) => self.commands.push(text),
            }
        }
    }

    pub fn configstring(&self, index: usize) -> &str {
        self.configstrings.get(index).map_or("", String::as_str)
    }

    /// Changes a configstring and sends it to every primed client
    pub fn set_configstring(&mut self, index: usize, value: &str) {
        if index >= MAX_CONFIGSTRINGS {
            warn!("set_configstring: bad index {}", index);
            return;
        }
        if self.configstrings[index] == value {
            return;
        }
        self.configstrings[index] = value.to_string();

        if self.loading {
            return;
        }
        for num in self.clients.nums_at_least(ClientState::Primed) {
            self.send_configstring(num, index);
        }
    }

    /// Queues `cs` for short values, `bcs0`/`bcs1`/`bcs2` chunks for long ones
    fn send_configstring(&mut self, num: ClientNum, index: usize) {
        let value = self.configstrings[index].clone();
        if value.len() < BIG_CONFIGSTRING_CHUNK {
            self.send_server_command(Some(num), &format!("cs {} {}", index, escape(&value)));
            return;
        }

        let chunks = split_chunks(&value, BIG_CONFIGSTRING_CHUNK);
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let command = match i {
                0 => "bcs0",
                i if i == last => "bcs2",
                _ => "bcs1",
            };
            self.send_server_command(
                Some(num),
                &format!("{} {} {}", command, index, escape(chunk)),
            );
        }
    }

    /// Queues a reliable command for one client or, with `None`, for every
    /// primed client
    pub fn send_server_command(&mut self, target: Option<ClientNum>, text: &str) {
        if text.len() > MAX_COMMAND_LEN {
            warn!("send_server_command: command too long ({} bytes): {}", text.len(), text);
            return;
        }

        match target {
            Some(num) => self.add_server_command(num, text),
            None => {
                if let Some(print) = text.strip_prefix("print ") {
                    info!("broadcast: {}", print.trim_end());
                }
                for num in self.clients.nums_at_least(ClientState::Primed) {
                    self.add_server_command(num, text);
                }
            }
        }
    }

    /// Adds a command to a client's reliable ring, dropping the client when
    /// the ring would lose an unacknowledged command
    pub(crate) fn add_server_command(&mut self, num: ClientNum, text: &str) {
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        if client.is_bot {
            return;
        }
        match client.reliable.push(text) {
            Ok(_) => {}
            Err(ReliableError::Overflow { sequence, acknowledge }) => {
                info!(
                    "{}: reliable command overflow (sequence {}, acknowledged {})",
                    client.name, sequence, acknowledge
                );
                debug!("===== pending server commands =====");
                for (sequence, text) in client.reliable.unacknowledged() {
                    debug!("cmd {}: {}", sequence, text);
                }
                self.drop_client(num, "Client command overflow");
            }
            Err(e) => warn!("{}: {}", client.name, e),
        }
    }

    /// Replaces a client's userinfo
    pub(crate) fn set_userinfo(&mut self, num: ClientNum, userinfo: &str) {
        if let Some(client) = self.clients.get_mut(num) {
            client.userinfo = InfoMap::parse(userinfo);
            client.name = client.userinfo.value_for("name").to_string();
        }
    }

    fn systeminfo(&self) -> String {
        let mut info = InfoMap::new();
        info.set("sv_serverid", &self.server_id.to_string());
        info.set("sv_fps", &self.config.fps.to_string());
        info.set("sv_paks", &self.config.required_paks.join(" "));
        info.to_string()
    }

    fn next_server_id(&self, now: i32) -> i32 {
        now.max(self.server_id.wrapping_add(1))
    }

    /// Loads a level: restarts the game, rebuilds configstrings and
    /// baselines, and sends connected clients back through the gamestate
    pub fn spawn_server(&mut self, map: &str, now: i32) -> Result<(), ServerError> {
        info!("------ Server Initialization ------");
        info!("Server: {}", map);

        if self.running {
            self.call_game(|game, services| game.shutdown(false, services));
        }
        self.loading = true;
        self.time = now;
        self.config.map_name = map.to_string();
        self.configstrings = vec![String::new(); MAX_CONFIGSTRINGS];
        self.baselines.clear();
        self.world = World::default();
        self.server_id = self.next_server_id(now);
        self.restarted_server_id = self.server_id;
        self.snap_flag_server_bit ^= SNAPFLAG_SERVERCOUNT;
        self.level_time = INITIAL_SERVER_TIME;

        let serverinfo = self.config.serverinfo().to_string();
        self.set_configstring(CS_SERVERINFO, &serverinfo);
        let systeminfo = self.systeminfo();
        self.set_configstring(CS_SYSTEMINFO, &systeminfo);

        let seed: i32 = rand::thread_rng().gen();
        let level_time = self.level_time;
        self.call_game(|game, services| game.init(level_time, seed, false, services));
        self.settle_frames();
        self.create_baselines();

        for num in self.clients.nums_at_least(ClientState::Connected) {
            let is_bot = self.clients.get(num).map_or(false, |c| c.is_bot);
            let denied = self.call_game(|game, services| game.client_connect(num, false, is_bot, services));
            match denied {
                Some(Some(reason)) => self.drop_client(num, &reason),
                Some(None) => {
                    if let Some(client) = self.clients.get_mut(num) {
                        if is_bot {
                            client.state = ClientState::Active;
                        } else {
                            // the next packet carries the old server id, which
                            // triggers a fresh gamestate
                            client.state = ClientState::Connected;
                        }
                    }
                    if is_bot {
                        self.call_game(|game, services| game.client_begin(num, services));
                    }
                }
                None => {}
            }
        }

        self.loading = false;
        self.running = true;
        self.next_frame_time = now;
        self.heartbeats.force();
        info!("-----------------------------------");
        self.game_failed()
    }

    fn settle_frames(&mut self) {
        for _ in 0..SETTLE_FRAMES {
            let level_time = self.level_time;
            self.call_game(|game, services| game.run_frame(level_time, services));
            self.level_time += SETTLE_FRAME_MSEC;
        }
    }

    /// Restarts the game on the current level without reloading it
    pub fn map_restart(&mut self, now: i32) -> Result<(), ServerError> {
        info!("Restarting map {}", self.config.map_name);
        self.time = now;
        self.restarted_server_id = self.server_id;
        self.server_id = self.next_server_id(now);
        let systeminfo = self.systeminfo();
        self.set_configstring(CS_SYSTEMINFO, &systeminfo);
        self.snap_flag_server_bit ^= SNAPFLAG_SERVERCOUNT;

        self.loading = true;
        let seed: i32 = rand::thread_rng().gen();
        let level_time = self.level_time;
        self.call_game(|game, services| game.shutdown(true, services));
        self.call_game(|game, services| game.init(level_time, seed, true, services));
        self.settle_frames();
        self.loading = false;

        for num in self.clients.nums_at_least(ClientState::Connected) {
            let (is_bot, was_active) = match self.clients.get(num) {
                Some(client) => (client.is_bot, client.state == ClientState::Active),
                None => continue,
            };
            self.add_server_command(num, "map_restart");

            let denied = self.call_game(|game, services| game.client_connect(num, false, is_bot, services));
            match denied {
                Some(Some(reason)) => self.drop_client(num, &reason),
                Some(None) if was_active => {
                    if let Some(client) = self.clients.get_mut(num) {
                        client.delta_message = -1;
                        client.next_snapshot_time = now;
                    }
                    self.call_game(|game, services| game.client_begin(num, services));
                }
                _ => {}
            }
        }

        self.next_frame_time = now;
        self.game_failed()
    }

    /// Runs due game frames, checks timeouts and sends client messages
    ///
    /// Returns an error once the game module has failed; the server must
    /// then be shut down.
    pub fn frame(&mut self, now: i32) -> Result<(), ServerError> {
        self.game_failed()?;
        self.time = now;

        self.execute_console_commands(now);

        let frame_msec = self.config.frame_msec();
        if now.wrapping_sub(self.next_frame_time) > frame_msec * 10 {
            debug!("Hitch warning: skipping {} msec", now.wrapping_sub(self.next_frame_time));
            self.next_frame_time = now;
        }
        while now.wrapping_sub(self.next_frame_time) >= 0 {
            self.level_time += frame_msec;
            let level_time = self.level_time;
            self.call_game(|game, services| game.run_frame(level_time, services));
            self.next_frame_time = self.next_frame_time.wrapping_add(frame_msec);
        }

        self.check_timeouts(now);
        self.send_client_messages(now);
        self.master_heartbeat(HEARTBEAT_FOR_MASTER, now);

        self.game_failed()
    }

    /// Tells every client the server is going away and stops the game
    pub fn shutdown(&mut self, reason: &str, now: i32) {
        if !self.running {
            return;
        }
        info!("----- Server Shutdown ({}) -----", reason);
        self.time = now;

        let print = format!("print {}", escape(&format!("{}\n", reason)));
        let disconnect = format!("disconnect {}", escape(reason));
        for num in self.clients.nums_at_least(ClientState::Connected) {
            self.add_server_command(num, &print);
            self.add_server_command(num, &disconnect);
            // twice, in case the first is lost; the snapshot makes the
            // client execute the commands
            for _ in 0..2 {
                self.send_client_snapshot(num, now);
            }
        }

        self.master_shutdown(now);
        self.call_game(|game, services| game.shutdown(false, services));

        for client in self.clients.iter_mut() {
            client.download.close();
            client.state = ClientState::Free;
        }
        self.challenges.clear();
        self.running = false;
        info!("---------------------------");
    }
}

/// Splits `text` into pieces of at most `max` bytes on char boundaries
pub(crate) fn split_chunks(text: &str, max: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max {
        let mut end = max;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}
