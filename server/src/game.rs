//! Game-logic module seam
//!
//! The engine never looks inside the game. It calls the entry points of
//! [`GameModule`] and the game answers through [`GameServices`], the
//! engine's syscall table. Two implementations exist: [`LocalGame`], a small
//! built-in game linked into the server, and [`VmGame`], which forwards every
//! call over the [`shared::vm`] bridge to a module running behind a channel.
//!
//! Calls made by the game while an entry point runs are collected by
//! [`EngineServices`] as [`GameRequest`]s and applied by the server once the
//! entry point returns. Reads made in the same call observe the game's own
//! earlier writes.
//!
//! On the bridge, syscalls are routed by the major number of their id: game
//! syscalls, common engine services (logging, cvars, console commands) and
//! the command buffer. An in-process module batches its one-way syscalls in
//! a ring shared with the engine and asks the engine to drain it before any
//! call that needs an answer.

use crate::client_manager::{ClientManager, ClientNum};
use log::{warn, Level};
use serde::{Deserialize, Serialize};
use shared::message::{EntityState, PlayerState, UserCmd};
use shared::vm::guest::vm_main;
use shared::vm::command_buffer::DEFAULT_SIZE as COMMAND_BUFFER_SIZE;
use shared::vm::{
    make_id, shared_command_buffer, AbiInfo, Channel, Frame, Major, Message, SharedCommandBuffer,
    SyncMessage, VmError, VmHost,
};
use shared::{Args, InfoMap};
use std::sync::Arc;
use std::time::Duration;

/// First configstring the built-in game uses for per-player info
pub const CS_PLAYERS: usize = 32;

/// First entity number not reserved for players
pub const FIRST_WORLD_ENTITY: u16 = 64;

pub const ET_PLAYER: i32 = 1;
pub const ET_MOVER: i32 = 2;

/// Entities and player states published by the game every frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct World {
    pub entities: Vec<EntityState>,
    /// Indexed by client number
    pub player_states: Vec<PlayerState>,
}

/// Syscalls available to the game
pub trait GameServices {
    fn drop_client(&mut self, num: ClientNum, reason: &str);
    /// `None` sends the command to every client
    fn send_server_command(&mut self, target: Option<ClientNum>, text: &str);
    fn set_configstring(&mut self, index: usize, value: &str);
    fn configstring(&mut self, index: usize) -> String;
    fn set_userinfo(&mut self, num: ClientNum, userinfo: &str);
    fn userinfo(&mut self, num: ClientNum) -> String;
    fn serverinfo(&mut self) -> String;
    fn locate_game_data(&mut self, world: World);
    /// Queues a console command for the next server frame
    fn console_command(&mut self, text: &str);
    /// Value of a serverinfo cvar, empty if unset
    fn cvar(&mut self, name: &str) -> String;
    fn log(&mut self, level: Level, text: &str);
}

/// Entry points of a game
///
/// An `Err` means the module itself failed; the server shuts down rather
/// than keep running with a game in an unknown state.
pub trait GameModule: Send {
    fn init(
        &mut self,
        level_time: i32,
        random_seed: i32,
        restart: bool,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError>;

    fn shutdown(&mut self, restart: bool, services: &mut dyn GameServices) -> Result<(), VmError>;

    /// Returns a reason when the game refuses the client
    fn client_connect(
        &mut self,
        num: ClientNum,
        first_time: bool,
        is_bot: bool,
        services: &mut dyn GameServices,
    ) -> Result<Option<String>, VmError>;

    fn client_begin(&mut self, num: ClientNum, services: &mut dyn GameServices) -> Result<(), VmError>;

    fn client_userinfo_changed(
        &mut self,
        num: ClientNum,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError>;

    fn client_disconnect(&mut self, num: ClientNum, services: &mut dyn GameServices) -> Result<(), VmError>;

    fn client_command(
        &mut self,
        num: ClientNum,
        command: &str,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError>;

    fn client_think(
        &mut self,
        num: ClientNum,
        cmd: &UserCmd,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError>;

    fn run_frame(&mut self, level_time: i32, services: &mut dyn GameServices) -> Result<(), VmError>;
}

/// A write the game made during an entry point
#[derive(Debug, Clone, PartialEq)]
pub enum GameRequest {
    DropClient { num: ClientNum, reason: String },
    SendServerCommand { target: Option<ClientNum>, text: String },
    SetConfigstring { index: usize, value: String },
    SetUserinfo { num: ClientNum, userinfo: String },
    LocateGameData(World),
    ConsoleCommand(String),
}

/// [`GameServices`] over a read-only view of the server
pub struct EngineServices<'a> {
    configstrings: &'a [String],
    clients: &'a ClientManager,
    serverinfo: String,
    requests: Vec<GameRequest>,
}

impl<'a> EngineServices<'a> {
    pub fn new(configstrings: &'a [String], clients: &'a ClientManager, serverinfo: String) -> Self {
        Self {
            configstrings,
            clients,
            serverinfo,
            requests: Vec::new(),
        }
    }

    pub fn into_requests(self) -> Vec<GameRequest> {
        self.requests
    }
}

impl GameServices for EngineServices<'_> {
    fn drop_client(&mut self, num: ClientNum, reason: &str) {
        self.requests.push(GameRequest::DropClient {
            num,
            reason: reason.to_string(),
        });
    }

    fn send_server_command(&mut self, target: Option<ClientNum>, text: &str) {
        self.requests.push(GameRequest::SendServerCommand {
            target,
            text: text.to_string(),
        });
    }

    fn set_configstring(&mut self, index: usize, value: &str) {
        self.requests.push(GameRequest::SetConfigstring {
            index,
            value: value.to_string(),
        });
    }

    fn configstring(&mut self, index: usize) -> String {
        let pending = self.requests.iter().rev().find_map(|r| match r {
            GameRequest::SetConfigstring { index: i, value } if *i == index => Some(value.clone()),
            _ => None,
        });
        pending.unwrap_or_else(|| self.configstrings.get(index).cloned().unwrap_or_default())
    }

    fn set_userinfo(&mut self, num: ClientNum, userinfo: &str) {
        self.requests.push(GameRequest::SetUserinfo {
            num,
            userinfo: userinfo.to_string(),
        });
    }

    fn userinfo(&mut self, num: ClientNum) -> String {
        let pending = self.requests.iter().rev().find_map(|r| match r {
            GameRequest::SetUserinfo { num: n, userinfo } if *n == num => Some(userinfo.clone()),
            _ => None,
        });
        pending.unwrap_or_else(|| {
            self.clients
                .get(num)
                .map(|c| c.userinfo.to_string())
                .unwrap_or_default()
        })
    }

    fn serverinfo(&mut self) -> String {
        self.serverinfo.clone()
    }

    fn locate_game_data(&mut self, world: World) {
        self.requests.push(GameRequest::LocateGameData(world));
    }

    fn console_command(&mut self, text: &str) {
        self.requests.push(GameRequest::ConsoleCommand(text.to_string()));
    }

    fn cvar(&mut self, name: &str) -> String {
        InfoMap::parse(&self.serverinfo).value_for(name).to_string()
    }

    fn log(&mut self, level: Level, text: &str) {
        log::log!(target: "sgame", level, "{}", text);
    }
}

/// Built-in deathmatch-free sandbox game
///
/// Each active client owns a player entity that moves with its usercmds.
/// One mover entity slides back and forth so snapshots always carry a
/// changing non-player entity.
#[derive(Debug, Default)]
pub struct LocalGame {
    level_time: i32,
    players: Vec<Option<PlayerState>>,
    mover: EntityState,
    banned_names: Vec<String>,
}

impl LocalGame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses connections from clients using one of `names`
    pub fn with_banned_names(mut self, names: Vec<String>) -> Self {
        self.banned_names = names;
        self
    }

    fn player_mut(&mut self, num: ClientNum) -> &mut Option<PlayerState> {
        if self.players.len() <= num.0 {
            self.players.resize(num.0 + 1, None);
        }
        &mut self.players[num.0]
    }

    fn client_name(num: ClientNum, services: &mut dyn GameServices) -> String {
        let userinfo = InfoMap::parse(&services.userinfo(num));
        match userinfo.get("name") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => "UnnamedPlayer".to_string(),
        }
    }

    fn publish(&self, services: &mut dyn GameServices) {
        let mut entities: Vec<EntityState> = self
            .players
            .iter()
            .enumerate()
            .filter_map(|(num, ps)| {
                ps.as_ref().map(|ps| EntityState {
                    number: num as u16,
                    entity_type: ET_PLAYER,
                    origin: ps.origin,
                    angles: ps.view_angles,
                    ..Default::default()
                })
            })
            .collect();
        entities.push(self.mover);

        let player_states = self
            .players
            .iter()
            .map(|ps| ps.clone().unwrap_or_default())
            .collect();
        services.locate_game_data(World {
            entities,
            player_states,
        });
    }
}

impl GameModule for LocalGame {
    fn init(
        &mut self,
        level_time: i32,
        _random_seed: i32,
        restart: bool,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError> {
        services.log(
            Level::Debug,
            &format!("Local game init at {} (restart: {})", level_time, restart),
        );
        self.level_time = level_time;
        self.players.clear();
        self.mover = EntityState {
            number: FIRST_WORLD_ENTITY,
            entity_type: ET_MOVER,
            ..Default::default()
        };
        self.publish(services);
        Ok(())
    }

    fn shutdown(&mut self, _restart: bool, _services: &mut dyn GameServices) -> Result<(), VmError> {
        self.players.clear();
        Ok(())
    }

    fn client_connect(
        &mut self,
        num: ClientNum,
        _first_time: bool,
        _is_bot: bool,
        services: &mut dyn GameServices,
    ) -> Result<Option<String>, VmError> {
        let name = Self::client_name(num, services);
        if self.banned_names.iter().any(|b| b.eq_ignore_ascii_case(&name)) {
            return Ok(Some("You are banned from this server.".to_string()));
        }
        self.client_userinfo_changed(num, services)?;
        Ok(None)
    }

    fn client_begin(&mut self, num: ClientNum, services: &mut dyn GameServices) -> Result<(), VmError> {
        *self.player_mut(num) = Some(PlayerState {
            client_num: num.0 as i32,
            command_time: self.level_time,
            ..Default::default()
        });
        let name = Self::client_name(num, services);
        services.send_server_command(None, &format!("print \"{} entered the game\\n\"", name));
        self.publish(services);
        Ok(())
    }

    fn client_userinfo_changed(
        &mut self,
        num: ClientNum,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError> {
        let mut info = InfoMap::new();
        info.set("n", &Self::client_name(num, services));
        services.set_configstring(CS_PLAYERS + num.0, &info.to_string());
        Ok(())
    }

    fn client_disconnect(&mut self, num: ClientNum, services: &mut dyn GameServices) -> Result<(), VmError> {
        *self.player_mut(num) = None;
        services.set_configstring(CS_PLAYERS + num.0, "");
        self.publish(services);
        Ok(())
    }

    fn client_command(
        &mut self,
        num: ClientNum,
        command: &str,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError> {
        let args = Args::parse(command);
        match args.argv(0) {
            "say" => {
                let name = Self::client_name(num, services);
                let text = format!("{}: {}", name, args.concat_args(1));
                services.send_server_command(None, &format!("chat {}", shared::args::escape(&text)));
            }
            "hostname" => {
                let hostname = services.cvar("sv_hostname");
                services.send_server_command(Some(num), &format!("print \"{}\\n\"", hostname));
            }
            other => {
                services.send_server_command(
                    Some(num),
                    &format!("print \"unknown command {}\\n\"", other),
                );
            }
        }
        Ok(())
    }

    fn client_think(
        &mut self,
        num: ClientNum,
        cmd: &UserCmd,
        _services: &mut dyn GameServices,
    ) -> Result<(), VmError> {
        if let Some(ps) = self.player_mut(num).as_mut() {
            ps.velocity = [cmd.forward_move as i32, cmd.right_move as i32, cmd.up_move as i32];
            for axis in 0..3 {
                ps.origin[axis] += ps.velocity[axis];
            }
            ps.view_angles = cmd.angles;
            ps.command_time = cmd.server_time;
        }
        Ok(())
    }

    fn run_frame(&mut self, level_time: i32, services: &mut dyn GameServices) -> Result<(), VmError> {
        self.level_time = level_time;
        // two second back and forth cycle
        let phase = level_time.rem_euclid(2000);
        let offset = if phase < 1000 { phase } else { 2000 - phase };
        self.mover.origin = [offset / 10, 0, 0];
        self.publish(services);
        Ok(())
    }
}

macro_rules! sync_message {
    ($name:ident, $major:ident, $minor:expr, $args:ty, $reply:ty) => {
        pub struct $name;
        impl Message for $name {
            const ID: u32 = make_id(Major::$major, $minor);
            type Args = $args;
        }
        impl SyncMessage for $name {
            type Reply = $reply;
        }
    };
}

macro_rules! async_message {
    ($name:ident, $major:ident, $minor:expr, $args:ty) => {
        pub struct $name;
        impl Message for $name {
            const ID: u32 = make_id(Major::$major, $minor);
            type Args = $args;
        }
    };
}

// engine to module
sync_message!(GameInitMsg, Qvm, 0, (i32, i32, bool), ());
sync_message!(GameShutdownMsg, Qvm, 1, bool, ());
sync_message!(GameClientConnectMsg, Qvm, 2, (i32, bool, bool), Option<String>);
sync_message!(GameClientBeginMsg, Qvm, 3, i32, ());
sync_message!(GameClientUserinfoChangedMsg, Qvm, 4, i32, ());
sync_message!(GameClientDisconnectMsg, Qvm, 5, i32, ());
sync_message!(GameClientCommandMsg, Qvm, 6, (i32, String), ());
sync_message!(GameClientThinkMsg, Qvm, 7, (i32, UserCmd), ());
sync_message!(GameRunFrameMsg, Qvm, 8, i32, ());

// module to engine; a target of -1 means every client
async_message!(DropClientMsg, Qvm, 32, (i32, String));
async_message!(SendServerCommandMsg, Qvm, 33, (i32, String));
async_message!(SetConfigstringMsg, Qvm, 34, (i32, String));
sync_message!(GetConfigstringMsg, Qvm, 35, i32, String);
async_message!(SetUserinfoMsg, Qvm, 36, (i32, String));
sync_message!(GetUserinfoMsg, Qvm, 37, i32, String);
sync_message!(GetServerinfoMsg, Qvm, 38, (), String);
async_message!(LocateGameDataMsg, Qvm, 39, World);

// common services, module to engine
async_message!(LogEventMsg, CommonServices, 0, (u8, String));
sync_message!(GetCvarMsg, CommonServices, 1, String, String);
async_message!(ConsoleCommandMsg, CommonServices, 2, String);

// drains the shared ring; records are one-way messages only
sync_message!(CommandBufferConsumeMsg, CommandBuffer, 0, (), ());

fn wire_num(num: ClientNum) -> i32 {
    num.0 as i32
}

fn from_wire(num: i32) -> Option<ClientNum> {
    usize::try_from(num).ok().map(ClientNum)
}

fn level_to_wire(level: Level) -> u8 {
    level as usize as u8
}

fn level_from_wire(level: u8) -> Level {
    match level {
        1 => Level::Error,
        2 => Level::Warn,
        3 => Level::Info,
        4 => Level::Debug,
        _ => Level::Trace,
    }
}

fn unhandled(frame: &Frame) -> VmError {
    VmError::UnhandledSyscall {
        major: frame.major(),
        minor: frame.minor(),
    }
}

/// Engine side dispatch of one syscall frame, routed by its major number
fn handle_syscall(
    frame: Frame,
    channel: &Channel,
    command_buffer: Option<&SharedCommandBuffer>,
    services: &mut dyn GameServices,
) -> Result<(), VmError> {
    match Major::from_raw(frame.major()) {
        Some(Major::Qvm) => handle_game_syscall(frame, channel, services),
        Some(Major::CommonServices) => handle_common_syscall(frame, channel, services),
        Some(Major::CommandBuffer) => {
            handle_command_buffer_syscall(frame, channel, command_buffer, services)
        }
        None => Err(unhandled(&frame)),
    }
}

fn handle_common_syscall(
    frame: Frame,
    channel: &Channel,
    services: &mut dyn GameServices,
) -> Result<(), VmError> {
    match frame.id {
        LogEventMsg::ID => {
            let (level, text): (u8, String) = frame.decode()?;
            services.log(level_from_wire(level), &text);
        }
        GetCvarMsg::ID => {
            let name: String = frame.decode()?;
            channel.reply::<GetCvarMsg>(&services.cvar(&name))?;
        }
        ConsoleCommandMsg::ID => {
            let text: String = frame.decode()?;
            services.console_command(&text);
        }
        _ => return Err(unhandled(&frame)),
    }
    Ok(())
}

fn handle_command_buffer_syscall(
    frame: Frame,
    channel: &Channel,
    command_buffer: Option<&SharedCommandBuffer>,
    services: &mut dyn GameServices,
) -> Result<(), VmError> {
    if frame.id != CommandBufferConsumeMsg::ID {
        return Err(unhandled(&frame));
    }
    let command_buffer = match command_buffer {
        Some(command_buffer) => command_buffer,
        None => {
            warn!("Module asked to consume a command buffer it never shared");
            return Err(unhandled(&frame));
        }
    };

    let records: Vec<Frame> = {
        let mut ring = command_buffer.lock();
        std::iter::from_fn(|| ring.pop_frame()).collect()
    };
    for record in records {
        match Major::from_raw(record.major()) {
            Some(Major::Qvm) => handle_game_syscall(record, channel, services)?,
            Some(Major::CommonServices) => handle_common_syscall(record, channel, services)?,
            _ => return Err(unhandled(&record)),
        }
    }
    channel.reply::<CommandBufferConsumeMsg>(&())
}

fn handle_game_syscall(
    frame: Frame,
    channel: &Channel,
    services: &mut dyn GameServices,
) -> Result<(), VmError> {
    match frame.id {
        DropClientMsg::ID => {
            let (num, reason): (i32, String) = frame.decode()?;
            match from_wire(num) {
                Some(num) => services.drop_client(num, &reason),
                None => warn!("G_DROP_CLIENT: bad client {}", num),
            }
        }
        SendServerCommandMsg::ID => {
            let (num, text): (i32, String) = frame.decode()?;
            services.send_server_command(from_wire(num), &text);
        }
        SetConfigstringMsg::ID => {
            let (index, value): (i32, String) = frame.decode()?;
            if let Ok(index) = usize::try_from(index) {
                services.set_configstring(index, &value);
            }
        }
        GetConfigstringMsg::ID => {
            let index: i32 = frame.decode()?;
            let value = usize::try_from(index)
                .map(|i| services.configstring(i))
                .unwrap_or_default();
            channel.reply::<GetConfigstringMsg>(&value)?;
        }
        SetUserinfoMsg::ID => {
            let (num, userinfo): (i32, String) = frame.decode()?;
            if let Some(num) = from_wire(num) {
                services.set_userinfo(num, &userinfo);
            }
        }
        GetUserinfoMsg::ID => {
            let num: i32 = frame.decode()?;
            let userinfo = from_wire(num)
                .map(|n| services.userinfo(n))
                .unwrap_or_default();
            channel.reply::<GetUserinfoMsg>(&userinfo)?;
        }
        GetServerinfoMsg::ID => {
            channel.reply::<GetServerinfoMsg>(&services.serverinfo())?;
        }
        LocateGameDataMsg::ID => {
            let world: World = frame.decode()?;
            services.locate_game_data(world);
        }
        _ => return Err(unhandled(&frame)),
    }
    Ok(())
}

/// A game running behind the syscall bridge
pub struct VmGame {
    host: VmHost,
    command_buffer: Option<SharedCommandBuffer>,
}

impl VmGame {
    /// Wraps a module that shares no command buffer with the engine
    pub fn new(host: VmHost) -> Self {
        Self {
            host,
            command_buffer: None,
        }
    }

    /// Runs `game` on its own thread behind a channel
    pub fn spawn_in_process<G>(game: G, timeout: Duration) -> Result<Self, VmError>
    where
        G: GameModule + 'static,
    {
        let command_buffer = shared_command_buffer(COMMAND_BUFFER_SIZE);
        let module_buffer = Arc::clone(&command_buffer);
        let host = VmHost::spawn_in_process("sgame", timeout, move |channel| {
            if let Err(e) = run_game_module(channel, game, Some(module_buffer)) {
                warn!("sgame module stopped: {}", e);
            }
        })?;
        Ok(Self {
            host,
            command_buffer: Some(command_buffer),
        })
    }

    fn call<M: SyncMessage>(
        &self,
        args: &M::Args,
        services: &mut dyn GameServices,
    ) -> Result<M::Reply, VmError> {
        let command_buffer = self.command_buffer.as_ref();
        self.host.send_sync::<M, _>(args, |frame, channel| {
            handle_syscall(frame, channel, command_buffer, &mut *services)
        })
    }
}

impl GameModule for VmGame {
    fn init(
        &mut self,
        level_time: i32,
        random_seed: i32,
        restart: bool,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError> {
        self.call::<GameInitMsg>(&(level_time, random_seed, restart), services)
    }

    fn shutdown(&mut self, restart: bool, services: &mut dyn GameServices) -> Result<(), VmError> {
        self.call::<GameShutdownMsg>(&restart, services)
    }

    fn client_connect(
        &mut self,
        num: ClientNum,
        first_time: bool,
        is_bot: bool,
        services: &mut dyn GameServices,
    ) -> Result<Option<String>, VmError> {
        self.call::<GameClientConnectMsg>(&(wire_num(num), first_time, is_bot), services)
    }

    fn client_begin(&mut self, num: ClientNum, services: &mut dyn GameServices) -> Result<(), VmError> {
        self.call::<GameClientBeginMsg>(&wire_num(num), services)
    }

    fn client_userinfo_changed(
        &mut self,
        num: ClientNum,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError> {
        self.call::<GameClientUserinfoChangedMsg>(&wire_num(num), services)
    }

    fn client_disconnect(&mut self, num: ClientNum, services: &mut dyn GameServices) -> Result<(), VmError> {
        self.call::<GameClientDisconnectMsg>(&wire_num(num), services)
    }

    fn client_command(
        &mut self,
        num: ClientNum,
        command: &str,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError> {
        self.call::<GameClientCommandMsg>(&(wire_num(num), command.to_string()), services)
    }

    fn client_think(
        &mut self,
        num: ClientNum,
        cmd: &UserCmd,
        services: &mut dyn GameServices,
    ) -> Result<(), VmError> {
        self.call::<GameClientThinkMsg>(&(wire_num(num), *cmd), services)
    }

    fn run_frame(&mut self, level_time: i32, services: &mut dyn GameServices) -> Result<(), VmError> {
        self.call::<GameRunFrameMsg>(&level_time, services)
    }
}

/// [`GameServices`] as seen from inside a module: every call is a syscall
struct SyscallServices<'a> {
    channel: &'a Channel,
    command_buffer: Option<&'a SharedCommandBuffer>,
    error: Option<VmError>,
}

impl SyscallServices<'_> {
    fn record(&mut self, result: Result<(), VmError>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    /// Sends a one-way syscall, through the shared ring when there is one
    fn send<M: Message>(&mut self, args: &M::Args) {
        let result = self.try_send::<M>(args);
        self.record(result);
    }

    fn try_send<M: Message>(&mut self, args: &M::Args) -> Result<(), VmError> {
        let command_buffer = match self.command_buffer {
            Some(command_buffer) => command_buffer,
            None => return self.channel.send_msg::<M>(args),
        };
        let frame = Frame::new(M::ID, args)?;
        if command_buffer.lock().push_frame(&frame) {
            return Ok(());
        }
        self.flush()?;
        if command_buffer.lock().push_frame(&frame) {
            Ok(())
        } else {
            // larger than the whole ring
            self.channel.send_frame(frame)
        }
    }

    /// Has the engine drain the ring so it sees every batched call
    fn flush(&mut self) -> Result<(), VmError> {
        let pending = self
            .command_buffer
            .map_or(false, |command_buffer| command_buffer.lock().max_read_len() > 0);
        if !pending {
            return Ok(());
        }
        self.channel
            .send_sync::<CommandBufferConsumeMsg, _>(&(), |frame, _| Err(unhandled(&frame)))
    }

    /// Answers the engine's call once everything batched during it is out
    fn reply<M: SyncMessage>(&mut self, reply: &M::Reply) -> Result<(), VmError> {
        self.flush()?;
        self.channel.reply::<M>(reply)
    }

    fn query<M: SyncMessage<Reply = String>>(&mut self, args: &M::Args) -> String {
        let channel = self.channel;
        let result = self
            .flush()
            .and_then(|_| channel.send_sync::<M, _>(args, |frame, _| Err(unhandled(&frame))));
        match result {
            Ok(value) => value,
            Err(e) => {
                self.error.get_or_insert(e);
                String::new()
            }
        }
    }
}

impl GameServices for SyscallServices<'_> {
    fn drop_client(&mut self, num: ClientNum, reason: &str) {
        self.send::<DropClientMsg>(&(wire_num(num), reason.to_string()));
    }

    fn send_server_command(&mut self, target: Option<ClientNum>, text: &str) {
        let num = target.map_or(-1, wire_num);
        self.send::<SendServerCommandMsg>(&(num, text.to_string()));
    }

    fn set_configstring(&mut self, index: usize, value: &str) {
        self.send::<SetConfigstringMsg>(&(index as i32, value.to_string()));
    }

    fn configstring(&mut self, index: usize) -> String {
        self.query::<GetConfigstringMsg>(&(index as i32))
    }

    fn set_userinfo(&mut self, num: ClientNum, userinfo: &str) {
        self.send::<SetUserinfoMsg>(&(wire_num(num), userinfo.to_string()));
    }

    fn userinfo(&mut self, num: ClientNum) -> String {
        self.query::<GetUserinfoMsg>(&wire_num(num))
    }

    fn serverinfo(&mut self) -> String {
        self.query::<GetServerinfoMsg>(&())
    }

    fn locate_game_data(&mut self, world: World) {
        self.send::<LocateGameDataMsg>(&world);
    }

    fn console_command(&mut self, text: &str) {
        self.send::<ConsoleCommandMsg>(&text.to_string());
    }

    fn cvar(&mut self, name: &str) -> String {
        self.query::<GetCvarMsg>(&name.to_string())
    }

    fn log(&mut self, level: Level, text: &str) {
        self.send::<LogEventMsg>(&(level_to_wire(level), text.to_string()));
    }
}

/// Module entry loop serving `game` over `channel`
///
/// With `command_buffer` the module batches its one-way syscalls in that
/// ring instead of sending each one over the channel.
pub fn run_game_module<G: GameModule>(
    channel: Channel,
    mut game: G,
    command_buffer: Option<SharedCommandBuffer>,
) -> Result<(), VmError> {
    vm_main(channel, AbiInfo::current(), |frame, channel| {
        let mut services = SyscallServices {
            channel,
            command_buffer: command_buffer.as_ref(),
            error: None,
        };
        let outcome = match frame.id {
            GameInitMsg::ID => {
                let (level_time, seed, restart): (i32, i32, bool) = frame.decode()?;
                game.init(level_time, seed, restart, &mut services)?;
                services.reply::<GameInitMsg>(&())
            }
            GameShutdownMsg::ID => {
                let restart: bool = frame.decode()?;
                game.shutdown(restart, &mut services)?;
                services.reply::<GameShutdownMsg>(&())
            }
            GameClientConnectMsg::ID => {
                let (num, first_time, is_bot): (i32, bool, bool) = frame.decode()?;
                let denied = game.client_connect(ClientNum(num.max(0) as usize), first_time, is_bot, &mut services)?;
                services.reply::<GameClientConnectMsg>(&denied)
            }
            GameClientBeginMsg::ID => {
                let num: i32 = frame.decode()?;
                game.client_begin(ClientNum(num.max(0) as usize), &mut services)?;
                services.reply::<GameClientBeginMsg>(&())
            }
            GameClientUserinfoChangedMsg::ID => {
                let num: i32 = frame.decode()?;
                game.client_userinfo_changed(ClientNum(num.max(0) as usize), &mut services)?;
                services.reply::<GameClientUserinfoChangedMsg>(&())
            }
            GameClientDisconnectMsg::ID => {
                let num: i32 = frame.decode()?;
                game.client_disconnect(ClientNum(num.max(0) as usize), &mut services)?;
                services.reply::<GameClientDisconnectMsg>(&())
            }
            GameClientCommandMsg::ID => {
                let (num, command): (i32, String) = frame.decode()?;
                game.client_command(ClientNum(num.max(0) as usize), &command, &mut services)?;
                services.reply::<GameClientCommandMsg>(&())
            }
            GameClientThinkMsg::ID => {
                let (num, cmd): (i32, UserCmd) = frame.decode()?;
                game.client_think(ClientNum(num.max(0) as usize), &cmd, &mut services)?;
                services.reply::<GameClientThinkMsg>(&())
            }
            GameRunFrameMsg::ID => {
                let level_time: i32 = frame.decode()?;
                game.run_frame(level_time, &mut services)?;
                services.reply::<GameRunFrameMsg>(&())
            }
            _ => Err(unhandled(&frame)),
        };
        match services.error {
            Some(e) => Err(e),
            None => outcome,
        }
    })
}
