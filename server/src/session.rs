//! Per-client session handling
//!
//! Everything that happens to a client between the accepted `connect` and
//! the slot going back to `Free`: userinfo, reliable client commands,
//! usermoves, the gamestate handshake, drops and timeouts.

use crate::client_manager::{ClientNum, ClientState};
use crate::config::NetworkScope;
use crate::state::ServerState;
use log::{debug, info, warn};
use shared::args::escape;
use shared::message::{ClientMessage, Gamestate, MoveSet, ReliableCommand, ServerOp, UserCmd};
use shared::{Args, InfoMap};

/// Milliseconds between game commands a flood protected client may send
pub const FLOOD_INTERVAL_MSEC: i32 = 800;
/// Consecutive timed out checks before a client is dropped
const TIMEOUT_CHECKS: i32 = 5;

/// Commands the engine handles itself
const ENGINE_COMMANDS: [&str; 7] = [
    "userinfo",
    "disconnect",
    "download",
    "nextdl",
    "stopdl",
    "donedl",
    "wwwdl",
];

/// Engine commands honoured from a client still on a previous level
fn allowed_after_map_change(command: &str) -> bool {
    command == "disconnect"
}

fn clamp_rate(value: &str) -> i32 {
    if value.is_empty() {
        return 5000;
    }
    leading_int(value).clamp(1000, 90000)
}

/// Integer prefix of `text`, 0 when there is none
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

impl ServerState {
    /// Disconnects a client, telling it and everyone else why
    ///
    /// The slot becomes a zombie so the disconnect can still be
    /// retransmitted; bots go straight back to free.
    pub fn drop_client(&mut self, num: ClientNum, reason: &str) {
        let (is_bot, name, address) = match self.clients.get_mut(num) {
            Some(client) if client.state > ClientState::Zombie => {
                client.state = ClientState::Zombie;
                client.download.reset();
                (client.is_bot, client.name.clone(), client.address())
            }
            _ => return,
        };
        debug!("Going to CS_ZOMBIE for {}", name);

        self.call_game(|game, services| game.client_disconnect(num, services));

        if is_bot {
            if let Some(client) = self.clients.get_mut(num) {
                client.state = ClientState::Free;
            }
        } else {
            info!("{} dropped: {}", name, reason);
            let print = format!("print {}", escape(&format!("{} {}\n", name, reason)));
            self.send_server_command(None, &print);

            let disconnect = format!("disconnect {}", escape(reason));
            let queued = self
                .clients
                .get_mut(num)
                .map_or(false, |client| client.reliable.push(&disconnect).is_ok());
            if queued {
                let now = self.time;
                self.send_client_snapshot(num, now);
            } else {
                self.send_oob(address, "disconnect");
            }
        }

        if let Some(client) = self.clients.get_mut(num) {
            client.userinfo.clear();
        }

        if self.clients.count_at_least(ClientState::Connected) == 0 {
            self.heartbeats.force();
        }
    }

    /// Pulls the engine's view of a client out of its userinfo
    pub(crate) fn userinfo_changed(&mut self, num: ClientNum) {
        let lan_unlimited = self.config.network_scope <= NetworkScope::Lan && self.config.lan_force_rate;
        let fps = self.config.fps;
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        let address = client.address();

        client.name = client.userinfo.value_for("name").to_string();

        client.rate = if address.is_lan() && lan_unlimited {
            99999
        } else {
            clamp_rate(client.userinfo.value_for("rate"))
        };

        let snaps = client.userinfo.value_for("snaps");
        if snaps.is_empty() {
            client.snapshot_msec = 50;
        } else {
            let snapshot_msec = 1000 / leading_int(snaps).clamp(1, fps);
            if snapshot_msec != client.snapshot_msec {
                client.snapshot_msec = snapshot_msec;
                client.next_snapshot_time = -1;
            }
        }

        let ip = if address.is_local() {
            "loopback".to_string()
        } else {
            address.to_string()
        };
        client.userinfo.set("ip", &ip);
    }

    /// `userinfo <info>`
    fn update_userinfo(&mut self, num: ClientNum, args: &Args) {
        if args.argc() < 2 {
            return;
        }
        if let Some(client) = self.clients.get_mut(num) {
            client.userinfo = InfoMap::parse(args.argv(1));
        }
        self.userinfo_changed(num);
        self.call_game(|game, services| game.client_userinfo_changed(num, services));
    }

    /// Runs one client command, either an engine command or one for the game
    ///
    /// `client_ok` is false while the client is flood limited; engine
    /// commands still run then. A client still on a previous level may only
    /// disconnect.
    pub(crate) fn execute_client_command(
        &mut self,
        num: ClientNum,
        text: &str,
        client_ok: bool,
        previous_level: bool,
    ) {
        let args = Args::parse(text);
        if args.argc() == 0 {
            return;
        }
        let command = args.argv(0);
        debug!("Client {} sent command '{}'", num, text);

        if ENGINE_COMMANDS.contains(&command) {
            if previous_level && !allowed_after_map_change(command) {
                debug!("client text ignored for {}: {}", num, command);
                return;
            }
            match command {
                "userinfo" => self.update_userinfo(num, &args),
                "disconnect" => self.drop_client(num, "disconnected"),
                "download" => self.begin_download(num, &args),
                "nextdl" => self.next_download(num, &args),
                "stopdl" => self.stop_download(num),
                "donedl" => self.done_download(num),
                "wwwdl" => self.www_download(num, &args),
                _ => {}
            }
            return;
        }

        let active = self
            .clients
            .get(num)
            .map_or(false, |c| c.state == ClientState::Active);
        if client_ok && active {
            self.call_game(|game, services| game.client_command(num, text, services));
        } else {
            debug!("client text ignored for {}: {}", num, command);
        }
    }

    /// Applies one reliable client command in sequence
    ///
    /// Returns false when the rest of the message must be ignored.
    fn client_command(&mut self, num: ClientNum, command: &ReliableCommand, previous_level: bool) -> bool {
        let flood_protect = self.config.flood_protect;
        let now = self.time;
        let Some(client) = self.clients.get_mut(num) else {
            return false;
        };

        if command.sequence.wrapping_sub(client.last_client_command) <= 0 {
            return true;
        }
        debug!("clientCommand: {} : {} : {}", client.name, command.sequence, command.text);

        if command.sequence.wrapping_sub(client.last_client_command) > 1 {
            info!(
                "Client {} lost {} clientCommands",
                client.name,
                command.sequence.wrapping_sub(client.last_client_command) - 1
            );
            self.drop_client(num, "Lost reliable commands");
            return false;
        }

        let client_ok = !(client.state == ClientState::Active
            && flood_protect
            && now < client.next_reliable_time);
        if now >= client.next_reliable_time {
            client.next_reliable_time = now + FLOOD_INTERVAL_MSEC;
        }

        self.execute_client_command(num, &command.text, client_ok, previous_level);

        if let Some(client) = self.clients.get_mut(num) {
            client.last_client_command = command.sequence;
            client.last_client_command_string = command.text.clone();
        }
        true
    }

    /// Runs the commands of a message in order, stopping when the client drops
    fn client_commands(&mut self, num: ClientNum, commands: &[ReliableCommand], previous_level: bool) -> bool {
        for command in commands {
            if !self.client_command(num, command, previous_level) {
                return false;
            }
            let zombie = self
                .clients
                .get(num)
                .map_or(true, |c| c.state <= ClientState::Zombie);
            if zombie {
                return false;
            }
        }
        true
    }

    /// Processes a decoded channel message from a client
    pub(crate) fn execute_client_message(&mut self, num: ClientNum, message: ClientMessage, now: i32) {
        if message.message_acknowledge < 0 {
            self.drop_client(num, "Illegible client message");
            return;
        }

        let server_id = self.server_id;
        let restarted_server_id = self.restarted_server_id;
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        client.message_acknowledge = message.message_acknowledge;
        if !client.reliable.set_acknowledge(message.reliable_acknowledge) {
            debug!(
                "{}: reliable acknowledge {} out of range",
                client.name, message.reliable_acknowledge
            );
            return;
        }

        let downloading = !client.download.name.is_empty();
        let after_download = client.last_client_command_string.contains("nextdl");
        let gamestate_message_num = client.gamestate_message_num;
        let name = client.name.clone();
        self.acknowledge_frame(num, message.message_acknowledge, now);

        // a message for a previous level: resend the gamestate if it was lost
        if message.server_id != server_id && !downloading && !after_download {
            if message.server_id.wrapping_sub(restarted_server_id) >= 0
                && message.server_id.wrapping_sub(server_id) < 0
            {
                debug!("{}: ignoring pre map_restart / outdated client message", name);
                return;
            }
            if message.message_acknowledge.wrapping_sub(gamestate_message_num) > 0 {
                debug!("{}: sending gamestate", name);
                self.send_client_gamestate(num);
            }
            self.client_commands(num, &message.commands, true);
            return;
        }

        if !self.client_commands(num, &message.commands, false) {
            return;
        }

        if let Some(moves) = message.moves {
            self.user_move(num, moves);
        }
    }

    /// Executes the usercmds of one packet
    fn user_move(&mut self, num: ClientNum, moves: MoveSet) {
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        client.delta_message = if moves.delta { client.message_acknowledge } else { -1 };

        let Some(first) = moves.cmds.first().copied() else {
            debug!("{}: empty usercmd set", client.name);
            return;
        };

        if client.state == ClientState::Primed {
            self.client_enter_world(num, first);
        }

        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        if client.state != ClientState::Active {
            client.delta_message = -1;
            return;
        }

        let newest = moves.cmds[moves.cmds.len() - 1].server_time;
        for cmd in &moves.cmds {
            let last = match self.clients.get(num) {
                Some(client) if client.state == ClientState::Active => client.last_usercmd.server_time,
                _ => return,
            };
            // from before a map_restart, or already executed
            if cmd.server_time > newest || cmd.server_time <= last {
                continue;
            }
            self.client_think(num, cmd);
        }
    }

    /// Runs one usercmd through the game; also used for bots
    pub fn client_think(&mut self, num: ClientNum, cmd: &UserCmd) {
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        client.last_usercmd = *cmd;
        if client.state != ClientState::Active {
            return;
        }
        self.call_game(|game, services| game.client_think(num, cmd, services));
    }

    /// The first usercmd after the gamestate puts the client in the world
    pub(crate) fn client_enter_world(&mut self, num: ClientNum, cmd: UserCmd) {
        let now = self.time;
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        debug!("Going from CS_PRIMED to CS_ACTIVE for {}", client.name);
        client.state = ClientState::Active;
        client.delta_message = -1;
        client.next_snapshot_time = now;
        client.last_usercmd = cmd;

        self.call_game(|game, services| game.client_begin(num, services));
        self.heartbeats.force();
    }

    /// Sends every configstring and baseline so the client can load the level
    pub fn send_client_gamestate(&mut self, num: ClientNum) {
        let now = self.time;
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };
        debug!("Sending gamestate to client: {}", client.name);
        debug!("Going from CS_CONNECTED to CS_PRIMED for {}", client.name);
        client.state = ClientState::Primed;
        // gamestate_message_num tells us when the gamestate was dropped
        client.gamestate_message_num = client.netchan.outgoing_sequence;
        let command_sequence = client.reliable.sequence();

        let configstrings = self
            .configstrings
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.is_empty())
            .map(|(index, value)| (index as u16, value.clone()))
            .collect();
        let gamestate = Gamestate {
            command_sequence,
            configstrings,
            baselines: self.baselines.values().copied().collect(),
            client_num: num.0 as i32,
        };

        let mut ops = self.pending_server_commands(num);
        ops.push(ServerOp::Gamestate(gamestate));
        self.send_message_to_client(num, ops, now);
    }

    /// Frees zombies and drops clients that stopped sending
    pub(crate) fn check_timeouts(&mut self, now: i32) {
        let drop_point = now - self.config.timeout * 1000;
        let zombie_point = now - self.config.zombie_time * 1000;

        let mut timed_out = Vec::new();
        for client in self.clients.iter_mut() {
            // the clock may have been reset
            if client.last_packet_time > now {
                client.last_packet_time = now;
            }

            if client.state == ClientState::Zombie && client.last_packet_time < zombie_point {
                debug!("Going from CS_ZOMBIE to CS_FREE for client {}", client.num);
                client.state = ClientState::Free;
                continue;
            }

            if client.state >= ClientState::Connected && !client.is_bot && client.last_packet_time < drop_point {
                client.timeout_count += 1;
                if client.timeout_count > TIMEOUT_CHECKS {
                    timed_out.push(client.num);
                }
            } else {
                client.timeout_count = 0;
            }
        }

        for num in timed_out {
            self.drop_client(num, "timed out");
            if let Some(client) = self.clients.get_mut(num) {
                // no zombie period for a client that stopped talking
                client.state = ClientState::Free;
            }
        }
    }

    /// Adds a server-side client that never sends packets
    pub fn add_bot(&mut self, name: &str) -> Option<ClientNum> {
        let max = self.clients.max_clients();
        let start = self.config.private_clients.min(max);
        let num = match self.clients.find_free(start..max) {
            Some(num) => num,
            None => {
                warn!("No free slot for bot {}", name);
                return None;
            }
        };

        let now = self.time;
        let client = self.clients.get_mut(num)?;
        client.reset(shared::NetAddress::Bot, 0);
        client.is_bot = true;
        client.state = ClientState::Active;
        client.last_packet_time = now;
        client.userinfo.set("name", name);
        client.name = name.to_string();

        let denied = self.call_game(|game, services| game.client_connect(num, true, true, services))?;
        if let Some(reason) = denied {
            info!("Bot {} denied: {}", name, reason);
            if let Some(client) = self.clients.get_mut(num) {
                client.state = ClientState::Free;
            }
            return None;
        }
        self.call_game(|game, services| game.client_userinfo_changed(num, services));
        self.call_game(|game, services| game.client_begin(num, services));
        info!("Bot {} added as client {}", name, num);
        Some(num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::game::LocalGame;
    use shared::oob;
    use std::net::SocketAddrV4;

    fn server() -> ServerState {
        ServerState::new(ServerConfig::default(), Box::new(LocalGame::new()), 0).unwrap()
    }

    fn remote(port: u16) -> shared::NetAddress {
        shared::NetAddress::Ip(SocketAddrV4::new([203, 0, 113, 7].into(), port))
    }

    fn connected(state: &mut ServerState, slot: usize, name: &str) -> ClientNum {
        let num = ClientNum(slot);
        let client = state.clients.get_mut(num).unwrap();
        client.reset(remote(5000 + slot as u16), slot as u16);
        client.state = ClientState::Connected;
        client.userinfo = InfoMap::parse(&format!("\\name\\{}\\rate\\25000\\snaps\\20", name));
        state.userinfo_changed(num);
        num
    }

    fn command(sequence: i32, text: &str) -> ReliableCommand {
        ReliableCommand {
            sequence,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_leading_int() {
        assert_eq!(leading_int("25000"), 25000);
        assert_eq!(leading_int("  40fps"), 40);
        assert_eq!(leading_int("-3"), -3);
        assert_eq!(leading_int("fast"), 0);
    }

    #[test]
    fn test_userinfo_changed_applies_limits() {
        let mut state = server();
        let num = connected(&mut state, 0, "Ana");
        let client = state.clients.get(num).unwrap();
        assert_eq!(client.name, "Ana");
        assert_eq!(client.rate, 25000);
        assert_eq!(client.snapshot_msec, 50);
        assert_eq!(client.userinfo.get("ip"), Some("203.0.113.7:5000"));

        let client = state.clients.get_mut(num).unwrap();
        client.userinfo = InfoMap::parse("\\name\\Ana\\rate\\10\\snaps\\500");
        state.userinfo_changed(num);
        let client = state.clients.get(num).unwrap();
        assert_eq!(client.rate, 1000);
        assert_eq!(client.snapshot_msec, 25);
        assert_eq!(client.next_snapshot_time, -1);
    }

    #[test]
    fn test_lan_clients_are_not_rate_limited_on_lan_servers() {
        let config = ServerConfig {
            network_scope: NetworkScope::Lan,
            ..Default::default()
        };
        let mut state = ServerState::new(config, Box::new(LocalGame::new()), 0).unwrap();
        let num = ClientNum(0);
        let client = state.clients.get_mut(num).unwrap();
        client.reset(shared::NetAddress::Ip(SocketAddrV4::new([192, 168, 1, 9].into(), 27961)), 1);
        client.state = ClientState::Connected;
        state.userinfo_changed(num);
        assert_eq!(state.clients.get(num).unwrap().rate, 99999);
    }

    #[test]
    fn test_gamestate_then_first_move_activates() {
        let mut state = server();
        let num = connected(&mut state, 1, "Bo");
        state.send_client_gamestate(num);
        assert_eq!(state.clients.get(num).unwrap().state, ClientState::Primed);
        assert_eq!(state.drain_outgoing().len(), 1);

        let message = ClientMessage {
            server_id: state.server_id,
            message_acknowledge: 1,
            reliable_acknowledge: 0,
            commands: vec![],
            moves: Some(MoveSet {
                delta: false,
                cmds: vec![UserCmd {
                    server_time: 1400,
                    forward_move: 10,
                    ..Default::default()
                }],
            }),
        };
        state.execute_client_message(num, message, 100);
        let client = state.clients.get(num).unwrap();
        assert_eq!(client.state, ClientState::Active);
        assert_eq!(client.last_usercmd.server_time, 1400);
    }

    #[test]
    fn test_reliable_commands_run_once_and_gaps_drop() {
        let mut state = server();
        let num = connected(&mut state, 0, "Cy");
        state.clients.get_mut(num).unwrap().state = ClientState::Active;

        assert!(state.client_commands(num, &[command(1, "say hi"), command(1, "say hi")], false));
        assert_eq!(state.clients.get(num).unwrap().last_client_command, 1);

        assert!(!state.client_commands(num, &[command(3, "say skipped")], false));
        assert_eq!(state.clients.get(num).unwrap().state, ClientState::Zombie);
    }

    #[test]
    fn test_flood_protection_blocks_game_commands() {
        let mut state = server();
        let num = connected(&mut state, 0, "Di");
        state.clients.get_mut(num).unwrap().state = ClientState::Active;
        state.time = 1000;

        state.client_commands(num, &[command(1, "say one")], false);
        state.client_commands(num, &[command(2, "say two")], false);
        let chats: Vec<String> = state
            .clients
            .get(num)
            .unwrap()
            .reliable
            .unacknowledged()
            .filter(|(_, text)| text.starts_with("chat"))
            .map(|(_, text)| text.to_string())
            .collect();
        assert_eq!(chats.len(), 1);
        assert!(chats[0].contains("one"));
    }

    #[test]
    fn test_disconnect_command_zombifies_and_notifies() {
        let mut state = server();
        let num = connected(&mut state, 0, "Ed");
        state.clients.get_mut(num).unwrap().state = ClientState::Active;

        state.execute_client_command(num, "disconnect", true, false);
        assert_eq!(state.clients.get(num).unwrap().state, ClientState::Zombie);
        let sent = state.drain_outgoing();
        assert_eq!(sent.len(), 1);
        assert!(!oob::is_oob(&sent[0].data));
        assert!(state.clients.get(num).unwrap().userinfo.is_empty());
    }

    #[test]
    fn test_previous_level_only_allows_disconnect() {
        let mut state = server();
        let num = connected(&mut state, 0, "Fa");
        state.execute_client_command(num, "userinfo \"\\name\\Other\"", true, true);
        assert_eq!(state.clients.get(num).unwrap().name, "Fa");
        state.execute_client_command(num, "disconnect", true, true);
        assert_eq!(state.clients.get(num).unwrap().state, ClientState::Zombie);
    }

    #[test]
    fn test_timeouts_drop_after_repeated_checks() {
        let mut state = server();
        let num = connected(&mut state, 0, "Gu");
        let timeout_ms = state.config.timeout * 1000;

        for i in 0..=TIMEOUT_CHECKS {
            state.check_timeouts(timeout_ms + 1 + i);
        }
        assert_eq!(state.clients.get(num).unwrap().state, ClientState::Free);
    }

    #[test]
    fn test_zombies_are_freed() {
        let mut state = server();
        let num = connected(&mut state, 0, "Hu");
        state.drop_client(num, "kicked");
        assert_eq!(state.clients.get(num).unwrap().state, ClientState::Zombie);
        state.check_timeouts(state.config.zombie_time * 1000 + 1);
        assert_eq!(state.clients.get(num).unwrap().state, ClientState::Free);
    }

    #[test]
    fn test_add_bot() {
        let mut state = server();
        let num = state.add_bot("Sarge").unwrap();
        assert!(state.clients.get(num).unwrap().is_bot);
        assert_eq!(state.clients.bots(), 1);
        state.drop_client(num, "kicked");
        assert_eq!(state.clients.get(num).unwrap().state, ClientState::Free);
    }
}
