//! Incoming datagram dispatch
//!
//! Out-of-band packets carry one text command line: status queries,
//! challenges, connects and rcon. Everything else is a channel packet that
//! belongs to a connected client, identified by host address and qport.

use crate::client_manager::{ClientNum, ClientState};
use crate::config::{NetworkScope, ServerPrivate};
use crate::session::leading_int;
use crate::state::ServerState;
use log::{debug, info};
use shared::message::ClientMessage;
use shared::netchan::read_qport;
use shared::oob::{self, Datagram};
use shared::protocol::{ENGINE_VERSION, GAMENAME_FOR_MASTER, PROTOCOL_VERSION};
use shared::vm::SYSCALL_ABI_VERSION;
use shared::{Args, InfoMap, NetAddress};

impl ServerState {
    /// Whether the configured network scope lets `address` talk to us
    pub fn is_allowed_network(&self, address: &NetAddress) -> bool {
        match self.config.network_scope {
            NetworkScope::Loopback => address.is_local(),
            NetworkScope::Lan => address.is_lan(),
            NetworkScope::Internet => true,
        }
    }

    /// Handles one datagram received at `now`
    pub fn packet_event(&mut self, from: NetAddress, data: &[u8], now: i32) {
        if !self.is_allowed_network(&from) {
            return;
        }
        self.time = now;

        match oob::classify(data) {
            Datagram::OutOfBand(text) => self.connectionless_packet(from, &text, now),
            Datagram::Sequenced(packet) => self.channel_packet(from, packet, now),
        }
    }

    fn connectionless_packet(&mut self, from: NetAddress, text: &str, now: i32) {
        let args = Args::parse(text);
        if args.argc() == 0 {
            return;
        }
        let command = args.argv(0).to_ascii_lowercase();
        debug!("SV packet {} : {}", from, command);

        match command.as_str() {
            "getstatus" => {
                if !self.drdos.should_block(&from, now) {
                    self.status_response(from, &args);
                }
            }
            "getinfo" => {
                if !self.drdos.should_block(&from, now) {
                    self.info_response(from, &args);
                }
            }
            "getchallenge" => {
                let challenge = self.challenges.generate(&from, now);
                self.send_oob(from, &format!("challengeResponse {}", challenge));
            }
            "connect" => self.direct_connect(from, &args, now),
            "rcon" | "srcon" => self.remote_command(from, &args, now),
            "rconinfo" => self.rcon_info(from),
            // final sequenced messages of an old connection seen by a new server
            "disconnect" => {}
            "ping" => {
                if self.config.private < ServerPrivate::NoStatus {
                    self.send_oob(from, "ack\n");
                }
            }
            _ => debug!("bad connectionless packet from {}: {}", from, args.concat_args(0)),
        }
    }

    fn channel_packet(&mut self, from: NetAddress, packet: &[u8], now: i32) {
        let Ok(qport) = read_qport(packet) else {
            return;
        };

        let Some(num) = self.clients.find_by_channel(&from, qport) else {
            // a sequenced packet from an address we don't know
            self.send_oob(from, "disconnect");
            return;
        };
        let Some(client) = self.clients.get_mut(num) else {
            return;
        };

        // address translating routers may change the port mid-session
        if client.netchan.remote.port() != from.port() {
            info!("packet_event: fixing up a translated port");
            client.netchan.remote.set_port(from.port());
        }

        let payload = match client.netchan.process(packet) {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(e) => {
                debug!("{}: bad channel packet: {}", from, e);
                return;
            }
        };

        // zombies only need the channel kept in step
        if client.state == ClientState::Zombie {
            return;
        }
        client.last_packet_time = now;

        match ClientMessage::decode(payload) {
            Ok(message) => self.execute_client_message(num, message, now),
            Err(e) => {
                debug!("{}: {}", from, e);
                self.drop_client(num, "Illegible client message");
            }
        }
    }

    /// `getstatus [challenge]`
    fn status_response(&mut self, from: NetAddress, args: &Args) {
        if self.config.private >= ServerPrivate::NoStatus {
            return;
        }
        let mut info = InfoMap::parse(self.configstring(shared::protocol::CS_SERVERINFO));
        if args.argc() > 1 && shared::info::valid_info_item(args.argv(1)) {
            info.set("challenge", args.argv(1));
        }

        let mut status = String::new();
        for client in self.clients.iter().filter(|c| c.is_connected()) {
            status.push_str(&format!(
                "{} {} \"{}\"\n",
                self.score(client.num),
                client.ping,
                client.name
            ));
        }
        self.send_oob(from, &format!("statusResponse\n{}\n{}", info, status));
    }

    /// `getinfo [challenge]`: the summary a server browser lists
    fn info_response(&mut self, from: NetAddress, args: &Args) {
        if self.config.private >= ServerPrivate::NoStatus || !self.is_running() {
            return;
        }

        let private_slots = self.config.private_clients;
        let (mut bots, mut public_humans, mut private_humans) = (0, 0, 0);
        for client in self.clients.iter().filter(|c| c.is_connected()) {
            if client.num.0 < private_slots {
                private_humans += 1;
            } else if client.is_bot {
                bots += 1;
            } else {
                public_humans += 1;
            }
        }

        let mut info = InfoMap::new();
        if args.argc() > 1 {
            if !shared::info::valid_info_item(args.argv(1)) {
                return;
            }
            info.set("challenge", args.argv(1));
        }
        let max_clients = self.clients.max_clients();
        info.set("protocol", &PROTOCOL_VERSION.to_string());
        info.set("hostname", &self.config.hostname);
        info.set("serverload", "0");
        info.set("mapname", &self.config.map_name);
        info.set("clients", &(public_humans + private_humans).to_string());
        info.set("bots", &bots.to_string());
        info.set(
            "sv_maxclients",
            &(max_clients.saturating_sub(private_slots) + private_humans).to_string(),
        );
        if !self.config.stats_url.is_empty() {
            info.set("stats", &self.config.stats_url);
        }
        info.set("gamename", GAMENAME_FOR_MASTER);
        info.set("abi", SYSCALL_ABI_VERSION);
        info.set("version", ENGINE_VERSION);

        self.send_oob(from, &format!("infoResponse\n{}", info));
    }

    /// `connect <userinfo>`
    fn direct_connect(&mut self, from: NetAddress, args: &Args, now: i32) {
        if args.argc() < 2 {
            return;
        }
        let mut userinfo = InfoMap::parse(args.argv(1));

        let version = leading_int(userinfo.value_for("protocol"));
        if version != PROTOCOL_VERSION {
            self.send_oob(
                from,
                &format!(
                    "print\nServer uses protocol version {} (yours is {}).",
                    PROTOCOL_VERSION, version
                ),
            );
            debug!("    rejected connect from version {}", version);
            return;
        }

        let qport = leading_int(userinfo.value_for("qport")) as u16;
        let reconnecting = self.clients.find_reconnect(&from, qport);
        if let Some(num) = reconnecting {
            let last_connect = self.clients.get(num).map_or(0, |c| c.last_connect_time);
            if now.wrapping_sub(last_connect) < self.config.reconnect_limit * 1000 {
                debug!("{}: reconnect rejected: too soon", from);
                return;
            }
        }

        if from.is_local() {
            userinfo.set("ip", "loopback");
        } else {
            // local network clients don't need to challenge
            if !from.is_lan()
                && self
                    .challenges
                    .matches(&from, userinfo.value_for("challenge"), now)
                    .is_none()
            {
                self.send_oob(from, "print\n[err_dialog]No or bad challenge for address.");
                return;
            }
            userinfo.set("ip", &from.to_string());
        }

        let num = match reconnecting {
            Some(num) => {
                info!("{}:reconnect", from);
                let was_connected = self.clients.get(num).map_or(false, |c| c.is_connected());
                if was_connected {
                    self.call_game(|game, services| game.client_disconnect(num, services));
                }
                num
            }
            None => {
                let max = self.clients.max_clients();
                let mut start = 0;
                if userinfo.value_for("password") != self.config.private_password {
                    // skip past the reserved slots
                    start = self.config.private_clients.min(max);
                }
                match self.clients.find_free(start..max) {
                    Some(num) => num,
                    None => {
                        let message = format!("print\n{}", self.config.full_message);
                        self.send_oob(from, &message);
                        debug!("Rejected a connection.");
                        return;
                    }
                }
            }
        };

        info!("Client {} connecting", num);
        userinfo.remove("challenge");
        if let Some(client) = self.clients.get_mut(num) {
            client.reset(from, qport);
            client.userinfo = userinfo;
        }

        let denied = self.call_game(|game, services| game.client_connect(num, true, false, services));
        let reason = match denied {
            Some(None) => None,
            Some(Some(reason)) => Some(reason),
            None => Some("Game module unavailable".to_string()),
        };
        if let Some(reason) = reason {
            self.send_oob(from, &format!("print\n[err_dialog]{}", reason));
            debug!("Game rejected a connection: {}.", reason);
            self.free_slot(num);
            return;
        }

        self.userinfo_changed(num);
        self.send_oob(from, "connectResponse");

        if let Some(client) = self.clients.get_mut(num) {
            debug!("Going from CS_FREE to CS_CONNECTED for {}", client.name);
            client.state = ClientState::Connected;
            client.next_snapshot_time = now;
            client.last_packet_time = now;
            client.last_connect_time = now;
            // the first packet will carry a stale server id and trigger the gamestate
            client.gamestate_message_num = -1;
        }

        let count = self.clients.count_at_least(ClientState::Connected);
        if count == 1 || count == self.clients.max_clients() {
            self.heartbeats.force();
        }
    }

    fn free_slot(&mut self, num: ClientNum) {
        if let Some(client) = self.clients.get_mut(num) {
            client.state = ClientState::Free;
            client.userinfo.clear();
        }
    }
}
