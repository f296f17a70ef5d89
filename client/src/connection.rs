//! Connecting to a server and handling what it sends
//!
//! The handshake is `getchallenge` → `challengeResponse` → `connect` →
//! `connectResponse`, each step resent every [`RETRANSMIT_TIMEOUT`] until the
//! server answers. After that every datagram from the server is a channel
//! packet carrying a [`ServerMessage`].

use crate::state::{ClientError, ClientState, ConnState, HostLookup};
use log::{debug, info, trace, warn};
use shared::args::escape;
use shared::message::{ServerMessage, ServerOp};
use shared::netchan::{NetChan, NetSource};
use shared::oob::{self, Datagram};
use shared::protocol::{PROTOCOL_VERSION, RETRANSMIT_TIMEOUT};
use shared::{Args, InfoMap, NetAddress};

/// Packets from the server within this long make an OOB `disconnect` suspect
const DISCONNECT_PACKET_GRACE_MSEC: i32 = 3000;
/// Frames in a row past the timeout before giving up
const TIMEOUT_FRAMES: i32 = 5;

/// Everything after the first line of a connectionless reply
fn reply_body(text: &str) -> &str {
    text.split_once('\n').map_or("", |(_, rest)| rest)
}

impl ClientState {
    /// Starts connecting to `address`, ending any current session
    pub fn connect(&mut self, address: NetAddress, now: i32) {
        self.disconnect();
        self.realtime = now;
        if address == NetAddress::Bad {
            warn!("Bad server address");
            return;
        }

        info!("Connecting to {}", address);
        self.server_address = address;
        // a local server has no use for a challenge
        self.state = if address.is_local() {
            ConnState::Challenging
        } else {
            ConnState::Connecting
        };
        self.connect_time = -99999;
        self.connect_packet_count = 0;
        self.last_error.clear();
    }

    /// Connects again to the last server
    pub fn reconnect(&mut self, now: i32) {
        if self.server_address == NetAddress::Bad {
            info!("Can't reconnect to nothing.");
            return;
        }
        let address = self.server_address;
        self.connect(address, now);
    }

    /// Leaves the server, telling it so if a channel is open
    pub fn disconnect(&mut self) {
        if self.demo.is_recording() {
            if let Err(e) = self.demo_record_stop() {
                warn!("{}", e);
            }
        }
        let was_playing = self.demo.is_playing();
        self.demo = crate::demo::Demo::Idle;

        if self.state >= ConnState::Connected && !was_playing && self.netchan.is_some() {
            // the command may be lost, so send it a few times
            if self.reliable.push("disconnect").is_ok() {
                for _ in 0..3 {
                    self.write_packet();
                }
            }
        }
        if self.state != ConnState::Disconnected {
            debug!("Leaving state {:?}", self.state);
        }
        self.reset_session();
    }

    /// Sends `getchallenge` or `connect` when the last one went unanswered
    pub(crate) fn check_for_resend(&mut self) {
        if self.demo.is_playing() {
            return;
        }
        if self.state != ConnState::Connecting && self.state != ConnState::Challenging {
            return;
        }
        if self.realtime.wrapping_sub(self.connect_time) < RETRANSMIT_TIMEOUT {
            return;
        }
        self.connect_time = self.realtime;
        self.connect_packet_count += 1;

        let to = self.server_address;
        match self.state {
            ConnState::Connecting => {
                trace!("Requesting a challenge from {}", to);
                self.send_oob(to, "getchallenge");
            }
            ConnState::Challenging => {
                let mut userinfo = self.userinfo();
                userinfo.set("protocol", &PROTOCOL_VERSION.to_string());
                userinfo.set("qport", &self.config.qport.to_string());
                userinfo.set("challenge", &self.challenge);
                let line = format!("connect {}", escape(&userinfo.to_string()));
                self.send_oob(to, &line);
            }
            _ => {}
        }
    }

    /// Gives up on a server that stopped talking
    pub(crate) fn check_timeout(&mut self) {
        if self.state >= ConnState::Connected
            && !self.demo.is_playing()
            && self.realtime.wrapping_sub(self.last_packet_time) > self.config.timeout * 1000
        {
            self.timeout_count += 1;
            if self.timeout_count > TIMEOUT_FRAMES {
                self.drop_connection("Server connection timed out.");
            }
        } else {
            self.timeout_count = 0;
        }
    }

    /// Handles one datagram received at `now`
    pub fn packet_event(&mut self, from: NetAddress, data: &[u8], now: i32) {
        self.realtime = now;
        match oob::classify(data) {
            Datagram::OutOfBand(text) => self.connectionless_packet(from, &text),
            Datagram::Sequenced(packet) => self.channel_packet(from, packet),
        }
    }

    fn channel_packet(&mut self, from: NetAddress, packet: &[u8]) {
        if self.state < ConnState::Connected || self.demo.is_playing() {
            return;
        }
        let Some(netchan) = self.netchan.as_mut() else {
            return;
        };
        if from != netchan.remote {
            debug!("{}: sequenced packet without connection", from);
            return;
        }

        let payload = match netchan.process(packet) {
            Ok(Some(payload)) => payload.to_vec(),
            Ok(None) => return,
            Err(e) => {
                info!("{}: Runt packet ({})", from, e);
                return;
            }
        };
        let sequence = netchan.incoming_sequence;
        self.last_packet_time = self.realtime;

        if let Err(e) = self.parse_server_message(&payload, sequence) {
            self.drop_connection(&e.to_string());
            return;
        }
        self.record_demo_message(sequence, &payload);
    }

    /// Applies one server message that arrived as channel sequence `message_num`
    pub(crate) fn parse_server_message(&mut self, payload: &[u8], message_num: i32) -> Result<(), ClientError> {
        let message = ServerMessage::decode(payload)?;
        if !self.reliable.set_acknowledge(message.reliable_acknowledge) {
            debug!(
                "server acknowledged reliable command {} we never sent",
                message.reliable_acknowledge
            );
        }

        for op in message.ops {
            match op {
                ServerOp::ServerCommand(command) => self.store_server_command(command)?,
                ServerOp::Gamestate(gamestate) => self.parse_gamestate(gamestate)?,
                ServerOp::Snapshot(snapshot) => {
                    if snapshot.delta_num == 0 {
                        self.demo_full_snapshot();
                    }
                    self.parse_snapshot(snapshot, message_num);
                }
                ServerOp::Download(download) => self.parse_download(download)?,
            }
            if self.state == ConnState::Disconnected {
                break;
            }
        }
        Ok(())
    }

    fn connectionless_packet(&mut self, from: NetAddress, text: &str) {
        let args = Args::parse(text);
        if args.argc() == 0 {
            return;
        }
        let command = args.argv(0).to_ascii_lowercase();
        debug!("CL packet {}: {}", from, command);

        match command.as_str() {
            "challengeresponse" => self.challenge_response(from, args.argv(1)),
            "connectresponse" => self.connect_response(from),
            "inforesponse" => {
                let info = InfoMap::parse(reply_body(text).trim_end());
                self.pings.info_response(&from, &info, self.realtime);
            }
            "statusresponse" => self.events.push(crate::state::ClientEvent::Status {
                from,
                text: reply_body(text).to_string(),
            }),
            "disconnect" => self.disconnect_packet(from),
            "echo" => self.send_oob(from, args.argv(1)),
            "print" => self.print_packet(from, reply_body(text)),
            "error" => warn!("Server error: {}", reply_body(text).trim_end()),
            "rconinforesponse" => {
                let info = InfoMap::parse(reply_body(text).trim_end());
                self.rcon_info_response(&info);
            }
            _ => debug!("Unknown connectionless packet command {}", command),
        }
    }

    fn challenge_response(&mut self, from: NetAddress, challenge: &str) {
        if self.state != ConnState::Connecting || from != self.server_address {
            if !self.rcon_challenge(from, challenge) {
                debug!("Unwanted challenge response received. Ignored.");
            }
            return;
        }
        self.challenge = challenge.to_string();
        self.state = ConnState::Challenging;
        self.connect_packet_count = 0;
        // send the connect right away
        self.connect_time = -99999;
        debug!("challenge {} from {}", challenge, from);
    }

    fn connect_response(&mut self, from: NetAddress) {
        if self.state >= ConnState::Connected {
            info!("Dup connect received. Ignored.");
            return;
        }
        if self.state != ConnState::Challenging {
            info!("connectResponse packet while not connecting. Ignored.");
            return;
        }
        if from != self.server_address {
            info!("connectResponse from wrong address. Ignored.");
            return;
        }

        self.netchan = Some(NetChan::new(NetSource::Client, from, self.config.qport));
        self.state = ConnState::Connected;
        self.last_packet_time = self.realtime;
        self.last_packet_sent_time = -9999;
        info!("Connected to {}", from);
    }

    /// An OOB `disconnect` may be spoofed, so trust it only from a silent server
    fn disconnect_packet(&mut self, from: NetAddress) {
        if self.state < ConnState::Connected {
            return;
        }
        match &self.netchan {
            Some(netchan) if netchan.remote == from => {}
            _ => return,
        }
        if self.realtime.wrapping_sub(self.last_packet_time) < DISCONNECT_PACKET_GRACE_MSEC {
            return;
        }
        self.drop_connection("Server disconnected for unknown reason");
    }

    fn print_packet(&mut self, from: NetAddress, body: &str) {
        if let Some(message) = body.strip_prefix("[err_dialog]") {
            if self.state == ConnState::Challenging && from == self.server_address {
                self.drop_connection(message.trim_end());
                return;
            }
        }
        let body = body.trim_end().to_string();
        info!("{}", body);
        self.events.push(crate::state::ClientEvent::Print(body));
    }

    /// Runs a console command
    ///
    /// Commands that name a host come back as a [`HostLookup`]; the caller
    /// resolves the name and passes the address to [`Self::host_resolved`].
    pub fn console_command(&mut self, line: &str, now: i32) -> Option<HostLookup> {
        self.realtime = now;
        let args = Args::parse(line);
        match args.argv(0) {
            "" => None,
            "connect" => match args.argv(1) {
                "" => {
                    info!("usage: connect <server>");
                    None
                }
                host => Some(HostLookup::Connect(host.to_string())),
            },
            "ping" => match args.argv(1) {
                "" => {
                    info!("usage: ping <server>");
                    None
                }
                host => Some(HostLookup::Ping(host.to_string())),
            },
            "rcon_destination" => Some(HostLookup::RconDestination(args.argv(1).to_string())),
            "reconnect" => {
                self.reconnect(now);
                None
            }
            "disconnect" => {
                if self.state == ConnState::Disconnected && !self.demo.is_playing() {
                    info!("Not connected.");
                } else {
                    self.drop_connection("Disconnected from server");
                }
                None
            }
            "rcon" => {
                self.rcon(&args.escaped_args(1));
                None
            }
            "demo_record" => {
                let name = Some(args.argv(1)).filter(|n| !n.is_empty());
                match self.demo_record(name) {
                    Ok(path) => info!("Recording demo to {}", path.display()),
                    Err(e) => info!("{}", e),
                }
                None
            }
            "demo_record_stop" => {
                if let Err(e) = self.demo_record_stop() {
                    info!("{}", e);
                }
                None
            }
            "demo_play" => {
                if args.argc() < 2 {
                    info!("usage: demo_play <name>");
                } else if let Err(e) = self.demo_play(args.argv(1)) {
                    self.drop_connection(&e.to_string());
                }
                None
            }
            "name" | "rate" | "snaps" => {
                if args.argc() < 2 {
                    info!("{} is \"{}\"", args.argv(0), self.userinfo().value_for(args.argv(0)));
                } else {
                    self.set_userinfo_value(args.argv(0), args.argv(1));
                }
                None
            }
            "cmd" => {
                self.forward_to_server(&args.escaped_args(1));
                None
            }
            _ => {
                self.forward_to_server(&args.escaped_args(0));
                None
            }
        }
    }

    fn forward_to_server(&mut self, command: &str) {
        if self.state < ConnState::Connected || self.demo.is_playing() {
            info!("Unknown command \"{}\"", Args::parse(command).argv(0));
            return;
        }
        if !command.is_empty() {
            self.add_reliable_command(command);
        }
    }

    /// Finishes a console command once its host name is resolved
    pub fn host_resolved(&mut self, lookup: HostLookup, address: NetAddress, now: i32) {
        match lookup {
            HostLookup::Connect(host) => {
                if address == NetAddress::Bad {
                    info!("Bad server address {}", host);
                    return;
                }
                info!("{} resolved to {}", host, address);
                self.connect(address, now);
            }
            HostLookup::Ping(host) => {
                if address == NetAddress::Bad {
                    info!("Bad address: {}", host);
                    return;
                }
                self.ping_server(address, now);
            }
            HostLookup::RconDestination(host) => {
                if address == NetAddress::Bad && !host.is_empty() {
                    info!("Bad rcon destination {}", host);
                }
                self.set_rcon_destination(address);
            }
        }
    }
}
