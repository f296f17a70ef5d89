//! Remote console and the server console commands
//!
//! Console commands come from two places: lines typed at the server, which
//! the front end pushes onto the [`CommandQueue`], and authenticated rcon
//! packets. Both run through [`ServerState::execute_console_line`]; for rcon
//! the printed output is batched into `print` packets back to the sender.

use crate::client_manager::{ClientNum, ClientState};
use crate::config::ServerPrivate;
use crate::state::ServerState;
use log::{info, warn};
use shared::args::escape;
use shared::cmd::CommandQueue;
use shared::oob::OOB_MARKER;
use shared::protocol::{CS_SERVERINFO, MAX_MSGLEN};
use shared::rcon::{AesCipher, RconCipher, RconMessage, Secure};
use shared::{Args, InfoMap, NetAddress};
use std::sync::Arc;

/// Minimum spacing of rcon packets; closer ones are ignored
pub const RCON_THROTTLE_MSEC: i32 = 180;
/// Rejected requests closer than this are not logged or answered
pub const BAD_RCON_QUIET_MSEC: i32 = 600;

const PRINT_PREFIX: &str = "print";

pub struct RconState {
    last_time: Option<i32>,
    cipher: Box<dyn RconCipher>,
}

impl Default for RconState {
    fn default() -> Self {
        Self::new()
    }
}

impl RconState {
    pub fn new() -> Self {
        Self::with_cipher(Box::new(AesCipher))
    }

    pub fn with_cipher(cipher: Box<dyn RconCipher>) -> Self {
        Self {
            last_time: None,
            cipher,
        }
    }

    /// Milliseconds since the previous rcon packet; every packet counts
    fn throttle(&mut self, now: i32) -> i32 {
        let delta = self.last_time.map_or(i32::MAX, |last| now.wrapping_sub(last));
        self.last_time = Some(now);
        delta
    }
}

/// Collects printed lines into as few `print` packets as fit
#[derive(Debug)]
pub struct RconOutput {
    buffer: String,
    packets: Vec<String>,
    buffer_size: usize,
}

impl Default for RconOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl RconOutput {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            packets: Vec::new(),
            buffer_size: MAX_MSGLEN - OOB_MARKER.len() - PRINT_PREFIX.len() - 1,
        }
    }

    pub fn print(&mut self, text: &str) {
        let mut rest = text;
        // a line too long for one packet is split across several
        while rest.len() >= self.buffer_size {
            let mut cut = self.buffer_size - 1;
            while !rest.is_char_boundary(cut) {
                cut -= 1;
            }
            let (head, tail) = rest.split_at(cut);
            self.append(head);
            rest = tail;
        }
        self.append(rest);
    }

    fn append(&mut self, line: &str) {
        if line.len() + self.buffer.len() >= self.buffer_size {
            self.flush();
        }
        self.buffer.push_str(line);
        self.buffer.push('\n');
    }

    fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.packets.push(format!("{}\n{}", PRINT_PREFIX, self.buffer));
            self.buffer.clear();
        }
    }

    /// Packet texts in send order
    pub fn finish(mut self) -> Vec<String> {
        self.flush();
        self.packets
    }
}

/// Parses an `rcon` or `srcon` command line
pub fn decode(
    from: NetAddress,
    args: &Args,
    password: &str,
    cipher: &dyn RconCipher,
) -> Result<RconMessage, String> {
    let kind = args.argv(0);
    if args.argc() < 3 || (kind != "rcon" && kind != "srcon") {
        return Err("Invalid command".to_string());
    }
    if password.is_empty() {
        return Err("rcon.server.password not set".to_string());
    }

    if kind == "rcon" {
        return Ok(RconMessage::new(
            from,
            Secure::Unencrypted,
            args.argv(1),
            &args.escaped_args(2),
        ));
    }

    let plaintext = cipher
        .decrypt(password, args.argv(2))
        .map_err(|e| e.to_string())?;
    match args.argv(1) {
        "CHALLENGE" => {
            let trimmed = plaintext.trim_start();
            let (challenge, command) = trimmed
                .split_once(char::is_whitespace)
                .unwrap_or((trimmed, ""));
            let command = command.trim_start().lines().next().unwrap_or("");
            Ok(RconMessage::new(from, Secure::EncryptedChallenge, password, command)
                .with_challenge(challenge))
        }
        "PLAIN" => Ok(RconMessage::new(from, Secure::EncryptedPlain, password, &plaintext)),
        _ => Ok(RconMessage::new(from, Secure::Invalid, password, &plaintext)),
    }
}

/// Splits a console line on `;` outside quotes
fn split_commands(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ';' if !quoted => {
                parts.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&line[start..]);
    parts
}

impl ServerState {
    fn rcon_acceptable(&self, message: &RconMessage, now: i32) -> Result<(), String> {
        message.validate().map_err(str::to_string)?;
        if message.secure < Secure::from_level(self.config.rcon_secure) {
            return Err("Weak security".to_string());
        }
        if self.config.rcon_password.is_empty() {
            return Err("No rcon.server.password set on the server.".to_string());
        }
        if message.password != self.config.rcon_password {
            return Err("Bad password".to_string());
        }
        if message.secure == Secure::EncryptedChallenge
            && self
                .challenges
                .matches(&message.remote, &message.challenge, now)
                .is_none()
        {
            return Err("Mismatched challenge".to_string());
        }
        Ok(())
    }

    /// An `rcon` or `srcon` packet
    pub(crate) fn remote_command(&mut self, from: NetAddress, args: &Args, now: i32) {
        let delta = self.rcon.throttle(now);
        if delta < RCON_THROTTLE_MSEC {
            return;
        }

        let message = decode(from, args, &self.config.rcon_password, self.rcon.cipher.as_ref())
            .and_then(|message| self.rcon_acceptable(&message, now).map(|_| message));

        match message {
            Err(reason) => {
                if delta < BAD_RCON_QUIET_MSEC {
                    return;
                }
                info!("Bad rcon from {}:\n{}\n{}", from, reason, args.concat_args(2));
                if self.config.private < ServerPrivate::NoStatus {
                    self.send_oob(from, &format!("error\n{}", reason));
                }
            }
            Ok(message) => {
                info!("Rcon from {}:\n{}", from, message.command);
                let mut lines = Vec::new();
                let queue = Arc::clone(&self.commands);
                queue.push(message.command);
                queue.drain(|line, queue| self.execute_console_line(line, queue, &mut lines));

                let mut output = RconOutput::new();
                for line in &lines {
                    output.print(line);
                }
                for packet in output.finish() {
                    self.send_oob(from, &packet);
                }
            }
        }
    }

    /// `rconinfo`: how rcon requests must be secured
    pub(crate) fn rcon_info(&mut self, from: NetAddress) {
        if self.config.private >= ServerPrivate::NoStatus {
            return;
        }
        let secure = self.config.rcon_secure;
        let mut info = InfoMap::new();
        info.set("secure", &secure.to_string());
        info.set("encryption", "AES256");
        info.set("key", "SHA256");
        info.set("challenge", if secure >= 2 { "1" } else { "0" });
        info.set("timeout", &(self.challenges.timeout() / 1000).to_string());
        self.send_oob(from, &format!("rconInfoResponse\n{}\n", info));
    }

    /// Runs everything typed at the server console, logging the output
    pub(crate) fn execute_console_commands(&mut self, now: i32) {
        self.time = now;
        let queue = Arc::clone(&self.commands);
        let mut lines = Vec::new();
        queue.drain(|line, queue| self.execute_console_line(line, queue, &mut lines));
        for line in lines {
            info!("{}", line);
        }
    }

    pub(crate) fn score(&self, num: ClientNum) -> i32 {
        self.world
            .player_states
            .get(num.0)
            .and_then(|ps| ps.stats.first().copied())
            .unwrap_or(0)
    }

    /// Client named or numbered by `target`
    fn find_client(&self, target: &str) -> Option<ClientNum> {
        if let Ok(index) = target.parse::<usize>() {
            return self
                .clients
                .get(ClientNum(index))
                .filter(|c| c.is_connected())
                .map(|c| c.num);
        }
        self.clients
            .iter()
            .find(|c| c.is_connected() && c.name.eq_ignore_ascii_case(target))
            .map(|c| c.num)
    }

    /// Executes one console line; output goes to `out`
    ///
    /// A line holding several `;` separated commands is split and the parts
    /// queued, so they run after the commands already waiting.
    pub(crate) fn execute_console_line(&mut self, line: &str, queue: &CommandQueue, out: &mut Vec<String>) {
        let parts = split_commands(line);
        if parts.len() > 1 {
            for part in parts.into_iter().map(str::trim).filter(|p| !p.is_empty()) {
                queue.push(part);
            }
            return;
        }

        let args = Args::parse(line);
        if args.argc() == 0 {
            return;
        }
        let now = self.time;

        match args.argv(0).to_ascii_lowercase().as_str() {
            "status" => {
                out.push(format!("map: {}", self.config.map_name));
                out.push("num score ping name            address".to_string());
                out.push("--- ----- ---- --------------- ---------------------".to_string());
                for client in self.clients.iter().filter(|c| c.state > ClientState::Free) {
                    let ping = if client.state == ClientState::Zombie {
                        "ZMBI".to_string()
                    } else {
                        client.ping.min(9999).to_string()
                    };
                    out.push(format!(
                        "{:3} {:5} {:>4} {:<15} {}",
                        client.num,
                        self.score(client.num),
                        ping,
                        client.name,
                        client.address()
                    ));
                }
            }
            "kick" => {
                if args.argc() < 2 {
                    out.push("Usage: kick <player name|slot|all>".to_string());
                    return;
                }
                let target = args.argv(1);
                let victims = if target.eq_ignore_ascii_case("all") {
                    self.clients.nums_at_least(ClientState::Connected)
                } else {
                    match self.find_client(target) {
                        Some(num) => vec![num],
                        None => {
                            out.push(format!("Player {} is not on the server", target));
                            return;
                        }
                    }
                };
                for num in victims {
                    self.drop_client(num, "was kicked");
                }
            }
            "say" => {
                if args.argc() < 2 {
                    return;
                }
                let text = format!("console: {}", args.concat_args(1));
                out.push(text.clone());
                self.send_server_command(None, &format!("chat {}", escape(&text)));
            }
            "addbot" => {
                let name = if args.argc() > 1 { args.argv(1) } else { "Bot" };
                if self.add_bot(name).is_none() {
                    out.push(format!("Could not add bot {}", name));
                }
            }
            "map_restart" => {
                if let Err(e) = self.map_restart(now) {
                    out.push(format!("map_restart failed: {}", e));
                }
            }
            "map" => {
                if args.argc() < 2 {
                    out.push("usage: map <mapname>".to_string());
                    return;
                }
                let map = args.argv(1).to_string();
                if let Err(e) = self.spawn_server(&map, now) {
                    out.push(format!("map {} failed: {}", map, e));
                }
            }
            "heartbeat" => self.heartbeats.force(),
            "serverinfo" => {
                out.push("Server info settings:".to_string());
                let info = InfoMap::parse(self.configstring(CS_SERVERINFO));
                for (key, value) in info.iter() {
                    out.push(format!("{:<20}{}", key, value));
                }
            }
            "echo" => out.push(args.concat_args(1)),
            _ => {
                warn!("Unknown console command {}", args.argv(0));
                out.push(format!("Unknown command {}", args.argv(0)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::game::LocalGame;
    use std::net::SocketAddrV4;

    fn admin() -> NetAddress {
        NetAddress::Ip(SocketAddrV4::new([198, 51, 100, 4].into(), 40000))
    }

    fn server(secure: i32) -> ServerState {
        let config = ServerConfig {
            rcon_password: "secret".to_string(),
            rcon_secure: secure,
            ..Default::default()
        };
        ServerState::new(config, Box::new(LocalGame::new()), 0).unwrap()
    }

    fn replies(state: &mut ServerState) -> Vec<String> {
        state
            .drain_outgoing()
            .into_iter()
            .map(|o| String::from_utf8_lossy(&o.data[4..]).into_owned())
            .collect()
    }

    #[test]
    fn test_plain_rcon_runs_commands() {
        let mut state = server(0);
        state.remote_command(admin(), &Args::parse("rcon secret status"), 10_000);
        let sent = replies(&mut state);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("print\nmap: plat23\n"));
    }

    #[test]
    fn test_rcon_arguments_are_kept_intact() {
        let mut state = server(0);
        state.remote_command(admin(), &Args::parse("rcon secret echo \"a; b\" c"), 10_000);
        assert_eq!(replies(&mut state), vec!["print\na; b c\n".to_string()]);
    }

    #[test]
    fn test_semicolons_queue_separate_commands() {
        let mut state = server(0);
        let queue = CommandQueue::new();
        let mut out = Vec::new();
        state.execute_console_line("echo one; echo two", &queue, &mut out);
        assert!(out.is_empty());
        assert_eq!(queue.len(), 2);

        queue.drain(|line, queue| state.execute_console_line(line, queue, &mut out));
        assert_eq!(out, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_bad_password_is_throttled_then_reported() {
        let mut state = server(0);
        state.remote_command(admin(), &Args::parse("rcon wrong status"), 10_000);
        assert_eq!(replies(&mut state), vec!["error\nBad password".to_string()]);

        // too soon to even look at
        state.remote_command(admin(), &Args::parse("rcon secret status"), 10_100);
        assert!(replies(&mut state).is_empty());

        // rejected quietly inside the quiet window
        state.remote_command(admin(), &Args::parse("rcon wrong status"), 10_400);
        assert!(replies(&mut state).is_empty());

        state.remote_command(admin(), &Args::parse("rcon wrong status"), 11_500);
        assert_eq!(replies(&mut state).len(), 1);
    }

    #[test]
    fn test_weak_security_is_refused() {
        let mut state = server(1);
        state.remote_command(admin(), &Args::parse("rcon secret status"), 10_000);
        assert_eq!(replies(&mut state), vec!["error\nWeak security".to_string()]);

        let payload = AesCipher.encrypt("secret", "echo hi").unwrap();
        state.remote_command(admin(), &Args::parse(&format!("srcon PLAIN {}", payload)), 20_000);
        assert_eq!(replies(&mut state), vec!["print\nhi\n".to_string()]);
    }

    #[test]
    fn test_challenge_mode() {
        let mut state = server(2);
        let token = state.challenges.generate(&admin(), 10_000);

        let payload = AesCipher.encrypt("secret", &format!("{} echo ok", token)).unwrap();
        state.remote_command(admin(), &Args::parse(&format!("srcon CHALLENGE {}", payload)), 10_500);
        assert_eq!(replies(&mut state), vec!["print\nok\n".to_string()]);

        let forged = AesCipher.encrypt("secret", "0000 echo ok").unwrap();
        state.remote_command(admin(), &Args::parse(&format!("srcon CHALLENGE {}", forged)), 11_500);
        assert_eq!(replies(&mut state), vec!["error\nMismatched challenge".to_string()]);

        state.remote_command(admin(), &Args::parse("srcon CHALLENGE zz"), 12_500);
        assert_eq!(replies(&mut state), vec!["error\nInvalid Base64 string".to_string()]);
    }

    #[test]
    fn test_decode_without_password() {
        let args = Args::parse("rcon pw status");
        assert_eq!(
            decode(admin(), &args, "", &AesCipher),
            Err("rcon.server.password not set".to_string())
        );
        assert_eq!(
            decode(admin(), &Args::parse("rcon pw"), "x", &AesCipher),
            Err("Invalid command".to_string())
        );
    }

    #[test]
    fn test_rcon_info() {
        let mut state = server(2);
        state.rcon_info(admin());
        let sent = replies(&mut state);
        let body = sent[0].strip_prefix("rconInfoResponse\n").unwrap().trim_end();
        let info = InfoMap::parse(body);
        assert_eq!(info.get("secure"), Some("2"));
        assert_eq!(info.get("challenge"), Some("1"));
        assert_eq!(info.get("encryption"), Some("AES256"));
        assert_eq!(info.get("timeout"), Some("5"));
    }

    #[test]
    fn test_output_batching() {
        let mut output = RconOutput::new();
        let line = "x".repeat(10_000);
        for _ in 0..4 {
            output.print(&line);
        }
        let packets = output.finish();
        assert_eq!(packets.len(), 2);
        assert!(packets.iter().all(|p| p.len() <= MAX_MSGLEN));
        assert!(packets[0].starts_with("print\n"));
    }

    #[test]
    fn test_oversized_line_is_split() {
        let mut output = RconOutput::new();
        let line = "é".repeat(MAX_MSGLEN);
        output.print("status");
        output.print(&line);
        let packets = output.finish();

        // the short line, two full chunks and the remainder
        assert_eq!(packets.len(), 4);
        assert!(packets.iter().all(|p| shared::oob::encode(p).len() <= MAX_MSGLEN));
        let text: String = packets
            .iter()
            .map(|p| p.trim_start_matches("print\n"))
            .collect::<Vec<_>>()
            .concat()
            .replace('\n', "");
        assert_eq!(text, format!("status{}", line));
    }

    #[test]
    fn test_console_kick_and_unknown() {
        let mut state = server(0);
        state.add_bot("Grunt").unwrap();
        let queue = CommandQueue::new();
        let mut out = Vec::new();
        state.execute_console_line("kick grunt", &queue, &mut out);
        assert_eq!(state.clients.bots(), 0);
        state.execute_console_line("kick nobody", &queue, &mut out);
        state.execute_console_line("frobnicate", &queue, &mut out);
        assert_eq!(
            out,
            vec![
                "Player nobody is not on the server".to_string(),
                "Unknown command frobnicate".to_string()
            ]
        );
    }
}
