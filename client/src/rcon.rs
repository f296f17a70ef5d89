//! Remote console from the client side
//!
//! Commands go to the connected server, or to the configured destination
//! when not connected. At the challenge security level the message waits
//! in a queue until the destination answers our `getchallenge`.

use crate::state::{ClientState, ConnState};
use log::{debug, info, warn};
use shared::rcon::{AesCipher, RconCipher, RconMessage, Secure};
use shared::{InfoMap, NetAddress};

/// Rcon messages waiting for a challenge from their server
pub struct RconQueue {
    requests: Vec<RconMessage>,
    cipher: Box<dyn RconCipher>,
}

impl Default for RconQueue {
    fn default() -> Self {
        Self::new(Box::new(AesCipher))
    }
}

impl std::fmt::Debug for RconQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RconQueue")
            .field("requests", &self.requests)
            .finish()
    }
}

impl RconQueue {
    pub fn new(cipher: Box<dyn RconCipher>) -> Self {
        Self {
            requests: Vec::new(),
            cipher,
        }
    }

    pub fn push(&mut self, message: RconMessage) {
        self.requests.push(message);
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Line to send for `message`, if it is valid and encodes
    pub fn encode(&self, message: &RconMessage) -> Option<String> {
        if let Err(reason) = message.validate() {
            info!("Invalid rcon message: {}", reason);
            return None;
        }
        match message.encode(self.cipher.as_ref()) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!("Could not encode rcon message: {}", e);
                None
            }
        }
    }

    /// Takes the first message for `server`, completed with `challenge`
    ///
    /// Returns `None` when nothing was waiting for this server.
    pub fn pop(&mut self, server: &NetAddress, challenge: &str) -> Option<(NetAddress, Option<String>)> {
        let index = self.requests.iter().position(|m| m.remote == *server)?;
        let message = self.requests.remove(index).with_challenge(challenge);
        let line = self.encode(&message);
        Some((message.remote, line))
    }
}

impl ClientState {
    /// Points rcon at a server for use while not connected
    pub fn set_rcon_destination(&mut self, address: NetAddress) {
        self.rcon_destination = address;
    }

    fn rcon_destination_address(&self) -> NetAddress {
        if self.state >= ConnState::Connected {
            if let Some(netchan) = &self.netchan {
                return netchan.remote;
            }
        }
        self.rcon_destination
    }

    /// `rcon <command>`; returns whether anything was sent or queued
    pub fn rcon(&mut self, command: &str) -> bool {
        if self.config.rcon_password.is_empty() {
            info!("You must set 'rcon.client.password' before issuing an rcon command.");
            return false;
        }
        let remote = self.rcon_destination_address();
        if self.state < ConnState::Connected && remote == NetAddress::Bad {
            info!("Connect to a server or set the 'rcon.client.destination' cvar to issue rcon commands");
            return false;
        }

        let message = RconMessage::new(
            remote,
            Secure::from_level(self.config.rcon_secure),
            &self.config.rcon_password,
            command,
        );

        if message.secure == Secure::EncryptedChallenge {
            debug!("rcon: requesting a challenge from {}", remote);
            self.rcon.push(message);
            self.send_oob(remote, "getchallenge");
            return true;
        }

        match self.rcon.encode(&message) {
            Some(line) => {
                self.send_oob(remote, &line);
                true
            }
            None => false,
        }
    }

    /// Offers a challenge to the rcon queue; false when nothing wanted it
    pub(crate) fn rcon_challenge(&mut self, from: NetAddress, challenge: &str) -> bool {
        match self.rcon.pop(&from, challenge) {
            Some((remote, Some(line))) => {
                self.send_oob(remote, &line);
                true
            }
            Some((_, None)) => true,
            None => false,
        }
    }

    /// `rconInfoResponse`: adopt the security level the server asks for
    pub(crate) fn rcon_info_response(&mut self, info: &InfoMap) {
        if let Ok(secure) = info.value_for("secure").parse::<i32>() {
            debug!("rcon security level set to {} by server", secure);
            self.config.rcon_secure = secure;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use shared::oob;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn admin_server() -> NetAddress {
        NetAddress::Ip(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 27960))
    }

    fn client(secure: i32) -> ClientState {
        let mut client = ClientState::new(ClientConfig {
            rcon_password: "secret".to_string(),
            rcon_secure: secure,
            ..Default::default()
        });
        client.set_rcon_destination(admin_server());
        client
    }

    fn sent_text(client: &mut ClientState) -> Vec<String> {
        client
            .drain_outgoing()
            .into_iter()
            .map(|o| String::from_utf8_lossy(&o.data[4..]).into_owned())
            .collect()
    }

    #[test]
    fn test_plain_rcon_goes_to_destination() {
        let mut client = client(0);
        assert!(client.rcon("status"));
        let out = client.drain_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, admin_server());
        assert_eq!(out[0].data, oob::encode("rcon secret status"));
    }

    #[test]
    fn test_needs_password_and_destination() {
        let mut client = client(0);
        client.config.rcon_password.clear();
        assert!(!client.rcon("status"));

        let mut client = ClientState::new(ClientConfig {
            rcon_password: "secret".to_string(),
            ..Default::default()
        });
        assert!(!client.rcon("status"));
        assert!(client.drain_outgoing().is_empty());
    }

    #[test]
    fn test_challenge_mode_waits_for_challenge() {
        let mut client = client(2);
        assert!(client.rcon("status"));
        assert_eq!(sent_text(&mut client), vec!["getchallenge"]);
        assert!(!client.rcon.is_empty());

        // a challenge from some other host is not ours
        let other = NetAddress::Ip(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 8), 27960));
        assert!(!client.rcon_challenge(other, "abc"));

        assert!(client.rcon_challenge(admin_server(), "abc"));
        assert!(client.rcon.is_empty());
        let sent = sent_text(&mut client);
        assert_eq!(sent.len(), 1);
        let payload = sent[0].strip_prefix("srcon CHALLENGE ").unwrap();
        assert_eq!(AesCipher.decrypt("secret", payload).unwrap(), "abc status");
    }

    #[test]
    fn test_encrypted_plain_is_sent_immediately() {
        let mut client = client(1);
        assert!(client.rcon("status"));
        assert_eq!(sent_text(&mut client), vec!["srcon PLAIN 1CGWwzsWwWP4u9jJIXcuBg==".to_string()]);
    }

    #[test]
    fn test_info_response_sets_level() {
        let mut client = client(0);
        client.rcon_info_response(&InfoMap::parse("\\secure\\2\\challenge\\1"));
        assert_eq!(client.config.rcon_secure, 2);
    }
}
