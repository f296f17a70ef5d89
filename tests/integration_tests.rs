//! Integration tests for the session layer
//!
//! Most tests wire a server core and a client core together in memory and
//! move their datagrams between them, so whole sessions run in
//! milliseconds with full control over time and packet loss. The last
//! module runs both tokio front ends over real UDP sockets.

use client::config::ClientConfig;
use client::download::{DownloadError, HttpDownloader, HttpProgress, PakStore};
use client::ping::PingStatus;
use client::state::{ClientEvent, ClientState, ConnState};
use server::config::ServerConfig;
use server::download::MemorySource;
use server::game::{LocalGame, FIRST_WORLD_ENTITY};
use server::state::ServerState;
use server::ClientState as SlotState;
use shared::NetAddress;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

const FRAME_MSEC: i32 = 10;

fn server_address() -> NetAddress {
    NetAddress::Ip(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 10), 27960))
}

fn client_address() -> NetAddress {
    NetAddress::Ip(SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 20), 27961))
}

/// A server and a client joined by an in-memory link
struct Session {
    server: ServerState,
    client: ClientState,
    now: i32,
    /// Events drained from the client so far
    events: Vec<ClientEvent>,
    link_up: bool,
}

impl Session {
    fn new(server_config: ServerConfig, client_config: ClientConfig) -> Self {
        let server = ServerState::new(server_config, Box::new(LocalGame::new()), 0).expect("server starts");
        Self::with_server(server, client_config)
    }

    fn with_server(server: ServerState, client_config: ClientConfig) -> Self {
        Self {
            server,
            client: ClientState::new(client_config),
            now: 0,
            events: Vec::new(),
            link_up: true,
        }
    }

    fn deliver_to_server(&mut self) -> usize {
        let packets = self.client.drain_outgoing();
        let count = packets.len();
        for packet in packets {
            if self.link_up && packet.to == server_address() {
                self.server.packet_event(client_address(), &packet.data, self.now);
            }
        }
        count
    }

    fn deliver_to_client(&mut self) -> usize {
        let packets = self.server.drain_outgoing();
        let count = packets.len();
        for packet in packets {
            if self.link_up && packet.to == client_address() {
                self.client.packet_event(server_address(), &packet.data, self.now);
            }
        }
        count
    }

    /// Moves datagrams both ways until neither side has anything queued
    fn pump(&mut self) {
        for _ in 0..16 {
            let moved = self.deliver_to_server() + self.deliver_to_client();
            if moved == 0 {
                break;
            }
        }
        self.events.extend(self.client.drain_events());
    }

    fn step(&mut self) {
        self.now += FRAME_MSEC;
        self.server.frame(self.now).expect("server frame");
        self.pump();
        self.client.frame(self.now);
        self.pump();
    }

    /// Steps until `done` holds, for at most `limit_msec` of game time
    fn run_until(&mut self, limit_msec: i32, mut done: impl FnMut(&Self) -> bool) -> bool {
        let end = self.now + limit_msec;
        while self.now < end {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    fn run_for(&mut self, msec: i32) {
        let end = self.now + msec;
        while self.now < end {
            self.step();
        }
    }

    fn connect(&mut self) {
        self.client.connect(server_address(), self.now);
        self.pump();
    }

    fn connect_and_activate(&mut self) {
        self.connect();
        assert!(
            self.run_until(5000, |s| s.client.state() == ConnState::Active),
            "client stuck in {:?}: {}",
            self.client.state(),
            self.client.last_error()
        );
    }

    fn server_commands(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::ServerCommand(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn prints(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::Print(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

fn client_config(name: &str) -> ClientConfig {
    ClientConfig {
        name: name.to_string(),
        qport: 1234,
        ..Default::default()
    }
}

/// Pak store whose contents the test can still see after handing it over
#[derive(Clone, Default)]
struct SharedPaks(Arc<Mutex<HashMap<String, Vec<u8>>>>);

impl PakStore for SharedPaks {
    fn has(&self, name: &str) -> bool {
        self.0.lock().unwrap().contains_key(name)
    }

    fn save(&mut self, name: &str, data: &[u8]) -> Result<(), DownloadError> {
        self.0.lock().unwrap().insert(name.to_string(), data.to_vec());
        Ok(())
    }
}

/// Demo output the test can read back
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// HANDSHAKE AND LEVEL LOAD
mod handshake_tests {
    use super::*;

    #[test]
    fn client_reaches_active() {
        let mut session = Session::new(ServerConfig::default(), client_config("Runner"));
        session.connect_and_activate();

        assert!(session.events.contains(&ClientEvent::GamestateLoaded));
        assert!(session.events.contains(&ClientEvent::Activated));
        assert_eq!(session.client.server_id(), session.server.server_id);
        assert_eq!(session.client.client_num(), 0);
        assert_eq!(session.client.configstring(1), session.server.configstring(1));

        let slot = session.server.clients.iter().find(|c| c.is_connected()).expect("slot in use");
        assert_eq!(slot.state, SlotState::Active);
        assert_eq!(slot.name, "Runner");
    }

    #[test]
    fn banned_name_is_refused_with_a_dialog() {
        let server = ServerState::new(
            ServerConfig::default(),
            Box::new(LocalGame::new().with_banned_names(vec!["Troll".to_string()])),
            0,
        )
        .unwrap();
        let mut session = Session::with_server(server, client_config("Troll"));
        session.connect();
        session.run_for(1000);

        assert_eq!(session.client.state(), ConnState::Disconnected);
        assert_eq!(session.client.last_error(), "You are banned from this server.");
        assert_eq!(session.server.clients.count_at_least(SlotState::Connected), 0);
    }

    #[test]
    fn full_server_prints_its_message() {
        let config = ServerConfig {
            max_clients: 1,
            ..Default::default()
        };
        let mut server = ServerState::new(config, Box::new(LocalGame::new()), 0).unwrap();
        server.add_bot("Filler").expect("bot slot");

        let mut session = Session::with_server(server, client_config("Late"));
        session.connect();
        session.run_for(500);
        assert!(session.prints().contains(&"Server is full."));
        assert_ne!(session.client.state(), ConnState::Connected);
    }

    #[test]
    fn client_disconnect_frees_the_slot() {
        let mut session = Session::new(ServerConfig::default(), client_config("Leaver"));
        session.connect_and_activate();

        session.client.disconnect();
        session.pump();
        assert_eq!(session.client.state(), ConnState::Disconnected);
        assert_eq!(session.server.clients.count_at_least(SlotState::Connected), 0);

        // the zombie slot frees up once its grace period ends
        session.run_for(3000);
        assert!(session.server.clients.iter().all(|c| c.state == SlotState::Free));
    }
}

/// SNAPSHOTS AND DELTA COMPRESSION
mod snapshot_tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn mover_x(server_time: i32) -> i32 {
        let phase = server_time.rem_euclid(2000);
        let offset = if phase < 1000 { phase } else { 2000 - phase };
        offset / 10
    }

    #[test]
    fn snapshots_track_the_world() {
        let mut session = Session::new(ServerConfig::default(), client_config("Watcher"));
        session.connect_and_activate();
        session.run_for(1000);

        let (number, server_time) = session.client.current_snapshot_number();
        let snap = session
            .client
            .get_snapshot(number)
            .unwrap()
            .expect("current snapshot is held")
            .clone();
        assert_eq!(snap.server_time, server_time);

        let mover = snap
            .entities
            .iter()
            .find(|e| e.number == FIRST_WORLD_ENTITY)
            .expect("mover in snapshot");
        assert_eq!(mover.origin[0], mover_x(snap.server_time));
        // our own player entity travels in the player state
        assert!(snap.entities.iter().all(|e| e.number != 0));
        assert_eq!(snap.player_state.client_num, 0);
    }

    #[test]
    fn later_snapshots_are_delta_encoded() {
        let mut session = Session::new(ServerConfig::default(), client_config("Delta"));
        session.connect_and_activate();
        session.run_for(500);

        let (number, _) = session.client.current_snapshot_number();
        let snap = session.client.get_snapshot(number).unwrap().expect("held");
        assert!(snap.valid);
        assert_ne!(snap.delta_num, -1, "steady state snapshots delta against an acknowledged one");
    }

    #[test]
    fn server_time_advances_with_snapshots() {
        let mut session = Session::new(ServerConfig::default(), client_config("Clock"));
        session.connect_and_activate();
        let start = session.client.server_time();
        session.run_for(1000);
        let elapsed = session.client.server_time() - start;
        assert_approx_eq!(f64::from(elapsed), 1000.0, 200.0);

        let snapshots = session
            .events
            .iter()
            .filter(|e| matches!(e, ClientEvent::Snapshot(_)))
            .count();
        assert!(snapshots > 10);
    }

    #[test]
    fn snapshots_survive_packet_loss() {
        let mut session = Session::new(ServerConfig::default(), client_config("Lossy"));
        session.connect_and_activate();

        for round in 0..10 {
            session.link_up = round % 2 == 0;
            session.run_for(100);
        }
        session.link_up = true;
        session.run_for(500);

        assert_eq!(session.client.state(), ConnState::Active);
        let (number, _) = session.client.current_snapshot_number();
        let snap = session.client.get_snapshot(number).unwrap().expect("held");
        let mover = snap.entities.iter().find(|e| e.number == FIRST_WORLD_ENTITY).unwrap();
        assert_eq!(mover.origin[0], mover_x(snap.server_time));
    }
}

/// RELIABLE COMMANDS
mod reliable_command_tests {
    use super::*;

    #[test]
    fn chat_goes_round_trip_once() {
        let mut session = Session::new(ServerConfig::default(), client_config("Talker"));
        session.connect_and_activate();

        session.client.add_reliable_command("say hello there");
        session.run_for(500);

        let chats: Vec<&str> = session
            .server_commands()
            .into_iter()
            .filter(|c| c.starts_with("chat"))
            .collect();
        assert_eq!(chats, vec!["chat \"Talker: hello there\""]);
    }

    #[test]
    fn commands_survive_packet_loss_in_order() {
        let config = ServerConfig {
            flood_protect: false,
            ..Default::default()
        };
        let mut session = Session::new(config, client_config("Order"));
        session.connect_and_activate();

        session.link_up = false;
        for n in 0..5 {
            session.client.add_reliable_command(&format!("say {}", n));
            session.run_for(30);
        }
        session.link_up = true;
        session.run_for(1000);

        let chats: Vec<&str> = session
            .server_commands()
            .into_iter()
            .filter(|c| c.starts_with("chat"))
            .collect();
        assert_eq!(
            chats,
            vec![
                "chat \"Order: 0\"",
                "chat \"Order: 1\"",
                "chat \"Order: 2\"",
                "chat \"Order: 3\"",
                "chat \"Order: 4\"",
            ]
        );
    }

    #[test]
    fn big_configstring_is_reassembled() {
        let mut session = Session::new(ServerConfig::default(), client_config("Big"));
        session.connect_and_activate();

        let value = "x".repeat(2500);
        session.server.set_configstring(20, &value);
        session.run_for(500);

        assert_eq!(session.client.configstring(20), value);
        assert!(session
            .server_commands()
            .iter()
            .any(|c| c.starts_with("cs 20 ")));
    }

    #[test]
    fn userinfo_changes_reach_the_server() {
        let mut session = Session::new(ServerConfig::default(), client_config("Before"));
        session.connect_and_activate();

        session.client.set_userinfo_value("name", "After");
        session.run_for(500);

        let slot = session.server.clients.iter().find(|c| c.is_connected()).unwrap();
        assert_eq!(slot.name, "After");
    }

    #[test]
    fn kick_delivers_the_reason() {
        let mut session = Session::new(ServerConfig::default(), client_config("Victim"));
        session.connect_and_activate();

        let num = session.server.clients.iter().find(|c| c.is_connected()).unwrap().num;
        session.server.drop_client(num, "was kicked");
        session.pump();
        session.run_for(100);

        assert_eq!(session.client.state(), ConnState::Disconnected);
        assert_eq!(session.client.last_error(), "Server disconnected: was kicked");
    }

    #[test]
    fn server_shutdown_disconnects_the_client() {
        let mut session = Session::new(ServerConfig::default(), client_config("Stayer"));
        session.connect_and_activate();

        session.server.shutdown("Server quit", session.now);
        session.pump();
        session.client.frame(session.now + FRAME_MSEC);

        assert_eq!(session.client.state(), ConnState::Disconnected);
        assert_eq!(session.client.last_error(), "Server disconnected: Server quit");
        assert!(!session.server.is_running());
    }
}

/// PAK DOWNLOADS
mod download_tests {
    use super::*;

    fn pak_bytes() -> Vec<u8> {
        (0..5000u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn download_server(allow_download: bool) -> ServerState {
        let config = ServerConfig {
            www_download: false,
            allow_download,
            required_paks: vec!["extra.pk3".to_string()],
            ..Default::default()
        };
        let mut paks = MemorySource::new();
        paks.insert("extra.pk3", pak_bytes());
        ServerState::new(config, Box::new(LocalGame::new()), 0)
            .unwrap()
            .with_paks(Box::new(paks))
    }

    #[test]
    fn missing_pak_downloads_in_band() {
        let store = SharedPaks::default();
        let mut session = Session::with_server(download_server(true), client_config("Fetcher"));
        session.client.set_pak_store(Box::new(store.clone()));

        session.connect_and_activate();

        let saved = store.0.lock().unwrap().get("extra.pk3").cloned();
        assert_eq!(saved, Some(pak_bytes()));
        // the level loads once, from the gamestate resent after the download
        let loads = session
            .events
            .iter()
            .filter(|e| **e == ClientEvent::GamestateLoaded)
            .count();
        assert_eq!(loads, 1);
        assert!(!session.client.download_state().is_active());
    }

    /// Accepts every redirect and then reports a bad checksum
    #[derive(Clone, Default)]
    struct BadChecksumHttp {
        begun: Arc<Mutex<Vec<String>>>,
    }

    impl HttpDownloader for BadChecksumHttp {
        fn begin(&mut self, url: &str, _size: i32) -> Result<(), DownloadError> {
            self.begun.lock().unwrap().push(url.to_string());
            Ok(())
        }

        fn poll(&mut self) -> HttpProgress {
            HttpProgress::ChecksumMismatch
        }
    }

    #[test]
    fn failed_redirect_falls_back_to_in_band() {
        let mut server = download_server(true);
        server.config.www_download = true;
        server.config.www_base_url = "http://dl.example.net/paks".to_string();

        let store = SharedPaks::default();
        let http = BadChecksumHttp::default();
        let mut session = Session::with_server(server, client_config("Mirror"));
        session.client.set_pak_store(Box::new(store.clone()));
        session.client.set_http_downloader(Box::new(http.clone()));

        session.connect_and_activate();

        assert_eq!(
            *http.begun.lock().unwrap(),
            vec!["http://dl.example.net/paks/extra.pk3".to_string()]
        );
        assert_eq!(store.0.lock().unwrap().get("extra.pk3").cloned(), Some(pak_bytes()));

        let slot = session
            .server
            .clients
            .iter()
            .find(|c| c.name == "Mirror")
            .expect("slot");
        assert!(!slot.download.is_active());
        assert!(!slot.download.www_dl);
        assert!(!slot.download.www_ing);
        assert!(!slot.download.fallback);
    }

    #[test]
    fn pak_already_present_skips_download() {
        let store = SharedPaks::default();
        store.0.lock().unwrap().insert("extra.pk3".to_string(), vec![1, 2, 3]);
        let mut session = Session::with_server(download_server(true), client_config("Ready"));
        session.client.set_pak_store(Box::new(store.clone()));

        session.connect_and_activate();
        assert_eq!(store.0.lock().unwrap().get("extra.pk3"), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn server_refusal_is_fatal() {
        let mut session = Session::with_server(download_server(false), client_config("Refused"));
        session.client.set_pak_store(Box::new(SharedPaks::default()));

        session.connect();
        session.run_for(3000);

        assert_eq!(session.client.state(), ConnState::Disconnected);
        assert!(session
            .client
            .last_error()
            .starts_with("Download Error: Could not download \"extra.pk3\""));
    }

    #[test]
    fn client_without_autodownload_gives_up() {
        let config = ClientConfig {
            allow_download: false,
            ..client_config("Picky")
        };
        let mut session = Session::with_server(download_server(true), config);
        session.client.set_pak_store(Box::new(SharedPaks::default()));

        session.connect();
        session.run_for(3000);

        assert_eq!(session.client.state(), ConnState::Disconnected);
        assert!(session.client.last_error().contains("extra.pk3"));
        assert!(session.client.last_error().ends_with("Autodownload is disabled"));
    }
}

/// REMOTE CONSOLE
mod rcon_tests {
    use super::*;

    fn rcon_server() -> ServerConfig {
        ServerConfig {
            rcon_password: "secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn rcon_over_the_connection() {
        let config = ClientConfig {
            rcon_password: "secret".to_string(),
            ..client_config("Admin")
        };
        let mut session = Session::new(rcon_server(), config);
        session.connect_and_activate();

        assert!(session.client.rcon("status"));
        session.pump();

        let prints = session.prints();
        assert!(prints.iter().any(|p| p.contains("map: plat23")), "{:?}", prints);
        assert!(prints.iter().any(|p| p.contains("Admin")));
    }

    #[test]
    fn rcon_to_a_destination_without_connecting() {
        let config = ClientConfig {
            rcon_password: "secret".to_string(),
            ..client_config("Remote")
        };
        let mut session = Session::new(rcon_server(), config);
        session.client.set_rcon_destination(server_address());

        assert!(session.client.rcon("status"));
        session.pump();
        assert!(session.prints().iter().any(|p| p.contains("map: plat23")));
        assert_eq!(session.client.state(), ConnState::Disconnected);
    }

    #[test]
    fn encrypted_rcon_reaches_the_server() {
        for secure in [1, 2] {
            let server_config = ServerConfig {
                rcon_secure: secure,
                ..rcon_server()
            };
            let config = ClientConfig {
                rcon_password: "secret".to_string(),
                rcon_secure: secure,
                ..client_config("Crypto")
            };
            let mut session = Session::new(server_config, config);
            session.client.set_rcon_destination(server_address());

            assert!(session.client.rcon("status"));
            session.pump();
            let prints = session.prints();
            assert!(
                prints.iter().any(|p| p.contains("map: plat23")),
                "secure {}: {:?}",
                secure,
                prints
            );
        }
    }

    #[test]
    fn plain_rcon_is_refused_when_encryption_is_required() {
        let server_config = ServerConfig {
            rcon_secure: 1,
            ..rcon_server()
        };
        let config = ClientConfig {
            rcon_password: "secret".to_string(),
            ..client_config("Careless")
        };
        let mut session = Session::new(server_config, config);
        session.client.set_rcon_destination(server_address());

        assert!(session.client.rcon("status"));
        session.pump();
        assert!(session.prints().iter().all(|p| !p.contains("map:")));
    }

    #[test]
    fn wrong_password_gets_no_output() {
        let config = ClientConfig {
            rcon_password: "guess".to_string(),
            ..client_config("Intruder")
        };
        let mut session = Session::new(rcon_server(), config);
        session.client.set_rcon_destination(server_address());

        assert!(session.client.rcon("status"));
        session.pump();
        assert!(session.prints().iter().all(|p| !p.contains("map:")));
    }

    #[test]
    fn rcon_needs_a_password() {
        let mut session = Session::new(rcon_server(), client_config("Nobody"));
        session.client.set_rcon_destination(server_address());
        assert!(!session.client.rcon("status"));
        assert!(session.client.drain_outgoing().is_empty());
    }
}

/// TIMEOUTS AND PINGS
mod timeout_tests {
    use super::*;

    #[test]
    fn both_sides_time_out_when_the_link_dies() {
        let server_config = ServerConfig {
            timeout: 3,
            ..Default::default()
        };
        let client_config = ClientConfig {
            timeout: 2,
            ..client_config("Lost")
        };
        let mut session = Session::new(server_config, client_config);
        session.connect_and_activate();

        session.link_up = false;
        session.run_for(5000);

        assert_eq!(session.client.state(), ConnState::Disconnected);
        assert_eq!(session.client.last_error(), "Server connection timed out.");
        assert_eq!(session.server.clients.count_at_least(SlotState::Connected), 0);
    }

    #[test]
    fn unanswered_connect_keeps_retrying() {
        let mut session = Session::new(ServerConfig::default(), client_config("Patient"));
        session.link_up = false;
        session.connect();
        session.run_for(10_000);
        assert_eq!(session.client.state(), ConnState::Connecting);

        session.link_up = true;
        assert!(session.run_until(10_000, |s| s.client.state() == ConnState::Active));
    }

    #[test]
    fn ping_measures_round_trip() {
        let mut session = Session::new(ServerConfig::default(), client_config("Pinger"));
        session.now = 1000;

        let slot = session.client.ping_server(server_address(), session.now);
        assert_eq!(session.client.ping_status(slot, session.now), Some(PingStatus::Waiting));

        session.deliver_to_server();
        session.now += 40;
        session.deliver_to_client();
        assert_eq!(session.client.ping_status(slot, session.now), Some(PingStatus::Complete(40)));
    }

    #[test]
    fn ping_to_a_dead_server_times_out() {
        let mut session = Session::new(ServerConfig::default(), client_config("Pinger"));
        session.link_up = false;
        let slot = session.client.ping_server(server_address(), 0);
        session.pump();

        let max_ping = session.client.config.max_ping;
        assert_eq!(session.client.ping_status(slot, max_ping - 1), Some(PingStatus::Waiting));
        assert_eq!(session.client.ping_status(slot, max_ping), Some(PingStatus::Timeout));
    }
}

/// DEMOS
mod demo_tests {
    use super::*;

    #[test]
    fn recorded_session_plays_back() {
        let mut session = Session::new(ServerConfig::default(), client_config("Recorder"));
        session.connect_and_activate();

        let buffer = SharedBuffer::default();
        session
            .client
            .start_recording("integration", Box::new(buffer.clone()))
            .unwrap();
        session.run_for(1000);
        session.client.demo_record_stop().unwrap();
        assert!(!session.client.is_demo_recording());

        let recorded = buffer.0.lock().unwrap().clone();
        assert!(recorded.len() > 100);

        let mut player = ClientState::new(client_config("Viewer"));
        player
            .play_demo("integration", Box::new(Cursor::new(recorded)))
            .unwrap();
        assert!(player.is_demo_playing());
        assert_eq!(player.configstring(1), session.client.configstring(1));

        let mut now = 0;
        let mut events = Vec::new();
        while player.state() != ConnState::Disconnected && now < 10_000 {
            now += FRAME_MSEC;
            player.frame(now);
            events.extend(player.drain_events());
            // playback never touches the network
            assert!(player.drain_outgoing().is_empty());
        }

        assert!(events.contains(&ClientEvent::Activated));
        assert!(events.iter().filter(|e| matches!(e, ClientEvent::Snapshot(_))).count() > 10);
        assert_eq!(player.state(), ConnState::Disconnected);
        assert_eq!(player.last_error(), "Demo completed");
    }

    #[test]
    fn recording_needs_a_level() {
        let mut client = ClientState::new(client_config("Early"));
        assert!(client.demo_record(Some("nothing")).is_err());
        assert!(!client.is_demo_recording());
    }
}

/// REAL NETWORK TESTS
mod udp_tests {
    use super::*;
    use client::network::{Client, NetworkEvent};
    use server::network::{Server, ServerMessage};
    use shared::oob;
    use std::time::{Duration, Instant};
    use tokio::net::UdpSocket;

    /// Polls `getstatus` until the server lists `name` as a player
    async fn wait_for_player(server: std::net::SocketAddr, name: &str) -> bool {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buffer = vec![0u8; 4096];
        for _ in 0..20 {
            socket.send_to(&oob::encode("getstatus"), server).await.unwrap();
            if let Ok(Ok((len, _))) =
                tokio::time::timeout(Duration::from_millis(500), socket.recv_from(&mut buffer)).await
            {
                let reply = String::from_utf8_lossy(&buffer[..len]).into_owned();
                if reply.contains(&format!("\"{}\"", name)) {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn client_joins_server_over_udp() {
        let state = ServerState::new(ServerConfig::default(), Box::new(LocalGame::new()), 0).unwrap();
        let mut server = Server::new("127.0.0.1:0", state, Instant::now()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let server_handle = server.handle();
        let server_task = tokio::spawn(async move { server.run().await.map_err(|e| e.to_string()) });

        let mut client = Client::new("127.0.0.1:0", ClientState::new(client_config("Wire")))
            .await
            .unwrap();
        let client_handle = client.handle();
        let client_task = tokio::spawn(async move { client.run().await.map_err(|e| e.to_string()) });

        client_handle
            .send(NetworkEvent::ConsoleLine(format!("connect {}", server_addr)))
            .unwrap();
        assert!(wait_for_player(server_addr, "Wire").await);

        client_handle.send(NetworkEvent::Quit).unwrap();
        tokio_test::assert_ok!(client_task.await.unwrap());

        server_handle
            .send(ServerMessage::Shutdown {
                reason: "test over".to_string(),
            })
            .unwrap();
        tokio_test::assert_ok!(server_task.await.unwrap());
    }
}
