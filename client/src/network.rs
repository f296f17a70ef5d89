//! Client network layer: UDP socket tasks, console input and the frame loop

use crate::state::{ClientEvent, ClientState, HostLookup, Outgoing};
use log::{debug, error, info, trace, warn};
use shared::dns::{HostResolver, NetFamily, SystemResolver};
use shared::millis_i32;
use shared::protocol::{MAX_MSGLEN, PORT_SERVER};
use shared::NetAddress;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from the network and console tasks to the frame loop
#[derive(Debug)]
pub enum NetworkEvent {
    PacketReceived { data: Vec<u8>, addr: SocketAddr },
    ConsoleLine(String),
    HostResolved { lookup: HostLookup, address: NetAddress },
    Quit,
}

/// Datagrams for the sender task
#[derive(Debug)]
pub enum SendRequest {
    SendPacket { data: Vec<u8>, addr: SocketAddr },
}

pub struct Client {
    socket: Arc<UdpSocket>,
    state: ClientState,
    frame_duration: Duration,
    started: Instant,

    event_tx: mpsc::UnboundedSender<NetworkEvent>,
    event_rx: mpsc::UnboundedReceiver<NetworkEvent>,
    send_tx: mpsc::UnboundedSender<SendRequest>,
    send_rx: Option<mpsc::UnboundedReceiver<SendRequest>>,
}

impl Client {
    pub async fn new(bind: &str, state: ClientState) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        info!("Client bound to {}", socket.local_addr()?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        // one frame per packet we are allowed to send
        let frame_msec = 1000 / state.config.max_packets.clamp(15, 125);

        Ok(Client {
            socket,
            state,
            frame_duration: Duration::from_millis(frame_msec as u64),
            started: Instant::now(),
            event_tx,
            event_rx,
            send_tx,
            send_rx: Some(send_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender for console lines and quit requests
    pub fn handle(&self) -> mpsc::UnboundedSender<NetworkEvent> {
        self.event_tx.clone()
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    fn now(&self) -> i32 {
        millis_i32(self.started.elapsed())
    }

    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_MSGLEN + 64];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let data = buffer[..len].to_vec();
                        if event_tx.send(NetworkEvent::PacketReceived { data, addr }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // ICMP port unreachable shows up here on some platforms
                        debug!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut send_rx) = self.send_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(request) = send_rx.recv().await {
                match request {
                    SendRequest::SendPacket { data, addr } => {
                        if let Err(e) = socket.send_to(&data, addr).await {
                            warn!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                }
            }
        });
    }

    /// Resolves a host name off the frame loop
    fn spawn_lookup(&self, lookup: HostLookup) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let host = match &lookup {
                HostLookup::Connect(host) | HostLookup::Ping(host) | HostLookup::RconDestination(host) => {
                    host.clone()
                }
            };
            let address = if host.is_empty() {
                NetAddress::Bad
            } else {
                let resolver = SystemResolver {
                    default_port: PORT_SERVER,
                };
                tokio::task::spawn_blocking(move || resolver.resolve(&host, NetFamily::Any))
                    .await
                    .unwrap_or(NetAddress::Bad)
            };
            let _ = event_tx.send(NetworkEvent::HostResolved { lookup, address });
        });
    }

    fn flush_outgoing(&mut self) {
        for Outgoing { to, data } in self.state.drain_outgoing() {
            let Some(addr) = to.to_socket_addr() else {
                debug!("Dropping packet for unroutable address {}", to);
                continue;
            };
            if let Err(e) = self.send_tx.send(SendRequest::SendPacket { data, addr }) {
                error!("Failed to queue packet for sending: {}", e);
            }
        }
    }

    /// Reports what the game layer would have handled
    fn report_events(&mut self) {
        for event in self.state.drain_events() {
            match event {
                ClientEvent::ServerCommand(text) => debug!("server command: {}", text),
                ClientEvent::Print(text) => info!("{}", text),
                ClientEvent::Popup(menu) => info!("Server asks to open menu {}", menu),
                ClientEvent::PubkeyDecrypt(_) => warn!("pubkey_decrypt requested, no key available"),
                ClientEvent::Status { from, text } => info!("Status of {}:\n{}", from, text),
                ClientEvent::GamestateLoaded => info!("Level loaded: {}", self.state.configstring(0)),
                ClientEvent::Activated => info!("Entered the game"),
                ClientEvent::Snapshot(num) => trace!("snapshot {}", num),
                ClientEvent::Disconnected(reason) => info!("Disconnected: {}", reason),
            }
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut frame_interval = interval(self.frame_duration);
        frame_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = self.event_rx.recv() => {
                    let now = self.now();
                    match event {
                        Some(NetworkEvent::PacketReceived { data, addr }) => {
                            self.state.packet_event(NetAddress::from(addr), &data, now);
                        }
                        Some(NetworkEvent::ConsoleLine(line)) => {
                            if line.trim() == "quit" {
                                break;
                            }
                            if let Some(lookup) = self.state.console_command(&line, now) {
                                self.spawn_lookup(lookup);
                            }
                        }
                        Some(NetworkEvent::HostResolved { lookup, address }) => {
                            self.state.host_resolved(lookup, address, now);
                        }
                        Some(NetworkEvent::Quit) | None => break,
                    }
                    self.flush_outgoing();
                    self.report_events();
                },

                _ = frame_interval.tick() => {
                    let now = self.now();
                    self.state.frame(now);
                    self.flush_outgoing();
                    self.report_events();
                },
            }
        }

        info!("Client shutting down");
        self.state.disconnect();
        self.flush_outgoing();
        // let the sender drain before the runtime goes away
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use shared::oob;

    #[tokio::test]
    async fn test_connect_sends_getchallenge_over_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let mut client = Client::new("127.0.0.1:0", ClientState::new(ClientConfig::default()))
            .await
            .unwrap();
        let handle = client.handle();
        let task = tokio::spawn(async move { client.run().await.map_err(|e| e.to_string()) });

        handle
            .send(NetworkEvent::ConsoleLine(format!("connect {}", server_addr)))
            .unwrap();

        let mut buffer = [0u8; 256];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), server.recv_from(&mut buffer))
            .await
            .expect("no getchallenge")
            .unwrap();
        assert_eq!(&buffer[..len], oob::encode("getchallenge").as_slice());

        handle.send(NetworkEvent::Quit).unwrap();
        tokio_test::assert_ok!(task.await.unwrap());
    }
}
