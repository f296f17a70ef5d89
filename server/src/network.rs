//! Server network layer handling UDP communications and frame loop coordination

use crate::state::{Outgoing, ServerState};
use log::{debug, error, info, warn};
use shared::millis_i32;
use shared::protocol::MAX_MSGLEN;
use shared::NetAddress;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { data: Vec<u8>, addr: SocketAddr },
    Shutdown { reason: String },
}

/// Messages sent from the frame loop to the sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket { data: Vec<u8>, addr: SocketAddr },
}

/// Main server coordinating networking and the session state
pub struct Server {
    socket: Arc<UdpSocket>,
    state: ServerState,
    frame_duration: Duration,
    started: Instant,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: Option<mpsc::UnboundedReceiver<GameMessage>>,
}

impl Server {
    /// Binds the socket; `started` is the instant `state` counts time from
    pub async fn new(
        addr: &str,
        state: ServerState,
        started: Instant,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let frame_duration = Duration::from_millis(state.config.frame_msec() as u64);

        Ok(Server {
            socket,
            state,
            frame_duration,
            started,
            server_tx,
            server_rx,
            game_tx,
            game_rx: Some(game_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender other tasks can use to stop the loop
    pub fn handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    fn now(&self) -> i32 {
        millis_i32(self.started.elapsed())
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_MSGLEN + 64];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let data = buffer[..len].to_vec();
                        if let Err(e) = server_tx.send(ServerMessage::PacketReceived { data, addr }) {
                            error!("Failed to send packet to main loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut game_rx) = self.game_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { data, addr } => {
                        if let Err(e) = socket.send_to(&data, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                }
            }
        });
    }

    /// Hands everything the state produced to the sender task
    fn flush_outgoing(&mut self) {
        for Outgoing { to, data } in self.state.drain_outgoing() {
            let Some(addr) = to.to_socket_addr() else {
                debug!("Dropping packet for unroutable address {}", to);
                continue;
            };
            if let Err(e) = self.game_tx.send(GameMessage::SendPacket { data, addr }) {
                error!("Failed to queue packet for sending: {}", e);
            }
        }
    }

    /// Main server loop: runs frames on a timer and feeds packets in between
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut frame_interval = interval(self.frame_duration);
        frame_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Server started successfully");

        let reason = loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { data, addr }) => {
                            let now = self.now();
                            self.state.packet_event(NetAddress::from(addr), &data, now);
                            self.flush_outgoing();
                        }
                        Some(ServerMessage::Shutdown { reason }) => break reason,
                        None => break "Server quit".to_string(),
                    }
                },

                _ = frame_interval.tick() => {
                    let now = self.now();
                    let result = self.state.frame(now);
                    self.flush_outgoing();
                    if let Err(e) = result {
                        error!("Server frame failed: {}", e);
                        self.state.shutdown(&format!("Server crashed: {}", e), now);
                        self.flush_outgoing();
                        // let the sender drain before the runtime goes away
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        return Err(Box::new(e));
                    }
                },
            }
        };

        info!("Server shutting down: {}", reason);
        let now = self.now();
        self.state.shutdown(&reason, now);
        self.flush_outgoing();
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !self.game_tx.is_closed() {
            debug!("Final packets queued");
        } else {
            warn!("Sender task stopped before shutdown");
        }
        Ok(())
    }
}
