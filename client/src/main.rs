use clap::Parser;
use client::config::ClientConfig;
use client::network::{Client, NetworkEvent};
use client::rcon::RconQueue;
use client::state::ClientState;
use log::{info, warn};
use shared::rcon::AesCipher;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server to connect to at startup
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Local address to bind the socket to
    #[arg(short = 'b', long, default_value = "0.0.0.0:0")]
    bind: String,

    #[arg(short = 'n', long, default_value = "UnnamedPlayer")]
    name: String,

    /// Bytes per second the server may send
    #[arg(long, default_value_t = 25000)]
    rate: i32,

    /// Snapshots per second to ask for
    #[arg(long, default_value_t = 40)]
    snaps: i32,

    /// Seconds of silence before the connection is dropped
    #[arg(long, default_value_t = 200)]
    timeout: i32,

    #[arg(long, default_value_t = 125)]
    max_packets: i32,

    /// Milliseconds of extra latency to present, -30 to 30
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    time_nudge: i32,

    /// Refuse to download missing paks
    #[arg(long)]
    no_download: bool,

    #[arg(long, default_value_t = 800)]
    max_ping: i32,

    #[arg(long, default_value = "")]
    rcon_password: String,

    /// rcon security level (0-2)
    #[arg(long, default_value_t = 0)]
    rcon_secure: i32,

    /// Server rcon commands go to when not connected
    #[arg(long, default_value = "")]
    rcon_destination: String,

    #[arg(long, default_value = "demos")]
    demo_dir: PathBuf,

    #[arg(long, default_value = "paks")]
    pak_dir: PathBuf,

    /// Demo to play instead of connecting
    #[arg(long)]
    demo: Option<String>,
}

impl Args {
    fn to_config(&self) -> ClientConfig {
        ClientConfig {
            name: self.name.clone(),
            rate: self.rate,
            snaps: self.snaps,
            timeout: self.timeout,
            max_packets: self.max_packets,
            time_nudge: self.time_nudge,
            allow_download: !self.no_download,
            max_ping: self.max_ping,
            rcon_password: self.rcon_password.clone(),
            rcon_secure: self.rcon_secure,
            rcon_destination: self.rcon_destination.clone(),
            demo_dir: self.demo_dir.clone(),
            pak_dir: self.pak_dir.clone(),
            ..ClientConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = args.to_config();
    config.validate()?;

    info!("Starting client...");
    let rcon_destination = config.rcon_destination.clone();
    let state = ClientState::new(config).with_rcon_queue(RconQueue::new(Box::new(AesCipher)));
    let mut client = Client::new(&args.bind, state).await?;
    let handle = client.handle();

    if !rcon_destination.is_empty() {
        let _ = handle.send(NetworkEvent::ConsoleLine(format!(
            "rcon_destination {}",
            shared::args::escape(&rcon_destination)
        )));
    }
    if let Some(demo) = &args.demo {
        let _ = handle.send(NetworkEvent::ConsoleLine(format!("demo_play {}", shared::args::escape(demo))));
    } else if let Some(server) = &args.server {
        info!("Connecting to: {}", server);
        let _ = handle.send(NetworkEvent::ConsoleLine(format!("connect {}", shared::args::escape(server))));
    }

    info!("Type console commands: connect, reconnect, disconnect, rcon, ping, demo_record, demo_record_stop, demo_play, quit");
    let console = handle.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if console.send(NetworkEvent::ConsoleLine(line)).is_err() {
                        break;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!("Console read failed: {}", e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, disconnecting...");
            let _ = handle.send(NetworkEvent::Quit);
        }
    });

    client.run().await?;

    Ok(())
}
