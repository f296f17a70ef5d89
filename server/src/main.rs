use clap::Parser;
use log::{error, info, warn};
use server::config::{ConfigError, NetworkScope, ServerConfig, ServerPrivate};
use server::download::DirectorySource;
use server::game::{GameModule, LocalGame, VmGame};
use server::network::{Server, ServerMessage};
use server::state::ServerState;
use shared::dns::{AddressBook, SystemResolver};
use shared::protocol::{PORT_MASTER, PORT_SERVER};
use shared::rcon::AesCipher;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value_t = PORT_SERVER)]
    port: u16,

    /// Map loaded at startup
    #[arg(short, long, default_value = "plat23")]
    map: String,

    #[arg(long, default_value = "Unnamed Server")]
    hostname: String,

    /// Maximum number of client slots
    #[arg(short = 'c', long, default_value_t = 20)]
    max_clients: usize,

    /// Slots reserved for players knowing the private password
    #[arg(long, default_value_t = 0)]
    private_clients: usize,

    #[arg(long, default_value = "")]
    private_password: String,

    /// Server frames per second
    #[arg(short, long, default_value_t = 40)]
    fps: i32,

    /// 0 = loopback only, 1 = LAN only, 2 = internet
    #[arg(long, default_value_t = 2)]
    network_scope: i32,

    /// 0 = public, 1 = no master heartbeats, 2 = no status replies either
    #[arg(long, default_value_t = 0)]
    private: i32,

    #[arg(long, default_value = "")]
    rcon_password: String,

    /// Lowest accepted rcon security level (0-2)
    #[arg(long, default_value_t = 0)]
    rcon_secure: i32,

    /// Master server to send heartbeats to; may be repeated
    #[arg(long = "master")]
    masters: Vec<String>,

    /// Directory served to clients for downloads
    #[arg(long)]
    pak_dir: Option<String>,

    /// Pak clients must have before joining; may be repeated
    #[arg(long = "require-pak")]
    required_paks: Vec<String>,

    /// Base URL clients are redirected to for downloads
    #[arg(long, default_value = "")]
    www_base_url: String,

    /// Run the game logic behind the syscall bridge on its own thread
    #[arg(long)]
    vm: bool,
}

impl Args {
    fn to_config(&self) -> Result<ServerConfig, ConfigError> {
        let network_scope = NetworkScope::from_level(self.network_scope)
            .ok_or(ConfigError::NetworkScope(self.network_scope))?;
        Ok(ServerConfig {
            hostname: self.hostname.clone(),
            port: self.port,
            map_name: self.map.clone(),
            max_clients: self.max_clients,
            private_clients: self.private_clients,
            private_password: self.private_password.clone(),
            network_scope,
            private: ServerPrivate::from_level(self.private),
            fps: self.fps,
            rcon_password: self.rcon_password.clone(),
            rcon_secure: self.rcon_secure,
            master_servers: self.masters.clone(),
            www_base_url: self.www_base_url.clone(),
            required_paks: self.required_paks.clone(),
            ..ServerConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = args.to_config()?;
    let address = format!("{}:{}", args.host, args.port);

    let game: Box<dyn GameModule> = if args.vm {
        Box::new(VmGame::spawn_in_process(LocalGame::new(), Duration::from_secs(5))?)
    } else {
        Box::new(LocalGame::new())
    };

    let started = Instant::now();
    let mut state = ServerState::new(config, game, 0)?
        .with_rcon_cipher(Box::new(AesCipher))
        .with_address_book(AddressBook::new(SystemResolver {
            default_port: PORT_MASTER,
        }));
    if let Some(dir) = &args.pak_dir {
        state = state.with_paks(Box::new(DirectorySource::new(dir)));
    }

    info!("Starting server on {}", address);
    info!("Map: {}, max clients: {}, fps: {}", args.map, args.max_clients, args.fps);
    info!("Use RUST_LOG=debug for detailed logging");

    // Lines typed at the terminal are console commands
    let commands = state.commands();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => commands.push(line),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!("Console read failed: {}", e);
                    break;
                }
            }
        }
    });

    let mut server = Server::new(&address, state, started).await?;
    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = handle.send(ServerMessage::Shutdown {
                reason: "Server quit".to_string(),
            });
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
