//! Server configuration
//!
//! Every tunable of the connection layer lives here with the engine default
//! as its `Default` value. The binary fills it from command line flags.

use shared::protocol::{GAMENAME_FOR_MASTER, MAX_CLIENTS, PORT_SERVER};
use shared::InfoMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sv_maxclients must be between 1 and {max}, got {value}")]
    MaxClients { value: usize, max: usize },

    #[error("sv_privateClients ({private}) exceeds sv_maxclients ({max})")]
    PrivateClients { private: usize, max: usize },

    #[error("sv_networkScope must be 0, 1 or 2, got {0}")]
    NetworkScope(i32),

    #[error("sv_fps must be positive, got {0}")]
    Fps(i32),

    #[error("rcon.server.secure must be 0, 1 or 2, got {0}")]
    RconSecure(i32),
}

/// Which networks the server answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkScope {
    Loopback = 0,
    Lan = 1,
    Internet = 2,
}

impl NetworkScope {
    pub fn from_level(level: i32) -> Option<Self> {
        match level {
            0 => Some(NetworkScope::Loopback),
            1 => Some(NetworkScope::Lan),
            2 => Some(NetworkScope::Internet),
            _ => None,
        }
    }
}

/// How much the server advertises itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerPrivate {
    /// Heartbeats and status queries
    Public = 0,
    /// No heartbeats
    NoAdvert = 1,
    /// No heartbeats and no status replies
    NoStatus = 2,
}

impl ServerPrivate {
    pub fn from_level(level: i32) -> Self {
        match level {
            i32::MIN..=0 => ServerPrivate::Public,
            1 => ServerPrivate::NoAdvert,
            _ => ServerPrivate::NoStatus,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub map_name: String,
    pub game_name: String,
    pub max_clients: usize,
    pub private_clients: usize,
    pub private_password: String,
    pub network_scope: NetworkScope,
    pub private: ServerPrivate,
    /// Server frames per second
    pub fps: i32,
    /// Seconds without packets before a client is dropped
    pub timeout: i32,
    /// Seconds a dropped slot stays a zombie
    pub zombie_time: i32,
    /// Seconds during which a reconnect from the same client is ignored
    pub reconnect_limit: i32,
    pub flood_protect: bool,
    pub lan_force_rate: bool,
    pub full_message: String,
    pub allow_download: bool,
    pub www_download: bool,
    pub www_base_url: String,
    pub www_fallback_url: String,
    /// Bytes per second cap for in-band downloads
    pub dl_max_rate: i32,
    pub rcon_password: String,
    pub rcon_secure: i32,
    pub master_servers: Vec<String>,
    pub stats_url: String,
    /// Paks clients must have, advertised as `sv_paks` in systeminfo
    pub required_paks: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "Unnamed Server".to_string(),
            port: PORT_SERVER,
            map_name: "plat23".to_string(),
            game_name: GAMENAME_FOR_MASTER.to_string(),
            max_clients: 20,
            private_clients: 0,
            private_password: String::new(),
            network_scope: NetworkScope::Internet,
            private: ServerPrivate::Public,
            fps: 40,
            timeout: 240,
            zombie_time: 2,
            reconnect_limit: 3,
            flood_protect: true,
            lan_force_rate: true,
            full_message: "Server is full.".to_string(),
            allow_download: true,
            www_download: true,
            www_base_url: String::new(),
            www_fallback_url: String::new(),
            dl_max_rate: 42000,
            rcon_password: String::new(),
            rcon_secure: 0,
            master_servers: Vec::new(),
            stats_url: String::new(),
            required_paks: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return Err(ConfigError::MaxClients {
                value: self.max_clients,
                max: MAX_CLIENTS,
            });
        }
        if self.private_clients > self.max_clients {
            return Err(ConfigError::PrivateClients {
                private: self.private_clients,
                max: self.max_clients,
            });
        }
        if self.fps <= 0 {
            return Err(ConfigError::Fps(self.fps));
        }
        if !(0..=2).contains(&self.rcon_secure) {
            return Err(ConfigError::RconSecure(self.rcon_secure));
        }
        Ok(())
    }

    /// Milliseconds per server frame
    pub fn frame_msec(&self) -> i32 {
        (1000 / self.fps).max(1)
    }

    /// Info string published in the serverinfo configstring and `getstatus`
    pub fn serverinfo(&self) -> InfoMap {
        let mut info = InfoMap::new();
        info.set("sv_hostname", &self.hostname);
        info.set("mapname", &self.map_name);
        info.set("sv_maxclients", &self.max_clients.to_string());
        info.set("gamename", &self.game_name);
        if self.www_download && !self.www_base_url.is_empty() {
            info.set("sv_wwwBaseURL", &self.www_base_url);
        }
        info
    }
}
