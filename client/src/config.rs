//! Client configuration
//!
//! Userinfo values, timeouts, the server browser ping tunables and the time
//! reconciliation thresholds. Defaults match the engine's.

use shared::InfoMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("cl_maxPing must be between 100 and 9999, got {0}")]
    MaxPing(i32),

    #[error("{name} must be between -1 and 5000, got {value}")]
    PingSpacing { name: &'static str, value: i32 },

    #[error("cl_maxpackets must be between 15 and 125, got {0}")]
    MaxPackets(i32),

    #[error("rcon.client.secure must be 0, 1 or 2, got {0}")]
    RconSecure(i32),
}

/// Thresholds of the three-tier server time adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAdjustConfig {
    /// Discrepancy above which the delta snaps to the new value
    pub reset_msec: i32,
    /// Discrepancy above which the gap is halved
    pub fast_msec: i32,
    /// Step back after an extrapolated frame
    pub slow_down_msec: i32,
    /// Step forward otherwise
    pub slow_up_msec: i32,
    /// How close to the latest snapshot counts as extrapolating
    pub extrapolation_margin_msec: i32,
    /// Limit of the user time nudge in either direction
    pub max_time_nudge: i32,
}

impl Default for TimeAdjustConfig {
    fn default() -> Self {
        Self {
            reset_msec: 500,
            fast_msec: 100,
            slow_down_msec: 2,
            slow_up_msec: 1,
            extrapolation_margin_msec: 5,
            max_time_nudge: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    /// Bytes per second the server may send us
    pub rate: i32,
    /// Snapshots per second requested from the server
    pub snaps: i32,
    /// Channel sub-port identifying us behind a NAT
    pub qport: u16,
    /// Seconds without a server packet before giving up
    pub timeout: i32,
    /// Upper bound on packets sent per second
    pub max_packets: i32,
    /// Usercmds repeated from earlier packets to cover loss
    pub packet_dup: usize,
    /// Added latency in milliseconds, clamped to the nudge limit
    pub time_nudge: i32,
    pub time_adjust: TimeAdjustConfig,
    pub allow_download: bool,
    /// Milliseconds before an unanswered ping counts as timed out
    pub max_ping: i32,
    /// Minimum spacing of pings per attempt; -1 disables a retry tier
    pub ping_spacing: [i32; 3],
    pub rcon_password: String,
    pub rcon_secure: i32,
    /// Server rcon goes to when not connected
    pub rcon_destination: String,
    pub demo_dir: PathBuf,
    /// Where downloaded paks are stored
    pub pak_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "UnnamedPlayer".to_string(),
            rate: 25000,
            snaps: 40,
            qport: rand::random::<u16>(),
            timeout: 200,
            max_packets: 125,
            packet_dup: 1,
            time_nudge: 0,
            time_adjust: TimeAdjustConfig::default(),
            allow_download: true,
            max_ping: 800,
            ping_spacing: [5, 50, 125],
            rcon_password: String::new(),
            rcon_secure: 0,
            rcon_destination: String::new(),
            demo_dir: PathBuf::from("demos"),
            pak_dir: PathBuf::from("paks"),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(100..=9999).contains(&self.max_ping) {
            return Err(ConfigError::MaxPing(self.max_ping));
        }
        let names = ["cl_pingSpacing", "cl_pingSpacingRetry1", "cl_pingSpacingRetry2"];
        for (name, &value) in names.into_iter().zip(self.ping_spacing.iter()) {
            // the first attempt can't be disabled
            let min = if name == "cl_pingSpacing" { 0 } else { -1 };
            if !(min..=5000).contains(&value) {
                return Err(ConfigError::PingSpacing { name, value });
            }
        }
        if !(15..=125).contains(&self.max_packets) {
            return Err(ConfigError::MaxPackets(self.max_packets));
        }
        if !(0..=2).contains(&self.rcon_secure) {
            return Err(ConfigError::RconSecure(self.rcon_secure));
        }
        Ok(())
    }

    /// Userinfo sent with `connect` and `userinfo` commands
    pub fn userinfo(&self) -> InfoMap {
        let mut info = InfoMap::new();
        info.set("name", &self.name);
        info.set("rate", &self.rate.to_string());
        info.set("snaps", &self.snaps.to_string());
        info
    }

    pub fn time_nudge(&self) -> i32 {
        let limit = self.time_adjust.max_time_nudge;
        self.time_nudge.clamp(-limit, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.timeout, 200);
        assert_eq!(config.time_adjust.reset_msec, 500);
    }

    #[test]
    fn test_ranges() {
        let mut config = ClientConfig {
            max_ping: 50,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MaxPing(50)));

        config.max_ping = 800;
        config.ping_spacing = [5, -1, -1];
        assert_eq!(config.validate(), Ok(()));

        config.ping_spacing = [-1, 50, 125];
        assert!(matches!(config.validate(), Err(ConfigError::PingSpacing { .. })));
    }

    #[test]
    fn test_userinfo_and_nudge() {
        let config = ClientConfig {
            name: "alice".to_string(),
            time_nudge: -80,
            ..Default::default()
        };
        let info = config.userinfo();
        assert_eq!(info.get("name"), Some("alice"));
        assert_eq!(info.get("rate"), Some("25000"));
        assert_eq!(config.time_nudge(), -30);
    }
}
