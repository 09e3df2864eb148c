//! Engine and relay configuration.

use std::str::FromStr;
use std::time::Duration;

/// Minimum interval between local diff emissions (~30 per second).
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(33);

/// How long a deleted id blocks remote upserts.
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_millis(2000);

/// Per-session engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Throttle window between successive local flushes
    pub throttle_interval: Duration,
    /// Tombstone lifetime
    pub tombstone_ttl: Duration,
    /// Depth of the driver command channel
    pub command_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            command_capacity: 32,
        }
    }
}

impl SyncConfig {
    /// Short throttle so async tests settle quickly.
    pub fn for_testing() -> Self {
        Self {
            throttle_interval: Duration::from_millis(5),
            ..Self::default()
        }
    }
}

/// WebSocket relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

impl RelayConfig {
    /// Read `SHAPESYNC_RELAY_ADDR`, `SHAPESYNC_BROADCAST_CAPACITY` and
    /// `SHAPESYNC_MAX_PEERS`, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: lookup("SHAPESYNC_RELAY_ADDR").unwrap_or(defaults.bind_addr),
            broadcast_capacity: parse_or(
                &lookup,
                "SHAPESYNC_BROADCAST_CAPACITY",
                defaults.broadcast_capacity,
            ),
            max_peers_per_room: parse_or(&lookup, "SHAPESYNC_MAX_PEERS", defaults.max_peers_per_room),
        }
    }
}

fn parse_or<T: FromStr + Copy>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("Ignoring unparsable {key}={raw:?}");
            default
        }),
        None => default,
    }
}
