//! Network configuration.
//!
//! Lives in `murmur-network` rather than `murmur-types` so the shared
//! types crate does not depend on libp2p.

use murmur_types::{MurmurError, Result};

/// Network-layer configuration.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Preferred TCP listen port. `0` means OS-assigned; a bound port
    /// transparently falls back to `0` at startup.
    pub listen_port: u16,
    /// Enable mDNS discovery (and auto-dial) on the local network.
    pub enable_mdns: bool,
    /// Seconds before an idle connection is closed by the swarm.
    pub idle_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: murmur_types::config::DEFAULT_PORT,
            enable_mdns: true,
            idle_timeout_secs: 300,
        }
    }
}

impl NetworkConfig {
    /// Validates all configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_secs == 0 {
            return Err(MurmurError::Config {
                reason: "idle_timeout_secs must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
