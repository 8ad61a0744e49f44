// Broker configuration.
//
// Plain-seconds fields with `Duration` accessors; the defaults are part of
// the crate's interface. Loadable from TOML, any omitted field falling back
// to its default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Tunables for the pool, the lease lifecycle and the checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Consecutive transport failures before a proxy is considered invalid.
    pub max_error_count: u32,
    /// Failed health probes a quarantined session survives before eviction.
    pub max_probe_attempts: u32,
    /// Seconds between checker passes over the quarantine table.
    pub check_interval_secs: u64,
    /// Milliseconds between sweeper passes pairing waiters with idle
    /// sessions. The sweeper also wakes on every insert and release; this
    /// tick is the correctness floor.
    pub sweep_interval_ms: u64,
    /// Seconds a lease scope may run before it fails with a deadline fault.
    pub lease_deadline_secs: u64,
    /// Default seconds an acquire waits before timing out. Callers override
    /// per-acquire, including to "wait forever".
    pub acquire_timeout_secs: u64,
    /// URL health probes are issued against.
    pub probe_url: String,
    /// Per-request deadline of a single probe, seconds.
    pub probe_timeout_secs: u64,
    /// Outer deadline wrapped around open-plus-probe, seconds.
    pub probe_outer_timeout_secs: u64,
    /// Connect timeout of transport clients, seconds.
    pub connect_timeout_secs: u64,
    /// Whether the controller runs the background checker loop.
    pub background_checks: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_error_count: 50,
            max_probe_attempts: 3,
            check_interval_secs: 1000,
            sweep_interval_ms: 500,
            lease_deadline_secs: 20,
            acquire_timeout_secs: 100,
            probe_url: "https://example.com".to_string(),
            probe_timeout_secs: 10,
            probe_outer_timeout_secs: 15,
            connect_timeout_secs: 20,
            background_checks: true,
        }
    }
}

impl BrokerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn lease_deadline(&self) -> Duration {
        Duration::from_secs(self.lease_deadline_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_outer_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_outer_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Parse a TOML document; omitted fields keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, BrokerError> {
        toml::from_str(raw).map_err(|e| BrokerError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BrokerError::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&raw)
    }
}
