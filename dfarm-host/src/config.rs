//! Configuration for the farm host.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use dfarm_core::{PoolConfig, SessionParams};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Bridge and agent settings.
    pub farm: FarmConfig,
    /// Session defaults applied to every device.
    pub session: SessionConfig,
    /// Connection pool bounds.
    pub pool: PoolConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Bridge and agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    /// Path to the adb binary.
    pub adb_path: PathBuf,
    /// Agent payload pushed to each device.
    pub agent_path: PathBuf,
    /// First host-side tunnel port; each device gets the next one.
    pub base_port: u16,
    /// Serials to mirror at startup.
    pub serials: Vec<String>,
}

/// Per-session defaults. Resolution, bit rate, and frame rate are
/// chosen by the pool's fleet quality tier, not configured here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep devices awake while mirrored.
    pub stay_awake: bool,
    /// Open the control socket for input injection.
    pub control: bool,
    /// Try the reverse tunnel first.
    pub use_reverse: bool,
    /// Explicit encoder selection, empty = agent picks.
    pub encoder_name: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            farm: FarmConfig::default(),
            session: SessionConfig::default(),
            pool: PoolConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            agent_path: PathBuf::from("dfarm-agent.jar"),
            base_port: 27183,
            serials: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stay_awake: true,
            control: true,
            use_reverse: true,
            encoder_name: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Session parameters for the `index`-th device in the fleet.
    pub fn session_params(&self, serial: &str, index: usize) -> SessionParams {
        let mut params = SessionParams::new(
            serial,
            self.farm.base_port.wrapping_add(index as u16),
            self.farm.agent_path.clone(),
        );
        params.stay_awake = self.session.stay_awake;
        params.control = self.session.control;
        params.use_reverse = self.session.use_reverse;
        params.encoder_name = self.session.encoder_name.clone();
        params.scid = index as u32 + 1;
        params
    }
}

// ── Tests ────────────────────────────────────────────────────────
