//! Configuration file support for gord
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/gord/config.toml`
//! - macOS: `~/Library/Application Support/gord/config.toml`
//! - Windows: `%APPDATA%\gord\config.toml`

use crate::chain::ChainOptions;
use crate::channel::DEFAULT_SOCKET;
use crate::error::{Error, Result};
use crate::selection::{clamp_gate, MAX_TEMPO, MIN_TEMPO};
use crate::slots::LoopCount;
use crate::state::AppState;
use crate::timing::MAX_SLEEP_CHUNK;
use crate::transport::TransportOptions;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine connection
    pub engine: EngineSettings,
    /// Chain scheduler tuning
    pub chain: ChainSettings,
    /// Transport defaults applied at startup
    pub transport: TransportSettings,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::from_path(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration from an explicit file
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        log::debug!("[CONFIG] Loaded {}", path.display());
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "gord") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        Self::write_default_config(&path)?;
        Ok(path)
    }

    fn write_default_config(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = r#"# gord configuration file

[engine]
# Control socket of the playback engine.
# A Unix datagram socket path, "udp://host:port", or "noop".
socket = "/tmp/gord_rt.sock"

# How often the mirror loop compares state with the engine
mirror_interval_ms = 50

# Delay between arming a chain and restarting playback
settle_ms = 20

[chain]
# Sleep slice of the chain scheduler (at most 20)
sleep_chunk_ms = 20

# How long stop waits for the scheduler thread
join_timeout_ms = 250

# Passes over all active slots: a number, or "inf" for endless
global_loops = "1"

[transport]
tempo = 120.0
gate_percent = 80.0

# Steps per whole note (16 = sixteenths)
subdivision = 16

# MIDI channel (1-16)
channel = 1

# Output transposition in semitones
transpose = 0

# Follow an external clock
slave_mode = false
"#;

        fs::write(path, content)?;
        log::info!("[CONFIG] Wrote default config to {}", path.display());
        Ok(())
    }

    pub fn to_transport_options(&self) -> TransportOptions {
        TransportOptions {
            mirror_interval: Duration::from_millis(self.engine.mirror_interval_ms.max(1)),
            settle: Duration::from_millis(self.engine.settle_ms),
        }
    }

    pub fn to_chain_options(&self) -> ChainOptions {
        ChainOptions {
            global_loops: self.chain.global_loops(),
            sleep_chunk: Duration::from_millis(self.chain.sleep_chunk_ms.max(1)).min(MAX_SLEEP_CHUNK),
            join_timeout: Duration::from_millis(self.chain.join_timeout_ms),
        }
    }

    /// Initial application state with the transport defaults applied.
    pub fn initial_state(&self) -> AppState {
        let t = &self.transport;
        let mut state = AppState::new();
        state.selection.tempo = t.tempo.clamp(MIN_TEMPO, MAX_TEMPO);
        state.selection.gate_percent = clamp_gate(t.gate_percent);
        state.selection.subdivision = t.subdivision.max(1);
        state.selection.transpose = t.transpose;
        state.selection.slave_mode = t.slave_mode;
        state.channel = t.channel.clamp(1, 16);
        state.chain.global_loops = self.chain.global_loops();
        state
    }
}

/// Engine connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub socket: String,
    pub mirror_interval_ms: u64,
    pub settle_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            socket: DEFAULT_SOCKET.to_string(),
            mirror_interval_ms: 50,
            settle_ms: 20,
        }
    }
}

/// Chain scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSettings {
    /// Capped at 20
    pub sleep_chunk_ms: u64,
    pub join_timeout_ms: u64,
    /// Global loop text, same syntax as the loop fields of the slot list
    pub global_loops: String,
}

impl ChainSettings {
    pub fn global_loops(&self) -> LoopCount {
        LoopCount::parse_global(&self.global_loops)
    }
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            sleep_chunk_ms: 20,
            join_timeout_ms: 250,
            global_loops: "1".to_string(),
        }
    }
}

/// Transport defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub tempo: f64,
    pub gate_percent: f64,
    pub subdivision: u32,
    pub channel: u8,
    pub transpose: i32,
    pub slave_mode: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            tempo: 120.0,
            gate_percent: 80.0,
            subdivision: 16,
            channel: 1,
            transpose: 0,
            slave_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.socket, "/tmp/gord_rt.sock");
        assert_eq!(config.chain.global_loops(), LoopCount::Finite(1));
        assert_eq!(config.transport.subdivision, 16);
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.chain.global_loops = "inf".to_string();
        config.transport.tempo = 96.0;
        config.save_to(&path).unwrap();

        let parsed = Config::from_path(&path).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.chain.global_loops(), LoopCount::Infinite);
    }

    #[test]
    fn test_template_matches_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::write_default_config(&path).unwrap();
        assert_eq!(Config::from_path(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[engine]\nsocket = \"udp://127.0.0.1:9000\"\n").unwrap();
        assert_eq!(config.engine.socket, "udp://127.0.0.1:9000");
        assert_eq!(config.engine.mirror_interval_ms, 50);
        assert_eq!(config.transport, TransportSettings::default());
    }

    #[test]
    fn test_options_are_clamped() {
        let mut config = Config::default();
        config.chain.sleep_chunk_ms = 500;
        config.transport.tempo = 1000.0;
        config.transport.channel = 0;
        assert_eq!(config.to_chain_options().sleep_chunk, MAX_SLEEP_CHUNK);

        let state = config.initial_state();
        assert_eq!(state.selection.tempo, 400.0);
        assert_eq!(state.channel, 1);
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine\n").unwrap();
        assert!(matches!(Config::from_path(&path), Err(Error::TomlParse(_))));
    }
}
