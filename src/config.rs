//! Runtime configuration loaded from an optional TOML file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::models::Stream;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite database file.
    pub database: PathBuf,
    /// Local key/value file holding the terminal client's identity.
    pub storage: PathBuf,
    pub bind: String,
    pub port: u16,
    /// Client-side reaction cooldown.
    pub cooldown_ms: u64,
    /// How long a fresh reaction stays highlighted.
    pub highlight_ms: u64,
    /// Buffered notifications per realtime channel.
    pub channel_capacity: usize,
    /// Fallback filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: PathBuf::from("duel-arena.db"),
            storage: PathBuf::from(".duel-arena/local.json"),
            bind: "127.0.0.1".to_string(),
            port: 8890,
            cooldown_ms: 2000,
            highlight_ms: 400,
            channel_capacity: 256,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read `path` when given; defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)?;
                Self::from_toml(&text)
            }
            None => Ok(Config::default()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn highlight(&self) -> Duration {
        Duration::from_millis(self.highlight_ms)
    }
}

/// `[[streams]]` tables of a seed file.
#[derive(Debug, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub streams: Vec<Stream>,
}

impl SeedFile {
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}
