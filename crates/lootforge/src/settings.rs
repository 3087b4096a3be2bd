//! Server settings: a TOML file with command-line overrides.
//!
//! ```toml
//! [server]
//! catalog_path = "data/catalog.toml"
//! audit_log_path = "var/audit.wal"
//! sweep_interval_secs = 60
//! lock_timeout_ms = 250
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//!
//! [simulation]
//! monster_ids = [17, 42]
//! players = 100
//! kills_per_second = 20
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::Deserialize;

use crate::Cli;

/// Everything the server needs to start.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub server: ServerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub simulation: Option<SimulationSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    pub catalog_path: PathBuf,
    pub audit_log_path: PathBuf,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { level: default_level(), format: LogFormat::default() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Synthetic kill stream, for soak runs against a real catalog.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationSettings {
    pub monster_ids: Vec<u32>,
    #[serde(default = "default_players")]
    pub players: u64,
    #[serde(default = "default_kill_rate")]
    pub kills_per_second: u32,
    #[serde(default = "default_level_range")]
    pub level_range: (u16, u16),
}

/// Fastest synthetic kill stream; the tick period stays at 100 microseconds.
pub const MAX_KILLS_PER_SECOND: u32 = 10_000;

fn default_sweep_interval() -> u64 {
    60
}

fn default_lock_timeout() -> u64 {
    250
}

fn default_level() -> String {
    "info".to_string()
}

fn default_players() -> u64 {
    100
}

fn default_kill_rate() -> u32 {
    10
}

fn default_level_range() -> (u16, u16) {
    (1, 60)
}

impl Settings {
    /// Reads and validates a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        let settings: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing settings {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Applies command-line overrides on top of the file.
    #[must_use]
    pub fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(path) = &cli.catalog {
            self.server.catalog_path.clone_from(path);
        }
        if let Some(path) = &cli.audit_log {
            self.server.audit_log_path.clone_from(path);
        }
        if let Some(level) = &cli.log_level {
            self.logging.level.clone_from(level);
        }
        if let Some(format) = cli.log_format {
            self.logging.format = format;
        }
        if cli.no_simulation {
            self.simulation = None;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        if self.server.sweep_interval_secs == 0 {
            bail!("server.sweep_interval_secs must be > 0");
        }
        if let Some(sim) = &self.simulation {
            if sim.monster_ids.is_empty() {
                bail!("simulation.monster_ids must not be empty");
            }
            if sim.players == 0 || sim.kills_per_second == 0 {
                bail!("simulation.players and simulation.kills_per_second must be > 0");
            }
            if sim.kills_per_second > MAX_KILLS_PER_SECOND {
                bail!("simulation.kills_per_second must be <= {MAX_KILLS_PER_SECOND}");
            }
            if sim.level_range.0 > sim.level_range.1 {
                bail!("simulation.level_range is inverted");
            }
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.server.sweep_interval_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.server.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [server]
        catalog_path = "data/catalog.toml"
        audit_log_path = "var/audit.wal"
    "#;

    #[test]
    fn test_defaults_fill_in() {
        let settings: Settings = toml::from_str(MINIMAL).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.sweep_interval(), Duration::from_secs(60));
        assert_eq!(settings.lock_timeout(), Duration::from_millis(250));
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.logging.format, LogFormat::Pretty);
        assert!(settings.simulation.is_none());
    }

    #[test]
    fn test_simulation_is_validated() {
        let doc = format!("{MINIMAL}\n[simulation]\nmonster_ids = []\n");
        let settings: Settings = toml::from_str(&doc).unwrap();
        assert!(settings.validate().is_err());

        let doc = format!("{MINIMAL}\n[simulation]\nmonster_ids = [1]\nlevel_range = [30, 10]\n");
        let settings: Settings = toml::from_str(&doc).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_kill_rate_is_capped() {
        let at = |rate: u32| {
            let doc =
                format!("{MINIMAL}\n[simulation]\nmonster_ids = [1]\nkills_per_second = {rate}\n");
            toml::from_str::<Settings>(&doc).unwrap().validate()
        };
        assert!(at(MAX_KILLS_PER_SECOND).is_ok());
        assert!(at(MAX_KILLS_PER_SECOND + 1).is_err());
        assert!(at(u32::MAX).is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let doc = format!("{MINIMAL}\nsweep_every = 5\n");
        assert!(toml::from_str::<Settings>(&doc).is_err());
    }
}
