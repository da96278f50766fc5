//! # Configuration Module
//!
//! Data directory setup and the tunables that shape scoring, the queue and
//! the companion link.
//!
//! ## Data Storage
//!
//! PulseTempo keeps its catalog and configuration in the platform-standard
//! data directory:
//! - Linux: `~/.local/share/pulsetempo/`
//! - macOS: `~/Library/Application Support/pulsetempo/`
//! - Windows: `%APPDATA%\pulsetempo\`
//!
//! ## Configuration File
//!
//! `config.json` in the data directory (or a path given with `--config`) is
//! read on startup. Every field is optional; missing fields take their
//! defaults, so `{}` is a valid file:
//!
//! ```json
//! {
//!   "scoring": { "tolerance": 12, "varietyWindow": 6 },
//!   "queue": { "deadband": 4 },
//!   "companion": { "role": "phone", "lockBroadcastIntervalSecs": 10 }
//! }
//! ```

use crate::algorithm::ScoringContext;
use crate::companion::CompanionConfig;
use crate::queue::QueueConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "pulsetempo";
const DB_FILE: &str = "catalog.db";
const CONFIG_FILE: &str = "config.json";

/// Returns the platform-appropriate data directory, creating it if needed.
///
/// # Errors
///
/// This function will return an error if:
/// - The system data directory cannot be determined
/// - The pulsetempo subdirectory cannot be created due to permissions
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not determine system data directory. Please ensure your platform supports standard data directories."
        )
    })?;

    let app_dir = data_dir.join(APP_DIR);
    fs::create_dir_all(&app_dir).with_context(|| {
        format!(
            "Failed to create PulseTempo data directory at {}. Please check file permissions.",
            app_dir.display()
        )
    })?;

    Ok(app_dir)
}

/// Returns the path of the SQLite track catalog.
///
/// # Errors
///
/// Fails when [`get_data_dir`] fails.
///
/// # Examples
///
/// ```no_run
/// use pulsetempo::config::get_db_path;
///
/// let db_path = get_db_path()?;
/// println!("Catalog location: {}", db_path.display());
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn get_db_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(DB_FILE))
}

/// Default location of `config.json`.
///
/// # Errors
///
/// Fails when [`get_data_dir`] fails.
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(CONFIG_FILE))
}

/// All runtime tunables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PulseConfig {
    pub scoring: ScoringContext,
    pub queue: QueueConfig,
    pub companion: CompanionConfig,
}

impl PulseConfig {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON for
    /// this schema.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = get_config_path()?;
                if !default.exists() {
                    log::debug!("No config at {}, using defaults", default.display());
                    return Ok(Self::default());
                }
                default
            }
        };

        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.validate()?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject tunables that would make scoring meaningless.
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scoring;
        if s.tolerance <= s.full_match_band {
            anyhow::bail!(
                "scoring.tolerance ({}) must be greater than scoring.fullMatchBand ({})",
                s.tolerance,
                s.full_match_band
            );
        }
        if s.variety_window == 0 {
            anyhow::bail!("scoring.varietyWindow must be at least 1");
        }
        let w = &s.weights;
        if [w.bpm_match, w.variety, w.energy_zone].iter().any(|v| *v < 0.0 || !v.is_finite()) {
            anyhow::bail!("scoring.weights must be finite and non-negative");
        }
        let z = &s.zones;
        if !(z.moderate_from < z.high_from && z.high_from < z.max_from) {
            anyhow::bail!(
                "scoring.zones thresholds must ascend: moderateFrom ({}) < highFrom ({}) < maxFrom ({})",
                z.moderate_from,
                z.high_from,
                z.max_from
            );
        }
        for (name, (min, max)) in [
            ("lowBand", z.low_band),
            ("moderateBand", z.moderate_band),
            ("highBand", z.high_band),
            ("maxBand", z.max_band),
        ] {
            if min > max {
                anyhow::bail!("scoring.zones.{name} is inverted: {min} > {max}");
            }
        }
        Ok(())
    }

    /// Pretty JSON, as printed by `pulsetempo config`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to encode config")
    }
}
