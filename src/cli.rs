//! # Command-Line Interface Module
//!
//! Clap definitions for the `pulsetempo` binary.
//!
//! ## Commands
//!
//! - `import`: Load tracks from a JSON file into the catalog
//! - `list`: Show the catalog
//! - `rank`: Score the catalog against a heart rate
//! - `simulate`: Run a whole session against simulated hardware
//! - `config`: Print the effective configuration
//! - `completion`: Generate shell completions
//!
//! ## Examples
//!
//! ```bash
//! pulsetempo import tracks.json
//! pulsetempo rank --heart-rate 152 --limit 10
//! pulsetempo simulate --profile intervals --minutes 30
//! ```

use crate::heart_rate::HeartRateProfile;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "pulsetempo")]
#[command(about = "PulseTempo: music that keeps pace with your heart")]
#[command(version)]
pub struct Args {
    /// Configuration file (defaults to config.json in the data directory)
    #[arg(long, global = true, env = "PULSETEMPO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Track catalog database (defaults to catalog.db in the data directory)
    #[arg(long, global = true, env = "PULSETEMPO_DB")]
    pub db: Option<PathBuf>,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Import tracks from a JSON array into the catalog
    ///
    /// Each entry needs `id`, `title`, `artist` and `durationSeconds`;
    /// `bpm`, `bpmConfidence`, `bpmSource` and `artworkRef` are optional.
    /// Tracks that duplicate an existing one (same id, or same title and
    /// artist ignoring case) are skipped.
    Import {
        /// JSON file to read
        #[arg(value_hint = clap::ValueHint::FilePath)]
        file: PathBuf,

        /// Empty the catalog before importing
        #[arg(long)]
        force: bool,
    },

    /// List all tracks in the catalog
    List,

    /// Rank the catalog for a given heart rate
    ///
    /// Prints each track's tempo match, variety and energy-zone components
    /// next to its total score, best first.
    Rank {
        /// Heart rate to score against
        #[arg(long, value_parser = clap::value_parser!(u32).range(30..=250))]
        heart_rate: u32,

        /// Show at most this many tracks
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Simulate a full run
    ///
    /// Drives the run controller with a synthetic heart-rate profile, a
    /// simulated player and an in-process companion watch. The watch asks
    /// for the run to start; the run finishes after the given duration and
    /// the run summary is printed as JSON.
    Simulate {
        /// Heart-rate shape of the run
        #[arg(long, value_enum, default_value = "steady")]
        profile: HeartRateProfile,

        /// Length of the simulated run in minutes
        #[arg(long, default_value = "20")]
        minutes: u32,

        /// Wall-clock seconds per simulated second
        #[arg(long, default_value = "0.01")]
        time_scale: f64,

        /// Start with the watch unreachable so the start request travels
        /// through the durable snapshot
        #[arg(long)]
        offline_companion: bool,

        /// Seed for heart-rate jitter
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Use tracks from this JSON file instead of the catalog
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        tracks: Option<PathBuf>,
    },

    /// Print the effective configuration as JSON
    Config,

    /// Generate shell completions
    ///
    /// Usage: pulsetempo completion bash > ~/.local/share/bash-completion/completions/pulsetempo
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },
}
