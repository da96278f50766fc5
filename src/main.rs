//! # PulseTempo
//!
//! Command-line front end for the PulseTempo core: manage the track catalog,
//! inspect how tracks score against a heart rate, and simulate whole runs.
//!
//! ## Usage
//!
//! ```bash
//! # Load tracks into the catalog
//! pulsetempo import tracks.json
//!
//! # See what would play at 150 bpm
//! pulsetempo rank --heart-rate 150
//!
//! # Simulate an interval session with the watch offline at the start
//! pulsetempo simulate --profile intervals --offline-companion
//! ```

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::info;
use pulsetempo::cli::{Args, Command};
use pulsetempo::config::{self, PulseConfig};
use pulsetempo::simulation::{self, SimulationOptions};
use pulsetempo::{algorithm, completion, db};
use std::path::PathBuf;

/// Main entry point.
///
/// # Logging
///
/// Initializes environment logger which can be controlled via `RUST_LOG`:
/// - `RUST_LOG=debug pulsetempo simulate` - Enable debug logging
/// - `RUST_LOG=pulsetempo::queue=trace pulsetempo simulate` - Module-specific logging
fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = PulseConfig::load(args.config.as_deref())?;
    let db_path = || -> Result<PathBuf> {
        match &args.db {
            Some(path) => Ok(path.clone()),
            None => config::get_db_path(),
        }
    };

    match args.command {
        Command::Import { ref file, force } => {
            let tracks = db::read_tracks_file(file)?;
            let mut conn = db::connect(&db_path()?)?;
            let report = db::import_tracks(&mut conn, &tracks, force)?;
            println!(
                "Imported {} tracks ({} duplicates skipped)",
                report.added, report.skipped
            );
        }
        Command::List => {
            let conn = db::connect(&db_path()?)?;
            let tracks = db::load_tracks(&conn)?;
            if tracks.is_empty() {
                println!("The catalog is empty. Add tracks with `pulsetempo import <file>`.");
            }
            for track in tracks {
                let bpm = track.bpm.map_or_else(|| "  ?".to_string(), |b| format!("{b:>3}"));
                println!("{bpm} bpm  {:>4}s  {}", track.duration_seconds, track.display_name());
            }
        }
        Command::Rank { heart_rate, limit } => {
            let conn = db::connect(&db_path()?)?;
            let tracks = db::load_tracks(&conn)?;
            let ranked = algorithm::rank_tracks(&tracks, heart_rate, &[], &config.scoring);

            println!("{:>6} {:>6} {:>6} {:>6}  track", "total", "tempo", "fresh", "zone");
            for (track, score) in ranked.into_iter().take(limit) {
                println!(
                    "{:>6.3} {:>6.3} {:>6.3} {:>6.3}  {}",
                    score.total,
                    score.bpm_match,
                    score.variety,
                    score.energy_zone,
                    track.display_name()
                );
            }
        }
        Command::Simulate {
            profile,
            minutes,
            time_scale,
            offline_companion,
            seed,
            ref tracks,
        } => {
            let tracks = match tracks {
                Some(file) => db::read_tracks_file(file)?,
                None => db::load_tracks(&db::connect(&db_path()?)?)?,
            };
            let options = SimulationOptions {
                profile,
                minutes,
                time_scale,
                offline_companion,
                seed,
            };

            info!("Starting simulation: {options:?}");
            let report = simulation::simulate(&config, tracks, &options)?;
            let json = serde_json::to_string_pretty(&report).context("Failed to encode run report")?;
            println!("{json}");
        }
        Command::Config => {
            println!("{}", config.to_pretty_json()?);
        }
        Command::Completion { shell } => {
            let mut cmd = Args::command();
            completion::generate_completions(
                completion::shell_to_completion_shell(shell),
                &mut cmd,
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}
