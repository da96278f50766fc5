//! # PulseTempo
//!
//! Music that keeps pace with a runner's heart. Each heart-rate sample
//! re-scores the catalog, and the best match waits in a single on-deck slot
//! until the current track ends or is skipped. A companion watch mirrors the
//! run and can start, pause and finish it.
//!
//! ## Core Modules
//!
//! - [`algorithm`] - Tempo, variety and energy-zone scoring
//! - [`queue`] - The one-slot on-deck queue
//! - [`session`] - Run lifecycle, history and metrics
//! - [`controller`] - The event loop that ties them together
//! - [`companion`] - Phone/watch message protocol and delivery
//!
//! ### Supporting Modules
//!
//! - [`track`] - Track model and catalog seam
//! - [`heart_rate`] - Heart-rate sources and profiles
//! - [`playback`] - Player seam and the simulated player
//! - [`db`] - SQLite track catalog
//! - [`config`] - Data directory and tunables
//! - [`simulation`] - Offline end-to-end run
//! - [`cli`] / [`completion`] - Command-line surface
//!
//! ## Quick Start Example
//!
//! ```
//! use pulsetempo::algorithm::{select_next_track, ScoringContext};
//! use pulsetempo::track::Track;
//!
//! let pool = vec![
//!     Track::new("1", "Easy", "A", 200, Some(120)),
//!     Track::new("2", "Tempo", "B", 200, Some(158)),
//! ];
//! let pick = select_next_track(&pool, None, 160, &[], &ScoringContext::default());
//! assert_eq!(pick.track().map(|t| t.id.as_str()), Some("2"));
//! ```
//!
//! ## Logging
//!
//! Everything logs through the `log` facade; the binary installs
//! `env_logger`, so `RUST_LOG=pulsetempo=debug` shows queue decisions.

pub mod algorithm;
pub mod cli;
pub mod companion;
pub mod completion;
pub mod config;
pub mod controller;
pub mod db;
pub mod heart_rate;
pub mod playback;
pub mod queue;
pub mod session;
pub mod simulation;
pub mod track;
