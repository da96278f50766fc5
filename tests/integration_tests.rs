//! # Integration Tests for PulseTempo
//!
//! End-to-end checks through the public API: whole runs driven by events,
//! the companion reconnect path, the SQLite catalog and the binary itself.

use anyhow::Result;
use pulsetempo::companion::{
    CompanionMessage, CompanionSender, CompanionTransport, Delivery, DeviceRole, LoopbackTransport,
};
use pulsetempo::config::PulseConfig;
use pulsetempo::controller::{ControllerParts, RunController, RunEvent, SessionEvent};
use pulsetempo::heart_rate::{HeartRateSample, HeartRateSink, HeartRateSource, HeartRateUpdate};
use pulsetempo::playback::{PlaybackLog, SimulatedPlayer};
use pulsetempo::session::{ManualClock, SessionState};
use pulsetempo::track::{InMemoryCatalog, Track};
use std::path::PathBuf;
use std::process::Command;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Heart-rate source the test feeds by hand.
struct ManualSource;

impl HeartRateSource for ManualSource {
    fn subscribe(&mut self, _sink: HeartRateSink) -> Result<()> {
        Ok(())
    }

    fn unsubscribe(&mut self) {}
}

fn running_pool() -> Vec<Track> {
    vec![
        Track::new("easy", "Easy Does It", "Pace Setters", 180, Some(120)),
        Track::new("cruise", "Cruise", "Pace Setters", 200, Some(145)),
        Track::new("tempo", "Tempo Run", "Stride", 210, Some(155)),
        Track::new("climb", "Hill Climb", "Stride", 190, Some(165)),
        Track::new("sprint", "Final Sprint", "Kick", 170, Some(180)),
        Track::new("ambient", "Cooldown Haze", "Kick", 240, None),
    ]
}

struct Rig {
    controller: RunController,
    clock: Arc<ManualClock>,
    player: PlaybackLog,
    watch: Arc<LoopbackTransport>,
    inbox: Sender<RunEvent>,
    events: Receiver<RunEvent>,
}

fn rig() -> Rig {
    let clock = Arc::new(ManualClock::new());
    let player = SimulatedPlayer::new();
    let log = player.log();
    let (phone, watch) = LoopbackTransport::pair();
    let (inbox, events) = RunController::channel();

    let controller = RunController::new(
        &PulseConfig::default(),
        ControllerParts {
            catalog: Box::new(InMemoryCatalog::new(running_pool())),
            playback: Box::new(player),
            heart_rate: Box::new(ManualSource),
            companion: Some(phone),
            clock: clock.clone(),
            inbox: inbox.clone(),
        },
    );

    Rig {
        controller,
        clock,
        player: log,
        watch,
        inbox,
        events,
    }
}

fn sample(bpm: u32, cadence: u32) -> RunEvent {
    RunEvent::HeartRate(HeartRateUpdate::Sample(HeartRateSample::new(bpm).with_cadence(cadence)))
}

#[cfg(test)]
mod run_tests {
    use super::*;

    #[test]
    fn test_full_run_produces_summary() -> Result<()> {
        let mut rig = rig();
        let events = rig.controller.subscribe();
        rig.controller.handle(RunEvent::Start)?;

        for (bpm, cadence) in [(130, 160), (142, 164), (150, 168), (158, 172)] {
            rig.clock.advance(Duration::from_secs(30));
            rig.controller.handle(sample(bpm, cadence))?;
        }

        let first = rig.controller.session().now_playing().map(|t| t.id.clone());
        rig.controller.handle(RunEvent::TrackFinished {
            track_id: first.clone().unwrap_or_default(),
        })?;
        rig.clock.advance(Duration::from_secs(60));
        rig.controller.handle(RunEvent::Finish)?;

        let summary = rig.controller.summary().expect("finished runs have a summary");
        assert!(summary.was_finished);
        assert_eq!(summary.elapsed_seconds, 180.0);
        assert_eq!(summary.avg_heart_rate, Some(145));
        assert_eq!(summary.max_heart_rate, Some(158));
        assert_eq!(summary.avg_cadence, Some(166));
        assert_eq!(summary.tracks.len(), 2);
        assert_eq!(Some(summary.tracks[0].track_id.clone()), first);

        let states: Vec<_> = events
            .try_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![SessionState::Active, SessionState::Completed]);
        Ok(())
    }

    #[test]
    fn test_pause_freezes_elapsed_time() -> Result<()> {
        let mut rig = rig();
        rig.controller.handle(RunEvent::Start)?;
        rig.clock.advance(Duration::from_secs(60));
        rig.controller.handle(RunEvent::Pause)?;
        rig.clock.advance(Duration::from_secs(600));
        rig.controller.handle(RunEvent::Resume)?;
        rig.clock.advance(Duration::from_secs(60));

        assert_eq!(rig.controller.metrics().elapsed_seconds, 120.0);
        assert!(!rig.player.is_paused());
        Ok(())
    }

    #[test]
    fn test_rapid_alternating_skips_keep_history_consistent() -> Result<()> {
        let mut rig = rig();
        rig.controller.handle(RunEvent::Start)?;
        rig.clock.advance(Duration::from_secs(5));
        rig.controller.handle(sample(155, 170))?;

        for _ in 0..5 {
            rig.controller.handle(RunEvent::SkipForward)?;
            rig.controller.handle(RunEvent::SkipBackward)?;
        }
        rig.controller.handle(RunEvent::SkipForward)?;

        let session = rig.controller.session();
        assert!(session.history().is_consistent());
        assert_eq!(session.tracks_played().len(), session.played_track_ids().len());
        assert_eq!(session.tracks_played().len(), 1);

        let playing = session.now_playing().map(|t| t.id.as_str());
        let on_deck = session.queued_next_track().map(|t| t.id.as_str());
        assert!(playing.is_some());
        assert_ne!(playing, on_deck);
        Ok(())
    }

    #[test]
    fn test_skips_and_samples_from_two_threads() -> Result<()> {
        let mut rig = rig();
        rig.inbox.send(RunEvent::Start).unwrap();

        let skipper = {
            let inbox = rig.inbox.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let skip = if i % 2 == 0 { RunEvent::SkipForward } else { RunEvent::SkipBackward };
                    inbox.send(skip).unwrap();
                    thread::yield_now();
                }
            })
        };
        let sensor = {
            let inbox = rig.inbox.clone();
            let clock = Arc::clone(&rig.clock);
            thread::spawn(move || {
                for i in 0..50 {
                    clock.advance(Duration::from_secs(3));
                    inbox.send(sample(120 + (i % 4) * 15, 165)).unwrap();
                    thread::yield_now();
                }
            })
        };
        let finisher = {
            let inbox = rig.inbox.clone();
            thread::spawn(move || {
                let _ = skipper.join();
                let _ = sensor.join();
                inbox.send(RunEvent::Finish).unwrap();
            })
        };

        rig.controller.run(&rig.events);
        finisher.join().unwrap();

        let session = rig.controller.session();
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.heart_rate_sample_count(), 50);
        assert!(session.history().is_consistent());
        // every forward skip was undone, only the track on air at the finish counts
        assert_eq!(session.tracks_played().len(), 1);

        let summary = rig.controller.summary().expect("finished runs have a summary");
        assert_eq!(summary.tracks.len(), 1);
        assert_eq!(summary.max_heart_rate, Some(165));
        Ok(())
    }

    #[test]
    fn test_stopped_run_has_no_summary() -> Result<()> {
        let mut rig = rig();
        rig.controller.handle(RunEvent::Start)?;
        rig.controller.handle(RunEvent::Stop)?;

        assert_eq!(rig.controller.session().state(), SessionState::Completed);
        assert!(rig.controller.summary().is_none());
        assert!(rig.player.currently_playing().is_none());
        Ok(())
    }
}

#[cfg(test)]
mod companion_integration_tests {
    use super::*;

    #[test]
    fn test_start_request_survives_disconnect() -> Result<()> {
        let mut rig = rig();
        rig.watch.set_reachable(false);

        let watch_side = CompanionSender::new(
            DeviceRole::Watch,
            Arc::clone(&rig.watch) as Arc<dyn CompanionTransport>,
        );
        let delivery = watch_side.deliver(&CompanionMessage::start_request(1_700_000_000.0));
        assert_eq!(delivery, Delivery::Snapshot);

        rig.controller.handle(RunEvent::ReachabilityChanged(false))?;
        assert_eq!(rig.controller.session().state(), SessionState::NotStarted);

        rig.watch.set_reachable(true);
        rig.controller.handle(RunEvent::ReachabilityChanged(true))?;
        assert_eq!(rig.controller.session().state(), SessionState::Active);

        // the same request arriving late over the live link is a duplicate
        rig.controller.handle(RunEvent::Companion(CompanionMessage::start_request(
            1_700_000_000.0,
        )))?;
        assert_eq!(rig.controller.session().state(), SessionState::Active);
        assert_eq!(rig.controller.session().tracks_played().len(), 0);

        rig.controller.flush_companion()?;
        let inbox = rig.watch.drain_inbox();
        assert!(inbox.iter().any(|m| matches!(
            m,
            CompanionMessage::WorkoutState { is_active: true, is_paused: false, .. }
        )));
        Ok(())
    }

    #[test]
    fn test_watch_sees_heart_rate_from_phone() -> Result<()> {
        let mut rig = rig();
        rig.controller.handle(RunEvent::Start)?;
        rig.controller.handle(sample(148, 166))?;
        rig.controller.flush_companion()?;

        let inbox = rig.watch.drain_inbox();
        assert!(inbox.contains(&CompanionMessage::HeartRate {
            bpm: 148,
            cadence: 166,
            timestamp: pulsetempo::companion::wire_timestamp(
                pulsetempo::session::Clock::utc_now(rig.clock.as_ref())
            ),
        }));
        Ok(())
    }
}

#[cfg(test)]
mod database_integration_tests {
    use super::*;
    use pulsetempo::db;
    use pulsetempo::track::TrackCatalog;

    #[test]
    fn test_catalog_feeds_a_run() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("catalog.db");
        let mut conn = db::connect(&path)?;
        let report = db::import_tracks(&mut conn, &running_pool(), false)?;
        assert_eq!(report.added, 6);

        let catalog = db::SqliteCatalog::open(&path)?;
        assert_eq!(catalog.tracks_in_active_pool(), running_pool());

        let (inbox, _events) = RunController::channel();
        let mut controller = RunController::new(
            &PulseConfig::default(),
            ControllerParts {
                catalog: Box::new(catalog),
                playback: Box::new(SimulatedPlayer::new()),
                heart_rate: Box::new(ManualSource),
                companion: None,
                clock: Arc::new(ManualClock::new()),
                inbox,
            },
        );
        controller.handle(RunEvent::Start)?;
        assert!(controller.session().now_playing().is_some());
        Ok(())
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn bin() -> Command {
        Command::new(env!("CARGO_BIN_EXE_pulsetempo"))
    }

    fn tracks_file(dir: &TempDir) -> Result<PathBuf> {
        let path = dir.path().join("tracks.json");
        std::fs::write(&path, serde_json::to_string(&running_pool())?)?;
        Ok(path)
    }

    #[test]
    fn test_cli_help_displays_correctly() {
        let output = bin().arg("--help").output().expect("Failed to run help command");

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("pulsetempo"));
        assert!(stdout.contains("import"));
        assert!(stdout.contains("rank"));
        assert!(stdout.contains("simulate"));
    }

    #[test]
    fn test_cli_version_flag() {
        let output = bin().arg("--version").output().expect("Failed to run version command");

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("pulsetempo"));
        assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_import_then_rank() -> Result<()> {
        let dir = TempDir::new()?;
        let file = tracks_file(&dir)?;
        let db = dir.path().join("catalog.db");

        let import = bin().arg("--db").arg(&db).arg("import").arg(&file).output()?;
        assert!(import.status.success());
        assert!(String::from_utf8_lossy(&import.stdout).contains("Imported 6 tracks"));

        let rank = bin()
            .arg("--db")
            .arg(&db)
            .args(["rank", "--heart-rate", "155", "--limit", "1"])
            .output()?;
        assert!(rank.status.success());
        assert!(String::from_utf8_lossy(&rank.stdout).contains("Tempo Run"));
        Ok(())
    }

    #[test]
    fn test_explicit_config_must_exist() -> Result<()> {
        let dir = TempDir::new()?;
        let output = bin()
            .arg("--config")
            .arg(dir.path().join("absent.json"))
            .arg("config")
            .output()?;
        assert!(!output.status.success());
        Ok(())
    }

    #[test]
    fn test_simulate_prints_summary() -> Result<()> {
        let dir = TempDir::new()?;
        let file = tracks_file(&dir)?;

        let output = bin()
            .arg("--db")
            .arg(dir.path().join("catalog.db"))
            .args(["simulate", "--minutes", "2", "--time-scale", "0.001", "--tracks"])
            .arg(&file)
            .output()?;
        assert!(output.status.success());

        let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        assert_eq!(report["summary"]["wasFinished"], true);
        assert_eq!(report["watch"]["wasFinished"], true);
        Ok(())
    }

    #[test]
    fn test_completion_generation() {
        let output = bin()
            .args(["completion", "bash"])
            .output()
            .expect("Failed to run completion command");

        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("_pulsetempo"));
        assert!(stdout.contains("complete"));
    }
}
