//! Playback seam.
//!
//! The run controller decides what plays; a [`PlaybackController`] only
//! carries the decision out. [`SimulatedPlayer`] stands in for a real
//! audio stack: it records every command and, when given a track-end sink,
//! reports natural track ends after a scaled copy of each track's duration.

use crate::track::Track;
use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Transport commands issued by the core.
pub trait PlaybackController: Send {
    /// # Errors
    ///
    /// Returns an error if the player could not start the track.
    fn play(&mut self, track: &Track) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the player rejected the command.
    fn pause(&mut self) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the player rejected the command.
    fn resume(&mut self) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error if the player rejected the command.
    fn stop(&mut self) -> Result<()>;

    /// Jump ahead to `next`, the track the queue already chose.
    ///
    /// # Errors
    ///
    /// Returns an error if the player could not switch tracks.
    fn skip_next(&mut self, next: &Track) -> Result<()>;

    /// Jump back to `previous`, popped from history.
    ///
    /// # Errors
    ///
    /// Returns an error if the player could not switch tracks.
    fn skip_previous(&mut self, previous: &Track) -> Result<()>;

    fn currently_playing(&self) -> Option<Track>;
}

/// A command as the simulated player saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackCommand {
    Play(String),
    Pause,
    Resume,
    Stop,
    SkipNext(String),
    SkipPrevious(String),
}

/// Called with the id of a track that played to its end.
pub type TrackEndSink = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Default)]
struct PlayerState {
    current: Option<Track>,
    paused: bool,
    // Bumped on every track change so stale timers stand down.
    generation: u64,
    commands: Vec<PlaybackCommand>,
}

/// Read-only view of a [`SimulatedPlayer`] that stays usable after the
/// player itself was handed to the controller.
#[derive(Clone)]
pub struct PlaybackLog(Arc<Mutex<PlayerState>>);

impl PlaybackLog {
    #[must_use]
    pub fn commands(&self) -> Vec<PlaybackCommand> {
        self.0.lock().map(|s| s.commands.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn currently_playing(&self) -> Option<Track> {
        self.0.lock().ok().and_then(|s| s.current.clone())
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.0.lock().map(|s| s.paused).unwrap_or(false)
    }
}

pub struct SimulatedPlayer {
    state: Arc<Mutex<PlayerState>>,
    track_end: Option<(TrackEndSink, f64)>,
}

impl Default for SimulatedPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlayer {
    /// Player that never ends a track on its own.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PlayerState::default())),
            track_end: None,
        }
    }

    /// Player that reports each track's end after `duration * time_scale`
    /// of unpaused wall time.
    #[must_use]
    pub fn with_track_end(sink: TrackEndSink, time_scale: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlayerState::default())),
            track_end: Some((sink, time_scale.max(0.0))),
        }
    }

    #[must_use]
    pub fn log(&self) -> PlaybackLog {
        PlaybackLog(Arc::clone(&self.state))
    }

    fn lock(&self) -> Result<MutexGuard<'_, PlayerState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("Simulated player state poisoned"))
    }

    fn switch_to(&mut self, track: &Track, command: PlaybackCommand) -> Result<()> {
        let generation = {
            let mut state = self.lock()?;
            state.commands.push(command);
            state.current = Some(track.clone());
            state.paused = false;
            state.generation += 1;
            state.generation
        };
        log::info!("Now playing: {}", track.display_name());

        if let Some((sink, scale)) = &self.track_end {
            let length = Duration::from_secs_f64(f64::from(track.duration_seconds) * scale);
            spawn_track_timer(
                Arc::clone(&self.state),
                Arc::clone(sink),
                track.id.clone(),
                generation,
                length,
            );
        }
        Ok(())
    }
}

/// Count down `length` of unpaused time, then report the end unless the
/// track was replaced or stopped first.
fn spawn_track_timer(
    state: Arc<Mutex<PlayerState>>,
    sink: TrackEndSink,
    track_id: String,
    generation: u64,
    length: Duration,
) {
    const STEP: Duration = Duration::from_millis(10);

    thread::spawn(move || {
        let mut remaining = length;
        while !remaining.is_zero() {
            let step = remaining.min(STEP);
            thread::sleep(step);
            let Ok(state) = state.lock() else { return };
            if state.generation != generation {
                return;
            }
            if !state.paused {
                remaining = remaining.saturating_sub(step);
            }
        }
        log::debug!("Track {track_id} played to the end");
        sink(track_id);
    });
}

impl PlaybackController for SimulatedPlayer {
    fn play(&mut self, track: &Track) -> Result<()> {
        self.switch_to(track, PlaybackCommand::Play(track.id.clone()))
    }

    fn pause(&mut self) -> Result<()> {
        let mut state = self.lock()?;
        state.commands.push(PlaybackCommand::Pause);
        state.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let mut state = self.lock()?;
        state.commands.push(PlaybackCommand::Resume);
        state.paused = false;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.lock()?;
        state.commands.push(PlaybackCommand::Stop);
        state.current = None;
        state.paused = false;
        state.generation += 1;
        Ok(())
    }

    fn skip_next(&mut self, next: &Track) -> Result<()> {
        self.switch_to(next, PlaybackCommand::SkipNext(next.id.clone()))
    }

    fn skip_previous(&mut self, previous: &Track) -> Result<()> {
        self.switch_to(previous, PlaybackCommand::SkipPrevious(previous.id.clone()))
    }

    fn currently_playing(&self) -> Option<Track> {
        self.log().currently_playing()
    }
}
