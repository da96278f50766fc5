//! # Run Session
//!
//! The aggregate root of a run: lifecycle state, elapsed time, heart-rate and
//! cadence aggregation, play history and the on-deck slot.
//!
//! ## Lifecycle
//!
//! ```text
//! NotStarted --start--> Active <--pause/resume--> Paused
//!                         |                         |
//!                         +------stop/finish--------+--> Completed
//! ```
//!
//! `Completed` is terminal and nothing re-enters `NotStarted`. Elapsed time
//! only accrues while `Active`. Metrics only accept samples while `Active`.
//!
//! Only the queue manager and the run controller mutate a session; the
//! history and its id set are updated together through [`PlayHistory`].

use crate::track::Track;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    NotStarted,
    Active,
    Paused,
    Completed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Inputs to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleEvent {
    Start,
    Pause,
    Resume,
    /// End the run and discard it
    Stop,
    /// End the run and keep its summary
    Finish,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Finish => "finish",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("cannot {event} a session that is {from}")]
    InvalidTransition {
        from: SessionState,
        event: LifecycleEvent,
    },
}

/// The transition table. `None` means the event is rejected in that state.
#[must_use]
pub const fn next_state(from: SessionState, event: LifecycleEvent) -> Option<SessionState> {
    use LifecycleEvent as E;
    use SessionState as S;

    match (from, event) {
        (S::NotStarted, E::Start) => Some(S::Active),
        (S::Active, E::Pause) => Some(S::Paused),
        (S::Paused, E::Resume) => Some(S::Active),
        (S::Active | S::Paused, E::Stop | E::Finish) => Some(S::Completed),
        _ => None,
    }
}

/// Time source for elapsed-time accrual and history timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used by tests and the offline simulator.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    base_utc: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_utc: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut offset) = self.offset.lock() {
            *offset += by;
        }
    }

    fn offset(&self) -> Duration {
        self.offset.lock().map(|o| *o).unwrap_or_default()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(self.offset()).unwrap_or_else(|_| chrono::Duration::zero());
        self.base_utc + offset
    }
}

/// One track that was actually played during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayHistoryEntry {
    pub track: Track,
    /// When the track started playing
    pub started_at: DateTime<Utc>,
    /// Heart rate when it started, if one was known
    pub heart_rate_at_start: Option<u32>,
}

/// Ordered play history plus the set of ids it contains.
///
/// Both are only changed through [`push`](Self::push) and
/// [`pop`](Self::pop), so the set always equals the ids in the list.
#[derive(Debug, Clone, Default)]
pub struct PlayHistory {
    entries: Vec<PlayHistoryEntry>,
    ids: HashSet<String>,
}

impl PlayHistory {
    pub fn push(&mut self, entry: PlayHistoryEntry) {
        self.ids.insert(entry.track.id.clone());
        self.entries.push(entry);
    }

    /// Remove the most recent entry. Its id leaves the set unless an earlier
    /// entry holds the same track.
    pub fn pop(&mut self) -> Option<PlayHistoryEntry> {
        let entry = self.entries.pop()?;
        if !self.entries.iter().any(|e| e.track.id == entry.track.id) {
            self.ids.remove(&entry.track.id);
        }
        Some(entry)
    }

    #[must_use]
    pub fn entries(&self) -> &[PlayHistoryEntry] {
        &self.entries
    }

    #[must_use]
    pub fn ids(&self) -> &HashSet<String> {
        &self.ids
    }

    #[must_use]
    pub fn contains(&self, track_id: &str) -> bool {
        self.ids.contains(track_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the id set is exactly the ids of the entries.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let derived: HashSet<&str> = self.entries.iter().map(|e| e.track.id.as_str()).collect();
        derived.len() == self.ids.len() && derived.iter().all(|id| self.ids.contains(*id))
    }
}

/// Point-in-time view of a run's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub state: SessionState,
    pub elapsed_seconds: f64,
    pub current_heart_rate: Option<u32>,
    pub current_cadence: Option<u32>,
    pub average_heart_rate: u32,
    pub max_heart_rate: u32,
    pub average_cadence: u32,
    pub tracks_played: usize,
}

/// A played track as it appears in a saved run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTrackRecord {
    pub track_id: String,
    pub played_at: DateTime<Utc>,
    pub heart_rate_at_start: Option<u32>,
}

/// Saved result of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub avg_heart_rate: Option<u32>,
    pub max_heart_rate: Option<u32>,
    pub avg_cadence: Option<u32>,
    pub was_finished: bool,
    pub tracks: Vec<RunTrackRecord>,
}

#[derive(Debug, Clone, Copy, Default)]
struct RunningAverage {
    count: u64,
    sum: u64,
}

impl RunningAverage {
    fn add(&mut self, value: u32) {
        self.count += 1;
        self.sum += u64::from(value);
    }

    /// Integer mean, 0 with no samples.
    fn mean(self) -> u32 {
        match self.count {
            0 => 0,
            n => u32::try_from(self.sum / n).unwrap_or(u32::MAX),
        }
    }
}

/// Track on air right now and when it started.
#[derive(Debug, Clone, PartialEq)]
struct NowPlaying {
    entry: PlayHistoryEntry,
}

/// A single run.
#[derive(Debug)]
pub struct RunSession {
    state: SessionState,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    accrued: Duration,
    active_since: Option<Instant>,
    current_heart_rate: Option<u32>,
    current_cadence: Option<u32>,
    heart_rate: RunningAverage,
    max_heart_rate: u32,
    cadence: RunningAverage,
    history: PlayHistory,
    now_playing: Option<NowPlaying>,
    queued_next_track: Option<Track>,
    was_finished: bool,
    frozen: Option<MetricsSnapshot>,
}

impl Default for RunSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SessionState::NotStarted,
            started_at: None,
            ended_at: None,
            accrued: Duration::ZERO,
            active_since: None,
            current_heart_rate: None,
            current_cadence: None,
            heart_rate: RunningAverage::default(),
            max_heart_rate: 0,
            cadence: RunningAverage::default(),
            history: PlayHistory::default(),
            now_playing: None,
            queued_next_track: None,
            was_finished: false,
            frozen: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Apply a lifecycle event. Rejected events leave the session untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] when the event is not
    /// allowed from the current state.
    pub fn transition(
        &mut self,
        event: LifecycleEvent,
        clock: &dyn Clock,
    ) -> Result<SessionState, SessionError> {
        let to = next_state(self.state, event).ok_or(SessionError::InvalidTransition {
            from: self.state,
            event,
        })?;
        let now = clock.now();

        match event {
            LifecycleEvent::Start => {
                self.started_at = Some(clock.utc_now());
                self.active_since = Some(now);
            }
            LifecycleEvent::Pause => self.stop_accrual(now),
            LifecycleEvent::Resume => self.active_since = Some(now),
            LifecycleEvent::Stop | LifecycleEvent::Finish => {
                self.stop_accrual(now);
                self.ended_at = Some(clock.utc_now());
                self.was_finished = event == LifecycleEvent::Finish;
                if let Some(playing) = self.now_playing.take() {
                    self.history.push(playing.entry);
                }
                self.queued_next_track = None;
            }
        }

        log::info!("Run session {} -> {to} ({event})", self.state);
        self.state = to;
        if to == SessionState::Completed {
            self.frozen = Some(self.snapshot_at(now));
        }
        Ok(to)
    }

    fn stop_accrual(&mut self, now: Instant) {
        if let Some(since) = self.active_since.take() {
            self.accrued += now.saturating_duration_since(since);
        }
    }

    /// Time spent active, excluding pauses.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        match self.active_since {
            Some(since) => self.accrued + now.saturating_duration_since(since),
            None => self.accrued,
        }
    }

    /// Fold a heart-rate sample (and cadence, when reported) into the
    /// metrics. Samples outside `Active` are ignored; returns whether this
    /// one was taken.
    pub fn record_sample(&mut self, heart_rate: u32, cadence: Option<u32>) -> bool {
        if self.state != SessionState::Active {
            return false;
        }

        self.current_heart_rate = Some(heart_rate);
        self.heart_rate.add(heart_rate);
        self.max_heart_rate = self.max_heart_rate.max(heart_rate);

        if let Some(steps) = cadence.filter(|&c| c > 0) {
            self.current_cadence = Some(steps);
            self.cadence.add(steps);
        }
        true
    }

    #[must_use]
    pub fn current_heart_rate(&self) -> Option<u32> {
        self.current_heart_rate
    }

    #[must_use]
    pub fn current_cadence(&self) -> Option<u32> {
        self.current_cadence
    }

    /// Integer mean of accepted samples, 0 before the first one.
    #[must_use]
    pub fn average_heart_rate(&self) -> u32 {
        self.heart_rate.mean()
    }

    #[must_use]
    pub fn max_heart_rate(&self) -> u32 {
        self.max_heart_rate
    }

    #[must_use]
    pub fn average_cadence(&self) -> u32 {
        self.cadence.mean()
    }

    #[must_use]
    pub fn heart_rate_sample_count(&self) -> u64 {
        self.heart_rate.count
    }

    #[must_use]
    pub fn history(&self) -> &PlayHistory {
        &self.history
    }

    #[must_use]
    pub fn tracks_played(&self) -> &[PlayHistoryEntry] {
        self.history.entries()
    }

    #[must_use]
    pub fn played_track_ids(&self) -> &HashSet<String> {
        self.history.ids()
    }

    #[must_use]
    pub fn now_playing(&self) -> Option<&Track> {
        self.now_playing.as_ref().map(|p| &p.entry.track)
    }

    #[must_use]
    pub fn queued_next_track(&self) -> Option<&Track> {
        self.queued_next_track.as_ref()
    }

    #[must_use]
    pub fn was_finished(&self) -> bool {
        self.was_finished
    }

    /// Current metrics, or the snapshot frozen when the run completed.
    #[must_use]
    pub fn metrics(&self, now: Instant) -> MetricsSnapshot {
        match &self.frozen {
            Some(frozen) => frozen.clone(),
            None => self.snapshot_at(now),
        }
    }

    fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        MetricsSnapshot {
            state: self.state,
            elapsed_seconds: self.elapsed(now).as_secs_f64(),
            current_heart_rate: self.current_heart_rate,
            current_cadence: self.current_cadence,
            average_heart_rate: self.average_heart_rate(),
            max_heart_rate: self.max_heart_rate,
            average_cadence: self.average_cadence(),
            tracks_played: self.history.len(),
        }
    }

    /// Summary of a finished run. `None` unless the run completed via finish.
    #[must_use]
    pub fn summary(&self) -> Option<RunSummary> {
        if self.state != SessionState::Completed || !self.was_finished {
            return None;
        }
        let frozen = self.frozen.as_ref()?;
        let non_zero = |v: u32| (v > 0).then_some(v);

        Some(RunSummary {
            started_at: self.started_at?,
            ended_at: self.ended_at?,
            elapsed_seconds: frozen.elapsed_seconds,
            avg_heart_rate: non_zero(frozen.average_heart_rate),
            max_heart_rate: non_zero(frozen.max_heart_rate),
            avg_cadence: non_zero(frozen.average_cadence),
            was_finished: true,
            tracks: self
                .history
                .entries()
                .iter()
                .map(|entry| RunTrackRecord {
                    track_id: entry.track.id.clone(),
                    played_at: entry.started_at,
                    heart_rate_at_start: entry.heart_rate_at_start,
                })
                .collect(),
        })
    }

    // Queue-manager entry points. Each keeps history, ids and slots in step.

    /// Put `track` on air without touching history.
    pub(crate) fn set_now_playing(&mut self, track: Track, started_at: DateTime<Utc>) {
        self.now_playing = Some(NowPlaying {
            entry: PlayHistoryEntry {
                track,
                started_at,
                heart_rate_at_start: self.current_heart_rate,
            },
        });
    }

    pub(crate) fn set_queued_next(&mut self, track: Option<Track>) {
        self.queued_next_track = track;
    }

    /// Move the playing track into history and the on-deck track on air.
    /// Returns the new playing track.
    pub(crate) fn advance(&mut self, started_at: DateTime<Utc>) -> Option<Track> {
        let next = self.queued_next_track.take()?;
        if let Some(outgoing) = self.now_playing.take() {
            self.history.push(outgoing.entry);
        }
        self.set_now_playing(next.clone(), started_at);
        Some(next)
    }

    /// Pop the last played track back on air; the interrupted track becomes
    /// on-deck and is not counted as played. Returns the restored track.
    pub(crate) fn rewind(&mut self, started_at: DateTime<Utc>) -> Option<Track> {
        let previous = self.history.pop()?;
        let interrupted = self.now_playing.take().map(|p| p.entry.track);
        self.set_now_playing(previous.track.clone(), started_at);
        if interrupted.is_some() {
            self.queued_next_track = interrupted;
        }
        Some(previous.track)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str) -> Track {
        Track::new(id, id.to_uppercase(), "Artist", 200, Some(150))
    }

    fn active_session(clock: &ManualClock) -> RunSession {
        let mut session = RunSession::new();
        session.transition(LifecycleEvent::Start, clock).unwrap();
        session
    }

    #[test]
    fn test_every_table_transition_is_reachable() {
        let clock = ManualClock::new();

        let mut session = active_session(&clock);
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.transition(LifecycleEvent::Pause, &clock), Ok(SessionState::Paused));
        assert_eq!(session.transition(LifecycleEvent::Resume, &clock), Ok(SessionState::Active));
        assert_eq!(session.transition(LifecycleEvent::Finish, &clock), Ok(SessionState::Completed));

        let mut session = active_session(&clock);
        assert_eq!(session.transition(LifecycleEvent::Stop, &clock), Ok(SessionState::Completed));

        let mut session = active_session(&clock);
        session.transition(LifecycleEvent::Pause, &clock).unwrap();
        assert_eq!(session.transition(LifecycleEvent::Finish, &clock), Ok(SessionState::Completed));

        let mut session = active_session(&clock);
        session.transition(LifecycleEvent::Pause, &clock).unwrap();
        assert_eq!(session.transition(LifecycleEvent::Stop, &clock), Ok(SessionState::Completed));
    }

    #[test]
    fn test_transitions_outside_table_are_rejected() {
        use LifecycleEvent as E;
        use SessionState as S;

        let allowed = [
            (S::NotStarted, E::Start),
            (S::Active, E::Pause),
            (S::Paused, E::Resume),
            (S::Active, E::Stop),
            (S::Active, E::Finish),
            (S::Paused, E::Stop),
            (S::Paused, E::Finish),
        ];

        for from in [S::NotStarted, S::Active, S::Paused, S::Completed] {
            for event in [E::Start, E::Pause, E::Resume, E::Stop, E::Finish] {
                let expected = allowed.contains(&(from, event));
                assert_eq!(next_state(from, event).is_some(), expected, "{from} + {event}");
            }
        }
    }

    #[test]
    fn test_completed_rejects_everything() {
        let clock = ManualClock::new();
        let mut session = active_session(&clock);
        session.transition(LifecycleEvent::Finish, &clock).unwrap();

        let err = session.transition(LifecycleEvent::Start, &clock).unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidTransition {
                from: SessionState::Completed,
                event: LifecycleEvent::Start
            }
        );
        assert_eq!(err.to_string(), "cannot start a session that is completed");
        assert_eq!(session.state(), SessionState::Completed);
    }

    #[test]
    fn test_average_and_max_heart_rate() {
        let clock = ManualClock::new();
        let mut session = RunSession::new();
        assert_eq!(session.average_heart_rate(), 0);

        session.transition(LifecycleEvent::Start, &clock).unwrap();
        for hr in [100, 150, 160] {
            assert!(session.record_sample(hr, None));
        }
        assert_eq!(session.average_heart_rate(), 136);
        assert_eq!(session.max_heart_rate(), 160);
        assert_eq!(session.heart_rate_sample_count(), 3);
    }

    #[test]
    fn test_samples_ignored_unless_active() {
        let clock = ManualClock::new();
        let mut session = RunSession::new();
        assert!(!session.record_sample(120, Some(160)));

        session.transition(LifecycleEvent::Start, &clock).unwrap();
        session.transition(LifecycleEvent::Pause, &clock).unwrap();
        assert!(!session.record_sample(200, None));
        assert_eq!(session.max_heart_rate(), 0);
    }

    #[test]
    fn test_cadence_ignores_zero() {
        let clock = ManualClock::new();
        let mut session = active_session(&clock);
        session.record_sample(140, Some(170));
        session.record_sample(142, Some(0));
        session.record_sample(144, Some(174));
        assert_eq!(session.average_cadence(), 172);
        assert_eq!(session.current_cadence(), Some(174));
    }

    #[test]
    fn test_elapsed_excludes_pauses() {
        let clock = ManualClock::new();
        let mut session = active_session(&clock);

        clock.advance(Duration::from_secs(60));
        session.transition(LifecycleEvent::Pause, &clock).unwrap();
        clock.advance(Duration::from_secs(300));
        assert_eq!(session.elapsed(clock.now()), Duration::from_secs(60));

        session.transition(LifecycleEvent::Resume, &clock).unwrap();
        clock.advance(Duration::from_secs(30));
        assert_eq!(session.elapsed(clock.now()), Duration::from_secs(90));

        session.transition(LifecycleEvent::Finish, &clock).unwrap();
        clock.advance(Duration::from_secs(1000));
        assert_eq!(session.metrics(clock.now()).elapsed_seconds, 90.0);
    }

    #[test]
    fn test_history_pop_keeps_ids_in_step() {
        let mut history = PlayHistory::default();
        let entry = |id: &str| PlayHistoryEntry {
            track: track(id),
            started_at: Utc::now(),
            heart_rate_at_start: None,
        };

        history.push(entry("a"));
        history.push(entry("b"));
        history.push(entry("a"));
        assert!(history.is_consistent());

        history.pop();
        assert!(history.contains("a"), "earlier play of a is still in history");
        history.pop();
        history.pop();
        assert!(history.ids().is_empty());
        assert!(history.is_consistent());
        assert!(history.pop().is_none());
    }

    #[test]
    fn test_summary_only_when_finished() {
        let clock = ManualClock::new();
        let mut stopped = active_session(&clock);
        stopped.transition(LifecycleEvent::Stop, &clock).unwrap();
        assert!(stopped.summary().is_none());
        assert!(!stopped.was_finished());

        let mut finished = active_session(&clock);
        finished.set_now_playing(track("a"), clock.utc_now());
        finished.record_sample(150, Some(170));
        clock.advance(Duration::from_secs(120));
        finished.transition(LifecycleEvent::Finish, &clock).unwrap();

        let summary = finished.summary().expect("finished run has a summary");
        assert_eq!(summary.avg_heart_rate, Some(150));
        assert_eq!(summary.avg_cadence, Some(170));
        assert_eq!(summary.elapsed_seconds, 120.0);
        assert_eq!(summary.tracks.len(), 1);
        assert_eq!(summary.tracks[0].track_id, "a");
    }

    #[test]
    fn test_advance_and_rewind() {
        let clock = ManualClock::new();
        let mut session = active_session(&clock);
        session.set_now_playing(track("a"), clock.utc_now());
        session.set_queued_next(Some(track("b")));

        assert_eq!(session.advance(clock.utc_now()).map(|t| t.id), Some("b".to_string()));
        assert!(session.played_track_ids().contains("a"));

        assert_eq!(session.rewind(clock.utc_now()).map(|t| t.id), Some("a".to_string()));
        assert!(!session.played_track_ids().contains("a"));
        assert_eq!(session.queued_next_track().map(|t| t.id.as_str()), Some("b"));
        assert!(session.tracks_played().is_empty());
    }
}
