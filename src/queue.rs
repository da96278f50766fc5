//! # Queue Manager
//!
//! Owns the single on-deck slot of a run and decides when to recompute it.
//! The playing track is never replaced because heart rate moved; only the
//! on-deck track is.
//!
//! ## Recompute triggers
//!
//! - heart rate moved by more than `deadband` BPM since the last scoring,
//!   and at least `min_recompute_interval_ms` passed since the last one
//! - the playing track ended
//! - an explicit skip forward or backward
//!
//! Each operation takes `&mut RunSession`, so a skip and a heart-rate
//! recompute can never interleave: the controller applies them one after
//! the other.

use crate::algorithm::{self, ScoringContext, Selection};
use crate::session::{Clock, RunSession, SessionState};
use crate::track::Track;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Queue tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// Heart-rate changes of this many BPM or less do not trigger a recompute
    pub deadband: u32,
    /// Minimum spacing between heart-rate triggered recomputes
    pub min_recompute_interval_ms: u64,
    /// Heart rate used for scoring before the first sample arrives
    pub initial_heart_rate: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            deadband: 5,
            min_recompute_interval_ms: 3_000,
            initial_heart_rate: 100,
        }
    }
}

/// Why there is nothing on deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    /// Only the playing track is in the pool
    NoCandidates,
    /// The pool has no tracks at all
    PoolEmpty,
}

/// Outcome of a heart-rate driven or forced on-deck refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueUpdate {
    OnDeck { track: Track, changed: bool },
    Cleared(EmptyReason),
    WithinDeadband,
    Throttled,
    /// The session is not accepting queue changes
    Inactive,
}

/// Outcome of a track boundary or skip.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipOutcome {
    Advanced {
        playing: Track,
        on_deck: Option<Track>,
    },
    Rewound {
        playing: Track,
        on_deck: Option<Track>,
    },
    /// Nothing could be put on air; playback is left as it was
    NothingQueued(EmptyReason),
    /// Skip backward with empty history. Informational, not an error.
    NoHistory,
    Inactive,
}

#[derive(Debug, Clone)]
pub struct QueueManager {
    scoring: ScoringContext,
    config: QueueConfig,
    last_target: Option<u32>,
    last_recompute: Option<Instant>,
}

impl QueueManager {
    #[must_use]
    pub fn new(scoring: ScoringContext, config: QueueConfig) -> Self {
        Self {
            scoring,
            config,
            last_target: None,
            last_recompute: None,
        }
    }

    #[must_use]
    pub fn scoring(&self) -> &ScoringContext {
        &self.scoring
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Tempo to score against when no explicit target is known.
    #[must_use]
    pub fn fallback_target(&self, session: &RunSession) -> u32 {
        session
            .current_heart_rate()
            .unwrap_or(self.config.initial_heart_rate)
    }

    /// Put the first track on air and fill the on-deck slot.
    pub fn begin(
        &mut self,
        session: &mut RunSession,
        pool: &[Track],
        target: u32,
        clock: &dyn Clock,
    ) -> SkipOutcome {
        if !accepts_changes(session) {
            return SkipOutcome::Inactive;
        }

        let first = algorithm::select_next_track(
            pool,
            None,
            target,
            session.tracks_played(),
            &self.scoring,
        );
        let Some(track) = first.into_track() else {
            return SkipOutcome::NothingQueued(EmptyReason::PoolEmpty);
        };

        info!("Opening track: {}", track.display_name());
        session.set_now_playing(track.clone(), clock.utc_now());
        let on_deck = self.refresh(session, pool, target, clock).on_deck();
        SkipOutcome::Advanced {
            playing: track,
            on_deck,
        }
    }

    /// Heart-rate trigger. Recomputes only past the deadband and the minimum
    /// interval.
    pub fn on_heart_rate(
        &mut self,
        session: &mut RunSession,
        pool: &[Track],
        target: u32,
        clock: &dyn Clock,
    ) -> QueueUpdate {
        if session.state() != SessionState::Active {
            return QueueUpdate::Inactive;
        }

        if let Some(last) = self.last_target {
            if target.abs_diff(last) <= self.config.deadband {
                return QueueUpdate::WithinDeadband;
            }
        }

        let now = clock.now();
        if let Some(at) = self.last_recompute {
            let min = Duration::from_millis(self.config.min_recompute_interval_ms);
            if now.saturating_duration_since(at) < min {
                debug!("Recompute throttled at target {target}");
                return QueueUpdate::Throttled;
            }
        }

        self.refresh(session, pool, target, clock)
    }

    /// Recompute the on-deck slot unconditionally.
    pub fn refresh(
        &mut self,
        session: &mut RunSession,
        pool: &[Track],
        target: u32,
        clock: &dyn Clock,
    ) -> QueueUpdate {
        if !accepts_changes(session) {
            return QueueUpdate::Inactive;
        }

        self.last_target = Some(target);
        self.last_recompute = Some(clock.now());

        let playing_id = session.now_playing().map(|t| t.id.clone());
        let selection = algorithm::select_next_track(
            pool,
            playing_id.as_deref(),
            target,
            session.tracks_played(),
            &self.scoring,
        );

        match selection {
            Selection::Picked { track, score, relaxed } => {
                let changed = session.queued_next_track().map(|t| t.id.as_str()) != Some(track.id.as_str());
                if changed {
                    debug!(
                        "On deck: {} (score {score:.3}, target {target}{})",
                        track.display_name(),
                        if relaxed { ", relaxed" } else { "" }
                    );
                }
                session.set_queued_next(Some(track.clone()));
                QueueUpdate::OnDeck { track, changed }
            }
            Selection::NoCandidates => {
                session.set_queued_next(None);
                QueueUpdate::Cleared(EmptyReason::NoCandidates)
            }
            Selection::PoolEmpty => {
                session.set_queued_next(None);
                QueueUpdate::Cleared(EmptyReason::PoolEmpty)
            }
        }
    }

    /// Natural end of the playing track, or skip forward: the on-deck track
    /// goes on air, the outgoing track joins history, and a new on-deck track
    /// is scored.
    pub fn advance(
        &mut self,
        session: &mut RunSession,
        pool: &[Track],
        target: u32,
        clock: &dyn Clock,
    ) -> SkipOutcome {
        if !accepts_changes(session) {
            return SkipOutcome::Inactive;
        }

        if session.queued_next_track().is_none() {
            if let QueueUpdate::Cleared(reason) = self.refresh(session, pool, target, clock) {
                return SkipOutcome::NothingQueued(reason);
            }
        }

        let Some(playing) = session.advance(clock.utc_now()) else {
            return SkipOutcome::NothingQueued(EmptyReason::NoCandidates);
        };
        let on_deck = self.refresh(session, pool, target, clock).on_deck();
        SkipOutcome::Advanced { playing, on_deck }
    }

    /// Natural end of the playing track. Same as [`advance`](Self::advance),
    /// except that a pool holding nothing but the finished track plays it
    /// again instead of falling silent.
    pub fn track_ended(
        &mut self,
        session: &mut RunSession,
        pool: &[Track],
        target: u32,
        clock: &dyn Clock,
    ) -> SkipOutcome {
        let outcome = self.advance(session, pool, target, clock);
        if outcome != SkipOutcome::NothingQueued(EmptyReason::NoCandidates) {
            return outcome;
        }

        let replay = algorithm::select_next_track(pool, None, target, session.tracks_played(), &self.scoring);
        let Some(track) = replay.into_track() else {
            return SkipOutcome::NothingQueued(EmptyReason::PoolEmpty);
        };
        info!("Only {} left to play, playing it again", track.display_name());
        session.set_queued_next(Some(track));
        let Some(playing) = session.advance(clock.utc_now()) else {
            return outcome;
        };
        let on_deck = self.refresh(session, pool, target, clock).on_deck();
        SkipOutcome::Advanced { playing, on_deck }
    }

    /// Skip backward: the last played track goes back on air and leaves
    /// history; the interrupted track is not counted as played.
    pub fn rewind(
        &mut self,
        session: &mut RunSession,
        pool: &[Track],
        target: u32,
        clock: &dyn Clock,
    ) -> SkipOutcome {
        if !accepts_changes(session) {
            return SkipOutcome::Inactive;
        }

        let Some(playing) = session.rewind(clock.utc_now()) else {
            info!("Skip backward ignored: nothing played yet");
            return SkipOutcome::NoHistory;
        };
        let on_deck = match self.refresh(session, pool, target, clock) {
            QueueUpdate::OnDeck { track, .. } => Some(track),
            _ => session.queued_next_track().cloned(),
        };
        SkipOutcome::Rewound { playing, on_deck }
    }
}

impl QueueUpdate {
    fn on_deck(self) -> Option<Track> {
        match self {
            Self::OnDeck { track, .. } => Some(track),
            _ => None,
        }
    }
}

fn accepts_changes(session: &RunSession) -> bool {
    matches!(session.state(), SessionState::Active | SessionState::Paused)
}
