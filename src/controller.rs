//! # Run Controller
//!
//! The single event loop of a device process. Heart-rate samples, skips,
//! track boundaries and companion messages all arrive as [`RunEvent`]s on
//! one inbox and are applied to the [`RunSession`] one at a time, so a skip
//! and a heart-rate recompute can never interleave.
//!
//! ## Ownership
//!
//! The controller is the only writer of the session. Collaborators (catalog,
//! player, heart-rate source, companion transport) are built by the caller
//! and handed over in [`ControllerParts`], which is how tests swap in fakes.
//!
//! ## Observers
//!
//! [`RunController::subscribe`] hands out a channel of [`SessionEvent`]s.
//! Subscribers whose receiver was dropped are pruned on the next emit.

use crate::companion::{
    wire_timestamp, CompanionCommand, CompanionLink, CompanionMessage, CompanionOutbox,
    CompanionSender, CompanionTransport,
};
use crate::config::PulseConfig;
use crate::heart_rate::{HeartRateSample, HeartRateSource, HeartRateUpdate, HeartRateWindow};
use crate::playback::PlaybackController;
use crate::queue::{EmptyReason, QueueManager, QueueUpdate, SkipOutcome};
use crate::session::{Clock, LifecycleEvent, MetricsSnapshot, RunSession, RunSummary, SessionState};
use crate::track::{Track, TrackCatalog};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long the loop waits for input before running housekeeping.
const TICK: Duration = Duration::from_millis(250);

/// Everything the controller reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Start,
    Pause,
    Resume,
    Stop,
    Finish,
    HeartRate(HeartRateUpdate),
    /// The player confirms a track went on air
    TrackStarted { track_id: String },
    /// The player reports a track played to its end
    TrackFinished { track_id: String },
    SkipForward,
    SkipBackward,
    ToggleBpmLock,
    Companion(CompanionMessage),
    ReachabilityChanged(bool),
    Tick,
    Shutdown,
}

/// What observers are told.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    TrackStarted(Track),
    OnDeckChanged(Option<Track>),
    Metrics(MetricsSnapshot),
    /// The pool is empty; nothing can be played
    NoTracksAvailable,
    BpmLockChanged(Option<u32>),
    /// A skip had nothing to act on
    SkipIgnored,
    /// The heart-rate source went away; scoring holds the last value
    HeartRateDegraded,
}

/// Collaborators handed to [`RunController::new`].
pub struct ControllerParts {
    pub catalog: Box<dyn TrackCatalog>,
    pub playback: Box<dyn PlaybackController>,
    pub heart_rate: Box<dyn HeartRateSource>,
    /// `None` runs without a companion device
    pub companion: Option<Arc<dyn CompanionTransport>>,
    pub clock: Arc<dyn Clock>,
    /// Sender side of the inbox the controller will be run on. The
    /// heart-rate source pushes into it.
    pub inbox: Sender<RunEvent>,
}

struct Companion {
    link: CompanionLink,
    outbox: CompanionOutbox,
}

pub struct RunController {
    session: RunSession,
    queue: QueueManager,
    catalog: Box<dyn TrackCatalog>,
    playback: Box<dyn PlaybackController>,
    heart_rate: Box<dyn HeartRateSource>,
    companion: Option<Companion>,
    clock: Arc<dyn Clock>,
    inbox: Sender<RunEvent>,
    listeners: Vec<Sender<SessionEvent>>,
    window: HeartRateWindow,
    bpm_lock: Option<u32>,
    lock_interval: Duration,
    last_lock_broadcast: Option<Instant>,
    degraded: bool,
}

impl RunController {
    #[must_use]
    pub fn new(config: &PulseConfig, parts: ControllerParts) -> Self {
        let role = config.companion.role;
        let companion = parts.companion.map(|transport| Companion {
            link: CompanionLink::new(role, Arc::clone(&transport)),
            outbox: CompanionOutbox::spawn(CompanionSender::new(role, transport)),
        });

        Self {
            session: RunSession::new(),
            queue: QueueManager::new(config.scoring.clone(), config.queue.clone()),
            catalog: parts.catalog,
            playback: parts.playback,
            heart_rate: parts.heart_rate,
            companion,
            clock: parts.clock,
            inbox: parts.inbox,
            listeners: Vec::new(),
            window: HeartRateWindow::default(),
            bpm_lock: None,
            lock_interval: Duration::from_secs(config.companion.lock_broadcast_interval_secs.max(1)),
            last_lock_broadcast: None,
            degraded: false,
        }
    }

    /// A fresh inbox for [`ControllerParts::inbox`] and [`run`](Self::run).
    #[must_use]
    pub fn channel() -> (Sender<RunEvent>, Receiver<RunEvent>) {
        mpsc::channel()
    }

    #[must_use]
    pub fn session(&self) -> &RunSession {
        &self.session
    }

    #[must_use]
    pub fn bpm_lock(&self) -> Option<u32> {
        self.bpm_lock
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.session.metrics(self.clock.now())
    }

    #[must_use]
    pub fn summary(&self) -> Option<RunSummary> {
        self.session.summary()
    }

    /// Register an observer.
    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        self.listeners.push(tx);
        rx
    }

    /// Wait until every companion message posted so far was handled.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox worker is gone.
    pub fn flush_companion(&self) -> Result<()> {
        match &self.companion {
            Some(companion) => companion.outbox.flush(),
            None => Ok(()),
        }
    }

    /// Drain `events` until the run completes or [`RunEvent::Shutdown`]
    /// arrives. Errors from individual events are logged and the loop keeps
    /// going.
    ///
    /// A completed run keeps the loop alive while the companion has not yet
    /// received the final state, so a reconnect can still deliver it.
    pub fn run(&mut self, events: &Receiver<RunEvent>) {
        info!("Run controller started");
        let mut holding = false;
        loop {
            let event = match events.recv_timeout(TICK) {
                Ok(RunEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => RunEvent::Tick,
            };

            if let Err(e) = self.handle(event) {
                warn!("{e:#}");
            }
            if self.session.state() == SessionState::Completed {
                if !self.final_state_pending() {
                    break;
                }
                if !holding {
                    info!("Run over, waiting for the companion to take the final state");
                    holding = true;
                }
            }
        }

        if let Err(e) = self.flush_companion() {
            error!("Failed to flush companion outbox: {e:#}");
        }
        info!("Run controller stopped");
    }

    fn final_state_pending(&self) -> bool {
        let Some(companion) = &self.companion else {
            return false;
        };
        match companion.outbox.flush() {
            Ok(()) => companion.outbox.has_backlog(),
            Err(e) => {
                error!("Failed to flush companion outbox: {e:#}");
                false
            }
        }
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns an error for lifecycle events the session rejects and for
    /// playback failures. Companion failures are logged, never returned.
    pub fn handle(&mut self, event: RunEvent) -> Result<()> {
        match event {
            RunEvent::Start => self.start(),
            RunEvent::Pause => self.pause(),
            RunEvent::Resume => self.resume(),
            RunEvent::Stop => self.end(LifecycleEvent::Stop),
            RunEvent::Finish => self.end(LifecycleEvent::Finish),
            RunEvent::HeartRate(HeartRateUpdate::Sample(sample)) => {
                self.ingest_sample(sample, true);
                Ok(())
            }
            RunEvent::HeartRate(HeartRateUpdate::SourceLost) => {
                self.on_source_lost();
                Ok(())
            }
            RunEvent::TrackStarted { track_id } => {
                if self.is_playing(&track_id) {
                    debug!("Track {track_id} confirmed on air");
                } else {
                    debug!("Ignoring start notification for {track_id}: not the playing track");
                }
                Ok(())
            }
            RunEvent::TrackFinished { track_id } => {
                if !self.is_playing(&track_id) {
                    debug!("Ignoring end notification for {track_id}: not the playing track");
                    return Ok(());
                }
                self.advance(false)
            }
            RunEvent::SkipForward => self.advance(true),
            RunEvent::SkipBackward => self.rewind(),
            RunEvent::ToggleBpmLock => {
                self.toggle_bpm_lock();
                Ok(())
            }
            RunEvent::Companion(message) => {
                let accepted = self.companion.as_mut().and_then(|c| c.link.accept(message));
                match accepted {
                    Some(message) => self.apply_companion(message),
                    None => Ok(()),
                }
            }
            RunEvent::ReachabilityChanged(reachable) => self.on_reachability_changed(reachable),
            RunEvent::Tick => {
                self.on_tick();
                Ok(())
            }
            RunEvent::Shutdown => Ok(()),
        }
    }

    fn start(&mut self) -> Result<()> {
        self.transition(LifecycleEvent::Start)?;

        let inbox = self.inbox.clone();
        let subscribed = self.heart_rate.subscribe(Box::new(move |update| {
            let _ = inbox.send(RunEvent::HeartRate(update));
        }));
        if let Err(e) = subscribed {
            warn!("Heart-rate source unavailable, scoring from defaults: {e:#}");
            self.degraded = true;
            self.emit(SessionEvent::HeartRateDegraded);
        }

        let pool = self.catalog.tracks_in_active_pool();
        let target = self.target();
        match self.queue.begin(&mut self.session, &pool, target, self.clock.as_ref()) {
            SkipOutcome::Advanced { playing, on_deck } => {
                self.playback
                    .play(&playing)
                    .with_context(|| format!("Failed to play {}", playing.display_name()))?;
                self.emit(SessionEvent::TrackStarted(playing));
                self.emit(SessionEvent::OnDeckChanged(on_deck));
            }
            SkipOutcome::NothingQueued(_) => {
                warn!("No tracks available for this run");
                self.emit(SessionEvent::NoTracksAvailable);
            }
            other => debug!("Unexpected opening outcome: {other:?}"),
        }
        self.broadcast_lock();
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.transition(LifecycleEvent::Pause)?;
        self.playback.pause().context("Failed to pause playback")
    }

    fn resume(&mut self) -> Result<()> {
        self.transition(LifecycleEvent::Resume)?;
        self.playback.resume().context("Failed to resume playback")
    }

    /// Stop or finish: no more samples, no more recomputes, no pending
    /// companion traffic except the final state.
    fn end(&mut self, event: LifecycleEvent) -> Result<()> {
        let state = self.session.transition(event, self.clock.as_ref())?;
        self.heart_rate.unsubscribe();
        if let Some(companion) = &self.companion {
            companion.outbox.cancel_pending();
        }
        self.emit(SessionEvent::StateChanged(state));
        self.broadcast_state();
        self.emit(SessionEvent::Metrics(self.metrics()));
        self.playback.stop().context("Failed to stop playback")
    }

    fn transition(&mut self, event: LifecycleEvent) -> Result<()> {
        let state = self.session.transition(event, self.clock.as_ref())?;
        self.emit(SessionEvent::StateChanged(state));
        self.broadcast_state();
        Ok(())
    }

    fn is_playing(&self, track_id: &str) -> bool {
        self.session.now_playing().is_some_and(|t| t.id == track_id)
    }

    /// Tempo the queue scores against: the lock, else the latest heart rate,
    /// else the configured starting value.
    fn target(&self) -> u32 {
        self.bpm_lock
            .unwrap_or_else(|| self.queue.fallback_target(&self.session))
    }

    fn ingest_sample(&mut self, sample: HeartRateSample, forward: bool) {
        if self.degraded {
            info!("Heart-rate source is back");
            self.degraded = false;
        }
        if !self.session.record_sample(sample.bpm, sample.cadence) {
            return;
        }
        self.window.push(self.clock.now(), sample.bpm);
        if let Some(trend) = self.window.rate_of_change() {
            debug!("Heart rate {} ({trend:+.2} bpm/s)", sample.bpm);
        }

        if forward {
            self.post(CompanionMessage::HeartRate {
                bpm: sample.bpm,
                cadence: sample.cadence.unwrap_or(0),
                timestamp: wire_timestamp(self.clock.utc_now()),
            });
        }

        if self.bpm_lock.is_none() {
            let pool = self.catalog.tracks_in_active_pool();
            let update =
                self.queue
                    .on_heart_rate(&mut self.session, &pool, sample.bpm, self.clock.as_ref());
            self.report_queue_update(update);
        }
        self.emit(SessionEvent::Metrics(self.metrics()));
    }

    fn on_source_lost(&mut self) {
        if self.degraded {
            return;
        }
        self.degraded = true;
        match self.session.current_heart_rate() {
            Some(bpm) => warn!("Heart-rate source lost, holding {bpm} bpm"),
            None => warn!("Heart-rate source lost before the first sample"),
        }
        self.emit(SessionEvent::HeartRateDegraded);
    }

    fn report_queue_update(&mut self, update: QueueUpdate) {
        match update {
            QueueUpdate::OnDeck { track, changed: true } => {
                self.emit(SessionEvent::OnDeckChanged(Some(track)));
            }
            QueueUpdate::Cleared(reason) => {
                self.emit(SessionEvent::OnDeckChanged(None));
                if reason == EmptyReason::PoolEmpty {
                    self.emit(SessionEvent::NoTracksAvailable);
                }
            }
            _ => {}
        }
    }

    /// Natural end (`skip == false`) or skip forward.
    fn advance(&mut self, skip: bool) -> Result<()> {
        let pool = self.catalog.tracks_in_active_pool();
        let target = self.target();
        let clock = self.clock.as_ref();
        let outcome = if skip {
            self.queue.advance(&mut self.session, &pool, target, clock)
        } else {
            self.queue.track_ended(&mut self.session, &pool, target, clock)
        };
        match outcome {
            SkipOutcome::Advanced { playing, on_deck } => {
                let played = if skip {
                    self.playback.skip_next(&playing)
                } else {
                    self.playback.play(&playing)
                };
                played.with_context(|| format!("Failed to play {}", playing.display_name()))?;
                self.hold_if_paused()?;
                self.emit(SessionEvent::TrackStarted(playing));
                self.emit(SessionEvent::OnDeckChanged(on_deck));
            }
            SkipOutcome::NothingQueued(reason) => {
                info!("Nothing to play next");
                if reason == EmptyReason::PoolEmpty {
                    self.emit(SessionEvent::NoTracksAvailable);
                }
                if skip {
                    self.emit(SessionEvent::SkipIgnored);
                }
            }
            _ => {
                debug!("Advance ignored: session is {}", self.session.state());
                if skip {
                    self.emit(SessionEvent::SkipIgnored);
                }
            }
        }
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        let pool = self.catalog.tracks_in_active_pool();
        let target = self.target();
        match self.queue.rewind(&mut self.session, &pool, target, self.clock.as_ref()) {
            SkipOutcome::Rewound { playing, on_deck } => {
                self.playback
                    .skip_previous(&playing)
                    .with_context(|| format!("Failed to play {}", playing.display_name()))?;
                self.hold_if_paused()?;
                self.emit(SessionEvent::TrackStarted(playing));
                self.emit(SessionEvent::OnDeckChanged(on_deck));
            }
            _ => self.emit(SessionEvent::SkipIgnored),
        }
        Ok(())
    }

    /// A track changed while the run is paused is loaded but stays silent.
    fn hold_if_paused(&mut self) -> Result<()> {
        if self.session.state() == SessionState::Paused {
            debug!("Run is paused, holding the new track");
            self.playback.pause().context("Failed to pause playback")?;
        }
        Ok(())
    }

    /// Lock scoring to the current target, or release the lock.
    pub fn toggle_bpm_lock(&mut self) {
        self.bpm_lock = match self.bpm_lock {
            Some(_) => None,
            None => Some(self.queue.fallback_target(&self.session)),
        };
        match self.bpm_lock {
            Some(bpm) => info!("Tempo locked at {bpm} bpm"),
            None => info!("Tempo lock released"),
        }

        let pool = self.catalog.tracks_in_active_pool();
        let target = self.target();
        let update = self.queue.refresh(&mut self.session, &pool, target, self.clock.as_ref());
        self.report_queue_update(update);

        self.emit(SessionEvent::BpmLockChanged(self.bpm_lock));
        self.broadcast_lock();
    }

    fn apply_companion(&mut self, message: CompanionMessage) -> Result<()> {
        match message {
            CompanionMessage::HeartRate { bpm, cadence, .. } => {
                let sample = HeartRateSample::new(bpm);
                let sample = if cadence > 0 { sample.with_cadence(cadence) } else { sample };
                self.ingest_sample(sample, false);
                Ok(())
            }
            CompanionMessage::WorkoutRequest { .. } => {
                if self.session.state() == SessionState::NotStarted {
                    info!("Starting run at companion's request");
                    self.start()
                } else {
                    debug!("Ignoring start request: session is {}", self.session.state());
                    Ok(())
                }
            }
            CompanionMessage::WorkoutState {
                is_active,
                is_paused,
                was_finished,
                ..
            } => self.follow_companion_state(is_active, is_paused, was_finished),
            CompanionMessage::Command { action, .. } => match CompanionCommand::parse(&action) {
                Some(command) => self.apply_command(command),
                None => {
                    warn!("Ignoring unknown companion command: {action}");
                    Ok(())
                }
            },
            CompanionMessage::BpmLockState { is_locked, .. } => {
                debug!("Companion reports lock {is_locked}; this side owns the lock");
                Ok(())
            }
        }
    }

    fn apply_command(&mut self, command: CompanionCommand) -> Result<()> {
        debug!("Companion command: {}", command.action());
        let event = match command {
            CompanionCommand::Pause => RunEvent::Pause,
            CompanionCommand::Resume => RunEvent::Resume,
            CompanionCommand::Stop => RunEvent::Stop,
            CompanionCommand::Finish => RunEvent::Finish,
            CompanionCommand::SkipNext => RunEvent::SkipForward,
            CompanionCommand::SkipPrevious => RunEvent::SkipBackward,
            CompanionCommand::ToggleBpmLock => RunEvent::ToggleBpmLock,
        };
        self.handle(event)
    }

    /// Mirror a lifecycle change made on the companion. Only transitions
    /// the table allows are applied; anything else is already in sync.
    fn follow_companion_state(&mut self, is_active: bool, is_paused: bool, was_finished: bool) -> Result<()> {
        let state = self.session.state();
        let event = match (state, is_active, is_paused) {
            (SessionState::Active, true, true) => Some(LifecycleEvent::Pause),
            (SessionState::Paused, true, false) => Some(LifecycleEvent::Resume),
            (SessionState::Active | SessionState::Paused, false, _) => Some(if was_finished {
                LifecycleEvent::Finish
            } else {
                LifecycleEvent::Stop
            }),
            _ => None,
        };

        match event {
            Some(LifecycleEvent::Pause) => self.pause(),
            Some(LifecycleEvent::Resume) => self.resume(),
            Some(end @ (LifecycleEvent::Stop | LifecycleEvent::Finish)) => self.end(end),
            _ => Ok(()),
        }
    }

    fn on_reachability_changed(&mut self, reachable: bool) -> Result<()> {
        let pending = match self.companion.as_mut() {
            Some(companion) => companion.link.on_reachability_changed(reachable),
            None => return Ok(()),
        };
        if !reachable {
            return Ok(());
        }

        if self.session.state() != SessionState::NotStarted {
            self.broadcast_state();
            self.broadcast_lock();
        }
        match pending {
            Some(message) => self.apply_companion(message),
            None => Ok(()),
        }
    }

    fn on_tick(&mut self) {
        if !matches!(self.session.state(), SessionState::Active | SessionState::Paused) {
            return;
        }
        let due = self
            .last_lock_broadcast
            .map_or(true, |at| self.clock.now().saturating_duration_since(at) >= self.lock_interval);
        if due {
            self.broadcast_lock();
        }
    }

    fn broadcast_state(&self) {
        let state = self.session.state();
        self.post(CompanionMessage::WorkoutState {
            is_active: matches!(state, SessionState::Active | SessionState::Paused),
            is_paused: state == SessionState::Paused,
            was_finished: state == SessionState::Completed && self.session.was_finished(),
            timestamp: wire_timestamp(self.clock.utc_now()),
        });
    }

    fn broadcast_lock(&mut self) {
        self.last_lock_broadcast = Some(self.clock.now());
        self.post(CompanionMessage::BpmLockState {
            is_locked: self.bpm_lock.is_some(),
            locked_value: self.bpm_lock,
        });
    }

    /// Fire and forget.
    fn post(&self, message: CompanionMessage) {
        if let Some(companion) = &self.companion {
            companion.outbox.post(message);
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Drop for RunController {
    fn drop(&mut self) {
        self.heart_rate.unsubscribe();
    }
}
