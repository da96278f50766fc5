//! # Companion Sync
//!
//! Mirrors run lifecycle and heart-rate telemetry between the phone (the
//! session and queue authority) and the watch (the telemetry source).
//!
//! ## Delivery tiers
//!
//! 1. Direct message, only while the peer is reachable. At most once and
//!    best effort: failures are logged, never retried.
//! 2. Durable snapshot, a single latest-wins slot both sides can read after
//!    reconnecting. A start request that could not go direct is written
//!    here. Lifecycle state is held by the [`CompanionOutbox`] and retried
//!    until the peer is back; only the latest state is kept.
//!
//! After reachability returns the receiving side must call
//! [`CompanionLink::check_pending_snapshot`] so a start request made while
//! the link was down is not lost.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often the outbox retries lifecycle state the peer has not seen.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Which end of the link this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Phone,
    Watch,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Phone => "phone",
            Self::Watch => "watch",
        })
    }
}

/// Link tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompanionConfig {
    /// This process's end of the link
    pub role: DeviceRole,
    /// How often the lock state is re-broadcast during a run
    pub lock_broadcast_interval_secs: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            role: DeviceRole::Phone,
            lock_broadcast_interval_secs: 10,
        }
    }
}

impl DeviceRole {
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Phone => Self::Watch,
            Self::Watch => Self::Phone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkoutAction {
    Start,
}

/// Everything that crosses the link. Serialised as internally tagged JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CompanionMessage {
    #[serde(rename_all = "camelCase")]
    HeartRate {
        bpm: u32,
        /// Steps per minute, 0 when the sensor has none
        #[serde(default)]
        cadence: u32,
        timestamp: f64,
    },
    #[serde(rename_all = "camelCase")]
    WorkoutState {
        is_active: bool,
        is_paused: bool,
        was_finished: bool,
        timestamp: f64,
    },
    #[serde(rename_all = "camelCase")]
    WorkoutRequest { action: WorkoutAction, timestamp: f64 },
    #[serde(rename_all = "camelCase")]
    Command { action: String, timestamp: f64 },
    #[serde(rename_all = "camelCase")]
    BpmLockState {
        is_locked: bool,
        locked_value: Option<u32>,
    },
}

impl CompanionMessage {
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to encode companion message")
    }

    /// # Errors
    ///
    /// Returns an error on malformed JSON or an unknown `type`.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to decode companion message")
    }

    /// State that must eventually reach the peer.
    #[must_use]
    pub const fn is_lifecycle_critical(&self) -> bool {
        matches!(self, Self::WorkoutRequest { .. } | Self::WorkoutState { .. })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::HeartRate { .. } => "heartRate",
            Self::WorkoutState { .. } => "workoutState",
            Self::WorkoutRequest { .. } => "workoutRequest",
            Self::Command { .. } => "command",
            Self::BpmLockState { .. } => "bpmLockState",
        }
    }

    #[must_use]
    pub fn start_request(timestamp: f64) -> Self {
        Self::WorkoutRequest {
            action: WorkoutAction::Start,
            timestamp,
        }
    }
}

/// Remote commands the phone acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionCommand {
    Pause,
    Resume,
    Stop,
    Finish,
    SkipNext,
    SkipPrevious,
    ToggleBpmLock,
}

impl CompanionCommand {
    /// `None` for actions this build does not know.
    #[must_use]
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "stop" => Some(Self::Stop),
            "finish" => Some(Self::Finish),
            "skipNext" => Some(Self::SkipNext),
            "skipPrevious" => Some(Self::SkipPrevious),
            "toggleBpmLock" => Some(Self::ToggleBpmLock),
            _ => None,
        }
    }

    #[must_use]
    pub const fn action(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Finish => "finish",
            Self::SkipNext => "skipNext",
            Self::SkipPrevious => "skipPrevious",
            Self::ToggleBpmLock => "toggleBpmLock",
        }
    }

    #[must_use]
    pub fn message(self, timestamp: f64) -> CompanionMessage {
        CompanionMessage::Command {
            action: self.action().to_string(),
            timestamp,
        }
    }
}

/// Latest-wins fallback slot. Overwritten whole on every write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableSnapshot {
    pub pending_workout_request: bool,
    pub source: DeviceRole,
    pub request_timestamp: f64,
}

/// Seconds since the Unix epoch, the wire timestamp format.
#[must_use]
pub fn wire_timestamp(at: DateTime<Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let millis = at.timestamp_millis() as f64;
    millis / 1000.0
}

/// Wire timestamps are compared at millisecond resolution.
fn same_instant(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.000_5
}

/// Physical link between the two devices.
pub trait CompanionTransport: Send + Sync {
    fn is_reachable(&self) -> bool;

    /// # Errors
    ///
    /// Returns an error when the message could not be handed to the peer.
    fn send_message(&self, message: &CompanionMessage) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error when the slot cannot be written.
    fn write_snapshot(&self, snapshot: DurableSnapshot) -> Result<()>;

    /// # Errors
    ///
    /// Returns an error when the slot cannot be read.
    fn read_snapshot(&self) -> Result<Option<DurableSnapshot>>;
}

/// What happened to an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    /// Went through the durable snapshot
    Snapshot,
    /// Lifecycle state that could not go direct; re-sent after reconnect
    Deferred,
    /// Telemetry or commands with no reachable peer
    Dropped,
    /// The snapshot write itself failed
    Failed,
}

/// Sending half. Stateless apart from the transport, so it is cheap to clone
/// into the outbox worker.
#[derive(Clone)]
pub struct CompanionSender {
    role: DeviceRole,
    transport: Arc<dyn CompanionTransport>,
}

impl CompanionSender {
    #[must_use]
    pub fn new(role: DeviceRole, transport: Arc<dyn CompanionTransport>) -> Self {
        Self { role, transport }
    }

    #[must_use]
    pub fn role(&self) -> DeviceRole {
        self.role
    }

    #[must_use]
    pub fn peer_reachable(&self) -> bool {
        self.transport.is_reachable()
    }

    /// Deliver `message` using the best tier available. Never fails; the
    /// result says which tier was used.
    pub fn deliver(&self, message: &CompanionMessage) -> Delivery {
        if self.transport.is_reachable() {
            match self.transport.send_message(message) {
                Ok(()) => return Delivery::Direct,
                Err(e) => log::warn!("Direct {} send failed: {e:#}", message.kind()),
            }
        }

        match message {
            CompanionMessage::WorkoutRequest { timestamp, .. } => {
                let snapshot = DurableSnapshot {
                    pending_workout_request: true,
                    source: self.role,
                    request_timestamp: *timestamp,
                };
                match self.transport.write_snapshot(snapshot) {
                    Ok(()) => {
                        log::info!("Workout request left in durable snapshot");
                        Delivery::Snapshot
                    }
                    Err(e) => {
                        log::error!("Failed to write durable snapshot: {e:#}");
                        Delivery::Failed
                    }
                }
            }
            // The snapshot only carries start requests; state is re-sent
            // by the owner once the peer is back.
            _ if message.is_lifecycle_critical() => {
                log::info!("Deferring {} until the peer is reachable", message.kind());
                Delivery::Deferred
            }
            _ => {
                log::debug!("Peer unreachable, dropping {}", message.kind());
                Delivery::Dropped
            }
        }
    }
}

/// Receiving half: de-duplicates start requests and re-checks the durable
/// snapshot whenever the peer becomes reachable.
pub struct CompanionLink {
    role: DeviceRole,
    transport: Arc<dyn CompanionTransport>,
    reachable: bool,
    last_request: Option<f64>,
}

impl CompanionLink {
    #[must_use]
    pub fn new(role: DeviceRole, transport: Arc<dyn CompanionTransport>) -> Self {
        let reachable = transport.is_reachable();
        Self {
            role,
            transport,
            reachable,
            last_request: None,
        }
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Filter an inbound message. Returns `None` for a start request already
    /// seen, whichever tier it came through.
    pub fn accept(&mut self, message: CompanionMessage) -> Option<CompanionMessage> {
        if let CompanionMessage::WorkoutRequest { timestamp, .. } = message {
            if self.last_request.is_some_and(|seen| same_instant(seen, timestamp)) {
                log::debug!("Ignoring repeated workout request");
                return None;
            }
            self.last_request = Some(timestamp);
        }
        Some(message)
    }

    /// Track a reachability change. On becoming reachable the snapshot is
    /// re-read; a pending request found there is returned.
    pub fn on_reachability_changed(&mut self, reachable: bool) -> Option<CompanionMessage> {
        let was = std::mem::replace(&mut self.reachable, reachable);
        if reachable && !was {
            log::info!("Companion reachable again");
        } else if !reachable && was {
            log::info!("Companion unreachable");
        }

        if reachable {
            match self.check_pending_snapshot() {
                Ok(pending) => pending,
                Err(e) => {
                    log::warn!("Could not read durable snapshot: {e:#}");
                    None
                }
            }
        } else {
            None
        }
    }

    /// Consume a start request the peer left in the snapshot. The slot is
    /// cleared so the request fires once.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read or cleared.
    pub fn check_pending_snapshot(&mut self) -> Result<Option<CompanionMessage>> {
        let Some(snapshot) = self.transport.read_snapshot()? else {
            return Ok(None);
        };
        if !snapshot.pending_workout_request || snapshot.source == self.role {
            return Ok(None);
        }

        self.transport
            .write_snapshot(DurableSnapshot {
                pending_workout_request: false,
                ..snapshot
            })
            .context("Failed to clear consumed workout request")?;

        log::info!("Picked up workout request from {} via snapshot", snapshot.source);
        Ok(self.accept(CompanionMessage::start_request(snapshot.request_timestamp)))
    }
}

enum Outbound {
    Message { message: CompanionMessage, generation: u64 },
    Flush(Sender<()>),
    Shutdown,
}

/// Latest workout state the peer has not received, with the generation it
/// was posted under.
struct HeldState {
    slot: Option<(CompanionMessage, u64)>,
    backlog: Arc<AtomicBool>,
}

impl HeldState {
    fn hold(&mut self, message: CompanionMessage, generation: u64) {
        self.slot = Some((message, generation));
        self.backlog.store(true, Ordering::SeqCst);
    }

    fn clear(&mut self) {
        self.slot = None;
        self.backlog.store(false, Ordering::SeqCst);
    }

    fn retry(&mut self, sender: &CompanionSender, current: u64) {
        let Some((message, generation)) = &self.slot else {
            return;
        };
        if *generation < current {
            log::debug!("Dropping cancelled held {}", message.kind());
            self.clear();
            return;
        }
        if sender.peer_reachable() && sender.deliver(message) == Delivery::Direct {
            log::info!("Delivered held {} after reconnect", message.kind());
            self.clear();
        }
    }
}

/// Background worker that performs sends, so neither scoring nor the
/// controller loop waits on the link.
///
/// A workout state that had to be deferred is held and retried every
/// [`RETRY_INTERVAL`] until it goes direct, a newer state replaces it, or it
/// is cancelled.
pub struct CompanionOutbox {
    tx: Sender<Outbound>,
    generation: Arc<AtomicU64>,
    backlog: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CompanionOutbox {
    #[must_use]
    pub fn spawn(sender: CompanionSender) -> Self {
        let (tx, rx) = mpsc::channel::<Outbound>();
        let generation = Arc::new(AtomicU64::new(0));
        let backlog = Arc::new(AtomicBool::new(false));
        let current = Arc::clone(&generation);
        let mut held = HeldState {
            slot: None,
            backlog: Arc::clone(&backlog),
        };

        let worker = thread::spawn(move || loop {
            let outbound = match rx.recv_timeout(RETRY_INTERVAL) {
                Ok(outbound) => Some(outbound),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            held.retry(&sender, current.load(Ordering::SeqCst));

            match outbound {
                Some(Outbound::Message { message, generation }) => {
                    if generation < current.load(Ordering::SeqCst) {
                        log::debug!("Dropping cancelled {}", message.kind());
                        continue;
                    }
                    let delivery = sender.deliver(&message);
                    if matches!(message, CompanionMessage::WorkoutState { .. }) {
                        match delivery {
                            Delivery::Deferred => held.hold(message, generation),
                            Delivery::Direct => held.clear(),
                            _ => {}
                        }
                    }
                }
                Some(Outbound::Flush(ack)) => {
                    let _ = ack.send(());
                }
                Some(Outbound::Shutdown) => break,
                None => {}
            }
        });

        Self {
            tx,
            generation,
            backlog,
            worker: Some(worker),
        }
    }

    /// True while a workout state is waiting for the peer. Only settled
    /// after a [`flush`](Self::flush).
    #[must_use]
    pub fn has_backlog(&self) -> bool {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Queue a message. Returns immediately.
    pub fn post(&self, message: CompanionMessage) {
        let generation = self.generation.load(Ordering::SeqCst);
        if self.tx.send(Outbound::Message { message, generation }).is_err() {
            log::warn!("Companion outbox is closed");
        }
    }

    /// Drop everything queued so far, held state included. Later posts are
    /// unaffected.
    pub fn cancel_pending(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Block until everything posted before this call was handled.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has gone away.
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.tx
            .send(Outbound::Flush(ack_tx))
            .map_err(|_| anyhow!("Companion outbox is closed"))?;
        ack_rx.recv().context("Companion outbox worker stopped")
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(Outbound::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Companion outbox worker panicked");
            }
        }
    }
}

impl Drop for CompanionOutbox {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Default)]
struct SharedLink {
    reachable: bool,
    snapshot: Option<DurableSnapshot>,
}

/// In-process transport pair. Messages travel as JSON strings so both ends
/// exercise the wire schema.
pub struct LoopbackTransport {
    shared: Arc<Mutex<SharedLink>>,
    outgoing: Mutex<Sender<String>>,
    incoming: Mutex<Receiver<String>>,
}

impl LoopbackTransport {
    /// Two connected ends, initially reachable.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let shared = Arc::new(Mutex::new(SharedLink {
            reachable: true,
            snapshot: None,
        }));
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();

        let a = Self {
            shared: Arc::clone(&shared),
            outgoing: Mutex::new(a_tx),
            incoming: Mutex::new(a_rx),
        };
        let b = Self {
            shared,
            outgoing: Mutex::new(b_tx),
            incoming: Mutex::new(b_rx),
        };
        (Arc::new(a), Arc::new(b))
    }

    /// Reachability is shared: setting it on one end affects both.
    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.reachable = reachable;
        }
    }

    /// Everything the peer sent since the last call. Malformed frames are
    /// logged and skipped.
    #[must_use]
    pub fn drain_inbox(&self) -> Vec<CompanionMessage> {
        let Ok(incoming) = self.incoming.lock() else {
            return Vec::new();
        };
        incoming
            .try_iter()
            .filter_map(|frame| match CompanionMessage::from_json(&frame) {
                Ok(message) => Some(message),
                Err(e) => {
                    log::warn!("Dropping malformed companion frame: {e:#}");
                    None
                }
            })
            .collect()
    }

    fn lock_shared(&self) -> Result<std::sync::MutexGuard<'_, SharedLink>> {
        self.shared
            .lock()
            .map_err(|_| anyhow!("Loopback link state poisoned"))
    }
}

impl CompanionTransport for LoopbackTransport {
    fn is_reachable(&self) -> bool {
        self.shared.lock().map(|s| s.reachable).unwrap_or(false)
    }

    fn send_message(&self, message: &CompanionMessage) -> Result<()> {
        if !self.is_reachable() {
            return Err(anyhow!("Peer is not reachable"));
        }
        let frame = message.to_json()?;
        self.outgoing
            .lock()
            .map_err(|_| anyhow!("Loopback sender poisoned"))?
            .send(frame)
            .map_err(|_| anyhow!("Peer end was dropped"))
    }

    fn write_snapshot(&self, snapshot: DurableSnapshot) -> Result<()> {
        self.lock_shared()?.snapshot = Some(snapshot);
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<DurableSnapshot>> {
        Ok(self.lock_shared()?.snapshot)
    }
}

/// The watch's view of the run, rebuilt from inbound messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredState {
    pub is_active: bool,
    pub is_paused: bool,
    pub was_finished: bool,
    pub is_locked: bool,
    pub locked_value: Option<u32>,
    pub last_heart_rate: Option<u32>,
    pub start_requested: bool,
}

impl MirroredState {
    pub fn apply(&mut self, message: &CompanionMessage) {
        match message {
            CompanionMessage::HeartRate { bpm, .. } => self.last_heart_rate = Some(*bpm),
            CompanionMessage::WorkoutState {
                is_active,
                is_paused,
                was_finished,
                ..
            } => {
                self.is_active = *is_active;
                self.is_paused = *is_paused;
                self.was_finished = *was_finished;
                if *is_active {
                    self.start_requested = false;
                }
            }
            CompanionMessage::WorkoutRequest { .. } => self.start_requested = true,
            CompanionMessage::BpmLockState {
                is_locked,
                locked_value,
            } => {
                self.is_locked = *is_locked;
                self.locked_value = *locked_value;
            }
            CompanionMessage::Command { .. } => {}
        }
    }
}
