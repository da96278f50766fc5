//! Offline run simulator behind `pulsetempo simulate`.
//!
//! Wires a [`RunController`] to simulated hardware: a heart-rate profile, a
//! player whose tracks end on their own, and a watch on the far side of a
//! loopback companion link. Run time is compressed by `time_scale`, so a
//! twenty-minute run with a scale of 0.01 takes twelve seconds.
//!
//! The watch drives the lifecycle the way a wrist device would. It asks for
//! the run to start and sends `finish` when the planned duration is over.
//! With `offline_companion` the phone is out of reach when the start request
//! is sent, so the request lands in the durable snapshot and is picked up on
//! reconnect.

use crate::companion::{
    wire_timestamp, CompanionCommand, CompanionMessage, CompanionSender, CompanionTransport,
    Delivery, DeviceRole, LoopbackTransport, MirroredState,
};
use crate::config::PulseConfig;
use crate::controller::{ControllerParts, RunController, RunEvent};
use crate::heart_rate::{HeartRateProfile, ProfileHeartRateSource};
use crate::playback::{SimulatedPlayer, TrackEndSink};
use crate::session::{Clock, RunSummary};
use crate::track::{InMemoryCatalog, Track};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Run time between two heart-rate samples.
const SAMPLE_SPACING: Duration = Duration::from_secs(5);
/// Run time the watch stays out of reach in offline mode.
const OFFLINE_SPELL: Duration = Duration::from_secs(30);
/// Wall time between polls of the loopback link.
const POLL: Duration = Duration::from_millis(5);
/// Wall time the watch waits for the run to wind down after `finish`.
const FINISH_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationOptions {
    pub profile: HeartRateProfile,
    pub minutes: u32,
    /// Wall-clock seconds per simulated second
    pub time_scale: f64,
    pub offline_companion: bool,
    pub seed: u64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            profile: HeartRateProfile::Steady,
            minutes: 20,
            time_scale: 0.01,
            offline_companion: false,
            seed: 42,
        }
    }
}

/// What `simulate` prints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub summary: RunSummary,
    /// The watch's last view of the run
    pub watch: MirroredState,
}

/// Clock running `1 / scale` times faster than the wall clock.
#[derive(Debug)]
pub struct ScaledClock {
    start: Instant,
    start_utc: DateTime<Utc>,
    scale: f64,
}

impl ScaledClock {
    #[must_use]
    pub fn new(scale: f64) -> Self {
        Self {
            start: Instant::now(),
            start_utc: Utc::now(),
            scale,
        }
    }

    fn simulated_elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.start.elapsed().as_secs_f64() / self.scale)
    }
}

impl Clock for ScaledClock {
    fn now(&self) -> Instant {
        self.start + self.simulated_elapsed()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.simulated_elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.start_utc + elapsed
    }
}

/// Run a whole session over `tracks` and return its summary.
///
/// # Errors
///
/// Returns an error for an empty track list or nonsensical options, and if
/// the run ended without finishing.
pub fn simulate(
    config: &PulseConfig,
    tracks: Vec<Track>,
    options: &SimulationOptions,
) -> Result<SimulationReport> {
    if tracks.is_empty() {
        bail!("No tracks to simulate with; import some or pass --tracks");
    }
    if !(options.time_scale.is_finite() && options.time_scale > 0.0) {
        bail!("Time scale must be a positive number, got {}", options.time_scale);
    }
    if options.minutes == 0 {
        bail!("A simulated run needs at least one minute");
    }

    let scale = options.time_scale;
    let wall = |run_time: Duration| Duration::from_secs_f64(run_time.as_secs_f64() * scale);

    let clock = Arc::new(ScaledClock::new(scale));
    let (inbox, events) = RunController::channel();
    let (phone, watch) = LoopbackTransport::pair();
    if options.offline_companion {
        watch.set_reachable(false);
    }

    info!(
        "Simulating a {}-minute {:?} run over {} tracks",
        options.minutes,
        options.profile,
        tracks.len()
    );

    // this process is the phone
    let mut config = config.clone();
    config.companion.role = DeviceRole::Phone;

    let mut controller = RunController::new(
        &config,
        ControllerParts {
            catalog: Box::new(InMemoryCatalog::new(tracks)),
            playback: Box::new(SimulatedPlayer::with_track_end(track_end_sink(&inbox), scale)),
            heart_rate: Box::new(ProfileHeartRateSource::new(
                options.profile,
                SAMPLE_SPACING,
                wall(SAMPLE_SPACING),
                options.seed,
            )
            .with_clock(clock.clone())),
            companion: Some(Arc::clone(&phone) as Arc<dyn CompanionTransport>),
            clock: clock.clone(),
            inbox: inbox.clone(),
        },
    );

    let stop = Arc::new(AtomicBool::new(false));
    let pump = spawn_pump(Arc::clone(&phone), Arc::clone(&watch), inbox.clone(), Arc::clone(&stop));

    let (cancel_tx, cancel_rx) = mpsc::channel();
    let plan = WatchPlan {
        offline_spell: options.offline_companion.then(|| wall(OFFLINE_SPELL)),
        run_length: wall(Duration::from_secs(u64::from(options.minutes) * 60)),
    };
    let wrist = spawn_watch(watch, inbox, clock, plan, cancel_rx);

    controller.run(&events);
    let summary = controller.summary();
    drop(controller);

    let _ = cancel_tx.send(());
    if wrist.join().is_err() {
        warn!("Watch thread panicked");
    }
    stop.store(true, Ordering::SeqCst);
    let watch_view = pump.join().map_err(|_| anyhow!("Companion pump panicked"))?;

    let summary = summary.ok_or_else(|| anyhow!("The simulated run never finished"))?;
    info!(
        "Run finished: {} tracks, average heart rate {:?}",
        summary.tracks.len(),
        summary.avg_heart_rate
    );
    Ok(SimulationReport {
        summary,
        watch: watch_view,
    })
}

fn track_end_sink(inbox: &Sender<RunEvent>) -> TrackEndSink {
    let inbox = Mutex::new(inbox.clone());
    Arc::new(move |track_id| {
        if let Ok(inbox) = inbox.lock() {
            let _ = inbox.send(RunEvent::TrackFinished { track_id });
        }
    })
}

/// Moves frames across the loopback link. Whatever the watch sent becomes a
/// controller event; whatever the phone sent updates the watch's mirror.
fn spawn_pump(
    phone: Arc<LoopbackTransport>,
    watch: Arc<LoopbackTransport>,
    inbox: Sender<RunEvent>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<MirroredState> {
    thread::spawn(move || {
        let mut mirror = MirroredState::default();
        loop {
            let stopping = stop.load(Ordering::SeqCst);
            for message in phone.drain_inbox() {
                let _ = inbox.send(RunEvent::Companion(message));
            }
            for message in watch.drain_inbox() {
                mirror.apply(&message);
            }
            if stopping {
                break mirror;
            }
            thread::sleep(POLL);
        }
    })
}

struct WatchPlan {
    /// Wall time to stay unreachable after the start request
    offline_spell: Option<Duration>,
    run_length: Duration,
}

fn spawn_watch(
    transport: Arc<LoopbackTransport>,
    inbox: Sender<RunEvent>,
    clock: Arc<ScaledClock>,
    plan: WatchPlan,
    cancel: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let sender = CompanionSender::new(DeviceRole::Watch, Arc::clone(&transport) as Arc<dyn CompanionTransport>);
        let now = || wire_timestamp(clock.utc_now());

        let request = CompanionMessage::start_request(now());
        match sender.deliver(&request) {
            Delivery::Direct => debug!("Start request sent directly"),
            other => info!("Phone out of reach, start request: {other:?}"),
        }

        if let Some(spell) = plan.offline_spell {
            if wait_or_cancel(&cancel, spell) {
                return;
            }
            info!("Watch back in reach");
            transport.set_reachable(true);
            let _ = inbox.send(RunEvent::ReachabilityChanged(true));
        }

        if wait_or_cancel(&cancel, plan.run_length) {
            return;
        }
        let finish = CompanionCommand::Finish.message(now());
        if sender.deliver(&finish) != Delivery::Direct {
            warn!("Finish command was not delivered");
        }

        if !wait_or_cancel(&cancel, FINISH_GRACE) {
            let _ = inbox.send(RunEvent::Shutdown);
        }
    })
}

/// Sleep for `length` unless cancelled first. Returns true when cancelled.
fn wait_or_cancel(cancel: &Receiver<()>, length: Duration) -> bool {
    !matches!(cancel.recv_timeout(length), Err(RecvTimeoutError::Timeout))
}
