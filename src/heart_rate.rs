//! Heart-rate input.
//!
//! The core only needs the latest reading and how fast it is moving, so
//! [`HeartRateWindow`] keeps a short trailing window and nothing more.
//! Sources push [`HeartRateUpdate`]s into a sink handed over on subscribe.

use crate::session::Clock;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One reading from the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub bpm: u32,
    /// Steps per minute, when the sensor reports it
    pub cadence: Option<u32>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl HeartRateSample {
    #[must_use]
    pub fn new(bpm: u32) -> Self {
        Self {
            bpm,
            cadence: None,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_cadence(mut self, cadence: u32) -> Self {
        self.cadence = Some(cadence);
        self
    }
}

/// What a source can report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeartRateUpdate {
    Sample(HeartRateSample),
    /// The sensor went away. Scoring keeps using the last known value.
    SourceLost,
}

/// Callback a source pushes updates into.
pub type HeartRateSink = Box<dyn Fn(HeartRateUpdate) + Send + 'static>;

/// Anything that can stream heart-rate readings.
pub trait HeartRateSource: Send {
    /// Start streaming into `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is already streaming or cannot start.
    fn subscribe(&mut self, sink: HeartRateSink) -> Result<()>;

    /// Stop streaming. No updates reach the sink after this returns.
    fn unsubscribe(&mut self);
}

/// Short trailing window over recent readings.
#[derive(Debug, Clone)]
pub struct HeartRateWindow {
    readings: VecDeque<(Instant, u32)>,
    capacity: usize,
}

impl Default for HeartRateWindow {
    fn default() -> Self {
        Self::new(8)
    }
}

impl HeartRateWindow {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            readings: VecDeque::with_capacity(capacity.max(2)),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, at: Instant, bpm: u32) {
        if self.readings.len() == self.capacity {
            self.readings.pop_front();
        }
        self.readings.push_back((at, bpm));
    }

    #[must_use]
    pub fn latest(&self) -> Option<u32> {
        self.readings.back().map(|&(_, bpm)| bpm)
    }

    /// BPM per second across the window. `None` until two readings at
    /// different instants exist.
    #[must_use]
    pub fn rate_of_change(&self) -> Option<f64> {
        let &(first_at, first) = self.readings.front()?;
        let &(last_at, last) = self.readings.back()?;
        let span = last_at.saturating_duration_since(first_at).as_secs_f64();
        if span <= f64::EPSILON {
            return None;
        }
        Some((f64::from(last) - f64::from(first)) / span)
    }
}

/// Shape of a simulated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HeartRateProfile {
    /// Hold around 150
    Steady,
    /// Three minutes hard, two minutes easy
    Intervals,
    /// Ramp from 110 to 175 over thirty minutes
    Progressive,
}

impl HeartRateProfile {
    /// Noise-free heart rate `seconds` into the run.
    #[must_use]
    pub fn base_heart_rate(self, seconds: f64) -> f64 {
        match self {
            Self::Steady => 150.0,
            Self::Intervals => {
                if seconds % 300.0 < 180.0 {
                    165.0
                } else {
                    130.0
                }
            }
            Self::Progressive => 110.0 + 65.0 * (seconds / 1800.0).min(1.0),
        }
    }

    /// Lazy, endless sample stream, one reading every `spacing` of run time.
    /// The same seed always yields the same stream. Timestamps count from
    /// now unless [`ProfileSamples::starting_at`] says otherwise.
    #[must_use]
    pub fn samples(self, spacing: Duration, seed: u64) -> ProfileSamples {
        ProfileSamples {
            profile: self,
            spacing,
            index: 0,
            rng: StdRng::seed_from_u64(seed),
            start: Utc::now(),
        }
    }
}

/// Iterator behind [`HeartRateProfile::samples`].
#[derive(Debug, Clone)]
pub struct ProfileSamples {
    profile: HeartRateProfile,
    spacing: Duration,
    index: u64,
    rng: StdRng,
    start: DateTime<Utc>,
}

impl ProfileSamples {
    /// Stamp the first sample with `start`; each later one is `spacing` on.
    #[must_use]
    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }
}

impl Iterator for ProfileSamples {
    type Item = HeartRateSample;

    fn next(&mut self) -> Option<Self::Item> {
        #[allow(clippy::cast_precision_loss)]
        let seconds = self.index as f64 * self.spacing.as_secs_f64();
        let steps = u32::try_from(self.index).unwrap_or(u32::MAX);
        let offset = chrono::Duration::from_std(self.spacing.saturating_mul(steps))
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.index += 1;

        let jitter: f64 = self.rng.gen_range(-3.0..=3.0);
        let bpm = (self.profile.base_heart_rate(seconds) + jitter).round().max(40.0);
        let cadence = 150.0 + (bpm - 100.0) / 2.0 + self.rng.gen_range(-2.0..=2.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Some(HeartRateSample {
            bpm: bpm as u32,
            cadence: Some(cadence.round().max(0.0) as u32),
            timestamp: Some(self.start + offset),
        })
    }
}

/// Source that plays a [`HeartRateProfile`] on a background thread.
///
/// `tick` is the wall-clock gap between samples; each sample stands for
/// `spacing` of run time, so a short tick fast-forwards the run. Samples are
/// stamped in run time, starting from the clock's time at subscribe.
pub struct ProfileHeartRateSource {
    profile: HeartRateProfile,
    spacing: Duration,
    tick: Duration,
    seed: u64,
    clock: Option<Arc<dyn Clock>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ProfileHeartRateSource {
    #[must_use]
    pub fn new(profile: HeartRateProfile, spacing: Duration, tick: Duration, seed: u64) -> Self {
        Self {
            profile,
            spacing,
            tick,
            seed,
            clock: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Take the stream's start time from `clock` instead of the wall clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

impl HeartRateSource for ProfileHeartRateSource {
    fn subscribe(&mut self, sink: HeartRateSink) -> Result<()> {
        if self.worker.is_some() {
            bail!("Heart-rate source is already streaming");
        }

        self.stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop);
        let start = self.clock.as_ref().map_or_else(Utc::now, |clock| clock.utc_now());
        let samples = self.profile.samples(self.spacing, self.seed).starting_at(start);
        let tick = self.tick;

        log::info!("Streaming {:?} heart-rate profile", self.profile);
        self.worker = Some(thread::spawn(move || {
            for sample in samples {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                sink(HeartRateUpdate::Sample(sample));
                thread::sleep(tick);
            }
        }));
        Ok(())
    }

    fn unsubscribe(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Heart-rate worker panicked");
            }
        }
    }
}

impl Drop for ProfileHeartRateSource {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ManualClock;
    use std::sync::mpsc;

    #[test]
    fn test_window_latest_and_trend() {
        let start = Instant::now();
        let mut window = HeartRateWindow::new(3);
        assert_eq!(window.latest(), None);
        assert_eq!(window.rate_of_change(), None);

        window.push(start, 120);
        window.push(start + Duration::from_secs(5), 130);
        window.push(start + Duration::from_secs(10), 140);
        assert_eq!(window.latest(), Some(140));
        assert_eq!(window.rate_of_change(), Some(2.0));

        // oldest reading falls out
        window.push(start + Duration::from_secs(15), 140);
        assert_eq!(window.rate_of_change(), Some(1.0));
    }

    #[test]
    fn test_profile_samples_are_reproducible() {
        let spacing = Duration::from_secs(5);
        let a: Vec<_> = HeartRateProfile::Intervals.samples(spacing, 7).take(50).map(|s| s.bpm).collect();
        let b: Vec<_> = HeartRateProfile::Intervals.samples(spacing, 7).take(50).map(|s| s.bpm).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_profile_samples_are_stamped_in_run_time() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let stamps: Vec<_> = HeartRateProfile::Steady
            .samples(Duration::from_secs(5), 3)
            .starting_at(start)
            .take(3)
            .filter_map(|s| s.timestamp)
            .collect();
        assert_eq!(
            stamps,
            vec![
                start,
                start + chrono::Duration::seconds(5),
                start + chrono::Duration::seconds(10)
            ]
        );
    }

    #[test]
    fn test_profile_source_uses_given_clock() {
        let clock = Arc::new(ManualClock::new());
        clock.advance(Duration::from_secs(3600));
        let (tx, rx) = mpsc::channel();
        let mut source = ProfileHeartRateSource::new(
            HeartRateProfile::Steady,
            Duration::from_secs(5),
            Duration::from_millis(50),
            1,
        )
        .with_clock(clock.clone());

        source
            .subscribe(Box::new(move |update| {
                let _ = tx.send(update);
            }))
            .unwrap();
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        source.unsubscribe();
        assert!(matches!(first, HeartRateUpdate::Sample(s) if s.timestamp == Some(clock.utc_now())));
    }

    #[test]
    fn test_interval_profile_alternates() {
        let profile = HeartRateProfile::Intervals;
        assert!(profile.base_heart_rate(60.0) > profile.base_heart_rate(200.0));
        assert_eq!(profile.base_heart_rate(300.0), profile.base_heart_rate(0.0));
        assert_eq!(HeartRateProfile::Progressive.base_heart_rate(3600.0), 175.0);
    }

    #[test]
    fn test_profile_source_stops_on_unsubscribe() {
        let (tx, rx) = mpsc::channel();
        let mut source = ProfileHeartRateSource::new(
            HeartRateProfile::Steady,
            Duration::from_secs(5),
            Duration::from_millis(1),
            1,
        );

        source
            .subscribe(Box::new(move |update| {
                let _ = tx.send(update);
            }))
            .unwrap();
        assert!(source.subscribe(Box::new(|_| {})).is_err());

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(first, HeartRateUpdate::Sample(s) if (140..=160).contains(&s.bpm)));

        source.unsubscribe();
        while rx.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(20));
        assert!(rx.try_recv().is_err());
    }
}
