//! Track scoring for heart-rate matched selection.
//!
//! Scores a candidate by how well its tempo fits the runner's current effort:
//!
//! ```text
//! score = 0.60 * bpm_match + 0.20 * variety + 0.20 * energy_zone_match
//! ```
//!
//! Every function here is pure. Selection is deterministic: ties go to the
//! track that appears first in catalog order.

use crate::session::PlayHistoryEntry;
use crate::track::Track;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Value a candidate without a known tempo gets for `bpm_match`.
pub const BPM_MATCH_FLOOR: f64 = 0.0;

/// Scoring parameters. Everything the scorer needs besides its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoringContext {
    pub weights: WeightConfig,
    /// Deltas up to this many BPM count as a full tempo match
    pub full_match_band: u32,
    /// Deltas at or beyond this many BPM score zero
    pub tolerance: u32,
    /// How many trailing history entries count as "recently played"
    pub variety_window: usize,
    pub zones: ZoneConfig,
}

/// Component weights of the composite score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WeightConfig {
    pub bpm_match: f64,
    pub variety: f64,
    pub energy_zone: f64,
}

/// Heart-rate thresholds for each zone and the tempo band each zone rewards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ZoneConfig {
    pub moderate_from: u32,
    pub high_from: u32,
    pub max_from: u32,
    /// Inclusive (min, max) tempo bands per zone
    pub low_band: (u32, u32),
    pub moderate_band: (u32, u32),
    pub high_band: (u32, u32),
    pub max_band: (u32, u32),
    /// Distance outside a band over which the zone reward fades to zero
    pub falloff: u32,
}

impl Default for ScoringContext {
    fn default() -> Self {
        Self {
            weights: WeightConfig::default(),
            full_match_band: 5,
            tolerance: 15,
            variety_window: 4,
            zones: ZoneConfig::default(),
        }
    }
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            bpm_match: 0.60,
            variety: 0.20,
            energy_zone: 0.20,
        }
    }
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            moderate_from: 120,
            high_from: 140,
            max_from: 160,
            low_band: (90, 125),
            moderate_band: (120, 145),
            high_band: (140, 165),
            max_band: (160, 190),
            falloff: 20,
        }
    }
}

/// Coarse effort level derived from heart rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyZone {
    Low,
    Moderate,
    High,
    Max,
}

impl EnergyZone {
    #[must_use]
    pub const fn from_heart_rate(heart_rate: u32, zones: &ZoneConfig) -> Self {
        match heart_rate {
            hr if hr >= zones.max_from => Self::Max,
            hr if hr >= zones.high_from => Self::High,
            hr if hr >= zones.moderate_from => Self::Moderate,
            _ => Self::Low,
        }
    }

    /// Tempo band this zone rewards.
    #[must_use]
    pub const fn tempo_band(self, zones: &ZoneConfig) -> (u32, u32) {
        match self {
            Self::Low => zones.low_band,
            Self::Moderate => zones.moderate_band,
            Self::High => zones.high_band,
            Self::Max => zones.max_band,
        }
    }
}

impl std::fmt::Display for EnergyZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Max => "max",
        };
        f.write_str(name)
    }
}

/// Per-component view of a score, for ranking output and tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub bpm_match: f64,
    pub variety: f64,
    pub energy_zone: f64,
    pub total: f64,
}

/// Tempo match in `[0, 1]`, decreasing with `|bpm - heart_rate|`.
///
/// Full inside `full_match_band`, zero from `tolerance` on, smoothstep in
/// between. Unknown tempo scores [`BPM_MATCH_FLOOR`].
///
/// ```
/// use pulsetempo::algorithm::{bpm_match, ScoringContext};
///
/// let context = ScoringContext::default();
/// assert_eq!(bpm_match(Some(150), 152, &context), 1.0);
/// assert_eq!(bpm_match(Some(150), 170, &context), 0.0);
/// assert_eq!(bpm_match(None, 150, &context), 0.0);
/// ```
#[must_use]
pub fn bpm_match(track_bpm: Option<u32>, heart_rate: u32, context: &ScoringContext) -> f64 {
    let Some(bpm) = track_bpm else {
        return BPM_MATCH_FLOOR;
    };

    let delta = bpm.abs_diff(heart_rate);
    if delta <= context.full_match_band {
        return 1.0;
    }
    if delta >= context.tolerance || context.tolerance <= context.full_match_band {
        return 0.0;
    }

    let span = f64::from(context.tolerance - context.full_match_band);
    let t = f64::from(delta - context.full_match_band) / span;
    1.0 - t * t * (3.0 - 2.0 * t)
}

/// Recency penalty in `[0, 1]`.
///
/// Never played scores 1.0. A play `k` entries back from the end of history
/// (0 = most recent) scores `0.9 * min(k, window) / window`, so the last
/// played track scores zero and long-past plays sit just under a fresh track.
#[must_use]
pub fn variety(track_id: &str, history: &[PlayHistoryEntry], window: usize) -> f64 {
    let last_play = history
        .iter()
        .rev()
        .position(|entry| entry.track.id == track_id);

    match last_play {
        None => 1.0,
        Some(_) if window == 0 => 0.9,
        Some(k) => {
            #[allow(clippy::cast_precision_loss)]
            let recency = k.min(window) as f64 / window as f64;
            0.9 * recency
        }
    }
}

/// Whether a track sits in the trailing `window` entries of history.
#[must_use]
pub fn recently_played(track_id: &str, history: &[PlayHistoryEntry], window: usize) -> bool {
    history
        .iter()
        .rev()
        .take(window)
        .any(|entry| entry.track.id == track_id)
}

/// Reward in `[0, 1]` for tempo falling inside the current zone's band.
/// Fades linearly over `falloff` BPM outside the band. Unknown tempo scores 0.
#[must_use]
pub fn energy_zone_match(track_bpm: Option<u32>, heart_rate: u32, zones: &ZoneConfig) -> f64 {
    let Some(bpm) = track_bpm else {
        return 0.0;
    };

    let (low, high) = EnergyZone::from_heart_rate(heart_rate, zones).tempo_band(zones);
    let outside = if bpm < low {
        low - bpm
    } else if bpm > high {
        bpm - high
    } else {
        0
    };

    match (outside, zones.falloff) {
        (0, _) => 1.0,
        (_, 0) => 0.0,
        (d, falloff) => (1.0 - f64::from(d) / f64::from(falloff)).max(0.0),
    }
}

/// Composite score with each component exposed.
#[must_use]
pub fn score_breakdown(
    candidate: &Track,
    heart_rate: u32,
    history: &[PlayHistoryEntry],
    context: &ScoringContext,
) -> ScoreBreakdown {
    let bpm = bpm_match(candidate.bpm, heart_rate, context);
    let fresh = variety(&candidate.id, history, context.variety_window);
    let energy = energy_zone_match(candidate.bpm, heart_rate, &context.zones);
    let w = &context.weights;

    ScoreBreakdown {
        bpm_match: bpm,
        variety: fresh,
        energy_zone: energy,
        total: w.bpm_match * bpm + w.variety * fresh + w.energy_zone * energy,
    }
}

/// Composite affinity of `candidate` for the given heart rate and history.
#[must_use]
pub fn score(
    candidate: &Track,
    heart_rate: u32,
    history: &[PlayHistoryEntry],
    context: &ScoringContext,
) -> f64 {
    score_breakdown(candidate, heart_rate, history, context).total
}

/// Result of picking the next track.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Picked {
        track: Track,
        score: f64,
        /// Every candidate had been played recently, so recency exclusion was lifted
        relaxed: bool,
    },
    /// Nothing in the pool besides the excluded track
    NoCandidates,
    /// The pool itself is empty
    PoolEmpty,
}

impl Selection {
    #[must_use]
    pub fn track(&self) -> Option<&Track> {
        match self {
            Self::Picked { track, .. } => Some(track),
            Self::NoCandidates | Self::PoolEmpty => None,
        }
    }

    #[must_use]
    pub fn into_track(self) -> Option<Track> {
        match self {
            Self::Picked { track, .. } => Some(track),
            Self::NoCandidates | Self::PoolEmpty => None,
        }
    }
}

/// Pick the best next track from `pool`, never returning `exclude_id`.
///
/// Recently played tracks are left out unless nothing else remains. Tracks
/// with a known tempo always beat tracks without one. Equal scores resolve to
/// the earliest track in `pool`, so identical inputs give identical picks.
#[must_use]
pub fn select_next_track(
    pool: &[Track],
    exclude_id: Option<&str>,
    heart_rate: u32,
    history: &[PlayHistoryEntry],
    context: &ScoringContext,
) -> Selection {
    if pool.is_empty() {
        return Selection::PoolEmpty;
    }

    let candidates: Vec<&Track> = pool
        .iter()
        .filter(|track| exclude_id != Some(track.id.as_str()))
        .collect();
    if candidates.is_empty() {
        return Selection::NoCandidates;
    }

    let fresh: Vec<&Track> = candidates
        .iter()
        .copied()
        .filter(|track| !recently_played(&track.id, history, context.variety_window))
        .collect();

    let (tier, relaxed) = if fresh.is_empty() {
        log::debug!("All candidates played recently, relaxing variety exclusion");
        (candidates, true)
    } else {
        (fresh, false)
    };

    let known: Vec<&Track> = tier.iter().copied().filter(|t| t.bpm.is_some()).collect();
    let tier = if known.is_empty() { tier } else { known };

    match best_of(&tier, heart_rate, history, context) {
        Some((track, score)) => Selection::Picked {
            track: track.clone(),
            score,
            relaxed,
        },
        None => Selection::NoCandidates,
    }
}

/// First maximum in iteration order.
fn best_of<'a>(
    tracks: &[&'a Track],
    heart_rate: u32,
    history: &[PlayHistoryEntry],
    context: &ScoringContext,
) -> Option<(&'a Track, f64)> {
    tracks
        .iter()
        .map(|&track| (track, score(track, heart_rate, history, context)))
        .fold(None, |best, (track, s)| match best {
            Some((_, best_score)) if s <= best_score => best,
            _ => Some((track, s)),
        })
}

/// Score the whole pool, best first. Ties keep catalog order.
///
/// Scoring runs on the rayon pool; the result order does not depend on it.
#[must_use]
pub fn rank_tracks(
    pool: &[Track],
    heart_rate: u32,
    history: &[PlayHistoryEntry],
    context: &ScoringContext,
) -> Vec<(Track, ScoreBreakdown)> {
    let mut ranked: Vec<(Track, ScoreBreakdown)> = pool
        .par_iter()
        .map(|track| {
            let breakdown = score_breakdown(track, heart_rate, history, context);
            (track.clone(), breakdown)
        })
        .collect();

    ranked.sort_by(|(_, a), (_, b)| {
        b.total
            .partial_cmp(&a.total)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn track(id: &str, bpm: Option<u32>) -> Track {
        Track::new(id, format!("Title {id}"), "Artist", 180, bpm)
    }

    fn played(ids: &[&str]) -> Vec<PlayHistoryEntry> {
        ids.iter()
            .map(|id| PlayHistoryEntry {
                track: track(id, Some(150)),
                started_at: Utc::now(),
                heart_rate_at_start: None,
            })
            .collect()
    }

    #[test]
    fn test_exact_tempo_is_maximal() {
        let context = ScoringContext::default();
        for hr in [90, 120, 150, 175, 200] {
            let exact = bpm_match(Some(hr), hr, &context);
            for delta in 1..40 {
                assert!(exact >= bpm_match(Some(hr + delta), hr, &context));
                assert!(exact >= bpm_match(Some(hr - delta), hr, &context));
            }
        }
    }

    #[test]
    fn test_bpm_match_is_monotonic() {
        let context = ScoringContext::default();
        let mut previous = f64::INFINITY;
        for delta in 0..=40 {
            let value = bpm_match(Some(150 + delta), 150, &context);
            assert!(value <= previous, "delta {delta} increased the match");
            previous = value;
        }
    }

    #[test]
    fn test_bpm_match_saturation_points() {
        let context = ScoringContext::default();
        assert_eq!(bpm_match(Some(155), 150, &context), 1.0);
        assert_eq!(bpm_match(Some(145), 150, &context), 1.0);
        assert_eq!(bpm_match(Some(165), 150, &context), 0.0);
        assert_eq!(bpm_match(Some(120), 150, &context), 0.0);
        let mid = bpm_match(Some(160), 150, &context);
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn test_unknown_tempo_scores_floor() {
        let context = ScoringContext::default();
        assert_eq!(bpm_match(None, 150, &context), BPM_MATCH_FLOOR);
        assert_eq!(energy_zone_match(None, 150, &context.zones), 0.0);
    }

    #[test]
    fn test_variety_penalises_recent_play() {
        let context = ScoringContext::default();
        let history = played(&["a", "b"]);
        let recent = track("b", Some(150));
        let fresh = track("z", Some(150));

        assert!(score(&recent, 150, &history, &context) < score(&fresh, 150, &history, &context));
        assert_eq!(variety("b", &history, 4), 0.0);
        assert_eq!(variety("z", &history, 4), 1.0);
        assert!(variety("a", &history, 4) > variety("b", &history, 4));
    }

    #[test]
    fn test_zone_thresholds() {
        let zones = ZoneConfig::default();
        assert_eq!(EnergyZone::from_heart_rate(100, &zones), EnergyZone::Low);
        assert_eq!(EnergyZone::from_heart_rate(120, &zones), EnergyZone::Moderate);
        assert_eq!(EnergyZone::from_heart_rate(150, &zones), EnergyZone::High);
        assert_eq!(EnergyZone::from_heart_rate(175, &zones), EnergyZone::Max);
    }

    #[test]
    fn test_max_zone_prefers_faster_track_at_equal_distance() {
        let context = ScoringContext::default();
        let slower = track("slow", Some(150));
        let faster = track("fast", Some(180));

        assert!(
            score(&faster, 165, &[], &context) > score(&slower, 165, &[], &context),
            "max zone should favour the higher tempo"
        );
    }

    #[test]
    fn test_selection_is_deterministic_and_prefers_catalog_order_on_tie() {
        let context = ScoringContext::default();
        let pool = vec![track("a", Some(150)), track("b", Some(150)), track("c", Some(110))];

        let first = select_next_track(&pool, None, 150, &[], &context);
        let second = select_next_track(&pool, None, 150, &[], &context);
        assert_eq!(first, second);
        assert_eq!(first.track().map(|t| t.id.as_str()), Some("a"));
    }

    #[test]
    fn test_selection_excludes_current_track() {
        let context = ScoringContext::default();
        let pool = vec![track("a", Some(150)), track("b", Some(100))];
        let pick = select_next_track(&pool, Some("a"), 150, &[], &context);
        assert_eq!(pick.track().map(|t| t.id.as_str()), Some("b"));

        let only = vec![track("a", Some(150))];
        assert_eq!(select_next_track(&only, Some("a"), 150, &[], &context), Selection::NoCandidates);
        assert_eq!(select_next_track(&[], None, 150, &[], &context), Selection::PoolEmpty);
    }

    #[test]
    fn test_known_tempo_beats_unknown() {
        let context = ScoringContext::default();
        let pool = vec![track("unknown", None), track("far", Some(60))];
        let pick = select_next_track(&pool, None, 170, &[], &context);
        assert_eq!(pick.track().map(|t| t.id.as_str()), Some("far"));

        let unknown_only = vec![track("u1", None), track("u2", None)];
        let pick = select_next_track(&unknown_only, None, 170, &[], &context);
        assert_eq!(pick.track().map(|t| t.id.as_str()), Some("u1"));
    }

    #[test]
    fn test_exhausted_pool_relaxes_instead_of_failing() {
        let context = ScoringContext::default();
        let pool = vec![track("a", Some(150)), track("b", Some(150)), track("c", Some(150))];
        let history = played(&["a", "b", "c"]);

        match select_next_track(&pool, Some("c"), 150, &history, &context) {
            Selection::Picked { track, relaxed, .. } => {
                assert!(relaxed);
                // "a" was played longest ago
                assert_eq!(track.id, "a");
            }
            other => panic!("expected a pick, got {other:?}"),
        }
    }

    #[test]
    fn test_recent_tracks_skipped_while_fresh_ones_exist() {
        let context = ScoringContext::default();
        let pool = vec![track("a", Some(150)), track("b", Some(140))];
        let history = played(&["a"]);

        let pick = select_next_track(&pool, None, 150, &history, &context);
        assert_eq!(pick.track().map(|t| t.id.as_str()), Some("b"));
    }

    #[test]
    fn test_rank_tracks_orders_best_first() {
        let context = ScoringContext::default();
        let pool = vec![track("far", Some(100)), track("near", Some(150)), track("none", None)];
        let ranked = rank_tracks(&pool, 150, &[], &context);

        let ids: Vec<_> = ranked.iter().map(|(t, _)| t.id.as_str()).collect();
        assert_eq!(ids[0], "near");
        for window in ranked.windows(2) {
            assert!(window[0].1.total >= window[1].1.total);
        }
    }
}
