//! # Track Model
//!
//! Immutable track metadata as supplied by the catalog, plus the read-only
//! catalog seam the queue draws its candidate pool from.
//!
//! Two tracks are duplicates when their ids match, or when title and artist
//! match ignoring case. Pending additions are de-duplicated against catalog
//! results with [`merge_pending`].

use serde::{Deserialize, Serialize};

/// A playable track. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    /// Catalog id, unique within a pool
    pub id: String,
    pub title: String,
    pub artist: String,
    /// Length of the track, always > 0
    pub duration_seconds: u32,
    /// Tempo in beats per minute, `None` when unknown
    #[serde(default)]
    pub bpm: Option<u32>,
    /// How sure the tempo source was about `bpm` (0.0 to 1.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm_confidence: Option<f64>,
    /// Where the tempo came from, e.g. "catalog" or "analysis"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bpm_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_ref: Option<String>,
}

impl Track {
    /// Create a track with the required fields. `duration_seconds` of zero is
    /// bumped to one so the invariant `duration > 0` always holds.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        duration_seconds: u32,
        bpm: Option<u32>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            duration_seconds: duration_seconds.max(1),
            bpm: bpm.filter(|&b| b > 0),
            bpm_confidence: None,
            bpm_source: None,
            artwork_ref: None,
        }
    }

    /// Attach tempo provenance.
    #[must_use]
    pub fn with_tempo_source(mut self, confidence: f64, source: impl Into<String>) -> Self {
        self.bpm_confidence = Some(confidence.clamp(0.0, 1.0));
        self.bpm_source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_artwork(mut self, artwork_ref: impl Into<String>) -> Self {
        self.artwork_ref = Some(artwork_ref.into());
        self
    }

    /// Same id, or same title and artist ignoring case.
    #[must_use]
    pub fn is_duplicate_of(&self, other: &Track) -> bool {
        self.id == other.id
            || (self.title.to_lowercase() == other.title.to_lowercase()
                && self.artist.to_lowercase() == other.artist.to_lowercase())
    }

    /// `Artist - Title` for log lines and listings.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.artist, self.title)
    }
}

/// Read-only source of the active candidate pool.
///
/// Implementations return a snapshot per call; the queue never holds on to
/// it across decision points.
pub trait TrackCatalog: Send {
    /// Tracks currently eligible for selection, in catalog order.
    fn tracks_in_active_pool(&self) -> Vec<Track>;
}

/// Catalog backed by a plain vector. Used by tests and by the simulator when
/// tracks come from a JSON file instead of the SQLite catalog.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    tracks: Vec<Track>,
}

impl InMemoryCatalog {
    #[must_use]
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            tracks: merge_pending(&[], &tracks),
        }
    }

    /// Add a track unless it duplicates one already in the pool.
    /// Returns whether the track was added.
    pub fn add(&mut self, track: Track) -> bool {
        if self.tracks.iter().any(|t| t.is_duplicate_of(&track)) {
            log::debug!("Ignoring duplicate track: {}", track.display_name());
            return false;
        }
        self.tracks.push(track);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl TrackCatalog for InMemoryCatalog {
    fn tracks_in_active_pool(&self) -> Vec<Track> {
        self.tracks.clone()
    }
}

/// Catalog results followed by every pending addition that duplicates
/// neither a catalog track nor an earlier pending one.
#[must_use]
pub fn merge_pending(catalog: &[Track], pending: &[Track]) -> Vec<Track> {
    let mut merged: Vec<Track> = catalog.to_vec();
    for track in pending {
        if !merged.iter().any(|existing| existing.is_duplicate_of(track)) {
            merged.push(track.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_by_id() {
        let a = Track::new("1", "Run", "Band", 200, Some(150));
        let b = Track::new("1", "Other", "Someone", 180, None);
        assert!(a.is_duplicate_of(&b));
    }

    #[test]
    fn test_duplicate_by_title_and_artist_ignores_case() {
        let a = Track::new("1", "Run Boy Run", "Woodkid", 200, Some(150));
        let b = Track::new("2", "run boy RUN", "WOODKID", 200, None);
        let c = Track::new("3", "Run Boy Run", "Cover Band", 200, None);
        assert!(a.is_duplicate_of(&b));
        assert!(!a.is_duplicate_of(&c));
    }

    #[test]
    fn test_merge_pending_skips_duplicates() {
        let catalog = vec![
            Track::new("1", "A", "X", 100, Some(120)),
            Track::new("2", "B", "Y", 100, Some(130)),
        ];
        let pending = vec![
            Track::new("2", "B", "Y", 100, Some(130)),
            Track::new("9", "a", "x", 100, None),
            Track::new("3", "C", "Z", 100, None),
            Track::new("4", "C", "z", 100, None),
        ];

        let merged = merge_pending(&catalog, &pending);
        let ids: Vec<_> = merged.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_new_enforces_positive_values() {
        let track = Track::new("1", "A", "X", 0, Some(0));
        assert_eq!(track.duration_seconds, 1);
        assert_eq!(track.bpm, None);
    }

    #[test]
    fn test_in_memory_catalog_add() {
        let mut catalog = InMemoryCatalog::new(vec![Track::new("1", "A", "X", 100, None)]);
        assert!(!catalog.add(Track::new("2", "a", "X", 100, None)));
        assert!(catalog.add(Track::new("3", "B", "X", 100, None)));
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_track_json_uses_camel_case() {
        let track = Track::new("1", "A", "X", 100, Some(128)).with_tempo_source(1.4, "analysis");
        let json = serde_json::to_value(&track).unwrap();
        assert_eq!(json["durationSeconds"], 100);
        assert_eq!(json["bpmConfidence"], 1.0);
        assert!(json.get("artworkRef").is_none());
    }
}
