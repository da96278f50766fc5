//! SQLite track catalog.
//!
//! One `tracks` table, read in insertion order so catalog order (and with it
//! selection tie-breaks) is stable across runs.

use crate::track::{merge_pending, Track, TrackCatalog};
use anyhow::{Context, Result};
use log::{debug, error, info};
use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;

/// Open (or create) the catalog at `path` and make sure the schema exists.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or the schema cannot be
/// created.
pub fn connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open track catalog at {}", path.display()))?;
    init(&conn)?;
    Ok(conn)
}

/// Create the `tracks` table if it does not exist yet.
///
/// # Errors
///
/// Returns an error on invalid SQL or a read-only database.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tracks (
            id               TEXT    PRIMARY KEY,
            title            TEXT    NOT NULL,
            artist           TEXT    NOT NULL,
            duration_seconds INTEGER NOT NULL,
            bpm              INTEGER,
            bpm_confidence   REAL,
            bpm_source       TEXT,
            artwork_ref      TEXT
        )",
        (),
    )
    .context("Failed to create tracks table")?;
    Ok(())
}

/// Parse a JSON array of tracks, as accepted by `pulsetempo import`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a track array.
pub fn read_tracks_file(path: &Path) -> Result<Vec<Track>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let tracks: Vec<Track> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON array of tracks", path.display()))?;
    Ok(tracks
        .into_iter()
        .map(|t| Track {
            duration_seconds: t.duration_seconds.max(1),
            bpm: t.bpm.filter(|&b| b > 0),
            ..t
        })
        .collect())
}

/// Counts reported by [`import_tracks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub added: usize,
    pub skipped: usize,
}

/// Add `tracks` to the catalog, skipping duplicates of tracks already there
/// (and of each other). With `force` the catalog is emptied first.
///
/// # Errors
///
/// Returns an error if any statement fails; the import is then rolled back.
pub fn import_tracks(conn: &mut Connection, tracks: &[Track], force: bool) -> Result<ImportReport> {
    let existing = if force { Vec::new() } else { load_tracks(conn)? };
    let merged = merge_pending(&existing, tracks);
    let fresh = &merged[existing.len()..];

    let tx = conn.transaction().context("Failed to begin import transaction")?;
    if force {
        let removed = tx.execute("DELETE FROM tracks", ()).context("Failed to clear catalog")?;
        info!("Cleared {removed} tracks from catalog");
    }

    {
        let mut stmt = tx.prepare(
            "INSERT INTO tracks (id, title, artist, duration_seconds, bpm, bpm_confidence, bpm_source, artwork_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for track in fresh {
            stmt.execute(params![
                track.id,
                track.title,
                track.artist,
                track.duration_seconds,
                track.bpm,
                track.bpm_confidence,
                track.bpm_source,
                track.artwork_ref,
            ])
            .with_context(|| format!("Failed to insert track {}", track.display_name()))?;
        }
    }
    tx.commit().context("Committing import failed")?;

    let report = ImportReport {
        added: fresh.len(),
        skipped: tracks.len() - fresh.len(),
    };
    debug!("Import: {report:?}");
    Ok(report)
}

/// Every track, in catalog order.
///
/// # Errors
///
/// Returns an error if the query fails or a row cannot be decoded.
pub fn load_tracks(conn: &Connection) -> Result<Vec<Track>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, title, artist, duration_seconds, bpm, bpm_confidence, bpm_source, artwork_ref
             FROM tracks ORDER BY rowid",
        )
        .context("Invalid SQL statement when selecting tracks")?;

    let rows = stmt
        .query_map([], |row| {
            Ok(Track {
                id: row.get(0)?,
                title: row.get(1)?,
                artist: row.get(2)?,
                duration_seconds: row.get(3)?,
                bpm: row.get(4)?,
                bpm_confidence: row.get(5)?,
                bpm_source: row.get(6)?,
                artwork_ref: row.get(7)?,
            })
        })
        .context("Cannot query tracks")?;

    let mut tracks = Vec::new();
    for track in rows {
        tracks.push(track.context("Failed to decode track row")?);
    }
    Ok(tracks)
}

/// [`TrackCatalog`] over the SQLite file.
pub struct SqliteCatalog {
    conn: Connection,
}

impl SqliteCatalog {
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: connect(path)? })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl TrackCatalog for SqliteCatalog {
    fn tracks_in_active_pool(&self) -> Vec<Track> {
        load_tracks(&self.conn).unwrap_or_else(|e| {
            error!("Failed to read track catalog: {e:#}");
            Vec::new()
        })
    }
}
