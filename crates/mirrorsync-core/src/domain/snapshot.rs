//! Snapshot records and naming
//!
//! A [`Snapshot`] represents one read-only btrfs snapshot taken for a
//! session. The on-disk layout is
//! `<root>/<YYYYmmdd-HHMMSS>-<session_id>/<phase>-<subvolume>-<YYYYmmdd-HHMMSS>`:
//! the directory name sorts chronologically, carries the owning session,
//! and each entry name encodes phase, subvolume, and creation time so
//! cleanup and rollback can identify related snapshots without any side
//! database.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{SessionId, SubvolumeName};

/// Timestamp format used in snapshot names. Lexicographic order equals
/// chronological order.
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Width of a rendered snapshot timestamp (`YYYYmmdd-HHMMSS`)
const TIMESTAMP_WIDTH: usize = 15;

/// Phase a snapshot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPhase {
    /// Taken immediately before any modification
    Pre,
    /// Taken after every operation succeeded
    Post,
}

impl std::fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotPhase::Pre => write!(f, "pre"),
            SnapshotPhase::Post => write!(f, "post"),
        }
    }
}

impl std::str::FromStr for SnapshotPhase {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre" => Ok(SnapshotPhase::Pre),
            "post" => Ok(SnapshotPhase::Post),
            other => Err(DomainError::InvalidSnapshotName(other.to_string())),
        }
    }
}

/// One read-only filesystem snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Subvolume the snapshot captures
    pub subvolume: SubvolumeName,
    /// Pre- or post-sync
    pub phase: SnapshotPhase,
    /// Creation time (second precision; matches the rendered name)
    pub created_at: DateTime<Utc>,
    /// Session that took the snapshot
    pub session_id: SessionId,
    /// Absolute path of the snapshot on the target
    pub path: PathBuf,
    /// Always true once created; kept explicit for the record
    pub read_only: bool,
}

/// Render a session directory name: `<timestamp>-<session_id>`
#[must_use]
pub fn session_dir_name(created_at: DateTime<Utc>, session_id: &SessionId) -> String {
    format!(
        "{}-{}",
        created_at.format(SNAPSHOT_TIMESTAMP_FORMAT),
        session_id
    )
}

/// Parse a session directory name back into (timestamp, session id)
pub fn parse_session_dir_name(name: &str) -> Result<(DateTime<Utc>, SessionId), DomainError> {
    if name.len() <= TIMESTAMP_WIDTH + 1 {
        return Err(DomainError::InvalidSnapshotName(name.to_string()));
    }
    let (ts, rest) = name.split_at(TIMESTAMP_WIDTH);
    let id = rest
        .strip_prefix('-')
        .ok_or_else(|| DomainError::InvalidSnapshotName(name.to_string()))?;
    let naive = NaiveDateTime::parse_from_str(ts, SNAPSHOT_TIMESTAMP_FORMAT)
        .map_err(|_| DomainError::InvalidSnapshotName(name.to_string()))?;
    Ok((naive.and_utc(), id.parse()?))
}

/// Render a snapshot entry name: `<phase>-<subvolume-slug>-<timestamp>`
#[must_use]
pub fn snapshot_entry_name(
    phase: SnapshotPhase,
    subvolume: &SubvolumeName,
    created_at: DateTime<Utc>,
) -> String {
    format!(
        "{phase}-{}-{}",
        subvolume.slug(),
        created_at.format(SNAPSHOT_TIMESTAMP_FORMAT)
    )
}

/// Parse a snapshot entry name back into (phase, subvolume slug, timestamp).
///
/// The subvolume comes back as its slug form; mapping a slug back to the
/// configured subvolume is the caller's concern (it knows the configured
/// set).
pub fn parse_snapshot_entry_name(
    name: &str,
) -> Result<(SnapshotPhase, String, DateTime<Utc>), DomainError> {
    let (phase_str, rest) = name
        .split_once('-')
        .ok_or_else(|| DomainError::InvalidSnapshotName(name.to_string()))?;
    let phase: SnapshotPhase = phase_str.parse()?;
    if rest.len() <= TIMESTAMP_WIDTH + 1 {
        return Err(DomainError::InvalidSnapshotName(name.to_string()));
    }
    let (slug, ts) = rest.split_at(rest.len() - TIMESTAMP_WIDTH);
    let slug = slug
        .strip_suffix('-')
        .ok_or_else(|| DomainError::InvalidSnapshotName(name.to_string()))?;
    let naive = NaiveDateTime::parse_from_str(ts, SNAPSHOT_TIMESTAMP_FORMAT)
        .map_err(|_| DomainError::InvalidSnapshotName(name.to_string()))?;
    Ok((phase, slug.to_string(), naive.and_utc()))
}
