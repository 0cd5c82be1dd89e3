//! Snapshot retention selection
//!
//! Pure age/count logic: given the sessions that own snapshots, decide
//! which ones cleanup may delete. Separated from the manager so the
//! policy is testable without touching btrfs.

use chrono::{DateTime, Duration, Utc};

use mirrorsync_core::domain::newtypes::SessionId;

/// Age/count retention settings
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Snapshot sets older than this are deletion candidates
    pub max_age: Duration,
    /// The most recent N sessions are always kept, regardless of age
    pub keep_recent: usize,
}

/// Sessions whose snapshots may be deleted under `policy`.
///
/// `sessions` is (creation time, session id) in any order. The returned
/// ids are the ones to delete: older than `max_age` *and* outside the
/// `keep_recent` most recent.
pub fn select_expired(
    sessions: &[(DateTime<Utc>, SessionId)],
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<SessionId> {
    let mut ordered: Vec<&(DateTime<Utc>, SessionId)> = sessions.iter().collect();
    // Newest first; the head of the list is protected by keep_recent.
    ordered.sort_by(|a, b| b.0.cmp(&a.0));

    ordered
        .into_iter()
        .skip(policy.keep_recent)
        .filter(|(created, _)| now - *created > policy.max_age)
        .map(|(_, id)| id.clone())
        .collect()
}
