// The per-cluster poll cursor and the lock that serializes all mutation of a
// cluster subtree.
//
// The cursor records how far historical backfill has progressed:
//
//   { "backfill_start": "YYYY-MM",
//     "last_complete_month": "YYYY-MM" | null,
//     "in_progress": "YYYY-MM" | null }
//
// in_progress stays set until its month completes, so a crashed or failed
// step is retried on the next tick.  The lock is an advisory exclusive flock
// on state/lock; acquisition is non-blocking and contention is a distinct
// error, not a wait.

use crate::errors::PipelineError;
use crate::layout;
use anyhow::Result;
use fs2::FileExt;
use sacctlog::{jsonio, Month};
use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const STATE_FILENAME: &str = "poll_cursor.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub backfill_start: Option<Month>,
    pub in_progress: Option<Month>,
    pub last_complete_month: Option<Month>,
}

pub fn state_path(root: &Path, cluster: &str) -> PathBuf {
    layout::state_dir(root, cluster).join(STATE_FILENAME)
}

/// Load the cursor; a missing or corrupt state file yields the empty cursor
/// (the corrupt one is quarantined first).

pub fn load(root: &Path, cluster: &str) -> Result<Cursor> {
    Ok(jsonio::read_json_or_quarantine(&state_path(root, cluster))?.unwrap_or_default())
}

pub fn save(root: &Path, cluster: &str, cursor: &Cursor) -> Result<()> {
    jsonio::write_json(&state_path(root, cluster), cursor)
}

/// The next month the historical phase should process, or None when backfill
/// has reached the current month.
///
/// A month left in_progress by a failed or interrupted step is always retried
/// first.  Otherwise the candidate is backfill_start (nothing completed yet)
/// or the successor of the last completed month, and the candidate must lie
/// strictly before the current month.

pub fn determine_next_month(cursor: &Cursor, backfill_start: Month, current_month: Month) -> Option<Month> {
    if let Some(m) = cursor.in_progress {
        return Some(m);
    }
    let candidate = match cursor.last_complete_month {
        None => backfill_start,
        Some(last) => last.succ(),
    };
    if candidate >= current_month {
        None
    } else {
        Some(candidate)
    }
}

/// Exclusive advisory lock on the cluster state directory, released when the
/// guard drops — on every exit path, including errors.

#[derive(Debug)]
pub struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Try to take the per-cluster lock.  Failure to lock (the file is held by
/// another process) is the Locked error kind; no mutation has happened.

pub fn acquire_lock(root: &Path, cluster: &str) -> Result<StateLock> {
    let dir = layout::state_dir(root, cluster);
    fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("lock"))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(StateLock { file }),
        Err(_) => Err(PipelineError::Locked(cluster.to_string()).into()),
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
fn m(s: &str) -> Month {
    s.parse().unwrap()
}

#[test]
fn test_determine_next_month() {
    let current = m("2025-09");

    // Fresh cursor: start at backfill_start.
    let cursor = Cursor::default();
    assert_eq!(determine_next_month(&cursor, m("2025-07"), current), Some(m("2025-07")));

    // After one completed month, the successor.
    let cursor = Cursor {
        backfill_start: Some(m("2025-07")),
        last_complete_month: Some(m("2025-07")),
        in_progress: None,
    };
    assert_eq!(determine_next_month(&cursor, m("2025-07"), current), Some(m("2025-08")));

    // Backfill caught up to the current month: nothing historical left.
    let cursor = Cursor {
        backfill_start: Some(m("2025-07")),
        last_complete_month: Some(m("2025-08")),
        in_progress: None,
    };
    assert_eq!(determine_next_month(&cursor, m("2025-07"), current), None);

    // An in-progress month is retried regardless of everything else.
    let cursor = Cursor {
        backfill_start: Some(m("2025-07")),
        last_complete_month: Some(m("2025-08")),
        in_progress: Some(m("2025-08")),
    };
    assert_eq!(determine_next_month(&cursor, m("2025-07"), current), Some(m("2025-08")));
}

#[test]
fn test_cursor_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    assert!(load(root, "c1").unwrap().backfill_start.is_none());
    let cursor = Cursor {
        backfill_start: Some(m("2025-07")),
        last_complete_month: Some(m("2025-08")),
        in_progress: None,
    };
    save(root, "c1", &cursor).unwrap();
    let loaded = load(root, "c1").unwrap();
    assert_eq!(loaded.backfill_start, Some(m("2025-07")));
    assert_eq!(loaded.last_complete_month, Some(m("2025-08")));
    assert_eq!(loaded.in_progress, None);

    // Corrupt state is quarantined and replaced with the empty cursor.
    std::fs::write(state_path(root, "c1"), b"{ nope").unwrap();
    assert!(load(root, "c1").unwrap().backfill_start.is_none());
    let mut bad = state_path(root, "c1").into_os_string();
    bad.push(".bad");
    assert!(std::path::Path::new(&bad).exists());
}

#[test]
fn test_lock_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let guard = acquire_lock(root, "c1").unwrap();
    // Second acquisition fails with the Locked kind while the guard lives.
    let err = acquire_lock(root, "c1").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Locked(_))
    ));
    // A different cluster is unaffected.
    assert!(acquire_lock(root, "c2").is_ok());
    drop(guard);
    assert!(acquire_lock(root, "c1").is_ok());
}
