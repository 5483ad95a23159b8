// One poller tick.
//
// A tick holds the cluster lock for its whole duration and performs at most
// one unit of advancing work: the next historical month if backfill has not
// caught up, otherwise an incremental catch-up of the current month.  After
// the work step it runs user discovery (best effort) and rebuilds every
// leaderboard (always attempted, even when the work step failed).
//
// Crash safety: in_progress is persisted before a historical month runs and
// cleared only after it completes, every artifact is written by rename, and
// the month's seen-set makes the retry idempotent.

use crate::cursor;
use crate::discover;
use crate::errors::PipelineError;
use crate::layout;
use crate::leaderboard;
use crate::ratelimit::Limits;
use crate::rollup;
use crate::sacct::{run_sacct, SacctCall, SacctSettings};
use anyhow::Result;
use chrono::{Duration, NaiveDate};
use sacctlog::{parse_record, Month, Timestamp};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info, warn};

pub struct PollConfig {
    pub root: PathBuf,
    pub cluster: String,
    pub backfill_start: NaiveDate,
    pub expected_n: u64,
    pub p: f64,
    pub limit_users: usize,
    pub home_base: PathBuf,
    pub sacct: SacctSettings,
}

/// The tick's final result document, printed as the last line of output.

#[derive(Debug, Serialize)]
pub struct TickResult {
    pub cluster: String,
    pub details: serde_json::Value,
    pub month: Option<Month>,
    pub status: String,
}

impl TickResult {
    pub fn succeeded(&self) -> bool {
        self.status == "ok"
    }
}

// Fetch one window and reduce it.  An adapter failure becomes the
// sacct_failed status; the cursor is left for the caller to manage.
fn fetch_and_reduce(
    cfg: &PollConfig,
    limits: &mut Limits,
    call: &SacctCall,
    since: NaiveDate,
    until: NaiveDate,
) -> (String, serde_json::Value) {
    let lines = match run_sacct(limits, call) {
        Ok(lines) => lines,
        Err(e) => return ("sacct_failed".to_string(), json!({ "error": e.to_string() })),
    };
    let records = lines.iter().filter_map(|ln| parse_record(ln));
    match rollup::reduce(&cfg.root, &cfg.cluster, since, until, records, cfg.expected_n, cfg.p) {
        Ok(stats) => match serde_json::to_value(&stats) {
            Ok(v) => ("ok".to_string(), v),
            Err(e) => ("error".to_string(), json!({ "error": e.to_string() })),
        },
        Err(e) => ("error".to_string(), json!({ "error": e.to_string() })),
    }
}

// One historical month: [first, next-first).  The monthly rollup file is
// created even when the month had no jobs, so completion is visible.
fn run_historical_month(
    cfg: &PollConfig,
    limits: &mut Limits,
    month: Month,
) -> Result<(String, serde_json::Value)> {
    let since = month.first_day();
    let until = month.succ().first_day();
    let call = cfg
        .sacct
        .call(&cfg.cluster, &since.to_string(), &until.to_string());
    let (status, details) = fetch_and_reduce(cfg, limits, &call, since, until);
    if status == "ok" {
        rollup::ensure_monthly_exists(&cfg.root, &cfg.cluster, month)?;
    }
    Ok((status, details))
}

// Incremental catch-up: [first-of-current-month, tomorrow).
fn run_incremental(
    cfg: &PollConfig,
    limits: &mut Limits,
    now: Timestamp,
) -> Result<(String, serde_json::Value)> {
    let current = Month::of(now);
    let since = current.first_day();
    let until = now.date_naive() + Duration::days(1);
    let call = cfg
        .sacct
        .call(&cfg.cluster, &since.to_string(), &until.to_string());
    let (status, details) = fetch_and_reduce(cfg, limits, &call, since, until);
    if status == "ok" {
        rollup::ensure_monthly_exists(&cfg.root, &cfg.cluster, current)?;
    }
    Ok((status, details))
}

/// Run one tick as of `now`.  Lock contention surfaces as the Locked error
/// kind before any mutation.

pub fn run_tick(cfg: &PollConfig, limits: &mut Limits, now: Timestamp) -> Result<TickResult> {
    let _lock = cursor::acquire_lock(&cfg.root, &cfg.cluster)?;
    layout::ensure_cluster_dirs(&cfg.root, &cfg.cluster)?;

    let mut state = cursor::load(&cfg.root, &cfg.cluster)?;
    if state.backfill_start.is_none() {
        state.backfill_start = Some(Month::containing(cfg.backfill_start));
        cursor::save(&cfg.root, &cfg.cluster, &state)?;
    }
    let backfill_start = state.backfill_start.ok_or_else(|| {
        PipelineError::ConfigInvalid("backfill_start not initialized".to_string())
    })?;

    let current_month = Month::of(now);
    let (status, details, month) =
        match cursor::determine_next_month(&state, backfill_start, current_month) {
            Some(month) => {
                state.in_progress = Some(month);
                cursor::save(&cfg.root, &cfg.cluster, &state)?;
                info!(cluster = %cfg.cluster, phase = "historical", step = %month, status = "start");
                let (status, details) = run_historical_month(cfg, limits, month)?;
                if status == "ok" {
                    state.last_complete_month = Some(month);
                    state.in_progress = None;
                    cursor::save(&cfg.root, &cfg.cluster, &state)?;
                }
                info!(cluster = %cfg.cluster, phase = "historical", step = %month, status = %status);
                (status, details, Some(month))
            }
            None => {
                info!(cluster = %cfg.cluster, phase = "incremental", status = "start");
                let (status, details) = run_incremental(cfg, limits, now)?;
                info!(cluster = %cfg.cluster, phase = "incremental", status = %status);
                (status, details, None)
            }
        };

    // Discovery is best effort; a failure must not fail the tick.
    match discover::run_discovery(
        &cfg.root,
        &cfg.cluster,
        limits,
        &cfg.sacct,
        &cfg.home_base,
        cfg.limit_users,
        cfg.expected_n,
        cfg.p,
    ) {
        Ok(outcome) => {
            info!(cluster = %cfg.cluster, phase = "discovery", status = %outcome.status,
                  new_users = outcome.new_users_found);
        }
        Err(e) => {
            warn!(cluster = %cfg.cluster, phase = "discovery", status = "error", msg = %e);
        }
    }

    // Leaderboards are rebuilt wholesale no matter how the work step went.
    match leaderboard::rebuild_at(&cfg.root, now) {
        Ok(results) => {
            info!(cluster = %cfg.cluster, phase = "leaderboards", status = "ok",
                  generated = results.len());
        }
        Err(e) => {
            error!(cluster = %cfg.cluster, phase = "leaderboards", status = "error", msg = %e);
        }
    }

    Ok(TickResult {
        cluster: cfg.cluster.clone(),
        details,
        month,
        status,
    })
}

// ---------------------------------------------------------------------------

#[cfg(test)]
use crate::sacct::stub_command;
#[cfg(test)]
use sacctlog::timestamp_from_ymdhms;
#[cfg(test)]
use std::path::Path;

#[cfg(test)]
fn test_config(root: &Path, cluster: &str, command: String) -> PollConfig {
    PollConfig {
        root: root.to_path_buf(),
        cluster: cluster.to_string(),
        backfill_start: sacctlog::parse_ymd("2025-07-01").unwrap(),
        expected_n: 10_000,
        p: sacctlog::DEFAULT_P,
        limit_users: discover::DEFAULT_LIMIT_USERS,
        home_base: root.join("no-home"),
        sacct: SacctSettings {
            command,
            ..SacctSettings::default()
        },
    }
}

// Backfill progression with the clock pinned to 2025-09-10: tick 1 completes
// July, tick 2 completes August (empty), tick 3 goes incremental.
#[test]
fn test_tick_backfill_progression() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let stubdir = tempfile::tempdir().unwrap();
    // July has one job; later windows return nothing.
    let cmd = stub_command(
        stubdir.path(),
        "fake_sacct",
        concat!(
            "case \"$*\" in\n",
            "*'-o User'*) printf 'alice\\n' ;;\n",
            "*'-S 2025-07-01'*) printf '1|alice|COMPLETED|3600|1|1|1000M|||||2025-07-20T00:00:00|2025-07-20T01:00:00\\n' ;;\n",
            "*) : ;;\n",
            "esac",
        ),
    );
    let cfg = test_config(root, "c1", cmd);
    let mut limits = Limits::new(600.0);
    let now = timestamp_from_ymdhms(2025, 9, 10, 12, 0, 0);

    let t1 = run_tick(&cfg, &mut limits, now).unwrap();
    assert_eq!(t1.status, "ok");
    assert_eq!(t1.month.map(|m| m.to_string()), Some("2025-07".to_string()));
    let state = cursor::load(root, "c1").unwrap();
    assert_eq!(state.last_complete_month.map(|m| m.to_string()), Some("2025-07".to_string()));
    assert!(state.in_progress.is_none());
    assert!(layout::monthly_path(root, "c1", "2025-07".parse().unwrap()).exists());
    // Leaderboards were rebuilt.
    assert!(layout::leaderboards_dir(root).join("alltime_clock_hours.json").exists());
    assert!(layout::leaderboards_dir(root).join("alltime.json").exists());

    let t2 = run_tick(&cfg, &mut limits, now).unwrap();
    assert_eq!(t2.status, "ok");
    assert_eq!(t2.month.map(|m| m.to_string()), Some("2025-08".to_string()));
    // August had no jobs but its rollup file exists.
    assert!(layout::monthly_path(root, "c1", "2025-08".parse().unwrap()).exists());

    let t3 = run_tick(&cfg, &mut limits, now).unwrap();
    assert_eq!(t3.status, "ok");
    assert!(t3.month.is_none()); // incremental
    assert!(layout::monthly_path(root, "c1", "2025-09".parse().unwrap()).exists());
}

// An adapter failure leaves in_progress set so the month is retried, and the
// tick reports sacct_failed.
#[test]
fn test_tick_failure_keeps_cursor_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let stubdir = tempfile::tempdir().unwrap();
    let cmd = stub_command(stubdir.path(), "fail_sacct", "exit 1");
    let mut cfg = test_config(root, "c1", cmd);
    cfg.sacct.retries = 1;
    let mut limits = Limits::new(600.0);
    let now = timestamp_from_ymdhms(2025, 9, 10, 12, 0, 0);

    let t = run_tick(&cfg, &mut limits, now).unwrap();
    assert_eq!(t.status, "sacct_failed");
    assert!(!t.succeeded());
    let state = cursor::load(root, "c1").unwrap();
    assert_eq!(state.in_progress.map(|m| m.to_string()), Some("2025-07".to_string()));
    assert!(state.last_complete_month.is_none());

    // Next tick retries the same month; once sacct recovers it completes.
    let stubdir2 = tempfile::tempdir().unwrap();
    cfg.sacct.command = stub_command(stubdir2.path(), "ok_sacct", ":");
    let t = run_tick(&cfg, &mut limits, now).unwrap();
    assert_eq!(t.status, "ok");
    assert_eq!(t.month.map(|m| m.to_string()), Some("2025-07".to_string()));
    let state = cursor::load(root, "c1").unwrap();
    assert_eq!(state.last_complete_month.map(|m| m.to_string()), Some("2025-07".to_string()));
    assert!(state.in_progress.is_none());
}

// While one process holds the lock, a tick fails with Locked and mutates
// nothing.
#[test]
fn test_tick_lock_contention() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let guard = cursor::acquire_lock(root, "c1").unwrap();

    let stubdir = tempfile::tempdir().unwrap();
    let cmd = stub_command(stubdir.path(), "fake_sacct", ":");
    let cfg = test_config(root, "c1", cmd);
    let mut limits = Limits::new(600.0);
    let now = timestamp_from_ymdhms(2025, 9, 10, 12, 0, 0);

    let err = run_tick(&cfg, &mut limits, now).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Locked(_))
    ));
    assert!(!cursor::state_path(root, "c1").exists());
    drop(guard);

    assert!(run_tick(&cfg, &mut limits, now).is_ok());
}
