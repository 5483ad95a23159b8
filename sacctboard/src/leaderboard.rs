// Cross-cluster leaderboards over the monthly rollups.
//
// Rebuilds are always wholesale: every (window, metric) file is regenerated
// from the monthly rollups present on disk, so a rebuild can run at any time
// and observe any subset of monthly updates without an incremental
// consistency invariant.
//
// Windows are month-granular.  A rolling window selects the months whose
// YYYY-MM is at or after the month containing (now - N days); the 30-day
// window additionally falls back to the last two months present so it is
// never empty or single-month right after a month boundary.
//
// Besides <window>_<metric>.json, the default metric (clock_hours) is also
// written to the bare <window>.json path.  That alias predates the
// per-metric naming and is kept for old consumers; treat it as deprecated.

use crate::layout;
use crate::rollup::MonthlyRollup;
use anyhow::Result;
use chrono::Duration;
use itertools::Itertools;
use sacctlog::{jsonio, now, now_iso, Month, Timestamp};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const WINDOWS: [&str; 3] = ["alltime", "rolling-30d", "rolling-365d"];

/// External metric name -> monthly rollup field.

pub const METRICS: [(&str, &str); 5] = [
    ("clock_hours", "total_clock_hours"),
    ("elapsed_hours", "total_elapsed_hours"),
    ("gpu_clock_hours", "total_gpu_clock_hours"),
    ("gpu_elapsed_hours", "gpu_elapsed_hours"),
    ("failed_jobs", "count_failed_jobs"),
];

#[derive(Debug, Clone, Serialize)]
pub struct Row {
    pub rank: usize,
    pub user: String,
    pub value: f64,
}

#[derive(Debug, Serialize)]
pub struct Leaderboard {
    pub asof: String,
    pub metric: String,
    pub rows: Vec<Row>,
    pub window: String,
}

#[derive(Debug, Serialize)]
pub struct RebuildSummary {
    pub metric: String,
    pub users: usize,
    pub window: String,
}

// Clusters that have a monthly rollup directory, sorted.
fn clusters(root: &Path) -> Vec<String> {
    let base = layout::clusters_dir(root);
    let entries = match fs::read_dir(&base) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|c| layout::monthly_dir(root, c).is_dir())
        .sorted()
        .collect()
}

// Every month for which any cluster has a rollup file, sorted.
fn all_months(root: &Path) -> Vec<Month> {
    clusters(root)
        .iter()
        .flat_map(|c| {
            fs::read_dir(layout::monthly_dir(root, c))
                .into_iter()
                .flatten()
                .flatten()
                .filter_map(|e| {
                    let name = e.file_name().into_string().ok()?;
                    name.strip_suffix(".json")?.parse::<Month>().ok()
                })
        })
        .unique()
        .sorted()
        .collect()
}

fn window_months(all: &[Month], window: &str, now: Timestamp) -> Vec<Month> {
    let days = match window {
        "alltime" => return all.to_vec(),
        "rolling-30d" => 30,
        "rolling-365d" => 365,
        _ => return Vec::new(),
    };
    let start = Month::of(now - Duration::days(days));
    let selected: Vec<Month> = all.iter().copied().filter(|m| *m >= start).collect();
    if window == "rolling-30d" && selected.len() < 2 && all.len() >= 2 {
        return all[all.len() - 2..].to_vec();
    }
    selected
}

// Rollup rows for (cluster, month); unreadable files read as empty here, the
// reducer owns quarantining.
fn monthly_rows(root: &Path, cluster: &str, month: Month) -> Vec<(String, crate::rollup::Metrics)> {
    let path = layout::monthly_path(root, cluster, month);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_slice::<MonthlyRollup>(&bytes) {
        Ok(doc) => doc
            .users
            .into_iter()
            .filter(|r| !r.username.is_empty())
            .map(|r| (r.username, r.metrics))
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn build_window_aggregate(
    root: &Path,
    window: &str,
    metric_internal: &str,
    at: Timestamp,
) -> HashMap<String, f64> {
    let months = window_months(&all_months(root), window, at);
    let mut agg: HashMap<String, f64> = HashMap::new();
    for cluster in clusters(root) {
        for month in &months {
            for (user, metrics) in monthly_rows(root, &cluster, *month) {
                let val = metrics.get(metric_internal);
                if val == 0.0 {
                    continue;
                }
                *agg.entry(user).or_insert(0.0) += val;
            }
        }
    }
    agg
}

/// Standard competition ranking: descending value, ties broken by ascending
/// username for stable output, equal values share the lowest rank, and the
/// next distinct value skips by the tie width.

fn rank(agg: HashMap<String, f64>) -> Vec<Row> {
    let mut items: Vec<(String, f64)> = agg.into_iter().collect();
    items.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    let mut rows = Vec::with_capacity(items.len());
    let mut rank = 0usize;
    let mut last: Option<f64> = None;
    for (idx, (user, value)) in items.into_iter().enumerate() {
        if last != Some(value) {
            rank = idx + 1;
            last = Some(value);
        }
        rows.push(Row {
            rank,
            user,
            value: jsonio::round6(value),
        });
    }
    rows
}

fn write_leaderboard(root: &Path, window: &str, metric_external: &str, rows: Vec<Row>) -> Result<()> {
    let doc = Leaderboard {
        asof: now_iso(),
        metric: metric_external.to_string(),
        rows,
        window: window.to_string(),
    };
    let dir = layout::leaderboards_dir(root);
    jsonio::write_json(&dir.join(format!("{window}_{metric_external}.json")), &doc)?;
    if metric_external == "clock_hours" {
        jsonio::write_json(&dir.join(format!("{window}.json")), &doc)?;
    }
    Ok(())
}

/// Rebuild every (window, metric) leaderboard as of the given time.

pub fn rebuild_at(root: &Path, at: Timestamp) -> Result<Vec<RebuildSummary>> {
    let mut results = Vec::new();
    for window in WINDOWS {
        for (external, internal) in METRICS {
            let agg = build_window_aggregate(root, window, internal, at);
            let users = agg.len();
            write_leaderboard(root, window, external, rank(agg))?;
            results.push(RebuildSummary {
                metric: external.to_string(),
                users,
                window: window.to_string(),
            });
        }
    }
    Ok(results)
}

pub fn rebuild(root: &Path) -> Result<Vec<RebuildSummary>> {
    rebuild_at(root, now())
}

// ---------------------------------------------------------------------------

#[cfg(test)]
use crate::rollup::Metrics;
#[cfg(test)]
use sacctlog::timestamp_from_ymdhms;

#[cfg(test)]
fn write_month(root: &Path, cluster: &str, month: &str, users: &[(&str, f64)]) {
    let doc = MonthlyRollup {
        asof: now_iso(),
        cluster: cluster.to_string(),
        month: month.parse().unwrap(),
        users: users
            .iter()
            .map(|(user, clock)| crate::rollup::UserRow {
                metrics: Metrics {
                    total_clock_hours: *clock,
                    total_elapsed_hours: *clock,
                    ..Metrics::default()
                },
                username: user.to_string(),
            })
            .collect(),
    };
    let month: Month = month.parse().unwrap();
    jsonio::write_json(&layout::monthly_path(root, cluster, month), &doc).unwrap();
}

#[cfg(test)]
fn read_board(root: &Path, name: &str) -> serde_json::Value {
    serde_json::from_slice(&fs::read(layout::leaderboards_dir(root).join(name)).unwrap()).unwrap()
}

// Two clusters, tie between alice and carol; competition ranking with a gap.
#[test]
fn test_rank_with_ties_across_clusters() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_month(root, "a", "2025-07", &[("alice", 2.0), ("bob", 1.0)]);
    write_month(root, "b", "2025-08", &[("alice", 3.0), ("carol", 5.0)]);
    rebuild_at(root, timestamp_from_ymdhms(2025, 9, 10, 0, 0, 0)).unwrap();

    let board = read_board(root, "alltime_clock_hours.json");
    let rows = board["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["user"], "alice");
    assert_eq!(rows[0]["rank"], 1);
    assert_eq!(rows[0]["value"], 5.0);
    assert_eq!(rows[1]["user"], "carol");
    assert_eq!(rows[1]["rank"], 1);
    assert_eq!(rows[2]["user"], "bob");
    assert_eq!(rows[2]["rank"], 3);

    // The deprecated alias carries the same document shape.
    let alias = read_board(root, "alltime.json");
    assert_eq!(alias["metric"], "clock_hours");
    assert_eq!(alias["rows"].as_array().unwrap().len(), 3);
}

#[test]
fn test_window_months_selection() {
    let all: Vec<Month> = ["2025-07", "2025-08"].iter().map(|s| s.parse().unwrap()).collect();
    let at = timestamp_from_ymdhms(2025, 9, 10, 0, 0, 0);
    // Threshold Aug 11 -> start month 2025-08 -> only August qualifies, but
    // the 30d window is padded to the last two months present.
    assert_eq!(window_months(&all, "rolling-30d", at).len(), 2);
    // 365d keeps both outright.
    assert_eq!(window_months(&all, "rolling-365d", at).len(), 2);
    // alltime is everything.
    assert_eq!(window_months(&all, "alltime", at).len(), 2);
    // Unknown windows select nothing.
    assert!(window_months(&all, "rolling-7d", at).is_empty());

    // With plenty of recent months the 30d fallback does not trigger.
    let all: Vec<Month> = ["2025-07", "2025-08", "2025-09"]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
    let months = window_months(&all, "rolling-30d", at);
    assert_eq!(
        months.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
        vec!["2025-08", "2025-09"]
    );
}

// Zero contributions are dropped instead of ranked.
#[test]
fn test_zero_values_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_month(root, "a", "2025-07", &[("alice", 2.0), ("idle", 0.0)]);
    rebuild_at(root, timestamp_from_ymdhms(2025, 7, 15, 0, 0, 0)).unwrap();
    let board = read_board(root, "alltime_clock_hours.json");
    let rows = board["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["user"], "alice");
    // A metric nobody recorded produces an empty board, not a missing file.
    let gpu = read_board(root, "alltime_gpu_clock_hours.json");
    assert!(gpu["rows"].as_array().unwrap().is_empty());
}
