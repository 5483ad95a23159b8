// Streaming reducer: normalized records in, monthly rollups and per-user
// lifetime aggregates out.
//
// The reduce window [since, until) is walked at month granularity.  Each
// month owns a seen-set; a job_id already present there is never re-added,
// which is what makes re-running a window idempotent.  Monthly rollups and
// seen-sets are only rewritten for months that actually changed, and the
// per-user deltas between the pre-reduce snapshot and the final state are
// then folded into the user aggregate files.
//
// Monthly rollup values are rounded to 6 decimals; user aggregates keep full
// precision.

use crate::layout;
use anyhow::Result;
use chrono::NaiveDate;
use sacctlog::{jsonio, months_in_window, now_iso, Month, NormalizedRecord, SeenSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const SCHEMA_VERSION: u32 = 1;

/// The nine per-user metric sums of a monthly rollup row.  Field names are
/// the canonical JSON names; counts are stored as numbers like everything
/// else.

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub count_failed_jobs: f64,
    #[serde(default)]
    pub count_gpu_jobs: f64,
    #[serde(default)]
    pub gpu_elapsed_hours: f64,
    #[serde(default, rename = "sum_avg_mem_MB")]
    pub sum_avg_mem_mb: f64,
    #[serde(default, rename = "sum_max_mem_MB")]
    pub sum_max_mem_mb: f64,
    #[serde(default, rename = "sum_req_mem_MB")]
    pub sum_req_mem_mb: f64,
    #[serde(default)]
    pub total_clock_hours: f64,
    #[serde(default)]
    pub total_elapsed_hours: f64,
    #[serde(default)]
    pub total_gpu_clock_hours: f64,
}

impl Metrics {
    pub fn accumulate(&mut self, rec: &NormalizedRecord) {
        self.total_clock_hours += rec.clock_hours;
        self.total_elapsed_hours += rec.elapsed_hours;
        self.sum_max_mem_mb += rec.max_mem_mb;
        self.sum_avg_mem_mb += rec.avg_mem_mb;
        self.sum_req_mem_mb += rec.req_mem_mb;
        if rec.gpu_count > 0 {
            self.count_gpu_jobs += 1.0;
        }
        self.total_gpu_clock_hours += rec.gpu_clock_hours;
        self.gpu_elapsed_hours += rec.gpu_elapsed_hours;
        if rec.failed {
            self.count_failed_jobs += 1.0;
        }
    }

    pub fn add(&mut self, other: &Metrics) {
        self.count_failed_jobs += other.count_failed_jobs;
        self.count_gpu_jobs += other.count_gpu_jobs;
        self.gpu_elapsed_hours += other.gpu_elapsed_hours;
        self.sum_avg_mem_mb += other.sum_avg_mem_mb;
        self.sum_max_mem_mb += other.sum_max_mem_mb;
        self.sum_req_mem_mb += other.sum_req_mem_mb;
        self.total_clock_hours += other.total_clock_hours;
        self.total_elapsed_hours += other.total_elapsed_hours;
        self.total_gpu_clock_hours += other.total_gpu_clock_hours;
    }

    pub fn delta(&self, before: &Metrics) -> Metrics {
        Metrics {
            count_failed_jobs: self.count_failed_jobs - before.count_failed_jobs,
            count_gpu_jobs: self.count_gpu_jobs - before.count_gpu_jobs,
            gpu_elapsed_hours: self.gpu_elapsed_hours - before.gpu_elapsed_hours,
            sum_avg_mem_mb: self.sum_avg_mem_mb - before.sum_avg_mem_mb,
            sum_max_mem_mb: self.sum_max_mem_mb - before.sum_max_mem_mb,
            sum_req_mem_mb: self.sum_req_mem_mb - before.sum_req_mem_mb,
            total_clock_hours: self.total_clock_hours - before.total_clock_hours,
            total_elapsed_hours: self.total_elapsed_hours - before.total_elapsed_hours,
            total_gpu_clock_hours: self.total_gpu_clock_hours - before.total_gpu_clock_hours,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Metrics::default()
    }

    pub fn rounded(&self) -> Metrics {
        Metrics {
            count_failed_jobs: jsonio::round6(self.count_failed_jobs),
            count_gpu_jobs: jsonio::round6(self.count_gpu_jobs),
            gpu_elapsed_hours: jsonio::round6(self.gpu_elapsed_hours),
            sum_avg_mem_mb: jsonio::round6(self.sum_avg_mem_mb),
            sum_max_mem_mb: jsonio::round6(self.sum_max_mem_mb),
            sum_req_mem_mb: jsonio::round6(self.sum_req_mem_mb),
            total_clock_hours: jsonio::round6(self.total_clock_hours),
            total_elapsed_hours: jsonio::round6(self.total_elapsed_hours),
            total_gpu_clock_hours: jsonio::round6(self.total_gpu_clock_hours),
        }
    }

    /// Look up a metric by its internal (rollup-field) name.

    pub fn get(&self, internal: &str) -> f64 {
        match internal {
            "count_failed_jobs" => self.count_failed_jobs,
            "count_gpu_jobs" => self.count_gpu_jobs,
            "gpu_elapsed_hours" => self.gpu_elapsed_hours,
            "sum_avg_mem_MB" => self.sum_avg_mem_mb,
            "sum_max_mem_MB" => self.sum_max_mem_mb,
            "sum_req_mem_MB" => self.sum_req_mem_mb,
            "total_clock_hours" => self.total_clock_hours,
            "total_elapsed_hours" => self.total_elapsed_hours,
            "total_gpu_clock_hours" => self.total_gpu_clock_hours,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    #[serde(flatten)]
    pub metrics: Metrics,
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MonthlyRollup {
    pub asof: String,
    pub cluster: String,
    pub month: Month,
    pub users: Vec<UserRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTotals {
    pub asof: String,
    #[serde(flatten)]
    pub totals: Metrics,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserAggregate {
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterTotals>,
    pub schema_version: u32,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct ReduceStats {
    pub months_changed: Vec<Month>,
    pub new_jobs: u64,
    pub processed: u64,
    pub users_changed: Vec<String>,
}

// In-memory state for one month of the window.
struct MonthState {
    seen: SeenSet,
    snapshot: BTreeMap<String, Metrics>,
    accum: BTreeMap<String, Metrics>,
    dirty: bool,
}

fn load_monthly_users(root: &Path, cluster: &str, month: Month) -> Result<BTreeMap<String, Metrics>> {
    let path = layout::monthly_path(root, cluster, month);
    let mut users = BTreeMap::new();
    if let Some(doc) = jsonio::read_json_or_quarantine::<MonthlyRollup>(&path)? {
        for row in doc.users {
            if row.username.is_empty() {
                continue;
            }
            users.insert(row.username, row.metrics);
        }
    }
    Ok(users)
}

fn save_monthly(
    root: &Path,
    cluster: &str,
    month: Month,
    users: &BTreeMap<String, Metrics>,
) -> Result<()> {
    let doc = MonthlyRollup {
        asof: now_iso(),
        cluster: cluster.to_string(),
        month,
        users: users
            .iter()
            .map(|(username, metrics)| UserRow {
                metrics: metrics.rounded(),
                username: username.clone(),
            })
            .collect(),
    };
    jsonio::write_json(&layout::monthly_path(root, cluster, month), &doc)
}

/// Create the month's rollup file as an empty document if it does not exist,
/// so a completed month is visible downstream even with no jobs.

pub fn ensure_monthly_exists(root: &Path, cluster: &str, month: Month) -> Result<()> {
    let path = layout::monthly_path(root, cluster, month);
    if !path.exists() {
        save_monthly(root, cluster, month, &BTreeMap::new())?;
    }
    Ok(())
}

// Load the month's seen-set, quarantining a malformed file, creating (and
// immediately persisting) a fresh one when absent.
fn load_or_create_seen(
    root: &Path,
    cluster: &str,
    month: Month,
    expected_n: u64,
    p: f64,
) -> Result<SeenSet> {
    let path = layout::seen_path(root, cluster, month);
    if path.exists() {
        match SeenSet::load(&path) {
            Ok(seen) => return Ok(seen),
            Err(_) => jsonio::quarantine(&path),
        }
    }
    let seen = SeenSet::create(expected_n, p);
    seen.save(&path)?;
    Ok(seen)
}

fn apply_user_deltas(
    root: &Path,
    cluster: &str,
    deltas: &BTreeMap<String, Metrics>,
) -> Result<()> {
    let asof = now_iso();
    for (user, delta) in deltas {
        let path = layout::user_path(root, cluster, user);
        let mut agg = jsonio::read_json_or_quarantine::<UserAggregate>(&path)?.unwrap_or_else(|| {
            UserAggregate {
                clusters: BTreeMap::new(),
                schema_version: SCHEMA_VERSION,
                username: user.clone(),
            }
        });
        let entry = agg
            .clusters
            .entry(cluster.to_string())
            .or_insert_with(|| ClusterTotals {
                asof: asof.clone(),
                totals: Metrics::default(),
            });
        entry.totals.add(delta);
        entry.asof = asof.clone();
        jsonio::write_json(&path, &agg)?;
    }
    Ok(())
}

/// Stream records through the window's seen-sets and fold the survivors into
/// monthly rollups and user aggregates.
///
/// `processed` counts records whose month lies inside the window, duplicates
/// included; records outside the window (notably end_ts == 0) are not
/// counted.  A record with an empty user is processed and remembered in the
/// seen-set but aggregated nowhere.

pub fn reduce<I>(
    root: &Path,
    cluster: &str,
    since: NaiveDate,
    until: NaiveDate,
    records: I,
    expected_n: u64,
    p: f64,
) -> Result<ReduceStats>
where
    I: IntoIterator<Item = NormalizedRecord>,
{
    layout::ensure_cluster_dirs(root, cluster)?;

    let mut months: BTreeMap<Month, MonthState> = BTreeMap::new();
    for m in months_in_window(since, until) {
        let seen = load_or_create_seen(root, cluster, m, expected_n, p)?;
        let existing = load_monthly_users(root, cluster, m)?;
        months.insert(
            m,
            MonthState {
                seen,
                snapshot: existing.clone(),
                accum: existing,
                dirty: false,
            },
        );
    }

    let mut processed = 0u64;
    let mut new_jobs = 0u64;
    for rec in records {
        if rec.job_id.is_empty() {
            continue;
        }
        let month = match Month::of_end_ts(rec.end_ts) {
            Some(m) => m,
            None => continue,
        };
        let state = match months.get_mut(&month) {
            Some(s) => s,
            None => continue, // outside the window
        };
        if state.seen.contains(&rec.job_id) {
            processed += 1;
            continue;
        }
        state.seen.add(&rec.job_id);
        state.dirty = true;
        processed += 1;
        new_jobs += 1;
        if rec.user.is_empty() {
            continue;
        }
        state
            .accum
            .entry(rec.user.clone())
            .or_default()
            .accumulate(&rec);
    }

    let mut deltas: BTreeMap<String, Metrics> = BTreeMap::new();
    let mut months_changed = Vec::new();
    for (month, state) in &months {
        if !state.dirty {
            continue;
        }
        months_changed.push(*month);
        state.seen.save(&layout::seen_path(root, cluster, *month))?;
        save_monthly(root, cluster, *month, &state.accum)?;
        for (user, metrics) in &state.accum {
            let before = state.snapshot.get(user).copied().unwrap_or_default();
            let d = metrics.delta(&before);
            if !d.is_zero() {
                deltas.entry(user.clone()).or_default().add(&d);
            }
        }
    }
    if !deltas.is_empty() {
        apply_user_deltas(root, cluster, &deltas)?;
    }

    Ok(ReduceStats {
        processed,
        new_jobs,
        months_changed,
        users_changed: deltas.keys().cloned().collect(),
    })
}

// ---------------------------------------------------------------------------

#[cfg(test)]
use sacctlog::{parse_record, timestamp_from_ymdhms, DEFAULT_EXPECTED_N, DEFAULT_P};
#[cfg(test)]
use std::fs;

#[cfg(test)]
fn d(s: &str) -> NaiveDate {
    sacctlog::parse_ymd(s).unwrap()
}

#[cfg(test)]
fn rec(job_id: &str, user: &str, state: &str, elapsed: u64, cpus: u32, tres: &str,
       req: &str, maxr: &str, avgr: &str, end: &str) -> NormalizedRecord {
    let line = format!(
        "{job_id}|{user}|{state}|{elapsed}|{cpus}|1|{req}|{maxr}|{avgr}|{tres}|||{end}"
    );
    parse_record(&line).unwrap()
}

#[cfg(test)]
fn read_monthly(root: &Path, cluster: &str, month: &str) -> MonthlyRollup {
    let path = layout::monthly_dir(root, cluster).join(format!("{month}.json"));
    serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
}

#[cfg(test)]
fn read_user(root: &Path, cluster: &str, user: &str) -> UserAggregate {
    serde_json::from_slice(&fs::read(layout::user_path(root, cluster, user)).unwrap()).unwrap()
}

// Two jobs for one user in one month; checks every metric and that a second
// identical run changes nothing on disk.
#[test]
fn test_reduce_single_user_month() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let records = vec![
        rec("1", "alice", "COMPLETED", 7200, 2, "gres/gpu=1", "1000M", "900M", "800M",
            "2025-08-10T12:00:00"),
        rec("2", "alice", "FAILED", 3600, 2, "", "500M", "400M", "300M",
            "2025-08-11T12:00:00"),
    ];
    let stats = reduce(root, "c1", d("2025-08-01"), d("2025-09-01"),
                       records.clone(), DEFAULT_EXPECTED_N, DEFAULT_P).unwrap();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.new_jobs, 2);
    assert_eq!(stats.months_changed.len(), 1);
    assert_eq!(stats.users_changed, vec!["alice".to_string()]);

    let monthly = read_monthly(root, "c1", "2025-08");
    assert_eq!(monthly.cluster, "c1");
    assert_eq!(monthly.users.len(), 1);
    let row = &monthly.users[0];
    assert_eq!(row.username, "alice");
    assert_eq!(row.metrics.total_clock_hours, 6.0);
    assert_eq!(row.metrics.total_elapsed_hours, 3.0);
    assert_eq!(row.metrics.sum_req_mem_mb, 1500.0);
    assert_eq!(row.metrics.sum_max_mem_mb, 1300.0);
    assert_eq!(row.metrics.sum_avg_mem_mb, 1100.0);
    assert_eq!(row.metrics.count_gpu_jobs, 1.0);
    assert_eq!(row.metrics.total_gpu_clock_hours, 2.0);
    assert_eq!(row.metrics.gpu_elapsed_hours, 2.0);
    assert_eq!(row.metrics.count_failed_jobs, 1.0);

    let agg = read_user(root, "c1", "alice");
    assert_eq!(agg.clusters["c1"].totals.total_clock_hours, 6.0);

    // Idempotence: the second run sees only duplicates and rewrites
    // nothing, so the rollup bytes are identical.
    let monthly_path = layout::monthly_dir(root, "c1").join("2025-08.json");
    let before = fs::read(&monthly_path).unwrap();
    let stats2 = reduce(root, "c1", d("2025-08-01"), d("2025-09-01"),
                        records, DEFAULT_EXPECTED_N, DEFAULT_P).unwrap();
    assert_eq!(stats2.processed, 2);
    assert_eq!(stats2.new_jobs, 0);
    assert!(stats2.months_changed.is_empty());
    assert!(stats2.users_changed.is_empty());
    assert_eq!(fs::read(&monthly_path).unwrap(), before);
}

// A record only touches the month its end_ts falls in, and out-of-window
// records are dropped without being counted.
#[test]
fn test_reduce_month_windowing() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let records = vec![
        rec("10", "alice", "COMPLETED", 3600, 1, "", "", "", "", "2025-07-20T00:00:00"),
        rec("11", "alice", "COMPLETED", 3600, 1, "", "", "", "", "2025-08-20T00:00:00"),
        rec("12", "alice", "COMPLETED", 3600, 1, "", "", "", "", "2025-09-20T00:00:00"),
        rec("13", "alice", "COMPLETED", 3600, 1, "", "", "", "", "Unknown"),
    ];
    let stats = reduce(root, "c1", d("2025-07-01"), d("2025-09-01"),
                       records, DEFAULT_EXPECTED_N, DEFAULT_P).unwrap();
    // Only the July and August records are in-window.
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.new_jobs, 2);
    assert_eq!(
        stats.months_changed.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
        vec!["2025-07", "2025-08"]
    );
    let july = read_monthly(root, "c1", "2025-07");
    assert_eq!(july.users[0].metrics.total_elapsed_hours, 1.0);
    let august = read_monthly(root, "c1", "2025-08");
    assert_eq!(august.users[0].metrics.total_elapsed_hours, 1.0);
    assert!(!layout::monthly_dir(root, "c1").join("2025-09.json").exists());
}

// The sum of a metric across monthly rollups equals the user aggregate.
#[test]
fn test_aggregate_consistency() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let batches: Vec<Vec<NormalizedRecord>> = vec![
        vec![
            rec("1", "alice", "COMPLETED", 5400, 3, "", "", "", "", "2025-07-05T08:00:00"),
            rec("2", "bob", "COMPLETED", 1800, 4, "", "", "", "", "2025-07-06T08:00:00"),
        ],
        vec![
            rec("3", "alice", "COMPLETED", 7200, 1, "", "", "", "", "2025-08-05T08:00:00"),
            // Duplicate of job 1: must not double-count.
            rec("1", "alice", "COMPLETED", 5400, 3, "", "", "", "", "2025-07-05T08:00:00"),
        ],
    ];
    for batch in batches {
        reduce(root, "c1", d("2025-07-01"), d("2025-09-01"), batch,
               DEFAULT_EXPECTED_N, DEFAULT_P).unwrap();
    }
    for user in ["alice", "bob"] {
        let mut monthly_sum = 0.0;
        for month in ["2025-07", "2025-08"] {
            let path = layout::monthly_dir(root, "c1").join(format!("{month}.json"));
            if !path.exists() {
                continue;
            }
            let doc: MonthlyRollup = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
            for row in &doc.users {
                if row.username == user {
                    monthly_sum += row.metrics.total_clock_hours;
                }
            }
        }
        let agg = read_user(root, "c1", user);
        assert!((agg.clusters["c1"].totals.total_clock_hours - monthly_sum).abs() < 1e-6);
    }
}

// Input order does not matter.
#[test]
fn test_order_invariance() {
    let mk = |ids: &[&str]| {
        ids.iter()
            .map(|id| rec(id, "alice", "COMPLETED", 3600, 2, "", "1G", "", "",
                          "2025-08-10T00:00:00"))
            .collect::<Vec<_>>()
    };
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    reduce(dir_a.path(), "c1", d("2025-08-01"), d("2025-09-01"),
           mk(&["1", "2", "3"]), DEFAULT_EXPECTED_N, DEFAULT_P).unwrap();
    reduce(dir_b.path(), "c1", d("2025-08-01"), d("2025-09-01"),
           mk(&["3", "1", "2"]), DEFAULT_EXPECTED_N, DEFAULT_P).unwrap();
    let a = read_monthly(dir_a.path(), "c1", "2025-08");
    let b = read_monthly(dir_b.path(), "c1", "2025-08");
    assert_eq!(a.users[0].metrics, b.users[0].metrics);
}

// An empty-user record counts as processed and occupies the seen-set but
// lands in no rollup row.  The normalizer never emits these, but the
// reducer contract covers them for direct callers.
#[test]
fn test_empty_user_processed_not_aggregated() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let mut ghost = rec("77", "x", "COMPLETED", 3600, 1, "", "", "", "",
                        "2025-08-10T00:00:00");
    ghost.user = String::new();
    let stats = reduce(root, "c1", d("2025-08-01"), d("2025-09-01"),
                       vec![ghost], DEFAULT_EXPECTED_N, DEFAULT_P).unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.new_jobs, 1);
    let monthly = read_monthly(root, "c1", "2025-08");
    assert!(monthly.users.is_empty());
}

// A corrupt rollup is quarantined and reduction starts that month fresh.
#[test]
fn test_corrupt_rollup_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let monthly_dir = layout::monthly_dir(root, "c1");
    fs::create_dir_all(&monthly_dir).unwrap();
    fs::write(monthly_dir.join("2025-08.json"), b"{ garbage").unwrap();
    let records = vec![rec("1", "alice", "COMPLETED", 3600, 1, "", "", "", "",
                           "2025-08-10T00:00:00")];
    reduce(root, "c1", d("2025-08-01"), d("2025-09-01"), records,
           DEFAULT_EXPECTED_N, DEFAULT_P).unwrap();
    assert!(monthly_dir.join("2025-08.json.bad").exists());
    let monthly = read_monthly(root, "c1", "2025-08");
    assert_eq!(monthly.users.len(), 1);
}

// end_ts month derivation uses UTC calendar breaks.
#[test]
fn test_month_boundary_is_utc() {
    let t = timestamp_from_ymdhms(2025, 7, 31, 23, 59, 59);
    assert_eq!(Month::of_end_ts(t.timestamp()).unwrap().to_string(), "2025-07");
    let t = timestamp_from_ymdhms(2025, 8, 1, 0, 0, 0);
    assert_eq!(Month::of_end_ts(t.timestamp()).unwrap().to_string(), "2025-08");
}
