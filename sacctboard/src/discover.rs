// User discovery and retroactive backfill.
//
// A user who submits their first job after their cluster's history has
// already been reduced would otherwise be missing from every completed
// month.  Discovery enumerates candidate users from the home directory tree
// and from a User-field accounting query over the completed range, and for
// each previously unknown user replays the completed months with user-scoped
// queries.  The seen-sets make that replay safe: existing jobs are already
// members, so only the new user's jobs land.
//
// Discovery never touches the poll cursor.

use crate::cursor;
use crate::layout;
use crate::ratelimit::Limits;
use crate::rollup;
use crate::sacct::{run_sacct, SacctSettings};
use anyhow::Result;
use itertools::Itertools;
use sacctlog::{now_iso, parse_record, Month};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const DEFAULT_LIMIT_USERS: usize = 5;

// Service accounts that may own home directories or sacct rows but never
// belong on a scoreboard.
const SYSTEM_USER_DENY: [&str; 17] = [
    "root", "daemon", "bin", "sys", "sync", "games", "man", "nobody", "mail", "postfix", "ftp",
    "sshd", "rpc", "rpcuser", "dbus", "ntp", "operator",
];

#[derive(Debug, Serialize)]
pub struct ProcessedUser {
    pub months_changed: Vec<Month>,
    pub user: String,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryOutcome {
    pub asof: String,
    pub cluster: String,
    pub home_users: usize,
    pub known_user_count: usize,
    pub new_users_found: usize,
    pub new_users_processed: Vec<ProcessedUser>,
    pub sacct_users: usize,
    pub status: String,
}

impl DiscoveryOutcome {
    fn rejected(cluster: &str, status: &str) -> DiscoveryOutcome {
        DiscoveryOutcome {
            asof: now_iso(),
            cluster: cluster.to_string(),
            home_users: 0,
            known_user_count: 0,
            new_users_found: 0,
            new_users_processed: Vec::new(),
            sacct_users: 0,
            status: status.to_string(),
        }
    }
}

fn is_candidate_name(name: &str) -> bool {
    !name.starts_with('.')
        && name.len() >= 2
        && !SYSTEM_USER_DENY.contains(&name)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// Home directory entries that look like real users, lowercased.  An
// unreadable home base yields no candidates rather than an error.
fn home_candidates(home_base: &Path) -> Vec<String> {
    let entries = match fs::read_dir(home_base) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| is_candidate_name(name))
        .map(|name| name.to_lowercase())
        .collect()
}

// Enumerate users the accounting system saw in the window, via a User-field
// query.  Failures degrade to an empty set; home enumeration still runs.
fn sacct_candidates(
    limits: &mut Limits,
    settings: &SacctSettings,
    cluster: &str,
    since: &str,
    until: &str,
) -> Vec<String> {
    let mut call = settings.call(cluster, since, until);
    call.fields = "User".to_string();
    let lines = match run_sacct(limits, &call) {
        Ok(lines) => lines,
        Err(_) => return Vec::new(),
    };
    lines
        .iter()
        .filter_map(|ln| {
            let user = ln.split('|').next().unwrap_or("").trim().to_lowercase();
            if user.is_empty() || SYSTEM_USER_DENY.contains(&user.as_str()) {
                None
            } else {
                Some(user)
            }
        })
        .collect()
}

// Users that already have an aggregate file.
fn known_users(root: &Path, cluster: &str) -> HashSet<String> {
    fs::read_dir(layout::users_dir(root, cluster))
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;
            Some(name.strip_suffix(".json")?.to_string())
        })
        .collect()
}

// Replay one completed month for one user.  Records are filtered to the user
// even though the query was user-scoped; the accounting command is not
// trusted to do the filtering exactly.
fn run_user_month(
    root: &Path,
    cluster: &str,
    limits: &mut Limits,
    settings: &SacctSettings,
    month: Month,
    username: &str,
    expected_n: u64,
    p: f64,
) -> Result<rollup::ReduceStats> {
    let since = month.first_day();
    let until = month.succ().first_day();
    let mut call = settings.call(cluster, &since.to_string(), &until.to_string());
    call.user = Some(username.to_string());
    let lines = run_sacct(limits, &call)?;
    let records = lines
        .iter()
        .filter_map(|ln| parse_record(ln))
        .filter(|rec| rec.user == username);
    rollup::reduce(root, cluster, since, until, records, expected_n, p)
}

/// One discovery pass.  Requires at least one completed month; processes at
/// most `limit_users` new users (ascending) across the completed range.

pub fn run_discovery(
    root: &Path,
    cluster: &str,
    limits: &mut Limits,
    settings: &SacctSettings,
    home_base: &Path,
    limit_users: usize,
    expected_n: u64,
    p: f64,
) -> Result<DiscoveryOutcome> {
    let state = cursor::load(root, cluster)?;
    let (backfill_start, last_complete) = match (state.backfill_start, state.last_complete_month) {
        (Some(b), Some(l)) => (b, l),
        _ => return Ok(DiscoveryOutcome::rejected(cluster, "no_complete_months")),
    };

    let mut months = Vec::new();
    let mut m = backfill_start;
    while m <= last_complete {
        months.push(m);
        m = m.succ();
    }

    let known = known_users(root, cluster);
    let home_users = home_candidates(home_base);
    let sacct_users = sacct_candidates(
        limits,
        settings,
        cluster,
        &backfill_start.first_day().to_string(),
        &last_complete.succ().first_day().to_string(),
    );

    let new_users: Vec<String> = home_users
        .iter()
        .chain(sacct_users.iter())
        .filter(|u| !known.contains(*u))
        .unique()
        .sorted()
        .cloned()
        .collect();

    let mut processed = Vec::new();
    for user in new_users.iter().take(limit_users) {
        let mut months_changed = Vec::new();
        for month in &months {
            // One bad month must not sink the rest of the user's backfill;
            // the seen-set makes a later retry safe.
            match run_user_month(root, cluster, limits, settings, *month, user, expected_n, p) {
                Ok(stats) => {
                    if !stats.months_changed.is_empty() {
                        months_changed.push(*month);
                    }
                }
                Err(e) => {
                    warn!(cluster, phase = "discovery", user = %user, month = %month, msg = %e);
                }
            }
        }
        info!(cluster, phase = "discovery", user = %user, months = months_changed.len());
        processed.push(ProcessedUser {
            months_changed,
            user: user.clone(),
        });
    }

    Ok(DiscoveryOutcome {
        asof: now_iso(),
        cluster: cluster.to_string(),
        home_users: home_users.len(),
        known_user_count: known.len(),
        new_users_found: new_users.len(),
        new_users_processed: processed,
        sacct_users: sacct_users.len(),
        status: "ok".to_string(),
    })
}

// ---------------------------------------------------------------------------

#[test]
fn test_is_candidate_name() {
    assert!(is_candidate_name("alice"));
    assert!(is_candidate_name("bob-42"));
    assert!(is_candidate_name("b_b"));
    assert!(!is_candidate_name("a")); // too short
    assert!(!is_candidate_name(".snapshots"));
    assert!(!is_candidate_name("root"));
    assert!(!is_candidate_name("lost+found"));
    assert!(!is_candidate_name("weird user"));
}

#[test]
fn test_home_candidates() {
    let home = tempfile::tempdir().unwrap();
    for d in ["Alice", "bob", "root", ".config", "x"] {
        fs::create_dir(home.path().join(d)).unwrap();
    }
    let mut users = home_candidates(home.path());
    users.sort();
    assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
    // Missing home base is not an error.
    assert!(home_candidates(Path::new("/no/such/base")).is_empty());
}

#[test]
fn test_discovery_requires_complete_month() {
    let dir = tempfile::tempdir().unwrap();
    let mut limits = Limits::new(600.0);
    let outcome = run_discovery(
        dir.path(),
        "c1",
        &mut limits,
        &SacctSettings::default(),
        Path::new("/no/such/base"),
        DEFAULT_LIMIT_USERS,
        sacctlog::DEFAULT_EXPECTED_N,
        sacctlog::DEFAULT_P,
    )
    .unwrap();
    assert_eq!(outcome.status, "no_complete_months");
}

// A new user found under home is backfilled into an already-reduced month
// without disturbing the users already there.
#[test]
fn test_discovery_backfills_new_user() {
    use crate::sacct::stub_command;
    use chrono::NaiveDate;

    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    // July already reduced with alice only.
    let alice = parse_record("1|alice|COMPLETED|3600|2|1|1G|||||cpu=2|2025-07-10T00:00:00").unwrap();
    rollup::reduce(
        root,
        "c1",
        NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
        NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
        vec![alice],
        sacctlog::DEFAULT_EXPECTED_N,
        sacctlog::DEFAULT_P,
    )
    .unwrap();
    cursor::save(
        root,
        "c1",
        &cursor::Cursor {
            backfill_start: Some("2025-07".parse().unwrap()),
            last_complete_month: Some("2025-07".parse().unwrap()),
            in_progress: None,
        },
    )
    .unwrap();

    // bob has a home directory and two July jobs in sacct.
    let home = tempfile::tempdir().unwrap();
    fs::create_dir(home.path().join("bob")).unwrap();
    let stubdir = tempfile::tempdir().unwrap();
    let cmd = stub_command(
        stubdir.path(),
        "fake_sacct",
        concat!(
            "case \"$*\" in\n",
            "*'-o User'*) printf 'bob\\nbob\\n' ;;\n",
            "*) printf '100|bob|COMPLETED|7200|4|1|2000M|1500M|1200M||||2025-07-05T10:00:00\\n",
            "101|bob|FAILED|3600|1|1|1000M|800M|700M||||2025-07-06T10:00:00\\n' ;;\n",
            "esac",
        ),
    );
    let settings = SacctSettings {
        command: cmd,
        ..SacctSettings::default()
    };
    let mut limits = Limits::new(600.0);
    let outcome = run_discovery(
        root,
        "c1",
        &mut limits,
        &settings,
        home.path(),
        DEFAULT_LIMIT_USERS,
        sacctlog::DEFAULT_EXPECTED_N,
        sacctlog::DEFAULT_P,
    )
    .unwrap();
    assert_eq!(outcome.status, "ok");
    assert_eq!(outcome.new_users_found, 1);
    assert_eq!(outcome.new_users_processed.len(), 1);
    assert_eq!(outcome.new_users_processed[0].user, "bob");

    // July now holds alice (unchanged) and bob.
    let monthly: rollup::MonthlyRollup = serde_json::from_slice(
        &fs::read(layout::monthly_path(root, "c1", "2025-07".parse().unwrap())).unwrap(),
    )
    .unwrap();
    assert_eq!(monthly.users.len(), 2);
    assert_eq!(monthly.users[0].username, "alice");
    assert_eq!(monthly.users[0].metrics.total_clock_hours, 2.0);
    assert_eq!(monthly.users[1].username, "bob");
    assert_eq!(monthly.users[1].metrics.total_clock_hours, 9.0);
    assert_eq!(monthly.users[1].metrics.count_failed_jobs, 1.0);
    assert!(layout::user_path(root, "c1", "bob").exists());
}
