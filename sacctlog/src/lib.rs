// This library reads and normalizes the output of the Slurm `sacct` accounting
// command and provides the on-disk primitives shared by the aggregation
// pipeline: unit parsing, row normalization, UTC month arithmetic, the
// month-scoped seen-set membership filter, and atomic sorted-key JSON writes.
//
// The library deliberately knows nothing about polling, cursors, or
// leaderboards; those live in the `sacctboard` driver.

mod bloom;
mod dates;
pub mod jsonio;
mod record;
mod units;

// Month arithmetic and the UTC timestamp helpers.  All time handling in the
// pipeline is UTC; months are calendar months derived from UTC breaks.

pub use dates::{months_in_window, now, now_iso, parse_ymd, timestamp_from_ymdhms, Month, Timestamp};

// Parse a single pipe-delimited sacct row into a NormalizedRecord, silently
// dropping malformed rows, step rows, and rows without a user.

pub use record::{parse_record, FIELD_COUNT, SACCT_FIELDS};

// Memory and TRES string parsers (base-10 MB).

pub use units::{parse_gpu_count, parse_mem_to_mb, parse_reqmem};

// The month-scoped probabilistic membership filter used for job dedup.

pub use bloom::{SeenSet, DEFAULT_EXPECTED_N, DEFAULT_P};

// Atomic JSON persistence with the canonical key order, plus quarantine of
// corrupt artifacts.

pub use jsonio::{atomic_write_bytes, quarantine, read_json_or_quarantine, round6, write_json};

use serde::{Deserialize, Serialize};

/// The NormalizedRecord structure holds one job-level accounting row after
/// unit and semantic conversions: durations are hours, memory sizes are
/// base-10 MB, and the user name is lowercased with any `@realm` suffix
/// stripped.  `end_ts` is unix seconds UTC, 0 when the end time is unknown.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub job_id: String,
    pub user: String,
    pub state: String,
    pub end_ts: i64,
    pub elapsed_hours: f64,
    pub clock_hours: f64,
    pub gpu_count: i64,
    pub gpu_elapsed_hours: f64,
    pub gpu_clock_hours: f64,
    pub req_mem_mb: f64,
    pub max_mem_mb: f64,
    pub avg_mem_mb: f64,
    pub failed: bool,
}
