// Normalizer for raw sacct rows.
//
// A row is pipe-delimited with exactly 13 fields in this fixed order:
//
//   JobID|User|State|ElapsedRaw|AllocCPUS|NNodes|ReqMem|MaxRSS|AveRSS|AllocTRES|Submit|Start|End
//
// Rows that are not job-level records are silently dropped: wrong field
// count, empty JobID, JobID containing '.' (step records), empty User.

use crate::units::{parse_gpu_count, parse_mem_to_mb, parse_reqmem};
use crate::NormalizedRecord;
use chrono::{NaiveDateTime, TimeZone, Utc};

/// The field list requested from sacct, in row order.

pub const SACCT_FIELDS: &str =
    "JobID,User,State,ElapsedRaw,AllocCPUS,NNodes,ReqMem,MaxRSS,AveRSS,AllocTRES,Submit,Start,End";

pub const FIELD_COUNT: usize = 13;

// Field positions in the row.
const IDX_JOBID: usize = 0;
const IDX_USER: usize = 1;
const IDX_STATE: usize = 2;
const IDX_ELAPSEDRAW: usize = 3;
const IDX_ALLOC_CPUS: usize = 4;
const IDX_NNODES: usize = 5;
const IDX_REQMEM: usize = 6;
const IDX_MAXRSS: usize = 7;
const IDX_AVERSS: usize = 8;
const IDX_ALLOCTRES: usize = 9;
const IDX_END: usize = 12;

// States whose first whitespace token marks the job as failed.  CANCELLED is
// never a failure, even as "CANCELLED by <uid>".
const FAIL_STATES: [&str; 5] = ["FAILED", "NODE_FAIL", "OUT_OF_MEMORY", "PREEMPTED", "TIMEOUT"];

// End is a naive YYYY-MM-DDTHH:MM:SS interpreted as UTC.  "Unknown", "None",
// empty, and unparseable all mean "no end time" and yield 0.
fn parse_end_ts(val: &str) -> i64 {
    if val.is_empty() || val == "Unknown" || val == "None" {
        return 0;
    }
    match NaiveDateTime::parse_from_str(val, "%Y-%m-%dT%H:%M:%S") {
        Ok(dt) => Utc.from_utc_datetime(&dt).timestamp(),
        Err(_) => 0,
    }
}

/// Parse one sacct row into a NormalizedRecord, or None if the row is not a
/// job-level record.  Numeric fields that fail to parse become 0 rather than
/// invalidating the record.

pub fn parse_record(line: &str) -> Option<NormalizedRecord> {
    let line = line.trim_end_matches('\n');
    if line.is_empty() {
        return None;
    }
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != FIELD_COUNT {
        return None;
    }
    let job_id = parts[IDX_JOBID];
    if job_id.is_empty() || job_id.contains('.') {
        return None; // step record
    }
    let user_raw = parts[IDX_USER].trim();
    if user_raw.is_empty() {
        return None;
    }
    let user = user_raw.split('@').next().unwrap_or("").to_lowercase();
    let state = parts[IDX_STATE].trim().to_string();

    let elapsed_raw: f64 = parts[IDX_ELAPSEDRAW].trim().parse().unwrap_or(0.0);
    let elapsed_hours = elapsed_raw / 3600.0;
    let alloc_cpus: i64 = parts[IDX_ALLOC_CPUS].trim().parse().unwrap_or(0);
    let nnodes: i64 = parts[IDX_NNODES].trim().parse().unwrap_or(0);
    let clock_hours = alloc_cpus as f64 * elapsed_hours;

    let req_mem_mb = parse_reqmem(parts[IDX_REQMEM], alloc_cpus, nnodes);
    let max_mem_mb = parse_mem_to_mb(parts[IDX_MAXRSS]);
    let avg_mem_mb = parse_mem_to_mb(parts[IDX_AVERSS]);

    let gpu_count = parse_gpu_count(parts[IDX_ALLOCTRES]);
    let gpu_elapsed_hours = if gpu_count > 0 { elapsed_hours } else { 0.0 };
    let gpu_clock_hours = gpu_count as f64 * elapsed_hours;

    let failed = match state.split_whitespace().next() {
        Some(tok) => FAIL_STATES.contains(&tok),
        None => false,
    };
    let end_ts = parse_end_ts(parts[IDX_END]);

    Some(NormalizedRecord {
        job_id: job_id.to_string(),
        user,
        state,
        end_ts,
        elapsed_hours,
        clock_hours,
        gpu_count,
        gpu_elapsed_hours,
        gpu_clock_hours,
        req_mem_mb,
        max_mem_mb,
        avg_mem_mb,
        failed,
    })
}

#[cfg(test)]
fn row(fields: &[&str; 13]) -> String {
    fields.join("|")
}

#[test]
fn test_parse_record_basic() {
    let line = row(&[
        "12345",
        "Alice@CLUSTER.EXAMPLE.EDU",
        "COMPLETED",
        "7200",
        "2",
        "1",
        "1000M",
        "900M",
        "800M",
        "cpu=2,gres/gpu=1",
        "2025-08-01T00:00:00",
        "2025-08-01T01:00:00",
        "2025-08-10T12:00:00",
    ]);
    let r = parse_record(&line).unwrap();
    assert_eq!(r.job_id, "12345");
    assert_eq!(r.user, "alice");
    assert_eq!(r.elapsed_hours, 2.0);
    assert_eq!(r.clock_hours, 4.0);
    assert_eq!(r.gpu_count, 1);
    assert_eq!(r.gpu_elapsed_hours, 2.0);
    assert_eq!(r.gpu_clock_hours, 2.0);
    assert_eq!(r.req_mem_mb, 1000.0);
    assert_eq!(r.max_mem_mb, 900.0);
    assert_eq!(r.avg_mem_mb, 800.0);
    assert!(!r.failed);
    // 2025-08-10T12:00:00Z
    assert_eq!(r.end_ts, crate::timestamp_from_ymdhms(2025, 8, 10, 12, 0, 0).timestamp());
}

#[test]
fn test_parse_record_drops() {
    // Step record.
    let step = row(&[
        "12345.batch", "alice", "COMPLETED", "60", "1", "1", "", "", "", "", "", "",
        "2025-08-10T12:00:00",
    ]);
    assert!(parse_record(&step).is_none());
    // Wrong field count.
    assert!(parse_record("1|2|3").is_none());
    // Empty user.
    let nouser = row(&[
        "12345", "", "COMPLETED", "60", "1", "1", "", "", "", "", "", "", "2025-08-10T12:00:00",
    ]);
    assert!(parse_record(&nouser).is_none());
    // Empty line.
    assert!(parse_record("").is_none());
}

#[test]
fn test_parse_record_failure_states() {
    let mk = |state: &str| {
        row(&[
            "1", "bob", state, "60", "1", "1", "", "", "", "", "", "", "2025-08-10T12:00:00",
        ])
    };
    assert!(parse_record(&mk("FAILED")).unwrap().failed);
    assert!(parse_record(&mk("TIMEOUT")).unwrap().failed);
    assert!(parse_record(&mk("OUT_OF_MEMORY")).unwrap().failed);
    // CANCELLED is never failed, even with a trailing "by <uid>".
    assert!(!parse_record(&mk("CANCELLED")).unwrap().failed);
    assert!(!parse_record(&mk("CANCELLED by 1234")).unwrap().failed);
    // The check is whole-token equality on the first token.
    assert!(!parse_record(&mk("FAILED+")).unwrap().failed);
    // "FAILED something" fails on the first token.
    assert!(parse_record(&mk("FAILED by node")).unwrap().failed);
}

#[test]
fn test_parse_record_end_ts() {
    let mk = |end: &str| {
        row(&["1", "bob", "COMPLETED", "60", "1", "1", "", "", "", "", "", "", end])
    };
    assert_eq!(parse_record(&mk("Unknown")).unwrap().end_ts, 0);
    assert_eq!(parse_record(&mk("None")).unwrap().end_ts, 0);
    assert_eq!(parse_record(&mk("")).unwrap().end_ts, 0);
    assert_eq!(parse_record(&mk("2025-08-10 12:00:00")).unwrap().end_ts, 0);
    assert!(parse_record(&mk("2025-08-10T12:00:00")).unwrap().end_ts > 0);
}

#[test]
fn test_parse_record_numeric_fallbacks() {
    let line = row(&[
        "9", "carol", "RUNNING", "notanumber", "x", "y", "junk", "junk", "junk", "junk", "", "",
        "Unknown",
    ]);
    let r = parse_record(&line).unwrap();
    assert_eq!(r.elapsed_hours, 0.0);
    assert_eq!(r.clock_hours, 0.0);
    assert_eq!(r.req_mem_mb, 0.0);
    assert_eq!(r.gpu_count, 0);
}
