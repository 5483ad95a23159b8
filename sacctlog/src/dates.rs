/// Date and time utilities for sacctlog.
///
/// Everything here is UTC.  The aggregation granularity of the pipeline is
/// the calendar month, so most of this file is arithmetic on `Month` values,
/// which serialize as `YYYY-MM` strings and order the way those strings do.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamps are always Utc.

pub type Timestamp = DateTime<Utc>;

/// now: the current time.

pub fn now() -> Timestamp {
    Utc::now()
}

/// The `asof` stamp written into persisted artifacts.

pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Construct timestamp from its date and time components.

pub fn timestamp_from_ymdhms(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> Timestamp {
    Utc.from_utc_datetime(
        &NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap(),
    )
}

/// Parse a `YYYY-MM-DD` date.  Anything else is a configuration error.

pub fn parse_ymd(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| anyhow!("invalid date (expected YYYY-MM-DD): {s}"))
}

/// A calendar month in UTC.  Orders chronologically, which coincides with the
/// lexicographic order of its `YYYY-MM` rendering.

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Month {
    year: i32,
    month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Result<Month> {
        if !(1..=12).contains(&month) {
            bail!("invalid month number {month}");
        }
        Ok(Month { year, month })
    }

    /// The month containing the given timestamp.

    pub fn of(t: Timestamp) -> Month {
        Month {
            year: t.year(),
            month: t.month(),
        }
    }

    /// The month containing the given date.

    pub fn containing(d: NaiveDate) -> Month {
        Month {
            year: d.year(),
            month: d.month(),
        }
    }

    /// The month containing a unix-seconds end stamp, None if the stamp does
    /// not denote a representable time.  An end stamp of 0 maps to 1970-01,
    /// which callers reject by windowing, not here.

    pub fn of_end_ts(end_ts: i64) -> Option<Month> {
        Utc.timestamp_opt(end_ts, 0).single().map(Month::of)
    }

    pub fn succ(self) -> Month {
        if self.month == 12 {
            Month {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Month {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// First day of the month, for building `[first, next_first)` windows.

    pub fn first_day(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap()
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Month> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| anyhow!("invalid month (expected YYYY-MM): {s}"))?;
        let year: i32 = y
            .parse()
            .map_err(|_| anyhow!("invalid month (expected YYYY-MM): {s}"))?;
        let month: u32 = m
            .parse()
            .map_err(|_| anyhow!("invalid month (expected YYYY-MM): {s}"))?;
        Month::new(year, month)
    }
}

impl From<Month> for String {
    fn from(m: Month) -> String {
        m.to_string()
    }
}

impl TryFrom<String> for Month {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Month> {
        s.parse()
    }
}

/// The months whose first day falls before `until`, starting at the month
/// containing `since`.  This is the half-open reduce window `[since, until)`
/// at month granularity: a partially covered month is included whole.

pub fn months_in_window(since: NaiveDate, until: NaiveDate) -> Vec<Month> {
    let mut months = Vec::new();
    let mut m = Month::containing(since);
    while m.first_day() < until {
        months.push(m);
        m = m.succ();
    }
    months
}

#[test]
fn test_month_roundtrip() {
    let m: Month = "2025-08".parse().unwrap();
    assert_eq!(m.to_string(), "2025-08");
    assert!("2025-13".parse::<Month>().is_err());
    assert!("2025-08-01".parse::<Month>().is_err());
    assert!("garbage".parse::<Month>().is_err());
}

#[test]
fn test_month_succ_and_order() {
    let dec: Month = "2024-12".parse().unwrap();
    assert_eq!(dec.succ().to_string(), "2025-01");
    let jul: Month = "2025-07".parse().unwrap();
    let aug: Month = "2025-08".parse().unwrap();
    assert!(jul < aug);
    assert_eq!(jul.succ(), aug);
}

#[test]
fn test_months_in_window() {
    // Full months.
    let ms = months_in_window(parse_ymd("2025-07-01").unwrap(), parse_ymd("2025-09-01").unwrap());
    assert_eq!(
        ms.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
        vec!["2025-07", "2025-08"]
    );
    // A partial month is included whole, [first-of-month, tomorrow).
    let ms = months_in_window(parse_ymd("2025-09-01").unwrap(), parse_ymd("2025-09-16").unwrap());
    assert_eq!(ms.len(), 1);
    assert_eq!(ms[0].to_string(), "2025-09");
    // Empty window.
    assert!(months_in_window(parse_ymd("2025-09-01").unwrap(), parse_ymd("2025-09-01").unwrap()).is_empty());
}

#[test]
fn test_month_of_end_ts() {
    // 2025-08-20T00:00:00Z
    let t = timestamp_from_ymdhms(2025, 8, 20, 0, 0, 0).timestamp();
    assert_eq!(Month::of_end_ts(t).unwrap().to_string(), "2025-08");
    // end_ts 0 is the epoch month; the reducer drops it by windowing.
    assert_eq!(Month::of_end_ts(0).unwrap().to_string(), "1970-01");
}
