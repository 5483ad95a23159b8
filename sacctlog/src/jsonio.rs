// Atomic JSON persistence with the canonical key order.
//
// Every artifact the pipeline persists goes through here: serialization runs
// via serde_json::Value, whose object map is a BTreeMap, so keys come out
// sorted; output is compact (no spaces around ',' or ':'); and the bytes land
// through a sibling ".tmp."-prefixed temp file renamed over the target, so a
// partial file is never visible.  A file that exists but does not parse is
// renamed aside with a ".bad" suffix and treated as absent.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Write raw bytes through a temp file + rename in the target's directory.

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new().prefix(".tmp.").tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)?;
    Ok(())
}

/// Serialize `value` as sorted-key compact JSON and write it atomically.

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let v = serde_json::to_value(value)?;
    atomic_write_bytes(path, &serde_json::to_vec(&v)?)
}

/// Rename a corrupt artifact aside (best effort) so a fresh one can be
/// written in its place.

pub fn quarantine(path: &Path) {
    let mut bad = path.as_os_str().to_owned();
    bad.push(".bad");
    warn!(path = %path.display(), "quarantining corrupt artifact");
    let _ = fs::rename(path, bad);
}

/// Read a JSON artifact.  Ok(None) if the file does not exist.  A file that
/// exists but does not deserialize is quarantined and reported as absent so
/// the caller starts from a fresh default; I/O errors propagate.

pub fn read_json_or_quarantine<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    match serde_json::from_slice(&bytes) {
        Ok(v) => Ok(Some(v)),
        Err(_) => {
            quarantine(path);
            Ok(None)
        }
    }
}

/// Round to 6 decimal places, the precision of monthly rollup and leaderboard
/// values.  User aggregates keep full precision and do not come through here.

pub fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

#[cfg(test)]
use serde::Deserialize;

#[cfg(test)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Doc {
    zebra: u32,
    apple: u32,
}

#[test]
fn test_write_json_sorted_compact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    write_json(&path, &Doc { zebra: 1, apple: 2 }).unwrap();
    let text = fs::read_to_string(&path).unwrap();
    // Keys sorted regardless of declaration order, compact separators.
    assert_eq!(text, "{\"apple\":2,\"zebra\":1}");
    // No temp litter left behind.
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp."))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_read_json_or_quarantine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doc.json");
    assert!(read_json_or_quarantine::<Doc>(&path).unwrap().is_none());

    write_json(&path, &Doc { zebra: 1, apple: 2 }).unwrap();
    let doc = read_json_or_quarantine::<Doc>(&path).unwrap().unwrap();
    assert_eq!(doc, Doc { zebra: 1, apple: 2 });

    fs::write(&path, b"{ not json").unwrap();
    assert!(read_json_or_quarantine::<Doc>(&path).unwrap().is_none());
    assert!(!path.exists());
    assert!(dir.path().join("doc.json.bad").exists());
}

#[test]
fn test_round6() {
    assert_eq!(round6(1.0000004), 1.0);
    assert_eq!(round6(1.0000006), 1.000001);
    assert_eq!(round6(2.5), 2.5);
}
