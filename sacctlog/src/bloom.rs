// Month-scoped membership filter for job IDs.
//
// The reducer must never add a job twice, but an exact seen-set over a shared
// filesystem would grow without bound, so dedup uses a classic Bloom filter
// with a small tunable false-positive probability.  The on-disk format is a
// single JSON header line {"k":..,"m":..,"n":..,"p":..} followed by exactly
// ceil(m/8) raw bitset bytes; it is byte-identical across hosts so that any
// cluster endpoint on the shared filesystem can resume a month.

use crate::jsonio;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fs;
use std::path::Path;

pub const DEFAULT_P: f64 = 1e-4;
pub const DEFAULT_EXPECTED_N: u64 = 1_000_000;

// Substituted for a zero second hash word so the probe stride is never 0.
const H2_FALLBACK: u64 = 0x9e3779b97f4a7c15;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    k: u32,
    m: u64,
    #[serde(default)]
    n: u64,
    #[serde(default = "default_p")]
    p: f64,
}

fn default_p() -> f64 {
    DEFAULT_P
}

#[derive(Debug, Clone)]
pub struct SeenSet {
    m: u64,
    k: u32,
    n: u64,
    p: f64,
    bits: Vec<u8>,
}

impl SeenSet {
    /// Standard Bloom sizing: m = ceil(-(n ln p) / (ln 2)^2) bits and
    /// k = round((m/n) ln 2) hashes, at least 1.

    pub fn derive_m_k(expected_n: u64, p: f64) -> (u64, u32) {
        let n = expected_n.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil() as u64;
        let k = ((m as f64 / n) * ln2).round() as u32;
        (m, k.max(1))
    }

    pub fn create(expected_n: u64, p: f64) -> SeenSet {
        let (m, k) = SeenSet::derive_m_k(expected_n, p);
        SeenSet {
            m,
            k,
            n: 0,
            p,
            bits: vec![0u8; ((m + 7) / 8) as usize],
        }
    }

    // Double hashing over a SHA-1 digest of the key: the digest's first two
    // big-endian 64-bit words are h1 and the stride h2, and probe i is
    // (h1 + i*h2) mod m in exact arithmetic.
    fn indices(&self, key: &str) -> Vec<u64> {
        let digest = Sha1::digest(key.as_bytes());
        let h1 = u64::from_be_bytes(digest[0..8].try_into().unwrap());
        let mut h2 = u64::from_be_bytes(digest[8..16].try_into().unwrap());
        if h2 == 0 {
            h2 = H2_FALLBACK;
        }
        (0..self.k as u64)
            .map(|i| ((h1 as u128 + i as u128 * h2 as u128) % self.m as u128) as u64)
            .collect()
    }

    fn get_bit(&self, idx: u64) -> bool {
        self.bits[(idx >> 3) as usize] & (1 << (idx & 7)) != 0
    }

    fn set_bit(&mut self, idx: u64) {
        self.bits[(idx >> 3) as usize] |= 1 << (idx & 7);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.indices(key).iter().all(|&h| self.get_bit(h))
    }

    /// Set all probe bits for the key; `n` counts keys that set at least one
    /// new bit (distinct inserts, under the no-collision approximation).

    pub fn add(&mut self, key: &str) {
        let mut new_bit = false;
        for h in self.indices(key) {
            if !self.get_bit(h) {
                new_bit = true;
            }
            self.set_bit(h);
        }
        if new_bit {
            self.n += 1;
        }
    }

    /// Theoretical false-positive rate at the current fill: (1 - e^(-kn/m))^k.

    pub fn estimated_fpr(&self) -> f64 {
        if self.m == 0 {
            return 1.0;
        }
        (1.0 - (-(self.k as f64) * self.n as f64 / self.m as f64).exp()).powi(self.k as i32)
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn filled_bits(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Header plus derived fill statistics, for the stats subcommand.

    pub fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "m": self.m,
            "k": self.k,
            "n": self.n,
            "p_target": self.p,
            "p_estimate": self.estimated_fpr(),
            "filled_bits": self.filled_bits(),
            "fill_ratio": self.filled_bits() as f64 / self.m as f64,
            "bytes": self.bits.len(),
        })
    }

    /// Persist as header line + raw bitset via temp-file + rename.

    pub fn save(&self, path: &Path) -> Result<()> {
        let header = Header {
            k: self.k,
            m: self.m,
            n: self.n,
            p: self.p,
        };
        let mut bytes = serde_json::to_vec(&header)?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&self.bits);
        jsonio::atomic_write_bytes(path, &bytes)
    }

    /// Load from disk.  Errors indicate a malformed file; the caller decides
    /// whether to quarantine it and start fresh.

    pub fn load(path: &Path) -> Result<SeenSet> {
        let bytes = fs::read(path)?;
        let nl = match bytes.iter().position(|&b| b == b'\n') {
            Some(i) => i,
            None => bail!("seen-set file has no header line"),
        };
        let header: Header = serde_json::from_slice(&bytes[..nl])?;
        let bits = bytes[nl + 1..].to_vec();
        let expect = ((header.m + 7) / 8) as usize;
        if bits.len() != expect {
            bail!(
                "seen-set bitset length mismatch (expected {expect}, got {})",
                bits.len()
            );
        }
        Ok(SeenSet {
            m: header.m,
            k: header.k,
            n: header.n,
            p: header.p,
            bits,
        })
    }
}

#[test]
fn test_sizing() {
    // n=1e6, p=1e-4: m = ceil(1e6 * ln(1e4) / (ln 2)^2) bits, k = 13.
    let (m, k) = SeenSet::derive_m_k(1_000_000, 1e-4);
    assert_eq!(m, 19_170_117);
    assert_eq!(k, 13);
    // k is at least 1 even for absurd parameters.
    let (_, k) = SeenSet::derive_m_k(1_000_000, 0.9);
    assert!(k >= 1);
}

#[test]
fn test_add_contains() {
    let mut s = SeenSet::create(1000, 1e-4);
    assert!(!s.contains("123"));
    s.add("123");
    assert!(s.contains("123"));
    assert!(!s.contains("124"));
    assert_eq!(s.count(), 1);
    // Re-adding the same key does not bump the insert count.
    s.add("123");
    assert_eq!(s.count(), 1);
    s.add("124");
    assert_eq!(s.count(), 2);
    assert!(s.estimated_fpr() < 1e-4);
}

#[test]
fn test_save_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("2025-08.bloom");
    let mut s = SeenSet::create(1000, 1e-3);
    for i in 0..100 {
        s.add(&format!("job-{i}"));
    }
    s.save(&path).unwrap();
    let loaded = SeenSet::load(&path).unwrap();
    assert_eq!(loaded.count(), s.count());
    for i in 0..100 {
        assert!(loaded.contains(&format!("job-{i}")));
    }
    assert_eq!(loaded.filled_bits(), s.filled_bits());
}

#[test]
fn test_load_rejects_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let empty = dir.path().join("empty.bloom");
    fs::write(&empty, b"").unwrap();
    assert!(SeenSet::load(&empty).is_err());

    let nojson = dir.path().join("nojson.bloom");
    fs::write(&nojson, b"not a header\n\x00\x00").unwrap();
    assert!(SeenSet::load(&nojson).is_err());

    // Valid header but truncated bitset.
    let short = dir.path().join("short.bloom");
    fs::write(&short, b"{\"k\":2,\"m\":64,\"n\":0,\"p\":0.0001}\n\x00\x00").unwrap();
    assert!(SeenSet::load(&short).is_err());
}
