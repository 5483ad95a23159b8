// Parsers for the memory and TRES strings found in sacct output.
//
// All memory conversions are base-10: K = 1e3 bytes, M = 1e6, G = 1e9,
// T = 1e12, and a megabyte is 1e6 bytes.  Missing units mean MB.  These
// parsers never fail; unusable input yields zero, matching the drop-don't-die
// posture of the row normalizer.

const BYTES_PER_MB: f64 = 1e6;

fn unit_bytes(unit: char) -> f64 {
    match unit {
        'K' => 1e3,
        'M' => 1e6,
        'G' => 1e9,
        'T' => 1e12,
        _ => 1e6,
    }
}

// <digits> with at most one '.', ending in a digit.  This is the shape a
// memory quantity must have for the unit suffix to apply; anything else falls
// back to a bare float parse.
fn is_simple_decimal(s: &str) -> bool {
    let mut seen_digit = false;
    let mut seen_dot = false;
    for c in s.chars() {
        if c.is_ascii_digit() {
            seen_digit = true;
        } else if c == '.' && !seen_dot {
            seen_dot = true;
        } else {
            return false;
        }
    }
    seen_digit && s.ends_with(|c: char| c.is_ascii_digit())
}

/// Convert a sacct memory string such as `1234K`, `400M`, `2G`, `1.5T` to MB.
/// A unitless value is already MB.  Empty or unparseable input yields 0.

pub fn parse_mem_to_mb(value: &str) -> f64 {
    let s = value.trim();
    if s.is_empty() {
        return 0.0;
    }
    let (num_part, unit) = match s.chars().last() {
        Some(c) if "KkMmGgTt".contains(c) => (&s[..s.len() - 1], c.to_ascii_uppercase()),
        _ => (s, 'M'),
    };
    if is_simple_decimal(num_part) {
        let num: f64 = num_part.parse().unwrap_or(0.0);
        return num * unit_bytes(unit) / BYTES_PER_MB;
    }
    // Not <number><unit>; accept a plain number (already MB).
    s.parse::<f64>().unwrap_or(0.0)
}

/// Parse the ReqMem field into total requested MB.
///
/// The trailing scope suffix is `c` (per CPU, multiply by `alloc_cpus`) or
/// `n` (per node, multiply by `nnodes`); no suffix means per node.  The value
/// portion may itself carry a K/M/G/T unit.  Negative CPU or node counts are
/// clamped to 0.

pub fn parse_reqmem(reqmem: &str, alloc_cpus: i64, nnodes: i64) -> f64 {
    let s = reqmem.trim();
    if s.is_empty() {
        return 0.0;
    }
    let (core, per_cpu) = match s.chars().last() {
        Some('c') | Some('C') => (&s[..s.len() - 1], true),
        Some('n') | Some('N') => (&s[..s.len() - 1], false),
        _ => (s, false),
    };
    let base_mb = parse_mem_to_mb(core);
    let factor = if per_cpu { alloc_cpus.max(0) } else { nnodes.max(0) };
    base_mb * factor as f64
}

/// Extract the total GPU count from an AllocTRES string by summing every
/// comma-separated token of the form `gres/gpu(:model)=<int>`.

pub fn parse_gpu_count(alloc_tres: &str) -> i64 {
    if alloc_tres.is_empty() {
        return 0;
    }
    let mut total = 0i64;
    for token in alloc_tres.split(',') {
        let rest = match token.find("gres/gpu") {
            Some(pos) => &token[pos + "gres/gpu".len()..],
            None => continue,
        };
        let after_eq = match rest.find('=') {
            Some(eq) => &rest[eq + 1..],
            None => continue,
        };
        let digits: &str = {
            let end = after_eq
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(after_eq.len());
            &after_eq[..end]
        };
        if let Ok(v) = digits.parse::<i64>() {
            total += v;
        }
    }
    total
}

#[test]
fn test_parse_mem_to_mb() {
    assert_eq!(parse_mem_to_mb("1024K"), 1.024);
    assert_eq!(parse_mem_to_mb("1G"), 1000.0);
    assert_eq!(parse_mem_to_mb("1T"), 1_000_000.0);
    assert_eq!(parse_mem_to_mb("400M"), 400.0);
    assert_eq!(parse_mem_to_mb("1.5T"), 1_500_000.0);
    // No unit means MB.
    assert_eq!(parse_mem_to_mb("250"), 250.0);
    assert_eq!(parse_mem_to_mb(" 250 "), 250.0);
    // Empty and junk.
    assert_eq!(parse_mem_to_mb(""), 0.0);
    assert_eq!(parse_mem_to_mb("n/a"), 0.0);
    assert_eq!(parse_mem_to_mb("12x34M"), 0.0);
}

#[test]
fn test_parse_reqmem() {
    assert_eq!(parse_reqmem("4000Mc", 8, 1), 32000.0);
    assert_eq!(parse_reqmem("64Gn", 1, 2), 128000.0);
    // Missing suffix is per-node.
    assert_eq!(parse_reqmem("8G", 1, 2), 16000.0);
    // Negative factors clamp to zero.
    assert_eq!(parse_reqmem("4000Mc", -8, 1), 0.0);
    assert_eq!(parse_reqmem("64Gn", 1, -2), 0.0);
    assert_eq!(parse_reqmem("", 8, 2), 0.0);
}

#[test]
fn test_parse_gpu_count() {
    assert_eq!(parse_gpu_count("gres/gpu=4"), 4);
    assert_eq!(parse_gpu_count("gres/gpu:a100=2,gres/gpu=1"), 3);
    assert_eq!(parse_gpu_count("cpu=8,mem=32000M,gres/gpu=4"), 4);
    assert_eq!(parse_gpu_count("cpu=8,mem=32000M"), 0);
    assert_eq!(parse_gpu_count(""), 0);
    assert_eq!(parse_gpu_count("gres/gpu="), 0);
}
