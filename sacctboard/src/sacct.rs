// Adapter for the external `sacct` accounting command.
//
// Invocation shape: sacct -a -n -P -S <since> -E <until> -o <fields>, plus
// -u <user> for user-scoped queries.  Each call takes one token from the
// cluster's bucket first, runs with a per-attempt deadline, and retries with
// exponential backoff (1s doubling, capped at 30s) on non-zero exit, spawn
// failure, or timeout.  Step rows (first field containing '.') are filtered
// out of the result unless explicitly requested.
//
// Every attempt emits a structured log event with the window and outcome.

use crate::errors::PipelineError;
use crate::ratelimit::Limits;
use std::io;
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

pub const DEFAULT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_RETRIES: u32 = 3;
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const STDERR_LOG_LIMIT: usize = 500;

/// Fixed knobs for sacct invocations: which executable to run (tests point
/// this at a stub), the per-attempt deadline, and the total attempt count.

#[derive(Debug, Clone)]
pub struct SacctSettings {
    pub command: String,
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for SacctSettings {
    fn default() -> SacctSettings {
        SacctSettings {
            command: "sacct".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            retries: DEFAULT_RETRIES,
        }
    }
}

impl SacctSettings {
    pub fn call(&self, cluster: &str, since: &str, until: &str) -> SacctCall {
        SacctCall {
            cluster: cluster.to_string(),
            since: since.to_string(),
            until: until.to_string(),
            user: None,
            fields: sacctlog::SACCT_FIELDS.to_string(),
            include_steps: false,
            settings: self.clone(),
        }
    }
}

/// One accounting query over a half-open time window.

#[derive(Debug, Clone)]
pub struct SacctCall {
    pub cluster: String,
    pub since: String,
    pub until: String,
    pub user: Option<String>,
    pub fields: String,
    pub include_steps: bool,
    pub settings: SacctSettings,
}

/// Run the accounting command, returning the raw pipe-delimited rows.

pub fn run_sacct(limits: &mut Limits, call: &SacctCall) -> Result<Vec<String>, PipelineError> {
    limits.bucket(&call.cluster).acquire(&call.cluster);

    let mut attempt = 0u32;
    let mut backoff = BACKOFF_START;
    loop {
        attempt += 1;
        let started = Instant::now();
        let mut cmd = Command::new(&call.settings.command);
        cmd.args(["-a", "-n", "-P"])
            .arg("-S")
            .arg(&call.since)
            .arg("-E")
            .arg(&call.until)
            .arg("-o")
            .arg(&call.fields);
        if let Some(ref user) = call.user {
            cmd.arg("-u").arg(user);
        }
        let reason = match run_with_deadline(&mut cmd, call.settings.timeout) {
            Err(e) => {
                error!(
                    cluster = %call.cluster, phase = "sacct_call",
                    start = %call.since, end = %call.until,
                    calls = attempt, exit_code = "SPAWN", msg = %e,
                );
                format!("could not run {}: {e}", call.settings.command)
            }
            Ok(None) => {
                error!(
                    cluster = %call.cluster, phase = "sacct_call",
                    start = %call.since, end = %call.until,
                    calls = attempt, exit_code = "TIMEOUT",
                    msg = format!("timeout after {}s", call.settings.timeout.as_secs_f64()),
                );
                format!("timeout after {}s", call.settings.timeout.as_secs_f64())
            }
            Ok(Some((status, stdout, stderr))) => {
                if status.success() {
                    let duration_s = started.elapsed().as_secs_f64();
                    let rows = collect_rows(&stdout, call.include_steps);
                    info!(
                        cluster = %call.cluster, phase = "sacct_call",
                        start = %call.since, end = %call.until,
                        calls = attempt, exit_code = 0,
                        rows = rows.len(), duration_s,
                    );
                    return Ok(rows);
                }
                let rc = status.code().unwrap_or(-1);
                let stderr_txt: String = String::from_utf8_lossy(&stderr)
                    .chars()
                    .take(STDERR_LOG_LIMIT)
                    .collect();
                error!(
                    cluster = %call.cluster, phase = "sacct_call",
                    start = %call.since, end = %call.until,
                    calls = attempt, exit_code = rc, stderr = %stderr_txt,
                );
                format!("exit code {rc}")
            }
        };
        if attempt >= call.settings.retries {
            return Err(PipelineError::AccountingFailed {
                attempts: attempt,
                reason,
            });
        }
        thread::sleep(backoff);
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

fn collect_rows(stdout: &[u8], include_steps: bool) -> Vec<String> {
    let text = String::from_utf8_lossy(stdout);
    if include_steps {
        text.lines().map(str::to_string).collect()
    } else {
        text.lines()
            .filter(|ln| !ln.is_empty() && !ln.split('|').next().unwrap_or("").contains('.'))
            .map(str::to_string)
            .collect()
    }
}

// Run the command with a deadline.  Ok(None) means the deadline passed and
// the child was killed.  Output is drained on separate threads so a chatty
// child cannot deadlock against a full pipe.
fn run_with_deadline(
    cmd: &mut Command,
    timeout: Duration,
) -> io::Result<Option<(ExitStatus, Vec<u8>, Vec<u8>)>> {
    let mut child = cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;
    let mut out_pipe = child.stdout.take().expect("stdout was piped");
    let mut err_pipe = child.stderr.take().expect("stderr was piped");
    let out_thread = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = out_pipe.read_to_end(&mut buf);
        buf
    });
    let err_thread = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = err_pipe.read_to_end(&mut buf);
        buf
    });
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = out_thread.join().unwrap_or_default();
            let stderr = err_thread.join().unwrap_or_default();
            return Ok(Some((status, stdout, stderr)));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            let _ = out_thread.join();
            let _ = err_thread.join();
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(25));
    }
}

#[cfg(test)]
pub fn stub_command(dir: &std::path::Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perm = std::fs::metadata(&path).unwrap().permissions();
    perm.set_mode(0o755);
    std::fs::set_permissions(&path, perm).unwrap();
    path.to_str().unwrap().to_string()
}

#[cfg(test)]
fn test_call(command: String, retries: u32, timeout_ms: u64) -> SacctCall {
    SacctSettings {
        command,
        timeout: Duration::from_millis(timeout_ms),
        retries,
    }
    .call("testcluster", "2025-08-01", "2025-09-01")
}

#[test]
fn test_run_sacct_filters_steps() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = stub_command(
        dir.path(),
        "fake_sacct",
        "printf '1|a|COMPLETED|1|1|1|||||||2025-08-02T00:00:00\\n1.batch|a|COMPLETED|1|1|1|||||||2025-08-02T00:00:00\\n2|b|FAILED|1|1|1|||||||2025-08-02T00:00:00\\n'",
    );
    let mut limits = Limits::new(600.0);
    let rows = run_sacct(&mut limits, &test_call(cmd.clone(), 1, 5000)).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].starts_with("1|"));
    assert!(rows[1].starts_with("2|"));

    let mut call = test_call(cmd, 1, 5000);
    call.include_steps = true;
    let rows = run_sacct(&mut limits, &call).unwrap();
    assert_eq!(rows.len(), 3);
}

#[test]
fn test_run_sacct_failure_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = stub_command(dir.path(), "fail_sacct", "echo doom >&2; exit 7");
    let mut limits = Limits::new(600.0);
    match run_sacct(&mut limits, &test_call(cmd, 1, 5000)) {
        Err(PipelineError::AccountingFailed { attempts, reason }) => {
            assert_eq!(attempts, 1);
            assert!(reason.contains("exit code 7"));
        }
        other => panic!("expected AccountingFailed, got {other:?}"),
    }
}

#[test]
fn test_run_sacct_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let cmd = stub_command(dir.path(), "slow_sacct", "sleep 5");
    let mut limits = Limits::new(600.0);
    match run_sacct(&mut limits, &test_call(cmd, 1, 200)) {
        Err(PipelineError::AccountingFailed { reason, .. }) => {
            assert!(reason.contains("timeout"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn test_run_sacct_missing_binary() {
    let mut limits = Limits::new(600.0);
    let call = test_call("/definitely/not/here".to_string(), 1, 1000);
    assert!(run_sacct(&mut limits, &call).is_err());
}
