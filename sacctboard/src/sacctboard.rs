// `sacctboard` -- poll Slurm accounting into monthly usage rollups, per-user
// lifetime aggregates, and cross-cluster leaderboards.
//
// The normal deployment is a cron-driven `sacctboard poll --root ... --cluster
// ...` per cluster endpoint, all writing into one shared filesystem tree.  A
// tick performs at most one unit of advancing work (one historical month, or
// an incremental catch-up of the current month), runs user discovery, and
// rebuilds the leaderboards.  Every pipeline stage is also exposed as its own
// subcommand so it can be driven and inspected in isolation.
//
// Exit codes: 0 success, 1 work-step failure, 2 invalid configuration (via
// clap), 3 lock held by another process.
//
// TODO (normal pri)
//
// Feature: pass -M <cluster> to sacct for deployments where one submit host
// serves several clusters; today the cluster name only selects the state
// subtree and the rate bucket.

mod cursor;
mod discover;
mod errors;
mod layout;
mod leaderboard;
mod poll;
mod ratelimit;
mod rollup;
mod sacct;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use errors::PipelineError;
use ratelimit::Limits;
use sacct::SacctSettings;
use sacctlog::{parse_record, Month, NormalizedRecord};
use std::env;
use std::io;
use std::io::BufRead;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one poller tick: advance history or catch up the current month,
    /// then discover users and rebuild leaderboards
    Poll(PollArgs),

    /// Invoke the accounting command once and print the raw rows
    Sacct(SacctArgs),

    /// Parse raw accounting rows from stdin into normalized JSON lines
    Parse(ParseArgs),

    /// Read normalized JSON lines from stdin and update rollups
    Reduce(ReduceArgs),

    /// Show (and create if missing) the seen-set for a cluster month
    BloomStats(BloomStatsArgs),

    /// Rebuild all leaderboard files from the monthly rollups
    Leaderboards(LeaderboardsArgs),

    /// Discover new users and backfill their history
    Discover(DiscoverArgs),
}

#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Root scoreboard directory on the shared filesystem
    #[arg(long)]
    root: PathBuf,

    /// Cluster name (lock, rate bucket, and path segment)
    #[arg(long)]
    cluster: String,
}

#[derive(Args, Debug)]
pub struct SacctOpts {
    /// Accounting command to invoke
    #[arg(long, default_value = "sacct")]
    sacct_bin: String,

    /// Per-attempt timeout for the accounting command, seconds
    #[arg(long, default_value_t = sacct::DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Total attempts per accounting call
    #[arg(long, default_value_t = sacct::DEFAULT_RETRIES)]
    retries: u32,
}

impl SacctOpts {
    fn settings(&self) -> SacctSettings {
        SacctSettings {
            command: self.sacct_bin.clone(),
            timeout: Duration::from_secs(self.timeout),
            retries: self.retries,
        }
    }
}

// Default rate honors the environment override so cron lines stay short.
fn default_rate() -> f64 {
    env::var("SACCTBOARD_RATE_PER_MIN")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2.0)
}

#[derive(Args, Debug)]
pub struct PollArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Earliest date to begin historical backfill
    #[arg(long, default_value = "2000-01-01", value_parser = sacctlog::parse_ymd)]
    backfill_start: NaiveDate,

    /// Accounting calls per minute [default: $SACCTBOARD_RATE_PER_MIN or 2]
    #[arg(long, default_value_t = default_rate())]
    rate_per_min: f64,

    /// Expected jobs per month, for seen-set sizing
    #[arg(long, default_value_t = sacctlog::DEFAULT_EXPECTED_N)]
    expected_n: u64,

    /// Seen-set target false-positive probability
    #[arg(long, default_value_t = sacctlog::DEFAULT_P)]
    p: f64,

    /// Maximum new users processed per discovery pass
    #[arg(long, default_value_t = discover::DEFAULT_LIMIT_USERS)]
    limit_users: usize,

    /// Base directory scanned for candidate users
    #[arg(long, default_value = "/home")]
    home_base: PathBuf,

    #[command(flatten)]
    sacct_opts: SacctOpts,
}

#[derive(Args, Debug)]
pub struct SacctArgs {
    /// Cluster name (for logging and the rate bucket)
    #[arg(long)]
    cluster: String,

    /// Start of the window, inclusive (date or timestamp, passed through)
    #[arg(long)]
    since: String,

    /// End of the window, exclusive
    #[arg(long)]
    until: String,

    /// Include step records (JobID containing a dot)
    #[arg(long, default_value_t = false)]
    include_steps: bool,

    /// Comma list of output fields
    #[arg(long, default_value = sacctlog::SACCT_FIELDS)]
    fields: String,

    /// Restrict to a single user
    #[arg(long)]
    user: Option<String>,

    /// Accounting calls per minute [default: $SACCTBOARD_RATE_PER_MIN or 2]
    #[arg(long, default_value_t = default_rate())]
    rate_per_min: f64,

    #[command(flatten)]
    sacct_opts: SacctOpts,
}

#[derive(Args, Debug)]
pub struct ParseArgs {}

#[derive(Args, Debug)]
pub struct ReduceArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Inclusive start date of the reduce window
    #[arg(long, value_parser = sacctlog::parse_ymd)]
    since: NaiveDate,

    /// Exclusive end date of the reduce window
    #[arg(long, value_parser = sacctlog::parse_ymd)]
    until: NaiveDate,

    /// Expected jobs per month, for seen-set sizing
    #[arg(long, default_value_t = sacctlog::DEFAULT_EXPECTED_N)]
    expected_n: u64,

    /// Seen-set target false-positive probability
    #[arg(long, default_value_t = sacctlog::DEFAULT_P)]
    p: f64,
}

#[derive(Args, Debug)]
pub struct BloomStatsArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Month to inspect
    #[arg(long, value_parser = parse_month)]
    month: Month,

    /// Expected jobs per month, for seen-set sizing
    #[arg(long, default_value_t = sacctlog::DEFAULT_EXPECTED_N)]
    expected_n: u64,

    /// Seen-set target false-positive probability
    #[arg(long, default_value_t = sacctlog::DEFAULT_P)]
    p: f64,
}

#[derive(Args, Debug)]
pub struct LeaderboardsArgs {
    /// Root scoreboard directory on the shared filesystem
    #[arg(long)]
    root: PathBuf,
}

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Earliest date to seed the cursor with if it does not exist yet
    #[arg(long, default_value = "2000-01-01", value_parser = sacctlog::parse_ymd)]
    backfill_start: NaiveDate,

    /// Accounting calls per minute [default: $SACCTBOARD_RATE_PER_MIN or 2]
    #[arg(long, default_value_t = default_rate())]
    rate_per_min: f64,

    /// Maximum new users processed this run
    #[arg(long, default_value_t = discover::DEFAULT_LIMIT_USERS)]
    limit_users: usize,

    /// Base directory scanned for candidate users
    #[arg(long, default_value = "/home")]
    home_base: PathBuf,

    /// Expected jobs per month, for seen-set sizing
    #[arg(long, default_value_t = sacctlog::DEFAULT_EXPECTED_N)]
    expected_n: u64,

    /// Seen-set target false-positive probability
    #[arg(long, default_value_t = sacctlog::DEFAULT_P)]
    p: f64,

    #[command(flatten)]
    sacct_opts: SacctOpts,
}

fn parse_month(s: &str) -> Result<Month> {
    s.parse()
}

fn main() {
    init_logging();
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            let code = match e.downcast_ref::<PipelineError>() {
                Some(PipelineError::Locked(_)) => 3,
                Some(PipelineError::ConfigInvalid(_)) => 2,
                _ => 1,
            };
            eprintln!("ERROR: {}", e);
            code
        }
    };
    process::exit(code);
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_target(false)
        .with_env_filter(filter)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Poll(args) => cmd_poll(args),
        Commands::Sacct(args) => cmd_sacct(args),
        Commands::Parse(args) => cmd_parse(args),
        Commands::Reduce(args) => cmd_reduce(args),
        Commands::BloomStats(args) => cmd_bloom_stats(args),
        Commands::Leaderboards(args) => cmd_leaderboards(args),
        Commands::Discover(args) => cmd_discover(args),
    }
}

fn print_sorted_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(&serde_json::to_value(value)?)?);
    Ok(())
}

fn cmd_poll(args: PollArgs) -> Result<i32> {
    let cfg = poll::PollConfig {
        root: args.store.root,
        cluster: args.store.cluster,
        backfill_start: args.backfill_start,
        expected_n: args.expected_n,
        p: args.p,
        limit_users: args.limit_users,
        home_base: args.home_base,
        sacct: args.sacct_opts.settings(),
    };
    let mut limits = Limits::new(args.rate_per_min);
    let result = poll::run_tick(&cfg, &mut limits, sacctlog::now())?;
    print_sorted_json(&result)?;
    Ok(if result.succeeded() { 0 } else { 1 })
}

fn cmd_sacct(args: SacctArgs) -> Result<i32> {
    let mut call = args.sacct_opts.settings().call(&args.cluster, &args.since, &args.until);
    call.user = args.user;
    call.fields = args.fields;
    call.include_steps = args.include_steps;
    let mut limits = Limits::new(args.rate_per_min);
    let rows = sacct::run_sacct(&mut limits, &call)?;
    for row in rows {
        println!("{}", row);
    }
    Ok(0)
}

fn cmd_parse(_args: ParseArgs) -> Result<i32> {
    let stdin = io::stdin();
    let mut count = 0usize;
    for line in stdin.lock().lines() {
        let line = line?;
        if let Some(rec) = parse_record(&line) {
            print_sorted_json(&rec)?;
            count += 1;
        }
    }
    // Nothing parsed usually means the wrong thing was piped in.
    Ok(if count == 0 { 1 } else { 0 })
}

fn cmd_reduce(args: ReduceArgs) -> Result<i32> {
    let stdin = io::stdin();
    let records = stdin
        .lock()
        .lines()
        .filter_map(|line| line.ok())
        .filter_map(|line| serde_json::from_str::<NormalizedRecord>(&line).ok());
    let stats = rollup::reduce(
        &args.store.root,
        &args.store.cluster,
        args.since,
        args.until,
        records,
        args.expected_n,
        args.p,
    )?;
    print_sorted_json(&stats)?;
    Ok(0)
}

fn cmd_bloom_stats(args: BloomStatsArgs) -> Result<i32> {
    let path = layout::seen_path(&args.store.root, &args.store.cluster, args.month);
    let mut created = false;
    let seen = if path.exists() {
        match sacctlog::SeenSet::load(&path) {
            Ok(seen) => seen,
            Err(_) => {
                sacctlog::quarantine(&path);
                created = true;
                let seen = sacctlog::SeenSet::create(args.expected_n, args.p);
                seen.save(&path)?;
                seen
            }
        }
    } else {
        created = true;
        let seen = sacctlog::SeenSet::create(args.expected_n, args.p);
        seen.save(&path)?;
        seen
    };
    let mut stats = seen.stats();
    stats["path"] = serde_json::json!(path.display().to_string());
    stats["created"] = serde_json::json!(created);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(0)
}

fn cmd_leaderboards(args: LeaderboardsArgs) -> Result<i32> {
    let results = leaderboard::rebuild(&args.root)?;
    print_sorted_json(&serde_json::json!({ "results": results, "status": "ok" }))?;
    Ok(0)
}

fn cmd_discover(args: DiscoverArgs) -> Result<i32> {
    // Discovery mutates rollups and aggregates, so it honors the same
    // per-cluster lock as the poller.
    let _lock = cursor::acquire_lock(&args.store.root, &args.store.cluster)?;
    let mut state = cursor::load(&args.store.root, &args.store.cluster)?;
    if state.backfill_start.is_none() {
        state.backfill_start = Some(Month::containing(args.backfill_start));
        cursor::save(&args.store.root, &args.store.cluster, &state)?;
    }
    let mut limits = Limits::new(args.rate_per_min);
    let outcome = discover::run_discovery(
        &args.store.root,
        &args.store.cluster,
        &mut limits,
        &args.sacct_opts.settings(),
        &args.home_base,
        args.limit_users,
        args.expected_n,
        args.p,
    )?;
    print_sorted_json(&outcome)?;
    Ok(match outcome.status.as_str() {
        "ok" | "no_complete_months" => 0,
        _ => 1,
    })
}
