//! Headless driver for the taskswarm coordination simulation.
//!
//! `run` advances a single world and exports per-tick metrics; `sweep` runs
//! independent replicas across worker counts in parallel and tabulates the
//! final counters. Both only read the core's public snapshots.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};
use taskswarm_core::{Protocol, SwarmConfig, SwarmWorld, TickBatch, TickObserver, TickSummary};
use taskswarm_index::BoundaryMode;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "taskswarm", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single simulation and export per-tick metrics.
    Run(RunArgs),
    /// Sweep worker counts across repeated replicas and tabulate results.
    Sweep(SweepArgs),
}

/// Simulation parameters shared by both subcommands.
#[derive(Args, Debug)]
struct SimArgs {
    /// RNG seed; omit for an entropy-derived seed.
    #[arg(long, env = "TASKSWARM_SEED")]
    seed: Option<u64>,

    /// Number of worker agents.
    #[arg(long, default_value_t = 10)]
    workers: u32,

    /// Number of tasks kept alive in the world.
    #[arg(long, default_value_t = 5)]
    tasks: u32,

    /// Coordination protocol: `random`, `call-out`, or `call-off`.
    #[arg(long, default_value = "random")]
    protocol: String,

    /// Maximum worker movement per tick.
    #[arg(long, default_value_t = 5.0)]
    speed: f32,

    /// Recruit broadcast radius.
    #[arg(long, default_value_t = 200.0)]
    comm_range: f32,

    /// Radius within which a worker perceives and works tasks.
    #[arg(long, default_value_t = 50.0)]
    action_range: f32,

    /// Ticks a worker waits or responds before giving up.
    #[arg(long, default_value_t = 10)]
    response_timeout: u32,

    /// Cooldown ticks of random walk after a release or timeout.
    #[arg(long, default_value_t = 5)]
    break_time: u32,

    /// Radius within which a task counts staffed waiters.
    #[arg(long, default_value_t = 50.0)]
    task_action_range: f32,

    /// Distinct workers a task needs before it starts executing.
    #[arg(long, default_value_t = 1)]
    workers_required: u32,

    /// Ticks of work once a task is staffed.
    #[arg(long, default_value_t = 3)]
    time_required: u32,

    /// Space width in world units.
    #[arg(long, default_value_t = 1000.0)]
    width: f32,

    /// Space height in world units.
    #[arg(long, default_value_t = 1000.0)]
    height: f32,

    /// Boundary handling: `clamp` or `wrap`.
    #[arg(long, default_value = "wrap")]
    boundary: String,
}

impl SimArgs {
    fn to_config(&self) -> Result<SwarmConfig> {
        let protocol: Protocol = self.protocol.parse()?;
        let boundary_mode: BoundaryMode = self.boundary.parse()?;
        let config = SwarmConfig {
            seed: self.seed,
            num_workers: self.workers,
            num_tasks: self.tasks,
            protocol,
            worker_speed: self.speed,
            worker_comm_range: self.comm_range,
            worker_action_range: self.action_range,
            worker_response_timeout: self.response_timeout,
            worker_break_time: self.break_time,
            task_action_range: self.task_action_range,
            task_workers_required: self.workers_required,
            task_time_required: self.time_required,
            space_width: self.width,
            space_height: self.height,
            boundary_mode,
            ..SwarmConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    sim: SimArgs,

    /// Number of ticks to simulate.
    #[arg(long, default_value_t = 2000)]
    ticks: u64,

    /// Write per-tick metrics to this CSV file.
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Write the final entity snapshot as JSON.
    #[arg(long)]
    snapshot_json: Option<PathBuf>,

    /// Emit a progress log line every N ticks (0 disables).
    #[arg(long, default_value_t = 200)]
    log_every: u64,
}

#[derive(Args, Debug)]
struct SweepArgs {
    #[command(flatten)]
    sim: SimArgs,

    /// Worker counts to sweep, comma separated.
    #[arg(long, default_value = "1,3,5,10,20,30")]
    worker_counts: String,

    /// Independent replicas per worker count.
    #[arg(long, default_value_t = 100)]
    iterations: u32,

    /// Ticks per replica.
    #[arg(long, default_value_t = 2000)]
    ticks: u64,

    /// Output CSV path.
    #[arg(long, default_value = "sweep.csv")]
    out: PathBuf,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match &cli.command {
        Command::Run(args) => run(args),
        Command::Sweep(args) => sweep(args),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

const SUMMARY_CSV_HEADER: &str = "tick,completed_total,completed_this_tick,active_tasks,\
idle_tasks,executing_tasks,searching,waiting,responding,working";

fn summary_csv_row(summary: &TickSummary) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{}",
        summary.tick.0,
        summary.completed_total,
        summary.completed_this_tick,
        summary.active_tasks,
        summary.idle_tasks,
        summary.executing_tasks,
        summary.searching_workers,
        summary.waiting_workers,
        summary.responding_workers,
        summary.working_workers,
    )
}

/// Streams one CSV row per committed tick.
struct CsvRecorder {
    out: BufWriter<File>,
    failed: bool,
}

impl CsvRecorder {
    fn create(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{SUMMARY_CSV_HEADER}")?;
        Ok(Self { out, failed: false })
    }
}

impl TickObserver for CsvRecorder {
    fn on_tick(&mut self, batch: &TickBatch) {
        if self.failed {
            return;
        }
        if let Err(error) = writeln!(self.out, "{}", summary_csv_row(&batch.summary)) {
            warn!(%error, "csv export failed; dropping further rows");
            self.failed = true;
        }
    }
}

fn run(args: &RunArgs) -> Result<()> {
    let config = args.sim.to_config()?;
    let mut world = match &args.csv {
        Some(path) => SwarmWorld::with_observer(config, Box::new(CsvRecorder::create(path)?))?,
        None => SwarmWorld::new(config)?,
    };
    info!(
        protocol = %world.config().protocol,
        workers = world.config().num_workers,
        tasks = world.config().num_tasks,
        ticks = args.ticks,
        "starting run",
    );

    for _ in 0..args.ticks {
        let summary = world.step();
        if args.log_every > 0 && summary.tick.0 % args.log_every == 0 {
            info!(
                tick = summary.tick.0,
                completed = summary.completed_total,
                active = summary.active_tasks,
                searching = summary.searching_workers,
                working = summary.working_workers,
                "progress",
            );
        }
    }

    if let Some(path) = &args.snapshot_json {
        let json = serde_json::to_string_pretty(&world.snapshot())?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    }

    info!(
        ticks = args.ticks,
        completed = world.completed_total(),
        "run finished",
    );
    Ok(())
}

fn parse_counts(list: &str) -> Result<Vec<u32>> {
    let counts: Vec<u32> = list
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .with_context(|| format!("invalid worker count `{part}`"))
        })
        .collect::<Result<_>>()?;
    if counts.is_empty() {
        anyhow::bail!("worker_counts must name at least one count");
    }
    Ok(counts)
}

struct SweepRow {
    workers: u32,
    iteration: u32,
    completed_total: u64,
    active_tasks: usize,
}

fn sweep(args: &SweepArgs) -> Result<()> {
    let counts = parse_counts(&args.worker_counts)?;
    let base = args.sim.to_config()?;
    let jobs: Vec<(u32, u32)> = counts
        .iter()
        .flat_map(|&workers| (0..args.iterations).map(move |iteration| (workers, iteration)))
        .collect();
    info!(jobs = jobs.len(), ticks = args.ticks, "starting sweep");

    // Replicas share no state; each derives its own seed from the base seed
    // so the whole sweep stays reproducible.
    let rows: Result<Vec<SweepRow>> = jobs
        .par_iter()
        .map(|&(workers, iteration)| {
            let mut config = base.clone();
            config.num_workers = workers;
            config.seed = base.seed.map(|seed| {
                seed.wrapping_add(u64::from(iteration))
                    .wrapping_add(u64::from(workers) << 32)
            });
            let mut world = SwarmWorld::new(config)?;
            for _ in 0..args.ticks {
                world.step();
            }
            let summary = world.snapshot().summary;
            Ok(SweepRow {
                workers,
                iteration,
                completed_total: summary.completed_total,
                active_tasks: summary.active_tasks,
            })
        })
        .collect();
    let mut rows = rows?;
    rows.sort_by_key(|row| (row.workers, row.iteration));

    let file = File::create(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "workers,iteration,ticks,completed_total,active_tasks")?;
    for row in &rows {
        writeln!(
            out,
            "{},{},{},{},{}",
            row.workers, row.iteration, args.ticks, row.completed_total, row.active_tasks,
        )?;
    }
    out.flush()?;

    info!(path = %args.out.display(), rows = rows.len(), "sweep written");
    Ok(())
}
