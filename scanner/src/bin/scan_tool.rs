//! Scan controller CLI.
//!
//! Subcommands:
//! - `config`: write a scan config file from command-line ranges
//! - `simulate`: run or resume a scan against the simulated rig
//! - `list`: list runs in a run directory
//! - `status`: completion summary of a run
//! - `merge`: merge partial runs into a new run
//! - `export`: write a run as CSV

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hardware::mock::MockRig;
use hardware::usb::UsbAddress;
use scanner::config::{RecoveryConfig, ScanConfig};
use scanner::lattice::{AxisRange, LatticeSpec, TraversalOrder};
use scanner::run_store::{merge_runs, RunId, RunStore};
use scanner::sequencer::{run_scan, ScanOutcome, ScanReport};
use tracing::{info, warn};

fn parse_address(s: &str) -> Result<UsbAddress> {
    s.parse().map_err(|e: String| anyhow::anyhow!(e))
}

fn parse_run_id(s: &str) -> Result<RunId> {
    RunId::new(s).map_err(|e| anyhow::anyhow!(e))
}

#[derive(Parser, Debug)]
#[command(name = "scan_tool")]
#[command(about = "Fault-tolerant piezo raster scan controller")]
#[command(version)]
struct Args {
    /// Directory holding one sub-directory per run
    #[arg(long, global = true, default_value = "runs")]
    runs_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a scan config file
    Config {
        /// Fast axis range as start:stop:step
        #[arg(long)]
        x: AxisRange,

        /// Row axis range as start:stop:step
        #[arg(long)]
        y: AxisRange,

        /// Optional plane axis range as start:stop:step
        #[arg(long)]
        z: Option<AxisRange>,

        #[arg(long, value_enum, default_value_t = TraversalOrder::Raster)]
        order: TraversalOrder,

        /// Stage controller USB address (BUS:DEV or topology path)
        #[arg(long, value_parser = parse_address)]
        device: UsbAddress,

        #[arg(long, default_value_t = RecoveryConfig::default().retry_bound)]
        retry_bound: u32,

        #[arg(long, default_value_t = RecoveryConfig::default().rest_interval)]
        rest_interval: u32,

        /// Pause after each settled move before counting, in milliseconds
        #[arg(long, default_value = "0")]
        pause_ms: u64,

        /// Output file
        #[arg(short, long, default_value = "scan.json")]
        output: PathBuf,
    },

    /// Run or resume a scan on the simulated rig
    Simulate {
        /// Scan config file
        #[arg(short, long)]
        config: PathBuf,

        /// Run to resume; a new timestamped run is created if omitted
        #[arg(long, value_parser = parse_run_id)]
        run_id: Option<RunId>,

        /// Seed for simulated glitches
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Probability that a move never settles
        #[arg(long, default_value = "0.0")]
        settle_glitch: f64,

        /// Probability that a move wedges the USB transport
        #[arg(long, default_value = "0.0")]
        wedge_glitch: f64,
    },

    /// List runs
    List,

    /// Show completion of a run
    Status {
        #[arg(value_parser = parse_run_id)]
        run_id: RunId,
    },

    /// Merge partial runs of the same lattice into a new run
    Merge {
        /// Id of the merged run
        #[arg(short, long, value_parser = parse_run_id)]
        output: RunId,

        /// Runs to merge; on overlap the earlier run wins
        #[arg(required = true, num_args = 2.., value_parser = parse_run_id)]
        runs: Vec<RunId>,
    },

    /// Export a run as CSV
    Export {
        #[arg(value_parser = parse_run_id)]
        run_id: RunId,

        /// Output CSV file
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let store = RunStore::new(&args.runs_dir);

    match args.command {
        Command::Config {
            x,
            y,
            z,
            order,
            device,
            retry_bound,
            rest_interval,
            pause_ms,
            output,
        } => {
            let mut config = ScanConfig::new(LatticeSpec { x, y, z }, order, device);
            config.recovery = RecoveryConfig {
                retry_bound,
                rest_interval,
            };
            config.measurement.pause_ms = pause_ms;
            config.validate().context("Invalid scan config")?;
            config
                .save_to_file(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Wrote {} ({} points, {} order)",
                output.display(),
                config.lattice.point_count(),
                config.order
            );
        }
        Command::Simulate {
            config,
            run_id,
            seed,
            settle_glitch,
            wedge_glitch,
        } => {
            let config = ScanConfig::load_from_file(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            let run_id = run_id.unwrap_or_else(RunId::generate);
            let report =
                simulate(store, config, run_id, seed, settle_glitch, wedge_glitch).await?;
            print_report(&report);
            if let ScanOutcome::Aborted { .. } = report.outcome {
                bail!("Scan {} aborted, resume with --run-id {}", report.run_id, report.run_id);
            }
        }
        Command::List => {
            for id in store.list_runs().context("Failed to list runs")? {
                let run = store.open(&id)?;
                println!(
                    "{:<28} {:>6}/{:<6} {}",
                    id,
                    run.len(),
                    run.point_count(),
                    run.metadata().created.to_rfc3339()
                );
            }
        }
        Command::Status { run_id } => {
            let run = store
                .open(&run_id)
                .with_context(|| format!("Failed to open run {run_id}"))?;
            let missing = run.missing();
            println!("Run:        {}", run.id());
            println!("Created:    {}", run.metadata().created.to_rfc3339());
            println!("Order:      {}", run.config().order);
            println!("Recorded:   {}/{}", run.len(), run.point_count());
            println!("Missing:    {}", missing.len());
            match missing.first() {
                Some(first) => println!("First gap:  {first}"),
                None => println!("Complete"),
            }
            if !run.metadata().merged_from.is_empty() {
                let sources: Vec<&str> =
                    run.metadata().merged_from.iter().map(|r| r.as_str()).collect();
                println!("Merged from: {}", sources.join(", "));
            }
        }
        Command::Merge { output, runs } => {
            let loaded = runs
                .iter()
                .map(|id| {
                    store
                        .open(id)
                        .with_context(|| format!("Failed to open run {id}"))
                })
                .collect::<Result<Vec<_>>>()?;
            let merged = merge_runs(&loaded).context("Merge failed")?;
            let run = store
                .write_merged(output.clone(), &merged)
                .with_context(|| format!("Failed to write merged run {output}"))?;
            println!(
                "Merged {} runs into {}: {}/{} points, {} overlapping, {} missing",
                merged.sources.len(),
                output,
                run.len(),
                run.point_count(),
                merged.overlaps,
                run.missing().len()
            );
        }
        Command::Export { run_id, output } => {
            let rows = export_csv(&store, &run_id, &output)?;
            println!("Wrote {rows} samples to {}", output.display());
        }
    }

    Ok(())
}

async fn simulate(
    store: RunStore,
    config: ScanConfig,
    run_id: RunId,
    seed: u64,
    settle_glitch: f64,
    wedge_glitch: f64,
) -> Result<ScanReport> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();

    let mut scan = tokio::task::spawn_blocking(move || {
        let rig = MockRig::new(config.device.clone())
            .with_glitches(seed, settle_glitch, wedge_glitch)
            .with_emitter(config.reference_position(), config.lattice.x.step * 3.0);
        let mut counter = rig.counter(config.measurement.channels);
        let mut rf = rig.rf_source();
        let transport = rig.usb_reset().with_settle(config.reset_settle());

        info!("Simulated scan into run {run_id}");
        run_scan(
            &config,
            &store,
            run_id,
            rig.connector(),
            transport,
            &mut counter,
            &mut [&mut rf],
            flag,
        )
    });

    let joined = tokio::select! {
        result = &mut scan => result,
        _ = shutdown_signal() => {
            cancel.store(true, Ordering::SeqCst);
            scan.await
        }
    };

    let report = joined.context("Scan task failed")??;
    Ok(report)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {e}");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, finishing current point...");
}

fn print_report(report: &ScanReport) {
    println!("Run:            {}", report.run_id);
    println!("Outcome:        {}", report.outcome);
    println!(
        "Recorded:       {} new, {} already present, {} total points",
        report.recorded, report.skipped, report.total_points
    );
    match report.last_completed {
        Some(index) => println!("Last completed: {index}"),
        None => println!("Last completed: none"),
    }
    println!("Rest maneuvers: {}", report.rest_maneuvers);
    println!("Resets:         {}", report.resets);
}

fn export_csv(store: &RunStore, run_id: &RunId, output: &Path) -> Result<usize> {
    let run = store
        .open(run_id)
        .with_context(|| format!("Failed to open run {run_id}"))?;
    let lattice = run
        .config()
        .build_lattice()
        .context("Run has an invalid lattice")?;
    let channels = run.config().measurement.channels;

    let file = std::fs::File::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut out = BufWriter::new(file);

    write!(out, "index,ix,iy,iz,x,y,z,achieved_x,achieved_y,achieved_z,attempts,timestamp")?;
    for ch in 0..channels {
        write!(out, ",counts_{ch}")?;
    }
    writeln!(out)?;

    let opt = |v: Option<f64>| v.map(|v| format!("{v:e}")).unwrap_or_default();
    let mut rows = 0;
    for sample in run.samples() {
        let Some(point) = lattice.point(sample.index) else {
            warn!("Sample {} outside lattice, skipped", sample.index);
            continue;
        };
        let achieved = sample.achieved;
        write!(
            out,
            "{},{},{},{},{:e},{:e},{},{},{},{},{},{}",
            sample.index,
            point.grid.ix,
            point.grid.iy,
            point.grid.iz,
            sample.position.x,
            sample.position.y,
            opt(sample.position.z),
            opt(achieved.map(|p| p.x)),
            opt(achieved.map(|p| p.y)),
            opt(achieved.and_then(|p| p.z)),
            sample.attempts,
            sample.timestamp.to_rfc3339(),
        )?;
        for value in &sample.payload {
            write!(out, ",{value:.3}")?;
        }
        writeln!(out)?;
        rows += 1;
    }
    out.flush()?;

    Ok(rows)
}
