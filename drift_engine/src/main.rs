//! # Drift Stabilizer
//!
//! Runs the stabilization engine against a hardware driver from the
//! registry (the simulation driver by default).
//!
//! Startup sequence:
//! 1. Load and validate the stabilizer TOML.
//! 2. Create camera and stage through the driver registry.
//! 3. Start the engine and engage tracking for every group with ROIs.
//! 4. Optionally run the calibration routine, then lock calibrated groups.
//! 5. Run until Ctrl-C or `--duration-s` elapses, then stop cleanly.

use clap::Parser;
use drift_common::config::LogLevel;
use drift_common::telemetry::{JsonLinesSink, NullSink, TelemetrySink};
use drift_common::types::{AxisGroup, CalibrationFrame, GroupState};
use drift_engine::calibration::CalibrationRoutine;
use drift_engine::config::{StabilizerConfig, load_config};
use drift_engine::Stabilizer;
use drift_hal::DriverRegistry;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Status line interval while running.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Drift Stabilizer: closed-loop XY/Z drift correction
#[derive(Parser, Debug)]
#[command(name = "drift_engine")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Closed-loop microscope drift stabilization")]
struct Args {
    /// Path to the stabilizer configuration TOML.
    #[arg(default_value = "config/stabilizer.toml")]
    config: PathBuf,

    /// Hardware driver name from the registry.
    #[arg(long, default_value = "simulation")]
    driver: String,

    /// Stop after this many seconds (default: run until Ctrl-C).
    #[arg(long, value_name = "SECONDS")]
    duration_s: Option<f64>,

    /// Run the calibration routine before locking.
    #[arg(long)]
    calibrate: bool,

    /// Lock every tracking group that has a calibration.
    #[arg(long)]
    lock: bool,

    /// Write telemetry as JSON lines to this file.
    #[arg(long, value_name = "FILE")]
    telemetry_out: Option<PathBuf>,

    /// List registered drivers and exit.
    #[arg(long)]
    list_drivers: bool,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    let config = load_config(&args.config);
    setup_tracing(&args, config.as_ref().map(|c| c.shared.log_level).ok());

    info!("Drift Stabilizer v{} starting...", env!("CARGO_PKG_VERSION"));

    let result = config
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)
        .and_then(|config| run(&args, config));
    if let Err(e) = result {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("Drift Stabilizer shutdown complete");
}

fn run(args: &Args, config: StabilizerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = DriverRegistry::with_builtin();
    if args.list_drivers {
        for name in registry.list_drivers() {
            println!("{name}");
        }
        return Ok(());
    }

    info!(
        service = %config.shared.service_name,
        driver = %args.driver,
        rois = config.rois.len(),
        controller = ?config.controller.kind,
        "Config OK"
    );

    let hw = registry.create_driver(&args.driver, config.simulation.as_ref())?;
    let sink: Box<dyn TelemetrySink> = match &args.telemetry_out {
        Some(path) => {
            info!("Writing telemetry to {}", path.display());
            Box::new(JsonLinesSink::new(BufWriter::new(File::create(path)?)))
        }
        None => Box::new(NullSink),
    };

    let engine = Stabilizer::new(config, hw.camera, hw.stage, sink)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    engine.start()?;
    let outcome = supervise(args, &engine, &running);
    engine.stop()?;

    let stats = engine.cycle_stats();
    info!(
        cycles = stats.cycle_count,
        avg_us = stats.avg_cycle_ns() / 1000,
        max_us = stats.max_cycle_ns / 1000,
        overruns = stats.overruns,
        fit_failures = stats.fit_failures,
        acquisition_errors = stats.acquisition_errors,
        actuator_faults = stats.actuator_faults,
        "Final cycle statistics"
    );
    outcome
}

/// Engage, calibrate and lock as requested, then watch the engine until
/// shutdown.
fn supervise(args: &Args, engine: &Stabilizer, running: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    for group in AxisGroup::ALL {
        if engine.rois(group).is_empty() {
            info!(%group, "No ROIs configured, group stays idle");
            continue;
        }
        engine.set_tracking(group, true)?;
    }

    if args.calibrate {
        calibrate(engine)?;
    }

    if args.lock {
        for group in AxisGroup::ALL {
            if engine.group_state(group) != GroupState::Tracking {
                continue;
            }
            match engine.set_locked(group, true) {
                Ok(()) => info!(%group, "Locked"),
                Err(e) => warn!(%group, error = %e, "Lock refused"),
            }
        }
    }

    let started = Instant::now();
    let deadline = args.duration_s.map(Duration::from_secs_f64);
    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| started.elapsed() >= d) {
            info!("Run duration elapsed");
            break;
        }
        std::thread::sleep(Duration::from_millis(50));

        if let Some(fault) = engine.take_fault() {
            warn!(error = %fault, "Actuator fault reported");
        }
        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            if let Some(rec) = engine.latest() {
                info!(
                    cycle = rec.cycle,
                    xy = ?rec.xy_state,
                    z = ?rec.z_state,
                    valid_fits = rec.valid_fits(),
                    dx_nm = rec.correction.dx,
                    dy_nm = rec.correction.dy,
                    dz_nm = rec.correction.dz,
                    applied_dx_nm = rec.applied.dx,
                    applied_dy_nm = rec.applied.dy,
                    applied_dz_nm = rec.applied.dz,
                    "Status"
                );
            }
        }
    }
    Ok(())
}

fn calibrate(engine: &Stabilizer) -> Result<(), Box<dyn std::error::Error>> {
    let routine = CalibrationRoutine::new(engine);
    let mut frame: CalibrationFrame = engine.calibration();
    if engine.group_state(AxisGroup::Xy) == GroupState::Tracking {
        frame.xy = Some(routine.run_xy()?.calibration);
    }
    if engine.group_state(AxisGroup::Z) == GroupState::Tracking {
        frame.z = Some(routine.run_z()?.calibration);
    }
    engine.set_calibration(frame)?;
    // Calibration scans moved the stage; start the locked session from the
    // restored position.
    for group in AxisGroup::ALL {
        if engine.group_state(group) == GroupState::Tracking {
            engine.set_tracking(group, false)?;
            engine.set_tracking(group, true)?;
        }
    }
    Ok(())
}

/// Setup tracing subscriber from CLI flags and the configured level.
fn setup_tracing(args: &Args, configured: Option<LogLevel>) {
    let directive = if args.verbose {
        "debug"
    } else {
        configured.unwrap_or_default().as_directive()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
