use fret_vision::calibration::{CancelFlag, JsonFileStore};
use fret_vision::config::AppConfig;
use fret_vision::console_display;
use fret_vision::coordinator::{Coordinator, CoordinatorReport, FrameEvent};
use fret_vision::data_logger;
use fret_vision::filters::FilterCatalog;
use fret_vision::inference::InferenceService;
use fret_vision::jsonl_reader::SessionReader;
use fret_vision::notes::{standard_tuning, ScaleState};
use fret_vision::simulator::{self, SimulatedDetector};
use fret_vision::types::*;

use clap::Parser;
use crossbeam_channel::{bounded, unbounded, Sender};
use log::{error, info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fret-vision")]
#[command(about = "Camera fretboard tracking with a scale overlay and filter calibration")]
struct Cli {
    /// JSON config file (tracker, overlay, calibration policy, defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drive the pipeline from the synthetic camera (default when not replaying)
    #[arg(long)]
    simulate: bool,

    /// Replay a recorded detections.jsonl session instead of a camera
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Calibrate the filter chain once the camera has warmed up
    #[arg(long)]
    calibrate: bool,

    /// Scale root note (e.g. A, F#)
    #[arg(long)]
    root: Option<String>,

    /// Scale name (major, minor, blues, ...)
    #[arg(long)]
    scale: Option<String>,

    /// Camera frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Stop the simulator after N frames
    #[arg(long)]
    frames: Option<u64>,

    /// Record detections as a JSONL session
    #[arg(long)]
    log_data: bool,

    /// Output directory for recorded sessions
    #[arg(long, default_value = "./sessions")]
    output_dir: PathBuf,

    /// Enable console display (terminal TUI)
    #[arg(long)]
    console: bool,

    /// Console display refresh rate (Hz)
    #[arg(long, default_value_t = 4)]
    display_hz: u32,

    /// Where the calibrated filter chain is stored
    #[arg(long)]
    chain_file: Option<PathBuf>,

    /// Search every built-in filter during calibration
    #[arg(long)]
    extended_filters: bool,

    /// Print the scale's notes and fretboard positions, then exit
    #[arg(long)]
    list_scale: bool,
}

/// Warm-up before `--calibrate` fires, so the reference frame shows the scene.
const CALIBRATE_AFTER: Duration = Duration::from_millis(3500);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(scale) = &cli.scale {
        config.scale = scale.clone();
    }
    if let Some(fps) = cli.fps {
        config.fps = fps;
    }
    if let Some(path) = &cli.chain_file {
        config.chain_file = path.clone();
    }
    config.extended_filters |= cli.extended_filters;

    let root: Note = config.root.parse()?;
    let scale = ScaleState::new(root, &config.scale)
        .ok_or_else(|| format!("unknown scale: {}", config.scale))?;

    if cli.list_scale {
        print_scale(&scale, config.tracker.num_frets);
        return Ok(());
    }

    let simulate = cli.simulate || cli.replay.is_none();
    info!("═══════════════════════════════════════════════");
    info!("  FRET VISION v{}", env!("CARGO_PKG_VERSION"));
    info!("  Scale: {} {}", scale.root(), scale.scale_name());
    match &cli.replay {
        Some(path) if !simulate => info!("  Mode: REPLAY {:?}", path),
        _ => info!("  Mode: SIMULATOR @ {} fps", config.fps),
    }
    info!("  Filter chain: {:?}", config.chain_file);
    if cli.console {
        info!("  UI: Console TUI");
    }
    info!("═══════════════════════════════════════════════");

    let clock = SessionClock::new();

    // Channel: inputs → coordinator
    let (input_tx, input_rx) = bounded::<FrameEvent>(8);

    // Channels: coordinator → consumers
    let mut overlay_txs = Vec::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // ─── Console display ────────────────────────────────────────────
    if cli.console {
        let (tx, rx) = bounded(64);
        overlay_txs.push(tx);
        let (fps, hz) = (config.fps, cli.display_hz);
        handles.push(spawn("display", move || {
            console_display::ConsoleDisplay::new(rx, fps, hz).run();
        })?);
    }

    // ─── Data logger ────────────────────────────────────────────────
    let record_tx = if cli.log_data {
        let (tx, rx) = bounded::<DetectionFrame>(1024);
        let tuning = standard_tuning().name;
        let logger = data_logger::DataLogger::new(rx, &cli.output_dir, config.fps, &tuning)?;
        handles.push(spawn("logger", move || {
            if let Err(e) = logger.run() {
                error!("Data logger failed: {}", e);
            }
        })?);
        Some(tx)
    } else {
        None
    };

    // ─── Calibration reports ────────────────────────────────────────
    let (report_tx, report_rx) = unbounded::<CoordinatorReport>();
    handles.push(spawn("reports", move || {
        for report in report_rx.iter() {
            log_report(&report);
        }
    })?);

    // ─── Input source and detector ──────────────────────────────────
    let service = Arc::new(InferenceService::<SimulatedDetector>::new());
    let replay = cli.replay.clone().filter(|_| !cli.simulate);
    if let Some(path) = replay {
        let reader = SessionReader::open(BufReader::new(File::open(&path)?))?;
        info!(
            "Replaying {:?} ({} fps, {} tuning)",
            path, reader.header.fps, reader.header.tuning
        );
        let tx = input_tx.clone();
        handles.push(spawn("replay", move || replay_session(reader, tx))?);
    } else {
        let mut sim = simulator::Simulator::new(clock.clone(), input_tx.clone(), config.fps);
        if let Some(n) = cli.frames {
            sim = sim.with_frame_limit(n);
        }
        let detector = sim.detector();
        handles.push(service.spawn_start(move || Ok(detector))?);
        info!("Starting simulator...");
        handles.push(spawn("simulator", move || {
            sim.run();
        })?);
    }

    if cli.calibrate {
        let tx = input_tx.clone();
        handles.push(spawn("calibrate", move || {
            thread::sleep(CALIBRATE_AFTER);
            info!("Requesting calibration");
            let _ = tx.send(FrameEvent::Calibrate { cancel: CancelFlag::new() });
        })?);
    }
    // Sources hold their own clones; the coordinator stops when they finish.
    drop(input_tx);

    // ─── Coordinator ────────────────────────────────────────────────
    let catalog = if config.extended_filters {
        FilterCatalog::extended()
    } else {
        FilterCatalog::calibration_default()
    };
    let store = JsonFileStore::new(config.chain_file.clone());
    let mut coord = Coordinator::new(input_rx, overlay_txs, service)
        .with_catalog(catalog)
        .with_store(Box::new(store))
        .with_policy(config.calibration)
        .with_tracker(config.tracker.clone())
        .with_overlay(config.overlay.clone())
        .with_scale(scale)
        .with_reports(report_tx);
    if let Some(tx) = record_tx {
        coord = coord.with_recorder(tx);
    }
    handles.push(spawn("coordinator", move || {
        coord.run();
    })?);

    info!("Running. Press Ctrl+C to stop.");
    for h in handles {
        let _ = h.join();
    }
    Ok(())
}

fn spawn<F>(name: &str, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.into()).spawn(f)
}

/// Feed recorded frames to the coordinator, paced by their timestamps.
fn replay_session(reader: SessionReader<BufReader<File>>, tx: Sender<FrameEvent>) {
    let mut last_t: Option<u64> = None;
    let mut sent = 0u64;
    for result in reader {
        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Skipping session line: {}", e);
                continue;
            }
        };
        if let Some(prev) = last_t {
            thread::sleep(Duration::from_millis(frame.t.saturating_sub(prev)));
        }
        last_t = Some(frame.t);
        if tx.send(FrameEvent::Detections(frame)).is_err() {
            break;
        }
        sent += 1;
    }
    info!("Replay finished: {} frames", sent);
}

fn log_report(report: &CoordinatorReport) {
    match report {
        CoordinatorReport::ModeChanged(mode) => info!("Mode: {:?}", mode),
        CoordinatorReport::CalibrationProgress(p) => {
            info!("Calibrating {:>3.0}%  {} → {:.3}", p.percent, p.testing, p.confidence)
        }
        CoordinatorReport::CalibrationFinished { result, verdict, persisted } => info!(
            "Calibration {:?}: {} ({:.3} → {:.3}){}",
            verdict,
            describe_chain(&result.filter_chain),
            result.baseline_confidence,
            result.achieved_confidence,
            if *persisted { ", saved" } else { "" }
        ),
        CoordinatorReport::CalibrationFailed(e) => warn!("Calibration failed: {}", e),
    }
}

fn print_scale(scale: &ScaleState, num_frets: u32) {
    let tuning = standard_tuning();
    let notes: Vec<String> = scale.notes().iter().map(|n| n.to_string()).collect();
    println!("{} {}: {}", scale.root(), scale.scale_name(), notes.join(" "));
    for string_index in (0..NUM_STRINGS).rev() {
        let open = tuning.open_strings[string_index];
        let frets = tuning
            .string_scale_positions(string_index, scale.notes(), num_frets)
            .unwrap_or_default();
        let cells: Vec<String> = frets
            .iter()
            .map(|&f| {
                let note = open.transpose(f as usize);
                let mark = if note == scale.root() { "*" } else { "" };
                format!("{}{}", f, mark)
            })
            .collect();
        println!("  {:<2} | {}", open, cells.join(" "));
    }
}
