//! InkPick command-line inspector.
//!
//! Loads an element snapshot (a JSON array of element records) and runs
//! hit tests, snapping or history inspection against it. Set
//! `INKPICK_CONFIG` to a JSON engine configuration to override defaults and
//! `RUST_LOG` to control logging.

use clap::{Parser, Subcommand};
use inkpick_core::{
    ElementRecord, EngineConfig, HitTestOptimizer, SelectionError, SelectionHistory,
    SelectionToolCoordinator,
};
use kurbo::{Point, Rect};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;

/// Probe points per axis for the `metrics` sweep.
const PROBE_STEPS: usize = 32;

#[derive(Parser, Debug)]
#[command(name = "inkpick", version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the ids hit at a point, topmost first.
    #[command(allow_negative_numbers = true)]
    Point {
        elements: PathBuf,
        x: f64,
        y: f64,
        /// Extra hit distance around each element.
        tolerance: Option<f64>,
    },
    /// Print the ids intersecting a rectangle.
    #[command(allow_negative_numbers = true)]
    Rect {
        elements: PathBuf,
        x0: f64,
        y0: f64,
        x1: f64,
        y1: f64,
    },
    /// Snap a point against the snapshot and print the result as JSON.
    #[command(allow_negative_numbers = true)]
    Snap { elements: PathBuf, x: f64, y: f64 },
    /// Import an exported history and print its summary.
    History { path: PathBuf },
    /// Sweep a probe grid over the snapshot and print metrics as JSON.
    Metrics { elements: PathBuf },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid element snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error(transparent)]
    Engine(#[from] SelectionError),
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<(), CliError> {
    let config = load_config()?;

    match command {
        Command::Point {
            elements,
            x,
            y,
            tolerance,
        } => {
            let mut optimizer = HitTestOptimizer::new(&config.index);
            optimizer.optimize(&load_elements(&elements)?);
            for id in optimizer.find_at_point(Point::new(x, y), tolerance.unwrap_or(0.0)) {
                println!("{}", id);
            }
        }
        Command::Rect {
            elements,
            x0,
            y0,
            x1,
            y1,
        } => {
            let mut optimizer = HitTestOptimizer::new(&config.index);
            optimizer.optimize(&load_elements(&elements)?);
            for id in optimizer.find_in_rect(Rect::new(x0, y0, x1, y1)) {
                println!("{}", id);
            }
        }
        Command::Snap { elements, x, y } => {
            let mut session = SelectionToolCoordinator::new(config);
            session.activate_tool("cli", &load_elements(&elements)?);
            let result = session.snap_pointer(Point::new(x, y));
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::History { path } => {
            let mut history = SelectionHistory::new(config.history);
            history.import_history(&path)?;
            for entry in history.history_summary() {
                let marker = if entry.is_current { '*' } else { ' ' };
                println!(
                    "{}{:>4} {:<12} {:<16} {}",
                    marker,
                    entry.index,
                    format!("{:?}", entry.kind),
                    entry.tool,
                    entry.timestamp_ms
                );
            }
        }
        Command::Metrics { elements } => metrics(&config, &elements)?,
    }
    Ok(())
}

fn load_config() -> Result<EngineConfig, CliError> {
    match std::env::var_os("INKPICK_CONFIG") {
        Some(path) => {
            log::info!("Loading engine configuration from {}", Path::new(&path).display());
            Ok(EngineConfig::load(path)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn load_elements(path: &Path) -> Result<Vec<ElementRecord>, CliError> {
    let json = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let records: Vec<ElementRecord> = serde_json::from_str(&json)?;
    log::debug!("Loaded {} element records from {}", records.len(), path.display());
    Ok(records)
}

/// Sweep a probe grid over the snapshot twice (cold, then cached) and print
/// the resulting metrics.
fn metrics(config: &EngineConfig, path: &Path) -> Result<(), CliError> {
    let records = load_elements(path)?;
    let mut optimizer = HitTestOptimizer::new(&config.index);
    optimizer.optimize(&records);

    let extent = records
        .iter()
        .map(|r| r.bounds)
        .reduce(|a, b| a.union(b))
        .unwrap_or(Rect::ZERO);
    for _ in 0..2 {
        for point in probe_grid(extent, PROBE_STEPS) {
            optimizer.find_at_point(point, 0.0);
        }
    }

    println!("{}", serde_json::to_string_pretty(&optimizer.metrics())?);
    Ok(())
}

fn probe_grid(extent: Rect, steps: usize) -> impl Iterator<Item = Point> {
    let step_x = extent.width() / steps as f64;
    let step_y = extent.height() / steps as f64;
    (0..=steps).flat_map(move |i| {
        (0..=steps).map(move |j| {
            Point::new(extent.x0 + step_x * i as f64, extent.y0 + step_y * j as f64)
        })
    })
}
