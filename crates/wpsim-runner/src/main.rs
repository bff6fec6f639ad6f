//! # wpsim-runner
//!
//! Command line runner for wpsim.
//!
//! Loads one or more YAML scenarios, runs them and prints statistics.

use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wpsim_model::{build_simulation, load_model, load_models};
use wpsim_runner::metrics_export::{self, InMemoryRecorder};
use wpsim_runner::{EventLoop, RunnerError, SimTime, SimulationStats};

/// Duration used when neither the command line nor the scenario sets one.
const DEFAULT_DURATION_S: f64 = 10.0;

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration into seconds.
///
/// Accepts a plain number of seconds or a sequence of number/unit pairs,
/// e.g. `1.5`, `500ms`, `250us`, `2s`, `1m30s`.
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }

    let mut total_seconds = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(split);
        if number.is_empty() {
            return Err(format!("Invalid duration format: '{}'", s));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", number, s))?;
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_len);
        let multiplier = match unit {
            "" | "s" => 1.0,
            "ms" => 1e-3,
            "us" => 1e-6,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("Unknown duration unit '{}' in '{}'. Use us, ms, s, m or h.", unit, s)),
        };
        total_seconds += value * multiplier;
        rest = next;
    }

    if total_seconds <= 0.0 {
        return Err(format!("Invalid duration format: '{}'", s));
    }
    Ok(total_seconds)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// Output format for metrics at the end of a run.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MetricsOutputFormat {
    /// JSON format for programmatic consumption.
    Json,
}

/// wpsim - Wi-Fi PHY interference and reception simulator
#[derive(Parser, Debug)]
#[command(name = "wpsim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from YAML scenario files
    Run(RunnerConfig),
    /// List all metrics with descriptions and labels
    Metrics,
    /// Print the default PHY configuration as YAML
    Config,
}

/// Configuration of a run.
#[derive(Parser, Debug)]
pub struct RunnerConfig {
    /// Scenario file(s). Multiple files are merged in order (later overrides earlier).
    #[arg(required = true)]
    pub scenarios: Vec<PathBuf>,

    /// Simulation duration; overrides the scenario.
    /// Accepts plain seconds or units: 0.5, 500ms, 250us, 2s, 1m30s
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Random seed; overrides the scenario (default: random)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Output trace file path (JSON)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output format for metrics at the end of the run.
    #[arg(long, value_enum)]
    pub metrics_output: Option<MetricsOutputFormat>,

    /// File path to write metrics (stdout if not specified).
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Commands
// ============================================================================

/// Run the simulation described by `config`.
pub fn run_simulation(config: &RunnerConfig) -> Result<SimulationStats, RunnerError> {
    let metrics_recorder = if config.metrics_output.is_some() {
        let recorder = InMemoryRecorder::new();
        if let Err(e) = metrics::set_global_recorder(recorder.clone()) {
            return Err(RunnerError::ConfigError(format!("failed to install metrics recorder: {}", e)));
        }
        Some(recorder)
    } else {
        None
    };

    let model = if config.scenarios.len() == 1 {
        load_model(&config.scenarios[0])?
    } else {
        let paths: Vec<&Path> = config.scenarios.iter().map(|p| p.as_path()).collect();
        load_models(&paths)?
    };
    if config.verbose {
        eprintln!(
            "Loaded scenario with {} nodes from {} file(s)",
            model.nodes().len(),
            config.scenarios.len()
        );
    }

    let seed = config.seed.or(model.simulation().seed).unwrap_or_else(|| {
        use rand::Rng;
        rand::thread_rng().gen()
    });
    let duration_s = config
        .duration
        .or(model.simulation().duration_s)
        .unwrap_or(DEFAULT_DURATION_S);
    if !(duration_s.is_finite() && duration_s > 0.0) {
        return Err(RunnerError::ConfigError(format!("invalid duration {}", duration_s)));
    }
    if config.verbose {
        eprintln!("Using seed: {}", seed);
    }

    let simulation = build_simulation(&model, seed)?;
    if config.verbose {
        for node in &simulation.node_infos {
            eprintln!(
                "  {:<16} id={:<3} role={:<10} channel={} ({} MHz)",
                node.name, node.entity_id, node.role, node.channel_number, node.frequency_mhz
            );
        }
    }

    let trace_output: Option<Box<dyn Write>> = match config.output {
        Some(ref path) => Some(Box::new(std::io::BufWriter::new(std::fs::File::create(path)?))),
        None => None,
    };

    info!(seed, duration_s, nodes = simulation.node_infos.len(), "running scenario");
    let mut event_loop = EventLoop::new(simulation, trace_output);
    let stats = event_loop.run(SimTime::from_secs(duration_s))?;

    if config.verbose {
        for node in event_loop.node_infos() {
            if let Some(node_stats) = event_loop.node_stats().get(&node.entity_id) {
                eprintln!("  {:<16} {}", node.name, serde_json::to_string(node_stats)?);
            }
        }
    }

    if let Some(recorder) = metrics_recorder {
        let snapshot = recorder.snapshot();
        match config.metrics_file {
            Some(ref path) => {
                let mut file = std::fs::File::create(path)?;
                metrics_export::export_json(&snapshot, &mut file)?;
            }
            None => metrics_export::export_json(&snapshot, &mut std::io::stdout().lock())?,
        }
    }

    Ok(stats)
}

/// Print every metric with its kind, unit and labels.
fn print_metrics_info() {
    use wpsim_metrics::metric_defs;

    println!("wpsim Available Metrics");
    println!("=======================\n");
    println!("All metrics carry the following labels:");
    println!("  - node: Node name");
    println!("  - role: Node role");
    println!("  - groups: Custom grouping tags (comma-separated, when set)");
    println!();

    for metric in metric_defs::ALL {
        println!("  {}", metric.name);
        println!("    Type: {}", metric.kind);
        let unit = metric.unit_str();
        if !unit.is_empty() {
            println!("    Unit: {}", unit);
        }
        println!("    Description: {}", metric.description);
        if !metric.labels.is_empty() {
            println!("    Labels: {}", metric.labels.join(", "));
        }
        println!();
    }
}

fn main() -> Result<(), RunnerError> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise warn, or info with --verbose
    let default_level = match &cli.command {
        Commands::Run(config) if config.verbose => "info",
        _ => "warn",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run(config) => {
            let stats = run_simulation(&config)?;
            // keep stdout parseable when metrics go there
            let metrics_on_stdout = config.metrics_output.is_some() && config.metrics_file.is_none();
            if !metrics_on_stdout {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Commands::Metrics => print_metrics_info(),
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&wpsim_phy::PhyConfig::default())?);
        }
    }
    Ok(())
}
