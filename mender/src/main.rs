//! `mender`: self-healing test-and-repair orchestrator.
//!
//! Runs a project's tests, asks a repair oracle to fix failing sources, and
//! keeps a fix only when the test passes afterwards. State lives in
//! `.mender/` under the project root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::info;

use mender::cycle::Pipeline;
use mender::error::is_config_error;
use mender::exit_codes;
use mender::health::check_health;
use mender::io::init::{InitOptions, init_project};
use mender::io::state_store::{FileStateStore, StateStore};
use mender::looping::{run_continuous, run_single};
use mender::shutdown::{Shutdown, listen_for_ctrl_c};
use mender::status::{load_status, render_json, render_summary};

#[derive(Parser)]
#[command(
    name = "mender",
    version,
    about = "Self-healing test-and-repair orchestrator"
)]
struct Cli {
    /// Project root holding `.mender/`, sources and tests.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    /// More log output (`-v` debug, `-vv` trace); `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.mender/` with a default config and the source/test directories.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one cycle, or keep cycling until interrupted.
    Run {
        #[arg(long, value_enum, default_value_t = Mode::Single)]
        mode: Mode,
        /// Seconds between cycles in continuous mode (overrides config).
        #[arg(long)]
        interval: Option<u64>,
        /// Stop continuous mode after this many cycles.
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// Print the pipeline state.
    Status {
        /// Print the raw state record as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Check layout, config, state and oracle setup.
    Health,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Single,
    Continuous,
}

fn main() {
    let cli = Cli::parse();
    mender::logging::init(cli.verbose);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            if is_config_error(&err) {
                exit_codes::CONFIG
            } else {
                exit_codes::FAILURE
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => {
            let paths = init_project(&cli.root, &InitOptions { force })?;
            println!("initialized {}", paths.mender_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run {
            mode,
            interval,
            max_cycles,
        } => cmd_run(&cli.root, mode, interval, max_cycles),
        Command::Status { json } => {
            let state = load_status(&cli.root)?;
            if json {
                println!("{}", render_json(&state)?);
            } else {
                print!("{}", render_summary(&state));
            }
            Ok(exit_codes::OK)
        }
        Command::Health => {
            let report = check_health(&cli.root, Utc::now());
            print!("{}", report.render());
            Ok(if report.healthy() {
                exit_codes::OK
            } else {
                exit_codes::FAILURE
            })
        }
    }
}

fn cmd_run(
    root: &Path,
    mode: Mode,
    interval: Option<u64>,
    max_cycles: Option<u64>,
) -> Result<i32> {
    let shutdown = Shutdown::new();
    let pipeline = Pipeline::from_root(root, shutdown.clone())?;
    listen_for_ctrl_c(&shutdown, exit_codes::FAILURE);
    let store = FileStateStore::new(&pipeline.paths.state_path);

    match mode {
        Mode::Single => {
            let summary = run_single(&pipeline, &store)?;
            info!(cycle = summary.cycle, complete = summary.complete, "single run done");
        }
        Mode::Continuous => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| pipeline.config.interval());
            let outcome = run_continuous(&pipeline, &store, interval, max_cycles, |summary| {
                info!(cycle = summary.cycle, units = summary.units.len(), "cycle done");
            })?;
            info!(cycles = outcome.cycles_run, stop = ?outcome.stop, "continuous run done");
        }
    }
    print!("{}", render_summary(&store.load()?));
    Ok(exit_codes::OK)
}
