use std::path::PathBuf;

use clap::{Parser, Subcommand};
use gpuwire_cli::{demo, dump, replay, Direction};
use gpuwire_core::config::default_config_path;
use gpuwire_core::WireConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "gpuwire")]
#[command(about = "gpuwire - GPU command wire tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or replay recorded wire traces
    Trace {
        #[command(subcommand)]
        command: TraceCommands,
    },

    /// Run a client and a server in this process against the null backend
    Demo {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Record client and server traces into this directory
        #[arg(long)]
        trace_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum TraceCommands {
    /// Decode and print every frame of a trace file
    Dump {
        /// Trace file
        file: PathBuf,

        /// Only show frames written by one side
        #[arg(short, long, value_enum)]
        direction: Option<Direction>,

        /// Print one JSON object per frame
        #[arg(long)]
        json: bool,
    },

    /// Feed a client trace to a server on the null backend
    Replay {
        /// Trace file
        file: PathBuf,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> WireConfig {
    let path = path.unwrap_or_else(default_config_path);
    info!(path = %path.display(), "loading configuration");
    WireConfig::load_or_default(&path)
}

fn main() -> anyhow::Result<()> {
    gpuwire_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Trace { command } => match command {
            TraceCommands::Dump { file, direction, json } => {
                let frames = gpuwire_cli::dump_trace(&file, direction)?;
                if json {
                    dump::print_frames_json(&frames)?;
                } else {
                    dump::print_frames_pretty(&frames);
                }
            }

            TraceCommands::Replay { file, config } => {
                let config = load_config(config);
                let report = gpuwire_cli::replay_trace(&file, &config)?;
                replay::print_report(&report);
            }
        },

        Commands::Demo { config, trace_dir } => {
            let config = load_config(config);
            let report = gpuwire_cli::run_demo(&config, trace_dir)?;
            demo::print_report(&report);
            if !report.passed() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
