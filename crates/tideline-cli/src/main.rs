#![forbid(unsafe_code)]

mod cmd;
mod output;

use std::env;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use output::{CliError, OutputMode, render_error, resolve_output_mode};
use tideline_core::config::resolve_config;
use tideline_core::error::ErrorCode;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tide: replay, inspect and window tideline sync state",
    long_about = None
)]
struct Cli {
    /// Log at debug level unless TIDELINE_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (defaults to pretty on a TTY, text when piped).
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Config file (defaults to <config dir>/tideline/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fold sync deltas into a checkpoint",
        long_about = "Read one sync delta per line, fold each into the accumulator and\n\
                      optionally write the resulting full-sync-equivalent state.",
        after_help = "EXAMPLES:\n    # Replay a capture and save the state\n    tide replay deltas.jsonl --checkpoint state.json\n\n\
                      # Continue from an earlier checkpoint\n    tide replay more.jsonl --from state.json --checkpoint state.json\n\n\
                      # Machine-readable output\n    tide replay deltas.jsonl --format json"
    )]
    Replay(cmd::replay::ReplayArgs),

    #[command(
        about = "Summarize a checkpoint",
        long_about = "List the rooms in a checkpoint, or show one room's retained timeline,\n\
                      state and receipts.",
        after_help = "EXAMPLES:\n    # List rooms\n    tide inspect state.json\n\n\
                      # One room in detail\n    tide inspect state.json --room '!abc:example.org'"
    )]
    Inspect(cmd::inspect::InspectArgs),

    #[command(
        about = "Open a timeline window over a checkpointed room",
        long_about = "Seed a room timeline from a checkpoint and load a window at the live\n\
                      edge or around an event. History past the checkpoint is unreachable.",
        after_help = "EXAMPLES:\n    # Last 20 events\n    tide window state.json --room '!abc:example.org' --size 20\n\n\
                      # Around one event, then page 5 each way\n    tide window state.json --room '!abc:example.org' --around '$ev' --extend 5"
    )]
    Window(cmd::window::WindowArgs),

    #[command(about = "Deterministic simulation campaigns")]
    Sim(cmd::sim::SimArgs),

    #[command(
        about = "Generate shell completion scripts",
        after_help = "EXAMPLES:\n    # Generate bash completions\n    tide completions bash\n\n\
                      # Generate zsh completions\n    tide completions zsh"
    )]
    Completions(cmd::completions::CompletionsArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("TIDELINE_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "tideline=debug,info"
        } else {
            "tideline=info,warn"
        })
    });

    let format = env::var("TIDELINE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let output = resolve_output_mode(cli.format);
    let config = match resolve_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            render_error(
                output,
                &CliError::new(format!("{err:#}")).with_code(ErrorCode::ConfigParseError),
            )?;
            return Err(err);
        }
    };
    debug!(?config, "config resolved");

    match cli.command {
        Commands::Replay(ref args) => cmd::replay::run_replay(args, config.accumulator, output),
        Commands::Inspect(ref args) => cmd::inspect::run_inspect(args, config.accumulator, output),
        Commands::Window(ref args) => {
            cmd::window::run_window(args, config.accumulator, config.window, output)
        }
        Commands::Sim(ref args) => cmd::sim::run_sim(args, output),
        Commands::Completions(args) => {
            let mut command = Cli::command();
            cmd::completions::run_completions(args.shell, &mut command)
        }
    }
}
