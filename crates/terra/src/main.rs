//! terra CLI - build and run Fern applications

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use indicatif::MultiProgress;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use terra::build::make_writer;
use terra::commands::{self, Context};
use terra::{Error, Result};

/// terra - build and run Fern applications on native and web targets
#[derive(Debug, Parser)]
#[command(name = "terra")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Run as if started in this directory
    #[arg(short = 'C', long, global = true)]
    directory: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build and run the project or a single source file
    Fire(commands::fire::FireArgs),

    /// Manage the support library cache
    Cache {
        #[command(subcommand)]
        command: commands::cache::CacheCommand,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Logs and the stage progress share one MultiProgress
    let multi = MultiProgress::new();
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(make_writer(&multi)))
        .with(filter)
        .init();

    match run(cli, multi) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(diagnostics) = err.diagnostics() {
                eprint!("{}", diagnostics);
                if !diagnostics.ends_with('\n') {
                    eprintln!();
                }
            }
            let code = err.exit_code();
            eprintln!("{:?}", miette::Report::new(err));
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli, multi: MultiProgress) -> Result<()> {
    let working_dir = match cli.directory {
        Some(dir) => dir,
        None => current_dir()?,
    };
    let home = home_dir()?;
    let ctx = Context::load(&home, working_dir)?.with_progress(multi);

    match cli.command {
        Commands::Fire(args) => commands::fire::run(&ctx, args),
        Commands::Cache { command } => commands::cache::run(&ctx, command),
    }
}

fn current_dir() -> Result<Utf8PathBuf> {
    let dir = std::env::current_dir()?;
    Utf8PathBuf::try_from(dir).map_err(|e| {
        Error::config(
            format!("Working directory is not valid UTF-8: {}", e),
            "Run terra from a directory with a UTF-8 path",
        )
    })
}

fn home_dir() -> Result<Utf8PathBuf> {
    std::env::var("HOME")
        .ok()
        .filter(|home| !home.is_empty())
        .map(Utf8PathBuf::from)
        .ok_or_else(|| {
            Error::config(
                "HOME is not set",
                "Set HOME so terra can find ~/.fern/config.toml and the cache",
            )
        })
}
