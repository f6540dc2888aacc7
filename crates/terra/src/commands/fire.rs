//! Fire command implementation
//!
//! Builds the project (or a single file) for one platform, then runs it: native
//! executables as a managed child process, web bundles through the dev server.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::build::{
    BuildRequest, BuildResult, ExternalToolchain, LibraryOutcome, ManagedChild, Pipeline, Stage,
};
use crate::config::{Backend, Mode};
use crate::serve::DevServer;
use crate::{Error, Result};

use super::{Context, interruptible, runtime};

/// Arguments for the fire command
#[derive(Debug, Clone, Args)]
pub struct FireArgs {
    /// Source file to build instead of the project's lib/main.cpp
    pub file: Option<Utf8PathBuf>,

    /// Target platform
    #[arg(short, long, value_enum, default_value_t = Backend::Native)]
    pub platform: Backend,

    /// Build mode
    #[arg(short, long, value_enum, default_value_t = Mode::Release)]
    pub mode: Mode,

    /// Rebuild the support library even if the cache is valid
    #[arg(long)]
    pub force_rebuild: bool,

    /// Preferred dev server port (web)
    #[arg(long)]
    pub port: Option<u16>,

    /// Build only; do not run the executable or start the dev server
    #[arg(long)]
    pub no_run: bool,
}

impl FireArgs {
    fn request(&self, working_dir: &Utf8Path) -> BuildRequest {
        BuildRequest {
            backend: self.platform,
            source: self.file.clone(),
            mode: self.mode,
            force_rebuild: self.force_rebuild,
            working_dir: working_dir.to_path_buf(),
        }
    }
}

/// Run the fire command
pub fn run(ctx: &Context, args: FireArgs) -> Result<()> {
    let rt = runtime(ctx.config.effective_jobs())?;
    rt.block_on(fire(ctx, &args))
}

/// Build, then run or serve the result
pub async fn fire(ctx: &Context, args: &FireArgs) -> Result<()> {
    let request = args.request(&ctx.working_dir);
    let result = interruptible(build(ctx, &request)).await?;
    print_summary(&result);

    if args.no_run {
        return Ok(());
    }

    match args.platform {
        Backend::Native => run_executable(ctx, &result).await,
        Backend::Web => serve(ctx, &result, args.port).await,
    }
}

/// Run the pipeline with the configured toolchain and a progress display
pub async fn build(ctx: &Context, request: &BuildRequest) -> Result<BuildResult> {
    let progress = Arc::new(ctx.progress(Stage::COUNT));

    let line_progress = progress.clone();
    let toolchain = ExternalToolchain::from_config(&ctx.config, request.backend)
        .with_log_callback(Arc::new(move |line: &str| line_progress.update(line)));

    let pipeline = Pipeline::new(&ctx.config, toolchain).with_progress(progress.clone());
    let result = pipeline.run(request).await;

    match &result {
        Ok(_) => progress.finish("Build succeeded"),
        Err(_) => progress.finish("Build failed"),
    }
    result
}

fn print_summary(result: &BuildResult) {
    let library = match &result.library {
        LibraryOutcome::CacheHit(entry) => {
            format!("cached support library {}", entry.fingerprint.short())
        }
        LibraryOutcome::Rebuilt(entry) => {
            format!("rebuilt support library {}", entry.fingerprint.short())
        }
        LibraryOutcome::NotRequired => "installed library".to_string(),
    };

    if !result.diagnostics.trim().is_empty() {
        eprint!("{}", result.diagnostics);
    }
    println!(
        "Built {} ({}) in {:.2}s using {}",
        result.artifact(),
        result.backend,
        result.elapsed.as_secs_f64(),
        library
    );
}

/// Run a native executable until it exits or the terminal interrupts it
async fn run_executable(ctx: &Context, result: &BuildResult) -> Result<()> {
    let executable = result.artifact();
    let working_dir = result
        .target
        .project
        .as_ref()
        .map_or(ctx.working_dir.as_path(), |p| p.root.as_path());

    println!("Running {}", executable);
    let mut command = Command::new(executable);
    command.current_dir(working_dir);
    let mut child = ManagedChild::spawn(&mut command, executable.as_str())?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                Ok(())
            } else {
                Err(Error::project(
                    format!("{} exited with {}", executable, status),
                    "The application failed at runtime; see its output above",
                ))
            }
        }
        _ = tokio::signal::ctrl_c() => {
            // The child got the same interrupt; give it the grace period to exit
            let grace = Duration::from_millis(ctx.config.server.shutdown_timeout_ms);
            child.shutdown(grace).await?;
            println!("Stopped by user");
            Ok(())
        }
    }
}

/// Serve the web bundle until the terminal interrupts
async fn serve(ctx: &Context, result: &BuildResult, port: Option<u16>) -> Result<()> {
    let preferred = port
        .or_else(|| {
            result
                .target
                .project
                .as_ref()
                .and_then(|p| p.descriptor.port())
        })
        .unwrap_or(ctx.config.server.port);

    let server = DevServer::from_config(&ctx.config.server);
    let mut handle = server.serve(result.target.output_dir(), preferred).await?;

    let page = result.artifact().file_name().unwrap_or("index.html");
    println!("Open your browser to: {}", handle.url(page));
    println!("Press Ctrl+C to stop the server");

    let interrupted = tokio::signal::ctrl_c().await;
    handle.stop().await?;
    interrupted?;
    Ok(())
}
