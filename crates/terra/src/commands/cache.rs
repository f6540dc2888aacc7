//! Cache command implementation
//!
//! Inspects and manages the per-backend support library cache.

use clap::{Args, Subcommand, ValueEnum};

use crate::build::{ExternalToolchain, Pipeline};
use crate::cache::{ArtifactCache, CacheStatus};
use crate::config::Backend;
use crate::Result;

use super::{Context, interruptible, runtime};

/// Cache subcommands
#[derive(Debug, Clone, Subcommand)]
pub enum CacheCommand {
    /// Show cache status
    Status(CacheArgs),
    /// Remove cached artifacts
    Clear(CacheArgs),
    /// Clear, then compile and store the support library again
    Rebuild(CacheArgs),
}

/// Arguments shared by the cache subcommands
#[derive(Debug, Clone, Args)]
pub struct CacheArgs {
    /// Platform whose cache to act on
    #[arg(short, long, value_enum, default_value_t = PlatformSelection::Web)]
    pub platform: PlatformSelection,
}

/// One backend or all of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlatformSelection {
    #[value(alias = "linux")]
    Native,
    Web,
    All,
}

impl PlatformSelection {
    fn backend(&self) -> Option<Backend> {
        match self {
            PlatformSelection::Native => Some(Backend::Native),
            PlatformSelection::Web => Some(Backend::Web),
            PlatformSelection::All => None,
        }
    }

    fn backends(&self) -> Vec<Backend> {
        self.backend().map_or(Backend::ALL.to_vec(), |b| vec![b])
    }
}

impl std::fmt::Display for PlatformSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.backend() {
            Some(backend) => backend.fmt(f),
            None => f.write_str("all"),
        }
    }
}

/// Run a cache subcommand
pub fn run(ctx: &Context, command: CacheCommand) -> Result<()> {
    match command {
        CacheCommand::Status(args) => status(ctx, &args),
        CacheCommand::Clear(args) => clear(ctx, &args),
        CacheCommand::Rebuild(args) => {
            let rt = runtime(ctx.config.effective_jobs())?;
            rt.block_on(interruptible(rebuild(ctx, &args)))
        }
    }
}

/// Whether a cached entry is current against the support sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Current,
    Outdated,
    /// The sources could not be located or fingerprinted
    Unknown,
    /// The backend links an installed library
    NotCached,
}

/// Status of one backend's cache plus its freshness
pub fn inspect(ctx: &Context, backend: Backend) -> (CacheStatus, Freshness) {
    let cache = ArtifactCache::new(ctx.config.cache_dir());
    let status = cache.status(backend);

    let current = Pipeline::new(&ctx.config, ExternalToolchain::from_config(&ctx.config, backend))
        .current_fingerprint();
    let freshness = match (current, status.fingerprint()) {
        (Ok(None), _) => Freshness::NotCached,
        (Ok(Some(current)), Some(stored)) if current.matches(stored) => Freshness::Current,
        (Ok(Some(_)), _) => Freshness::Outdated,
        (Err(e), _) => {
            tracing::debug!("Cannot fingerprint {} support sources: {}", backend, e);
            Freshness::Unknown
        }
    };

    (status, freshness)
}

fn status(ctx: &Context, args: &CacheArgs) -> Result<()> {
    for backend in args.platform.backends() {
        let (status, freshness) = inspect(ctx, backend);

        println!("{} cache: {}", backend, status.location);
        if freshness == Freshness::NotCached {
            println!("  Not cached: {} builds link the installed library", backend);
            continue;
        }

        let Some(entry) = &status.entry else {
            println!("  No cached library; it is built on the next {} build", backend);
            continue;
        };

        println!("  Library:     {}", entry.file_name);
        println!("  Size:        {:.1} MB", entry.size as f64 / (1024.0 * 1024.0));
        println!("  Fingerprint: {}", entry.fingerprint.short());
        println!(
            "  Created:     {} ({} ago)",
            entry.created.format("%Y-%m-%d %H:%M:%S"),
            format_age(entry.age().num_seconds())
        );
        match freshness {
            Freshness::Current => println!("  Up to date"),
            Freshness::Outdated => {
                println!("  Outdated: support sources changed, rebuilt on the next build")
            }
            Freshness::Unknown => println!("  Support sources not found; freshness unknown"),
            Freshness::NotCached => {}
        }
    }
    Ok(())
}

fn clear(ctx: &Context, args: &CacheArgs) -> Result<()> {
    let cache = ArtifactCache::new(ctx.config.cache_dir());
    let cleared = cache.clear(args.platform.backend())?;

    if cleared.is_empty() {
        println!("Nothing to clear for {}", args.platform);
    }
    for backend in cleared {
        println!("Cleared {} cache", backend);
    }
    Ok(())
}

async fn rebuild(ctx: &Context, args: &CacheArgs) -> Result<()> {
    for backend in args.platform.backends() {
        if ctx.config.toolchain(backend).support_library.is_none()
            && args.platform == PlatformSelection::All
        {
            tracing::debug!("{} has no support library, skipping", backend);
            continue;
        }

        let progress = std::sync::Arc::new(ctx.progress(1));
        let pipeline = Pipeline::new(&ctx.config, ExternalToolchain::from_config(&ctx.config, backend))
            .with_progress(progress.clone());
        let entry = pipeline.rebuild_library().await?;
        progress.finish("Cache rebuilt");

        println!(
            "Rebuilt {} cache: {} ({})",
            backend,
            entry.artifact,
            entry.fingerprint.short()
        );
    }
    Ok(())
}

fn format_age(seconds: i64) -> String {
    match seconds.max(0) {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}
