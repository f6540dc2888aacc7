//! CLI command implementations

pub mod cache;
pub mod fire;

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::MultiProgress;
use std::future::Future;

use crate::build::BuildProgress;
use crate::config::Config;
use crate::{Error, Result};

/// Everything a command needs from the invocation, resolved once up front
#[derive(Debug, Clone)]
pub struct Context {
    /// Parsed global configuration with all paths filled in
    pub config: Config,
    /// Directory terra was invoked from
    pub working_dir: Utf8PathBuf,
    /// Progress container shared with the log writer; `None` draws nothing
    pub multi: Option<MultiProgress>,
}

impl Context {
    /// Load `<home>/.fern/config.toml` (and its local override)
    pub fn load(home: &Utf8Path, working_dir: impl Into<Utf8PathBuf>) -> Result<Self> {
        let mut config = Config::load(&home.join(".fern"))?;
        config.resolve_paths(home);
        Ok(Self::new(config, working_dir))
    }

    pub fn new(config: Config, working_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            config,
            working_dir: working_dir.into(),
            multi: None,
        }
    }

    /// Draw progress through `multi`
    pub fn with_progress(mut self, multi: MultiProgress) -> Self {
        self.multi = Some(multi);
        self
    }

    /// Progress display for a run of `stages` stages
    pub fn progress(&self, stages: usize) -> BuildProgress {
        match &self.multi {
            Some(multi) => BuildProgress::new(multi.clone(), stages),
            None => BuildProgress::hidden(stages),
        }
    }
}

/// Create the runtime a command runs on
pub(crate) fn runtime(jobs: usize) -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(jobs.clamp(1, 16))
        .enable_all()
        .build()
        .map_err(|e| {
            Error::config(
                format!("Failed to create async runtime: {}", e),
                "This is likely a resource limit of the host",
            )
        })
}

/// Run a future until it completes or the terminal sends an interrupt.
/// On interrupt the future is dropped, which kills its child processes.
pub async fn interruptible<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        result = future => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted");
            Err(Error::Interrupted)
        }
    }
}
