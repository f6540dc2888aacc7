//! Compiler invocation
//!
//! [`Toolchain`] is the seam between the pipeline and the external compilers.
//! [`ExternalToolchain`] drives a gcc-style driver (`g++` for native, `emcc` for
//! web) plus an `ar`-style archiver. Outputs are produced in a staging directory
//! next to the final location and moved into place only on success, so a failed
//! or cancelled compile leaves no partial artifact behind.

use camino::{Utf8Path, Utf8PathBuf};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{Backend, Config};
use crate::{Error, Result};

use super::process::{LogCallback, run_command_with_logging};

/// Shape of a compile output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// A linked program: an executable, or an HTML/JS/WASM bundle for web
    Executable,
    /// Objects archived into a static library
    StaticLibrary,
}

/// One invocation of the compiler invoker
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Human readable name of what is built, used in logs and errors
    pub label: String,
    /// Translation units
    pub sources: Vec<Utf8PathBuf>,
    /// Compiler flags
    pub flags: Vec<String>,
    /// `-I` directories
    pub include_paths: Vec<Utf8PathBuf>,
    /// `-L` directories
    pub library_paths: Vec<Utf8PathBuf>,
    /// `-l` libraries
    pub libraries: Vec<String>,
    /// Archives linked directly (e.g. a cached support library)
    pub link_inputs: Vec<Utf8PathBuf>,
    /// Arguments appended before `-o` (e.g. `--shell-file`)
    pub extra_args: Vec<String>,
    /// Final output path
    pub output: Utf8PathBuf,
    /// What to produce
    pub kind: OutputKind,
}

/// Result of a successful compile
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// Files moved into place; the requested output comes first
    pub artifacts: Vec<Utf8PathBuf>,
    /// Compiler output of the successful run (warnings), verbatim
    pub diagnostics: String,
    /// Wall time spent
    pub elapsed: Duration,
}

/// Invokes the external toolchain of one backend
pub trait Toolchain: Sync {
    /// Backend this toolchain produces artifacts for
    fn backend(&self) -> Backend;

    /// Fail with [`Error::ToolchainUnavailable`] unless the required tools run
    fn check_available(&self) -> impl Future<Output = Result<()>> + Send;

    /// Build the request's output. A non-zero exit becomes [`Error::Compiler`]
    /// carrying the tool's output verbatim.
    fn compile(&self, request: &CompileRequest)
    -> impl Future<Output = Result<CompileOutput>> + Send;
}

/// A gcc-compatible compiler driver plus an archiver
#[derive(Clone)]
pub struct ExternalToolchain {
    backend: Backend,
    compiler: String,
    archiver: Option<String>,
    jobs: usize,
    log_callback: Option<LogCallback>,
}

impl std::fmt::Debug for ExternalToolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalToolchain")
            .field("backend", &self.backend)
            .field("compiler", &self.compiler)
            .field("archiver", &self.archiver)
            .field("jobs", &self.jobs)
            .finish()
    }
}

impl ExternalToolchain {
    /// Toolchain for a backend as configured. The archiver is only required when
    /// the backend has a support library to build.
    pub fn from_config(config: &Config, backend: Backend) -> Self {
        let toolchain = config.toolchain(backend);
        Self {
            backend,
            compiler: toolchain.compiler.clone(),
            archiver: toolchain
                .support_library
                .as_ref()
                .map(|_| toolchain.archiver.clone()),
            jobs: config.effective_jobs().max(1),
            log_callback: None,
        }
    }

    /// Toolchain with explicit programs
    pub fn new(backend: Backend, compiler: impl Into<String>, archiver: impl Into<String>) -> Self {
        Self {
            backend,
            compiler: compiler.into(),
            archiver: Some(archiver.into()),
            jobs: 1,
            log_callback: None,
        }
    }

    /// Set the number of concurrent compiler processes for library builds
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Forward every output line to a callback
    pub fn with_log_callback(mut self, callback: LogCallback) -> Self {
        self.log_callback = Some(callback);
        self
    }

    fn install_help(&self) -> &'static str {
        match self.backend {
            Backend::Web => {
                "Install and activate Emscripten:\n  git clone https://github.com/emscripten-core/emsdk.git\n  cd emsdk && ./emsdk install latest && ./emsdk activate latest"
            }
            Backend::Native => {
                "Install g++ or clang++ (Ubuntu/Debian: sudo apt-get install build-essential)"
            }
        }
    }

    async fn probe(&self, program: &str, args: &[&str]) -> Result<()> {
        let mut cmd = Command::new(program);
        cmd.args(args);

        match run_command_with_logging(&mut cmd, program, None).await {
            Ok(output) if output.success() => Ok(()),
            Ok(_) | Err(Error::Io(_)) => Err(Error::toolchain_unavailable(
                program,
                self.backend,
                self.install_help(),
            )),
            Err(e) => Err(e),
        }
    }

    async fn link(&self, request: &CompileRequest, staging: &Utf8Path) -> Result<String> {
        let file_name = output_file_name(&request.output)?;
        let staged = staging.join(file_name);

        let mut cmd = Command::new(&self.compiler);
        cmd.args(&request.flags);
        for include in &request.include_paths {
            cmd.arg("-I").arg(include);
        }
        cmd.args(&request.sources);
        cmd.args(&request.link_inputs);
        for dir in &request.library_paths {
            cmd.arg("-L").arg(dir);
        }
        for lib in &request.libraries {
            cmd.arg("-l").arg(lib);
        }
        cmd.args(&request.extra_args);
        cmd.arg("-o").arg(&staged);

        let output = run_command_with_logging(&mut cmd, &request.label, self.log_callback.clone()).await?;
        if !output.success() {
            return Err(Error::compiler(&request.label, output.diagnostics()));
        }
        Ok(output.diagnostics())
    }

    async fn archive(&self, request: &CompileRequest, staging: &Utf8Path) -> Result<String> {
        let archiver = self.archiver.as_deref().ok_or_else(|| {
            Error::config(
                format!("No archiver configured for {} builds", self.backend),
                format!("Set {}.archiver in ~/.fern/config.toml", self.backend),
            )
        })?;

        let objects_dir = staging.join("objects");
        std::fs::create_dir_all(&objects_dir)?;

        let common: Arc<Vec<String>> = Arc::new(
            request
                .flags
                .iter()
                .cloned()
                .chain(
                    request
                        .include_paths
                        .iter()
                        .flat_map(|p| ["-I".to_string(), p.to_string()]),
                )
                .collect(),
        );
        let limit = Arc::new(Semaphore::new(self.jobs));
        let mut jobs = JoinSet::new();

        for (index, source) in request.sources.iter().enumerate() {
            let object = objects_dir.join(format!(
                "{:04}_{}.o",
                index,
                source.file_stem().unwrap_or("unit")
            ));
            let compiler = self.compiler.clone();
            let common = common.clone();
            let limit = limit.clone();
            let callback = self.log_callback.clone();
            let source = source.clone();

            jobs.spawn(async move {
                let _permit = limit.acquire_owned().await.ok();
                let mut cmd = Command::new(&compiler);
                cmd.arg("-c")
                    .args(common.iter())
                    .arg(&source)
                    .arg("-o")
                    .arg(&object);
                let output = run_command_with_logging(&mut cmd, source.as_str(), callback).await?;
                Ok::<_, Error>((index, object, output))
            });
        }

        let mut objects = Vec::with_capacity(request.sources.len());
        let mut warnings = String::new();
        while let Some(joined) = jobs.join_next().await {
            let (index, object, output) = joined.map_err(|e| {
                Error::compiler(&request.label, format!("Compiler task failed: {}", e))
            })??;
            if !output.success() {
                // Dropping the set aborts the remaining compiles (and kills their processes)
                jobs.abort_all();
                return Err(Error::compiler(&request.label, output.diagnostics()));
            }
            warnings.push_str(&output.diagnostics());
            objects.push((index, object));
        }
        objects.sort_by_key(|(index, _)| *index);

        let staged = staging.join(output_file_name(&request.output)?);
        let mut cmd = Command::new(archiver);
        cmd.arg("rcs")
            .arg(&staged)
            .args(objects.iter().map(|(_, object)| object));

        let output = run_command_with_logging(&mut cmd, &request.label, self.log_callback.clone()).await?;
        if !output.success() {
            return Err(Error::compiler(
                format!("Archiving {}", request.label),
                output.diagnostics(),
            ));
        }
        warnings.push_str(&output.diagnostics());

        // Objects are intermediate; only the archive is published
        std::fs::remove_dir_all(&objects_dir)?;
        Ok(warnings)
    }
}

impl Toolchain for ExternalToolchain {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn check_available(&self) -> Result<()> {
        self.probe(&self.compiler, &["--version"]).await?;
        if let Some(ref archiver) = self.archiver {
            self.probe(archiver, &["--version"]).await?;
        }
        Ok(())
    }

    async fn compile(&self, request: &CompileRequest) -> Result<CompileOutput> {
        let start = Instant::now();

        if request.sources.is_empty() {
            return Err(Error::compiler(&request.label, "no source files to compile"));
        }

        let parent = request
            .output
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        std::fs::create_dir_all(parent)?;

        let staging = tempfile::Builder::new()
            .prefix(".terra-staging-")
            .tempdir_in(parent)?;
        let staging_path = Utf8Path::from_path(staging.path()).ok_or_else(|| {
            Error::config(
                format!("Path is not valid UTF-8: {:?}", staging.path()),
                "Ensure the output directory path is valid UTF-8",
            )
        })?;

        tracing::info!(
            backend = %self.backend,
            "Compiling {} ({} source files)",
            request.label,
            request.sources.len()
        );

        let diagnostics = match request.kind {
            OutputKind::Executable => self.link(request, staging_path).await?,
            OutputKind::StaticLibrary => self.archive(request, staging_path).await?,
        };

        let artifacts = publish(staging_path, parent, &request.output)?;

        Ok(CompileOutput {
            artifacts,
            diagnostics,
            elapsed: start.elapsed(),
        })
    }
}

fn output_file_name(output: &Utf8Path) -> Result<&str> {
    output.file_name().ok_or_else(|| {
        Error::config(
            format!("Output path {} has no file name", output),
            "This is likely a bug in terra",
        )
    })
}

/// Move every staged file into the output directory. The requested output is
/// moved last so its presence implies its companions (`.js`, `.wasm`) are there.
fn publish(staging: &Utf8Path, parent: &Utf8Path, output: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let output_name = output_file_name(output)?;
    if !staging.join(output_name).is_file() {
        return Err(Error::compiler(
            format!("Building {}", output),
            "the compiler reported success but produced no output file",
        ));
    }

    let mut companions = Vec::new();
    for entry in std::fs::read_dir(staging)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if name != output_name {
                companions.push(name.to_string());
            }
        }
    }
    companions.sort();

    let mut artifacts = vec![output.to_path_buf()];
    for name in &companions {
        let target = parent.join(name);
        std::fs::rename(staging.join(name), &target)?;
        artifacts.push(target);
    }
    std::fs::rename(staging.join(output_name), output)?;

    Ok(artifacts)
}
