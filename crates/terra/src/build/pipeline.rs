//! Platform build pipeline
//!
//! One run takes a [`BuildRequest`] through
//!
//! ```text
//! RESOLVE -> FINGERPRINT -> CACHE_CHECK -> LIBRARY_BUILD -> PROJECT_BUILD
//!                                 \______ hit ______________/
//! ```
//!
//! The cache key covers the support library sources only, never the project's
//! files, so editing project code always rebuilds just the project. Any error ends
//! the run; dropping the future cancels it, killing compiler processes and
//! discarding staged outputs.

use camino::{Utf8Path, Utf8PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{ArtifactCache, CacheEntry};
use crate::config::{Backend, Config, Mode, SupportLibrary};
use crate::fingerprint::{Fingerprint, SourceTree, fingerprint, is_source_file};
use crate::project::Project;
use crate::{Error, Result};

use super::progress::BuildProgress;
use super::toolchain::{CompileRequest, OutputKind, Toolchain};

/// Pipeline states, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Fingerprint,
    CacheCheck,
    LibraryBuild,
    ProjectBuild,
}

impl Stage {
    /// Number of stages a full run goes through
    pub const COUNT: usize = 5;

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Fingerprint => "fingerprint",
            Stage::CacheCheck => "cache check",
            Stage::LibraryBuild => "library build",
            Stage::ProjectBuild => "project build",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One build invocation
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Target backend
    pub backend: Backend,
    /// Explicit source file; `None` builds the project's entry file
    pub source: Option<Utf8PathBuf>,
    /// Optimization profile
    pub mode: Mode,
    /// Skip the cache lookup (the rebuilt library is still stored)
    pub force_rebuild: bool,
    /// Directory the invocation runs in; relative paths resolve against it
    pub working_dir: Utf8PathBuf,
}

impl BuildRequest {
    pub fn new(backend: Backend, working_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            backend,
            source: None,
            mode: Mode::default(),
            force_rebuild: false,
            working_dir: working_dir.into(),
        }
    }

    pub fn with_source(mut self, source: impl Into<Utf8PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_force_rebuild(mut self, force_rebuild: bool) -> Self {
        self.force_rebuild = force_rebuild;
        self
    }
}

/// What RESOLVE decided to build
#[derive(Debug, Clone)]
pub struct BuildTarget {
    /// Translation unit of the project
    pub entry: Utf8PathBuf,
    /// Final artifact path
    pub output: Utf8PathBuf,
    /// HTML shell passed to web builds
    pub shell_template: Option<Utf8PathBuf>,
    /// The project, for whole-project builds
    pub project: Option<Project>,
}

impl BuildTarget {
    /// Directory holding the output (served for web builds)
    pub fn output_dir(&self) -> &Utf8Path {
        self.output.parent().unwrap_or(Utf8Path::new("."))
    }
}

/// How the support library was obtained
#[derive(Debug, Clone)]
pub enum LibraryOutcome {
    /// A cached artifact matched the current sources
    CacheHit(CacheEntry),
    /// The library was compiled and stored
    Rebuilt(CacheEntry),
    /// The backend links an installed library instead
    NotRequired,
}

impl LibraryOutcome {
    /// Cached artifact the project links against
    pub fn artifact(&self) -> Option<&Utf8Path> {
        match self {
            LibraryOutcome::CacheHit(entry) | LibraryOutcome::Rebuilt(entry) => {
                Some(&entry.artifact)
            }
            LibraryOutcome::NotRequired => None,
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        matches!(self, LibraryOutcome::CacheHit(_))
    }
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub backend: Backend,
    pub target: BuildTarget,
    /// Produced files; the runnable artifact comes first
    pub artifacts: Vec<Utf8PathBuf>,
    /// Compiler warnings, verbatim
    pub diagnostics: String,
    pub elapsed: Duration,
    pub library: LibraryOutcome,
    /// Stages that ran, in order
    pub stages: Vec<Stage>,
}

impl BuildResult {
    /// The runnable artifact (executable or HTML page)
    pub fn artifact(&self) -> &Utf8Path {
        &self.target.output
    }

    /// Number of LIBRARY_BUILD steps performed (0 or 1)
    pub fn library_builds(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| **s == Stage::LibraryBuild)
            .count()
    }
}

/// The build pipeline of one backend
pub struct Pipeline<'a, T: Toolchain> {
    config: &'a Config,
    cache: ArtifactCache,
    toolchain: T,
    progress: Option<Arc<BuildProgress>>,
}

impl<'a, T: Toolchain> Pipeline<'a, T> {
    /// Create a pipeline using the configured cache directory
    pub fn new(config: &'a Config, toolchain: T) -> Self {
        Self {
            cache: ArtifactCache::new(config.cache_dir()),
            config,
            toolchain,
            progress: None,
        }
    }

    /// Report stage transitions to a progress display
    pub fn with_progress(mut self, progress: Arc<BuildProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn backend(&self) -> Backend {
        self.toolchain.backend()
    }

    /// Run the pipeline for one request
    pub async fn run(&self, request: &BuildRequest) -> Result<BuildResult> {
        let start = Instant::now();
        let backend = self.backend();
        if request.backend != backend {
            return Err(Error::config(
                format!(
                    "{} build requested from the {} pipeline",
                    request.backend, backend
                ),
                "This is likely a bug in terra",
            ));
        }

        self.check_toolchain().await?;

        let mut stages = Vec::with_capacity(Stage::COUNT);

        let target = self.stage(Stage::Resolve, "", || self.resolve(request))?;
        stages.push(Stage::Resolve);
        tracing::info!(backend = %backend, "Building {}", target.entry);

        let library = match self.config.support_library(backend)? {
            Some(support) => {
                self.ensure_library(&support, request.force_rebuild, &mut stages)
                    .await?
            }
            None => {
                self.skip(Stage::Fingerprint);
                self.skip(Stage::CacheCheck);
                self.skip(Stage::LibraryBuild);
                LibraryOutcome::NotRequired
            }
        };

        self.start(Stage::ProjectBuild, target.entry.as_str());
        let output = match self.build_project(&target, &library, request.mode).await {
            Ok(output) => output,
            Err(e) => return Err(self.fail(e)),
        };
        self.finish();
        stages.push(Stage::ProjectBuild);

        let elapsed = start.elapsed();
        tracing::info!(
            backend = %backend,
            "Built {} in {:.2}s",
            target.output,
            elapsed.as_secs_f64()
        );

        Ok(BuildResult {
            backend,
            target,
            artifacts: output.artifacts,
            diagnostics: output.diagnostics,
            elapsed,
            library,
            stages,
        })
    }

    /// Drop the backend's cache entry, then compile the support library and
    /// store it. Nothing is removed unless the toolchain is available.
    pub async fn rebuild_library(&self) -> Result<CacheEntry> {
        let backend = self.backend();
        let Some(support) = self.config.support_library(backend)? else {
            return Err(Error::cache(
                format!("The {} backend has no support library to cache", backend),
                format!(
                    "{} builds link the installed library; configure {}.support_library to cache one",
                    backend, backend
                ),
            ));
        };

        self.toolchain.check_available().await?;
        self.cache.clear(Some(backend))?;

        let mut stages = Vec::new();
        match self.ensure_library(&support, true, &mut stages).await? {
            LibraryOutcome::Rebuilt(entry) | LibraryOutcome::CacheHit(entry) => Ok(entry),
            LibraryOutcome::NotRequired => Err(Error::cache(
                "Support library was not rebuilt",
                "This is likely a bug in terra",
            )),
        }
    }

    /// Current fingerprint of a backend's support sources, if it has any
    pub fn current_fingerprint(&self) -> Result<Option<Fingerprint>> {
        let Some(support) = self.config.support_library(self.backend())? else {
            return Ok(None);
        };
        let tree = SourceTree::scan(&support)?;
        Ok(Some(fingerprint(&tree, self.config.cache.fingerprint)?))
    }

    /// Fail fast when the toolchain (or, for installed-library builds, the
    /// library itself) is missing
    async fn check_toolchain(&self) -> Result<()> {
        self.toolchain.check_available().await?;

        let backend = self.backend();
        if self.config.toolchain(backend).support_library.is_none() {
            let installed = self.config.installed_library();
            if !installed.as_ref().is_some_and(|lib| lib.is_file()) {
                return Err(Error::toolchain_unavailable(
                    "libfern.a",
                    backend,
                    format!(
                        "Install the Fern C++ library (expected at {}) or set paths.library_prefix",
                        installed
                            .as_ref()
                            .map_or("<library_prefix>/lib/libfern.a", |p| p.as_str())
                    ),
                ));
            }
        }
        Ok(())
    }

    fn resolve(&self, request: &BuildRequest) -> Result<BuildTarget> {
        let backend = request.backend;
        let output_name = |stem: &str| match backend {
            Backend::Native => stem.to_string(),
            Backend::Web => format!("{}.html", stem),
        };

        if let Some(source) = &request.source {
            let path = if source.is_absolute() {
                source.clone()
            } else {
                request.working_dir.join(source)
            };
            if !path.is_file() {
                return Err(Error::SourceNotFound { path });
            }
            if !is_source_file(&path) {
                return Err(Error::UnsupportedSource { path });
            }

            let stem = path.file_stem().unwrap_or("main");
            let template = request.working_dir.join("template.html");
            return Ok(BuildTarget {
                output: request
                    .working_dir
                    .join("build")
                    .join(output_name(&format!("{}_temp", stem))),
                entry: path,
                shell_template: template.is_file().then_some(template),
                project: None,
            });
        }

        let project = Project::find(&request.working_dir)?.ok_or_else(|| {
            Error::project(
                format!("Not in a Fern project directory: {}", request.working_dir),
                "Run terra inside a project (a directory with fern.toml) or pass a source file",
            )
        })?;

        if !project.descriptor.supports(backend) {
            return Err(Error::project(
                format!(
                    "Project {} does not enable the {} platform",
                    project.descriptor.name, backend
                ),
                format!("Set platforms.{}.enabled = true in fern.toml", backend),
            ));
        }

        let entry = project.entry_file();
        if !entry.is_file() {
            return Err(Error::MissingEntryFile { path: entry });
        }

        Ok(BuildTarget {
            entry,
            output: project.build_dir().join(output_name("main")),
            shell_template: project.shell_template(),
            project: Some(project),
        })
    }

    async fn ensure_library(
        &self,
        support: &SupportLibrary,
        force_rebuild: bool,
        stages: &mut Vec<Stage>,
    ) -> Result<LibraryOutcome> {
        let backend = support.backend;

        let (tree, current) = self.stage(Stage::Fingerprint, support.root.as_str(), || {
            let tree = SourceTree::scan(support)?;
            let current = fingerprint(&tree, self.config.cache.fingerprint)?;
            Ok((tree, current))
        })?;
        stages.push(Stage::Fingerprint);
        tracing::debug!(
            backend = %backend,
            files = tree.len(),
            "Support library fingerprint {}",
            current
        );

        let hit = self.stage(Stage::CacheCheck, backend.as_str(), || {
            if force_rebuild {
                tracing::info!(backend = %backend, "Forced rebuild, skipping cache lookup");
                return Ok(None);
            }
            Ok(self.cache.lookup(backend, &current))
        })?;
        stages.push(Stage::CacheCheck);

        if let Some(entry) = hit {
            tracing::info!(
                backend = %backend,
                fingerprint = %current.short(),
                "Using cached support library"
            );
            self.skip(Stage::LibraryBuild);
            return Ok(LibraryOutcome::CacheHit(entry));
        }

        self.start(Stage::LibraryBuild, &support.artifact_name());
        let entry = match self.build_library(support, &tree, &current).await {
            Ok(entry) => entry,
            Err(e) => return Err(self.fail(e)),
        };
        self.finish();
        stages.push(Stage::LibraryBuild);

        Ok(LibraryOutcome::Rebuilt(entry))
    }

    async fn build_library(
        &self,
        support: &SupportLibrary,
        tree: &SourceTree,
        key: &Fingerprint,
    ) -> Result<CacheEntry> {
        let units = tree.compile_units();
        if units.is_empty() {
            return Err(Error::config(
                format!("No support library sources found under {}", support.root),
                "Set paths.fern_source in ~/.fern/config.toml to the Fern src/cpp directory",
            ));
        }

        tracing::info!(
            backend = %support.backend,
            "Building support library ({} sources)",
            units.len()
        );

        std::fs::create_dir_all(self.cache.root())?;
        let scratch = tempfile::Builder::new()
            .prefix(".tmp-build-")
            .tempdir_in(self.cache.root())?;
        let scratch_dir = Utf8Path::from_path(scratch.path()).ok_or_else(|| {
            Error::cache(
                format!("Cache path is not valid UTF-8: {:?}", scratch.path()),
                "Set paths.cache_dir to a UTF-8 path",
            )
        })?;

        // The cached library does not depend on the build mode
        let request = CompileRequest {
            label: format!("{} support library", support.backend),
            sources: units,
            flags: self.config.mode_flags(Mode::Release).to_vec(),
            include_paths: vec![support.include_dir.clone()],
            library_paths: Vec::new(),
            libraries: Vec::new(),
            link_inputs: Vec::new(),
            extra_args: Vec::new(),
            output: scratch_dir.join(support.artifact_name()),
            kind: OutputKind::StaticLibrary,
        };
        let output = self.toolchain.compile(&request).await?;
        tracing::debug!(
            backend = %support.backend,
            "Support library compiled in {:.2}s",
            output.elapsed.as_secs_f64()
        );

        self.cache.store(support.backend, key, &request.output)
    }

    async fn build_project(
        &self,
        target: &BuildTarget,
        library: &LibraryOutcome,
        mode: Mode,
    ) -> Result<super::toolchain::CompileOutput> {
        let backend = self.backend();
        let toolchain = self.config.toolchain(backend);

        let mut flags = self.config.mode_flags(mode).to_vec();
        flags.extend(toolchain.flags.iter().cloned());

        let mut request = CompileRequest {
            label: format!("{} build of {}", backend, target.entry),
            sources: vec![target.entry.clone()],
            flags,
            include_paths: Vec::new(),
            library_paths: Vec::new(),
            libraries: Vec::new(),
            link_inputs: Vec::new(),
            extra_args: Vec::new(),
            output: target.output.clone(),
            kind: OutputKind::Executable,
        };

        match library.artifact() {
            Some(artifact) => {
                if let Some(support) = self.config.support_library(backend)? {
                    request.include_paths.push(support.include_dir);
                }
                request.link_inputs.push(artifact.to_path_buf());
            }
            None => {
                request.include_paths = self.config.build.include_paths.clone();
                request.library_paths = self.config.build.library_paths.clone();
                request.libraries = self.config.build.libraries.clone();
            }
        }

        if backend == Backend::Web
            && let Some(template) = &target.shell_template
        {
            request.extra_args.push("--shell-file".to_string());
            request.extra_args.push(template.to_string());
        }

        self.toolchain.compile(&request).await
    }

    fn stage<R>(&self, stage: Stage, detail: &str, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.start(stage, detail);
        match f() {
            Ok(value) => {
                self.finish();
                Ok(value)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn start(&self, stage: Stage, detail: &str) {
        tracing::debug!(backend = %self.backend(), "Stage: {}", stage);
        if let Some(progress) = &self.progress {
            progress.start_stage(stage.as_str(), detail);
        }
    }

    fn finish(&self) {
        if let Some(progress) = &self.progress {
            progress.finish_stage();
        }
    }

    fn skip(&self, stage: Stage) {
        if let Some(progress) = &self.progress {
            progress.skip_stage(stage.as_str());
        }
    }

    fn fail(&self, error: Error) -> Error {
        if let Some(progress) = &self.progress {
            progress.fail_stage(&error.to_string());
        }
        error
    }
}
