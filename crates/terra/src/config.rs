//! Global configuration
//!
//! This module handles parsing of `~/.fern/config.toml` and `~/.fern/config.local.toml`.
//! Both files are merged over the built-in defaults, so a user file only needs to
//! name the keys it changes. The binary loads the configuration once per invocation
//! and threads the value into the pipeline; nothing below this module reads the
//! environment.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::fingerprint::FingerprintScheme;
use crate::{Error, Result};

/// Target platform backend
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Native executable linked with the host C++ toolchain
    #[value(alias = "linux")]
    Native,
    /// Browser bundle (HTML + JS + WebAssembly) produced by emscripten
    Web,
}

impl Backend {
    /// All supported backends
    pub const ALL: [Backend; 2] = [Backend::Native, Backend::Web];

    /// Stable identifier used for cache directories and artifact names
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Native => "native",
            Backend::Web => "web",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optimization profile of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Mode {
    Debug,
    #[default]
    Release,
}

/// Main configuration structure for terra
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Installation and cache locations
    pub paths: PathsConfig,

    /// Flags shared by both backends
    pub build: BuildConfig,

    /// Native toolchain
    pub native: ToolchainConfig,

    /// Web toolchain
    #[serde(default = "ToolchainConfig::web")]
    pub web: ToolchainConfig,

    /// Dev server settings
    pub server: ServerConfig,

    /// Artifact cache settings
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            build: BuildConfig::default(),
            native: ToolchainConfig::native(),
            web: ToolchainConfig::web(),
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Prefix the Fern C++ library is installed under (default: `~/.local`)
    pub library_prefix: Option<Utf8PathBuf>,

    /// Root of the artifact cache (default: `~/.fern/cache`)
    pub cache_dir: Option<Utf8PathBuf>,

    /// Fern C++ source tree (the directory holding `include/` and `src/`)
    pub fern_source: Option<Utf8PathBuf>,
}

/// Compiler settings shared by both backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Flags for release builds
    pub release_flags: Vec<String>,

    /// Flags for debug builds
    pub debug_flags: Vec<String>,

    /// Extra include directories (default: `<library_prefix>/include`)
    pub include_paths: Vec<Utf8PathBuf>,

    /// Extra library directories (default: `<library_prefix>/lib`)
    pub library_paths: Vec<Utf8PathBuf>,

    /// Libraries linked into native executables
    pub libraries: Vec<String>,

    /// Parallel compiler processes for support-library builds (default: logical CPUs)
    pub jobs: Option<usize>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            release_flags: strings(&["-std=c++17", "-O2"]),
            debug_flags: strings(&["-std=c++17", "-g", "-O0"]),
            include_paths: Vec::new(),
            library_paths: Vec::new(),
            libraries: strings(&["fern", "X11", "Xext", "fontconfig", "freetype"]),
            jobs: None,
        }
    }
}

/// Per-backend toolchain settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Compiler driver
    pub compiler: String,

    /// Static archiver
    pub archiver: String,

    /// Backend specific flags appended after the mode flags
    pub flags: Vec<String>,

    /// Support library compiled and cached for this backend
    pub support_library: Option<SupportLibraryConfig>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self::native()
    }
}

impl ToolchainConfig {
    /// Native defaults: link against the installed library, nothing cached
    pub fn native() -> Self {
        Self {
            compiler: "g++".to_string(),
            archiver: "ar".to_string(),
            flags: Vec::new(),
            support_library: None,
        }
    }

    /// Web defaults: emscripten with the Fern web library sources cached
    pub fn web() -> Self {
        Self {
            compiler: "emcc".to_string(),
            archiver: "emar".to_string(),
            flags: strings(&[
                "-s",
                "WASM=1",
                "-s",
                "ALLOW_MEMORY_GROWTH=1",
                "-s",
                "USE_WEBGL2=1",
                "-s",
                "EXPORTED_FUNCTIONS=['_main']",
                "-s",
                "EXPORTED_RUNTIME_METHODS=['ccall','cwrap']",
            ]),
            support_library: Some(SupportLibraryConfig::fern_web()),
        }
    }
}

/// Description of a support library source tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupportLibraryConfig {
    /// Source root (default: `paths.fern_source`)
    pub source_root: Option<Utf8PathBuf>,

    /// Header directory, relative to the source root
    pub include_dir: Utf8PathBuf,

    /// Members relative to the source root: a file, a directory, or `dir/**`
    pub entries: Vec<String>,
}

impl Default for SupportLibraryConfig {
    fn default() -> Self {
        Self::fern_web()
    }
}

impl SupportLibraryConfig {
    /// The Fern library as compiled for the browser
    pub fn fern_web() -> Self {
        Self {
            source_root: None,
            include_dir: Utf8PathBuf::from("include"),
            entries: strings(&[
                "src/core",
                "src/graphics",
                "src/text",
                "src/font",
                "src/ui/**",
                "src/platform/web_renderer.cpp",
                "src/platform/platform_factory.cpp",
                "src/fern.cpp",
            ]),
        }
    }
}

/// Dev server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,

    /// Preferred port
    pub port: u16,

    /// Number of successive ports tried, starting at the preferred one
    pub port_attempts: u16,

    /// Grace period for a graceful stop before the server task is aborted
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            port_attempts: 10,
            shutdown_timeout_ms: 2000,
        }
    }
}

/// Artifact cache settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How support sources are summarized into a cache key
    pub fingerprint: FingerprintScheme,
}

impl Config {
    /// Load configuration from a directory holding `config.toml` and
    /// optionally `config.local.toml`.
    pub fn load(config_dir: &Utf8Path) -> Result<Self> {
        let config_path = config_dir.join("config.toml");
        let local_config_path = config_dir.join("config.local.toml");

        let mut merged = Self::defaults_value()?;

        for path in [config_path, local_config_path] {
            if path.exists() {
                tracing::debug!("Loading configuration from {}", path);
                let content = std::fs::read_to_string(&path)?;
                let value = toml::from_str::<toml::Value>(&content)?;
                merged = merge_toml_values(merged, value);
            }
        }

        Ok(merged.try_into()?)
    }

    /// Parse configuration from a string, on top of the defaults
    pub fn parse(content: &str) -> Result<Self> {
        let value = toml::from_str::<toml::Value>(content)?;
        Ok(merge_toml_values(Self::defaults_value()?, value).try_into()?)
    }

    fn defaults_value() -> Result<toml::Value> {
        toml::Value::try_from(Self::default()).map_err(|e| {
            Error::config(
                format!("Failed to serialize default configuration: {}", e),
                "This is likely a bug in terra",
            )
        })
    }

    /// Fill in every location left unset, relative to the user's home directory
    pub fn resolve_paths(&mut self, home: &Utf8Path) {
        let prefix = self
            .paths
            .library_prefix
            .get_or_insert_with(|| home.join(".local"))
            .clone();

        if self.paths.cache_dir.is_none() {
            self.paths.cache_dir = Some(home.join(".fern").join("cache"));
        }

        if self.build.include_paths.is_empty() {
            self.build.include_paths.push(prefix.join("include"));
        }
        if self.build.library_paths.is_empty() {
            self.build.library_paths.push(prefix.join("lib"));
        }

        if self.paths.fern_source.is_none() {
            self.paths.fern_source = fern_source_candidates(home)
                .into_iter()
                .find(|candidate| looks_like_fern_source(candidate));
            if let Some(ref source) = self.paths.fern_source {
                tracing::debug!("Found Fern sources at {}", source);
            }
        }
    }

    /// Root of the artifact cache
    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.paths
            .cache_dir
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from(".fern/cache"))
    }

    /// Toolchain settings of a backend
    pub fn toolchain(&self, backend: Backend) -> &ToolchainConfig {
        match backend {
            Backend::Native => &self.native,
            Backend::Web => &self.web,
        }
    }

    /// Mode flags
    pub fn mode_flags(&self, mode: Mode) -> &[String] {
        match mode {
            Mode::Debug => &self.build.debug_flags,
            Mode::Release => &self.build.release_flags,
        }
    }

    /// Source root and include directory of a backend's support library, if any
    pub fn support_library(&self, backend: Backend) -> Result<Option<SupportLibrary>> {
        let Some(support) = &self.toolchain(backend).support_library else {
            return Ok(None);
        };

        let root = support
            .source_root
            .clone()
            .or_else(|| self.paths.fern_source.clone())
            .ok_or_else(|| {
                Error::config(
                    format!("Fern source files not found for {} builds", backend),
                    "Set paths.fern_source in ~/.fern/config.toml to the Fern src/cpp directory",
                )
            })?;

        Ok(Some(SupportLibrary {
            backend,
            include_dir: root.join(&support.include_dir),
            entries: support.entries.clone(),
            root,
        }))
    }

    /// Installed static library native builds link against
    pub fn installed_library(&self) -> Option<Utf8PathBuf> {
        self.paths
            .library_prefix
            .as_ref()
            .map(|prefix| prefix.join("lib").join("libfern.a"))
    }

    /// Get the effective number of jobs
    pub fn effective_jobs(&self) -> usize {
        self.build
            .jobs
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
    }
}

/// A resolved support library: where its sources live and what belongs to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportLibrary {
    /// Backend the library is compiled for
    pub backend: Backend,
    /// Source root
    pub root: Utf8PathBuf,
    /// Header directory
    pub include_dir: Utf8PathBuf,
    /// Members relative to the root
    pub entries: Vec<String>,
}

impl SupportLibrary {
    /// File name of the archived library
    pub fn artifact_name(&self) -> String {
        format!("libfern_{}.a", self.backend)
    }
}

/// Conventional locations of the Fern sources
pub fn fern_source_candidates(home: &Utf8Path) -> Vec<Utf8PathBuf> {
    vec![
        home.join(".fern").join("src").join("cpp"),
        Utf8PathBuf::from("/usr/local/src/fern/src/cpp"),
        Utf8PathBuf::from("/opt/fern/src/cpp"),
    ]
}

fn looks_like_fern_source(path: &Utf8Path) -> bool {
    path.join("include").join("fern").is_dir() && path.join("src").is_dir()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

/// Merge two TOML values:
/// - Tables: recursively merged
/// - Arrays: local replaces base (not merged)
/// - Primitives: local overrides base
fn merge_toml_values(base: toml::Value, local: toml::Value) -> toml::Value {
    match (base, local) {
        (toml::Value::Table(mut base_table), toml::Value::Table(local_table)) => {
            for (key, local_value) in local_table {
                if let Some(base_value) = base_table.remove(&key) {
                    base_table.insert(key, merge_toml_values(base_value, local_value));
                } else {
                    base_table.insert(key, local_value);
                }
            }
            toml::Value::Table(base_table)
        }
        (_, local) => local,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.native.compiler, "g++");
        assert!(config.native.support_library.is_none());
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.port_attempts, 10);
        assert_eq!(config.build.release_flags, vec!["-std=c++17", "-O2"]);
        assert_eq!(config.cache.fingerprint, FingerprintScheme::Content);
    }

    #[test]
    fn test_parse_empty_config_uses_web_defaults() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.web.compiler, "emcc");
        assert_eq!(config.web.archiver, "emar");
        assert!(config.web.flags.contains(&"WASM=1".to_string()));
        assert_eq!(
            config.web.support_library,
            Some(SupportLibraryConfig::fern_web())
        );
    }

    #[test]
    fn test_partial_table_keeps_other_defaults() {
        let config = Config::parse(
            r#"
[web]
compiler = "em++"

[server]
port = 9000
"#,
        )
        .unwrap();

        assert_eq!(config.web.compiler, "em++");
        assert_eq!(config.web.archiver, "emar");
        assert!(config.web.support_library.is_some());
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_parse_full_config() {
        let content = r#"
[paths]
library_prefix = "/opt/fern"
cache_dir = "/tmp/fern-cache"
fern_source = "/src/fern/src/cpp"

[build]
release_flags = ["-std=c++20", "-O3"]
libraries = ["fern"]
jobs = 4

[native]
compiler = "clang++"

[native.support_library]
source_root = "/src/fern/src/cpp"
entries = ["src/**"]

[cache]
fingerprint = "mtime"
"#;

        let config = Config::parse(content).unwrap();

        assert_eq!(config.paths.library_prefix, Some("/opt/fern".into()));
        assert_eq!(config.cache_dir(), Utf8PathBuf::from("/tmp/fern-cache"));
        assert_eq!(config.build.release_flags, vec!["-std=c++20", "-O3"]);
        assert_eq!(config.build.libraries, vec!["fern"]);
        assert_eq!(config.effective_jobs(), 4);
        assert_eq!(config.native.compiler, "clang++");
        assert_eq!(config.cache.fingerprint, FingerprintScheme::Mtime);

        let native = config.support_library(Backend::Native).unwrap().unwrap();
        assert_eq!(native.entries, vec!["src/**"]);
        assert_eq!(native.include_dir, Utf8PathBuf::from("/src/fern/src/cpp/include"));
        assert_eq!(native.artifact_name(), "libfern_native.a");
    }

    #[test]
    fn test_load_merges_local_over_base() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(temp_dir.path()).unwrap();

        std::fs::write(
            dir.join("config.toml"),
            "[build]\njobs = 4\nlibraries = [\"fern\", \"X11\"]\n",
        )
        .unwrap();
        std::fs::write(dir.join("config.local.toml"), "[build]\njobs = 16\n").unwrap();

        let config = Config::load(dir).unwrap();

        assert_eq!(config.build.jobs, Some(16));
        assert_eq!(config.build.libraries, vec!["fern", "X11"]);
    }

    #[test]
    fn test_load_missing_files_gives_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(temp_dir.path()).unwrap();

        let config = Config::load(dir).unwrap();

        assert_eq!(config.web.compiler, "emcc");
        assert!(config.paths.cache_dir.is_none());
    }

    #[test]
    fn test_resolve_paths_from_home() {
        let temp_dir = tempfile::tempdir().unwrap();
        let home = Utf8Path::from_path(temp_dir.path()).unwrap();
        let source = home.join(".fern/src/cpp");
        std::fs::create_dir_all(source.join("include/fern")).unwrap();
        std::fs::create_dir_all(source.join("src")).unwrap();

        let mut config = Config::default();
        config.resolve_paths(home);

        assert_eq!(config.cache_dir(), home.join(".fern/cache"));
        assert_eq!(config.build.include_paths, vec![home.join(".local/include")]);
        assert_eq!(config.build.library_paths, vec![home.join(".local/lib")]);
        assert_eq!(config.paths.fern_source, Some(source.clone()));
        assert_eq!(
            config.installed_library(),
            Some(home.join(".local/lib/libfern.a"))
        );

        let web = config.support_library(Backend::Web).unwrap().unwrap();
        assert_eq!(web.root, source);
    }

    #[test]
    fn test_web_support_library_requires_source() {
        let config = Config::default();
        let err = config.support_library(Backend::Web).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        assert!(config.support_library(Backend::Native).unwrap().is_none());
    }
}
