//! Fern project discovery
//!
//! A project is the nearest ancestor directory holding `fern.toml` (or a legacy
//! `fern.yaml`, which only marks the root). Its layout is fixed:
//!
//! ```text
//! fern.toml
//! lib/main.cpp        entry file
//! web/template.html   optional HTML shell for web builds
//! build/              outputs
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::config::Backend;
use crate::{Error, Result};

/// Files marking a project root, in order of preference
pub const PROJECT_MARKERS: &[&str] = &["fern.toml", "fern.yaml"];

/// Project descriptor read from `fern.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectDescriptor {
    /// Project name (default: the directory name)
    pub name: String,

    /// Project version
    pub version: Option<String>,

    /// Per-platform settings
    pub platforms: Platforms,
}

/// Per-platform settings of a project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Platforms {
    #[serde(alias = "linux")]
    pub native: PlatformSettings,
    pub web: PlatformSettings,
}

/// Settings of one platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    /// Whether the project builds for this platform
    pub enabled: bool,

    /// Preferred dev server port (web only)
    pub port: Option<u16>,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            port: None,
        }
    }
}

impl ProjectDescriptor {
    /// Parse a descriptor from TOML
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Whether a backend is enabled
    pub fn supports(&self, backend: Backend) -> bool {
        self.platform(backend).enabled
    }

    /// Settings of a backend
    pub fn platform(&self, backend: Backend) -> &PlatformSettings {
        match backend {
            Backend::Native => &self.platforms.native,
            Backend::Web => &self.platforms.web,
        }
    }

    /// Preferred dev server port, if the project names one
    pub fn port(&self) -> Option<u16> {
        self.platforms.web.port
    }
}

/// A discovered project
#[derive(Debug, Clone)]
pub struct Project {
    /// Root directory of the project
    pub root: Utf8PathBuf,

    /// Parsed descriptor
    pub descriptor: ProjectDescriptor,
}

impl Project {
    /// Find the project containing `start`, searching upwards
    pub fn find(start: &Utf8Path) -> Result<Option<Self>> {
        let start = start.canonicalize_utf8().map_err(|e| {
            Error::project(
                format!("Failed to resolve {}: {}", start, e),
                "Ensure the path exists and is accessible",
            )
        })?;

        for dir in start.ancestors() {
            if PROJECT_MARKERS.iter().any(|m| dir.join(m).is_file()) {
                tracing::debug!("Found Fern project at {}", dir);
                return Self::load(dir).map(Some);
            }
        }
        Ok(None)
    }

    /// Load the project rooted at `root`
    pub fn load(root: &Utf8Path) -> Result<Self> {
        let manifest = root.join(PROJECT_MARKERS[0]);

        let mut descriptor = if manifest.is_file() {
            let content = std::fs::read_to_string(&manifest)?;
            ProjectDescriptor::parse(&content).map_err(|e| {
                Error::project(
                    format!("Failed to parse {}: {}", manifest, e),
                    "Fix the syntax error in fern.toml",
                )
            })?
        } else {
            ProjectDescriptor::default()
        };

        if descriptor.name.is_empty() {
            descriptor.name = root.file_name().unwrap_or("fern-app").to_string();
        }

        Ok(Self {
            root: root.to_path_buf(),
            descriptor,
        })
    }

    /// Conventional entry file
    pub fn entry_file(&self) -> Utf8PathBuf {
        self.root.join("lib").join("main.cpp")
    }

    /// Output directory
    pub fn build_dir(&self) -> Utf8PathBuf {
        self.root.join("build")
    }

    /// Custom HTML shell for web builds, if present
    pub fn shell_template(&self) -> Option<Utf8PathBuf> {
        let template = self.root.join("web").join("template.html");
        template.is_file().then_some(template)
    }
}
