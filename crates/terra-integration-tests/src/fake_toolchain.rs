//! A scripted toolchain
//!
//! `cc` behaves like a gcc-style driver: it writes whatever `-o` names (plus
//! `.js`/`.wasm` companions for `.html` outputs) and fails with a compiler-style
//! diagnostic when any source contains `SYNTAX_ERROR`. `ar` concatenates its
//! inputs. Both append one line per invocation to a log, so tests can count
//! library compiles, archives and links.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use tempfile::TempDir;
use terra::config::{Backend, Config};

/// Marker that makes the fake compiler fail
pub const SYNTAX_ERROR: &str = "SYNTAX_ERROR";

/// Diagnostic the fake compiler prints for a failing source
pub const ERROR_MESSAGE: &str = "error: expected ';' before '}' token";

const CC_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "fake-cc 1.0"; exit 0; fi
if [ -f "@DIR@/slow" ]; then sleep 10; fi
mode=link; out=""; prev=""
for a in "$@"; do
  if [ "$a" = "-c" ]; then mode=compile; fi
  if [ "$prev" = "-o" ]; then out="$a"; fi
  case "$a" in
    *.cpp|*.cc|*.cxx)
      if grep -q SYNTAX_ERROR "$a"; then
        echo "$a:1:1: error: expected ';' before '}' token" >&2
        exit 1
      fi ;;
  esac
  prev="$a"
done
echo "$mode $out" >> "@DIR@/invocations.log"
echo "built" > "$out"
case "$out" in
  *.html) echo "js" > "${out%.html}.js"; echo "wasm" > "${out%.html}.wasm" ;;
esac
"#;

const AR_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then echo "fake-ar 1.0"; exit 0; fi
echo "archive $2" >> "@DIR@/invocations.log"
shift; out="$1"; shift
cat "$@" > "$out"
"#;

/// Installed fake compiler and archiver
#[derive(Debug, Clone)]
pub struct FakeToolchain {
    dir: Utf8PathBuf,
}

impl FakeToolchain {
    /// Write the scripts into `dir`
    pub fn install(dir: &Utf8Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        write_script(&dir.join("cc"), &CC_SCRIPT.replace("@DIR@", dir.as_str()))?;
        write_script(&dir.join("ar"), &AR_SCRIPT.replace("@DIR@", dir.as_str()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn compiler(&self) -> Utf8PathBuf {
        self.dir.join("cc")
    }

    pub fn archiver(&self) -> Utf8PathBuf {
        self.dir.join("ar")
    }

    /// Point a backend of `config` at the fake tools
    pub fn configure(&self, config: &mut Config, backend: Backend) {
        let toolchain = match backend {
            Backend::Native => &mut config.native,
            Backend::Web => &mut config.web,
        };
        toolchain.compiler = self.compiler().to_string();
        toolchain.archiver = self.archiver().to_string();
    }

    /// Make every compiler invocation hang for seconds
    pub fn set_slow(&self, slow: bool) -> io::Result<()> {
        let marker = self.dir.join("slow");
        if slow {
            fs::write(marker, "")
        } else if marker.exists() {
            fs::remove_file(marker)
        } else {
            Ok(())
        }
    }

    /// Logged invocations, oldest first
    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(self.dir.join("invocations.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Number of archive steps, i.e. completed library builds
    pub fn library_builds(&self) -> usize {
        self.count("archive ")
    }

    /// Number of object compiles
    pub fn object_compiles(&self) -> usize {
        self.count("compile ")
    }

    /// Number of project links
    pub fn links(&self) -> usize {
        self.count("link ")
    }

    /// Forget logged invocations
    pub fn reset(&self) -> io::Result<()> {
        let log = self.dir.join("invocations.log");
        if log.exists() {
            fs::remove_file(log)?;
        }
        Ok(())
    }

    fn count(&self, prefix: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }
}

fn write_script(path: &Utf8Path, body: &str) -> io::Result<()> {
    fs::write(path, body)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

/// A temporary home with Fern sources, a project and the fake toolchain
///
/// ```text
/// <root>/home/.fern/cache     artifact cache
/// <root>/fern/                Fern sources (include/, src/)
/// <root>/app/                 project (fern.toml, lib/main.cpp)
/// <root>/tools/               fake toolchain
/// ```
pub struct Sandbox {
    _temp: TempDir,
    pub root: Utf8PathBuf,
    pub toolchain: FakeToolchain,
    pub config: Config,
}

impl Sandbox {
    pub fn new() -> io::Result<Self> {
        let temp = TempDir::new()?;
        let root = Utf8Path::from_path(temp.path())
            .ok_or_else(|| io::Error::other("temp dir is not UTF-8"))?
            .canonicalize_utf8()?;

        let fern = root.join("fern");
        write(&fern.join("include/fern/fern.hpp"), "#pragma once\n")?;
        write(&fern.join("src/core/canvas.cpp"), "void canvas() {}\n")?;
        write(&fern.join("src/graphics/colors.cpp"), "void colors() {}\n")?;
        write(&fern.join("src/ui/layout/row.cpp"), "void row() {}\n")?;
        write(&fern.join("src/platform/web_renderer.cpp"), "void render() {}\n")?;
        write(&fern.join("src/platform/platform_factory.cpp"), "void factory() {}\n")?;
        write(&fern.join("src/platform/linux_renderer.cpp"), "void x11() {}\n")?;
        write(&fern.join("src/fern.cpp"), "void fern() {}\n")?;

        let app = root.join("app");
        write(&app.join("fern.toml"), "name = \"app\"\n")?;
        write(&app.join("lib/main.cpp"), "int main() { return 0; }\n")?;

        let toolchain = FakeToolchain::install(&root.join("tools"))?;

        let home = root.join("home");
        let mut config = Config::default();
        config.paths.fern_source = Some(fern);
        config.paths.cache_dir = Some(home.join(".fern/cache"));
        config.paths.library_prefix = Some(home.join(".local"));
        config.build.jobs = Some(2);
        toolchain.configure(&mut config, Backend::Native);
        toolchain.configure(&mut config, Backend::Web);
        config.resolve_paths(&home);

        Ok(Self {
            _temp: temp,
            root,
            toolchain,
            config,
        })
    }

    pub fn project_dir(&self) -> Utf8PathBuf {
        self.root.join("app")
    }

    pub fn home_dir(&self) -> Utf8PathBuf {
        self.root.join("home")
    }

    /// Path of a file below the Fern sources
    pub fn support_file(&self, relative: &str) -> Utf8PathBuf {
        self.root.join("fern").join(relative)
    }

    /// Replace the project's entry file
    pub fn write_main(&self, content: &str) -> io::Result<()> {
        fs::write(self.project_dir().join("lib/main.cpp"), content)
    }

    /// Install a fake `libfern.a` so native builds can link
    pub fn install_native_library(&self) -> io::Result<()> {
        write(&self.home_dir().join(".local/lib/libfern.a"), "archive")
    }
}

/// Write a file, creating parent directories
pub fn write(path: &Utf8Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}
