//! Source fingerprinting using Blake3
//!
//! A [`SourceTree`] is the ordered set of files that make up a support library
//! (its compile units plus every header under its include directory). A
//! [`Fingerprint`] summarizes the tree's on-disk state and is the artifact cache key.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

use crate::config::SupportLibrary;
use crate::{Error, Result};

/// File extensions compiled as C++ translation units
pub const SOURCE_EXTENSIONS: &[&str] = &["cpp", "cxx", "cc"];

/// Directory names never descended into
const IGNORE_DIRS: &[&str] = &[".git", "build", "__pycache__"];

/// How a source tree is summarized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintScheme {
    /// Digest of every file's path and contents
    #[default]
    Content,
    /// Digest of every file's path, size and modification time; no content reads
    Mtime,
}

/// Summary of a source tree's state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

const SENTINEL: &str = "none";

impl Fingerprint {
    /// Fingerprint of a missing or empty tree
    pub fn sentinel() -> Self {
        Self(SENTINEL.to_string())
    }

    /// Whether this is the missing-tree sentinel
    pub fn is_sentinel(&self) -> bool {
        self.0 == SENTINEL
    }

    /// Cache key comparison. The sentinel matches nothing, itself included.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        !self.is_sentinel() && !other.is_sentinel() && self.0 == other.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for display
    pub fn short(&self) -> &str {
        let digest = self.0.split_once(':').map_or(self.0.as_str(), |(_, d)| d);
        match digest.char_indices().nth(12) {
            Some((end, _)) => &digest[..end],
            None => digest,
        }
    }

    /// `<tag>:<hex>` as produced by [`fingerprint`], or the sentinel
    pub fn is_well_formed(&self) -> bool {
        if self.is_sentinel() {
            return true;
        }
        match self.0.split_once(':') {
            Some((tag, digest)) => {
                !tag.is_empty()
                    && tag.bytes().all(|b| b.is_ascii_alphanumeric())
                    && !digest.is_empty()
                    && digest.bytes().all(|b| b.is_ascii_hexdigit())
            }
            None => false,
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered collection of files under a root
#[derive(Debug, Clone)]
pub struct SourceTree {
    root: Utf8PathBuf,
    /// Paths relative to `root`, sorted and deduplicated
    files: Vec<Utf8PathBuf>,
}

impl SourceTree {
    /// Collect the files of a support library: its entries plus the include directory
    pub fn scan(library: &SupportLibrary) -> Result<Self> {
        let mut files = Vec::new();

        if library.root.is_dir() {
            for entry in &library.entries {
                if let Some(dir) = entry.strip_suffix("/**") {
                    collect(&library.root, &library.root.join(dir), None, &mut files)?;
                } else {
                    let path = library.root.join(entry);
                    if path.is_dir() {
                        collect(&library.root, &path, Some(1), &mut files)?;
                    } else if path.is_file() {
                        files.push(Utf8PathBuf::from(entry));
                    } else {
                        tracing::debug!("Support library entry {} not found, skipping", path);
                    }
                }
            }
            collect(&library.root, &library.include_dir, None, &mut files)?;
        } else {
            tracing::debug!("Support library root {} does not exist", library.root);
        }

        Ok(Self::from_files(library.root.clone(), files))
    }

    /// Every file below a directory
    pub fn from_dir(root: &Utf8Path) -> Result<Self> {
        let mut files = Vec::new();
        collect(root, root, None, &mut files)?;
        Ok(Self::from_files(root.to_path_buf(), files))
    }

    fn from_files(root: Utf8PathBuf, mut files: Vec<Utf8PathBuf>) -> Self {
        files.sort();
        files.dedup();
        Self { root, files }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Paths relative to the root
    pub fn files(&self) -> &[Utf8PathBuf] {
        &self.files
    }

    /// Absolute paths of the C++ translation units in the tree
    pub fn compile_units(&self) -> Vec<Utf8PathBuf> {
        self.files
            .iter()
            .filter(|f| is_source_file(f))
            .map(|f| self.root.join(f))
            .collect()
    }
}

/// Whether a path has a C++ source extension
pub fn is_source_file(path: &Utf8Path) -> bool {
    path.extension()
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext))
}

fn collect(
    root: &Utf8Path,
    dir: &Utf8Path,
    max_depth: Option<usize>,
    files: &mut Vec<Utf8PathBuf>,
) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    let mut walker = WalkDir::new(dir).follow_links(true);
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }

    let ignored = |e: &walkdir::DirEntry| {
        e.depth() > 0
            && e.file_type().is_dir()
            && e.file_name()
                .to_str()
                .is_some_and(|name| IGNORE_DIRS.contains(&name))
    };

    for entry in walker.into_iter().filter_entry(|e| !ignored(e)) {
        let entry = entry.map_err(|e| {
            Error::cache(
                format!("Failed to read directory entry: {}", e),
                "Check directory permissions",
            )
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let path = Utf8Path::from_path(entry.path()).ok_or_else(|| {
            Error::config(
                format!("Path is not valid UTF-8: {:?}", entry.path()),
                "Ensure all support library paths are valid UTF-8",
            )
        })?;
        let relative = path.strip_prefix(root).unwrap_or(path);
        files.push(relative.to_path_buf());
    }

    Ok(())
}

/// Compute the fingerprint of a source tree
pub fn fingerprint(tree: &SourceTree, scheme: FingerprintScheme) -> Result<Fingerprint> {
    if tree.is_empty() {
        return Ok(Fingerprint::sentinel());
    }

    let mut hasher = blake3::Hasher::new();
    for relative in tree.files() {
        let path = tree.root().join(relative);
        hasher.update(relative.as_str().as_bytes());
        hasher.update(&[0]);

        match scheme {
            FingerprintScheme::Content => hash_file(&mut hasher, &path)?,
            FingerprintScheme::Mtime => {
                let metadata = std::fs::metadata(&path)?;
                let modified = metadata
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                hasher.update(&metadata.len().to_le_bytes());
                hasher.update(&modified.to_le_bytes());
            }
        }
    }

    let tag = match scheme {
        FingerprintScheme::Content => "blake3",
        FingerprintScheme::Mtime => "mtime",
    };
    Ok(Fingerprint(format!("{}:{}", tag, hasher.finalize().to_hex())))
}

/// Hash a single file's contents, length-prefixed so boundaries between files count
fn hash_file(hasher: &mut blake3::Hasher, path: &Utf8Path) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    hasher.update(&file.metadata()?.len().to_le_bytes());

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(())
}
