//! Artifact cache for precompiled support libraries
//!
//! One directory per backend under the cache root:
//!
//! ```text
//! <cache_dir>/web/entry.json
//! <cache_dir>/web/libfern_web-<digest>.a
//! ```
//!
//! `entry.json` names the current artifact. A store first moves the new artifact
//! into place under a content-addressed name, then replaces `entry.json` with a
//! rename, so readers see either the previous entry or the new one and never a
//! partially written file. No cross-process locking is needed; the last writer wins.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::config::Backend;
use crate::fingerprint::Fingerprint;
use crate::{Error, Result};

/// Metadata record naming the current artifact of a backend
pub const ENTRY_FILE: &str = "entry.json";

/// Cache entry for a backend's support library
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Backend the artifact was built for
    pub backend: Backend,
    /// Fingerprint of the sources the artifact was built from
    pub fingerprint: Fingerprint,
    /// Artifact file name inside the backend directory
    pub file_name: String,
    /// Artifact size in bytes
    pub size: u64,
    /// Blake3 digest of the artifact
    pub digest: String,
    /// Timestamp of when the entry was created
    pub created: DateTime<Utc>,
    /// Absolute artifact path, filled in on load
    #[serde(skip)]
    pub artifact: Utf8PathBuf,
}

impl CacheEntry {
    /// Age of the entry
    pub fn age(&self) -> TimeDelta {
        Utc::now() - self.created
    }
}

/// Inspection result for one backend
#[derive(Debug, Clone)]
pub struct CacheStatus {
    /// Backend inspected
    pub backend: Backend,
    /// Backend directory
    pub location: Utf8PathBuf,
    /// Current valid entry, if any
    pub entry: Option<CacheEntry>,
}

impl CacheStatus {
    pub fn present(&self) -> bool {
        self.entry.is_some()
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.entry.as_ref().map(|e| &e.fingerprint)
    }

    pub fn size(&self) -> Option<u64> {
        self.entry.as_ref().map(|e| e.size)
    }

    pub fn age(&self) -> Option<TimeDelta> {
        self.entry.as_ref().map(CacheEntry::age)
    }
}

/// Owner of the on-disk cache directory
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: Utf8PathBuf,
}

impl ArtifactCache {
    /// Create a cache rooted at a directory (created lazily on first store)
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Directory holding a backend's entry
    pub fn backend_dir(&self, backend: Backend) -> Utf8PathBuf {
        self.root.join(backend.as_str())
    }

    fn entry_file(&self, backend: Backend) -> Utf8PathBuf {
        self.backend_dir(backend).join(ENTRY_FILE)
    }

    /// Return the entry for a backend if it was built from sources with this fingerprint
    pub fn lookup(&self, backend: Backend, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let entry = self.current(backend)?;

        if entry.fingerprint.matches(fingerprint) {
            tracing::debug!(
                backend = %backend,
                fingerprint = %fingerprint.short(),
                "Cache hit"
            );
            Some(entry)
        } else {
            tracing::debug!(
                backend = %backend,
                old = %entry.fingerprint.short(),
                new = %fingerprint.short(),
                "Cache miss - support sources changed"
            );
            None
        }
    }

    /// Current entry of a backend regardless of fingerprint. A corrupted or
    /// unreadable entry is reported as a warning and treated as absent.
    pub fn current(&self, backend: Backend) -> Option<CacheEntry> {
        match self.load(backend) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(backend = %backend, "Ignoring corrupted cache entry: {}", e);
                None
            }
        }
    }

    fn load(&self, backend: Backend) -> Result<Option<CacheEntry>> {
        let entry_file = self.entry_file(backend);
        if !entry_file.exists() {
            tracing::debug!(backend = %backend, "No cache entry");
            return Ok(None);
        }

        let content = std::fs::read_to_string(&entry_file)?;
        let mut entry: CacheEntry = serde_json::from_str(&content).map_err(|e| {
            Error::cache(
                format!("Failed to parse {}: {}", entry_file, e),
                "The cache entry may be corrupted. Run `terra cache clear`.",
            )
        })?;

        if !entry.fingerprint.is_well_formed() {
            return Err(Error::cache(
                format!("{} holds a malformed fingerprint", entry_file),
                "Run `terra cache clear`",
            ));
        }

        if entry.backend != backend {
            return Err(Error::cache(
                format!("{} describes a {} artifact", entry_file, entry.backend),
                "Run `terra cache clear`",
            ));
        }

        entry.artifact = self.backend_dir(backend).join(&entry.file_name);
        let (size, digest) = digest_file(&entry.artifact)?;
        if size != entry.size || digest != entry.digest {
            return Err(Error::cache(
                format!("{} does not match its recorded digest", entry.artifact),
                "The artifact was modified or truncated; it will be rebuilt",
            ));
        }

        Ok(Some(entry))
    }

    /// Store a freshly built artifact as the backend's current entry, replacing
    /// any prior one.
    pub fn store(
        &self,
        backend: Backend,
        fingerprint: &Fingerprint,
        built_artifact: &Utf8Path,
    ) -> Result<CacheEntry> {
        let dir = self.backend_dir(backend);
        std::fs::create_dir_all(&dir)?;

        let (size, digest) = digest_file(built_artifact)?;
        let file_name = versioned_name(built_artifact, backend, &digest);
        let artifact = dir.join(&file_name);

        // Artifact first, under its content-addressed name
        let mut staged = tempfile::NamedTempFile::new_in(&dir)?;
        std::io::copy(&mut std::fs::File::open(built_artifact)?, staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged.persist(&artifact).map_err(|e| e.error)?;

        let entry = CacheEntry {
            backend,
            fingerprint: fingerprint.clone(),
            file_name: file_name.clone(),
            size,
            digest,
            created: Utc::now(),
            artifact,
        };

        // Then the record that points at it
        let mut record = tempfile::NamedTempFile::new_in(&dir)?;
        record.write_all(serde_json::to_string_pretty(&entry)?.as_bytes())?;
        record.as_file().sync_all()?;
        record.persist(self.entry_file(backend)).map_err(|e| e.error)?;

        self.prune(backend, &file_name)?;

        tracing::info!(
            backend = %backend,
            fingerprint = %fingerprint.short(),
            "Cached support library ({} bytes)",
            size
        );
        Ok(entry)
    }

    /// Remove artifacts no longer referenced by the current entry.
    /// In-flight temporary files of concurrent writers are left alone.
    fn prune(&self, backend: Backend, keep: &str) -> Result<()> {
        for entry in std::fs::read_dir(self.backend_dir(backend))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == keep || name == ENTRY_FILE || name.starts_with(".tmp") {
                continue;
            }
            if entry.file_type()?.is_file() {
                tracing::debug!(backend = %backend, "Pruning stale artifact {}", name);
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Remove the entry of one backend, or of all backends. Returns the backends
    /// that had something to remove.
    pub fn clear(&self, backend: Option<Backend>) -> Result<Vec<Backend>> {
        let targets = match backend {
            Some(b) => vec![b],
            None => Backend::ALL.to_vec(),
        };

        let mut cleared = Vec::new();
        for backend in targets {
            let dir = self.backend_dir(backend);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
                tracing::info!(backend = %backend, "Cleared cache at {}", dir);
                cleared.push(backend);
            }
        }
        Ok(cleared)
    }

    /// Inspect a backend's entry
    pub fn status(&self, backend: Backend) -> CacheStatus {
        CacheStatus {
            backend,
            location: self.backend_dir(backend),
            entry: self.current(backend),
        }
    }
}

/// `libfern_web.a` + digest -> `libfern_web-0123456789abcdef.a`
fn versioned_name(built: &Utf8Path, backend: Backend, digest: &str) -> String {
    let stem = built
        .file_stem()
        .map(str::to_string)
        .unwrap_or_else(|| format!("libfern_{}", backend));
    match built.extension() {
        Some(ext) => format!("{}-{}.{}", stem, &digest[..16], ext),
        None => format!("{}-{}", stem, &digest[..16]),
    }
}

/// Size and Blake3 digest of a file
fn digest_file(path: &Utf8Path) -> Result<(u64, String)> {
    let file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(file)?;
    Ok((size, hasher.finalize().to_hex().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fp(s: &str) -> Fingerprint {
        serde_json::from_str(&format!("\"blake3:{}\"", s)).unwrap()
    }

    fn setup() -> (TempDir, ArtifactCache, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let base = Utf8Path::from_path(temp_dir.path()).unwrap().to_path_buf();
        let cache = ArtifactCache::new(base.join("cache"));
        let built = base.join("libfern_web.a");
        fs::write(&built, b"!<arch>\nobjects v1").unwrap();
        (temp_dir, cache, built)
    }

    #[test]
    fn test_store_then_lookup() {
        let (_temp, cache, built) = setup();

        assert!(cache.lookup(Backend::Web, &fp("aaa")).is_none());

        let stored = cache.store(Backend::Web, &fp("aaa"), &built).unwrap();
        assert!(stored.artifact.starts_with(cache.backend_dir(Backend::Web)));
        assert!(stored.file_name.starts_with("libfern_web-"));

        let hit = cache.lookup(Backend::Web, &fp("aaa")).unwrap();
        assert_eq!(hit.artifact, stored.artifact);
        assert_eq!(fs::read(&hit.artifact).unwrap(), b"!<arch>\nobjects v1");

        // Other backend untouched
        assert!(cache.lookup(Backend::Native, &fp("aaa")).is_none());
    }

    #[test]
    fn test_fingerprint_mismatch_is_miss() {
        let (_temp, cache, built) = setup();
        cache.store(Backend::Web, &fp("aaa"), &built).unwrap();

        assert!(cache.lookup(Backend::Web, &fp("bbb")).is_none());
        assert!(cache.lookup(Backend::Web, &Fingerprint::sentinel()).is_none());
    }

    #[test]
    fn test_store_replaces_prior_entry() {
        let (_temp, cache, built) = setup();
        let first = cache.store(Backend::Web, &fp("aaa"), &built).unwrap();

        fs::write(&built, b"!<arch>\nobjects v2").unwrap();
        let second = cache.store(Backend::Web, &fp("bbb"), &built).unwrap();

        assert_ne!(first.file_name, second.file_name);
        assert!(!first.artifact.exists(), "stale artifact should be pruned");
        assert!(cache.lookup(Backend::Web, &fp("aaa")).is_none());
        assert!(cache.lookup(Backend::Web, &fp("bbb")).is_some());

        // Exactly one artifact plus its record
        let names: Vec<_> = fs::read_dir(cache.backend_dir(Backend::Web))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&ENTRY_FILE.to_string()));
    }

    #[test]
    fn test_interrupted_store_keeps_prior_entry() {
        let (_temp, cache, built) = setup();
        cache.store(Backend::Web, &fp("aaa"), &built).unwrap();
        let dir = cache.backend_dir(Backend::Web);

        // A writer that died mid-copy leaves only a temporary file behind
        let mut partial = tempfile::NamedTempFile::new_in(&dir).unwrap();
        partial.write_all(b"!<ar").unwrap();
        let (_file, _path) = partial.keep().unwrap();

        let hit = cache.lookup(Backend::Web, &fp("aaa")).unwrap();
        assert_eq!(fs::read(&hit.artifact).unwrap(), b"!<arch>\nobjects v1");
    }

    #[test]
    fn test_corrupted_record_is_miss() {
        let (_temp, cache, built) = setup();
        cache.store(Backend::Web, &fp("aaa"), &built).unwrap();

        fs::write(cache.backend_dir(Backend::Web).join(ENTRY_FILE), "{ not json").unwrap();

        assert!(cache.lookup(Backend::Web, &fp("aaa")).is_none());
        assert!(!cache.status(Backend::Web).present());
    }

    #[test]
    fn test_malformed_fingerprint_is_miss() {
        let (_temp, cache, built) = setup();
        cache.store(Backend::Web, &fp("aaa"), &built).unwrap();

        let entry_file = cache.backend_dir(Backend::Web).join(ENTRY_FILE);
        let record = fs::read_to_string(&entry_file).unwrap();
        fs::write(&entry_file, record.replace("blake3:aaa", "blake3:a\u{e9}\u{e9}\u{e9}")).unwrap();

        assert!(cache.current(Backend::Web).is_none());
        assert!(cache.lookup(Backend::Web, &fp("aaa")).is_none());
        assert!(!cache.status(Backend::Web).present());
    }

    #[test]
    fn test_truncated_artifact_is_miss() {
        let (_temp, cache, built) = setup();
        let entry = cache.store(Backend::Web, &fp("aaa"), &built).unwrap();

        fs::write(&entry.artifact, b"!<ar").unwrap();
        assert!(cache.lookup(Backend::Web, &fp("aaa")).is_none());

        fs::remove_file(&entry.artifact).unwrap();
        assert!(cache.lookup(Backend::Web, &fp("aaa")).is_none());
    }

    #[test]
    fn test_clear() {
        let (_temp, cache, built) = setup();
        cache.store(Backend::Web, &fp("aaa"), &built).unwrap();
        cache.store(Backend::Native, &fp("aaa"), &built).unwrap();

        assert_eq!(cache.clear(Some(Backend::Web)).unwrap(), vec![Backend::Web]);
        assert!(cache.lookup(Backend::Web, &fp("aaa")).is_none());
        assert!(cache.lookup(Backend::Native, &fp("aaa")).is_some());

        assert_eq!(cache.clear(None).unwrap(), vec![Backend::Native]);
        assert!(cache.clear(None).unwrap().is_empty());
    }

    #[test]
    fn test_status() {
        let (_temp, cache, built) = setup();

        let empty = cache.status(Backend::Web);
        assert!(!empty.present());
        assert!(empty.size().is_none());

        cache.store(Backend::Web, &fp("aaa"), &built).unwrap();
        let status = cache.status(Backend::Web);
        assert!(status.present());
        assert_eq!(status.fingerprint(), Some(&fp("aaa")));
        assert_eq!(status.size(), Some(18));
        assert!(status.age().unwrap() >= TimeDelta::zero());
    }
}
