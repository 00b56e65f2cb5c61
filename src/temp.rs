//! Temporary file lifecycle
//!
//! Every scratch artifact the pipeline creates lives under one root directory
//! and is registered in an in-memory tracking table. Nothing here is fatal to
//! the caller: deletion failures are counted and logged, never returned.
//!
//! A crash between `generate_temp_path` and `track` leaves an untracked file
//! behind; it is reclaimed by the next orphan sweep, not by emergency cleanup.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{RawError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TempFileKind {
    /// TIFF/PPM/DNG produced by a decoder or the vendor converter
    RawDerivative,
    Jpeg,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TempFileId(u64);

impl fmt::Display for TempFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TempFileEntry {
    pub id: TempFileId,
    pub path: PathBuf,
    pub kind: TempFileKind,
    pub created_at: DateTime<Utc>,
    pub size_bytes: Option<u64>,
    /// Extra paths removed together with `path`; not validated against the root
    pub associated_paths: Vec<PathBuf>,
}

/// Aggregate counters since the manager was created
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStats {
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub errors: u64,
    pub tracked: usize,
}

/// Result of cleaning up one entry
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub files_deleted: u64,
    pub bytes_freed: u64,
    pub dirs_removed: u64,
    pub skipped_tracked: u64,
    pub errors: u64,
}

pub struct TempFileManager {
    root: PathBuf,
    entries: Mutex<HashMap<TempFileId, TempFileEntry>>,
    issued: Mutex<IssuedNames>,
    next_id: AtomicU64,
    files_deleted: AtomicU64,
    bytes_freed: AtomicU64,
    errors: AtomicU64,
}

/// Names handed out during the current millisecond
#[derive(Default)]
struct IssuedNames {
    millis: i64,
    suffixes: HashSet<String>,
}

impl TempFileManager {
    /// Create the manager, creating `root` if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;

        Ok(Self {
            root,
            entries: Mutex::new(HashMap::new()),
            issued: Mutex::new(IssuedNames::default()),
            next_id: AtomicU64::new(1),
            files_deleted: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{basename}_{stage}_{timestampMillis}_{random6}{ext}` under `root[/subdir]`.
    ///
    /// The subdirectory is created on demand; if that fails the path is
    /// placed directly under the root.
    pub fn generate_temp_path(
        &self,
        original: &Path,
        stage: &str,
        extension: Option<&str>,
        subdir: Option<&str>,
    ) -> PathBuf {
        let basename = original
            .file_stem()
            .map(|s| sanitize(&s.to_string_lossy()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "file".to_string());

        let (millis, suffix) = self.unique_suffix();
        let ext = match extension {
            Some(e) if !e.is_empty() && !e.starts_with('.') => format!(".{}", e),
            Some(e) => e.to_string(),
            None => String::new(),
        };
        let name = format!("{}_{}_{}_{}{}", basename, sanitize(stage), millis, suffix, ext);

        let dir = match subdir {
            Some(sub) => {
                let dir = self.root.join(sanitize(sub));
                match fs::create_dir_all(&dir) {
                    Ok(()) => dir,
                    Err(e) => {
                        warn!("Could not create temp subdir {}: {}, using root", dir.display(), e);
                        self.root.clone()
                    }
                }
            }
            None => self.root.clone(),
        };

        dir.join(name)
    }

    fn unique_suffix(&self) -> (i64, String) {
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        let millis = Utc::now().timestamp_millis();
        if issued.millis != millis {
            issued.millis = millis;
            issued.suffixes.clear();
        }

        let mut rng = rand::rng();
        loop {
            let suffix: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(6)
                .map(|b| char::from(b).to_ascii_lowercase())
                .collect();
            if issued.suffixes.insert(suffix.clone()) {
                return (millis, suffix);
            }
        }
    }

    /// Register a path (which must lie under the root) for later cleanup
    pub fn track(
        &self,
        path: impl Into<PathBuf>,
        kind: TempFileKind,
        associated_paths: Vec<PathBuf>,
    ) -> Result<TempFileId> {
        let path = path.into();
        if !self.is_under_root(&path) {
            return Err(RawError::PathValidation(format!(
                "{} is outside temp root {}",
                path.display(),
                self.root.display()
            )));
        }

        let id = TempFileId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let size_bytes = fs::metadata(&path).ok().map(|m| m.len());

        self.lock_entries().insert(
            id,
            TempFileEntry {
                id,
                path,
                kind,
                created_at: Utc::now(),
                size_bytes,
                associated_paths,
            },
        );
        debug!("Tracking {} ({:?})", id, kind);
        Ok(id)
    }

    pub fn entry(&self, id: TempFileId) -> Option<TempFileEntry> {
        self.lock_entries().get(&id).cloned()
    }

    pub fn tracked_count(&self) -> usize {
        self.lock_entries().len()
    }

    /// Delete an entry's primary and associated paths.
    ///
    /// The entry is removed even when some deletions fail. Unknown ids and
    /// already-missing files are no-ops.
    pub fn cleanup(&self, id: TempFileId) -> CleanupReport {
        let Some(entry) = self.lock_entries().remove(&id) else {
            return CleanupReport::default();
        };

        let mut report = CleanupReport::default();
        for path in std::iter::once(&entry.path).chain(entry.associated_paths.iter()) {
            match self.remove_path(path) {
                Ok(true) => report.deleted.push(path.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to delete {}: {}", path.display(), e);
                    report.failures.push((path.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Clean every tracked entry, continuing past individual failures
    pub fn cleanup_all(&self) -> CleanupReport {
        let ids: Vec<TempFileId> = self.lock_entries().keys().copied().collect();

        let mut total = CleanupReport::default();
        for id in ids {
            let report = self.cleanup(id);
            total.deleted.extend(report.deleted);
            total.failures.extend(report.failures);
        }
        if !total.deleted.is_empty() || !total.failures.is_empty() {
            info!(
                "Cleaned {} temp files ({} failures)",
                total.deleted.len(),
                total.failures.len()
            );
        }
        total
    }

    /// Delete untracked files older than `older_than`, then empty directories.
    /// `Duration::ZERO` wipes every untracked file.
    pub fn sweep_orphans(&self, older_than: Duration) -> SweepReport {
        let tracked: HashSet<PathBuf> = self
            .lock_entries()
            .values()
            .flat_map(|e| std::iter::once(e.path.clone()).chain(e.associated_paths.iter().cloned()))
            .collect();
        let now = SystemTime::now();
        let mut report = SweepReport::default();

        for entry in WalkDir::new(&self.root).min_depth(1).contents_first(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Sweep walk error: {}", e);
                    report.errors += 1;
                    continue;
                }
            };
            let path = entry.path();

            if entry.file_type().is_dir() {
                if tracked.contains(path) {
                    continue;
                }
                let empty = fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(false);
                if empty && fs::remove_dir(path).is_ok() {
                    report.dirs_removed += 1;
                }
                continue;
            }

            if tracked.contains(path) || path.ancestors().any(|a| tracked.contains(a)) {
                report.skipped_tracked += 1;
                continue;
            }

            let Ok(metadata) = entry.metadata() else {
                report.errors += 1;
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or(Duration::ZERO);
            if age < older_than {
                continue;
            }

            match fs::remove_file(path) {
                Ok(()) => {
                    report.files_deleted += 1;
                    report.bytes_freed += metadata.len();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    debug!("Could not sweep {}: {}", path.display(), e);
                    report.errors += 1;
                }
            }
        }

        self.files_deleted.fetch_add(report.files_deleted, Ordering::Relaxed);
        self.bytes_freed.fetch_add(report.bytes_freed, Ordering::Relaxed);
        self.errors.fetch_add(report.errors, Ordering::Relaxed);

        if report.files_deleted > 0 {
            info!(
                "Orphan sweep removed {} files ({} bytes)",
                report.files_deleted, report.bytes_freed
            );
        }
        report
    }

    /// Shutdown-path cleanup: only the in-memory table, synchronous,
    /// every error swallowed.
    pub fn emergency_cleanup(&self) {
        let entries: Vec<TempFileEntry> = match self.entries.lock() {
            Ok(mut guard) => guard.drain().map(|(_, e)| e).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, e)| e).collect(),
        };

        for entry in entries {
            for path in std::iter::once(&entry.path).chain(entry.associated_paths.iter()) {
                let _ = self.remove_path(path);
            }
        }
    }

    pub fn stats(&self) -> CleanupStats {
        CleanupStats {
            files_deleted: self.files_deleted.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            tracked: self.tracked_count(),
        }
    }

    /// Periodic orphan sweep on the tokio runtime
    pub fn spawn_maintenance(self: Arc<Self>, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let manager = Arc::clone(&self);
                let sweep = tokio::task::spawn_blocking(move || manager.sweep_orphans(max_age)).await;
                if let Err(e) = sweep {
                    warn!("Scheduled orphan sweep failed: {}", e);
                }
            }
        })
    }

    /// Track `path` and clean it up when the guard drops
    pub fn guard(
        self: &Arc<Self>,
        path: impl Into<PathBuf>,
        kind: TempFileKind,
        associated_paths: Vec<PathBuf>,
    ) -> Result<TempGuard> {
        let path = path.into();
        let id = self.track(path.clone(), kind, associated_paths)?;
        Ok(TempGuard {
            manager: Arc::clone(self),
            id,
            path,
            armed: true,
        })
    }

    /// Ok(true) deleted, Ok(false) already gone
    fn remove_path(&self, path: &Path) -> std::io::Result<bool> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let (result, files, bytes) = if metadata.is_dir() {
            let (files, bytes) = dir_contents(path);
            (fs::remove_dir_all(path), files, bytes)
        } else {
            (fs::remove_file(path), 1, metadata.len())
        };

        match result {
            Ok(()) => {
                self.files_deleted.fetch_add(files, Ordering::Relaxed);
                self.bytes_freed.fetch_add(bytes, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn is_under_root(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
            && path != self.root
            && !path.components().any(|c| matches!(c, Component::ParentDir))
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<TempFileId, TempFileEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Regular files and their total size below `dir`
fn dir_contents(dir: &Path) -> (u64, u64) {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .fold((0, 0), |(files, bytes), e| {
            (files + 1, bytes + e.metadata().map(|m| m.len()).unwrap_or(0))
        })
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Scoped cleanup for one tracked path
pub struct TempGuard {
    manager: Arc<TempFileManager>,
    id: TempFileId,
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    pub fn id(&self) -> TempFileId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the still-tracked file to the caller
    pub fn keep(mut self) -> TrackedFile {
        self.armed = false;
        TrackedFile {
            id: self.id,
            path: std::mem::take(&mut self.path),
        }
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed {
            self.manager.cleanup(self.id);
        }
    }
}

/// A temp file that stays tracked until its owner cleans it up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedFile {
    pub id: TempFileId,
    pub path: PathBuf,
}

/// Runs emergency cleanup when dropped (end of `main`, unwinding panic)
pub struct EmergencyCleanupGuard(Arc<TempFileManager>);

impl EmergencyCleanupGuard {
    pub fn new(manager: Arc<TempFileManager>) -> Self {
        Self(manager)
    }
}

impl Drop for EmergencyCleanupGuard {
    fn drop(&mut self) {
        self.0.emergency_cleanup();
    }
}
