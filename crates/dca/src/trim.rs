//! Folder trimming for the local cache.
//!
//! The local cache mirrors a logical folder tree whose source of truth lives
//! upstream. A cached file may go once the upstream copy is confirmed gone:
//! the walk rebuilds each file's upstream path from the directory contexts
//! and asks the [`UpstreamIndex`]. Anything short of a definite "does not
//! exist" keeps the file. Files older than the configured maximum age go
//! without asking upstream.
//!
//! Directories emptied by the pass are removed bottom-up, never the root.
//! Container log folders only go once they carry the remove marker.

use crate::paths::{self, ContainerMarker};
use crate::perf::{PassKind, PassPerformance, PassRecord};
use crate::retry::{perform_io_with_retries_async, perform_with_retries_async, RetryConfig, RetryDecision};
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream store did not answer; the same check may succeed later.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("upstream I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("upstream check failed: {0}")]
    Failed(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Unavailable(_) => true,
            UpstreamError::Io(e) => crate::retry::io_retry_decision(e) == RetryDecision::Retry,
            UpstreamError::Failed(_) => false,
        }
    }
}

/// Answers whether a relative path still exists upstream.
pub trait UpstreamIndex: Send + Sync {
    fn exists(&self, relative_path: &Path) -> impl Future<Output = Result<bool, UpstreamError>> + Send;
}

/// Upstream that is itself a local directory.
#[derive(Debug, Clone)]
pub struct LocalUpstream {
    root: PathBuf,
}

impl LocalUpstream {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl UpstreamIndex for LocalUpstream {
    async fn exists(&self, relative_path: &Path) -> Result<bool, UpstreamError> {
        Ok(tokio::fs::try_exists(self.root.join(relative_path)).await?)
    }
}

/// Relative location of a walked directory; empty at the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionContext {
    relative_path: PathBuf,
}

impl DeletionContext {
    pub fn root() -> Self {
        Self::default()
    }

    /// Context of the subdirectory `name`.
    pub fn child(&self, name: &str) -> Self {
        Self {
            relative_path: self.relative_path.join(name),
        }
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    /// Upstream path of a file in this directory.
    pub fn upstream_path(&self, file_name: &str) -> PathBuf {
        self.relative_path.join(file_name)
    }

    pub fn is_root(&self) -> bool {
        self.relative_path.as_os_str().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    /// Budget for upstream checks and local deletions.
    pub retry: RetryConfig,
    /// Remove directories the pass leaves empty.
    pub remove_empty_folders: bool,
    /// Files last written longer ago than this are deleted whatever upstream says.
    #[serde(with = "crate::config::opt_millis")]
    pub max_age: Option<Duration>,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            remove_empty_folders: true,
            max_age: None,
        }
    }
}

impl TrimConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_remove_empty_folders(mut self, remove: bool) -> Self {
        self.remove_empty_folders = remove;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrimReport {
    pub files_deleted: u64,
    /// Of `files_deleted`, those removed for their age alone.
    pub files_expired: u64,
    /// Files left in place, including those whose check failed.
    pub files_kept: u64,
    pub check_failures: u64,
    pub delete_failures: u64,
    pub folders_removed: u64,
    pub record: PassRecord,
}

#[derive(Debug, Default)]
struct Tally {
    files_deleted: u64,
    files_expired: u64,
    files_kept: u64,
    check_failures: u64,
    delete_failures: u64,
    folders_removed: u64,
}

/// Trims a local cache folder against an upstream index.
#[derive(Debug)]
pub struct FolderTrimmer<U> {
    upstream: U,
    config: TrimConfig,
}

impl<U: UpstreamIndex> FolderTrimmer<U> {
    pub fn new(upstream: U, config: TrimConfig) -> Self {
        Self { upstream, config }
    }

    /// Runs one trimming pass over `local_root`.
    ///
    /// Fails only if the root itself cannot be read; problems further down
    /// are logged, counted and leave the affected files in place.
    pub async fn trim(&self, local_root: &Path) -> io::Result<TrimReport> {
        let perf = PassPerformance::begin(PassKind::FolderTrimPass, local_root.display().to_string());
        let mut tally = Tally::default();
        let cutoff = self.config.max_age.and_then(|age| SystemTime::now().checked_sub(age));

        // Pre-order list of directories; walked in reverse for removal.
        let mut visited: Vec<(PathBuf, DeletionContext)> = Vec::new();
        let mut pending = vec![(local_root.to_path_buf(), DeletionContext::root())];

        while let Some((dir, context)) = pending.pop() {
            let entries = match list_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if context.is_root() => return Err(e),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "cannot list cache folder; leaving it as is");
                    continue;
                }
            };

            let in_container = paths::is_container_log_path(context.relative_path());
            for entry in entries {
                if entry.is_dir {
                    pending.push((dir.join(&entry.name), context.child(&entry.name)));
                } else if in_container && paths::container_marker(&entry.name).is_some() {
                    continue;
                } else {
                    let local = dir.join(&entry.name);
                    let expired = match cutoff {
                        Some(cutoff) => last_written_before(&local, cutoff).await,
                        None => false,
                    };
                    if expired {
                        if self.delete_file(&local, "expired", &perf, &mut tally).await {
                            tally.files_expired += 1;
                        }
                    } else {
                        self.trim_file(&local, &context, &entry.name, &perf, &mut tally).await;
                    }
                }
            }
            visited.push((dir, context));
        }

        if self.config.remove_empty_folders {
            for (dir, context) in visited.iter().rev() {
                if !context.is_root() && self.remove_folder_if_done(dir, context).await {
                    tally.folders_removed += 1;
                    perf.folder_removed();
                }
            }
        }

        let record = perf.end();
        Ok(TrimReport {
            files_deleted: tally.files_deleted,
            files_expired: tally.files_expired,
            files_kept: tally.files_kept,
            check_failures: tally.check_failures,
            delete_failures: tally.delete_failures,
            folders_removed: tally.folders_removed,
            record,
        })
    }

    async fn trim_file(
        &self,
        local: &Path,
        context: &DeletionContext,
        file_name: &str,
        perf: &PassPerformance,
        tally: &mut Tally,
    ) {
        let upstream_path = context.upstream_path(file_name);
        let policy = |e: &UpstreamError| {
            if e.is_transient() {
                RetryDecision::Retry
            } else {
                RetryDecision::Abort
            }
        };
        let exists = perform_with_retries_async(
            upstream_path.as_path(),
            |p| self.upstream.exists(p),
            &policy,
            &self.config.retry,
        )
        .await;

        match exists {
            Ok(true) => tally.files_kept += 1,
            Err(e) => {
                tally.files_kept += 1;
                tally.check_failures += 1;
                warn!(file = %local.display(), error = %e, "upstream check failed; keeping file");
            }
            Ok(false) => {
                self.delete_file(local, "gone upstream", perf, tally).await;
            }
        }
    }

    /// Deletes one cached file; returns whether it is gone.
    async fn delete_file(&self, local: &Path, reason: &str, perf: &PassPerformance, tally: &mut Tally) -> bool {
        match perform_io_with_retries_async(local, |p| tokio::fs::remove_file(p), &self.config.retry).await {
            Ok(()) => debug!(file = %local.display(), reason, "deleted cached file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tally.files_kept += 1;
                tally.delete_failures += 1;
                error!(file = %local.display(), error = %e, "cannot delete cached file");
                return false;
            }
        }
        tally.files_deleted += 1;
        perf.file_deleted();
        true
    }

    /// Removes `dir` if nothing is left in it.
    ///
    /// Container log folders also need the remove marker (and no process
    /// marker); the marker goes with the folder.
    async fn remove_folder_if_done(&self, dir: &Path, context: &DeletionContext) -> bool {
        let entries = match list_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot list cache folder");
                return false;
            }
        };

        let in_container = paths::is_container_log_path(context.relative_path());
        let mut markers = Vec::new();
        for entry in &entries {
            match paths::container_marker(&entry.name) {
                Some(marker) if in_container && !entry.is_dir => markers.push((marker, dir.join(&entry.name))),
                _ => return false,
            }
        }

        if in_container && is_container_root(context) {
            let removable = markers.iter().any(|(m, _)| *m == ContainerMarker::Remove)
                && !markers.iter().any(|(m, _)| *m == ContainerMarker::Process);
            if !removable {
                return false;
            }
        } else if !markers.is_empty() {
            return false;
        }

        for (_, marker) in &markers {
            if let Err(e) = perform_io_with_retries_async(marker.as_path(), |p| tokio::fs::remove_file(p), &self.config.retry).await {
                error!(file = %marker.display(), error = %e, "cannot delete container marker");
                return false;
            }
        }

        match perform_io_with_retries_async(dir, |p| tokio::fs::remove_dir(p), &self.config.retry).await {
            Ok(()) => {
                debug!(dir = %dir.display(), "removed empty cache folder");
                true
            }
            Err(e) => {
                error!(dir = %dir.display(), error = %e, "cannot remove cache folder");
                false
            }
        }
    }
}

/// `Containers/<container>`: the folder one container's logs live in.
fn is_container_root(context: &DeletionContext) -> bool {
    let mut components = context.relative_path().iter().rev();
    components.next().is_some() && components.next().is_some_and(|parent| parent == paths::CONTAINERS_FOLDER)
}

/// `false` when the time cannot be read; such files are left to the upstream check.
async fn last_written_before(path: &Path, cutoff: SystemTime) -> bool {
    tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .is_ok_and(|modified| modified < cutoff)
}

struct DirEntry {
    name: String,
    is_dir: bool,
}

async fn list_dir(dir: &Path) -> io::Result<Vec<DirEntry>> {
    let mut read = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = read.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            warn!(dir = %dir.display(), "skipping entry with a non UTF-8 name");
            continue;
        };
        let is_dir = entry.file_type().await?.is_dir();
        entries.push(DirEntry { name, is_dir });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Mutex;
    use tracing_test::traced_test;

    /// Upstream with a scripted answer per relative path; unknown paths are absent.
    #[derive(Default)]
    struct ScriptedUpstream {
        answers: Mutex<HashMap<PathBuf, Answer>>,
    }

    #[derive(Clone, Copy)]
    enum Answer {
        Exists,
        Transient,
        Broken,
    }

    impl ScriptedUpstream {
        fn with(self, path: &str, answer: Answer) -> Self {
            self.answers.lock().unwrap().insert(PathBuf::from(path), answer);
            self
        }
    }

    impl UpstreamIndex for ScriptedUpstream {
        async fn exists(&self, relative_path: &Path) -> Result<bool, UpstreamError> {
            let answer = self.answers.lock().unwrap().get(relative_path).copied();
            match answer {
                None => Ok(false),
                Some(Answer::Exists) => Ok(true),
                Some(Answer::Transient) => Err(UpstreamError::Unavailable("throttled".into())),
                Some(Answer::Broken) => Err(UpstreamError::Failed("bad credentials".into())),
            }
        }
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn config() -> TrimConfig {
        TrimConfig::default().with_retry(RetryConfig::immediate(2))
    }

    #[test]
    fn test_context_built_top_down() {
        let root = DeletionContext::root();
        assert!(root.is_root());
        assert_eq!(root.upstream_path("a.dmp"), PathBuf::from("a.dmp"));

        let nested = root.child("App_App1").child("crash");
        assert_eq!(nested.relative_path(), Path::new("App_App1/crash"));
        assert_eq!(nested.upstream_path("a.dmp"), PathBuf::from("App_App1/crash/a.dmp"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_deletes_only_when_absent_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "gone.dtr");
        touch(root, "present.dtr");
        touch(root, "sub/flaky.dtr");
        touch(root, "sub/broken.dtr");
        touch(root, "sub/gone.dtr");

        let upstream = ScriptedUpstream::default()
            .with("present.dtr", Answer::Exists)
            .with("sub/flaky.dtr", Answer::Transient)
            .with("sub/broken.dtr", Answer::Broken);
        let report = FolderTrimmer::new(upstream, config()).trim(root).await.unwrap();

        assert!(!root.join("gone.dtr").exists());
        assert!(!root.join("sub/gone.dtr").exists());
        assert!(root.join("present.dtr").exists());
        assert!(root.join("sub/flaky.dtr").exists());
        assert!(root.join("sub/broken.dtr").exists());

        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.files_kept, 3);
        assert_eq!(report.check_failures, 2);
        assert_eq!(report.folders_removed, 0);
        assert_eq!(report.record.kind, PassKind::FolderTrimPass);
        assert_eq!((report.record.count1, report.record.count2), (2, Some(0)));
        assert!(logs_contain("upstream check failed; keeping file"));
    }

    #[tokio::test]
    async fn test_empty_folders_removed_bottom_up_but_not_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "a/b/c/old.dtr");
        touch(root, "a/keep.dtr");

        let upstream = ScriptedUpstream::default().with("a/keep.dtr", Answer::Exists);
        let report = FolderTrimmer::new(upstream, config()).trim(root).await.unwrap();

        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.folders_removed, 2);
        assert_eq!((report.record.count1, report.record.count2), (1, Some(2)));
        assert!(!root.join("a/b").exists());
        assert!(root.join("a/keep.dtr").exists());

        // Nothing left at all: the root itself stays.
        let report = FolderTrimmer::new(ScriptedUpstream::default(), config())
            .trim(root)
            .await
            .unwrap();
        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.folders_removed, 1);
        assert!(root.exists());
    }

    #[tokio::test]
    async fn test_container_folders_need_remove_marker() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "Containers/c1/log.dtr");
        touch(root, "Containers/c1/RemoveContainerLog.txt");
        touch(root, "Containers/c2/log.dtr");
        touch(root, "Containers/c2/ProcessContainerLog.txt");
        touch(root, "Containers/c3/log.dtr");

        let report = FolderTrimmer::new(ScriptedUpstream::default(), config())
            .trim(root)
            .await
            .unwrap();

        // Every log file is gone upstream, markers are never checked.
        assert_eq!(report.files_deleted, 3);
        assert!(!root.join("Containers/c1").exists());
        assert!(root.join("Containers/c2/ProcessContainerLog.txt").exists());
        assert!(root.join("Containers/c3").exists());
        assert!(root.join("Containers").exists());
        assert_eq!(report.folders_removed, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_expired_files_go_even_if_upstream_has_them() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "old/stale.dtr");
        touch(root, "old/fresh.dtr");
        let two_days_ago = SystemTime::now() - Duration::from_secs(2 * 24 * 3600);
        fs::File::options()
            .write(true)
            .open(root.join("old/stale.dtr"))
            .unwrap()
            .set_modified(two_days_ago)
            .unwrap();

        let upstream = ScriptedUpstream::default()
            .with("old/stale.dtr", Answer::Exists)
            .with("old/fresh.dtr", Answer::Exists);
        let config = config().with_max_age(Duration::from_secs(24 * 3600));
        let report = FolderTrimmer::new(upstream, config).trim(root).await.unwrap();

        assert!(!root.join("old/stale.dtr").exists());
        assert!(root.join("old/fresh.dtr").exists());
        assert_eq!(report.files_deleted, 1);
        assert_eq!(report.files_expired, 1);
        assert_eq!(report.files_kept, 1);
        assert_eq!((report.record.count1, report.record.count2), (1, Some(0)));
        assert!(logs_contain("expired"));
    }

    #[tokio::test]
    async fn test_without_max_age_old_files_wait_for_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "stale.dtr");
        fs::File::options()
            .write(true)
            .open(root.join("stale.dtr"))
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1))
            .unwrap();

        let upstream = ScriptedUpstream::default().with("stale.dtr", Answer::Exists);
        let report = FolderTrimmer::new(upstream, config()).trim(root).await.unwrap();

        assert!(root.join("stale.dtr").exists());
        assert_eq!(report.files_expired, 0);
    }

    #[tokio::test]
    async fn test_local_upstream() {
        let upstream_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        touch(upstream_dir.path(), "App_App0/trace_1.dtr");
        touch(cache_dir.path(), "App_App0/trace_1.dtr");
        touch(cache_dir.path(), "App_App0/trace_0.dtr");

        let trimmer = FolderTrimmer::new(LocalUpstream::new(upstream_dir.path()), config());
        let report = trimmer.trim(cache_dir.path()).await.unwrap();

        assert_eq!(report.files_deleted, 1);
        assert!(cache_dir.path().join("App_App0/trace_1.dtr").exists());
        assert!(!cache_dir.path().join("App_App0/trace_0.dtr").exists());
    }

    #[tokio::test]
    async fn test_missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let result = FolderTrimmer::new(ScriptedUpstream::default(), config()).trim(&missing).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
