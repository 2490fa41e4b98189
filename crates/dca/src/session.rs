//! Trace session → folder resolution with a shared cache.

use crate::retry::{perform_with_retries_async, RetryConfig, RetryDecision};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The session handle is not ready yet; asking again later may succeed.
    #[error("trace session {0:?} not found")]
    NotFound(String),
    #[error("cannot resolve trace session {session:?}: {reason}")]
    Failed { session: String, reason: String },
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::NotFound(_))
    }
}

/// Finds the on-disk folder a named trace session writes to.
pub trait SessionResolver: Send + Sync {
    fn resolve(&self, session: &str) -> impl Future<Output = Result<PathBuf, ResolveError>> + Send;
}

/// Resolves a session to `<base>/<session>` once that directory exists.
#[derive(Debug, Clone)]
pub struct DirectorySessionResolver {
    base: PathBuf,
}

impl DirectorySessionResolver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl SessionResolver for DirectorySessionResolver {
    async fn resolve(&self, session: &str) -> Result<PathBuf, ResolveError> {
        let folder = self.base.join(session);
        match tokio::fs::metadata(&folder).await {
            Ok(meta) if meta.is_dir() => Ok(folder),
            Ok(_) => Err(ResolveError::Failed {
                session: session.to_string(),
                reason: format!("{} is not a directory", folder.display()),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ResolveError::NotFound(session.to_string())),
            Err(e) => Err(ResolveError::Failed {
                session: session.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Caches session folders.
///
/// One lock covers the whole check-resolve-insert sequence, so concurrent
/// lookups of the same session resolve it once. Failures are not cached.
pub struct SessionFolderCache<R> {
    resolver: R,
    retry: RetryConfig,
    folders: Mutex<HashMap<String, PathBuf>>,
}

impl<R: SessionResolver> SessionFolderCache<R> {
    pub fn new(resolver: R, retry: RetryConfig) -> Self {
        Self {
            resolver,
            retry,
            folders: Mutex::new(HashMap::new()),
        }
    }

    /// Folder for `session`, or `None` if it cannot be resolved.
    ///
    /// `None` means the caller skips this source for the current pass.
    pub async fn folder_for(&self, session: &str) -> Option<PathBuf> {
        let mut folders = self.folders.lock().await;
        if let Some(folder) = folders.get(session) {
            return Some(folder.clone());
        }

        let policy = |e: &ResolveError| {
            if e.is_transient() {
                RetryDecision::Retry
            } else {
                RetryDecision::Abort
            }
        };
        match perform_with_retries_async(session, |s| self.resolver.resolve(s), &policy, &self.retry).await {
            Ok(folder) => {
                debug!(session, folder = %folder.display(), "resolved trace session folder");
                folders.insert(session.to_string(), folder.clone());
                Some(folder)
            }
            Err(e) => {
                error!(session, error = %e, "no folder for trace session; skipping it this pass");
                None
            }
        }
    }

    /// Drops a cached folder, e.g. after the session was recreated elsewhere.
    pub async fn invalidate(&self, session: &str) -> Option<PathBuf> {
        self.folders.lock().await.remove(session)
    }

    pub async fn cached(&self, session: &str) -> Option<PathBuf> {
        self.folders.lock().await.get(session).cloned()
    }
}

impl<R> std::fmt::Debug for SessionFolderCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFolderCache")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
