//! Per-consumer resume positions.

use crate::event_index::{EventIndex, ParseEventIndexError};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Distinguishes staging files of saves running at the same time.
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum ResumeStateError {
    #[error("cannot access resume state: {0}")]
    Io(#[from] io::Error),
    #[error("resume state is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("resume state for {trace_file:?}: {source}")]
    Index {
        trace_file: String,
        source: ParseEventIndexError,
    },
}

/// `trace file → highest EventIndex handled`, owned by one consumer.
///
/// Entries are created on the first record for a file and removed with
/// [`retire`](Self::retire) once the file is gone for good. The JSON form maps
/// each file to its index as `"<timestamp>_<differentiator>"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeState {
    positions: BTreeMap<String, EventIndex>,
}

impl ResumeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Position for `trace_file`, or [`EventIndex::BEGINNING`].
    pub fn get(&self, trace_file: &str) -> EventIndex {
        self.positions
            .get(trace_file)
            .copied()
            .unwrap_or(EventIndex::BEGINNING)
    }

    /// Raises the position for `trace_file` to `index`. Lower indices are ignored.
    pub fn record(&mut self, trace_file: &str, index: EventIndex) {
        match self.positions.get_mut(trace_file) {
            Some(current) => *current = (*current).max(index),
            None => {
                self.positions.insert(trace_file.to_string(), index);
            }
        }
    }

    /// Forgets a trace file that will not be seen again.
    pub fn retire(&mut self, trace_file: &str) -> Option<EventIndex> {
        self.positions.remove(trace_file)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, EventIndex)> {
        self.positions.iter().map(|(file, index)| (file.as_str(), *index))
    }

    pub fn to_json(&self) -> Result<String, ResumeStateError> {
        let raw: BTreeMap<&str, String> = self
            .positions
            .iter()
            .map(|(file, index)| (file.as_str(), index.to_string()))
            .collect();
        Ok(serde_json::to_string_pretty(&raw)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ResumeStateError> {
        let raw: BTreeMap<String, String> = serde_json::from_str(json)?;
        let positions = raw
            .into_iter()
            .map(|(trace_file, index)| match index.parse() {
                Ok(index) => Ok((trace_file, index)),
                Err(source) => Err(ResumeStateError::Index { trace_file, source }),
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { positions })
    }

    /// Loads state saved by [`save`](Self::save). A missing file is an empty state.
    pub async fn load(path: &Path) -> Result<Self, ResumeStateError> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the state next to `path` and renames it into place.
    pub async fn save(&self, path: &Path) -> Result<(), ResumeStateError> {
        let json = self.to_json()?;
        let staging = staging_path(path);
        tokio::fs::write(&staging, json).await?;
        if let Err(e) = tokio::fs::rename(&staging, path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// `.<file name>.<pid>.<seq>.tmp` in the directory of `path`.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "resume".into(), |n| n.to_string_lossy());
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
}
