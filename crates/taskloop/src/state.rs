//! Run state and work queue persistence.
//!
//! Everything lives in the state directory as JSON:
//! - `state.json`: the task, active file set, and latest [`IterationState`]
//! - `queue.json`: file paths waiting to be merged into the run
//!
//! Files are replaced atomically (temp file + rename) so an interrupted write
//! never leaves a truncated snapshot behind. The queue is drained by renaming
//! `queue.json` out of the way before reading it, so paths enqueued while a
//! drain is in progress land in a fresh queue file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use taskloop_core::prompt::build_loop_prompt;
use taskloop_core::IterationState;
use thiserror::Error;
use tracing::debug;

pub const STATE_FILE: &str = "state.json";
pub const QUEUE_FILE: &str = "queue.json";

static DRAIN_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no saved run in {0}")]
    NoSavedRun(PathBuf),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// State and queue collaborator used by the loop driver.
///
/// Methods take `&self`; implementations use interior mutability so the
/// store can be shared with the driver behind an `Arc`.
pub trait RunStore: Send + Sync {
    /// Queued paths, in order, without removing them.
    fn check_queue(&self) -> Result<Vec<PathBuf>>;
    /// Drain the queue, returning the queued paths in order.
    fn pop_queue(&self) -> Result<Vec<PathBuf>>;
    /// Add paths to the active file set, skipping ones already present.
    fn merge_files(&self, files: &[PathBuf]) -> Result<()>;
    /// Prompt for the simple loop over the current file set.
    fn rebuild_prompt(&self) -> Result<String>;
    /// Active file set.
    fn files(&self) -> Vec<PathBuf>;
    fn save_state(&self, state: &IterationState) -> Result<()>;
}

/// Persisted run snapshot (`state.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub task: String,
    pub promise: String,
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub state: Option<IterationState>,
}

/// [`RunStore`] backed by JSON files in the state directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    snapshot: Mutex<RunSnapshot>,
}

impl FileStore {
    /// Start a new run in `dir`, replacing any previous snapshot.
    pub fn create(
        dir: &Path,
        task: impl Into<String>,
        files: Vec<PathBuf>,
        promise: impl Into<String>,
    ) -> Result<Self> {
        let mut unique = Vec::with_capacity(files.len());
        for file in files {
            if !unique.contains(&file) {
                unique.push(file);
            }
        }
        let snapshot = RunSnapshot {
            task: task.into(),
            promise: promise.into(),
            files: unique,
            state: None,
        };
        write_json(&dir.join(STATE_FILE), &snapshot)?;
        debug!(dir = %dir.display(), files = snapshot.files.len(), "created run store");
        Ok(Self {
            dir: dir.to_path_buf(),
            snapshot: Mutex::new(snapshot),
        })
    }

    /// Reopen the run saved in `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(STATE_FILE);
        if !path.is_file() {
            return Err(StoreError::NoSavedRun(dir.to_path_buf()));
        }
        let snapshot: RunSnapshot = read_json(&path)?;
        debug!(
            dir = %dir.display(),
            iteration = snapshot.state.as_ref().map_or(0, |s| s.iteration),
            "opened run store"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, RunSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, snapshot: &RunSnapshot) -> Result<()> {
        write_json(&self.dir.join(STATE_FILE), snapshot)
    }
}

impl RunStore for FileStore {
    fn check_queue(&self) -> Result<Vec<PathBuf>> {
        read_queue(&self.dir)
    }

    fn pop_queue(&self) -> Result<Vec<PathBuf>> {
        let Some(claimed) = claim_queue(&self.dir)? else {
            return Ok(Vec::new());
        };
        let queued = take_claimed(&claimed)?;
        if !queued.is_empty() {
            debug!(count = queued.len(), "drained queue");
        }
        Ok(queued)
    }

    fn merge_files(&self, files: &[PathBuf]) -> Result<()> {
        let mut snapshot = self.lock();
        for file in files {
            if !snapshot.files.contains(file) {
                snapshot.files.push(file.clone());
            }
        }
        self.persist(&snapshot)
    }

    fn rebuild_prompt(&self) -> Result<String> {
        let snapshot = self.lock();
        Ok(build_loop_prompt(
            &snapshot.task,
            &snapshot.files,
            &snapshot.promise,
        ))
    }

    fn files(&self) -> Vec<PathBuf> {
        self.lock().files.clone()
    }

    fn save_state(&self, state: &IterationState) -> Result<()> {
        let mut snapshot = self.lock();
        snapshot.state = Some(state.clone());
        self.persist(&snapshot)
    }
}

/// Append paths to the queue in `dir`. Used by `taskloop queue add`.
pub fn enqueue(dir: &Path, paths: &[PathBuf]) -> Result<usize> {
    let mut queued = read_queue(dir)?;
    queued.extend(paths.iter().cloned());
    write_json(&dir.join(QUEUE_FILE), &queued)?;
    Ok(queued.len())
}

/// Move `queue.json` to a drain file private to this call.
///
/// Returns `None` when there is no queue file.
fn claim_queue(dir: &Path) -> Result<Option<PathBuf>> {
    let queue = dir.join(QUEUE_FILE);
    let claimed = dir.join(format!(
        "queue.{}-{}.drain",
        std::process::id(),
        DRAIN_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    match fs::rename(&queue, &claimed) {
        Ok(()) => Ok(Some(claimed)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: queue,
            source,
        }),
    }
}

/// Read a claimed drain file and delete it.
fn take_claimed(claimed: &Path) -> Result<Vec<PathBuf>> {
    let queued = read_json(claimed)?;
    fs::remove_file(claimed).map_err(|source| StoreError::Io {
        path: claimed.to_path_buf(),
        source,
    })?;
    Ok(queued)
}

fn read_queue(dir: &Path) -> Result<Vec<PathBuf>> {
    let path = dir.join(QUEUE_FILE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    read_json(&path)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Atomically write JSON to disk (temp file + rename).
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StoreError::Io { path, source }
    };

    let mut buf = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    buf.push('\n');

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).map_err(io_err(&tmp_path))?;
    fs::rename(&tmp_path, path).map_err(io_err(path))?;
    Ok(())
}
