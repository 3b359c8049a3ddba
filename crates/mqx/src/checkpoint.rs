//! 🔖 Checkpoint — the bookmark in a very long novel.
//!
//! 🎬 *[3:12am. the cluster hiccups. the migration dies at batch 4,117.]*
//! *[the operator runs it again. it opens the book at batch 4,118. nobody cries.]*
//!
//! The checkpoint is an explicit value: the last film id whose batch was
//! committed, plus counters. It is read once at startup and rewritten after
//! every committed batch. On disk it is a small JSON file replaced atomically
//! (write a temp file, then rename over the old one) so a crash mid-write
//! leaves either the old bookmark or the new one, never half of each.
//!
//! 🔒 Only one run may hold the bookmark at a time. `acquire()` drops a lock
//! marker next to the checkpoint with create-new semantics. A second run finds
//! it and leaves with `CheckpointLocked`, unless the marker names a process
//! that is no longer alive: a crashed run's marker is archived and the lock is
//! taken over. `break_lock()` is the manual override for when liveness cannot
//! be told (another host, a non-Linux box). 🦆

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::errors::MigrationError;

/// 📍 Where the last run left off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 🔖 Highest film id in the last contiguously committed batch. `None` = nothing yet.
    #[serde(default)]
    pub last_film_id: Option<String>,
    /// ⏱️ Unix seconds when the run that owns this checkpoint started.
    #[serde(default)]
    pub run_started_at: u64,
    #[serde(default)]
    pub batches_committed: u64,
    #[serde(default)]
    pub documents_loaded: u64,
    #[serde(default)]
    pub documents_skipped: u64,
    #[serde(default)]
    pub documents_rejected: u64,
    /// ✅ The source was fully drained. A new run starts from the top.
    #[serde(default)]
    pub completed: bool,
}

impl Checkpoint {
    /// 🆕 A fresh bookmark stamped with the current wall clock.
    pub fn fresh() -> Self {
        Self {
            run_started_at: unix_now(),
            ..Default::default()
        }
    }
}

/// 🔧 Where the bookmark lives.
#[derive(Debug, Deserialize, Clone)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_path", alias = "file_name")]
    pub path: PathBuf,
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("mqx-checkpoint.json")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
        }
    }
}

/// 🪪 What the lock marker says about its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockMarker {
    pid: u32,
    /// ⏱️ Unix seconds.
    acquired_at: u64,
}

impl LockMarker {
    fn ours() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: unix_now(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

// 🤷 no cheap way to ask; assume the owner is still there and let the operator break the lock
#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

/// 🔍 What we found when the lock marker was already there.
#[derive(Debug, PartialEq, Eq)]
enum LockState {
    /// 🏃 Released between our create attempt and the read.
    Absent,
    Held(LockMarker),
    /// 👻 Owner is gone, or the marker is garbage. Safe to take over.
    Stale(String),
    /// ⏳ Empty marker: another run is between create and write. Treated as held.
    Starting,
}

/// 🗄️ A single-writer home for the [`Checkpoint`].
#[async_trait]
pub(crate) trait CheckpointStore: std::fmt::Debug + Send + Sync {
    /// 🔒 Take the single-writer lock or fail with `CheckpointLocked`.
    async fn acquire(&self) -> Result<(), MigrationError>;
    /// 📖 The last persisted checkpoint, if there is one.
    async fn load(&self) -> Result<Option<Checkpoint>, MigrationError>;
    /// 💾 Replace the persisted checkpoint. Atomic or not at all.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), MigrationError>;
    /// 🔓 Let the next run in.
    async fn release(&self) -> Result<(), MigrationError>;
    /// 🔨 Remove whatever lock is there, owner alive or not. Operator's call.
    async fn break_lock(&self) -> Result<(), MigrationError>;
}

// ===== File store =====

/// 📁 JSON file + sibling `.lock` marker.
#[derive(Debug, Clone)]
pub(crate) struct FileCheckpointStore {
    path: PathBuf,
    lock_path: PathBuf,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl FileCheckpointStore {
    pub(crate) fn new(config: &CheckpointConfig) -> Self {
        Self {
            lock_path: sibling(&config.path, ".lock"),
            path: config.path.clone(),
        }
    }

    /// 🔍 Read the marker someone else left and decide whether it still counts.
    async fn inspect_lock(&self) -> Result<LockState, MigrationError> {
        let raw = match tokio::fs::read_to_string(&self.lock_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockState::Absent),
            Err(e) => {
                return Err(MigrationError::checkpoint(format!(
                    "could not read lock marker '{}': {e}",
                    self.lock_path.display()
                )));
            }
        };
        if raw.trim().is_empty() {
            return Ok(LockState::Starting);
        }
        Ok(match serde_json::from_str::<LockMarker>(&raw) {
            Ok(marker) if pid_is_alive(marker.pid) => LockState::Held(marker),
            Ok(marker) => LockState::Stale(format!("pid {} is no longer running", marker.pid)),
            Err(e) => LockState::Stale(format!("marker is unreadable ({e})")),
        })
    }

    /// 🗃️ Move a dead run's marker aside instead of deleting it, so there is a trail.
    async fn archive_stale_lock(&self, reason: &str) -> Result<(), MigrationError> {
        let archived = sibling(&self.lock_path, &format!(".stale.{}", unix_now()));
        match tokio::fs::rename(&self.lock_path, &archived).await {
            Ok(()) => {
                warn!(
                    "🧟 stale checkpoint lock ({reason}); moved to '{}' and taking over",
                    archived.display()
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MigrationError::checkpoint(format!(
                "could not move stale lock marker '{}' aside: {e}",
                self.lock_path.display()
            ))),
        }
    }

    async fn try_create_lock(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
    }

    async fn ensure_parent(&self) -> Result<(), MigrationError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MigrationError::checkpoint(format!(
                    "could not create checkpoint directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn acquire(&self) -> Result<(), MigrationError> {
        self.ensure_parent().await?;
        // 🔁 at most one takeover: if a stale marker reappears after we archived it, someone else won
        let mut took_over = false;
        loop {
            match self.try_create_lock().await {
                Ok(mut file) => {
                    let marker = serde_json::to_vec(&LockMarker::ours()).map_err(|e| {
                        MigrationError::checkpoint(format!("could not serialize lock marker: {e}"))
                    })?;
                    // 🚿 tokio files finish writes in the background unless flushed
                    file.write_all(&marker).await.map_err(|e| {
                        MigrationError::checkpoint(format!("could not write lock marker: {e}"))
                    })?;
                    file.flush().await.map_err(|e| {
                        MigrationError::checkpoint(format!("could not write lock marker: {e}"))
                    })?;
                    debug!("🔒 checkpoint lock taken at '{}'", self.lock_path.display());
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match self.inspect_lock().await? {
                    LockState::Stale(reason) if !took_over => {
                        self.archive_stale_lock(&reason).await?;
                        took_over = true;
                    }
                    LockState::Absent if !took_over => took_over = true,
                    LockState::Held(marker) => {
                        return Err(MigrationError::CheckpointLocked(format!(
                            "'{}' is held by pid {} (since unix time {}); wait for it, or pass --break-lock if that run is gone",
                            self.lock_path.display(),
                            marker.pid,
                            marker.acquired_at
                        )));
                    }
                    LockState::Absent | LockState::Stale(_) | LockState::Starting => {
                        return Err(MigrationError::CheckpointLocked(format!(
                            "'{}' was just taken by another run",
                            self.lock_path.display()
                        )));
                    }
                },
                Err(e) => {
                    return Err(MigrationError::checkpoint(format!(
                        "could not create lock marker '{}': {e}",
                        self.lock_path.display()
                    )));
                }
            }
        }
    }

    async fn load(&self) -> Result<Option<Checkpoint>, MigrationError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MigrationError::checkpoint(format!(
                    "could not read '{}': {e}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_slice(&raw).map(Some).map_err(|e| {
            MigrationError::checkpoint(format!(
                "'{}' is not a valid checkpoint: {e}",
                self.path.display()
            ))
        })
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), MigrationError> {
        let body = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| MigrationError::checkpoint(format!("could not serialize checkpoint: {e}")))?;
        let tmp = sibling(&self.path, ".tmp");
        tokio::fs::write(&tmp, body).await.map_err(|e| {
            MigrationError::checkpoint(format!("could not write '{}': {e}", tmp.display()))
        })?;
        // 🔄 rename is the atomic part; the temp write above is allowed to die halfway
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            MigrationError::checkpoint(format!(
                "could not move '{}' over '{}': {e}",
                tmp.display(),
                self.path.display()
            ))
        })
    }

    async fn release(&self) -> Result<(), MigrationError> {
        match tokio::fs::remove_file(&self.lock_path).await {
            Ok(()) => {
                debug!("🔓 checkpoint lock released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("🔓 lock marker '{}' was already gone", self.lock_path.display());
                Ok(())
            }
            Err(e) => Err(MigrationError::checkpoint(format!(
                "could not remove lock marker '{}': {e}",
                self.lock_path.display()
            ))),
        }
    }

    async fn break_lock(&self) -> Result<(), MigrationError> {
        match self.inspect_lock().await? {
            LockState::Absent => {
                debug!("🔨 nothing to break at '{}'", self.lock_path.display());
                Ok(())
            }
            state => {
                warn!("🔨 breaking checkpoint lock '{}' ({state:?})", self.lock_path.display());
                self.archive_stale_lock("broken by operator").await
            }
        }
    }
}

// ===== In-memory store =====

#[cfg(test)]
#[derive(Debug, Default)]
struct InMemoryState {
    current: Option<Checkpoint>,
    locked: bool,
    history: Vec<Checkpoint>,
}

/// 🧠 A checkpoint store that lives and dies with the process. Clone-able so
/// tests can keep a handle and read the history after the pipeline is done.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub(crate) struct InMemoryCheckpointStore {
    state: std::sync::Arc<tokio::sync::Mutex<InMemoryState>>,
}

#[cfg(test)]
impl InMemoryCheckpointStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 📜 Every checkpoint ever saved, in order.
    pub(crate) async fn history(&self) -> Vec<Checkpoint> {
        self.state.lock().await.history.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn acquire(&self) -> Result<(), MigrationError> {
        let mut state = self.state.lock().await;
        if state.locked {
            return Err(MigrationError::CheckpointLocked("in-memory store is already held".into()));
        }
        state.locked = true;
        Ok(())
    }

    async fn load(&self) -> Result<Option<Checkpoint>, MigrationError> {
        Ok(self.state.lock().await.current.clone())
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), MigrationError> {
        let mut state = self.state.lock().await;
        state.current = Some(checkpoint.clone());
        state.history.push(checkpoint.clone());
        Ok(())
    }

    async fn release(&self) -> Result<(), MigrationError> {
        self.state.lock().await.locked = false;
        Ok(())
    }

    async fn break_lock(&self) -> Result<(), MigrationError> {
        self.state.lock().await.locked = false;
        Ok(())
    }
}

// ===== Dispatch =====

/// 🎭 The many homes of a checkpoint.
#[derive(Debug, Clone)]
pub(crate) enum CheckpointBackend {
    File(FileCheckpointStore),
    #[cfg(test)]
    InMemory(InMemoryCheckpointStore),
}

impl CheckpointBackend {
    pub(crate) fn from_config(config: &CheckpointConfig) -> Self {
        info!("🔖 checkpoint file: '{}'", config.path.display());
        Self::File(FileCheckpointStore::new(config))
    }
}

#[async_trait]
impl CheckpointStore for CheckpointBackend {
    async fn acquire(&self) -> Result<(), MigrationError> {
        match self {
            Self::File(s) => s.acquire().await,
            #[cfg(test)]
            Self::InMemory(s) => s.acquire().await,
        }
    }

    async fn load(&self) -> Result<Option<Checkpoint>, MigrationError> {
        match self {
            Self::File(s) => s.load().await,
            #[cfg(test)]
            Self::InMemory(s) => s.load().await,
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), MigrationError> {
        match self {
            Self::File(s) => s.save(checkpoint).await,
            #[cfg(test)]
            Self::InMemory(s) => s.save(checkpoint).await,
        }
    }

    async fn release(&self) -> Result<(), MigrationError> {
        match self {
            Self::File(s) => s.release().await,
            #[cfg(test)]
            Self::InMemory(s) => s.release().await,
        }
    }

    async fn break_lock(&self) -> Result<(), MigrationError> {
        match self {
            Self::File(s) => s.break_lock().await,
            #[cfg(test)]
            Self::InMemory(s) => s.break_lock().await,
        }
    }
}
