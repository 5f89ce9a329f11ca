use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use naragaiden_core::{TapAction, arm_decision, is_arm_window_open};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Upper bound on `state.json`, which holds one payload and a few scalars.
pub const MAX_STATE_BYTES: u64 = 1024 * 1024;

/// Last-known-good data plus refresh and arming bookkeeping.
///
/// The whole document is written at once, so readers never see a new error flag next to a
/// payload from a different refresh.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CachedState {
    #[serde(default, rename = "last_json")]
    pub raw_payload: Option<String>,
    #[serde(default, rename = "last_updated")]
    pub updated_label: Option<String>,
    /// Epoch ms of the last successful refresh; `0` = never.
    #[serde(default)]
    pub last_success_ms: i64,
    #[serde(default)]
    pub last_error: bool,
    /// Epoch ms of the first launch tap; `0` = disarmed.
    #[serde(default, rename = "armed_ms")]
    pub armed_at_ms: i64,
}

#[derive(Debug)]
pub enum StoreLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for StoreLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            StoreLoadError::TooLarge { size, max } => {
                write!(f, "file too large: {size} bytes (max {max})")
            }
            StoreLoadError::Read(e) => write!(f, "read failed: {e}"),
            StoreLoadError::Parse(e) => write!(f, "parse failed: {e}"),
        }
    }
}

impl std::error::Error for StoreLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreLoadError::Metadata(e) => Some(e),
            StoreLoadError::Read(e) => Some(e),
            StoreLoadError::Parse(e) => Some(e),
            StoreLoadError::TooLarge { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum StoreSaveError {
    /// The stored document could not be read, so it was left untouched.
    Load(StoreLoadError),
    Serialize(serde_json::Error),
    TooLarge { size: u64, max: u64 },
    WriteTmp(io::Error),
    Rename(io::Error),
    Background(String),
}

impl std::fmt::Display for StoreSaveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreSaveError::Load(e) => write!(f, "existing state unreadable: {e}"),
            StoreSaveError::Serialize(e) => write!(f, "serialize failed: {e}"),
            StoreSaveError::TooLarge { size, max } => {
                write!(f, "state too large: {size} bytes (max {max})")
            }
            StoreSaveError::WriteTmp(e) => write!(f, "tmp write failed: {e}"),
            StoreSaveError::Rename(e) => write!(f, "rename failed: {e}"),
            StoreSaveError::Background(e) => write!(f, "background write failed: {e}"),
        }
    }
}

impl std::error::Error for StoreSaveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreSaveError::Load(e) => Some(e),
            StoreSaveError::Serialize(e) => Some(e),
            StoreSaveError::WriteTmp(e) => Some(e),
            StoreSaveError::Rename(e) => Some(e),
            StoreSaveError::TooLarge { .. } | StoreSaveError::Background(_) => None,
        }
    }
}

/// Durable key-value backend for [`CachedState`].
pub trait Store: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> Result<Option<CachedState>, StoreLoadError>;
    fn save(&self, state: &CachedState) -> Result<(), StoreSaveError>;
}

pub fn parse_state_json(data: &str) -> Result<CachedState, serde_json::Error> {
    serde_json::from_str::<CachedState>(data)
}

pub fn load_state_from_path(path: &Path) -> Result<CachedState, StoreLoadError> {
    let meta = fs::metadata(path).map_err(StoreLoadError::Metadata)?;
    if meta.len() > MAX_STATE_BYTES {
        return Err(StoreLoadError::TooLarge {
            size: meta.len(),
            max: MAX_STATE_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(StoreLoadError::Read)?;
    parse_state_json(&data).map_err(StoreLoadError::Parse)
}

pub fn save_state_to_path(path: &Path, state: &CachedState) -> Result<(), StoreSaveError> {
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(state).map_err(StoreSaveError::Serialize)?;
    let size = payload.len() as u64;
    if size > MAX_STATE_BYTES {
        return Err(StoreSaveError::TooLarge {
            size,
            max: MAX_STATE_BYTES,
        });
    }
    fs::write(&tmp, payload.as_bytes()).map_err(StoreSaveError::WriteTmp)?;
    fs::rename(&tmp, path).map_err(StoreSaveError::Rename)?;
    Ok(())
}

fn save_state_with_retry(path: &Path, state: &CachedState) -> Result<(), StoreSaveError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt = 1;
    loop {
        match save_state_to_path(path, state) {
            Ok(()) => return Ok(()),
            Err(err @ StoreSaveError::TooLarge { .. }) => return Err(err),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                debug!(attempt, path = %path.display(), "state save failed, retrying: {err}");
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}

/// JSON file backend; each save replaces the file through a rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Store for FileStore {
    fn load(&self) -> Result<Option<CachedState>, StoreLoadError> {
        if !self.path.exists() {
            return Ok(None);
        }
        load_state_from_path(&self.path).map(Some)
    }

    fn save(&self, state: &CachedState) -> Result<(), StoreSaveError> {
        save_state_with_retry(&self.path, state)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<CachedState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: CachedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }
}

impl Store for MemoryStore {
    fn load(&self) -> Result<Option<CachedState>, StoreLoadError> {
        Ok(lock(&self.state).clone())
    }

    fn save(&self, state: &CachedState) -> Result<(), StoreSaveError> {
        *lock(&self.state) = Some(state.clone());
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared cache of the last successful refresh.
///
/// Writers go through a process-local lock so that each read-modify-write of the document is
/// applied as one group.
pub struct SnapshotStore {
    backend: Box<dyn Store>,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(backend: impl Store + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Persisted state, or the empty default when nothing usable is stored.
    pub fn load(&self) -> CachedState {
        match self.backend.load() {
            Ok(Some(state)) => state,
            Ok(None) => CachedState::default(),
            Err(err) => {
                warn!("cached state unreadable, starting empty: {}", err);
                CachedState::default()
            }
        }
    }

    /// Replaces the cached payload. Readable arming state is carried over; an unreadable
    /// document is overwritten since every cached field is being replaced.
    pub fn save_success(
        &self,
        raw_payload: &str,
        updated_label: &str,
        now_ms: i64,
    ) -> Result<(), StoreSaveError> {
        let _guard = lock(&self.write_lock);
        let previous = match self.backend.load() {
            Ok(state) => state.unwrap_or_default(),
            Err(err) => {
                warn!("replacing unreadable cached state: {}", err);
                CachedState::default()
            }
        };
        self.backend.save(&CachedState {
            raw_payload: Some(raw_payload.to_owned()),
            updated_label: Some(updated_label.to_owned()),
            last_success_ms: now_ms,
            last_error: false,
            armed_at_ms: previous.armed_at_ms,
        })
    }

    /// Flags the failed refresh; the last good payload, label and success time are kept.
    pub fn save_failure(&self, now_ms: i64) -> Result<(), StoreSaveError> {
        debug!(now_ms, "recording refresh failure");
        self.update(|state| state.last_error = true)
    }

    pub fn set_armed(&self, armed_at_ms: i64) -> Result<(), StoreSaveError> {
        self.update(|state| state.armed_at_ms = armed_at_ms)
    }

    /// Applies a launch tap at `now_ms` and returns what it should do, in one locked step.
    pub fn register_tap(&self, now_ms: i64) -> Result<TapAction, StoreSaveError> {
        self.update(|state| {
            let (action, armed_at_ms) = arm_decision(state.armed_at_ms, now_ms);
            state.armed_at_ms = armed_at_ms;
            action
        })
    }

    /// Whether a launch tap is waiting for confirmation. An expired window is cleared.
    pub fn check_armed(&self, now_ms: i64) -> bool {
        let _guard = lock(&self.write_lock);
        let mut state = self.load();
        if state.armed_at_ms <= 0 {
            return false;
        }
        if is_arm_window_open(state.armed_at_ms, now_ms) {
            return true;
        }
        state.armed_at_ms = 0;
        if let Err(err) = self.backend.save(&state) {
            warn!("failed to clear expired launch arm: {}", err);
        }
        false
    }

    /// Read-modify-write of the stored document. Fails without writing when the current
    /// document cannot be read.
    fn update<T>(&self, apply: impl FnOnce(&mut CachedState) -> T) -> Result<T, StoreSaveError> {
        let _guard = lock(&self.write_lock);
        let mut state = self
            .backend
            .load()
            .map_err(StoreSaveError::Load)?
            .unwrap_or_default();
        let out = apply(&mut state);
        self.backend.save(&state)?;
        Ok(out)
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore").finish_non_exhaustive()
    }
}
