//! Tab-scoped key-value storage: state that belongs to one tab and survives
//! its reloads but is never visible to other tabs.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::warn;

/// Tab storage files only hold a handful of small records.
pub const MAX_TAB_STORAGE_BYTES: u64 = 64 * 1024;

pub trait TabScopedStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), TabStorageError>;
    fn remove(&self, key: &str) -> Result<(), TabStorageError>;
}

#[derive(Debug)]
pub enum TabStorageLoadError {
    Metadata(io::Error),
    TooLarge { size: u64, max: u64 },
    Read(io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for TabStorageLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TabStorageLoadError::Metadata(e) => write!(f, "metadata read failed: {e}"),
            TabStorageLoadError::TooLarge { size, max } => {
                write!(f, "file too large: {size} bytes (max {max})")
            }
            TabStorageLoadError::Read(e) => write!(f, "read failed: {e}"),
            TabStorageLoadError::Parse(e) => write!(f, "parse failed: {e}"),
        }
    }
}

impl std::error::Error for TabStorageLoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TabStorageLoadError::Metadata(e) => Some(e),
            TabStorageLoadError::Read(e) => Some(e),
            TabStorageLoadError::Parse(e) => Some(e),
            TabStorageLoadError::TooLarge { .. } => None,
        }
    }
}

#[derive(Debug)]
pub enum TabStorageError {
    Load(TabStorageLoadError),
    Serialize(serde_json::Error),
    WriteTmp(io::Error),
    Rename(io::Error),
}

impl std::fmt::Display for TabStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TabStorageError::Load(e) => write!(f, "load before write failed: {e}"),
            TabStorageError::Serialize(e) => write!(f, "serialize failed: {e}"),
            TabStorageError::WriteTmp(e) => write!(f, "tmp write failed: {e}"),
            TabStorageError::Rename(e) => write!(f, "rename failed: {e}"),
        }
    }
}

impl std::error::Error for TabStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TabStorageError::Load(e) => Some(e),
            TabStorageError::Serialize(e) => Some(e),
            TabStorageError::WriteTmp(e) => Some(e),
            TabStorageError::Rename(e) => Some(e),
        }
    }
}

/// In-memory tab storage. Clones share the same slots, so a test can keep a
/// clone around and hand it to the next incarnation of a reloaded tab.
#[derive(Debug, Clone, Default)]
pub struct MemoryTabStorage {
    slots: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryTabStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_slots<T>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> T) -> T {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut slots)
    }
}

impl TabScopedStorage for MemoryTabStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.with_slots(|slots| slots.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), TabStorageError> {
        self.with_slots(|slots| slots.insert(key.to_owned(), value.to_owned()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), TabStorageError> {
        self.with_slots(|slots| slots.remove(key));
        Ok(())
    }
}

/// Tab storage persisted as one small JSON object per file. Writes go to a
/// temporary file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileTabStorage {
    path: PathBuf,
}

impl FileTabStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), TabStorageError> {
        let mut slots = load_slots_from_path(&self.path).map_err(TabStorageError::Load)?;
        f(&mut slots);
        save_slots_with_retry(&self.path, &slots)
    }
}

impl TabScopedStorage for FileTabStorage {
    fn get(&self, key: &str) -> Option<String> {
        match load_slots_from_path(&self.path) {
            Ok(mut slots) => slots.remove(key),
            Err(err) => {
                warn!(path = %self.path.display(), "tab storage unreadable: {}", err);
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), TabStorageError> {
        self.update(|slots| {
            slots.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove(&self, key: &str) -> Result<(), TabStorageError> {
        self.update(|slots| {
            slots.remove(key);
        })
    }
}

/// A missing file is an empty storage.
pub fn load_slots_from_path(path: &Path) -> Result<BTreeMap<String, String>, TabStorageLoadError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(TabStorageLoadError::Metadata(err)),
    };
    if meta.len() > MAX_TAB_STORAGE_BYTES {
        return Err(TabStorageLoadError::TooLarge {
            size: meta.len(),
            max: MAX_TAB_STORAGE_BYTES,
        });
    }

    let data = fs::read_to_string(path).map_err(TabStorageLoadError::Read)?;
    serde_json::from_str(&data).map_err(TabStorageLoadError::Parse)
}

pub fn save_slots_to_path(
    path: &Path,
    slots: &BTreeMap<String, String>,
) -> Result<(), TabStorageError> {
    if let Some(dir) = path.parent() {
        let _ = fs::create_dir_all(dir);
    }
    let tmp = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(slots).map_err(TabStorageError::Serialize)?;
    fs::write(&tmp, payload.as_bytes()).map_err(TabStorageError::WriteTmp)?;
    fs::rename(&tmp, path).map_err(TabStorageError::Rename)?;
    Ok(())
}

fn save_slots_with_retry(
    path: &Path,
    slots: &BTreeMap<String, String>,
) -> Result<(), TabStorageError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    let mut attempt: u32 = 1;
    loop {
        match save_slots_to_path(path, slots) {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(err) => {
                warn!(attempt, path = %path.display(), "tab storage write failed: {}", err);
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
