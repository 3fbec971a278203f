//! Durable record and label backends.
//!
//! [`RecordBackend`] is the key/value contract the device-info store writes
//! through; "already exists" is its own error kind so callers can fall back
//! from create to read-compare-update. [`LabelBackend`] holds the node labels
//! used for staged recovery.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

/// File holding node labels inside a [`FileBackend`] root.
const LABELS_FILE: &str = "labels.json";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("record {0} already exists")]
    AlreadyExists(String),

    #[error("record {0} not found")]
    NotFound(String),

    #[error("invalid record key '{0}'")]
    InvalidKey(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt data in {key}: {message}")]
    Corrupt { key: String, message: String },
}

/// Key/value store with create/get/update/delete.
pub trait RecordBackend: Send + Sync {
    /// Create a record; fails with `AlreadyExists` if the key is taken.
    fn create(&self, key: &str, value: &[u8]) -> Result<(), BackendError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, BackendError>;

    /// Replace an existing record wholesale; fails with `NotFound` if absent.
    fn update(&self, key: &str, value: &[u8]) -> Result<(), BackendError>;

    fn delete(&self, key: &str) -> Result<(), BackendError>;
}

/// Node labels.
pub trait LabelBackend: Send + Sync {
    fn labels(&self) -> Result<BTreeMap<String, String>, BackendError>;

    /// Set `set` and drop `remove` in one replace.
    fn patch_labels(&self, set: &BTreeMap<String, String>, remove: &[String]) -> Result<(), BackendError>;
}

fn validate_key(key: &str) -> Result<(), BackendError> {
    let valid = !key.is_empty()
        && key.len() <= 253
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && !key.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(BackendError::InvalidKey(key.to_string()))
    }
}

// ── File backend ───────────────────────────────────────────────────────────

/// One JSON file per key under a root directory.
///
/// Writes go to a temporary file in the same directory and are renamed into
/// place, so readers never see a partial record.
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| BackendError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BackendError> {
        validate_key(key)?;
        Ok(self.root.join(format!("{key}.json")))
    }

    fn write_atomic(&self, key: &str, path: &Path, value: &[u8], clobber: bool) -> Result<(), BackendError> {
        let io = |source: std::io::Error| BackendError::Io {
            key: key.to_string(),
            source,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root).map_err(io)?;
        tmp.write_all(value).map_err(io)?;
        tmp.as_file().sync_all().map_err(io)?;

        if clobber {
            tmp.persist(path).map_err(|e| io(e.error))?;
        } else {
            tmp.persist_noclobber(path).map_err(|e| {
                if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                    BackendError::AlreadyExists(key.to_string())
                } else {
                    io(e.error)
                }
            })?;
        }
        debug!(key, bytes = value.len(), "record written");
        Ok(())
    }
}

impl RecordBackend for FileBackend {
    fn create(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        let path = self.path_for(key)?;
        self.write_atomic(key, &path, value, false)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => BackendError::NotFound(key.to_string()),
            _ => BackendError::Io {
                key: key.to_string(),
                source,
            },
        })
    }

    fn update(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Err(BackendError::NotFound(key.to_string()));
        }
        self.write_atomic(key, &path, value, true)
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        let path = self.path_for(key)?;
        std::fs::remove_file(&path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => BackendError::NotFound(key.to_string()),
            _ => BackendError::Io {
                key: key.to_string(),
                source,
            },
        })
    }
}

impl LabelBackend for FileBackend {
    fn labels(&self) -> Result<BTreeMap<String, String>, BackendError> {
        let path = self.root.join(LABELS_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| BackendError::Corrupt {
                key: LABELS_FILE.to_string(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(BackendError::Io {
                key: LABELS_FILE.to_string(),
                source,
            }),
        }
    }

    fn patch_labels(&self, set: &BTreeMap<String, String>, remove: &[String]) -> Result<(), BackendError> {
        let mut labels = self.labels()?;
        for key in remove {
            labels.remove(key);
        }
        labels.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
        let bytes = serde_json::to_vec_pretty(&labels).map_err(|e| BackendError::Corrupt {
            key: LABELS_FILE.to_string(),
            message: e.to_string(),
        })?;
        let path = self.root.join(LABELS_FILE);
        self.write_atomic(LABELS_FILE, &path, &bytes, true)
    }
}

// ── In-memory backend ──────────────────────────────────────────────────────

/// Per-operation call counters of a [`MemoryBackend`].
#[derive(Debug, Default)]
pub struct BackendCounters {
    pub creates: AtomicU64,
    pub gets: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
    pub label_patches: AtomicU64,
}

/// In-process backend with call counters and failure injection.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
    labels: Mutex<BTreeMap<String, String>>,
    counters: BackendCounters,
    fail_next: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &BackendCounters {
        &self.counters
    }

    pub fn update_count(&self) -> u64 {
        self.counters.updates.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> u64 {
        self.counters.creates.load(Ordering::SeqCst)
    }

    /// Make the next `n` record operations fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Store raw bytes without going through `create`.
    pub fn insert_raw(&self, key: &str, value: &[u8]) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_vec());
    }

    fn injected_failure(&self) -> Result<(), BackendError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl RecordBackend for MemoryBackend {
    fn create(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        validate_key(key)?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.contains_key(key) {
            return Err(BackendError::AlreadyExists(key.to_string()));
        }
        records.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    fn update(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(key) {
            Some(slot) => {
                *slot = value.to_vec();
                Ok(())
            }
            None => Err(BackendError::NotFound(key.to_string())),
        }
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }
}

impl LabelBackend for MemoryBackend {
    fn labels(&self) -> Result<BTreeMap<String, String>, BackendError> {
        Ok(self.labels.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn patch_labels(&self, set: &BTreeMap<String, String>, remove: &[String]) -> Result<(), BackendError> {
        self.counters.label_patches.fetch_add(1, Ordering::SeqCst);
        let mut labels = self.labels.lock().unwrap_or_else(|e| e.into_inner());
        for key in remove {
            labels.remove(key);
        }
        labels.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}
