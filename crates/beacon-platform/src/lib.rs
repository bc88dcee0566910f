//! Host-facing persistence primitives for the Beacon engine.
//!
//! Drafts, notification preferences, and similar local-only state are kept
//! behind the [`KeyValueStore`] trait so hosts can plug in whatever storage
//! the embedding application already uses.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Minimal string key/value persistence contract.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.remove(key);
        Ok(())
    }
}

/// Single-JSON-document store backed by a file on disk.
///
/// A missing file reads as empty. Writes go through a temp file and rename
/// so a crash mid-write cannot corrupt the document.
pub struct JsonFileStore {
    path: PathBuf,
    data: RwLock<HashMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<HashMap<String, String>>(&raw)
                .map_err(|err| StoreError::Backend(format!("parsing {}: {err}", path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(StoreError::Unavailable(format!(
                    "reading {}: {err}",
                    path.display()
                )));
            }
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    fn persist(&self, data: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| StoreError::Unavailable(format!("creating store dir: {err}")))?;
        }

        let encoded = serde_json::to_vec_pretty(data)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let temp_path = temp_path_for(&self.path);
        fs::write(&temp_path, encoded)
            .map_err(|err| StoreError::Unavailable(format!("writing temp store: {err}")))?;

        if let Err(rename_err) = fs::rename(&temp_path, &self.path) {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(StoreError::Unavailable(format!(
                        "replacing store after rename error ({rename_err}): {err}"
                    )));
                }
            }
            fs::rename(&temp_path, &self.path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                StoreError::Unavailable(format!("writing store: {err}"))
            })?;
        }

        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.insert(key.to_owned(), value.to_owned());
        self.persist(&data)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        if data.remove(key).is_some() {
            self.persist(&data)?;
        }
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("store.json");
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    parent.join(format!(".{file_name}.{now_nanos}.tmp"))
}

/// Wrapper namespacing all keys under a fixed prefix.
#[derive(Clone)]
pub struct ScopedStore<S: KeyValueStore> {
    inner: S,
    prefix: String,
}

impl<S: KeyValueStore> ScopedStore<S> {
    pub fn new(inner: S, prefix: impl Into<String>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}.{key}", self.prefix)
    }
}

impl<S: KeyValueStore> KeyValueStore for ScopedStore<S> {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(&self.scoped(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set(&self.scoped(key), value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(&self.scoped(key))
    }
}
