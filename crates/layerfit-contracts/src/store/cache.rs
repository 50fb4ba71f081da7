use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};

use super::{CacheError, LocalCache};

/// Default quota for the whole cache file.
pub const DEFAULT_CACHE_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// JSON-file backed string cache.
///
/// Every read refreshes from disk and every write merges only the touched
/// key into the on-disk object, so two instances pointed at the same file
/// do not clobber each other's keys.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    quota: usize,
    lock: Mutex<()>,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_quota(path, DEFAULT_CACHE_QUOTA_BYTES)
    }

    pub fn with_quota(path: impl Into<PathBuf>, quota: usize) -> Self {
        Self {
            path: path.into(),
            quota,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entry(&self, key: &str, value: Option<&str>) -> Result<(), CacheError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| CacheError::Io("file cache lock poisoned".to_string()))?;
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        match value {
            Some(value) => {
                if on_disk.get(key).and_then(Value::as_str) == Some(value) {
                    return Ok(());
                }
                on_disk.insert(key.to_string(), Value::String(value.to_string()));
            }
            None => {
                if on_disk.remove(key).is_none() {
                    return Ok(());
                }
            }
        }

        let serialized = serde_json::to_string_pretty(&Value::Object(on_disk))
            .map_err(|err| CacheError::Io(err.to_string()))?;
        if value.is_some() && serialized.len() > self.quota {
            return Err(CacheError::QuotaExceeded {
                needed: serialized.len(),
                quota: self.quota,
            });
        }
        write_text(&self.path, &serialized).map_err(|err| CacheError::Io(format!("{err:#}")))
    }
}

impl LocalCache for FileCache {
    fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.write_entry(key, Some(value))
    }

    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock().ok()?;
        read_json_object(&self.path)?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.write_entry(key, None)
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_text(path: &Path, text: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)?;
    Ok(())
}
