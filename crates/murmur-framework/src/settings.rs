//! Skill settings stores.
//!
//! The framework only ever asks a store to persist itself after a handler
//! ran successfully and once more at shutdown. [`JsonSettings`] is the
//! default store: a JSON object in `{base_dir}/settings.json`, written only
//! when something changed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::SettingsResult;

/// A persistent settings store.
#[async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    /// Persists pending changes. Returns `true` if anything was written.
    async fn store(&self) -> SettingsResult<bool>;

    /// Returns `true` if there are unpersisted changes.
    fn is_dirty(&self) -> bool;
}

/// Settings kept as a JSON object on disk.
#[derive(Debug)]
pub struct JsonSettings {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
    dirty: AtomicBool,
}

impl JsonSettings {
    /// Creates an empty store backed by `path`. Nothing is read.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            values: Mutex::new(Map::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Creates a store backed by `path`, loading it if the file exists.
    pub async fn load(path: impl AsRef<Path>) -> SettingsResult<Self> {
        let settings = Self::new(path);
        if tokio::fs::try_exists(&settings.path).await? {
            let raw = tokio::fs::read(&settings.path).await?;
            let values: Map<String, Value> = serde_json::from_slice(&raw)?;
            debug!(path = %settings.path.display(), keys = values.len(), "Loaded settings");
            *settings.values.lock() = values;
        }
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads `key` as `T`. Returns `None` if absent or of another shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.lock().get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    /// Sets `key` and marks the store dirty.
    pub fn set(&self, key: impl Into<String>, value: impl Serialize) -> SettingsResult<()> {
        let value = serde_json::to_value(value)?;
        self.values.lock().insert(key.into(), value);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Removes `key`. Returns the old value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let old = self.values.lock().remove(key);
        if old.is_some() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        old
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }
}

#[async_trait]
impl SettingsStore for JsonSettings {
    async fn store(&self) -> SettingsResult<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let snapshot = Value::Object(self.values.lock().clone());
        let result = async {
            let body = serde_json::to_vec_pretty(&snapshot)?;
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&self.path, body).await?;
            SettingsResult::Ok(())
        }
        .await;
        if result.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result.map(|()| true)
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }
}
