use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as TokioMutex, RwLock};
use tracing::debug;

use relay_core::Result;

use crate::persist::{read_json_or_default, write_json_atomic};

/// Persisted per-session metadata: usage bookkeeping plus routing details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write: Option<u64>,
    /// Tokens occupying the context window after the latest call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens_fresh: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Fields owned by other writers of the same store, kept as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Mutation applied under the store's per-key lock.
pub type SessionUpdater = Box<dyn FnOnce(&mut SessionEntry) + Send>;

/// Session metadata store keyed by session key.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SessionEntry>>;

    /// Read-modify-write one entry, creating it when missing. Concurrent updates
    /// to the same key are applied one after another, never interleaved.
    async fn update(&self, key: &str, updater: SessionUpdater) -> Result<SessionEntry>;

    async fn delete(&self, key: &str) -> Result<bool>;
}

// ── In-memory store ────────────────────────────────────────────

/// Process-local store with per-key locks.
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    entries: Arc<RwLock<HashMap<String, SessionEntry>>>,
    /// Per-key write locks; serializes read-modify-write on the same key.
    locks: Arc<DashMap<String, Arc<TokioMutex<()>>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_lock(&self, key: &str) -> Arc<TokioMutex<()>> {
        Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .value(),
        )
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<SessionEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn update(&self, key: &str, updater: SessionUpdater) -> Result<SessionEntry> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut entry = self
            .entries
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default();
        updater(&mut entry);
        self.entries
            .write()
            .await
            .insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let removed = self.entries.write().await.remove(key).is_some();
        // Keep the lock while anyone besides this call and the map holds it.
        self.locks
            .remove_if(key, |_, held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) <= 2);
        Ok(removed)
    }
}

// ── JSON file store ────────────────────────────────────────────

/// All sessions in one JSON object file (`sessions.json`).
///
/// Every update re-reads the file under a process-wide lock, so writes made by
/// other components between updates are preserved.
pub struct JsonFileSessionStore {
    path: PathBuf,
    lock: TokioMutex<()>,
}

impl JsonFileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: TokioMutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, SessionEntry>> {
        read_json_or_default(&self.path)
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn get(&self, key: &str) -> Result<Option<SessionEntry>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all()?.remove(key))
    }

    async fn update(&self, key: &str, updater: SessionUpdater) -> Result<SessionEntry> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all()?;
        let entry = all.entry(key.to_string()).or_default();
        updater(entry);
        let updated = entry.clone();
        write_json_atomic(&self.path, &all)?;
        debug!(session_key = %key, path = ?self.path, "session entry updated");
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut all = self.read_all()?;
        let removed = all.remove(key).is_some();
        if removed {
            write_json_atomic(&self.path, &all)?;
        }
        Ok(removed)
    }
}
