use crate::errors::{AppError, AppResult};
use crate::models::AppSettings;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const DEFAULT_CAPACITY_BYTES: u64 = 64 * 1024 * 1024;

const SETTINGS_KEY: &str = "settings:app";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv_entries (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// Local key-value side-channel shared by attachments, reminder stamps and
/// settings. One store per process; clones share the same connection.
#[derive(Debug, Clone)]
pub struct KvStore {
    inner: Arc<KvInner>,
}

#[derive(Debug)]
struct KvInner {
    conn: Mutex<Connection>,
    capacity_bytes: AtomicU64,
}

impl KvStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory().map_err(AppError::from)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        Ok(Self {
            inner: Arc::new(KvInner {
                conn: Mutex::new(conn),
                capacity_bytes: AtomicU64::new(DEFAULT_CAPACITY_BYTES),
            }),
        })
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes.load(Ordering::Relaxed)
    }

    pub fn set_capacity_bytes(&self, bytes: u64) {
        self.inner.capacity_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self
            .inner
            .conn
            .lock()
            .map_err(|_| AppError::Internal("side-channel mutex poisoned".to_string()))?;
        conn.query_row(
            "SELECT value FROM kv_entries WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let capacity = self.capacity_bytes();
        let conn = self
            .inner
            .conn
            .lock()
            .map_err(|_| AppError::Internal("side-channel mutex poisoned".to_string()))?;
        let used_elsewhere: u64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM kv_entries WHERE key <> ?1",
            [key],
            |row| row.get(0),
        )?;
        if used_elsewhere + value.len() as u64 > capacity {
            return Err(AppError::Storage(format!(
                "side-channel capacity exceeded: {} bytes in use, {} requested, cap {}",
                used_elsewhere,
                value.len(),
                capacity
            )));
        }
        conn.execute(
            "INSERT INTO kv_entries (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove(&self, key: &str) -> AppResult<bool> {
        let conn = self
            .inner
            .conn
            .lock()
            .map_err(|_| AppError::Internal("side-channel mutex poisoned".to_string()))?;
        let changed = conn.execute("DELETE FROM kv_entries WHERE key = ?1", [key])?;
        Ok(changed > 0)
    }

    pub fn used_bytes(&self) -> AppResult<u64> {
        let conn = self
            .inner
            .conn
            .lock()
            .map_err(|_| AppError::Internal("side-channel mutex poisoned".to_string()))?;
        let used: u64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(value AS BLOB))), 0) FROM kv_entries",
            [],
            |row| row.get(0),
        )?;
        Ok(used)
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> AppResult<()> {
        self.set(key, &serde_json::to_string(value)?)
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        match self.get(SETTINGS_KEY)? {
            Some(raw) => Ok(serde_json::from_str::<AppSettings>(&raw).unwrap_or_default()),
            None => Ok(AppSettings::default()),
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: AppSettings = serde_json::from_value(merged)?;
        self.set_json(SETTINGS_KEY, &settings)?;
        self.set_capacity_bytes(settings.sidecar_capacity_bytes);
        Ok(settings)
    }
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::KvStore;

    #[test]
    fn set_get_remove_round_trip() {
        let store = KvStore::in_memory().expect("kv");
        assert!(store.get("missing").expect("get").is_none());

        store.set("alpha", "one").expect("set");
        assert_eq!(store.get("alpha").expect("get").as_deref(), Some("one"));

        store.set("alpha", "two").expect("overwrite");
        assert_eq!(store.get("alpha").expect("get").as_deref(), Some("two"));

        assert!(store.remove("alpha").expect("remove"));
        assert!(!store.remove("alpha").expect("second remove"));
        assert!(store.get("alpha").expect("get").is_none());
    }

    #[test]
    fn capacity_cap_rejects_oversized_writes() {
        let store = KvStore::in_memory().expect("kv");
        store.set_capacity_bytes(16);

        store.set("small", "0123456789").expect("fits");
        let err = store.set("big", "0123456789").expect_err("over cap");
        assert!(err.to_string().starts_with("STORAGE"));

        // Replacing an existing key only counts the other entries.
        store.set("small", "0123456789abcdef").expect("replace fits");
    }

    #[test]
    fn settings_merge_preserves_unnamed_fields() {
        let store = KvStore::in_memory().expect("kv");
        let defaults = store.get_settings().expect("defaults");
        assert_eq!(defaults.reminder_poll_seconds, 60);

        let updated = store
            .update_settings(serde_json::json!({ "reminderPollSeconds": 15 }))
            .expect("update");
        assert_eq!(updated.reminder_poll_seconds, 15);
        assert_eq!(
            updated.weekday_task_soft_limit,
            defaults.weekday_task_soft_limit
        );

        let reloaded = store.get_settings().expect("reload");
        assert_eq!(reloaded.reminder_poll_seconds, 15);
    }
}
