use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{Error, ErrorDetails};
use crate::usage_limit::TenantId;

pub const FLAGS_KEY: &str = "freemium_notifications";
pub const LAST_CHECK_KEY: &str = "freemium_last_check";

/// Notification state exactly as stored: a JSON flag object and a `YYYY-M` period string.
/// Values are kept raw so a corrupt flag document can be detected and replaced by the gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedNotifications {
    #[serde(rename = "freemium_notifications", default)]
    pub flags: Option<String>,
    #[serde(rename = "freemium_last_check", default)]
    pub last_check: Option<String>,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Empty state when nothing was stored for the tenant yet
    async fn load(&self, tenant_id: TenantId) -> Result<PersistedNotifications, Error>;

    async fn save(
        &self,
        tenant_id: TenantId,
        persisted: &PersistedNotifications,
    ) -> Result<(), Error>;
}

fn store_error(message: impl Into<String>) -> Error {
    Error::new(ErrorDetails::NotificationStore {
        message: message.into(),
    })
}

#[derive(Debug, Default)]
pub struct MemoryNotificationStore {
    entries: DashMap<TenantId, PersistedNotifications>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a tenant's raw state
    pub fn put(&self, tenant_id: TenantId, persisted: PersistedNotifications) {
        self.entries.insert(tenant_id, persisted);
    }

    pub fn get(&self, tenant_id: TenantId) -> Option<PersistedNotifications> {
        self.entries
            .get(&tenant_id)
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn load(&self, tenant_id: TenantId) -> Result<PersistedNotifications, Error> {
        Ok(self.get(tenant_id).unwrap_or_default())
    }

    async fn save(
        &self,
        tenant_id: TenantId,
        persisted: &PersistedNotifications,
    ) -> Result<(), Error> {
        self.put(tenant_id, persisted.clone());
        Ok(())
    }
}

type FileDocument = BTreeMap<TenantId, PersistedNotifications>;

/// All tenants in one JSON document on local disk.
#[derive(Debug)]
pub struct FileNotificationStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileNotificationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<FileDocument, Error> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(FileDocument::new()),
            Err(e) => {
                return Err(store_error(format!(
                    "Failed to read `{}`: {e}",
                    self.path.display()
                )))
            }
        };
        let parsed = serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&contents);
        let raw = parsed.map_err(|e| {
            store_error(format!("Failed to parse `{}`: {e}", self.path.display()))
        })?;
        let mut document = FileDocument::new();
        for (key, value) in raw {
            let entry = TenantId::parse_str(&key)
                .map_err(|e| e.to_string())
                .and_then(|tenant_id| {
                    serde_json::from_value::<PersistedNotifications>(value)
                        .map(|persisted| (tenant_id, persisted))
                        .map_err(|e| e.to_string())
                });
            match entry {
                Ok((tenant_id, persisted)) => {
                    document.insert(tenant_id, persisted);
                }
                Err(e) => warn!(
                    entry = %key,
                    "Dropping unreadable entry from `{}`: {e}",
                    self.path.display()
                ),
            }
        }
        Ok(document)
    }

    fn sibling_path(&self, suffix: &str) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }

    /// Moves an unreadable file to `<path>.corrupt` so it is never silently overwritten
    async fn quarantine(&self, reason: &Error) {
        let corrupt_path = self.sibling_path(".corrupt");
        match tokio::fs::rename(&self.path, &corrupt_path).await {
            Ok(()) => warn!(
                "Moved unreadable notification file to `{}`, all tenants start unarmed: {reason}",
                corrupt_path.display()
            ),
            Err(e) => warn!(
                "Discarding unreadable notification file: {reason} (could not move it aside: {e})"
            ),
        }
    }

    async fn write_document(&self, document: &FileDocument) -> Result<(), Error> {
        let serialized = serde_json::to_vec_pretty(document).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize notification state: {e}"),
            })
        })?;
        let tmp_path = self.sibling_path(".tmp");
        tokio::fs::write(&tmp_path, serialized).await.map_err(|e| {
            store_error(format!("Failed to write `{}`: {e}", tmp_path.display()))
        })?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            store_error(format!("Failed to replace `{}`: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl NotificationStore for FileNotificationStore {
    async fn load(&self, tenant_id: TenantId) -> Result<PersistedNotifications, Error> {
        let mut document = self.read_document().await?;
        Ok(document.remove(&tenant_id).unwrap_or_default())
    }

    async fn save(
        &self,
        tenant_id: TenantId,
        persisted: &PersistedNotifications,
    ) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut document = match self.read_document().await {
            Ok(document) => document,
            Err(e) => {
                self.quarantine(&e).await;
                FileDocument::new()
            }
        };
        document.insert(tenant_id, persisted.clone());
        self.write_document(&document).await
    }
}

/// Shared state across gateway instances, one JSON value per tenant.
pub struct RedisNotificationStore {
    client: redis::Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    key_prefix: String,
    op_timeout: Duration,
}

impl RedisNotificationStore {
    pub fn new(
        url: &str,
        key_prefix: impl Into<String>,
        op_timeout: Duration,
    ) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid Redis URL for notification store: {e}"),
            })
        })?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
            key_prefix: key_prefix.into(),
            op_timeout,
        })
    }

    pub fn key(&self, tenant_id: TenantId) -> String {
        format!("{}:freemium:{tenant_id}", self.key_prefix)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, Error> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut slot = self.connection.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let connect = self.client.get_multiplexed_async_connection();
        let conn = timeout(self.op_timeout, connect)
            .await
            .map_err(|_| store_error("Timed out connecting to Redis"))?
            .map_err(|e| store_error(format!("Failed to connect to Redis: {e}")))?;
        info!("Connected to Redis for notification state");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the connection so the next operation reconnects
    async fn reset_connection(&self) {
        *self.connection.write().await = None;
    }
}

#[async_trait]
impl NotificationStore for RedisNotificationStore {
    async fn load(&self, tenant_id: TenantId) -> Result<PersistedNotifications, Error> {
        let mut conn = self.connection().await?;
        let key = self.key(tenant_id);
        let read = conn.get::<_, Option<String>>(&key);
        let raw = match timeout(self.op_timeout, read).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                self.reset_connection().await;
                return Err(store_error(format!("Redis error reading `{key}`: {e}")));
            }
            Err(_) => return Err(store_error(format!("Redis timeout reading `{key}`"))),
        };
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| store_error(format!("Failed to parse `{key}`: {e}"))),
            None => Ok(PersistedNotifications::default()),
        }
    }

    async fn save(
        &self,
        tenant_id: TenantId,
        persisted: &PersistedNotifications,
    ) -> Result<(), Error> {
        let value = serde_json::to_string(persisted).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize notification state: {e}"),
            })
        })?;
        let mut conn = self.connection().await?;
        let key = self.key(tenant_id);
        let write = conn.set::<_, _, ()>(&key, value);
        match timeout(self.op_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.reset_connection().await;
                Err(store_error(format!("Redis error writing `{key}`: {e}")))
            }
            Err(_) => Err(store_error(format!("Redis timeout writing `{key}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;
    use uuid::Uuid;

    fn persisted(flags: &str, last_check: &str) -> PersistedNotifications {
        PersistedNotifications {
            flags: Some(flags.to_string()),
            last_check: Some(last_check.to_string()),
        }
    }

    #[test]
    fn test_persisted_keys() {
        let orders = persisted(r#"{"orders70":true}"#, "2025-3");
        let value = serde_json::to_value(orders).unwrap();
        assert_eq!(value[FLAGS_KEY], r#"{"orders70":true}"#);
        assert_eq!(value[LAST_CHECK_KEY], "2025-3");

        let empty: PersistedNotifications = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, PersistedNotifications::default());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryNotificationStore::new();
        let tenant = Uuid::now_v7();
        assert_eq!(
            store.load(tenant).await.unwrap(),
            PersistedNotifications::default()
        );

        store
            .save(tenant, &persisted("{}", "2025-3"))
            .await
            .unwrap();
        assert_eq!(
            store.load(tenant).await.unwrap().last_check.as_deref(),
            Some("2025-3")
        );
        assert_eq!(
            store.load(Uuid::now_v7()).await.unwrap(),
            PersistedNotifications::default()
        );
    }

    #[tokio::test]
    async fn test_file_store_keeps_tenants_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications.json");
        let store = FileNotificationStore::new(&path);
        let (first, second) = (Uuid::now_v7(), Uuid::now_v7());

        assert_eq!(
            store.load(first).await.unwrap(),
            PersistedNotifications::default()
        );

        store
            .save(first, &persisted(r#"{"orders70":true}"#, "2025-3"))
            .await
            .unwrap();
        store
            .save(second, &persisted("{}", "2025-4"))
            .await
            .unwrap();

        // a fresh handle on the same path sees both tenants
        let reopened = FileNotificationStore::new(&path);
        assert_eq!(
            reopened.load(first).await.unwrap(),
            persisted(r#"{"orders70":true}"#, "2025-3")
        );
        assert_eq!(
            reopened.load(second).await.unwrap().last_check.as_deref(),
            Some("2025-4")
        );
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_recovers_from_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications.json");
        std::fs::write(&path, "not json at all").unwrap();
        let store = FileNotificationStore::new(&path);
        let tenant = Uuid::now_v7();

        assert!(store.load(tenant).await.is_err());

        store
            .save(tenant, &persisted("{}", "2025-5"))
            .await
            .unwrap();
        assert_eq!(
            store.load(tenant).await.unwrap().last_check.as_deref(),
            Some("2025-5")
        );
        let corrupt_path = path.with_extension("json.corrupt");
        let corrupt = std::fs::read_to_string(corrupt_path).unwrap();
        assert_eq!(corrupt, "not json at all");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_file_store_drops_only_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifications.json");
        let (kept, added) = (Uuid::now_v7(), Uuid::now_v7());
        let document = serde_json::json!({
            (kept.to_string()): persisted(r#"{"orders90":true}"#, "2025-5"),
            "not-a-tenant": persisted("{}", "2025-5"),
            (Uuid::now_v7().to_string()): 42,
        });
        std::fs::write(&path, document.to_string()).unwrap();
        let store = FileNotificationStore::new(&path);

        assert_eq!(
            store.load(kept).await.unwrap(),
            persisted(r#"{"orders90":true}"#, "2025-5")
        );
        assert!(logs_contain("Dropping unreadable entry"));

        store.save(added, &persisted("{}", "2025-5")).await.unwrap();
        assert_eq!(
            store.load(kept).await.unwrap().flags.as_deref(),
            Some(r#"{"orders90":true}"#)
        );
        assert!(!path.with_extension("json.corrupt").exists());
    }

    #[test]
    fn test_redis_keys_are_per_tenant() {
        let store = RedisNotificationStore::new(
            "redis://127.0.0.1:6379",
            "labdesk",
            Duration::from_millis(100),
        )
        .unwrap();
        let tenant = Uuid::nil();
        assert_eq!(
            store.key(tenant),
            "labdesk:freemium:00000000-0000-0000-0000-000000000000"
        );
    }
}
