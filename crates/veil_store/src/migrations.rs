//! Storage schema migrations.
//!
//! Pre-versioning layouts stored invites under `invite/` and user
//! records under `user/<pubkey>` with embedded session states. The v1
//! migration drops the legacy invites (they are republished on next
//! init), rewrites user records under `v1/user/` with sessions blanked
//! but device identities retained, and stamps the version key.
//!
//! Idempotent: a store already at the current version is untouched.

use serde_json::Value;
use tracing::{info, warn};

use crate::{
    keys::{
        user_key, CURRENT_VERSION, LEGACY_INVITE_PREFIX, LEGACY_USER_PREFIX, STORAGE_VERSION_KEY,
    },
    Storage, StoreError,
};

pub async fn run_migrations(storage: &dyn Storage) -> Result<(), StoreError> {
    match storage.get(STORAGE_VERSION_KEY).await? {
        Some(version) if version == CURRENT_VERSION => Ok(()),
        Some(version) => Err(StoreError::Migration(format!(
            "unknown storage version {version:?}"
        ))),
        None => migrate_to_v1(storage).await,
    }
}

async fn migrate_to_v1(storage: &dyn Storage) -> Result<(), StoreError> {
    let legacy_invites = storage.list(LEGACY_INVITE_PREFIX).await?;
    for key in &legacy_invites {
        storage.del(key).await?;
    }

    let legacy_users = storage.list(LEGACY_USER_PREFIX).await?;
    let mut rewritten = 0usize;
    for key in &legacy_users {
        let Some(raw) = storage.get(key).await? else {
            continue;
        };
        let owner_hex = &key[LEGACY_USER_PREFIX.len()..];
        match blank_sessions(&raw) {
            Ok(record) => {
                storage.put(&user_key(owner_hex), record).await?;
                rewritten += 1;
            }
            Err(err) => {
                // Unreadable legacy record: drop it rather than abort the
                // whole migration.
                warn!(%key, %err, "discarding unreadable legacy user record");
            }
        }
        storage.del(key).await?;
    }

    storage
        .put(STORAGE_VERSION_KEY, CURRENT_VERSION.to_string())
        .await?;
    info!(
        invites_dropped = legacy_invites.len(),
        users_rewritten = rewritten,
        "storage migrated to v1"
    );
    Ok(())
}

/// Strip session state from a legacy user record, keeping device
/// identities and the cached known-identity set.
fn blank_sessions(raw: &str) -> Result<String, StoreError> {
    let mut value: Value = serde_json::from_str(raw)?;
    if let Some(devices) = value.get_mut("devices") {
        match devices {
            Value::Object(map) => {
                for device in map.values_mut() {
                    if let Some(obj) = device.as_object_mut() {
                        obj.remove("active_session");
                        obj.remove("inactive_sessions");
                    }
                }
            }
            Value::Array(list) => {
                for device in list.iter_mut() {
                    if let Some(obj) = device.as_object_mut() {
                        obj.remove("active_session");
                        obj.remove("inactive_sessions");
                    }
                }
            }
            _ => {}
        }
    }
    Ok(serde_json::to_string(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use crate::MemoryStorage;

    #[tokio::test]
    async fn fresh_store_gets_stamped() {
        let storage = MemoryStorage::new();
        run_migrations(&storage).await.unwrap();
        assert_eq!(
            storage.get(STORAGE_VERSION_KEY).await.unwrap().as_deref(),
            Some(CURRENT_VERSION)
        );
    }

    #[tokio::test]
    async fn idempotent_on_current_version() {
        let storage = MemoryStorage::new();
        run_migrations(&storage).await.unwrap();
        storage.put("v1/user/aa", "{}".into()).await.unwrap();
        run_migrations(&storage).await.unwrap();
        assert_eq!(storage.get("v1/user/aa").await.unwrap().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn legacy_records_are_rewritten() {
        let storage = MemoryStorage::new();
        storage
            .put("invite/device-1", "legacy".into())
            .await
            .unwrap();
        storage
            .put(
                "user/aabb",
                serde_json::json!({
                    "devices": {
                        "dd": {
                            "device_id": "dd",
                            "active_session": {"root_key": "..."},
                            "inactive_sessions": [{"root_key": "..."}],
                            "created_at": 7
                        }
                    },
                    "known_device_identities": ["dd"]
                })
                .to_string(),
            )
            .await
            .unwrap();

        run_migrations(&storage).await.unwrap();

        assert_eq!(storage.get("invite/device-1").await.unwrap(), None);
        assert_eq!(storage.get("user/aabb").await.unwrap(), None);

        let migrated = storage
            .get(&keys::user_key("aabb"))
            .await
            .unwrap()
            .expect("rewritten record");
        let value: serde_json::Value = serde_json::from_str(&migrated).unwrap();
        let device = &value["devices"]["dd"];
        assert_eq!(device["device_id"], "dd");
        assert_eq!(device["created_at"], 7);
        assert!(device.get("active_session").is_none());
        assert!(device.get("inactive_sessions").is_none());
        assert_eq!(value["known_device_identities"][0], "dd");
    }

    #[tokio::test]
    async fn unknown_version_is_an_error() {
        let storage = MemoryStorage::new();
        storage
            .put(STORAGE_VERSION_KEY, "99".into())
            .await
            .unwrap();
        assert!(run_migrations(&storage).await.is_err());
    }
}
