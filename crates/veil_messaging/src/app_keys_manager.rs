//! The owner authority over AppKeys.
//!
//! Holds the owner signing capability and the canonical device set.
//! `add_device`/`revoke_device` mutate and persist local state only;
//! publication is explicit via [`AppKeysManager::publish`] so callers
//! can batch several mutations into one replaceable event.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use veil_crypto::{PublicKey, Signer};
use veil_proto::{Event, RelayTransport};
use veil_store::{keys as storage_keys, Storage};

use crate::app_keys::{AppKeys, DeviceEntry};
use crate::error::Result;

pub struct AppKeysManager {
    signer: Arc<dyn Signer>,
    relay: Arc<dyn RelayTransport>,
    storage: Arc<dyn Storage>,
    app_keys: Mutex<AppKeys>,
}

impl AppKeysManager {
    pub fn new(
        signer: Arc<dyn Signer>,
        relay: Arc<dyn RelayTransport>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            signer,
            relay,
            storage,
            app_keys: Mutex::new(AppKeys::default()),
        }
    }

    /// Load the persisted device set, if any. Idempotent.
    pub async fn init(&self) -> Result<()> {
        if let Some(raw) = self
            .storage
            .get(&storage_keys::device_manager_app_keys_key())
            .await?
        {
            match serde_json::from_str::<AppKeys>(&raw) {
                Ok(stored) => {
                    let mut app_keys = self.app_keys.lock().await;
                    app_keys.merge(&stored);
                }
                Err(err) => {
                    tracing::warn!(%err, "discarding unreadable persisted app keys");
                }
            }
        }
        Ok(())
    }

    pub fn owner_public_key(&self) -> PublicKey {
        self.signer.public_key()
    }

    pub async fn current(&self) -> AppKeys {
        self.app_keys.lock().await.clone()
    }

    /// Replace the whole set.
    pub async fn set_app_keys(&self, entries: Vec<DeviceEntry>) -> Result<()> {
        let replacement = AppKeys::new(entries);
        {
            let mut app_keys = self.app_keys.lock().await;
            *app_keys = replacement;
        }
        self.persist().await
    }

    pub async fn add_device(&self, entry: DeviceEntry) -> Result<()> {
        {
            let mut app_keys = self.app_keys.lock().await;
            app_keys.add(entry);
        }
        info!(device = %entry.identity_pubkey, "device added to app keys");
        self.persist().await
    }

    pub async fn revoke_device(&self, identity_pubkey: &PublicKey) -> Result<bool> {
        let removed = {
            let mut app_keys = self.app_keys.lock().await;
            app_keys.remove(identity_pubkey)
        };
        if removed {
            info!(device = %identity_pubkey, "device revoked from app keys");
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Sign and publish the current set as one replaceable event.
    pub async fn publish(&self) -> Result<Event> {
        let registry_event = {
            let app_keys = self.app_keys.lock().await;
            app_keys.to_event(self.signer.as_ref())?
        };
        self.relay.publish(registry_event.clone()).await?;
        Ok(registry_event)
    }

    async fn persist(&self) -> Result<()> {
        let serialized = {
            let app_keys = self.app_keys.lock().await;
            serde_json::to_string(&*app_keys)?
        };
        self.storage
            .put(&storage_keys::device_manager_app_keys_key(), serialized)
            .await?;
        Ok(())
    }
}
