//! Per-device identity holder.
//!
//! A delegate is any endpoint of an owner: it generates (or restores)
//! its device keypair, publishes its invite, and waits to appear in some
//! owner's AppKeys. Once activated it records the owner pubkey durably
//! and can seed a [`SessionManager`] with its invite credentials.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use veil_crypto::{Keypair, PublicKey};
use veil_proto::{EventSink, RelayTransport, Subscription};
use veil_store::{keys as storage_keys, migrations, Storage};

use crate::app_keys::AppKeys;
use crate::error::{Error, Result};
use crate::invite::Invite;
use crate::session_manager::SessionManager;

/// Outcome of waiting for activation; a timeout is an ordinary outcome,
/// not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Activated(PublicKey),
    TimedOut,
}

pub struct DelegateManager {
    relay: Arc<dyn RelayTransport>,
    storage: Arc<dyn Storage>,
    device: Keypair,
    invite: Option<Invite>,
    owner_tx: Arc<watch::Sender<Option<PublicKey>>>,
    app_keys_sub: Option<Subscription>,
    initialized: bool,
}

impl DelegateManager {
    pub fn new(relay: Arc<dyn RelayTransport>, storage: Arc<dyn Storage>) -> Self {
        let (owner_tx, _) = watch::channel(None);
        Self {
            relay,
            storage,
            device: Keypair::generate(),
            invite: None,
            owner_tx: Arc::new(owner_tx),
            app_keys_sub: None,
            initialized: false,
        }
    }

    /// Restore or create the device identity and invite, publish the
    /// invite, and start listening for an AppKeys event naming this
    /// device. Idempotent.
    pub async fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        migrations::run_migrations(self.storage.as_ref()).await?;

        // Identity: restore, or persist the generated one.
        match self
            .storage
            .get(&storage_keys::device_manager_identity_private_key())
            .await?
        {
            Some(secret_hex) => {
                self.device = Keypair::from_secret_hex(&secret_hex)?;
            }
            None => {
                self.storage
                    .put(
                        &storage_keys::device_manager_identity_private_key(),
                        hex::encode(self.device.secret_bytes()),
                    )
                    .await?;
                self.storage
                    .put(
                        &storage_keys::device_manager_identity_public_key(),
                        self.device.public().to_hex(),
                    )
                    .await?;
            }
        }

        if let Some(owner_hex) = self
            .storage
            .get(&storage_keys::device_manager_owner_key())
            .await?
        {
            if let Ok(owner) = PublicKey::from_hex(&owner_hex) {
                self.owner_tx.send_replace(Some(owner));
            }
        }

        // Invite: restore one matching the identity, otherwise mint.
        let stored_invite = match self
            .storage
            .get(&storage_keys::device_manager_invite_key())
            .await?
        {
            Some(raw) => serde_json::from_str::<Invite>(&raw)
                .ok()
                .filter(|invite| invite.inviter == self.device.public()),
            None => None,
        };
        let invite = match stored_invite {
            Some(invite) => invite,
            None => Invite::create(self.device.public()),
        };
        self.storage
            .put(
                &storage_keys::device_manager_invite_key(),
                serde_json::to_string(&invite)?,
            )
            .await?;

        let invite_event = invite.to_event(&self.device)?;
        self.invite = Some(invite);

        self.subscribe_app_keys();
        self.initialized = true;

        self.relay.publish(invite_event).await?;
        info!(device = %self.device.public(), "delegate initialized");
        Ok(())
    }

    /// Listen for any owner's AppKeys event that includes this device.
    fn subscribe_app_keys(&mut self) {
        let filter = veil_proto::Filter::new()
            .kind(veil_proto::event::REPLACEABLE_KIND)
            .d_tag(veil_proto::event::APP_KEYS_D_TAG);

        let storage = Arc::clone(&self.storage);
        let owner_tx = Arc::clone(&self.owner_tx);
        let device_pubkey = self.device.public();

        let sink: EventSink = Arc::new(move |registry_event| {
            let storage = Arc::clone(&storage);
            let owner_tx = Arc::clone(&owner_tx);
            Box::pin(async move {
                let Ok(app_keys) = AppKeys::from_event(&registry_event) else {
                    debug!("dropping unverifiable app keys event");
                    return;
                };
                if !app_keys.contains(&device_pubkey) {
                    return;
                }
                let owner = registry_event.pubkey;
                if storage
                    .put(&storage_keys::device_manager_owner_key(), owner.to_hex())
                    .await
                    .is_err()
                {
                    debug!("failed to persist owner pubkey");
                }
                owner_tx.send_replace(Some(owner));
                info!(%owner, "delegate activated via app keys");
            })
        });

        self.app_keys_sub = Some(self.relay.subscribe(filter, sink));
    }

    pub fn device_public_key(&self) -> PublicKey {
        self.device.public()
    }

    pub fn invite(&self) -> Option<Invite> {
        self.invite.clone()
    }

    pub fn owner_public_key(&self) -> Option<PublicKey> {
        *self.owner_tx.borrow()
    }

    /// Record the owner when it is already known out of band.
    pub async fn activate(&self, owner: PublicKey) -> Result<()> {
        self.storage
            .put(&storage_keys::device_manager_owner_key(), owner.to_hex())
            .await?;
        self.owner_tx.send_replace(Some(owner));
        Ok(())
    }

    /// Wait until some owner's AppKeys names this device.
    pub async fn wait_for_activation(&self, timeout: Duration) -> Result<Activation> {
        let mut rx = self.owner_tx.subscribe();
        if let Some(owner) = *rx.borrow() {
            return Ok(Activation::Activated(owner));
        }
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                let current = *rx.borrow();
                if current.is_some() {
                    return current;
                }
            }
        })
        .await;
        match waited {
            Ok(Some(owner)) => Ok(Activation::Activated(owner)),
            _ => Ok(Activation::TimedOut),
        }
    }

    /// Supersede the published invite with a fresh ephemeral keypair and
    /// shared secret.
    pub async fn rotate_invite(&mut self) -> Result<Invite> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let invite = Invite::create(self.device.public());
        self.storage
            .put(
                &storage_keys::device_manager_invite_key(),
                serde_json::to_string(&invite)?,
            )
            .await?;
        let invite_event = invite.to_event(&self.device)?;
        self.invite = Some(invite.clone());
        self.relay.publish(invite_event).await?;
        Ok(invite)
    }

    /// A session manager seeded with this device's identity and invite.
    /// Requires activation: fan-out needs the owner pubkey.
    pub fn create_session_manager(&self) -> Result<SessionManager> {
        let owner = self.owner_public_key().ok_or(Error::NotInitialized)?;
        let invite = self.invite.clone().ok_or(Error::NotInitialized)?;
        let device = Keypair::from_secret_bytes(self.device.secret_bytes())?;
        Ok(SessionManager::new(
            device,
            owner,
            invite,
            Arc::clone(&self.relay),
            Arc::clone(&self.storage),
        ))
    }

    /// Release the AppKeys subscription.
    pub fn close(&mut self) {
        self.app_keys_sub = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_proto::MemoryRelay;
    use veil_store::MemoryStorage;

    #[tokio::test]
    async fn identity_and_invite_survive_restart() {
        let relay = MemoryRelay::new();
        let storage = MemoryStorage::new();

        let (device_pk, ephemeral_pk) = {
            let mut delegate =
                DelegateManager::new(Arc::new(relay.clone()), Arc::new(storage.clone()));
            delegate.init().await.unwrap();
            (
                delegate.device_public_key(),
                delegate.invite().unwrap().ephemeral_public,
            )
        };

        let mut restarted =
            DelegateManager::new(Arc::new(relay), Arc::new(storage));
        restarted.init().await.unwrap();
        assert_eq!(restarted.device_public_key(), device_pk);
        assert_eq!(restarted.invite().unwrap().ephemeral_public, ephemeral_pk);
    }

    #[tokio::test]
    async fn init_publishes_the_invite() {
        let relay = MemoryRelay::new();
        let mut delegate = DelegateManager::new(
            Arc::new(relay.clone()),
            Arc::new(MemoryStorage::new()),
        );
        delegate.init().await.unwrap();

        let published = relay.published();
        assert_eq!(published.len(), 1);
        let invite = Invite::from_event(&published[0]).unwrap();
        assert_eq!(invite.inviter, delegate.device_public_key());
    }

    #[tokio::test]
    async fn rotate_invite_supersedes_ephemeral_key() {
        let relay = MemoryRelay::new();
        let mut delegate = DelegateManager::new(
            Arc::new(relay.clone()),
            Arc::new(MemoryStorage::new()),
        );
        delegate.init().await.unwrap();
        let before = delegate.invite().unwrap();

        let rotated = delegate.rotate_invite().await.unwrap();
        assert_ne!(rotated.ephemeral_public, before.ephemeral_public);
        assert_ne!(rotated.shared_secret, before.shared_secret);
        assert_eq!(relay.published().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_activation_times_out_without_app_keys() {
        let mut delegate = DelegateManager::new(
            Arc::new(MemoryRelay::new()),
            Arc::new(MemoryStorage::new()),
        );
        delegate.init().await.unwrap();

        let outcome = delegate
            .wait_for_activation(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, Activation::TimedOut);
    }

    #[tokio::test]
    async fn explicit_activate_persists_owner() {
        let storage = MemoryStorage::new();
        let mut delegate = DelegateManager::new(
            Arc::new(MemoryRelay::new()),
            Arc::new(storage.clone()),
        );
        delegate.init().await.unwrap();

        let owner = Keypair::generate().public();
        delegate.activate(owner).await.unwrap();
        assert_eq!(delegate.owner_public_key(), Some(owner));
        assert_eq!(
            storage
                .get(&storage_keys::device_manager_owner_key())
                .await
                .unwrap()
                .as_deref(),
            Some(owner.to_hex().as_str())
        );
    }
}
