//! The per-device orchestrator.
//!
//! Wires discovery, handshake, fan-out, receive dispatch, persistence,
//! and restart recovery together:
//!
//! - `setup_user` subscribes to an owner's AppKeys channel; every
//!   AppKeys event updates the cached device set and subscribes to each
//!   device's invite channel.
//! - An incoming invite is accepted at most once per device (guarded by
//!   a pending flag); acceptance attaches an *active* initiator session
//!   and publishes the sealed response.
//! - The invite-response listener authorizes the responding device
//!   against the claimed owner's AppKeys (live, with a bounded wait, or
//!   the cached snapshot) and attaches an *inactive* responder session.
//! - `send_message` queues the rumor in per-owner history, then fans out
//!   through every active session of the recipient's and our own
//!   devices, excluding this device.
//! - A session is promoted to active on its first decrypt; promotion
//!   demotes the prior active session and replays queued history.
//!
//! Locking discipline: one async mutex serializes all mutation, and no
//! publish ever happens while it is held — operations collect an outbox
//! under the lock and publish after releasing it. Ratchet state is
//! persisted before the envelope is published (send) or the rumor is
//! delivered (receive); a failed write rolls the in-memory state back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use veil_crypto::{Keypair, PublicKey};
use veil_proto::event::{self, Event, Rumor};
use veil_proto::{EventSink, RelayTransport, Subscription};
use veil_store::{keys as storage_keys, migrations, Storage};

use crate::app_keys::{AppKeys, DeviceEntry};
use crate::error::{Error, Result};
use crate::invite::Invite;
use crate::records::{StoredUserRecord, UserRecord};
use crate::session::Session;
use crate::session_state::SessionState;
use crate::APP_KEYS_FETCH_TIMEOUT;

// ── Public option/result types ───────────────────────────────────────────────

/// Options for [`SessionManager::send_message`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Rumor kind; defaults to the chat-message kind.
    pub kind: Option<u16>,
    pub tags: Vec<Vec<String>>,
    /// Unix seconds after which the message may be discarded; carried
    /// as an `expiration` tag inside the rumor.
    pub expires_at: Option<u64>,
}

/// Snapshot of one peer device's session situation, for callers and
/// tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub device_id: PublicKey,
    pub has_active_session: bool,
    pub inactive_sessions: usize,
}

type EventCallback = Arc<dyn Fn(&Rumor, PublicKey) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    events: Vec<(u64, EventCallback)>,
    errors: Vec<(u64, ErrorCallback)>,
}

enum ListenerKind {
    Event,
    Error,
}

/// Registration handle returned by `on_event`/`on_error`; dropping it
/// unsubscribes the callback.
pub struct ListenerHandle {
    id: u64,
    kind: ListenerKind,
    listeners: Weak<StdMutex<Listeners>>,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut guard = listeners.lock().unwrap();
            match self.kind {
                ListenerKind::Event => guard.events.retain(|(id, _)| *id != self.id),
                ListenerKind::Error => guard.errors.retain(|(id, _)| *id != self.id),
            }
        }
    }
}

// ── Internal wiring ──────────────────────────────────────────────────────────

/// Subscription registry key; makes `close()` exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Purpose {
    InviteResponses,
    AppKeys(PublicKey),
    DeviceInvite(PublicKey, PublicKey),
}

enum Incoming {
    InviteResponse(Event),
    AppKeys {
        owner: PublicKey,
        received: Event,
    },
    DeviceInvite {
        owner: PublicKey,
        device: PublicKey,
        received: Event,
    },
    SessionMessage {
        owner: PublicKey,
        device: PublicKey,
        received: Event,
    },
}

struct Inner {
    initialized: bool,
    closed: bool,
    user_records: HashMap<PublicKey, UserRecord>,
    /// Per-owner rumors queued for devices that come online later.
    message_history: HashMap<PublicKey, Vec<Rumor>>,
    /// Handshake envelope ids already turned into sessions. Rehydrated
    /// from stored session names at init.
    processed_invite_responses: HashSet<String>,
    /// Devices with an invite acceptance in flight.
    pending_accepts: HashSet<PublicKey>,
    subscriptions: HashMap<Purpose, Subscription>,
    /// Latest AppKeys `created_at` seen per owner (replaceable-event
    /// ordering: largest wins, ties to latest received).
    app_keys_created_at: HashMap<PublicKey, u64>,
    /// Wakes invite-response authorization waiting on fresh AppKeys.
    app_keys_notify: HashMap<PublicKey, Arc<Notify>>,
}

struct Core {
    device: Keypair,
    owner: PublicKey,
    invite: Invite,
    relay: Arc<dyn RelayTransport>,
    storage: Arc<dyn Storage>,
    inner: Mutex<Inner>,
    listeners: Arc<StdMutex<Listeners>>,
}

pub struct SessionManager {
    core: Arc<Core>,
}

impl SessionManager {
    /// `invite` must carry the ephemeral secret — it is this device's
    /// own published invite, used to decrypt responses.
    pub fn new(
        device: Keypair,
        owner: PublicKey,
        invite: Invite,
        relay: Arc<dyn RelayTransport>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                device,
                owner,
                invite,
                relay,
                storage,
                inner: Mutex::new(Inner {
                    initialized: false,
                    closed: false,
                    user_records: HashMap::new(),
                    message_history: HashMap::new(),
                    processed_invite_responses: HashSet::new(),
                    pending_accepts: HashSet::new(),
                    subscriptions: HashMap::new(),
                    app_keys_created_at: HashMap::new(),
                    app_keys_notify: HashMap::new(),
                }),
                listeners: Arc::new(StdMutex::new(Listeners::default())),
            }),
        }
    }

    pub fn device_public_key(&self) -> PublicKey {
        self.core.device.public()
    }

    pub fn owner_public_key(&self) -> PublicKey {
        self.core.owner
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Run migrations, load persisted state, start the invite-response
    /// listener, publish our invite, and begin sibling discovery.
    /// Idempotent; a storage read failure here is fatal.
    pub async fn init(&self) -> Result<()> {
        let core = &self.core;
        let invite_event;
        {
            let mut inner = core.inner.lock().await;
            if inner.initialized {
                return Ok(());
            }

            migrations::run_migrations(core.storage.as_ref()).await?;
            Core::load_state(core, &mut inner).await?;

            // Seed our own device record under our owner so we never
            // accept an invite from ourselves.
            inner
                .user_records
                .entry(core.owner)
                .or_insert_with(|| UserRecord::new(core.owner))
                .ensure_device(core.device.public(), event::unix_seconds());

            let sink = Core::sink(core, Incoming::InviteResponse);
            let sub = core.relay.subscribe(core.invite.response_filter(), sink);
            inner.subscriptions.insert(Purpose::InviteResponses, sub);

            Core::setup_user_locked(core, &mut inner, core.owner);

            invite_event = core.invite.to_event(&core.device)?;
            inner.initialized = true;
        }

        if let Err(err) = core.relay.publish(invite_event).await {
            warn!(%err, "failed to publish our invite");
        }
        info!(device = %core.device.public(), owner = %core.owner, "session manager initialized");
        Ok(())
    }

    /// Release every transport subscription. Persisted state is not
    /// touched.
    pub async fn close(&self) {
        let mut inner = self.core.inner.lock().await;
        inner.closed = true;
        inner.subscriptions.clear();
        for record in inner.user_records.values_mut() {
            record.close();
        }
    }

    // ── Callbacks ────────────────────────────────────────────────────────

    /// Register a receiver of decrypted rumors. Fires strictly after
    /// the originating session's ratchet step is committed.
    pub fn on_event(
        &self,
        callback: impl Fn(&Rumor, PublicKey) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let mut listeners = self.core.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.events.push((id, Arc::new(callback)));
        ListenerHandle {
            id,
            kind: ListenerKind::Event,
            listeners: Arc::downgrade(&self.core.listeners),
        }
    }

    /// Register a receiver of non-fatal errors (storage write failures
    /// and the like).
    pub fn on_error(
        &self,
        callback: impl Fn(&Error) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let mut listeners = self.core.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.errors.push((id, Arc::new(callback)));
        ListenerHandle {
            id,
            kind: ListenerKind::Error,
            listeners: Arc::downgrade(&self.core.listeners),
        }
    }

    // ── Messaging ────────────────────────────────────────────────────────

    /// Queue and fan out a message to every non-sender device of the
    /// recipient and of our own owner. Returns the rumor; a returned
    /// rumor means queued, not delivered. Devices without an active
    /// session are skipped — history replays to them once a session
    /// becomes active.
    pub async fn send_message(
        &self,
        recipient: PublicKey,
        content: &str,
        options: SendOptions,
    ) -> Result<Rumor> {
        let core = &self.core;

        let kind = options.kind.unwrap_or(event::CHAT_MESSAGE_KIND);
        let mut tags = options.tags;
        if !tags.iter().any(|t| t.first().map(String::as_str) == Some("p")) {
            tags.push(vec!["p".to_string(), recipient.to_hex()]);
        }
        if !tags.iter().any(|t| t.first().map(String::as_str) == Some("ms")) {
            tags.push(vec!["ms".to_string(), event::unix_millis().to_string()]);
        }
        if let Some(expires_at) = options.expires_at {
            if !tags
                .iter()
                .any(|t| t.first().map(String::as_str) == Some(event::EXPIRATION_TAG))
            {
                tags.push(vec![event::EXPIRATION_TAG.to_string(), expires_at.to_string()]);
            }
        }
        let rumor = Rumor::new(
            core.device.public(),
            kind,
            content,
            tags,
            event::unix_seconds(),
        );

        let mut outbox = Vec::new();
        {
            let mut inner = core.inner.lock().await;
            if !inner.initialized {
                return Err(Error::NotInitialized);
            }

            inner
                .message_history
                .entry(recipient)
                .or_default()
                .push(rumor.clone());
            if recipient != core.owner {
                inner
                    .message_history
                    .entry(core.owner)
                    .or_default()
                    .push(rumor.clone());
            }
            if let Err(err) = Core::persist_history(core, &inner, &recipient).await {
                Core::emit_error(core, &err);
            }
            if recipient != core.owner {
                if let Err(err) = Core::persist_history(core, &inner, &core.owner).await {
                    Core::emit_error(core, &err);
                }
            }

            Core::setup_user_locked(core, &mut inner, recipient);
            Core::setup_user_locked(core, &mut inner, core.owner);

            // Fan out: union of both owners' devices, excluding this
            // device, deduplicated.
            let our_device = core.device.public();
            let mut targets = vec![recipient];
            if core.owner != recipient {
                targets.push(core.owner);
            }
            let mut seen: HashSet<PublicKey> = HashSet::new();
            for target_owner in targets {
                let Some(record) = inner.user_records.get_mut(&target_owner) else {
                    continue;
                };
                for (device_id, device_record) in record.devices.iter_mut() {
                    if *device_id == our_device || !seen.insert(*device_id) {
                        continue;
                    }
                    let Some(session) = device_record.active_session.as_mut() else {
                        continue;
                    };
                    let before = session.state.clone();
                    match session.send(&rumor) {
                        Ok(envelope) => {
                            if let Err(err) =
                                Core::persist_session(core, &target_owner, device_id, session)
                                    .await
                            {
                                session.state = before;
                                warn!(%err, device = %device_id, "ratchet persist failed; send skipped");
                                Core::emit_error(core, &err);
                                continue;
                            }
                            outbox.push(envelope);
                        }
                        Err(Error::SessionNotReady) => {}
                        Err(err) => {
                            debug!(%err, device = %device_id, "session skipped in fan-out");
                        }
                    }
                }
            }
        }

        for envelope in outbox {
            if let Err(err) = core.relay.publish(envelope).await {
                // The rumor stays in history; delivery retries on the
                // next session establishment.
                debug!(%err, "fan-out publish failed");
            }
        }
        Ok(rumor)
    }

    // ── Discovery ────────────────────────────────────────────────────────

    /// Subscribe to an owner's AppKeys channel and, through it, to their
    /// devices' invites. Idempotent.
    pub async fn setup_user(&self, owner: PublicKey) -> Result<()> {
        let core = &self.core;
        let mut inner = core.inner.lock().await;
        if !inner.initialized {
            return Err(Error::NotInitialized);
        }
        Core::setup_user_locked(core, &mut inner, owner);
        Ok(())
    }

    /// Close all sessions with an owner, drop every related
    /// subscription, and delete the persisted records.
    pub async fn delete_user(&self, owner: PublicKey) -> Result<()> {
        let core = &self.core;
        let mut inner = core.inner.lock().await;
        if let Some(mut record) = inner.user_records.remove(&owner) {
            record.close();
        }
        inner.subscriptions.remove(&Purpose::AppKeys(owner));
        inner
            .subscriptions
            .retain(|purpose, _| !matches!(purpose, Purpose::DeviceInvite(o, _) if *o == owner));
        inner.app_keys_notify.remove(&owner);
        inner.app_keys_created_at.remove(&owner);
        inner.message_history.remove(&owner);

        let owner_hex = owner.to_hex();
        core.storage.del(&storage_keys::user_key(&owner_hex)).await?;
        core.storage
            .del(&storage_keys::history_key(&owner_hex))
            .await?;
        for key in core
            .storage
            .list(&storage_keys::owner_sessions_prefix(&owner_hex))
            .await?
        {
            core.storage.del(&key).await?;
        }
        info!(%owner, "user deleted");
        Ok(())
    }

    // ── Manual event dispatch ────────────────────────────────────────────

    /// Feed a received event directly, bypassing transport
    /// subscriptions. Used by embedders that drive their own relay
    /// connection, and by tests.
    pub async fn process_received_event(&self, received: Event) {
        let core = &self.core;
        match received.kind {
            event::INVITE_RESPONSE_KIND => {
                Core::handle_incoming(core, Incoming::InviteResponse(received)).await;
            }
            event::REPLACEABLE_KIND => {
                let d_tag = received.tag_value("d").unwrap_or("").to_string();
                if d_tag == event::APP_KEYS_D_TAG {
                    let owner = received.pubkey;
                    Core::handle_incoming(core, Incoming::AppKeys { owner, received }).await;
                } else if d_tag.starts_with(event::INVITE_D_TAG_PREFIX) {
                    let device = received.pubkey;
                    let owner = {
                        let inner = core.inner.lock().await;
                        inner
                            .user_records
                            .iter()
                            .find(|(_, r)| r.known_device_identities.contains(&device))
                            .map(|(owner, _)| *owner)
                    };
                    if let Some(owner) = owner {
                        Core::handle_incoming(
                            core,
                            Incoming::DeviceInvite {
                                owner,
                                device,
                                received,
                            },
                        )
                        .await;
                    }
                }
            }
            event::MESSAGE_KIND => {
                Core::handle_any_session_message(core, received).await;
            }
            _ => {}
        }
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub async fn device_summaries(&self, owner: &PublicKey) -> Vec<DeviceSummary> {
        let inner = self.core.inner.lock().await;
        let Some(record) = inner.user_records.get(owner) else {
            return Vec::new();
        };
        let mut summaries: Vec<DeviceSummary> = record
            .devices
            .values()
            .map(|d| DeviceSummary {
                device_id: d.device_id,
                has_active_session: d.active_session.is_some(),
                inactive_sessions: d.inactive_sessions.len(),
            })
            .collect();
        summaries.sort_by_key(|s| s.device_id);
        summaries
    }

    pub async fn known_device_identities(&self, owner: &PublicKey) -> Vec<PublicKey> {
        let inner = self.core.inner.lock().await;
        let mut devices: Vec<PublicKey> = inner
            .user_records
            .get(owner)
            .map(|r| r.known_device_identities.iter().copied().collect())
            .unwrap_or_default();
        devices.sort();
        devices
    }
}

// ── Core internals ───────────────────────────────────────────────────────────

impl Core {
    /// Wrap a classifier into an async transport sink. Sinks hold a weak
    /// reference so dropping the manager tears everything down.
    fn sink<F>(core: &Arc<Core>, classify: F) -> EventSink
    where
        F: Fn(Event) -> Incoming + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(core);
        Arc::new(move |received| {
            let weak = weak.clone();
            let incoming = classify(received);
            Box::pin(async move {
                if let Some(core) = weak.upgrade() {
                    Core::handle_incoming(&core, incoming).await;
                }
            })
        })
    }

    fn session_sink(core: &Arc<Core>, owner: PublicKey, device: PublicKey) -> EventSink {
        Core::sink(core, move |received| Incoming::SessionMessage {
            owner,
            device,
            received,
        })
    }

    async fn handle_incoming(core: &Arc<Core>, incoming: Incoming) {
        let outcome = match incoming {
            Incoming::InviteResponse(received) => {
                Core::handle_invite_response(core, received).await
            }
            Incoming::AppKeys { owner, received } => {
                Core::handle_app_keys(core, owner, received).await
            }
            Incoming::DeviceInvite {
                owner,
                device,
                received,
            } => Core::handle_device_invite(core, owner, device, received).await,
            Incoming::SessionMessage {
                owner,
                device,
                received,
            } => Core::handle_session_message(core, owner, device, received).await,
        };
        match outcome {
            Ok(()) => {}
            Err(Error::Undecryptable(reason)) => {
                debug!(reason, "dropping undecryptable event");
            }
            Err(err @ Error::Storage(_)) => {
                warn!(%err, "storage failure while handling event");
                Core::emit_error(core, &err);
            }
            Err(err) => {
                debug!(%err, "dropping event");
            }
        }
    }

    // ── Discovery: AppKeys ───────────────────────────────────────────────

    fn setup_user_locked(core: &Arc<Core>, inner: &mut Inner, owner: PublicKey) {
        if inner.subscriptions.contains_key(&Purpose::AppKeys(owner)) {
            return;
        }
        inner
            .app_keys_notify
            .entry(owner)
            .or_insert_with(|| Arc::new(Notify::new()));
        let sink = Core::sink(core, move |received| Incoming::AppKeys { owner, received });
        let sub = core.relay.subscribe(AppKeys::filter_for_owner(owner), sink);
        inner.subscriptions.insert(Purpose::AppKeys(owner), sub);
        debug!(%owner, "subscribed to app keys channel");
    }

    async fn handle_app_keys(
        core: &Arc<Core>,
        owner: PublicKey,
        received: Event,
    ) -> Result<()> {
        if received.pubkey != owner {
            return Err(Error::InvalidEvent("app keys author mismatch".into()));
        }
        let app_keys = AppKeys::from_event(&received)?;

        let mut inner = core.inner.lock().await;
        if inner.closed || !inner.initialized {
            return Ok(());
        }

        if inner
            .app_keys_created_at
            .get(&owner)
            .is_some_and(|&seen| received.created_at < seen)
        {
            debug!(%owner, "ignoring stale app keys event");
            return Ok(());
        }
        inner.app_keys_created_at.insert(owner, received.created_at);

        let our_device = core.device.public();
        let authorized: Vec<DeviceEntry> = app_keys.devices().copied().collect();
        let authorized_set: HashSet<PublicKey> =
            authorized.iter().map(|e| e.identity_pubkey).collect();

        let removed: Vec<PublicKey> = {
            let record = inner
                .user_records
                .entry(owner)
                .or_insert_with(|| UserRecord::new(owner));
            record.known_device_identities = authorized_set.clone();

            let removed: Vec<PublicKey> = record
                .devices
                .keys()
                .filter(|d| !authorized_set.contains(*d) && **d != our_device)
                .copied()
                .collect();
            for device in &removed {
                if let Some(mut dropped) = record.devices.remove(device) {
                    dropped.close();
                }
                info!(%owner, %device, "device no longer authorized; record removed");
            }
            for entry in &authorized {
                if entry.identity_pubkey != our_device {
                    record.ensure_device(entry.identity_pubkey, entry.created_at);
                }
            }
            removed
        };

        for device in &removed {
            inner
                .subscriptions
                .remove(&Purpose::DeviceInvite(owner, *device));
        }
        for entry in &authorized {
            let device = entry.identity_pubkey;
            if device == our_device {
                continue;
            }
            let purpose = Purpose::DeviceInvite(owner, device);
            if let std::collections::hash_map::Entry::Vacant(slot) =
                inner.subscriptions.entry(purpose)
            {
                let sink = Core::sink(core, move |received| Incoming::DeviceInvite {
                    owner,
                    device,
                    received,
                });
                slot.insert(core.relay.subscribe(Invite::filter_for_device(device), sink));
            }
        }

        Core::persist_user_record(core, &inner, &owner).await?;
        for device in &removed {
            let prefix =
                storage_keys::device_sessions_prefix(&owner.to_hex(), &device.to_hex());
            if let Ok(keys) = core.storage.list(&prefix).await {
                for key in keys {
                    let _ = core.storage.del(&key).await;
                }
            }
        }

        if let Some(notify) = inner.app_keys_notify.get(&owner) {
            notify.notify_waiters();
        }
        Ok(())
    }

    // ── Handshake: their invite, our acceptance ──────────────────────────

    async fn handle_device_invite(
        core: &Arc<Core>,
        owner: PublicKey,
        device: PublicKey,
        received: Event,
    ) -> Result<()> {
        let invite = Invite::from_event(&received)?;
        if invite.inviter != device {
            return Err(Error::Invite("invite author mismatch".into()));
        }
        if device == core.device.public() {
            return Ok(());
        }

        let mut outbox = Vec::new();
        {
            let mut inner = core.inner.lock().await;
            if inner.closed || !inner.initialized {
                return Ok(());
            }

            let authorized = inner
                .user_records
                .get(&owner)
                .is_some_and(|r| r.known_device_identities.contains(&device));
            if !authorized {
                return Err(Error::Unauthorized(format!(
                    "invite from device {device} not in app keys of {owner}"
                )));
            }

            let has_active = inner
                .user_records
                .get(&owner)
                .and_then(|r| r.devices.get(&device))
                .is_some_and(|d| d.active_session.is_some());
            if has_active || inner.pending_accepts.contains(&device) {
                return Ok(());
            }
            inner.pending_accepts.insert(device);

            let accepted = invite.accept(&core.device, core.owner);
            let (mut session, response) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    inner.pending_accepts.remove(&device);
                    return Err(err);
                }
            };

            let sink = Core::session_sink(core, owner, device);
            session.sync_subscriptions(core.relay.as_ref(), &sink);

            if let Err(err) = Core::persist_session(core, &owner, &device, &session).await {
                inner.pending_accepts.remove(&device);
                return Err(err);
            }

            let session_name = session.name.clone();
            let trimmed = {
                let record = inner
                    .user_records
                    .entry(owner)
                    .or_insert_with(|| UserRecord::new(owner));
                let device_record = record.ensure_device(device, invite.created_at);
                device_record.attach_active(session)
            };
            inner.pending_accepts.remove(&device);
            inner.processed_invite_responses.insert(session_name);

            Core::delete_session_records(core, &owner, &device, &trimmed).await;
            Core::persist_user_record(core, &inner, &owner).await?;

            info!(%owner, %device, "accepted invite; session active");
            outbox.push(response);

            let drained = Core::drain_history(core, &mut inner, owner, device).await?;
            outbox.extend(drained);
        }

        for envelope in outbox {
            if let Err(err) = core.relay.publish(envelope).await {
                debug!(%err, "publish failed after invite acceptance");
            }
        }
        Ok(())
    }

    // ── Handshake: their acceptance of our invite ────────────────────────

    async fn handle_invite_response(core: &Arc<Core>, received: Event) -> Result<()> {
        {
            let inner = core.inner.lock().await;
            if inner.closed || !inner.initialized {
                return Ok(());
            }
            if inner.processed_invite_responses.contains(&received.id) {
                return Ok(());
            }
        }

        let response = core.invite.process_response(&received, &core.device)?;
        let invitee = response.invitee_identity;
        if invitee == core.device.public() {
            return Ok(());
        }
        let claimed_owner = response.owner.unwrap_or(invitee);

        // The responding device must be in the claimed owner's AppKeys
        // (fetched with a bounded wait, or the cached snapshot), unless
        // the device is the owner itself.
        let authorized = Core::authorize_device(core, claimed_owner, invitee).await;
        if !authorized && invitee != claimed_owner {
            return Err(Error::Unauthorized(format!(
                "invite response from {invitee} not authorized by {claimed_owner}"
            )));
        }

        let mut session = response.session;
        {
            let mut inner = core.inner.lock().await;
            if inner.closed {
                return Ok(());
            }
            // Re-check after the authorization await.
            if inner.processed_invite_responses.contains(&received.id) {
                return Ok(());
            }

            let sink = Core::session_sink(core, claimed_owner, invitee);
            session.sync_subscriptions(core.relay.as_ref(), &sink);

            Core::persist_session(core, &claimed_owner, &invitee, &session).await?;

            {
                let record = inner
                    .user_records
                    .entry(claimed_owner)
                    .or_insert_with(|| UserRecord::new(claimed_owner));
                let device_record = record.ensure_device(invitee, event::unix_seconds());
                let trimmed = device_record.attach_inactive(session);
                Core::delete_session_records(core, &claimed_owner, &invitee, &trimmed).await;
            }
            inner.processed_invite_responses.insert(received.id.clone());
            Core::persist_user_record(core, &inner, &claimed_owner).await?;
        }
        info!(owner = %claimed_owner, device = %invitee, "invite response accepted; session pending first message");
        Ok(())
    }

    /// Check the device against the owner's known identities, waiting a
    /// bounded time for a fresh AppKeys event when the cache has no
    /// answer yet.
    async fn authorize_device(core: &Arc<Core>, owner: PublicKey, device: PublicKey) -> bool {
        let notify = {
            let mut inner = core.inner.lock().await;
            if inner
                .user_records
                .get(&owner)
                .is_some_and(|r| r.known_device_identities.contains(&device))
            {
                return true;
            }
            Core::setup_user_locked(core, &mut inner, owner);
            Arc::clone(
                inner
                    .app_keys_notify
                    .entry(owner)
                    .or_insert_with(|| Arc::new(Notify::new())),
            )
        };

        let _ = tokio::time::timeout(APP_KEYS_FETCH_TIMEOUT, notify.notified()).await;

        let inner = core.inner.lock().await;
        inner
            .user_records
            .get(&owner)
            .is_some_and(|r| r.known_device_identities.contains(&device))
    }

    // ── Receive dispatch ─────────────────────────────────────────────────

    async fn handle_session_message(
        core: &Arc<Core>,
        owner: PublicKey,
        device: PublicKey,
        received: Event,
    ) -> Result<()> {
        let mut outbox = Vec::new();
        let emitted: (Rumor, PublicKey);
        {
            let mut inner = core.inner.lock().await;
            if inner.closed || !inner.initialized {
                return Ok(());
            }

            let sink = Core::session_sink(core, owner, device);

            // Find the session that decrypts this envelope; persist the
            // advanced ratchet before anything is emitted.
            let decrypted: Option<(String, Rumor)> = {
                let Some(record) = inner.user_records.get_mut(&owner) else {
                    return Err(Error::Undecryptable("no user record"));
                };
                let Some(device_record) = record.devices.get_mut(&device) else {
                    return Err(Error::Undecryptable("no device record"));
                };

                let mut found = None;
                for session in device_record.sessions_mut() {
                    let before = session.state.clone();
                    match session.receive(&received) {
                        Ok(rumor) => {
                            if let Err(err) =
                                Core::persist_session(core, &owner, &device, session).await
                            {
                                session.state = before;
                                return Err(err);
                            }
                            session.sync_subscriptions(core.relay.as_ref(), &sink);
                            found = Some((session.name.clone(), rumor));
                            break;
                        }
                        Err(err) => {
                            debug!(%err, session = %session.name, "session did not decrypt envelope");
                        }
                    }
                }
                found
            };

            let Some((session_name, rumor)) = decrypted else {
                return Err(Error::Undecryptable("no session accepted the envelope"));
            };

            // First decrypt on a non-active session promotes it.
            let became_active = {
                let record = inner
                    .user_records
                    .get_mut(&owner)
                    .ok_or(Error::Undecryptable("no user record"))?;
                let device_record = record
                    .devices
                    .get_mut(&device)
                    .ok_or(Error::Undecryptable("no device record"))?;
                let was_active = device_record
                    .active_session
                    .as_ref()
                    .is_some_and(|s| s.name == session_name);
                if !was_active {
                    let trimmed = device_record.promote(&session_name);
                    Core::delete_session_records(core, &owner, &device, &trimmed).await;
                }
                !was_active
            };

            if became_active {
                info!(%owner, %device, session = %session_name, "session promoted to active");
                Core::persist_user_record(core, &inner, &owner).await?;
                let drained = Core::drain_history(core, &mut inner, owner, device).await?;
                outbox.extend(drained);
            }

            emitted = (rumor, owner);
        }

        for envelope in outbox {
            if let Err(err) = core.relay.publish(envelope).await {
                debug!(%err, "history drain publish failed");
            }
        }
        Core::emit_rumor(core, &emitted.0, emitted.1);
        Ok(())
    }

    /// Manual-dispatch fallback: try the envelope against every known
    /// device record until one decrypts it.
    async fn handle_any_session_message(core: &Arc<Core>, received: Event) {
        let pairs: Vec<(PublicKey, PublicKey)> = {
            let inner = core.inner.lock().await;
            inner
                .user_records
                .iter()
                .flat_map(|(owner, record)| {
                    record.devices.keys().map(move |device| (*owner, *device))
                })
                .collect()
        };
        for (owner, device) in pairs {
            match Core::handle_session_message(core, owner, device, received.clone()).await {
                Ok(()) => return,
                Err(Error::Undecryptable(_)) => continue,
                Err(err) => {
                    debug!(%err, "session message dispatch failed");
                    Core::emit_error(core, &err);
                    return;
                }
            }
        }
        debug!("session envelope matched no session");
    }

    /// Replay queued history through the newly active session of
    /// `(owner, device)`. History is retained so devices discovered
    /// later also receive missed messages.
    async fn drain_history(
        core: &Arc<Core>,
        inner: &mut Inner,
        owner: PublicKey,
        device: PublicKey,
    ) -> Result<Vec<Event>> {
        let rumors = match inner.message_history.get(&owner) {
            Some(rumors) if !rumors.is_empty() => rumors.clone(),
            _ => return Ok(Vec::new()),
        };
        let Some(record) = inner.user_records.get_mut(&owner) else {
            return Ok(Vec::new());
        };
        let Some(device_record) = record.devices.get_mut(&device) else {
            return Ok(Vec::new());
        };
        let Some(session) = device_record.active_session.as_mut() else {
            return Ok(Vec::new());
        };

        let before = session.state.clone();
        let mut envelopes = Vec::with_capacity(rumors.len());
        for rumor in &rumors {
            match session.send(rumor) {
                Ok(envelope) => envelopes.push(envelope),
                Err(err) => {
                    debug!(%err, "stopping history drain");
                    break;
                }
            }
        }
        if envelopes.is_empty() {
            return Ok(Vec::new());
        }
        if let Err(err) = Core::persist_session(core, &owner, &device, session).await {
            session.state = before;
            return Err(err);
        }
        info!(count = envelopes.len(), %owner, %device, "replayed queued history");
        Ok(envelopes)
    }

    // ── Persistence ──────────────────────────────────────────────────────

    async fn load_state(core: &Arc<Core>, inner: &mut Inner) -> Result<()> {
        let user_keys = core.storage.list(storage_keys::USER_PREFIX).await?;
        for key in user_keys {
            let Some(raw) = core.storage.get(&key).await? else {
                continue;
            };
            let stored: StoredUserRecord = match serde_json::from_str(&raw) {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(%key, %err, "discarding corrupt user record");
                    continue;
                }
            };

            let mut record = UserRecord::new(stored.owner);
            record.known_device_identities =
                stored.known_device_identities.iter().copied().collect();

            for stored_device in stored.devices {
                let mut active = None;
                if let Some(ref name) = stored_device.active_session {
                    active =
                        Core::load_session(core, &stored.owner, &stored_device.device_id, name)
                            .await?;
                }
                let mut inactive = Vec::new();
                for name in &stored_device.inactive_sessions {
                    if let Some(session) =
                        Core::load_session(core, &stored.owner, &stored_device.device_id, name)
                            .await?
                    {
                        inactive.push(session);
                    }
                }

                let device_record =
                    record.ensure_device(stored_device.device_id, stored_device.created_at);
                // Rebuild LRU order: oldest attaches first.
                for session in inactive.into_iter().rev() {
                    inner.processed_invite_responses.insert(session.name.clone());
                    device_record.attach_inactive(session);
                }
                if let Some(session) = active {
                    inner.processed_invite_responses.insert(session.name.clone());
                    device_record.attach_active(session);
                }
            }
            inner.user_records.insert(stored.owner, record);
        }

        // Reconnect loaded sessions to the transport.
        let pairs: Vec<(PublicKey, PublicKey)> = inner
            .user_records
            .iter()
            .flat_map(|(owner, record)| {
                record.devices.keys().map(move |device| (*owner, *device))
            })
            .collect();
        for (owner, device) in pairs {
            let sink = Core::session_sink(core, owner, device);
            if let Some(device_record) = inner
                .user_records
                .get_mut(&owner)
                .and_then(|r| r.devices.get_mut(&device))
            {
                for session in device_record.sessions_mut() {
                    session.sync_subscriptions(core.relay.as_ref(), &sink);
                }
            }
        }

        let history_keys = core.storage.list(storage_keys::HISTORY_PREFIX).await?;
        for key in history_keys {
            let Some(raw) = core.storage.get(&key).await? else {
                continue;
            };
            let owner_hex = &key[storage_keys::HISTORY_PREFIX.len()..];
            let Ok(owner) = PublicKey::from_hex(owner_hex) else {
                continue;
            };
            match serde_json::from_str::<Vec<Rumor>>(&raw) {
                Ok(rumors) => {
                    inner.message_history.insert(owner, rumors);
                }
                Err(err) => {
                    warn!(%key, %err, "discarding corrupt message history");
                }
            }
        }
        Ok(())
    }

    async fn load_session(
        core: &Arc<Core>,
        owner: &PublicKey,
        device: &PublicKey,
        name: &str,
    ) -> Result<Option<Session>> {
        let key = storage_keys::session_key(&owner.to_hex(), &device.to_hex(), name);
        let Some(raw) = core.storage.get(&key).await? else {
            warn!(%key, "session state missing; dropping session");
            return Ok(None);
        };
        match serde_json::from_str::<SessionState>(&raw) {
            Ok(state) => Ok(Some(Session::new(state, name))),
            Err(err) => {
                warn!(%key, %err, "discarding corrupt session state");
                Ok(None)
            }
        }
    }

    async fn persist_session(
        core: &Arc<Core>,
        owner: &PublicKey,
        device: &PublicKey,
        session: &Session,
    ) -> Result<()> {
        let key = storage_keys::session_key(&owner.to_hex(), &device.to_hex(), &session.name);
        let serialized = serde_json::to_string(&session.state)?;
        core.storage.put(&key, serialized).await?;
        Ok(())
    }

    async fn persist_user_record(core: &Arc<Core>, inner: &Inner, owner: &PublicKey) -> Result<()> {
        let Some(record) = inner.user_records.get(owner) else {
            return Ok(());
        };
        let serialized = serde_json::to_string(&record.to_stored())?;
        core.storage
            .put(&storage_keys::user_key(&owner.to_hex()), serialized)
            .await?;
        Ok(())
    }

    async fn persist_history(core: &Arc<Core>, inner: &Inner, owner: &PublicKey) -> Result<()> {
        let Some(rumors) = inner.message_history.get(owner) else {
            return Ok(());
        };
        let serialized = serde_json::to_string(rumors)?;
        core.storage
            .put(&storage_keys::history_key(&owner.to_hex()), serialized)
            .await?;
        Ok(())
    }

    async fn delete_session_records(
        core: &Arc<Core>,
        owner: &PublicKey,
        device: &PublicKey,
        sessions: &[Session],
    ) {
        for session in sessions {
            let key =
                storage_keys::session_key(&owner.to_hex(), &device.to_hex(), &session.name);
            if let Err(err) = core.storage.del(&key).await {
                debug!(%err, %key, "failed to delete trimmed session state");
            }
        }
    }

    // ── Callbacks ────────────────────────────────────────────────────────

    fn emit_rumor(core: &Arc<Core>, rumor: &Rumor, from_owner: PublicKey) {
        let callbacks: Vec<EventCallback> = {
            let listeners = core.listeners.lock().unwrap();
            listeners.events.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback(rumor, from_owner);
        }
    }

    fn emit_error(core: &Arc<Core>, error: &Error) {
        let callbacks: Vec<ErrorCallback> = {
            let listeners = core.listeners.lock().unwrap();
            listeners.errors.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback(error);
        }
    }
}
