//! Per-peer bookkeeping: device records, user records, and their stored
//! forms.
//!
//! A `DeviceRecord` owns the sessions with one peer device: at most one
//! active session plus an LRU-ordered bounded queue of inactive ones. A
//! session is promoted to active when a decryptable message arrives on
//! it; trimming drops the queue tail (dropping a session releases its
//! transport subscriptions).
//!
//! Stored forms keep session *names* only; the states live under their
//! own storage keys (`v1/session/...`) so a single corrupt session never
//! takes the whole record down.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use veil_crypto::PublicKey;

use crate::session::Session;
use crate::MAX_INACTIVE_SESSIONS;

// ── Device record ────────────────────────────────────────────────────────────

pub struct DeviceRecord {
    /// The device identity pubkey; doubles as the device id.
    pub device_id: PublicKey,
    pub active_session: Option<Session>,
    /// Most recently demoted first.
    pub inactive_sessions: VecDeque<Session>,
    pub created_at: u64,
}

impl DeviceRecord {
    pub fn new(device_id: PublicKey, created_at: u64) -> Self {
        Self {
            device_id,
            active_session: None,
            inactive_sessions: VecDeque::new(),
            created_at,
        }
    }

    pub fn has_session_named(&self, name: &str) -> bool {
        self.active_session.as_ref().is_some_and(|s| s.name == name)
            || self.inactive_sessions.iter().any(|s| s.name == name)
    }

    /// Session names, active first, then inactive in LRU order.
    pub fn session_names(&self) -> Vec<String> {
        self.active_session
            .iter()
            .chain(self.inactive_sessions.iter())
            .map(|s| s.name.clone())
            .collect()
    }

    /// Attach a session as active; any prior active is demoted to the
    /// front of the inactive queue. Returns the sessions trimmed off the
    /// tail so the caller can delete their persisted state.
    pub fn attach_active(&mut self, session: Session) -> Vec<Session> {
        if let Some(previous) = self.active_session.take() {
            self.inactive_sessions.push_front(previous);
        }
        self.active_session = Some(session);
        self.trim()
    }

    /// Attach a session that has not yet decrypted anything.
    pub fn attach_inactive(&mut self, session: Session) -> Vec<Session> {
        self.inactive_sessions.push_front(session);
        self.trim()
    }

    /// Promote the named session to active (no-op when it already is).
    /// Returns trimmed sessions.
    pub fn promote(&mut self, name: &str) -> Vec<Session> {
        if self.active_session.as_ref().is_some_and(|s| s.name == name) {
            return Vec::new();
        }
        if let Some(pos) = self.inactive_sessions.iter().position(|s| s.name == name) {
            if let Some(session) = self.inactive_sessions.remove(pos) {
                return self.attach_active(session);
            }
        }
        Vec::new()
    }

    fn trim(&mut self) -> Vec<Session> {
        let mut trimmed = Vec::new();
        while self.inactive_sessions.len() > MAX_INACTIVE_SESSIONS {
            if let Some(mut session) = self.inactive_sessions.pop_back() {
                session.close();
                trimmed.push(session);
            }
        }
        trimmed
    }

    /// Active session first, then inactive ones.
    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.active_session
            .iter_mut()
            .chain(self.inactive_sessions.iter_mut())
    }

    pub fn close(&mut self) {
        if let Some(ref mut session) = self.active_session {
            session.close();
        }
        for session in self.inactive_sessions.iter_mut() {
            session.close();
        }
    }

    fn to_stored(&self) -> StoredDeviceRecord {
        StoredDeviceRecord {
            device_id: self.device_id,
            created_at: self.created_at,
            active_session: self.active_session.as_ref().map(|s| s.name.clone()),
            inactive_sessions: self.inactive_sessions.iter().map(|s| s.name.clone()).collect(),
        }
    }
}

// ── User record ──────────────────────────────────────────────────────────────

pub struct UserRecord {
    pub owner: PublicKey,
    pub devices: HashMap<PublicKey, DeviceRecord>,
    /// Cached snapshot of the owner's latest AppKeys, used to authorize
    /// invite responses across restarts.
    pub known_device_identities: HashSet<PublicKey>,
}

impl UserRecord {
    pub fn new(owner: PublicKey) -> Self {
        Self {
            owner,
            devices: HashMap::new(),
            known_device_identities: HashSet::new(),
        }
    }

    pub fn ensure_device(&mut self, device_id: PublicKey, created_at: u64) -> &mut DeviceRecord {
        self.devices
            .entry(device_id)
            .or_insert_with(|| DeviceRecord::new(device_id, created_at))
    }

    pub fn session_names(&self) -> Vec<String> {
        self.devices
            .values()
            .flat_map(DeviceRecord::session_names)
            .collect()
    }

    pub fn close(&mut self) {
        for device in self.devices.values_mut() {
            device.close();
        }
    }

    pub fn to_stored(&self) -> StoredUserRecord {
        let mut devices: Vec<StoredDeviceRecord> =
            self.devices.values().map(DeviceRecord::to_stored).collect();
        devices.sort_by_key(|d| d.device_id);
        let mut known: Vec<PublicKey> = self.known_device_identities.iter().copied().collect();
        known.sort();
        StoredUserRecord {
            owner: self.owner,
            devices,
            known_device_identities: known,
        }
    }
}

// ── Stored forms ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredUserRecord {
    pub owner: PublicKey,
    pub devices: Vec<StoredDeviceRecord>,
    pub known_device_identities: Vec<PublicKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDeviceRecord {
    pub device_id: PublicKey,
    pub created_at: u64,
    /// Name of the active session, if any; states live under
    /// `v1/session/<owner>/<device>/<name>`.
    pub active_session: Option<String>,
    pub inactive_sessions: Vec<String>,
}
