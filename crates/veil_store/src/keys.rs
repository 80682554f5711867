//! Versioned storage key layout.
//!
//! - `storage-version` → current schema version string
//! - `v1/session/<ownerPubkey>/<deviceId>/<sessionName>` → SessionState
//! - `v1/user/<ownerPubkey>` → UserRecord (devices + known identities)
//! - `v1/history/<ownerPubkey>` → queued message history
//! - `v1/device-manager/...` → per-device identity, invite, owner, app keys

pub const STORAGE_VERSION_KEY: &str = "storage-version";
pub const CURRENT_VERSION: &str = "1";

/// Pre-versioning prefix whose records are dropped by the v1 migration.
pub const LEGACY_INVITE_PREFIX: &str = "invite/";
/// Pre-versioning user-record prefix rewritten by the v1 migration.
pub const LEGACY_USER_PREFIX: &str = "user/";

pub const USER_PREFIX: &str = "v1/user/";
pub const SESSION_PREFIX: &str = "v1/session/";
pub const HISTORY_PREFIX: &str = "v1/history/";

pub fn user_key(owner_hex: &str) -> String {
    format!("{USER_PREFIX}{owner_hex}")
}

pub fn history_key(owner_hex: &str) -> String {
    format!("{HISTORY_PREFIX}{owner_hex}")
}

pub fn session_key(owner_hex: &str, device_hex: &str, session_name: &str) -> String {
    format!("{SESSION_PREFIX}{owner_hex}/{device_hex}/{session_name}")
}

/// Prefix covering every session persisted for one owner.
pub fn owner_sessions_prefix(owner_hex: &str) -> String {
    format!("{SESSION_PREFIX}{owner_hex}/")
}

/// Prefix covering every session persisted for one device of one owner.
pub fn device_sessions_prefix(owner_hex: &str, device_hex: &str) -> String {
    format!("{SESSION_PREFIX}{owner_hex}/{device_hex}/")
}

pub fn device_manager_owner_key() -> String {
    "v1/device-manager/owner-pubkey".to_string()
}

pub fn device_manager_invite_key() -> String {
    "v1/device-manager/invite".to_string()
}

pub fn device_manager_identity_public_key() -> String {
    "v1/device-manager/identity-public-key".to_string()
}

pub fn device_manager_identity_private_key() -> String {
    "v1/device-manager/identity-private-key".to_string()
}

pub fn device_manager_app_keys_key() -> String {
    "v1/device-manager/app-keys".to_string()
}
