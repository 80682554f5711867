//! veil_messaging — end-to-end encrypted multi-device messaging core.
//!
//! A user (the *owner*) holds a long-term identity keypair; each of their
//! endpoints (*devices*) holds its own keypair and advertises an *invite*
//! (ephemeral DH key + shared secret) that bootstraps pairwise
//! double-ratchet *sessions* with every other device. Messages sent to an
//! owner fan out to every non-sender device of both conversation parties.
//!
//! # Module layout
//! - `session_state`    — serializable double-ratchet state
//! - `session`          — the ratchet itself: send, receive, key rotation
//! - `invite`           — bootstrap bundle + handshake
//! - `app_keys`         — owner-signed authorized-device registry
//! - `app_keys_manager` — owner authority over the registry
//! - `delegate_manager` — per-device identity holder and activation
//! - `records`          — per-peer device/user records and message history
//! - `session_manager`  — the orchestrator tying it all together
//! - `error`            — unified error type

pub mod app_keys;
pub mod app_keys_manager;
pub mod delegate_manager;
pub mod error;
pub mod invite;
pub mod records;
mod serde_hex;
pub mod session;
pub mod session_manager;
pub mod session_state;

pub use app_keys::{AppKeys, DeviceEntry};
pub use app_keys_manager::AppKeysManager;
pub use delegate_manager::{Activation, DelegateManager};
pub use error::{Error, Result};
pub use invite::{Invite, InviteResponse};
pub use records::{DeviceRecord, UserRecord};
pub use session::Session;
pub use session_manager::{DeviceSummary, ListenerHandle, SendOptions, SessionManager};
pub use session_state::{Header, RatchetKeyPair, SessionState};

/// Maximum skipped message keys cached per chain. A counter jump past
/// this bound fails the receive.
pub const MAX_SKIP: usize = 500;

/// Maximum inactive sessions retained per peer device; older ones are
/// dropped LRU-style.
pub const MAX_INACTIVE_SESSIONS: usize = 10;

/// How long an invite-response authorization waits for the claimed
/// owner's AppKeys before falling back to the cached snapshot.
pub const APP_KEYS_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);
