//! AppKeys: the owner-signed authorized-device registry.
//!
//! A CRDT-flavored set of device identity pubkeys. Serialized to one
//! replaceable event per owner; the latest event conveys the whole set,
//! so removal is by omission — consumers must not rely on tombstones.
//! Merging two copies is a union that prefers the earlier `created_at`
//! for a device present in both.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use veil_crypto::{PublicKey, Signer};
use veil_proto::event::{self, Event};
use veil_proto::Filter;

use crate::error::{Error, Result};

/// One authorized device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub identity_pubkey: PublicKey,
    /// Seconds; when the owner authorized the device.
    pub created_at: u64,
}

impl DeviceEntry {
    pub fn new(identity_pubkey: PublicKey, created_at: u64) -> Self {
        Self {
            identity_pubkey,
            created_at,
        }
    }
}

/// The authorized-device set of one owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppKeys {
    devices: HashMap<PublicKey, DeviceEntry>,
}

impl AppKeys {
    pub fn new(entries: impl IntoIterator<Item = DeviceEntry>) -> Self {
        let mut keys = Self::default();
        for entry in entries {
            keys.add(entry);
        }
        keys
    }

    /// Insert a device; an existing entry keeps the earlier `created_at`.
    pub fn add(&mut self, entry: DeviceEntry) {
        self.devices
            .entry(entry.identity_pubkey)
            .and_modify(|existing| {
                if entry.created_at < existing.created_at {
                    existing.created_at = entry.created_at;
                }
            })
            .or_insert(entry);
    }

    /// Remove a device. Conveyed to peers by omission in the next
    /// published event.
    pub fn remove(&mut self, identity_pubkey: &PublicKey) -> bool {
        self.devices.remove(identity_pubkey).is_some()
    }

    pub fn contains(&self, identity_pubkey: &PublicKey) -> bool {
        self.devices.contains_key(identity_pubkey)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.values()
    }

    pub fn device_keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.devices.keys()
    }

    /// Union merge preferring the earlier `created_at` on collision.
    pub fn merge(&mut self, other: &AppKeys) {
        for entry in other.devices() {
            self.add(*entry);
        }
    }

    // ── Event codec ──────────────────────────────────────────────────────

    /// The signed replaceable event conveying this set.
    pub fn to_event(&self, owner: &dyn Signer) -> Result<Event> {
        let mut tags = vec![
            vec!["d".to_string(), event::APP_KEYS_D_TAG.to_string()],
            vec!["version".to_string(), "1".to_string()],
        ];
        let mut entries: Vec<&DeviceEntry> = self.devices.values().collect();
        entries.sort_by_key(|e| (e.created_at, e.identity_pubkey));
        for entry in entries {
            tags.push(vec![
                "device".to_string(),
                entry.identity_pubkey.to_hex(),
                entry.created_at.to_string(),
            ]);
        }
        Ok(Event::finalize(
            owner,
            event::REPLACEABLE_KIND,
            "",
            tags,
            event::unix_seconds(),
        )?)
    }

    /// Parse a verified AppKeys event. The caller is responsible for
    /// checking the author is the owner it expected.
    pub fn from_event(app_keys_event: &Event) -> Result<Self> {
        app_keys_event
            .verify()
            .map_err(|e| Error::InvalidEvent(format!("app keys signature: {e}")))?;
        if !is_app_keys_event(app_keys_event) {
            return Err(Error::InvalidEvent("not an app keys event".into()));
        }

        let mut keys = Self::default();
        for tag in &app_keys_event.tags {
            if tag.first().map(String::as_str) != Some("device") {
                continue;
            }
            let Some(pubkey_hex) = tag.get(1) else {
                continue;
            };
            let Ok(identity_pubkey) = PublicKey::from_hex(pubkey_hex) else {
                continue;
            };
            let created_at = tag
                .get(2)
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(app_keys_event.created_at);
            keys.add(DeviceEntry::new(identity_pubkey, created_at));
        }
        Ok(keys)
    }

    /// Filter matching one owner's AppKeys channel.
    pub fn filter_for_owner(owner: PublicKey) -> Filter {
        Filter::new()
            .kind(event::REPLACEABLE_KIND)
            .author(owner)
            .d_tag(event::APP_KEYS_D_TAG)
    }
}

pub fn is_app_keys_event(candidate: &Event) -> bool {
    candidate.kind == event::REPLACEABLE_KIND
        && candidate.tag_value("d") == Some(event::APP_KEYS_D_TAG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_crypto::Keypair;

    #[test]
    fn add_prefers_earlier_created_at() {
        let device = Keypair::generate().public();
        let mut keys = AppKeys::default();
        keys.add(DeviceEntry::new(device, 100));
        keys.add(DeviceEntry::new(device, 50));
        keys.add(DeviceEntry::new(device, 200));
        assert_eq!(keys.len(), 1);
        assert_eq!(keys.devices().next().unwrap().created_at, 50);
    }

    #[test]
    fn merge_is_union() {
        let a = Keypair::generate().public();
        let b = Keypair::generate().public();
        let mut left = AppKeys::new([DeviceEntry::new(a, 10)]);
        let right = AppKeys::new([DeviceEntry::new(a, 5), DeviceEntry::new(b, 20)]);
        left.merge(&right);
        assert_eq!(left.len(), 2);
        assert_eq!(
            left.devices()
                .find(|e| e.identity_pubkey == a)
                .unwrap()
                .created_at,
            5
        );
        assert!(left.contains(&b));
    }

    #[test]
    fn event_roundtrip() {
        let owner = Keypair::generate();
        let d1 = Keypair::generate().public();
        let d2 = Keypair::generate().public();
        let keys = AppKeys::new([DeviceEntry::new(d1, 1), DeviceEntry::new(d2, 2)]);

        let registry_event = keys.to_event(&owner).unwrap();
        assert!(is_app_keys_event(&registry_event));
        assert_eq!(registry_event.pubkey, owner.public());

        let parsed = AppKeys::from_event(&registry_event).unwrap();
        assert_eq!(parsed, keys);
    }

    #[test]
    fn removal_is_by_omission() {
        let owner = Keypair::generate();
        let d1 = Keypair::generate().public();
        let d2 = Keypair::generate().public();
        let mut keys = AppKeys::new([DeviceEntry::new(d1, 1), DeviceEntry::new(d2, 2)]);
        keys.remove(&d1);

        let registry_event = keys.to_event(&owner).unwrap();
        let parsed = AppKeys::from_event(&registry_event).unwrap();
        assert!(!parsed.contains(&d1));
        assert!(parsed.contains(&d2));
    }

    #[test]
    fn tampered_event_is_rejected() {
        let owner = Keypair::generate();
        let device = Keypair::generate().public();
        let keys = AppKeys::new([DeviceEntry::new(device, 1)]);
        let mut registry_event = keys.to_event(&owner).unwrap();
        registry_event
            .tags
            .push(vec!["device".into(), Keypair::generate().public().to_hex(), "9".into()]);
        assert!(AppKeys::from_event(&registry_event).is_err());
    }
}
