//! Lifecycle and registry-ordering behavior: close releases every
//! subscription, delete_user wipes persisted state, and replaceable
//! AppKeys events apply newest-wins ordering.

mod common;

use common::{connect_all, deliver, pump_until_quiet, TestDevice};
use veil_crypto::Keypair;
use veil_messaging::{AppKeys, DeviceEntry, SendOptions};
use veil_store::{keys as storage_keys, Storage};

#[tokio::test]
async fn close_releases_every_subscription() {
    let owner_a = Keypair::generate();
    let owner_b = Keypair::generate();

    let mut a1 = TestDevice::spawn(owner_a.public()).await;
    let mut b1 = TestDevice::spawn(owner_b.public()).await;

    let app_keys_a = AppKeys::new([DeviceEntry::new(a1.device_pk, 1)])
        .to_event(&owner_a)
        .unwrap();
    let app_keys_b = AppKeys::new([DeviceEntry::new(b1.device_pk, 2)])
        .to_event(&owner_b)
        .unwrap();
    connect_all(&[app_keys_a, app_keys_b], &mut [&mut a1, &mut b1]).await;

    // Invite-response listener, AppKeys channels, invite channels, and
    // per-session channels are all live at this point.
    assert!(a1.relay.subscription_count() > 0);

    a1.manager.close().await;
    assert_eq!(
        a1.relay.subscription_count(),
        0,
        "close must drain the whole subscription registry"
    );
}

#[tokio::test]
async fn delete_user_wipes_memory_and_storage() {
    let owner_a = Keypair::generate();
    let owner_b = Keypair::generate();

    let mut a1 = TestDevice::spawn(owner_a.public()).await;
    let mut b1 = TestDevice::spawn(owner_b.public()).await;

    let app_keys_a = AppKeys::new([DeviceEntry::new(a1.device_pk, 1)])
        .to_event(&owner_a)
        .unwrap();
    let app_keys_b = AppKeys::new([DeviceEntry::new(b1.device_pk, 2)])
        .to_event(&owner_b)
        .unwrap();
    connect_all(&[app_keys_a, app_keys_b], &mut [&mut a1, &mut b1]).await;

    a1.manager
        .send_message(owner_b.public(), "hello", SendOptions::default())
        .await
        .unwrap();
    pump_until_quiet(&mut [&mut a1, &mut b1]).await;
    assert_eq!(b1.received_contents(), vec!["hello"]);

    let owner_b_hex = owner_b.public().to_hex();
    assert!(a1
        .storage
        .get(&storage_keys::user_key(&owner_b_hex))
        .await
        .unwrap()
        .is_some());

    a1.manager.delete_user(owner_b.public()).await.unwrap();

    assert!(a1
        .manager
        .device_summaries(&owner_b.public())
        .await
        .is_empty());
    assert!(a1
        .storage
        .get(&storage_keys::user_key(&owner_b_hex))
        .await
        .unwrap()
        .is_none());
    assert!(a1
        .storage
        .get(&storage_keys::history_key(&owner_b_hex))
        .await
        .unwrap()
        .is_none());
    assert!(a1
        .storage
        .list(&storage_keys::owner_sessions_prefix(&owner_b_hex))
        .await
        .unwrap()
        .is_empty());

    // Further sends only queue: there is no session left to carry them.
    a1.manager
        .send_message(owner_b.public(), "into the void", SendOptions::default())
        .await
        .unwrap();
    pump_until_quiet(&mut [&mut a1, &mut b1]).await;
    assert_eq!(b1.received_contents(), vec!["hello"]);
}

#[tokio::test]
async fn stale_app_keys_events_are_ignored() {
    let owner_a = Keypair::generate();

    let mut a1 = TestDevice::spawn(owner_a.public()).await;
    let a2_device = Keypair::generate().public();

    // Current registry: a1 + a2, stamped strictly newer than the stale
    // replay below.
    let fresh = AppKeys::new([
        DeviceEntry::new(a1.device_pk, 1),
        DeviceEntry::new(a2_device, 2),
    ])
    .to_event(&owner_a)
    .unwrap();
    let newer = fresh_time(&fresh) + 10;
    let fresh = restamp(&owner_a, fresh, newer);
    deliver(&[fresh], &mut [&mut a1]).await;
    assert_eq!(
        a1.manager.known_device_identities(&owner_a.public()).await.len(),
        2
    );

    // A replayed older registry without a2 must not tear anything down.
    let stale = AppKeys::new([DeviceEntry::new(a1.device_pk, 1)])
        .to_event(&owner_a)
        .unwrap();
    deliver(&[stale], &mut [&mut a1]).await;

    let known = a1.manager.known_device_identities(&owner_a.public()).await;
    assert!(known.contains(&a2_device), "stale event must not remove devices");
    assert_eq!(known.len(), 2);
}

fn fresh_time(event: &veil_proto::Event) -> u64 {
    event.created_at
}

/// Re-sign an event with a different timestamp so the id stays valid.
fn restamp(owner: &Keypair, event: veil_proto::Event, created_at: u64) -> veil_proto::Event {
    veil_proto::Event::finalize(owner, event.kind, event.content, event.tags, created_at).unwrap()
}
