//! Multi-device fan-out scenarios: a message to an owner reaches every
//! non-sender device of both parties, including the sender's siblings,
//! and queued messages replay once sessions come up.

mod common;

use common::{connect_all, pump_until_quiet, TestDevice};
use veil_crypto::Keypair;
use veil_messaging::{AppKeys, DeviceEntry, SendOptions};
use veil_proto::event::{EXPIRATION_TAG, REACTION_KIND};

#[tokio::test]
async fn two_party_message_reaches_recipient_and_sibling() {
    let owner_a = Keypair::generate();
    let owner_b = Keypair::generate();

    let mut a1 = TestDevice::spawn(owner_a.public()).await;
    let mut a2 = TestDevice::spawn(owner_a.public()).await;
    let mut b1 = TestDevice::spawn(owner_b.public()).await;

    let app_keys_a = AppKeys::new([
        DeviceEntry::new(a1.device_pk, 1),
        DeviceEntry::new(a2.device_pk, 2),
    ])
    .to_event(&owner_a)
    .unwrap();
    let app_keys_b = AppKeys::new([DeviceEntry::new(b1.device_pk, 3)])
        .to_event(&owner_b)
        .unwrap();

    connect_all(&[app_keys_a, app_keys_b], &mut [&mut a1, &mut a2, &mut b1]).await;

    let rumor = a1
        .manager
        .send_message(owner_b.public(), "hello", SendOptions::default())
        .await
        .unwrap();
    assert_eq!(rumor.content, "hello");
    assert_eq!(rumor.pubkey, a1.device_pk);
    assert!(rumor.tag_value("ms").is_some());
    assert_eq!(rumor.tag_value("p"), Some(owner_b.public().to_hex().as_str()));

    pump_until_quiet(&mut [&mut a1, &mut a2, &mut b1]).await;

    assert_eq!(b1.received_contents(), vec!["hello"]);
    assert_eq!(a2.received_contents(), vec!["hello"]);
    assert!(a1.received_contents().is_empty(), "sender must not self-deliver");
}

#[tokio::test]
async fn self_message_fans_out_to_sibling_only() {
    let owner_a = Keypair::generate();
    let owner_b = Keypair::generate();

    let mut a1 = TestDevice::spawn(owner_a.public()).await;
    let mut a2 = TestDevice::spawn(owner_a.public()).await;
    let mut b1 = TestDevice::spawn(owner_b.public()).await;

    let app_keys_a = AppKeys::new([
        DeviceEntry::new(a1.device_pk, 1),
        DeviceEntry::new(a2.device_pk, 2),
    ])
    .to_event(&owner_a)
    .unwrap();
    let app_keys_b = AppKeys::new([DeviceEntry::new(b1.device_pk, 3)])
        .to_event(&owner_b)
        .unwrap();

    connect_all(&[app_keys_a, app_keys_b], &mut [&mut a1, &mut a2, &mut b1]).await;

    a1.manager
        .send_message(owner_a.public(), "note", SendOptions::default())
        .await
        .unwrap();
    pump_until_quiet(&mut [&mut a1, &mut a2, &mut b1]).await;

    assert_eq!(a2.received_contents(), vec!["note"]);
    assert!(a1.received_contents().is_empty());
    assert!(b1.received_contents().is_empty());
}

#[tokio::test]
async fn queued_message_replays_on_session_establishment() {
    let owner_a = Keypair::generate();
    let owner_c = Keypair::generate();

    let mut a1 = TestDevice::spawn(owner_a.public()).await;
    let mut c1 = TestDevice::spawn(owner_c.public()).await;

    let app_keys_a = AppKeys::new([DeviceEntry::new(a1.device_pk, 1)])
        .to_event(&owner_a)
        .unwrap();
    common::deliver(&[app_keys_a.clone()], &mut [&mut a1, &mut c1]).await;

    // No session with anyone yet: the message is queued, not sent.
    a1.manager
        .send_message(owner_c.public(), "queued", SendOptions::default())
        .await
        .unwrap();
    assert!(a1.take_published().iter().all(|e| e.kind != veil_proto::event::MESSAGE_KIND));

    // Discovery catches up afterwards.
    let app_keys_c = AppKeys::new([DeviceEntry::new(c1.device_pk, 5)])
        .to_event(&owner_c)
        .unwrap();
    connect_all(&[app_keys_a, app_keys_c], &mut [&mut a1, &mut c1]).await;

    assert_eq!(c1.received_contents(), vec!["queued"]);
}

#[tokio::test]
async fn custom_kind_rumors_flow_through_fanout() {
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
        .send_message(
            owner_b.public(),
            "\u{1f44d}",
            SendOptions {
                kind: Some(REACTION_KIND),
                tags: vec![vec!["e".to_string(), "some-message-id".to_string()]],
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();
    pump_until_quiet(&mut [&mut a1, &mut b1]).await;

    let inbox = b1.inbox.lock().unwrap();
    let (rumor, from_owner) = &inbox[0];
    assert_eq!(rumor.kind, REACTION_KIND);
    assert_eq!(rumor.content, "\u{1f44d}");
    assert_eq!(rumor.tag_value("e"), Some("some-message-id"));
    assert_eq!(*from_owner, owner_a.public());
}

#[tokio::test]
async fn expiration_tag_propagates_to_receiver() {
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

    let expires_at = 1_700_000_000u64;
    a1.manager
        .send_message(
            owner_b.public(),
            "ephemeral note",
            SendOptions {
                expires_at: Some(expires_at),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();
    pump_until_quiet(&mut [&mut a1, &mut b1]).await;

    let inbox = b1.inbox.lock().unwrap();
    let (rumor, _) = &inbox[0];
    assert_eq!(
        rumor.tag_value(EXPIRATION_TAG),
        Some(expires_at.to_string().as_str())
    );
}
