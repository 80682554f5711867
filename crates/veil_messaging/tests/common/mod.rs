#![allow(dead_code)]
//! Shared harness for session-manager integration tests.
//!
//! Each device runs on its own in-memory relay and storage; tests move
//! published events between managers explicitly, which makes delivery
//! order (and reordering) fully deterministic.

use std::sync::{Arc, Mutex};

use veil_crypto::{Keypair, PublicKey};
use veil_messaging::session_manager::ListenerHandle;
use veil_messaging::{Invite, SessionManager};
use veil_proto::event::Rumor;
use veil_proto::{Event, MemoryRelay};
use veil_store::MemoryStorage;

pub struct TestDevice {
    pub manager: SessionManager,
    pub relay: MemoryRelay,
    pub storage: MemoryStorage,
    pub owner: PublicKey,
    pub device_pk: PublicKey,
    pub invite: Invite,
    pub inbox: Arc<Mutex<Vec<(Rumor, PublicKey)>>>,
    device_secret: [u8; 32],
    _listener: ListenerHandle,
    cursor: usize,
}

impl TestDevice {
    pub async fn spawn(owner: PublicKey) -> TestDevice {
        let device = Keypair::generate();
        let device_secret = *device.secret_bytes();
        let device_pk = device.public();
        let invite = Invite::create(device_pk);
        let relay = MemoryRelay::new();
        let storage = MemoryStorage::new();

        let manager = SessionManager::new(
            device,
            owner,
            invite.clone(),
            Arc::new(relay.clone()),
            Arc::new(storage.clone()),
        );

        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        let listener = manager.on_event(move |rumor, from| {
            sink.lock().unwrap().push((rumor.clone(), from));
        });

        manager.init().await.unwrap();

        TestDevice {
            manager,
            relay,
            storage,
            owner,
            device_pk,
            invite,
            inbox,
            device_secret,
            _listener: listener,
            cursor: 0,
        }
    }

    /// Tear the manager down and bring a new one up over the same
    /// storage, restoring what a delegate would restore: the device key
    /// and the invite credentials.
    pub async fn restart(self) -> TestDevice {
        self.manager.close().await;

        let device = Keypair::from_secret_bytes(&self.device_secret).unwrap();
        let relay = MemoryRelay::new();
        let manager = SessionManager::new(
            device,
            self.owner,
            self.invite.clone(),
            Arc::new(relay.clone()),
            Arc::new(self.storage.clone()),
        );

        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        let listener = manager.on_event(move |rumor, from| {
            sink.lock().unwrap().push((rumor.clone(), from));
        });

        manager.init().await.unwrap();
        // Skip the invite republished during init when pumping.
        let cursor = relay.published().len();

        TestDevice {
            manager,
            relay,
            storage: self.storage,
            owner: self.owner,
            device_pk: self.device_pk,
            invite: self.invite,
            inbox,
            device_secret: self.device_secret,
            _listener: listener,
            cursor,
        }
    }

    /// This device's signed invite event, as published at init.
    pub fn invite_event(&self) -> Event {
        let keys = Keypair::from_secret_bytes(&self.device_secret).unwrap();
        self.invite.to_event(&keys).unwrap()
    }

    /// Events this device published since the last call.
    pub fn take_published(&mut self) -> Vec<Event> {
        let all = self.relay.published();
        let fresh = all[self.cursor..].to_vec();
        self.cursor = all.len();
        fresh
    }

    /// Contents of every rumor delivered so far, in arrival order.
    pub fn received_contents(&self) -> Vec<String> {
        self.inbox
            .lock()
            .unwrap()
            .iter()
            .map(|(rumor, _)| rumor.content.clone())
            .collect()
    }
}

/// Deliver one batch of events to every listed device.
pub async fn deliver(events: &[Event], devices: &mut [&mut TestDevice]) {
    for received in events {
        for device in devices.iter_mut() {
            device.manager.process_received_event(received.clone()).await;
        }
    }
}

/// Ferry published events between devices until nothing new appears.
pub async fn pump_until_quiet(devices: &mut [&mut TestDevice]) {
    loop {
        let mut batches: Vec<(usize, Vec<Event>)> = Vec::new();
        for (i, device) in devices.iter_mut().enumerate() {
            let fresh = device.take_published();
            if !fresh.is_empty() {
                batches.push((i, fresh));
            }
        }
        if batches.is_empty() {
            break;
        }
        for (source, events) in batches {
            for received in events {
                for (target, device) in devices.iter_mut().enumerate() {
                    if target != source {
                        device
                            .manager
                            .process_received_event(received.clone())
                            .await;
                    }
                }
            }
        }
    }
}

/// Deliver AppKeys events to everyone, then pump the invite handshakes
/// to completion.
pub async fn connect_all(app_keys_events: &[Event], devices: &mut [&mut TestDevice]) {
    deliver(app_keys_events, devices).await;
    pump_until_quiet(devices).await;
}
