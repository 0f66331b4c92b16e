use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dm_client::{
    directory::{KeyDirectory, MemoryKeyDirectory},
    E2eeError, ManagerConfig, SessionManager,
};
use dm_crypto::{PublicKeyBundle, PublicKeyBytes, PublishedPrekeys};
use dm_proto::{DisplayBody, StoredMessage};
use dm_store::{MemoryStore, PrekeyStore};

struct Device {
    store: Arc<MemoryStore>,
    manager: Arc<SessionManager>,
}

async fn device(server: &Arc<MemoryKeyDirectory>, user: &str) -> Device {
    let store = Arc::new(MemoryStore::new());
    let manager = SessionManager::open(
        store.clone(),
        Arc::new(server.client(user)),
        ManagerConfig::default(),
    )
    .await
    .unwrap();
    manager.publish_keys().await.unwrap();
    Device {
        store,
        manager: Arc::new(manager),
    }
}

/// A device that only ever uploads its identity key.
async fn single_key_device(server: &Arc<MemoryKeyDirectory>, user: &str) -> Device {
    let store = Arc::new(MemoryStore::new());
    let client = server.client(user);
    let manager = SessionManager::open(
        store.clone(),
        Arc::new(server.client(user)),
        ManagerConfig::default(),
    )
    .await
    .unwrap();
    client
        .publish(&manager.identity_public().to_b64())
        .await
        .unwrap();
    Device {
        store,
        manager: Arc::new(manager),
    }
}

fn stored(id: &str, from: &str, to: &str, content: &str, is_e2ee: bool) -> StoredMessage {
    StoredMessage {
        id: id.to_string(),
        sender_id: from.to_string(),
        recipient_id: to.to_string(),
        content: content.to_string(),
        is_e2ee,
        sent_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
    }
}

/// Change one character of the ciphertext field, keeping it valid base64.
fn tamper(wire: &str) -> String {
    let mut fields: Vec<String> = wire.split(':').map(str::to_string).collect();
    let ct: Vec<char> = fields[3].chars().collect();
    let mut changed = ct.clone();
    changed[2] = if ct[2] == 'A' { 'B' } else { 'A' };
    fields[3] = changed.into_iter().collect();
    fields.join(":")
}

#[tokio::test]
async fn alice_and_bob_exchange_messages() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;

    let e0 = alice.manager.send("bob", "Hello Bob 👋").await.unwrap();
    assert!(e0.starts_with("1x:0:"));
    assert_eq!(bob.manager.receive_text("alice", &e0).await.unwrap(), "Hello Bob 👋");

    let e1 = alice.manager.send("bob", "How is the exam schedule?").await.unwrap();
    assert!(e1.starts_with("1x:1:"), "prekey header stays until the peer replies");
    assert_eq!(
        bob.manager.receive_text("alice", &e1).await.unwrap(),
        "How is the exam schedule?"
    );

    let reply = bob.manager.send("alice", "Posted on Friday").await.unwrap();
    assert!(reply.starts_with("1:0:"));
    assert_eq!(alice.manager.receive_text("bob", &reply).await.unwrap(), "Posted on Friday");

    let e2 = alice.manager.send("bob", "thanks").await.unwrap();
    assert!(e2.starts_with("1:2:"));
    assert_eq!(bob.manager.receive_text("alice", &e2).await.unwrap(), "thanks");
}

#[tokio::test]
async fn out_of_order_delivery_decrypts() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;

    let mut wires = Vec::new();
    for i in 0..3 {
        wires.push(alice.manager.send("bob", &format!("message {i}")).await.unwrap());
    }
    for i in [2, 0, 1] {
        let out = bob.manager.receive("alice", &wires[i]).await.unwrap();
        assert_eq!(out.plaintext.as_slice(), format!("message {i}").as_bytes());
        assert_eq!(out.late, i != 2);
    }
}

#[tokio::test]
async fn replayed_envelope_is_rejected() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;

    let wire = alice.manager.send("bob", "once").await.unwrap();
    bob.manager.receive("alice", &wire).await.unwrap();
    assert!(matches!(
        bob.manager.receive("alice", &wire).await,
        Err(E2eeError::DecryptionFailure)
    ));
}

#[tokio::test]
async fn history_renders_each_message_independently() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;

    let first = alice.manager.send("bob", "first").await.unwrap();
    let second = alice.manager.send("bob", "second").await.unwrap();
    let third = alice.manager.send("bob", "third").await.unwrap();

    let mut history = vec![
        stored("m1", "alice", "bob", "hey, before encryption", false),
        stored("m2", "alice", "bob", &first, true),
        stored("m3", "alice", "bob", &tamper(&second), true),
        stored("m4", "alice", "bob", &third, true),
        stored("m5", "alice", "bob", "garbage", true),
    ];
    let rendered = bob.manager.render_history(&history, "bob").await;
    let bodies: Vec<DisplayBody> = rendered.iter().map(|(_, b)| b.clone()).collect();
    assert_eq!(bodies[0], DisplayBody::Plaintext("hey, before encryption".into()));
    assert_eq!(bodies[1], DisplayBody::Decrypted("first".into()));
    assert!(matches!(bodies[2], DisplayBody::Undecryptable(_)));
    assert_eq!(bodies[2].text(), "unable to decrypt");
    assert_eq!(bodies[3], DisplayBody::Decrypted("third".into()));
    assert!(matches!(bodies[4], DisplayBody::Undecryptable(_)));

    // Bob answers. His own envelopes render from the cache, or as sent.
    let own = bob.manager.send("alice", "from bob").await.unwrap();
    let own_cached = bob.manager.send("alice", "cached by bob").await.unwrap();
    bob.manager.cache_plaintext("m7", "cached by bob").await.unwrap();
    history.push(stored("m6", "bob", "alice", &own, true));
    history.push(stored("m7", "bob", "alice", &own_cached, true));

    // Reloading serves already-read messages from the cache even though
    // their keys are gone.
    let rendered = bob.manager.render_history(&history, "bob").await;
    assert_eq!(
        rendered.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>(),
        ["m1", "m2", "m3", "m4", "m5", "m6", "m7"]
    );
    assert_eq!(rendered[1].1, DisplayBody::Decrypted("first".into()));
    assert!(matches!(rendered[2].1, DisplayBody::Undecryptable(_)));
    assert_eq!(rendered[3].1, DisplayBody::Decrypted("third".into()));
    assert_eq!(rendered[5].1, DisplayBody::SentEncrypted);
    assert_eq!(rendered[6].1, DisplayBody::Decrypted("cached by bob".into()));

    // The untampered second message still opens.
    assert_eq!(bob.manager.receive_text("alice", &second).await.unwrap(), "second");
}

#[tokio::test]
async fn unknown_peer_has_no_secure_chat() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;

    let err = alice.manager.send("nobody", "hi").await.unwrap_err();
    assert!(matches!(err, E2eeError::PeerKeyNotFound(ref id) if id == "nobody"));
    assert!(err.secure_chat_unavailable());
    assert!(!alice.manager.has_session("nobody").await.unwrap());
}

#[tokio::test]
async fn regular_envelope_without_session_is_refused() {
    let server = MemoryKeyDirectory::new();
    let alice = single_key_device(&server, "alice").await;
    let bob = single_key_device(&server, "bob").await;

    alice.manager.ensure_session("bob").await.unwrap();
    let wire = alice.manager.send("bob", "single key").await.unwrap();
    assert!(wire.starts_with("1:0:"));
    assert!(matches!(
        bob.manager.receive("alice", &wire).await,
        Err(E2eeError::SessionNotEstablished(_))
    ));

    bob.manager.ensure_session("alice").await.unwrap();
    assert_eq!(bob.manager.receive_text("alice", &wire).await.unwrap(), "single key");
    let back = bob.manager.send("alice", "both ways").await.unwrap();
    assert_eq!(alice.manager.receive_text("bob", &back).await.unwrap(), "both ways");
}

#[tokio::test]
async fn storage_failure_is_surfaced() {
    let server = MemoryKeyDirectory::new();
    let broken = Arc::new(MemoryStore::new());
    broken.set_unavailable(true);
    let result = SessionManager::open(
        broken.clone(),
        Arc::new(server.client("carol")),
        ManagerConfig::default(),
    )
    .await;
    assert!(matches!(result, Err(E2eeError::StorageUnavailable(_))));
    assert!(broken.is_empty());

    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;
    let first = alice.manager.send("bob", "before the outage").await.unwrap();
    alice.store.set_unavailable(true);
    assert!(matches!(
        alice.manager.send("bob", "during the outage").await,
        Err(E2eeError::StorageUnavailable(_))
    ));
    alice.store.set_unavailable(false);

    // The failed send consumed no counter.
    let next = alice.manager.send("bob", "after the outage").await.unwrap();
    assert!(next.starts_with("1x:1:"));
    bob.manager.receive("alice", &first).await.unwrap();
    let out = bob.manager.receive("alice", &next).await.unwrap();
    assert_eq!(out.gap, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_never_share_a_counter() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;

    let mut tasks = Vec::new();
    for i in 0..50 {
        let manager = Arc::clone(&alice.manager);
        tasks.push(tokio::spawn(async move {
            manager.send("bob", &format!("msg {i}")).await
        }));
    }
    let mut wires = Vec::new();
    for task in tasks {
        wires.push(task.await.unwrap().unwrap());
    }

    let counters: HashSet<u32> = wires
        .iter()
        .map(|w| dm_proto::decode(w).unwrap().counter)
        .collect();
    assert_eq!(counters, (0..50).collect::<HashSet<_>>());

    for wire in wires.iter().rev() {
        bob.manager.receive("alice", wire).await.unwrap();
    }
}

#[tokio::test]
async fn first_message_consumes_the_one_time_prekey() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;
    let bob_prekeys = PrekeyStore::new(bob.store.clone());
    let before = bob_prekeys.one_time_prekey_ids().await.unwrap().len();
    let offered = server.remaining_one_time_prekeys("bob");

    let wire = alice.manager.send("bob", "hi").await.unwrap();
    assert_eq!(server.remaining_one_time_prekeys("bob"), offered - 1);
    assert_eq!(bob_prekeys.one_time_prekey_ids().await.unwrap().len(), before);

    bob.manager.receive("alice", &wire).await.unwrap();
    assert_eq!(bob_prekeys.one_time_prekey_ids().await.unwrap().len(), before - 1);

    // Topping up restores the pool without re-offering the used key.
    bob.manager.publish_keys().await.unwrap();
    assert_eq!(bob_prekeys.one_time_prekey_ids().await.unwrap().len(), before);
    assert_eq!(server.remaining_one_time_prekeys("bob"), offered);
}

#[tokio::test]
async fn reset_starts_a_fresh_session_the_peer_accepts() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;

    let old = alice.manager.send("bob", "old session").await.unwrap();
    bob.manager.receive("alice", &old).await.unwrap();

    assert!(alice.manager.reset_session("bob").await.unwrap());
    assert!(!alice.manager.reset_session("bob").await.unwrap());

    let fresh = alice.manager.send("bob", "new session").await.unwrap();
    assert!(fresh.starts_with("1x:0:"));
    assert_eq!(bob.manager.receive_text("alice", &fresh).await.unwrap(), "new session");

    let reply = bob.manager.send("alice", "got it").await.unwrap();
    assert_eq!(alice.manager.receive_text("bob", &reply).await.unwrap(), "got it");
}

#[tokio::test]
async fn simultaneous_start_converges_on_one_session() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;

    let from_alice = alice.manager.send("bob", "hi bob").await.unwrap();
    let from_bob = bob.manager.send("alice", "hi alice").await.unwrap();

    let (low, low_id, low_wire, high, high_id, high_wire) =
        if alice.manager.identity_public() < bob.manager.identity_public() {
            (&alice, "alice", from_alice, &bob, "bob", from_bob)
        } else {
            (&bob, "bob", from_bob, &alice, "alice", from_alice)
        };

    // The lower identity keeps its session but still reads the peer's
    // message; the higher one switches.
    assert_eq!(
        low.manager.receive_text(high_id, &high_wire).await.unwrap(),
        if low_id == "alice" { "hi alice" } else { "hi bob" }
    );
    high.manager.receive(low_id, &low_wire).await.unwrap();

    let again = low.manager.send(high_id, "still there?").await.unwrap();
    assert_eq!(high.manager.receive_text(low_id, &again).await.unwrap(), "still there?");
    let reply = high.manager.send(low_id, "yes").await.unwrap();
    assert!(reply.starts_with("1:"));
    assert_eq!(low.manager.receive_text(high_id, &reply).await.unwrap(), "yes");
}

#[tokio::test]
async fn lost_first_message_in_simultaneous_start_loses_nothing() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;
    let (low, low_id, high, high_id) =
        if alice.manager.identity_public() < bob.manager.identity_public() {
            (alice, "alice", bob, "bob")
        } else {
            (bob, "bob", alice, "alice")
        };

    // Never delivered.
    let _lost = low.manager.send(high_id, "are you there?").await.unwrap();
    let mut from_high = Vec::new();
    for i in 0..5 {
        from_high.push(high.manager.send(low_id, &format!("high {i}")).await.unwrap());
    }

    for (i, wire) in from_high.iter().enumerate().take(3) {
        assert_eq!(low.manager.receive_text(high_id, wire).await.unwrap(), format!("high {i}"));
    }
    // The session read alongside survives a restart of the lower side.
    let low_restarted = SessionManager::open(
        low.store.clone(),
        Arc::new(server.client(low_id)),
        ManagerConfig::default(),
    )
    .await
    .unwrap();
    for (i, wire) in from_high.iter().enumerate().skip(3) {
        assert_eq!(low_restarted.receive_text(high_id, wire).await.unwrap(), format!("high {i}"));
    }

    // Still sending on its own session, the lower side gets through and
    // the higher side switches over.
    let retry = low_restarted.send(high_id, "are you there?").await.unwrap();
    assert!(retry.starts_with("1x:1:"));
    assert_eq!(high.manager.receive_text(low_id, &retry).await.unwrap(), "are you there?");
    let reply = high.manager.send(low_id, "yes").await.unwrap();
    assert!(reply.starts_with("1:0:"));
    assert_eq!(low_restarted.receive_text(high_id, &reply).await.unwrap(), "yes");
}

#[tokio::test]
async fn live_received_message_renders_in_history() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;

    let wire = alice.manager.send("bob", "read it live").await.unwrap();
    assert_eq!(
        bob.manager.receive_message("alice", "m1", &wire).await.unwrap(),
        "read it live"
    );

    let history = [stored("m1", "alice", "bob", &wire, true)];
    let rendered = bob.manager.render_history(&history, "bob").await;
    assert_eq!(rendered[0].1, DisplayBody::Decrypted("read it live".into()));
}

#[tokio::test]
async fn sessions_survive_a_restart() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let bob = device(&server, "bob").await;

    let first = alice.manager.send("bob", "before restart").await.unwrap();
    bob.manager.receive("alice", &first).await.unwrap();
    let identity = alice.manager.identity_public();

    let restarted = SessionManager::open(
        alice.store.clone(),
        Arc::new(server.client("alice")),
        ManagerConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(restarted.identity_public(), identity);
    assert_eq!(restarted.peers().await.unwrap(), ["bob"]);

    let second = restarted.send("bob", "after restart").await.unwrap();
    assert!(second.starts_with("1x:1:"));
    assert_eq!(bob.manager.receive_text("alice", &second).await.unwrap(), "after restart");
}

struct SlowDirectory;

#[async_trait]
impl KeyDirectory for SlowDirectory {
    async fn publish(&self, _public_key_b64: &str) -> Result<(), E2eeError> {
        Ok(())
    }

    async fn publish_bundle(&self, _prekeys: &PublishedPrekeys) -> Result<(), E2eeError> {
        Ok(())
    }

    async fn fetch(&self, peer_id: &str) -> Result<PublicKeyBundle, E2eeError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(E2eeError::PeerKeyNotFound(peer_id.to_string()))
    }

    async fn fetch_identity_key(&self, peer_id: &str) -> Result<PublicKeyBytes, E2eeError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(E2eeError::PeerKeyNotFound(peer_id.to_string()))
    }
}

#[tokio::test]
async fn slow_directory_surfaces_as_unreachable() {
    let config = ManagerConfig {
        fetch_timeout: Duration::from_millis(50),
        ..ManagerConfig::default()
    };
    let manager =
        SessionManager::open(Arc::new(MemoryStore::new()), Arc::new(SlowDirectory), config)
            .await
            .unwrap();

    let err = manager.send("bob", "hello?").await.unwrap_err();
    assert!(matches!(err, E2eeError::PeerUnreachable(_)));
    assert!(err.secure_chat_unavailable());
    assert!(!manager.has_session("bob").await.unwrap());
}

#[tokio::test]
async fn offline_directory_surfaces_as_unreachable() {
    let server = MemoryKeyDirectory::new();
    let alice = device(&server, "alice").await;
    let _bob = device(&server, "bob").await;
    server.set_unreachable(true);
    assert!(matches!(
        alice.manager.send("bob", "hi").await,
        Err(E2eeError::PeerUnreachable(_))
    ));
}
