//! Session controller scenarios
//!
//! Two controllers share one in-memory repository; gateway traffic is
//! recorded and handed across by the test.

use async_trait::async_trait;
use parley_client::*;
use parley_shared::protocol::{ClientEvent, ServerEvent, TypingNotice};
use parley_shared::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Default)]
struct RecordingGateway {
    sent: Mutex<Vec<ClientEvent>>,
    down: AtomicBool,
}

impl RecordingGateway {
    fn take(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Messages pushed so far, as the receiving side would see them
    fn pushed(&self) -> Vec<ServerEvent> {
        self.take()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::SendMessage { envelope } => {
                    Some(ServerEvent::MessageReceived { envelope })
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl GatewayLink for RecordingGateway {
    async fn send_event(&self, event: ClientEvent) -> Result<(), ClientError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("connection closed".into()));
        }
        self.sent.lock().unwrap().push(event);
        Ok(())
    }
}

/// Repository whose appends can be made to fail
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    failing: AtomicBool,
}

#[async_trait]
impl ConversationRepository for FlakyStore {
    async fn find_or_create_thread(&self, a: &AccountId, b: &AccountId) -> StoreResult<Thread> {
        self.inner.find_or_create_thread(a, b).await
    }

    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Option<Thread>> {
        self.inner.get_thread(thread_id).await
    }

    async fn list_threads_for_account(&self, account: &AccountId) -> StoreResult<Vec<Thread>> {
        self.inner.list_threads_for_account(account).await
    }

    async fn append_message(&self, message: MessageEnvelope) -> StoreResult<MessageEnvelope> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.inner.append_message(message).await
    }

    async fn list_messages(&self, thread_id: Uuid) -> StoreResult<Vec<MessageEnvelope>> {
        self.inner.list_messages(thread_id).await
    }
}

#[async_trait]
impl ProfileDirectory for FlakyStore {
    async fn publish_public_key(&self, account: &AccountId, public_key: &str) -> StoreResult<()> {
        self.inner.publish_public_key(account, public_key).await
    }

    async fn fetch_public_key(&self, account: &AccountId) -> StoreResult<Option<String>> {
        self.inner.fetch_public_key(account).await
    }
}

type Controller = ChatSessionController<FlakyStore, FlakyStore, RecordingGateway>;

struct Peer {
    ctl: Controller,
    gateway: Arc<RecordingGateway>,
}

fn id(s: &str) -> AccountId {
    AccountId::new(s).unwrap()
}

/// A participant; `keyed` publishes a fresh key pair first
async fn peer(store: &Arc<FlakyStore>, name: &str, keyed: bool) -> Peer {
    let keys = if keyed {
        let pair = generate_key_pair();
        store
            .publish_public_key(&id(name), &export_public(&pair.public_key()))
            .await
            .unwrap();
        Some(pair)
    } else {
        None
    };
    let gateway = Arc::new(RecordingGateway::default());
    let ctl = ChatSessionController::new(id(name), keys, store.clone(), store.clone(), gateway.clone());
    Peer { ctl, gateway }
}

fn texts(ctl: &Controller) -> Vec<&str> {
    ctl.transcript().iter().map(|e| e.text.as_str()).collect()
}

// ============================================================================
// Encryption modes
// ============================================================================

#[tokio::test]
async fn test_without_keys_messages_go_out_in_plaintext_with_warning() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", false).await;

    alice.ctl.open_with(&id("bob")).await.unwrap();
    assert!(!alice.ctl.is_encrypted());
    assert_eq!(alice.ctl.unkeyed_reason(), Some(&UnkeyedReason::NoLocalKey));
    assert_eq!(alice.ctl.warning(), Some(UNENCRYPTED_WARNING));

    let report = alice.ctl.send("hi bob").await.unwrap();
    assert!(!report.encrypted);
    assert!(report.persisted);
    assert_eq!(report.warning, Some(UNENCRYPTED_WARNING));

    let thread = alice.ctl.active_thread().unwrap().id;
    let stored = store.list_messages(thread).await.unwrap();
    assert_eq!(
        stored[0].content,
        MessageContent::Plaintext {
            text: "hi bob".into()
        }
    );
}

#[tokio::test]
async fn test_peer_without_key_degrades_to_plaintext() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", true).await;
    let _bob = peer(&store, "bob", false).await;

    alice.ctl.open_with(&id("bob")).await.unwrap();
    assert_eq!(alice.ctl.unkeyed_reason(), Some(&UnkeyedReason::PeerKeyMissing));
    assert!(!alice.ctl.send("hello").await.unwrap().encrypted);
}

#[tokio::test]
async fn test_encrypted_message_decrypts_for_receiver() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", true).await;
    let mut bob = peer(&store, "bob", true).await;

    alice.ctl.open_with(&id("bob")).await.unwrap();
    bob.ctl.open_with(&id("alice")).await.unwrap();
    assert!(alice.ctl.is_encrypted());
    assert!(bob.ctl.is_encrypted());
    assert_eq!(alice.ctl.warning(), None);

    let report = alice.ctl.send("hello").await.unwrap();
    assert!(report.encrypted && report.persisted && report.pushed);
    assert_eq!(report.warning, None);
    assert_eq!(texts(&alice.ctl), ["hello"]);

    // The stored body is ciphertext, not the literal text
    let thread = alice.ctl.active_thread().unwrap().id;
    let stored = store.list_messages(thread).await.unwrap();
    assert!(stored[0].content.is_encrypted());
    assert!(!stored[0].content.to_storage().contains("hello"));

    for event in alice.gateway.pushed() {
        assert!(bob.ctl.handle_event(event));
    }
    assert_eq!(texts(&bob.ctl), ["hello"]);
    assert!(bob.ctl.transcript()[0].encrypted);
}

#[tokio::test]
async fn test_offline_receiver_reads_message_from_history() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", true).await;
    let mut bob = peer(&store, "bob", true).await;

    alice.ctl.open_with(&id("bob")).await.unwrap();
    alice.ctl.send("are you there?").await.unwrap();
    alice.ctl.send("call me").await.unwrap();
    // Bob was offline: the live pushes went nowhere
    alice.gateway.take();

    bob.ctl.open_with(&id("alice")).await.unwrap();
    assert_eq!(texts(&bob.ctl), ["are you there?", "call me"]);
    assert!(bob
        .ctl
        .transcript()
        .iter()
        .all(|e| e.state == DeliveryState::Sent && e.sender_id == id("alice")));
}

#[tokio::test]
async fn test_undecryptable_messages_show_placeholder() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", true).await;
    let mut bob = peer(&store, "bob", true).await;
    alice.ctl.open_with(&id("bob")).await.unwrap();
    bob.ctl.open_with(&id("alice")).await.unwrap();
    let thread = alice.ctl.active_thread().unwrap().id;

    // Sealed under a key bob cannot derive
    let stranger = derive_session_key(&generate_key_pair(), &generate_key_pair().public_key()).unwrap();
    let foreign = MessageEnvelope::compose(
        thread,
        id("alice"),
        id("bob"),
        MessageContent::Encrypted {
            envelope: encrypt(&stranger, "secret").unwrap(),
        },
    );
    assert!(bob.ctl.handle_event(ServerEvent::MessageReceived { envelope: foreign }));
    assert_eq!(texts(&bob.ctl), [UNDECRYPTABLE_PLACEHOLDER]);
}

#[tokio::test]
async fn test_unkeyed_reader_sees_placeholder_for_ciphertext_history() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", true).await;
    let _bob = peer(&store, "bob", true).await;
    alice.ctl.open_with(&id("bob")).await.unwrap();
    alice.ctl.send("sealed").await.unwrap();

    // Bob on a device without his key
    let gateway = Arc::new(RecordingGateway::default());
    let mut bob_elsewhere =
        ChatSessionController::new(id("bob"), None, store.clone(), store.clone(), gateway);
    bob_elsewhere.open_with(&id("alice")).await.unwrap();
    assert_eq!(texts(&bob_elsewhere), [UNDECRYPTABLE_PLACEHOLDER]);
}

// ============================================================================
// Live events
// ============================================================================

#[tokio::test]
async fn test_duplicate_and_foreign_events_are_ignored() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", false).await;
    let mut bob = peer(&store, "bob", false).await;
    alice.ctl.open_with(&id("bob")).await.unwrap();
    bob.ctl.open_with(&id("alice")).await.unwrap();

    alice.ctl.send("once").await.unwrap();
    let pushed = alice.gateway.pushed();
    assert!(bob.ctl.handle_event(pushed[0].clone()));
    assert!(!bob.ctl.handle_event(pushed[0].clone()));

    let elsewhere = MessageEnvelope::compose(
        Uuid::new_v4(),
        id("alice"),
        id("bob"),
        MessageContent::Plaintext {
            text: "other thread".into(),
        },
    );
    assert!(!bob.ctl.handle_event(ServerEvent::MessageReceived { envelope: elsewhere }));
    assert_eq!(texts(&bob.ctl), ["once"]);

    // A history reload does not duplicate what arrived live
    bob.ctl.resync().await.unwrap();
    assert_eq!(texts(&bob.ctl), ["once"]);
}

#[tokio::test]
async fn test_presence_snapshot_tracks_peer() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", false).await;
    alice.ctl.open_with(&id("bob")).await.unwrap();
    assert!(!alice.ctl.is_peer_online());

    alice.ctl.handle_event(ServerEvent::PresenceSnapshot {
        online: vec![id("alice"), id("bob")],
    });
    assert!(alice.ctl.is_peer_online());

    alice.ctl.handle_event(ServerEvent::PresenceSnapshot {
        online: vec![id("alice")],
    });
    assert!(!alice.ctl.is_peer_online());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_failed_persist_keeps_message_for_retry() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", true).await;
    let _bob = peer(&store, "bob", true).await;
    alice.ctl.open_with(&id("bob")).await.unwrap();
    let thread = alice.ctl.active_thread().unwrap().id;

    store.failing.store(true, Ordering::SeqCst);
    let report = alice.ctl.send("important").await.unwrap();
    assert!(!report.persisted);
    assert!(report.pushed);
    assert_eq!(alice.ctl.transcript()[0].state, DeliveryState::Failed);
    assert_eq!(alice.ctl.transcript()[0].text, "important");

    // Reloading history keeps the unsent entry
    alice.ctl.load_history().await.unwrap();
    assert_eq!(texts(&alice.ctl), ["important"]);

    store.failing.store(false, Ordering::SeqCst);
    let retried = alice.ctl.retry(report.id).await.unwrap();
    assert!(retried.persisted);
    assert_eq!(retried.id, report.id);
    assert_eq!(alice.ctl.transcript()[0].state, DeliveryState::Sent);

    let stored = store.list_messages(thread).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, report.id);

    assert!(matches!(
        alice.ctl.retry(report.id).await,
        Err(ClientError::UnknownMessage(_))
    ));
}

#[tokio::test]
async fn test_push_failure_does_not_block_persistence() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", false).await;
    alice.ctl.open_with(&id("bob")).await.unwrap();

    alice.gateway.down.store(true, Ordering::SeqCst);
    let report = alice.ctl.send("still stored").await.unwrap();
    assert!(report.persisted);
    assert!(!report.pushed);
    assert_eq!(alice.ctl.transcript()[0].state, DeliveryState::Sent);
}

#[tokio::test]
async fn test_send_requires_open_thread_and_text() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", false).await;
    assert!(matches!(
        alice.ctl.send("hello").await,
        Err(ClientError::NoActiveThread)
    ));

    alice.ctl.open_with(&id("bob")).await.unwrap();
    assert!(matches!(
        alice.ctl.send("   ").await,
        Err(ClientError::EmptyMessage)
    ));
    assert!(alice.ctl.transcript().is_empty());
}

#[tokio::test]
async fn test_opening_foreign_thread_is_rejected() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", false).await;
    let thread = store
        .find_or_create_thread(&id("bob"), &id("carol"))
        .await
        .unwrap();
    assert!(matches!(
        alice.ctl.open_thread(thread).await,
        Err(ClientError::NotAMember)
    ));
    assert!(alice.ctl.active_thread().is_none());
}

// ============================================================================
// Typing
// ============================================================================

fn typing_events(events: &[ClientEvent]) -> Vec<&'static str> {
    events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Typing(_) => Some("typing"),
            ClientEvent::StopTyping(_) => Some("stop-typing"),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_keystrokes_emit_typing_then_stop_after_silence() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", false).await;
    alice.ctl.open_with(&id("bob")).await.unwrap();

    alice.ctl.on_keystroke().await;
    alice.ctl.on_keystroke().await;
    assert!(alice.ctl.is_typing());
    assert_eq!(typing_events(&alice.gateway.take()), ["typing"]);

    tokio::time::advance(Duration::from_millis(1500)).await;
    alice.ctl.tick().await;
    assert!(alice.gateway.take().is_empty());

    // The burst continues past the refresh interval
    alice.ctl.on_keystroke().await;
    assert_eq!(typing_events(&alice.gateway.take()), ["typing"]);

    tokio::time::advance(Duration::from_millis(1999)).await;
    alice.ctl.tick().await;
    assert!(alice.gateway.take().is_empty());

    tokio::time::advance(Duration::from_millis(1)).await;
    alice.ctl.tick().await;
    assert!(!alice.ctl.is_typing());
    let sent = alice.gateway.take();
    assert_eq!(typing_events(&sent), ["stop-typing"]);
    match &sent[0] {
        ClientEvent::StopTyping(notice) => {
            assert_eq!(notice.sender_id, id("alice"));
            assert_eq!(notice.receiver_id, id("bob"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_sending_ends_typing_burst() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", false).await;
    alice.ctl.open_with(&id("bob")).await.unwrap();

    alice.ctl.on_keystroke().await;
    alice.ctl.send("done").await.unwrap();
    assert_eq!(
        typing_events(&alice.gateway.take()),
        ["typing", "stop-typing"]
    );

    // Nothing further once the timer would have fired
    tokio::time::advance(Duration::from_secs(3)).await;
    alice.ctl.tick().await;
    assert!(alice.gateway.take().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_peer_typing_flag_expires_without_stop_typing() {
    let store = Arc::new(FlakyStore::default());
    let mut bob = peer(&store, "bob", false).await;
    bob.ctl.open_with(&id("alice")).await.unwrap();
    let thread = bob.ctl.active_thread().unwrap().id;

    let notice = TypingNotice {
        thread_id: thread,
        sender_id: id("alice"),
        receiver_id: id("bob"),
    };
    assert!(bob.ctl.handle_event(ServerEvent::Typing(notice.clone())));
    assert!(bob.ctl.is_peer_typing());

    tokio::time::advance(Duration::from_millis(1000)).await;
    assert!(bob.ctl.is_peer_typing());

    // The stop-typing event was lost; 2.5 s of silence clears the flag
    tokio::time::advance(Duration::from_millis(1500)).await;
    assert!(!bob.ctl.is_peer_typing());
    bob.ctl.tick().await;
    assert!(!bob.ctl.is_peer_typing());

    // An explicit stop-typing clears it immediately
    bob.ctl.handle_event(ServerEvent::Typing(notice.clone()));
    assert!(bob.ctl.is_peer_typing());
    bob.ctl.handle_event(ServerEvent::StopTyping(notice.clone()));
    assert!(!bob.ctl.is_peer_typing());

    // Typing aimed at someone else's thread is ignored
    let foreign = TypingNotice {
        thread_id: Uuid::new_v4(),
        ..notice
    };
    assert!(!bob.ctl.handle_event(ServerEvent::Typing(foreign)));
    assert!(!bob.ctl.is_peer_typing());
}

#[tokio::test(start_paused = true)]
async fn test_incoming_message_clears_peer_typing() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", false).await;
    let mut bob = peer(&store, "bob", false).await;
    alice.ctl.open_with(&id("bob")).await.unwrap();
    bob.ctl.open_with(&id("alice")).await.unwrap();

    alice.ctl.on_keystroke().await;
    for event in alice.gateway.take() {
        if let ClientEvent::Typing(notice) = event {
            bob.ctl.handle_event(ServerEvent::Typing(notice));
        }
    }
    assert!(bob.ctl.is_peer_typing());

    alice.ctl.send("typed it").await.unwrap();
    for event in alice.gateway.pushed() {
        bob.ctl.handle_event(event);
    }
    assert!(!bob.ctl.is_peer_typing());
    assert_eq!(texts(&bob.ctl), ["typed it"]);
}

#[tokio::test(start_paused = true)]
async fn test_close_clears_state_and_stops_typing() {
    let store = Arc::new(FlakyStore::default());
    let mut alice = peer(&store, "alice", false).await;
    alice.ctl.open_with(&id("bob")).await.unwrap();
    let thread = alice.ctl.active_thread().unwrap().id;

    alice.ctl.on_keystroke().await;
    alice.ctl.handle_event(ServerEvent::Typing(TypingNotice {
        thread_id: thread,
        sender_id: id("bob"),
        receiver_id: id("alice"),
    }));
    assert!(alice.ctl.is_peer_typing());
    alice.gateway.take();

    alice.ctl.close().await;
    assert_eq!(typing_events(&alice.gateway.take()), ["stop-typing"]);
    assert!(!alice.ctl.is_peer_typing());
    assert!(!alice.ctl.is_typing());
    assert!(alice.ctl.active_thread().is_none());
    assert!(alice.ctl.transcript().is_empty());

    // Reopening starts clean
    alice.ctl.open_with(&id("bob")).await.unwrap();
    assert!(!alice.ctl.is_peer_typing());
}
