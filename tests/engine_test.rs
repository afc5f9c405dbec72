use async_trait::async_trait;
use market_chat::engine::ChatEngine;
use market_chat::error::ChatError;
use market_chat::listing::{ ListingRecord, MemoryListingDirectory };
use market_chat::models::chat::{ Chatroom, ListingSummary, Message, MessageStatus, ParticipantRole };
use market_chat::models::events::{ ClientEvent, ServerEvent };
use market_chat::registry::SocketRegistry;
use market_chat::store::{ ChatroomStore, MemoryChatroomStore };
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver };
use tokio::sync::Notify;
use tokio::time::timeout;

struct Harness {
    engine: Arc<ChatEngine>,
    store: Arc<MemoryChatroomStore>,
    directory: Arc<MemoryListingDirectory>,
    registry: Arc<SocketRegistry>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryChatroomStore::new());
    let directory = Arc::new(MemoryListingDirectory::new());
    let registry = Arc::new(SocketRegistry::new());
    let engine = Arc::new(ChatEngine::new(store.clone(), directory.clone(), registry.clone()));
    Harness {
        engine,
        store,
        directory,
        registry,
    }
}

fn seed_listing(directory: &MemoryListingDirectory, id: &str, owner: &str) {
    directory.insert(ListingRecord {
        id: id.to_string(),
        title: format!("listing {}", id),
        owner: owner.to_string(),
        sold: false,
    });
}

fn connect(registry: &SocketRegistry, user: &str) -> (String, UnboundedReceiver<ServerEvent>) {
    let (tx, rx) = unbounded_channel();
    (registry.register(user, tx), rx)
}

fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn send_event(chatroom_id: &str, content: &str, correlation_id: &str) -> ClientEvent {
    ClientEvent::SendMessage {
        chatroom_id: chatroom_id.to_string(),
        content: content.to_string(),
        correlation_id: correlation_id.to_string(),
    }
}

fn join_event(chatroom_id: &str) -> ClientEvent {
    ClientEvent::Join { chatroom_id: chatroom_id.to_string() }
}

fn accepted_message(replies: &[ServerEvent]) -> Message {
    match replies.first() {
        Some(ServerEvent::MessageAccepted { message, .. }) => message.clone(),
        other => panic!("expected a message acknowledgment, got {:?}", other),
    }
}

/// Delegates to the memory store but parks appends to one chatroom
/// until released, so a test can interleave other traffic at the
/// persistence boundary.
struct HeldAppendStore {
    inner: MemoryChatroomStore,
    held_room: Mutex<Option<String>>,
    entered: Notify,
    release: Notify,
}

impl HeldAppendStore {
    fn new() -> Self {
        HeldAppendStore {
            inner: MemoryChatroomStore::new(),
            held_room: Mutex::new(None),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    fn hold_appends_for(&self, chatroom_id: &str) {
        *self.held_room.lock().unwrap() = Some(chatroom_id.to_string());
    }
}

#[async_trait]
impl ChatroomStore for HeldAppendStore {
    async fn create_or_get_chatroom(
        &self,
        listing: &ListingSummary,
        buyer: &str,
        seller: &str
    ) -> Result<(Chatroom, bool), ChatError> {
        self.inner.create_or_get_chatroom(listing, buyer, seller).await
    }

    async fn append_message(
        &self,
        chatroom_id: &str,
        sender: &str,
        content: &str
    ) -> Result<Message, ChatError> {
        let held = self.held_room.lock().unwrap().as_deref() == Some(chatroom_id);
        if held {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.append_message(chatroom_id, sender, content).await
    }

    async fn find_chatroom(&self, chatroom_id: &str) -> Result<Chatroom, ChatError> {
        self.inner.find_chatroom(chatroom_id).await
    }

    async fn list_chatrooms_for_user(&self, user_id: &str) -> Result<Vec<Chatroom>, ChatError> {
        self.inner.list_chatrooms_for_user(user_id).await
    }

    async fn clear_unread(
        &self,
        chatroom_id: &str,
        role: ParticipantRole
    ) -> Result<Vec<String>, ChatError> {
        self.inner.clear_unread(chatroom_id, role).await
    }

    async fn mark_delivered(
        &self,
        chatroom_id: &str,
        message_id: &str
    ) -> Result<Option<Message>, ChatError> {
        self.inner.mark_delivered(chatroom_id, message_id).await
    }

    async fn set_listing_sold(&self, listing_id: &str) -> Result<Vec<String>, ChatError> {
        self.inner.set_listing_sold(listing_id).await
    }
}

struct HeldHarness {
    engine: Arc<ChatEngine>,
    store: Arc<HeldAppendStore>,
    directory: Arc<MemoryListingDirectory>,
    registry: Arc<SocketRegistry>,
}

fn held_harness() -> HeldHarness {
    let store = Arc::new(HeldAppendStore::new());
    let directory = Arc::new(MemoryListingDirectory::new());
    let registry = Arc::new(SocketRegistry::new());
    let engine = Arc::new(ChatEngine::new(store.clone(), directory.clone(), registry.clone()));
    HeldHarness {
        engine,
        store,
        directory,
        registry,
    }
}

#[tokio::test]
async fn send_increments_only_the_recipients_unread_set() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();

    let (conn_a, mut rx_a) = connect(&h.registry, "alice");
    h.engine.handle_event(&conn_a, "alice", join_event(&room.id)).await;

    let replies = h.engine
        .handle_event(&conn_a, "alice", send_event(&room.id, "is it available?", "tmp-1")).await;
    let message = accepted_message(&replies);
    assert_eq!(message.status, MessageStatus::Sent);

    let stored = h.store.find_chatroom(&room.id).await.unwrap();
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.unread_msg_ids_by_seller, vec![message.id.clone()]);
    assert!(stored.unread_msg_ids_by_buyer.is_empty());
    assert_eq!(stored.last_message.unwrap().id, message.id);

    assert_eq!(h.engine.unread().unread_count_for("bob"), 1);
    assert_eq!(h.engine.unread().unread_count_for("alice"), 0);
    assert_eq!(h.engine.unread().chatroom_of(&message.id), Some(room.id.clone()));

    // The sender's own connection gets the ack, not the broadcast.
    assert!(drain(&mut rx_a).is_empty());
}

#[tokio::test]
async fn unread_is_tracked_per_chatroom() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room_a = h.engine.open_chatroom("l1", "alice").await.unwrap();
    let room_c = h.engine.open_chatroom("l1", "carol").await.unwrap();

    let (conn_a, _rx_a) = connect(&h.registry, "alice");
    h.engine.handle_event(&conn_a, "alice", join_event(&room_a.id)).await;
    h.engine.handle_event(&conn_a, "alice", send_event(&room_a.id, "hello", "tmp-1")).await;

    let stored_a = h.store.find_chatroom(&room_a.id).await.unwrap();
    let stored_c = h.store.find_chatroom(&room_c.id).await.unwrap();
    assert_eq!(stored_a.unread_msg_ids_by_seller.len(), 1);
    assert!(stored_c.unread_msg_ids_by_seller.is_empty());
    assert!(stored_c.messages.is_empty());
}

#[tokio::test]
async fn viewed_clears_one_side_idempotently() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();

    let (conn_a, _rx_a) = connect(&h.registry, "alice");
    let (conn_b, mut rx_b) = connect(&h.registry, "bob");
    h.engine.handle_event(&conn_a, "alice", join_event(&room.id)).await;
    h.engine.handle_event(&conn_a, "alice", send_event(&room.id, "one", "tmp-1")).await;
    h.engine.handle_event(&conn_a, "alice", send_event(&room.id, "two", "tmp-2")).await;
    assert_eq!(h.engine.unread().unread_count_for("bob"), 2);

    let viewed = ClientEvent::ViewedBySeller { chatroom_id: room.id.clone() };
    let replies = h.engine.handle_event(&conn_b, "bob", viewed.clone()).await;
    assert!(replies.is_empty());

    let stored = h.store.find_chatroom(&room.id).await.unwrap();
    assert!(stored.unread_msg_ids_by_seller.is_empty());
    assert!(stored.messages.iter().all(|m| m.status == MessageStatus::Read));
    assert_eq!(h.engine.unread().unread_count_for("bob"), 0);

    // Read receipts are never pushed to the other side.
    assert!(drain(&mut rx_b).is_empty());

    let replies = h.engine.handle_event(&conn_b, "bob", viewed).await;
    assert!(replies.is_empty());
}

#[tokio::test]
async fn viewed_role_must_match_the_caller() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();
    let (conn_a, _rx_a) = connect(&h.registry, "alice");

    let replies = h.engine.handle_event(
        &conn_a,
        "alice",
        ClientEvent::ViewedBySeller { chatroom_id: room.id.clone() }
    ).await;
    match replies.first() {
        Some(ServerEvent::Error { kind, retryable, .. }) => {
            assert_eq!(kind, "authorization");
            assert!(!retryable);
        }
        other => panic!("expected an authorization error, got {:?}", other),
    }
}

#[tokio::test]
async fn non_participant_actions_leave_no_trace() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();

    let (conn_a, mut rx_a) = connect(&h.registry, "alice");
    let (conn_m, mut rx_m) = connect(&h.registry, "mallory");
    h.engine.handle_event(&conn_a, "alice", join_event(&room.id)).await;

    // Join by an outsider is silently ignored.
    let replies = h.engine.handle_event(&conn_m, "mallory", join_event(&room.id)).await;
    assert!(replies.is_empty());
    assert!(!h.registry.is_joined(&conn_m, &room.id));

    // A send is rejected outright.
    let replies = h.engine
        .handle_event(&conn_m, "mallory", send_event(&room.id, "let me in", "tmp-1")).await;
    match replies.as_slice() {
        [ServerEvent::Error { kind, correlation_id, .. }] => {
            assert_eq!(kind, "authorization");
            assert_eq!(correlation_id.as_deref(), Some("tmp-1"));
        }
        other => panic!("expected a single authorization error, got {:?}", other),
    }

    let stored = h.store.find_chatroom(&room.id).await.unwrap();
    assert!(stored.messages.is_empty());
    assert!(drain(&mut rx_a).is_empty());
    assert!(drain(&mut rx_m).is_empty());
}

#[tokio::test]
async fn message_stays_sent_until_the_recipient_subscribes() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();

    let (conn_a, _rx_a) = connect(&h.registry, "alice");
    // Bob is connected but has not joined the room's channel.
    let (_conn_b, mut rx_b) = connect(&h.registry, "bob");
    h.engine.handle_event(&conn_a, "alice", join_event(&room.id)).await;

    let replies = h.engine
        .handle_event(&conn_a, "alice", send_event(&room.id, "anyone there?", "tmp-1")).await;
    assert_eq!(accepted_message(&replies).status, MessageStatus::Sent);

    let stored = h.store.find_chatroom(&room.id).await.unwrap();
    assert_eq!(stored.messages[0].status, MessageStatus::Sent);
    assert!(drain(&mut rx_b).is_empty());
}

#[tokio::test]
async fn subscribed_recipient_upgrades_the_message_to_delivered() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();

    let (conn_a, mut rx_a) = connect(&h.registry, "alice");
    let (conn_b, mut rx_b) = connect(&h.registry, "bob");
    h.engine.handle_event(&conn_a, "alice", join_event(&room.id)).await;
    h.engine.handle_event(&conn_b, "bob", join_event(&room.id)).await;

    let replies = h.engine
        .handle_event(&conn_a, "alice", send_event(&room.id, "ping", "tmp-1")).await;
    let acked = accepted_message(&replies);
    assert_eq!(acked.status, MessageStatus::Delivered);

    // Recipient sees the insert first, then the delivery confirmation.
    let bob_events = drain(&mut rx_b);
    match bob_events.as_slice() {
        [
            ServerEvent::InsertMessage { message: inserted },
            ServerEvent::UpdateMessage { message: updated },
        ] => {
            assert_eq!(inserted.status, MessageStatus::Sent);
            assert_eq!(updated.status, MessageStatus::Delivered);
            assert_eq!(inserted.id, updated.id);
        }
        other => panic!("expected insert then update, got {:?}", other),
    }

    // The sender's tab sees only the status update; the insert was its own.
    let alice_events = drain(&mut rx_a);
    match alice_events.as_slice() {
        [ServerEvent::UpdateMessage { message }] => {
            assert_eq!(message.status, MessageStatus::Delivered);
        }
        other => panic!("expected a single update, got {:?}", other),
    }

    // Delivered does not clear unread: bob has not viewed anything.
    let stored = h.store.find_chatroom(&room.id).await.unwrap();
    assert_eq!(stored.unread_msg_ids_by_seller.len(), 1);
}

#[tokio::test]
async fn listing_sold_reaches_every_room_for_that_listing() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    seed_listing(&h.directory, "l2", "bob");
    let room_a = h.engine.open_chatroom("l1", "alice").await.unwrap();
    let room_c = h.engine.open_chatroom("l1", "carol").await.unwrap();
    let room_e = h.engine.open_chatroom("l1", "eve").await.unwrap();
    let room_d = h.engine.open_chatroom("l2", "dave").await.unwrap();

    let (conn_a, mut rx_a) = connect(&h.registry, "alice");
    let (conn_c, mut rx_c) = connect(&h.registry, "carol");
    let (conn_e, mut rx_e) = connect(&h.registry, "eve");
    let (conn_d, mut rx_d) = connect(&h.registry, "dave");
    h.engine.handle_event(&conn_a, "alice", join_event(&room_a.id)).await;
    h.engine.handle_event(&conn_c, "carol", join_event(&room_c.id)).await;
    h.engine.handle_event(&conn_e, "eve", join_event(&room_e.id)).await;
    h.engine.handle_event(&conn_d, "dave", join_event(&room_d.id)).await;

    h.engine.handle_event(&conn_a, "alice", send_event(&room_a.id, "want it", "tmp-1")).await;
    drain(&mut rx_a);

    let notified = h.engine.listing_sold("l1", "bob").await.unwrap();
    assert_eq!(notified, 3);

    for rx in [&mut rx_a, &mut rx_c, &mut rx_e] {
        match drain(rx).as_slice() {
            [ServerEvent::ListingSold { listing_id }] => assert_eq!(listing_id, "l1"),
            other => panic!("expected a sold notice, got {:?}", other),
        }
    }
    assert!(drain(&mut rx_d).is_empty());

    // Histories survive the sale untouched.
    let stored = h.store.find_chatroom(&room_a.id).await.unwrap();
    assert!(stored.listing.sold);
    assert_eq!(stored.messages.len(), 1);

    let err = h.engine.listing_sold("l1", "mallory").await.unwrap_err();
    assert_eq!(err.kind(), "authorization");
}

#[tokio::test]
async fn first_contact_announces_the_room_to_the_seller_once() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");

    // Two tabs for the seller, both should hear about the new room.
    let (_conn_b1, mut rx_b1) = connect(&h.registry, "bob");
    let (_conn_b2, mut rx_b2) = connect(&h.registry, "bob");

    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();
    for rx in [&mut rx_b1, &mut rx_b2] {
        match drain(rx).as_slice() {
            [ServerEvent::AddNewChatroom { chatroom }] => assert_eq!(chatroom.id, room.id),
            other => panic!("expected the new chatroom, got {:?}", other),
        }
    }

    // Reopening is idempotent and quiet.
    let again = h.engine.open_chatroom("l1", "alice").await.unwrap();
    assert_eq!(again.id, room.id);
    assert!(drain(&mut rx_b1).is_empty());
    assert!(drain(&mut rx_b2).is_empty());
}

#[tokio::test]
async fn open_chatroom_validates_listing_and_parties() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");

    let err = h.engine.open_chatroom("l1", "bob").await.unwrap_err();
    assert_eq!(err.kind(), "validation");

    let err = h.engine.open_chatroom("ghost", "alice").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn missing_room_tells_the_client_to_drop_it() {
    let h = harness();
    let (conn_a, _rx_a) = connect(&h.registry, "alice");

    let replies = h.engine
        .handle_event(&conn_a, "alice", send_event("ghost", "hello?", "tmp-1")).await;
    match replies.as_slice() {
        [
            ServerEvent::Error { kind, retryable, correlation_id, .. },
            ServerEvent::DeleteChatroom { chatroom_id },
        ] => {
            assert_eq!(kind, "not_found");
            assert!(!retryable);
            assert_eq!(correlation_id.as_deref(), Some("tmp-1"));
            assert_eq!(chatroom_id, "ghost");
        }
        other => panic!("expected error plus cleanup, got {:?}", other),
    }
}

#[tokio::test]
async fn typing_goes_only_to_the_other_participant() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();

    let (conn_a1, mut rx_a1) = connect(&h.registry, "alice");
    let (conn_a2, mut rx_a2) = connect(&h.registry, "alice");
    let (conn_b, mut rx_b) = connect(&h.registry, "bob");
    h.engine.handle_event(&conn_a1, "alice", join_event(&room.id)).await;
    h.engine.handle_event(&conn_a2, "alice", join_event(&room.id)).await;
    h.engine.handle_event(&conn_b, "bob", join_event(&room.id)).await;

    let start = ClientEvent::StartTyping { chatroom_id: room.id.clone() };
    let replies = h.engine.handle_event(&conn_a1, "alice", start).await;
    assert!(replies.is_empty());

    match drain(&mut rx_b).as_slice() {
        [ServerEvent::Typing { chatroom_id }] => assert_eq!(chatroom_id, &room.id),
        other => panic!("expected a typing notice, got {:?}", other),
    }
    // Neither of the typist's tabs hears their own indicator.
    assert!(drain(&mut rx_a1).is_empty());
    assert!(drain(&mut rx_a2).is_empty());

    let stop = ClientEvent::StopTyping { chatroom_id: room.id.clone() };
    h.engine.handle_event(&conn_a1, "alice", stop).await;
    match drain(&mut rx_b).as_slice() {
        [ServerEvent::StopTyping { chatroom_id }] => assert_eq!(chatroom_id, &room.id),
        other => panic!("expected a stop-typing notice, got {:?}", other),
    }
}

#[tokio::test]
async fn typing_from_an_unjoined_connection_is_rejected() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();

    let (conn_a, _rx_a) = connect(&h.registry, "alice");
    let (conn_b, mut rx_b) = connect(&h.registry, "bob");
    h.engine.handle_event(&conn_b, "bob", join_event(&room.id)).await;

    let replies = h.engine.handle_event(
        &conn_a,
        "alice",
        ClientEvent::StartTyping { chatroom_id: room.id.clone() }
    ).await;
    match replies.first() {
        Some(ServerEvent::Error { kind, .. }) => assert_eq!(kind, "authorization"),
        other => panic!("expected an authorization error, got {:?}", other),
    }
    assert!(drain(&mut rx_b).is_empty());
}

#[tokio::test]
async fn concurrent_sends_to_one_room_both_persist() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();

    let (conn_a, _rx_a) = connect(&h.registry, "alice");
    let (conn_b, _rx_b) = connect(&h.registry, "bob");
    h.engine.handle_event(&conn_a, "alice", join_event(&room.id)).await;
    h.engine.handle_event(&conn_b, "bob", join_event(&room.id)).await;

    let (replies_a, replies_b) = tokio::join!(
        h.engine.handle_event(&conn_a, "alice", send_event(&room.id, "first?", "tmp-a")),
        h.engine.handle_event(&conn_b, "bob", send_event(&room.id, "second?", "tmp-b"))
    );
    let msg_a = accepted_message(&replies_a);
    let msg_b = accepted_message(&replies_b);
    assert_ne!(msg_a.id, msg_b.id);

    let stored = h.store.find_chatroom(&room.id).await.unwrap();
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.unread_msg_ids_by_seller.len(), 1);
    assert_eq!(stored.unread_msg_ids_by_buyer.len(), 1);
}

#[tokio::test]
async fn leave_stops_broadcasts_without_touching_state() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();

    let (conn_a, _rx_a) = connect(&h.registry, "alice");
    let (conn_b, mut rx_b) = connect(&h.registry, "bob");
    h.engine.handle_event(&conn_a, "alice", join_event(&room.id)).await;
    h.engine.handle_event(&conn_b, "bob", join_event(&room.id)).await;

    h.engine.handle_event(
        &conn_b,
        "bob",
        ClientEvent::Leave { chatroom_id: room.id.clone() }
    ).await;

    let replies = h.engine
        .handle_event(&conn_a, "alice", send_event(&room.id, "gone?", "tmp-1")).await;
    assert_eq!(accepted_message(&replies).status, MessageStatus::Sent);
    assert!(drain(&mut rx_b).is_empty());

    // The room itself is unaffected by channel membership.
    let stored = h.store.find_chatroom(&room.id).await.unwrap();
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.unread_msg_ids_by_seller.len(), 1);
}

#[tokio::test]
async fn viewed_during_a_parked_send_keeps_the_badge_exact() {
    let h = held_harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();

    let (conn_a, _rx_a) = connect(&h.registry, "alice");
    let (conn_b, _rx_b) = connect(&h.registry, "bob");
    h.engine.handle_event(&conn_a, "alice", join_event(&room.id)).await;
    h.engine.handle_event(&conn_a, "alice", send_event(&room.id, "first", "tmp-1")).await;
    assert_eq!(h.engine.unread().unread_count_for("bob"), 1);

    h.store.hold_appends_for(&room.id);
    let parked = {
        let engine = h.engine.clone();
        let conn_a = conn_a.clone();
        let room_id = room.id.clone();
        tokio::spawn(async move {
            engine.handle_event(&conn_a, "alice", send_event(&room_id, "second", "tmp-2")).await
        })
    };
    h.store.entered.notified().await;

    // The seller clears the room while the second send sits inside
    // persistence.
    h.engine.handle_event(
        &conn_b,
        "bob",
        ClientEvent::ViewedBySeller { chatroom_id: room.id.clone() }
    ).await;
    assert_eq!(h.engine.unread().unread_count_for("bob"), 0);

    h.store.release.notify_one();
    let message = accepted_message(&parked.await.unwrap());

    // Only the new message is unread; the cleared one stays cleared.
    let stored = h.store.find_chatroom(&room.id).await.unwrap();
    assert_eq!(stored.unread_msg_ids_by_seller, vec![message.id.clone()]);
    assert_eq!(h.engine.unread().unread_count_for("bob"), 1);
    assert_eq!(h.engine.unread().chatroom_of(&message.id), Some(room.id.clone()));
}

#[tokio::test]
async fn a_parked_room_does_not_delay_other_rooms() {
    let h = held_harness();
    seed_listing(&h.directory, "l1", "bob");
    seed_listing(&h.directory, "l2", "dave");
    let room_a = h.engine.open_chatroom("l1", "alice").await.unwrap();
    let room_b = h.engine.open_chatroom("l2", "carol").await.unwrap();

    let (conn_a, _rx_a) = connect(&h.registry, "alice");
    let (conn_c, _rx_c) = connect(&h.registry, "carol");
    h.engine.handle_event(&conn_a, "alice", join_event(&room_a.id)).await;
    h.engine.handle_event(&conn_c, "carol", join_event(&room_b.id)).await;

    h.store.hold_appends_for(&room_a.id);
    let parked = {
        let engine = h.engine.clone();
        let conn_a = conn_a.clone();
        let room_id = room_a.id.clone();
        tokio::spawn(async move {
            engine.handle_event(&conn_a, "alice", send_event(&room_id, "slow room", "tmp-a")).await
        })
    };
    h.store.entered.notified().await;

    // A send to the unrelated room completes while room A sits inside
    // persistence.
    let replies = timeout(
        Duration::from_secs(5),
        h.engine.handle_event(&conn_c, "carol", send_event(&room_b.id, "quick room", "tmp-b"))
    ).await.expect("a send to an unrelated room waited on the parked one");
    accepted_message(&replies);

    h.store.release.notify_one();
    accepted_message(&parked.await.unwrap());

    assert_eq!(h.store.find_chatroom(&room_a.id).await.unwrap().messages.len(), 1);
    assert_eq!(h.store.find_chatroom(&room_b.id).await.unwrap().messages.len(), 1);
}

#[tokio::test]
async fn rest_reads_enforce_membership() {
    let h = harness();
    seed_listing(&h.directory, "l1", "bob");
    let room = h.engine.open_chatroom("l1", "alice").await.unwrap();
    let (conn_a, _rx_a) = connect(&h.registry, "alice");
    h.engine.handle_event(&conn_a, "alice", join_event(&room.id)).await;
    h.engine.handle_event(&conn_a, "alice", send_event(&room.id, "hi", "tmp-1")).await;

    let messages = h.engine.chatroom_messages(&room.id, "bob").await.unwrap();
    assert_eq!(messages.len(), 1);

    let err = h.engine.chatroom_messages(&room.id, "mallory").await.unwrap_err();
    assert_eq!(err.kind(), "authorization");

    let rooms = h.engine.list_chatrooms("alice").await.unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].id, room.id);
    assert!(h.engine.list_chatrooms("mallory").await.unwrap().is_empty());
}
