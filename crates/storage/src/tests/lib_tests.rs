use super::*;
use chrono::TimeZone;

async fn setup() -> (Storage, UserId, UserId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let alice = storage
        .create_user("+15550001", Some("Alice"), None)
        .await
        .expect("alice");
    let bob = storage
        .create_user("+15550002", Some("Bob"), None)
        .await
        .expect("bob");
    (storage, alice, bob)
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn resolves_active_users_only() {
    let (storage, alice, _) = setup().await;

    let resolved = storage
        .resolve_user_id("+15550001")
        .await
        .expect("resolve")
        .expect("alice exists");
    assert_eq!(resolved, alice);

    assert!(storage.mark_user_deleted(alice).await.expect("delete"));
    let gone = storage.resolve_user_id("+15550001").await.expect("resolve");
    assert_eq!(gone, None);

    // The row itself survives; only the directory stops resolving it.
    let phone = storage
        .resolve_phone_number(alice)
        .await
        .expect("resolve phone");
    assert_eq!(phone.as_deref(), Some("+15550001"));
}

#[tokio::test]
async fn chat_lookup_is_symmetric_and_idempotent() {
    let (storage, alice, bob) = setup().await;

    let first = storage.find_or_create_chat(alice, bob).await.expect("chat");
    let second = storage.find_or_create_chat(bob, alice).await.expect("chat");
    assert_eq!(first.id, second.id);

    let found = storage
        .find_chat(bob, alice)
        .await
        .expect("find")
        .expect("exists");
    assert_eq!(found.id, first.id);

    // Exactly one conversation row per participant.
    assert!(storage
        .conversation_for(first.id, alice)
        .await
        .expect("conv")
        .is_some());
    assert!(storage
        .conversation_for(first.id, bob)
        .await
        .expect("conv")
        .is_some());
}

#[tokio::test]
async fn concurrent_chat_creation_yields_one_chat() {
    let (storage, alice, bob) = setup().await;

    let storage_a = storage.clone();
    let storage_b = storage.clone();
    let (left, right) = tokio::join!(
        async move { storage_a.find_or_create_chat(alice, bob).await.expect("left") },
        async move { storage_b.find_or_create_chat(bob, alice).await.expect("right") }
    );
    assert_eq!(left.id, right.id);
}

#[tokio::test]
async fn self_chat_gets_a_single_conversation_row() {
    let (storage, alice, _) = setup().await;

    let chat = storage
        .find_or_create_chat(alice, alice)
        .await
        .expect("self chat");
    assert_eq!(chat.user_a, alice);
    assert_eq!(chat.user_b, alice);
    assert_eq!(chat.peer_of(alice), alice);

    let conversations = storage
        .conversations_for_user(alice)
        .await
        .expect("conversations");
    assert_eq!(conversations.len(), 1);
}

#[tokio::test]
async fn bulk_status_update_only_moves_matching_rows() {
    let (storage, alice, bob) = setup().await;
    let chat = storage.find_or_create_chat(alice, bob).await.expect("chat");

    storage
        .create_message(chat.id, alice, bob, "one", MessageStatus::Sent, false, at(9, 0))
        .await
        .expect("one");
    storage
        .create_message(chat.id, alice, bob, "two", MessageStatus::Read, false, at(9, 5))
        .await
        .expect("two");

    let moved = storage
        .update_message_status(alice, bob, MessageStatus::Sent, MessageStatus::Delivered, None)
        .await
        .expect("update");
    assert_eq!(moved, 1);

    // A message already read is immune to a stray delivered update.
    let messages = storage.visible_messages(chat.id, None).await.expect("messages");
    assert_eq!(messages[0].status, MessageStatus::Delivered);
    assert_eq!(messages[1].status, MessageStatus::Read);

    let nothing = storage
        .update_message_status(alice, bob, MessageStatus::Sent, MessageStatus::Delivered, None)
        .await
        .expect("update");
    assert_eq!(nothing, 0, "zero matched rows is a valid outcome");
}

#[tokio::test]
async fn bulk_status_update_respects_time_bound() {
    let (storage, alice, bob) = setup().await;
    let chat = storage.find_or_create_chat(alice, bob).await.expect("chat");

    storage
        .create_message(chat.id, alice, bob, "early", MessageStatus::Sent, false, at(9, 0))
        .await
        .expect("early");
    storage
        .create_message(chat.id, alice, bob, "late", MessageStatus::Sent, false, at(11, 0))
        .await
        .expect("late");

    let moved = storage
        .update_message_status(
            alice,
            bob,
            MessageStatus::Sent,
            MessageStatus::Delivered,
            Some(at(10, 0)),
        )
        .await
        .expect("update");
    assert_eq!(moved, 1);

    let messages = storage.visible_messages(chat.id, None).await.expect("messages");
    assert_eq!(messages[0].status, MessageStatus::Delivered);
    assert_eq!(messages[1].status, MessageStatus::Sent);
}

#[tokio::test]
async fn connect_catchup_skips_blocked_senders() {
    let (storage, alice, bob) = setup().await;
    let carol = storage
        .create_user("+15550003", Some("Carol"), None)
        .await
        .expect("carol");

    let from_alice = storage.find_or_create_chat(alice, bob).await.expect("chat");
    let from_carol = storage.find_or_create_chat(carol, bob).await.expect("chat");
    storage
        .create_message(from_alice.id, alice, bob, "hi", MessageStatus::Sent, false, at(9, 0))
        .await
        .expect("msg");
    storage
        .create_message(from_carol.id, carol, bob, "yo", MessageStatus::Sent, false, at(9, 1))
        .await
        .expect("msg");

    assert!(storage.add_block(bob, carol).await.expect("block"));

    let delivered = storage.mark_delivered_on_connect(bob).await.expect("catchup");
    assert_eq!(delivered, 1);

    let blocked_backlog = storage
        .visible_messages(from_carol.id, None)
        .await
        .expect("messages");
    assert_eq!(blocked_backlog[0].status, MessageStatus::Sent);

    // Lifting the block releases the backlog on the next connect.
    assert!(storage.remove_block(bob, carol).await.expect("unblock"));
    let delivered = storage.mark_delivered_on_connect(bob).await.expect("catchup");
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn clearing_hides_history_for_one_side_only() {
    let (storage, alice, bob) = setup().await;
    let chat = storage.find_or_create_chat(alice, bob).await.expect("chat");

    storage
        .create_message(chat.id, alice, bob, "old", MessageStatus::Read, false, at(9, 0))
        .await
        .expect("old");
    storage
        .create_message(chat.id, bob, alice, "new", MessageStatus::Read, false, at(12, 0))
        .await
        .expect("new");

    let cleared = storage
        .clear_conversation(bob, alice, at(10, 0))
        .await
        .expect("clear");
    assert_eq!(cleared, Some(1));

    let bob_view = storage
        .conversation_for(chat.id, bob)
        .await
        .expect("conv")
        .expect("exists");
    assert!(bob_view.is_deleted);
    let bob_messages = storage
        .visible_messages(chat.id, bob_view.last_cleared_at)
        .await
        .expect("messages");
    assert_eq!(bob_messages.len(), 1);
    assert_eq!(bob_messages[0].content, "new");

    // Alice's view is untouched, and the rows themselves survive.
    let alice_view = storage
        .conversation_for(chat.id, alice)
        .await
        .expect("conv")
        .expect("exists");
    assert!(!alice_view.is_deleted);
    let alice_messages = storage
        .visible_messages(chat.id, alice_view.last_cleared_at)
        .await
        .expect("messages");
    assert_eq!(alice_messages.len(), 2);
}

#[tokio::test]
async fn clearing_without_a_chat_is_a_noop_success() {
    let (storage, alice, bob) = setup().await;
    let cleared = storage
        .clear_conversation(alice, bob, at(10, 0))
        .await
        .expect("clear");
    assert_eq!(cleared, None);
}

#[tokio::test]
async fn sync_backlog_is_inbound_only_and_since_inclusive() {
    let (storage, alice, bob) = setup().await;
    let chat = storage.find_or_create_chat(alice, bob).await.expect("chat");

    storage
        .create_message(chat.id, alice, bob, "inbound-early", MessageStatus::Sent, false, at(8, 0))
        .await
        .expect("msg");
    storage
        .create_message(chat.id, alice, bob, "inbound-exact", MessageStatus::Sent, false, at(9, 0))
        .await
        .expect("msg");
    storage
        .create_message(chat.id, bob, alice, "outbound", MessageStatus::Sent, false, at(9, 30))
        .await
        .expect("msg");
    storage
        .create_message(chat.id, alice, bob, "inbound-late", MessageStatus::Sent, false, at(10, 0))
        .await
        .expect("msg");

    let backlog = storage
        .inbound_messages_since(chat.id, bob, Some(at(9, 0)))
        .await
        .expect("backlog");
    let contents: Vec<_> = backlog.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["inbound-exact", "inbound-late"]);
}

#[tokio::test]
async fn duplicate_block_is_reported_not_inserted() {
    let (storage, alice, bob) = setup().await;
    assert!(storage.add_block(alice, bob).await.expect("block"));
    assert!(!storage.add_block(alice, bob).await.expect("block again"));
    assert!(storage.is_blocked(alice, bob).await.expect("check"));
    // Directed: the reverse relation does not exist.
    assert!(!storage.is_blocked(bob, alice).await.expect("check"));

    let blocked = storage.blocked_user_ids(alice).await.expect("list");
    assert_eq!(blocked, vec![bob]);
}

#[tokio::test]
async fn rejects_empty_message_content() {
    let (storage, alice, bob) = setup().await;
    let chat = storage.find_or_create_chat(alice, bob).await.expect("chat");
    let result = storage
        .create_message(chat.id, alice, bob, "", MessageStatus::Sent, false, at(9, 0))
        .await;
    assert!(result.is_err());
}
