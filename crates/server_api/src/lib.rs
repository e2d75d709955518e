use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConnectionId, MessageStatus, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChatSummary, MessagePayload, ServerEvent, SyncEntry},
};
use storage::{Storage, StoredMessage};
use tracing::warn;

pub mod presence;

pub use presence::PresenceRegistry;

/// Best-effort push of one event to one live connection. The server wires
/// this to the socket layer; tests substitute a recording fake.
#[async_trait]
pub trait LiveDispatcher: Send + Sync {
    async fn deliver(&self, connection: ConnectionId, event: ServerEvent) -> anyhow::Result<()>;
}

/// External push-messaging collaborator. Fire-and-forget from the router's
/// point of view: a failure here never fails the enclosing send.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(
        &self,
        push_token: &str,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Stand-in sender that logs instead of calling a push gateway.
pub struct LoggingNotifier;

#[async_trait]
impl PushNotifier for LoggingNotifier {
    async fn notify(
        &self,
        _push_token: &str,
        title: &str,
        _body: &str,
        _data: serde_json::Value,
    ) -> anyhow::Result<()> {
        tracing::info!(%title, "push notification dispatched");
        Ok(())
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub presence: PresenceRegistry,
    pub live: Arc<dyn LiveDispatcher>,
    pub notifier: Arc<dyn PushNotifier>,
}

/// Routes one send request: resolves both parties, decides the initial
/// status from presence and block state, persists the message, then runs
/// the best-effort delivery side effects. Any failure before the write
/// aborts with nothing stored; push failures after the write are logged
/// and swallowed.
pub async fn send_message(
    ctx: &ApiContext,
    sender_phone: &str,
    receiver_phone: &str,
    content: &str,
    is_encrypted: bool,
    timestamp: DateTime<Utc>,
) -> Result<MessagePayload, ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::validation("content cannot be empty"));
    }

    let sender = resolve(ctx, sender_phone).await?;
    let receiver = resolve(ctx, receiver_phone).await?;
    let chat = ctx
        .storage
        .find_or_create_chat(sender, receiver)
        .await
        .map_err(internal)?;

    // A message to oneself has no delivery semantics: born read.
    if sender == receiver {
        let stored = ctx
            .storage
            .create_message(
                chat.id,
                sender,
                receiver,
                content,
                MessageStatus::Read,
                is_encrypted,
                timestamp,
            )
            .await
            .map_err(internal)?;
        return Ok(payload_from(stored, (sender, sender_phone), (receiver, receiver_phone)));
    }

    let blocked = ctx
        .storage
        .is_blocked(receiver, sender)
        .await
        .map_err(internal)?;
    if blocked {
        // Block is a delivery-time filter: the message is durably stored as
        // sent, but nothing is pushed and no notification goes out.
        let stored = ctx
            .storage
            .create_message(
                chat.id,
                sender,
                receiver,
                content,
                MessageStatus::Sent,
                is_encrypted,
                timestamp,
            )
            .await
            .map_err(internal)?;
        return Ok(payload_from(stored, (sender, sender_phone), (receiver, receiver_phone)));
    }

    match ctx.presence.connection_for(receiver) {
        Some(connection) => {
            let stored = ctx
                .storage
                .create_message(
                    chat.id,
                    sender,
                    receiver,
                    content,
                    MessageStatus::Delivered,
                    is_encrypted,
                    timestamp,
                )
                .await
                .map_err(internal)?;
            let payload =
                payload_from(stored, (sender, sender_phone), (receiver, receiver_phone));

            push_live(
                ctx,
                connection,
                ServerEvent::ReceivePrivateMessage {
                    sender_phone_number: sender_phone.to_string(),
                    message: payload.clone(),
                },
            )
            .await;
            push_live(ctx, connection, ServerEvent::NewMessage).await;

            if !ctx.presence.is_viewing(connection, sender) {
                notify_receiver(ctx, receiver, sender_phone, &payload).await;
            }
            Ok(payload)
        }
        None => {
            let stored = ctx
                .storage
                .create_message(
                    chat.id,
                    sender,
                    receiver,
                    content,
                    MessageStatus::Sent,
                    is_encrypted,
                    timestamp,
                )
                .await
                .map_err(internal)?;
            let payload =
                payload_from(stored, (sender, sender_phone), (receiver, receiver_phone));
            notify_receiver(ctx, receiver, sender_phone, &payload).await;
            Ok(payload)
        }
    }
}

/// Bulk conditional transition over the messages from sender to receiver.
/// Zero changed rows is a success the edge reports as 204.
pub async fn update_statuses(
    ctx: &ApiContext,
    sender_phone: &str,
    receiver_phone: &str,
    previous: MessageStatus,
    current: MessageStatus,
    at_or_before: Option<DateTime<Utc>>,
) -> Result<u64, ApiError> {
    if !previous.can_transition_to(current) {
        return Err(ApiError::validation(format!(
            "illegal status transition {} -> {}",
            previous.as_str(),
            current.as_str()
        )));
    }

    let sender = resolve(ctx, sender_phone).await?;
    let receiver = resolve(ctx, receiver_phone).await?;
    ctx.storage
        .update_message_status(sender, receiver, previous, current, at_or_before)
        .await
        .map_err(internal)
}

/// History of the pair's chat from the requester's side, horizon applied.
/// An absent chat yields an empty list, not an error.
pub async fn pair_messages(
    ctx: &ApiContext,
    requester_phone: &str,
    peer_phone: &str,
) -> Result<Vec<MessagePayload>, ApiError> {
    let requester = resolve(ctx, requester_phone).await?;
    let peer = resolve(ctx, peer_phone).await?;

    let Some(chat) = ctx
        .storage
        .find_chat(requester, peer)
        .await
        .map_err(internal)?
    else {
        return Ok(Vec::new());
    };

    let horizon = ctx
        .storage
        .conversation_for(chat.id, requester)
        .await
        .map_err(internal)?
        .and_then(|conversation| conversation.last_cleared_at);

    let messages = ctx
        .storage
        .visible_messages(chat.id, horizon)
        .await
        .map_err(internal)?;
    Ok(messages
        .into_iter()
        .map(|message| payload_from(message, (requester, requester_phone), (peer, peer_phone)))
        .collect())
}

/// The user's chat list, most recently active first. Every known
/// conversation appears; each one's messages are filtered by the caller's
/// own horizon. A conversation pointing at a missing chat is a hard
/// inconsistency, not a skippable row.
pub async fn chat_list(ctx: &ApiContext, user_phone: &str) -> Result<Vec<ChatSummary>, ApiError> {
    let user = resolve(ctx, user_phone).await?;
    let conversations = ctx
        .storage
        .conversations_for_user(user)
        .await
        .map_err(internal)?;

    let mut summaries = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let (peer, peer_phone) = peer_of_conversation(ctx, user, conversation.chat_id).await?;
        let messages = ctx
            .storage
            .visible_messages(conversation.chat_id, conversation.last_cleared_at)
            .await
            .map_err(internal)?;
        summaries.push(ChatSummary {
            chat_id: conversation.chat_id,
            peer_phone_number: peer_phone.clone(),
            messages: messages
                .into_iter()
                .map(|message| {
                    payload_from(message, (user, user_phone), (peer, peer_phone.as_str()))
                })
                .collect(),
        });
    }

    summaries.sort_by(|a, b| last_activity(b).cmp(&last_activity(a)));
    Ok(summaries)
}

/// Soft-clears the caller's side of the chat with `peer_phone` as of the
/// given instant. `Ok(None)` means no chat exists between the pair.
pub async fn clear_chat(
    ctx: &ApiContext,
    owner_phone: &str,
    peer_phone: &str,
    as_of: DateTime<Utc>,
) -> Result<Option<u64>, ApiError> {
    let owner = resolve(ctx, owner_phone).await?;
    let peer = resolve(ctx, peer_phone).await?;
    ctx.storage
        .clear_conversation(owner, peer, as_of)
        .await
        .map_err(internal)
}

/// Catch-up reconciliation for a reconnecting client: one entry per known
/// conversation (even when empty), each holding the inbound backlog from
/// `max(last_cleared_at, last_synced_at)` onward.
pub async fn sync_messages(
    ctx: &ApiContext,
    user_phone: &str,
    last_synced_at: Option<DateTime<Utc>>,
) -> Result<Vec<SyncEntry>, ApiError> {
    let user = resolve(ctx, user_phone).await?;
    let conversations = ctx
        .storage
        .conversations_for_user(user)
        .await
        .map_err(internal)?;

    let mut entries = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let (peer, peer_phone) = peer_of_conversation(ctx, user, conversation.chat_id).await?;
        let horizon = match (conversation.last_cleared_at, last_synced_at) {
            (Some(cleared), Some(synced)) => Some(cleared.max(synced)),
            (cleared, synced) => cleared.or(synced),
        };
        let messages = ctx
            .storage
            .inbound_messages_since(conversation.chat_id, user, horizon)
            .await
            .map_err(internal)?;
        entries.push(SyncEntry {
            chat_id: conversation.chat_id,
            peer_phone_number: peer_phone.clone(),
            messages: messages
                .into_iter()
                .map(|message| {
                    payload_from(message, (user, user_phone), (peer, peer_phone.as_str()))
                })
                .collect(),
        });
    }
    Ok(entries)
}

/// Marks the user present on `connection`, transitions their pending
/// inbound backlog to delivered (block-aware), and announces them online
/// to every live peer they have not blocked. Returns the catch-up count.
pub async fn join_user(
    ctx: &ApiContext,
    phone: &str,
    connection: ConnectionId,
) -> Result<u64, ApiError> {
    let user = resolve(ctx, phone).await?;
    ctx.presence.join(user, connection);

    let delivered = ctx
        .storage
        .mark_delivered_on_connect(user)
        .await
        .map_err(internal)?;

    broadcast_presence(ctx, user, phone, true).await;
    Ok(delivered)
}

/// Connection-drop handler: clears presence and broadcasts offline.
/// Nothing here is allowed to fail the caller; this runs on teardown.
pub async fn disconnect(ctx: &ApiContext, connection: ConnectionId) -> Option<UserId> {
    let user = ctx.presence.leave(connection)?;
    match ctx.storage.resolve_phone_number(user).await {
        Ok(Some(phone)) => broadcast_presence(ctx, user, &phone, false).await,
        Ok(None) => {}
        Err(error) => warn!(%error, "skipping offline broadcast"),
    }
    Some(user)
}

/// The user opened the thread with `peer_phone`: record the viewing state,
/// mark the peer's delivered messages read, and give the peer a presence
/// notice on their live connection.
pub async fn begin_viewing(
    ctx: &ApiContext,
    phone: &str,
    peer_phone: &str,
    connection: ConnectionId,
) -> Result<u64, ApiError> {
    let user = resolve(ctx, phone).await?;
    let peer = resolve(ctx, peer_phone).await?;

    ctx.presence.set_viewing(connection, peer);
    let read = ctx
        .storage
        .update_message_status(peer, user, MessageStatus::Delivered, MessageStatus::Read, None)
        .await
        .map_err(internal)?;

    if let Some(peer_connection) = ctx.presence.connection_for(peer) {
        push_live(
            ctx,
            peer_connection,
            ServerEvent::PeerOnline {
                phone_number: phone.to_string(),
            },
        )
        .await;
    }
    Ok(read)
}

/// The user left whatever thread they were viewing; the former peer gets
/// an offline notice if they are live.
pub async fn end_viewing(ctx: &ApiContext, phone: &str, connection: ConnectionId) {
    let Some(former_peer) = ctx.presence.clear_viewing(connection) else {
        return;
    };
    if let Some(peer_connection) = ctx.presence.connection_for(former_peer) {
        push_live(
            ctx,
            peer_connection,
            ServerEvent::PeerOffline {
                phone_number: phone.to_string(),
            },
        )
        .await;
    }
}

/// One-shot presence signal aimed at a single peer's connection.
pub async fn announce_presence(
    ctx: &ApiContext,
    phone: &str,
    peer_phone: &str,
    online: bool,
) -> Result<(), ApiError> {
    let peer = resolve(ctx, peer_phone).await?;
    let Some(connection) = ctx.presence.connection_for(peer) else {
        return Ok(());
    };
    let event = if online {
        ServerEvent::PeerOnline {
            phone_number: phone.to_string(),
        }
    } else {
        ServerEvent::PeerOffline {
            phone_number: phone.to_string(),
        }
    };
    push_live(ctx, connection, event).await;
    Ok(())
}

/// Live connections of everyone this user has blocked; presence broadcasts
/// exclude these targets.
pub async fn blocked_connections(
    ctx: &ApiContext,
    user: UserId,
) -> Result<Vec<ConnectionId>, ApiError> {
    let blocked = ctx
        .storage
        .blocked_user_ids(user)
        .await
        .map_err(internal)?;
    Ok(blocked
        .into_iter()
        .filter_map(|id| ctx.presence.connection_for(id))
        .collect())
}

/// Narrow interface the contact service drives. The core owns the block
/// relation because the router consults it on every send.
pub async fn block_user(
    ctx: &ApiContext,
    blocker_phone: &str,
    blocked_phone: &str,
) -> Result<(), ApiError> {
    let blocker = resolve(ctx, blocker_phone).await?;
    let blocked = resolve(ctx, blocked_phone).await?;
    let inserted = ctx
        .storage
        .add_block(blocker, blocked)
        .await
        .map_err(internal)?;
    if !inserted {
        return Err(ApiError::new(ErrorCode::Conflict, "user is already blocked"));
    }
    Ok(())
}

pub async fn unblock_user(
    ctx: &ApiContext,
    blocker_phone: &str,
    blocked_phone: &str,
) -> Result<(), ApiError> {
    let blocker = resolve(ctx, blocker_phone).await?;
    let blocked = resolve(ctx, blocked_phone).await?;
    let removed = ctx
        .storage
        .remove_block(blocker, blocked)
        .await
        .map_err(internal)?;
    if !removed {
        return Err(ApiError::not_found("no block exists for that user"));
    }
    Ok(())
}

async fn broadcast_presence(ctx: &ApiContext, user: UserId, phone: &str, online: bool) {
    let excluded = match blocked_connections(ctx, user).await {
        Ok(connections) => connections,
        Err(error) => {
            warn!(%error, "skipping presence broadcast");
            return;
        }
    };

    for (_, connection) in ctx.presence.connections_except(user) {
        if excluded.contains(&connection) {
            continue;
        }
        let event = if online {
            ServerEvent::PeerOnline {
                phone_number: phone.to_string(),
            }
        } else {
            ServerEvent::PeerOffline {
                phone_number: phone.to_string(),
            }
        };
        push_live(ctx, connection, event).await;
    }
}

async fn notify_receiver(
    ctx: &ApiContext,
    receiver: UserId,
    sender_phone: &str,
    message: &MessagePayload,
) {
    let user = match ctx.storage.user_by_id(receiver).await {
        Ok(Some(user)) => user,
        Ok(None) => return,
        Err(error) => {
            warn!(%error, "push token lookup failed; message already stored");
            return;
        }
    };
    let Some(token) = user.push_token else {
        return;
    };

    let body = if message.is_encrypted {
        "New message".to_string()
    } else {
        message.content.clone()
    };
    let data = serde_json::json!({
        "senderPhoneNumber": sender_phone,
        "chatId": message.chat_id.0,
    });
    if let Err(error) = ctx.notifier.notify(&token, sender_phone, &body, data).await {
        warn!(%error, "push notification failed; message already stored");
    }
}

async fn push_live(ctx: &ApiContext, connection: ConnectionId, event: ServerEvent) {
    if let Err(error) = ctx.live.deliver(connection, event).await {
        warn!(%error, "live delivery failed");
    }
}

async fn resolve(ctx: &ApiContext, phone: &str) -> Result<UserId, ApiError> {
    ctx.storage
        .resolve_user_id(phone)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(format!("no active user with phone number {phone}")))
}

async fn peer_of_conversation(
    ctx: &ApiContext,
    user: UserId,
    chat_id: shared::domain::ChatId,
) -> Result<(UserId, String), ApiError> {
    let chat = ctx
        .storage
        .chat_by_id(chat_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::internal("conversation references a missing chat"))?;
    let peer = chat.peer_of(user);
    let peer_phone = ctx
        .storage
        .resolve_phone_number(peer)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::internal("chat participant missing from user table"))?;
    Ok((peer, peer_phone))
}

fn payload_from(
    message: StoredMessage,
    a: (UserId, &str),
    b: (UserId, &str),
) -> MessagePayload {
    let phone = |id: UserId| {
        if id == a.0 {
            a.1.to_string()
        } else {
            b.1.to_string()
        }
    };
    MessagePayload {
        id: message.id,
        chat_id: message.chat_id,
        sender_phone_number: phone(message.sender_id),
        receiver_phone_number: phone(message.receiver_id),
        content: message.content,
        status: message.status,
        is_encrypted: message.is_encrypted,
        created_at: message.created_at,
    }
}

fn last_activity(summary: &ChatSummary) -> Option<DateTime<Utc>> {
    summary.messages.last().map(|message| message.created_at)
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
