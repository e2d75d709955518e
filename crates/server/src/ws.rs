use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use server_api::LiveDispatcher;
use shared::{
    domain::ConnectionId,
    error::ApiError,
    protocol::{ClientEvent, ServerEvent},
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::app_state::AppState;

/// Socket senders keyed by connection. This is the live half of presence:
/// the registry says who is where, this table says how to reach them.
#[derive(Default)]
pub(crate) struct ConnectionTable {
    senders: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>>,
}

impl ConnectionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(&self, connection: ConnectionId, sender: mpsc::UnboundedSender<ServerEvent>) {
        let mut senders = self.senders.lock().expect("connection table lock");
        senders.insert(connection, sender);
    }

    fn unregister(&self, connection: ConnectionId) {
        let mut senders = self.senders.lock().expect("connection table lock");
        senders.remove(&connection);
    }
}

#[async_trait]
impl LiveDispatcher for ConnectionTable {
    async fn deliver(&self, connection: ConnectionId, event: ServerEvent) -> anyhow::Result<()> {
        let sender = {
            let senders = self.senders.lock().expect("connection table lock");
            senders.get(&connection).cloned()
        };
        // A connection that already raced away is not an error.
        let Some(sender) = sender else {
            return Ok(());
        };
        sender
            .send(event)
            .map_err(|_| anyhow::anyhow!("connection {} closed mid-delivery", connection.0))
    }
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    use futures::{SinkExt, StreamExt};

    let connection = ConnectionId::new();
    let (sender, mut outbound) = mpsc::unbounded_channel();
    state.connections.register(connection, sender);

    let (mut sink, mut stream) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let event = match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => event,
            Err(error) => {
                debug!(%error, "malformed client event");
                push_error(&state, connection, ApiError::validation("malformed event")).await;
                continue;
            }
        };
        if let Err(error) = handle_client_event(&state, connection, event).await {
            push_error(&state, connection, error).await;
        }
    }

    // Teardown order matters: presence first so broadcasts stop targeting
    // this connection, then the sender entry itself.
    server_api::disconnect(&state.api, connection).await;
    state.connections.unregister(connection);
    send_task.abort();
}

async fn handle_client_event(
    state: &Arc<AppState>,
    connection: ConnectionId,
    event: ClientEvent,
) -> Result<(), ApiError> {
    match event {
        ClientEvent::Join { phone_number } => {
            let delivered = server_api::join_user(&state.api, &phone_number, connection).await?;
            debug!(%phone_number, delivered, "user joined");
        }
        ClientEvent::SendPrivateMessage {
            recipient_phone_number,
            sender_phone_number,
            message,
            timestamp,
        } => {
            server_api::send_message(
                &state.api,
                &sender_phone_number,
                &recipient_phone_number,
                &message,
                false,
                timestamp,
            )
            .await?;
        }
        ClientEvent::OnlineWith {
            phone_number,
            peer_phone_number,
        } => {
            server_api::begin_viewing(&state.api, &phone_number, &peer_phone_number, connection)
                .await?;
        }
        ClientEvent::OfflineWith { phone_number } => {
            server_api::end_viewing(&state.api, &phone_number, connection).await;
        }
        ClientEvent::Online {
            phone_number,
            peer_phone_number,
        } => {
            server_api::announce_presence(&state.api, &phone_number, &peer_phone_number, true)
                .await?;
        }
        ClientEvent::Offline {
            phone_number,
            peer_phone_number,
        } => {
            server_api::announce_presence(&state.api, &phone_number, &peer_phone_number, false)
                .await?;
        }
    }
    Ok(())
}

async fn push_error(state: &Arc<AppState>, connection: ConnectionId, error: ApiError) {
    let _ = state
        .api
        .live
        .deliver(connection, ServerEvent::Error(error))
        .await;
}
