use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use warp::ws::{Message, WebSocket};

use crate::backend::ChatBackend;
use crate::error::{BackendError, BackendResult};
use crate::memory::InMemoryBackend;
use crate::messages::{ClientMessage, ServerEvent, ServerMessage};
use crate::model::{Attachment, UserId, UserProfile};

/// Serves the in-memory backend to WebSocket clients. Each connection
/// identifies as a user, then issues commands and receives that user's
/// pushed events.
/// Per-connection state: the identified user and the task forwarding
/// that user's events to the socket.
#[derive(Default)]
struct Session {
    user_id: Option<UserId>,
    forwarder: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct Server {
    backend: Arc<InMemoryBackend>,
    page_size: usize,
}

impl Server {
    pub fn new(backend: Arc<InMemoryBackend>, page_size: usize) -> Self {
        Server {
            backend,
            page_size: page_size.max(1),
        }
    }

    pub async fn attachment(&self, id: &str) -> Option<(Attachment, Arc<Vec<u8>>)> {
        self.backend.attachment(id).await
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode server message: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    error!("Failed to send WebSocket message: {e}");
                    break;
                }
            }
        });

        let mut session = Session::default();
        while let Some(result) = ws_rx.next().await {
            let msg = match result {
                Ok(msg) => msg,
                Err(e) => {
                    error!("WebSocket error: {e}");
                    break;
                }
            };
            if msg.is_close() {
                break;
            }
            let Ok(text) = msg.to_str() else {
                continue;
            };
            match serde_json::from_str::<ClientMessage>(text) {
                Ok(client_msg) => self.handle_client_message(client_msg, &mut session, &tx).await,
                Err(e) => {
                    warn!("Unparseable client message: {e}");
                    let _ = tx.send(ServerMessage::Error {
                        message: format!("Invalid message: {e}"),
                    });
                }
            }
        }

        self.disconnect(&mut session).await;
    }

    /// Stops forwarding events and releases the user's subscription, which
    /// lets the writer task end once the connection's sender is dropped.
    async fn disconnect(&self, session: &mut Session) {
        if let Some(forwarder) = session.forwarder.take() {
            forwarder.abort();
            let _ = forwarder.await;
        }
        let Some(user_id) = session.user_id.take() else {
            return;
        };
        self.backend.unsubscribe(&user_id).await;
        if self.backend.is_subscribed(&user_id).await {
            info!("User {user_id} disconnected");
        } else {
            info!("User {user_id} disconnected and is offline");
        }
    }

    async fn handle_client_message(
        &self,
        message: ClientMessage,
        session: &mut Session,
        tx: &mpsc::UnboundedSender<ServerMessage>,
    ) {
        let message = match message {
            ClientMessage::Identify { user } => {
                self.identify(user, session, tx).await;
                return;
            }
            other => other,
        };

        let Some(user_id) = session.user_id.as_deref() else {
            let _ = tx.send(ServerMessage::Error {
                message: "Identify before sending commands".to_string(),
            });
            return;
        };

        match self.dispatch(user_id, message).await {
            Ok(Some(reply)) => {
                let _ = tx.send(reply);
            }
            Ok(None) => {}
            Err(e) => {
                debug!("Command from {user_id} failed: {e}");
                let _ = tx.send(ServerMessage::Error {
                    message: e.to_string(),
                });
            }
        }
    }

    async fn identify(
        &self,
        user: UserProfile,
        session: &mut Session,
        tx: &mpsc::UnboundedSender<ServerMessage>,
    ) {
        if session.user_id.is_some() {
            let _ = tx.send(ServerMessage::Error {
                message: "Connection is already identified".to_string(),
            });
            return;
        }
        let user_id = user.id.clone();
        self.backend.register_user(user).await;

        let mut events = self.backend.subscribe(&user_id).await;
        let forward = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if forward.send(ServerMessage::Event { event }).is_err() {
                    break;
                }
            }
        });

        info!("User {user_id} connected");
        let _ = tx.send(ServerMessage::Identified {
            user_id: user_id.clone(),
        });
        session.user_id = Some(user_id);
        session.forwarder = Some(forwarder);
    }

    /// Runs a command. Mutations answer through the pushed events, so only
    /// queries and uploads produce a direct reply.
    async fn dispatch(
        &self,
        user_id: &str,
        message: ClientMessage,
    ) -> BackendResult<Option<ServerMessage>> {
        let backend = &self.backend;
        match message {
            ClientMessage::Identify { .. } => Ok(None),
            ClientMessage::ListRooms => {
                let rooms = backend.list_rooms(user_id).await?;
                Ok(Some(ServerMessage::Rooms { rooms }))
            }
            ClientMessage::FetchMessages {
                room_id,
                before,
                limit,
            } => {
                let limit = limit.unwrap_or(self.page_size).clamp(1, self.page_size);
                let page = backend
                    .fetch_messages(user_id, &room_id, before.as_deref(), limit)
                    .await?;
                Ok(Some(ServerMessage::MessagePage { room_id, page }))
            }
            ClientMessage::SendMessage { room_id, message } => {
                backend.send_message(user_id, &room_id, message).await?;
                Ok(None)
            }
            ClientMessage::EditMessage {
                message_id,
                content,
            } => {
                backend.edit_message(user_id, &message_id, &content).await?;
                Ok(None)
            }
            ClientMessage::DeleteMessage { message_id } => {
                backend.delete_message(user_id, &message_id).await?;
                Ok(None)
            }
            ClientMessage::AddReaction { message_id, emoji } => {
                backend.add_reaction(user_id, &message_id, &emoji).await?;
                Ok(None)
            }
            ClientMessage::RemoveReaction { message_id, emoji } => {
                backend.remove_reaction(user_id, &message_id, &emoji).await?;
                Ok(None)
            }
            ClientMessage::CreateRoom { room } => {
                let room = backend.create_room(user_id, room).await?;
                // The creator is excluded from the room broadcast.
                Ok(Some(ServerMessage::Event {
                    event: ServerEvent::RoomCreated { room },
                }))
            }
            ClientMessage::AddMember {
                room_id,
                user_id: member_id,
            } => {
                backend.add_member(user_id, &room_id, &member_id).await?;
                Ok(None)
            }
            ClientMessage::RemoveMember {
                room_id,
                user_id: member_id,
            } => {
                backend.remove_member(user_id, &room_id, &member_id).await?;
                Ok(None)
            }
            ClientMessage::Typing { room_id, typing } => {
                backend.set_typing(user_id, &room_id, typing).await?;
                Ok(None)
            }
            ClientMessage::UploadAttachment { name, content } => {
                let content = BASE64
                    .decode(content)
                    .map_err(|_| BackendError::Invalid("Invalid file data".to_string()))?;
                let attachment = backend.upload_attachment(user_id, name, content).await?;
                Ok(Some(ServerMessage::AttachmentUploaded { attachment }))
            }
        }
    }
}
