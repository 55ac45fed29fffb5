use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::attachments::AttachmentStore;
use crate::backend::ChatBackend;
use crate::error::{BackendError, BackendResult};
use crate::messages::ServerEvent;
use crate::model::{
    Attachment, ChatMember, ChatRoom, MemberRole, Message, MessageBody, MessageId, MessagePage,
    NewChatRoom, OutgoingMessage, RoomId, RoomType, UserId, UserProfile,
};

type Subscribers = Arc<RwLock<HashMap<UserId, Vec<mpsc::UnboundedSender<ServerEvent>>>>>;

struct RoomEntry {
    room: ChatRoom,
    messages: Vec<Message>,
}

#[derive(Default)]
struct Directory {
    users: HashMap<UserId, UserProfile>,
    rooms: HashMap<RoomId, RoomEntry>,
    message_rooms: HashMap<MessageId, RoomId>,
}

impl Directory {
    fn user(&self, user_id: &str) -> BackendResult<&UserProfile> {
        self.users
            .get(user_id)
            .ok_or_else(|| BackendError::not_found("user", user_id))
    }

    fn room_for_member(&self, user_id: &str, room_id: &str) -> BackendResult<&RoomEntry> {
        let entry = self
            .rooms
            .get(room_id)
            .ok_or_else(|| BackendError::not_found("room", room_id))?;
        if !entry.room.has_member(user_id) {
            return Err(BackendError::Forbidden(format!(
                "{user_id} is not a member of room {room_id}"
            )));
        }
        Ok(entry)
    }

    fn room_for_member_mut(
        &mut self,
        user_id: &str,
        room_id: &str,
    ) -> BackendResult<&mut RoomEntry> {
        self.room_for_member(user_id, room_id)?;
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| BackendError::not_found("room", room_id))
    }
}

/// A single-process chat backend. Rooms and messages live in memory and
/// every mutation is pushed to the subscribed members as a [`ServerEvent`].
#[derive(Clone)]
pub struct InMemoryBackend {
    directory: Arc<RwLock<Directory>>,
    subscribers: Subscribers,
    attachments: AttachmentStore,
}

impl InMemoryBackend {
    pub fn new(max_attachment_bytes: u64) -> Self {
        InMemoryBackend {
            directory: Arc::new(RwLock::new(Directory::default())),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            attachments: AttachmentStore::new(max_attachment_bytes),
        }
    }

    /// Adds or refreshes a user profile. Room memberships pick up the new
    /// profile the next time the room changes.
    pub async fn register_user(&self, profile: UserProfile) {
        let mut directory = self.directory.write().await;
        debug!("Registering user {}", profile.id);
        directory.users.insert(profile.id.clone(), profile);
    }

    pub async fn subscribe(&self, user_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.write().await;
        let senders = subscribers.entry(user_id.to_string()).or_default();
        senders.retain(|sender| !sender.is_closed());
        senders.push(tx);
        rx
    }

    /// Drops the user's closed subscriptions. Subscriptions whose receiver
    /// is still alive are kept.
    pub async fn unsubscribe(&self, user_id: &str) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(senders) = subscribers.get_mut(user_id) {
            senders.retain(|sender| !sender.is_closed());
            if senders.is_empty() {
                subscribers.remove(user_id);
            }
        }
    }

    pub async fn is_subscribed(&self, user_id: &str) -> bool {
        self.subscribers
            .read()
            .await
            .get(user_id)
            .is_some_and(|senders| senders.iter().any(|sender| !sender.is_closed()))
    }

    pub async fn attachment(&self, id: &str) -> Option<(Attachment, Arc<Vec<u8>>)> {
        self.attachments.get(id).await
    }

    async fn broadcast_except(&self, members: &[UserId], event: ServerEvent, except: Option<&str>) {
        let subscribers = self.subscribers.read().await;
        for user_id in members {
            if Some(user_id.as_str()) == except {
                continue;
            }
            if let Some(senders) = subscribers.get(user_id) {
                for sender in senders {
                    let _ = sender.send(event.clone());
                }
            }
        }
    }

    async fn broadcast(&self, members: &[UserId], event: ServerEvent) {
        self.broadcast_except(members, event, None).await;
    }

    async fn mutate_message<F>(
        &self,
        user_id: &str,
        message_id: &str,
        apply: F,
    ) -> BackendResult<Message>
    where
        F: FnOnce(&ChatRoom, &mut Message) -> BackendResult<()> + Send,
    {
        let (message, members) = {
            let mut directory = self.directory.write().await;
            let room_id = directory
                .message_rooms
                .get(message_id)
                .cloned()
                .ok_or_else(|| BackendError::not_found("message", message_id))?;
            let RoomEntry { room, messages } = directory.room_for_member_mut(user_id, &room_id)?;
            let message = messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| BackendError::not_found("message", message_id))?;
            apply(room, message)?;
            (message.clone(), member_ids(room))
        };

        self.broadcast(
            &members,
            ServerEvent::MessageUpdated {
                message: message.clone(),
            },
        )
        .await;
        Ok(message)
    }

    async fn change_membership(
        &self,
        user_id: &str,
        room_id: &str,
        member_id: &str,
        add: bool,
    ) -> BackendResult<ChatRoom> {
        let room = {
            let mut directory = self.directory.write().await;
            let profile = directory.user(member_id)?.clone();
            let entry = directory.room_for_member_mut(user_id, room_id)?;

            let leaving_self = !add && user_id == member_id;
            if !leaving_self && !entry.room.is_admin(user_id) {
                return Err(BackendError::Forbidden(
                    "only room admins can change membership".to_string(),
                ));
            }

            if add {
                if entry.room.room_type == RoomType::Direct {
                    return Err(BackendError::Invalid(
                        "direct rooms cannot gain members".to_string(),
                    ));
                }
                if entry.room.has_member(member_id) {
                    return Ok(entry.room.clone());
                }
                entry.room.members.push(ChatMember {
                    user_id: member_id.to_string(),
                    role: MemberRole::Member,
                    user: profile,
                });
            } else {
                if !entry.room.has_member(member_id) {
                    return Err(BackendError::not_found("member", member_id));
                }
                entry.room.members.retain(|m| m.user_id != member_id);
            }
            entry.room.clone()
        };

        info!(
            "Room {} membership changed: {} {}",
            room.id,
            if add { "added" } else { "removed" },
            member_id
        );
        self.broadcast(
            &member_ids(&room),
            ServerEvent::RoomUpdated { room: room.clone() },
        )
        .await;
        if !add {
            self.broadcast(
                &[member_id.to_string()],
                ServerEvent::MemberRemoved {
                    room_id: room.id.clone(),
                    user_id: member_id.to_string(),
                },
            )
            .await;
        }
        Ok(room)
    }
}

fn member_ids(room: &ChatRoom) -> Vec<UserId> {
    room.members.iter().map(|m| m.user_id.clone()).collect()
}

#[async_trait]
impl ChatBackend for InMemoryBackend {
    async fn list_rooms(&self, user_id: &str) -> BackendResult<Vec<ChatRoom>> {
        let directory = self.directory.read().await;
        directory.user(user_id)?;
        let mut rooms: Vec<ChatRoom> = directory
            .rooms
            .values()
            .filter(|entry| entry.room.has_member(user_id))
            .map(|entry| entry.room.clone())
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(rooms)
    }

    async fn fetch_messages(
        &self,
        user_id: &str,
        room_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> BackendResult<MessagePage> {
        let directory = self.directory.read().await;
        let entry = directory.room_for_member(user_id, room_id)?;

        let end = match before {
            Some(cursor) => entry
                .messages
                .iter()
                .position(|m| m.id == cursor)
                .ok_or_else(|| BackendError::not_found("message", cursor))?,
            None => entry.messages.len(),
        };
        let start = end.saturating_sub(limit.max(1));
        Ok(MessagePage {
            messages: entry.messages[start..end].to_vec(),
            has_more: start > 0,
        })
    }

    async fn send_message(
        &self,
        user_id: &str,
        room_id: &str,
        message: OutgoingMessage,
    ) -> BackendResult<Message> {
        if message.is_empty() {
            return Err(BackendError::Invalid(
                "message has no content and no attachments".to_string(),
            ));
        }
        for attachment in &message.attachments {
            if !self.attachments.contains(&attachment.id).await {
                return Err(BackendError::not_found("attachment", &attachment.id));
            }
        }

        let (created, members) = {
            let mut directory = self.directory.write().await;
            let author = directory.user(user_id)?.summary();
            let entry = directory.room_for_member_mut(user_id, room_id)?;
            if let Some(reply_to) = &message.reply_to_id {
                if !entry.messages.iter().any(|m| &m.id == reply_to) {
                    return Err(BackendError::Invalid(format!(
                        "reply target {reply_to} is not in room {room_id}"
                    )));
                }
            }

            let now = SystemTime::now();
            let created = Message {
                id: Uuid::new_v4().to_string(),
                room_id: room_id.to_string(),
                body: MessageBody::Active {
                    content: message.content.trim().to_string(),
                },
                created_at: now,
                updated_at: now,
                user: author,
                attachments: message.attachments,
                reactions: Vec::new(),
                reply_to_id: message.reply_to_id,
            };
            entry.messages.push(created.clone());
            let members = member_ids(&entry.room);
            directory
                .message_rooms
                .insert(created.id.clone(), room_id.to_string());
            (created, members)
        };

        debug!("Message {} posted to room {}", created.id, room_id);
        self.broadcast(
            &members,
            ServerEvent::MessageCreated {
                message: created.clone(),
            },
        )
        .await;
        Ok(created)
    }

    async fn edit_message(
        &self,
        user_id: &str,
        message_id: &str,
        content: &str,
    ) -> BackendResult<Message> {
        let content = content.trim().to_string();
        if content.is_empty() {
            return Err(BackendError::Invalid("edited content is empty".to_string()));
        }
        self.mutate_message(user_id, message_id, |_, message| {
            if message.user.id != user_id {
                return Err(BackendError::Forbidden(
                    "only the author can edit a message".to_string(),
                ));
            }
            if message.is_deleted() {
                return Err(BackendError::Invalid(format!(
                    "message {message_id} is deleted"
                )));
            }
            message.edit(content, SystemTime::now());
            Ok(())
        })
        .await
    }

    async fn delete_message(&self, user_id: &str, message_id: &str) -> BackendResult<Message> {
        self.mutate_message(user_id, message_id, |room, message| {
            if message.user.id != user_id && !room.is_admin(user_id) {
                return Err(BackendError::Forbidden(
                    "only the author or a room admin can delete a message".to_string(),
                ));
            }
            if !message.is_deleted() {
                message.soft_delete(SystemTime::now());
            }
            Ok(())
        })
        .await
    }

    async fn add_reaction(
        &self,
        user_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> BackendResult<Message> {
        let user = {
            let directory = self.directory.read().await;
            directory.user(user_id)?.summary()
        };
        self.mutate_message(user_id, message_id, |_, message| {
            if message.is_deleted() {
                return Err(BackendError::Invalid(format!(
                    "message {message_id} is deleted"
                )));
            }
            message.add_reaction(&user, emoji);
            Ok(())
        })
        .await
    }

    async fn remove_reaction(
        &self,
        user_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> BackendResult<Message> {
        self.mutate_message(user_id, message_id, |_, message| {
            message.remove_reaction(user_id, emoji);
            Ok(())
        })
        .await
    }

    async fn create_room(&self, user_id: &str, room: NewChatRoom) -> BackendResult<ChatRoom> {
        let name = room.name.trim();
        if name.is_empty() {
            return Err(BackendError::Invalid("room name is empty".to_string()));
        }

        let created = {
            let mut directory = self.directory.write().await;
            let mut members = vec![ChatMember {
                user_id: user_id.to_string(),
                role: MemberRole::Admin,
                user: directory.user(user_id)?.clone(),
            }];
            for member_id in &room.member_ids {
                if members.iter().any(|m| &m.user_id == member_id) {
                    continue;
                }
                members.push(ChatMember {
                    user_id: member_id.clone(),
                    role: MemberRole::Member,
                    user: directory.user(member_id)?.clone(),
                });
            }
            if members.len() < 2 {
                return Err(BackendError::Invalid(
                    "a room needs at least one other member".to_string(),
                ));
            }
            if room.room_type == RoomType::Direct && members.len() != 2 {
                return Err(BackendError::Invalid(
                    "direct rooms have exactly one other member".to_string(),
                ));
            }

            let created = ChatRoom {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                room_type: room.room_type,
                members,
                unread_count: 0,
            };
            directory.rooms.insert(
                created.id.clone(),
                RoomEntry {
                    room: created.clone(),
                    messages: Vec::new(),
                },
            );
            created
        };

        info!("Room {} ({}) created by {}", created.id, created.name, user_id);
        self.broadcast_except(
            &member_ids(&created),
            ServerEvent::RoomCreated {
                room: created.clone(),
            },
            Some(user_id),
        )
        .await;
        Ok(created)
    }

    async fn add_member(
        &self,
        user_id: &str,
        room_id: &str,
        member_id: &str,
    ) -> BackendResult<ChatRoom> {
        self.change_membership(user_id, room_id, member_id, true).await
    }

    async fn remove_member(
        &self,
        user_id: &str,
        room_id: &str,
        member_id: &str,
    ) -> BackendResult<ChatRoom> {
        self.change_membership(user_id, room_id, member_id, false)
            .await
    }

    async fn set_typing(&self, user_id: &str, room_id: &str, typing: bool) -> BackendResult<()> {
        let members = {
            let directory = self.directory.read().await;
            member_ids(&directory.room_for_member(user_id, room_id)?.room)
        };
        let event = if typing {
            ServerEvent::TypingStarted {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            }
        } else {
            ServerEvent::TypingStopped {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            }
        };
        self.broadcast_except(&members, event, Some(user_id)).await;
        Ok(())
    }

    async fn upload_attachment(
        &self,
        user_id: &str,
        name: String,
        content: Vec<u8>,
    ) -> BackendResult<Attachment> {
        self.directory.read().await.user(user_id)?;
        self.attachments.upload(name, content).await
    }
}
