use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::ChatBackend;
use crate::error::{BackendResult, ChatError, ChatResult};
use crate::messages::ServerEvent;
use crate::model::{
    Attachment, ChatRoom, Message, MessageBody, MessageId, NewChatRoom, OutgoingMessage, RoomId,
    RoomType, UserId, UserSummary,
};
use crate::mutation::{MutationKind, MutationLog, MutationRecord};
use crate::settings::Settings;
use crate::typing::{TypingThrottle, TypingTracker};

/// Prefix of the placeholder ids given to messages that are still being sent.
pub const LOCAL_ID_PREFIX: &str = "local-";

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Idle,
    Loading,
    Ready,
    LoadingMore,
}

#[derive(Default)]
struct SessionState {
    rooms: Vec<ChatRoom>,
    current_room: Option<RoomId>,
    messages: Vec<Message>,
    has_more_messages: bool,
    load_state: LoadState,
    // Bumped on every room switch; loads started under an older value are stale.
    load_generation: u64,
    mutations: MutationLog,
}

impl SessionState {
    fn is_current(&self, room_id: &str) -> bool {
        self.current_room.as_deref() == Some(room_id)
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    fn replace_message(&mut self, message: Message) -> bool {
        match self.message_mut(&message.id) {
            Some(existing) => {
                *existing = message;
                true
            }
            None => false,
        }
    }

    fn upsert_room(&mut self, room: ChatRoom) {
        match self.rooms.iter_mut().find(|r| r.id == room.id) {
            Some(existing) => {
                let unread_count = existing.unread_count;
                *existing = ChatRoom {
                    unread_count,
                    ..room
                };
            }
            None => self.rooms.push(room),
        }
    }

    /// Drops a room from the list. Returns true when it was the active room.
    fn forget_room(&mut self, room_id: &str) -> bool {
        self.rooms.retain(|r| r.id != room_id);
        if !self.is_current(room_id) {
            return false;
        }
        self.current_room = None;
        self.messages.clear();
        self.has_more_messages = false;
        self.load_state = LoadState::Idle;
        self.load_generation += 1;
        true
    }
}

/// Point-in-time copy of the session, handed to the view layer.
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub current_user: UserSummary,
    pub rooms: Vec<ChatRoom>,
    pub current_room_id: Option<RoomId>,
    pub current_room: Option<ChatRoom>,
    pub messages: Vec<Message>,
    pub has_more_messages: bool,
    pub load_state: LoadState,
    pub typing_users: Vec<UserId>,
    pub pending_message_ids: HashSet<MessageId>,
    pub recent_failures: Vec<MutationRecord>,
}

impl ChatSnapshot {
    pub fn is_loading_messages(&self) -> bool {
        matches!(self.load_state, LoadState::Loading | LoadState::LoadingMore)
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending_message_ids.contains(message_id)
    }

    /// Display names of the typing users, falling back to the raw id for
    /// users missing from the room's member list.
    pub fn typing_names(&self) -> Vec<String> {
        self.typing_users
            .iter()
            .map(|id| {
                self.current_room
                    .as_ref()
                    .and_then(|room| room.member(id))
                    .map_or_else(|| id.clone(), |member| member.user.display_name())
            })
            .collect()
    }
}

/// Trims and checks a room creation request before it reaches the backend.
pub fn validate_new_room(
    name: &str,
    room_type: RoomType,
    member_ids: &[UserId],
) -> ChatResult<NewChatRoom> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::EmptyRoomName);
    }
    if member_ids.is_empty() {
        return Err(ChatError::NoRoomMembers);
    }
    Ok(NewChatRoom {
        name: name.to_string(),
        room_type,
        member_ids: member_ids.to_vec(),
    })
}

fn ensure_confirmed(message: &Message) -> ChatResult<()> {
    if is_local_id(&message.id) {
        return Err(ChatError::MessagePending(message.id.clone()));
    }
    Ok(())
}

/// Owns the state of one user's chat session: the room list, the active
/// room's message window, its typing users and the optimistic mutations in
/// flight. Views read it through [`ChatProvider::snapshot`].
pub struct ChatProvider<B> {
    backend: Arc<B>,
    current_user: UserSummary,
    page_size: usize,
    state: RwLock<SessionState>,
    typing: TypingTracker,
    throttle: Mutex<TypingThrottle>,
}

impl<B: ChatBackend> ChatProvider<B> {
    pub fn new(backend: Arc<B>, current_user: UserSummary, settings: &Settings) -> Self {
        ChatProvider {
            backend,
            current_user,
            page_size: settings.page_size.max(1),
            state: RwLock::new(SessionState::default()),
            typing: TypingTracker::new(settings.typing_expiry()),
            throttle: Mutex::new(TypingThrottle::new(settings.typing_throttle())),
        }
    }

    pub fn current_user(&self) -> &UserSummary {
        &self.current_user
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        let typing_users = self.typing.users().await;
        let state = self.state.read().await;
        let current_room = state
            .current_room
            .as_ref()
            .and_then(|id| state.rooms.iter().find(|r| &r.id == id))
            .cloned();
        ChatSnapshot {
            current_user: self.current_user.clone(),
            rooms: state.rooms.clone(),
            current_room_id: state.current_room.clone(),
            current_room,
            messages: state.messages.clone(),
            has_more_messages: state.has_more_messages,
            load_state: state.load_state,
            typing_users,
            pending_message_ids: state.mutations.pending_message_ids().into_iter().collect(),
            recent_failures: state.mutations.recent_failures(),
        }
    }

    async fn current_room_id(&self) -> Option<RoomId> {
        self.state.read().await.current_room.clone()
    }

    pub async fn load_rooms(&self) -> ChatResult<Vec<ChatRoom>> {
        let rooms = self.backend.list_rooms(&self.current_user.id).await?;
        let mut state = self.state.write().await;
        for room in &rooms {
            state.upsert_room(room.clone());
        }
        state.rooms.retain(|r| rooms.iter().any(|fresh| fresh.id == r.id));
        Ok(state.rooms.clone())
    }

    /// Switches the active room and loads its newest page of messages.
    /// A load that finishes after a later switch is discarded.
    pub async fn select_room(&self, room_id: &str) -> ChatResult<()> {
        if let Err(e) = self.stop_typing().await {
            warn!("Failed to send typing stop before switching rooms: {e}");
        }

        let generation = {
            let mut state = self.state.write().await;
            state.load_generation += 1;
            state.current_room = Some(room_id.to_string());
            state.messages.clear();
            state.has_more_messages = false;
            state.load_state = LoadState::Loading;
            if let Some(room) = state.rooms.iter_mut().find(|r| r.id == room_id) {
                room.unread_count = 0;
            }
            state.load_generation
        };
        self.typing.reset().await;
        info!("Selecting chat room {room_id}");

        let result = self
            .backend
            .fetch_messages(&self.current_user.id, room_id, None, self.page_size)
            .await;

        let mut state = self.state.write().await;
        if state.load_generation != generation {
            debug!("Discarding stale message load for room {room_id}");
            return Ok(());
        }
        state.load_state = LoadState::Ready;
        match result {
            Ok(page) => {
                // Keep anything pushed while the page was in flight.
                let live = std::mem::replace(&mut state.messages, page.messages);
                for message in live {
                    if !state.messages.iter().any(|m| m.id == message.id) {
                        state.messages.push(message);
                    }
                }
                state.has_more_messages = page.has_more;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load messages for room {room_id}: {e}");
                Err(e.into())
            }
        }
    }

    /// Prepends the next older page. Returns how many messages were added.
    pub async fn load_more_messages(&self) -> ChatResult<usize> {
        let (room_id, cursor, generation) = {
            let mut state = self.state.write().await;
            if state.load_state != LoadState::Ready || !state.has_more_messages {
                return Ok(0);
            }
            let Some(room_id) = state.current_room.clone() else {
                return Ok(0);
            };
            let cursor = state
                .messages
                .iter()
                .find(|m| !is_local_id(&m.id))
                .map(|m| m.id.clone());
            state.load_state = LoadState::LoadingMore;
            (room_id, cursor, state.load_generation)
        };

        let result = self
            .backend
            .fetch_messages(
                &self.current_user.id,
                &room_id,
                cursor.as_deref(),
                self.page_size,
            )
            .await;

        let mut state = self.state.write().await;
        if state.load_generation != generation {
            return Ok(0);
        }
        state.load_state = LoadState::Ready;
        match result {
            Ok(page) => {
                let older: Vec<Message> = page
                    .messages
                    .into_iter()
                    .filter(|m| !state.messages.iter().any(|loaded| loaded.id == m.id))
                    .collect();
                let added = older.len();
                state.messages.splice(0..0, older);
                state.has_more_messages = page.has_more;
                debug!("Loaded {added} older messages in room {room_id}");
                Ok(added)
            }
            Err(e) => {
                warn!("Failed to load older messages for room {room_id}: {e}");
                Err(e.into())
            }
        }
    }

    /// Appends the message optimistically and replaces it with the backend's
    /// copy once confirmed. On failure the placeholder is removed.
    pub async fn send_message(&self, draft: OutgoingMessage) -> ChatResult<Message> {
        if draft.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let outgoing = OutgoingMessage {
            content: draft.content.trim().to_string(),
            ..draft
        };
        let local_id = format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4());

        let (room_id, mutation) = {
            let mut state = self.state.write().await;
            let room_id = state.current_room.clone().ok_or(ChatError::NoActiveRoom)?;
            let now = SystemTime::now();
            state.messages.push(Message {
                id: local_id.clone(),
                room_id: room_id.clone(),
                body: MessageBody::Active {
                    content: outgoing.content.clone(),
                },
                created_at: now,
                updated_at: now,
                user: self.current_user.clone(),
                attachments: outgoing.attachments.clone(),
                reactions: Vec::new(),
                reply_to_id: outgoing.reply_to_id.clone(),
            });
            let mutation = state.mutations.begin(MutationKind::Send, &local_id);
            (room_id, mutation)
        };

        let result = self
            .backend
            .send_message(&self.current_user.id, &room_id, outgoing)
            .await;

        let mut state = self.state.write().await;
        match result {
            Ok(message) => {
                // The push event can beat the response; never show the message twice.
                let delivered = state.messages.iter().any(|m| m.id == message.id);
                if let Some(pos) = state.messages.iter().position(|m| m.id == local_id) {
                    if delivered {
                        state.messages.remove(pos);
                    } else {
                        state.messages[pos] = message.clone();
                    }
                }
                state.mutations.commit(mutation, Some(&message.id));
                Ok(message)
            }
            Err(e) => {
                warn!("Failed to send message to room {room_id}: {e}");
                state.messages.retain(|m| m.id != local_id);
                state.mutations.fail(mutation, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Returns false without contacting the backend when the content is unchanged.
    pub async fn edit_message(&self, message_id: &str, content: &str) -> ChatResult<bool> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let user_id = self.current_user.id.as_str();
        self.mutate_message(
            MutationKind::Edit,
            message_id,
            |message| {
                ensure_confirmed(message)?;
                match message.content() {
                    None => return Err(ChatError::MessageDeleted(message.id.clone())),
                    Some(existing) if existing == content => return Ok(false),
                    Some(_) => {}
                }
                if message.user.id != user_id {
                    return Err(ChatError::NotAuthor(message.id.clone()));
                }
                message.edit(content.to_string(), SystemTime::now());
                Ok(true)
            },
            || self.backend.edit_message(user_id, message_id, content),
        )
        .await
    }

    pub async fn delete_message(&self, message_id: &str) -> ChatResult<bool> {
        let user_id = self.current_user.id.as_str();
        let is_admin = {
            let state = self.state.read().await;
            state
                .current_room
                .as_ref()
                .and_then(|id| state.rooms.iter().find(|r| &r.id == id))
                .is_some_and(|room| room.is_admin(user_id))
        };
        self.mutate_message(
            MutationKind::Delete,
            message_id,
            |message| {
                ensure_confirmed(message)?;
                if message.is_deleted() {
                    return Ok(false);
                }
                if message.user.id != user_id && !is_admin {
                    return Err(ChatError::NotAuthor(message.id.clone()));
                }
                message.soft_delete(SystemTime::now());
                Ok(true)
            },
            || self.backend.delete_message(user_id, message_id),
        )
        .await
    }

    pub async fn add_reaction(&self, message_id: &str, emoji: &str) -> ChatResult<bool> {
        let user = &self.current_user;
        self.mutate_message(
            MutationKind::AddReaction,
            message_id,
            |message| {
                ensure_confirmed(message)?;
                if message.is_deleted() {
                    return Err(ChatError::MessageDeleted(message.id.clone()));
                }
                Ok(message.add_reaction(user, emoji))
            },
            || self.backend.add_reaction(&user.id, message_id, emoji),
        )
        .await
    }

    pub async fn remove_reaction(&self, message_id: &str, emoji: &str) -> ChatResult<bool> {
        let user_id = self.current_user.id.as_str();
        self.mutate_message(
            MutationKind::RemoveReaction,
            message_id,
            |message| {
                ensure_confirmed(message)?;
                Ok(message.remove_reaction(user_id, emoji))
            },
            || self.backend.remove_reaction(user_id, message_id, emoji),
        )
        .await
    }

    /// Adds the reaction unless the current user already has it, in which
    /// case it is removed. Returns whether the user now has the reaction.
    pub async fn toggle_reaction(&self, message_id: &str, emoji: &str) -> ChatResult<bool> {
        let reacted = {
            let state = self.state.read().await;
            state
                .messages
                .iter()
                .find(|m| m.id == message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?
                .has_reacted(&self.current_user.id, emoji)
        };
        if reacted {
            self.remove_reaction(message_id, emoji).await?;
        } else {
            self.add_reaction(message_id, emoji).await?;
        }
        Ok(!reacted)
    }

    /// Sends a typing signal for the active room, at most once per throttle
    /// window. Returns whether a signal went out.
    pub async fn start_typing(&self) -> ChatResult<bool> {
        let Some(room_id) = self.current_room_id().await else {
            return Ok(false);
        };
        if !self.throttle.lock().await.should_start(Instant::now()) {
            return Ok(false);
        }
        self.backend
            .set_typing(&self.current_user.id, &room_id, true)
            .await?;
        Ok(true)
    }

    pub async fn stop_typing(&self) -> ChatResult<bool> {
        let Some(room_id) = self.current_room_id().await else {
            return Ok(false);
        };
        if !self.throttle.lock().await.should_stop() {
            return Ok(false);
        }
        self.backend
            .set_typing(&self.current_user.id, &room_id, false)
            .await?;
        Ok(true)
    }

    pub async fn create_chat_room(
        &self,
        name: &str,
        room_type: RoomType,
        member_ids: &[UserId],
    ) -> ChatResult<ChatRoom> {
        let request = validate_new_room(name, room_type, member_ids)?;
        let room = self
            .backend
            .create_room(&self.current_user.id, request)
            .await?;
        info!("Created chat room {} ({})", room.id, room.name);
        self.state.write().await.upsert_room(room.clone());
        if let Err(e) = self.select_room(&room.id).await {
            warn!("Created chat room {} but failed to open it: {e}", room.id);
        }
        Ok(room)
    }

    pub async fn add_member_to_chat_room(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> ChatResult<ChatRoom> {
        let room = self
            .backend
            .add_member(&self.current_user.id, room_id, user_id)
            .await?;
        self.state.write().await.upsert_room(room.clone());
        Ok(room)
    }

    pub async fn remove_member_from_chat_room(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> ChatResult<ChatRoom> {
        let room = self
            .backend
            .remove_member(&self.current_user.id, room_id, user_id)
            .await?;
        if user_id == self.current_user.id {
            self.forget_room(room_id).await;
        } else {
            self.state.write().await.upsert_room(room.clone());
        }
        Ok(room)
    }

    pub async fn upload_attachment(&self, name: String, content: Vec<u8>) -> ChatResult<Attachment> {
        let attachment = self
            .backend
            .upload_attachment(&self.current_user.id, name, content)
            .await?;
        Ok(attachment)
    }

    /// Applies an update pushed by the backend.
    pub async fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::MessageCreated { message } => {
                let author = message.user.id.clone();
                let is_current = {
                    let mut state = self.state.write().await;
                    if state.is_current(&message.room_id) {
                        if !state.replace_message(message.clone()) {
                            state.messages.push(message);
                        }
                        true
                    } else {
                        if author != self.current_user.id {
                            if let Some(room) =
                                state.rooms.iter_mut().find(|r| r.id == message.room_id)
                            {
                                room.unread_count += 1;
                            }
                        }
                        false
                    }
                };
                if is_current {
                    self.typing.clear(&author).await;
                }
            }
            ServerEvent::MessageUpdated { message } => {
                let mut state = self.state.write().await;
                if state.is_current(&message.room_id) {
                    state.replace_message(message);
                }
            }
            ServerEvent::TypingStarted { room_id, user_id } => {
                if user_id != self.current_user.id
                    && self.state.read().await.is_current(&room_id)
                {
                    self.typing.observe(&user_id).await;
                }
            }
            ServerEvent::TypingStopped { room_id, user_id } => {
                if self.state.read().await.is_current(&room_id) {
                    self.typing.clear(&user_id).await;
                }
            }
            ServerEvent::RoomCreated { room } | ServerEvent::RoomUpdated { room } => {
                self.state.write().await.upsert_room(room);
            }
            ServerEvent::MemberRemoved { room_id, user_id } => {
                if user_id == self.current_user.id {
                    self.forget_room(&room_id).await;
                } else {
                    let mut state = self.state.write().await;
                    if let Some(room) = state.rooms.iter_mut().find(|r| r.id == room_id) {
                        room.members.retain(|m| m.user_id != user_id);
                    }
                }
            }
        }
    }

    async fn forget_room(&self, room_id: &str) {
        let was_current = self.state.write().await.forget_room(room_id);
        if was_current {
            info!("Left active chat room {room_id}");
            self.typing.reset().await;
        }
    }

    /// Applies `apply` to the loaded message, then confirms with `call`.
    /// The backend's copy replaces the local one on success. On failure the
    /// original is restored unless a pushed update replaced the optimistic
    /// copy in the meantime. `apply` returning false means nothing changed.
    async fn mutate_message<A, C, Fut>(
        &self,
        kind: MutationKind,
        message_id: &str,
        apply: A,
        call: C,
    ) -> ChatResult<bool>
    where
        A: FnOnce(&mut Message) -> ChatResult<bool>,
        C: FnOnce() -> Fut,
        Fut: Future<Output = BackendResult<Message>>,
    {
        let (original, optimistic, mutation) = {
            let mut state = self.state.write().await;
            let message = state
                .message_mut(message_id)
                .ok_or_else(|| ChatError::MessageNotFound(message_id.to_string()))?;
            let original = message.clone();
            if !apply(message)? {
                return Ok(false);
            }
            let optimistic = message.clone();
            (original, optimistic, state.mutations.begin(kind, message_id))
        };

        let result = call().await;

        let mut state = self.state.write().await;
        match result {
            Ok(confirmed) => {
                state.replace_message(confirmed);
                state.mutations.commit(mutation, None);
                Ok(true)
            }
            Err(e) => {
                let untouched = state
                    .messages
                    .iter()
                    .any(|m| m.id == message_id && *m == optimistic);
                if untouched {
                    warn!("{kind:?} of message {message_id} failed, rolling back: {e}");
                    state.replace_message(original);
                } else {
                    warn!("{kind:?} of message {message_id} failed after a newer update: {e}");
                }
                state.mutations.fail(mutation, e.to_string());
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::BackendError;
    use crate::memory::InMemoryBackend;
    use crate::model::fixtures::profile;
    use crate::model::MessagePage;
    use crate::mutation::MutationStatus;

    /// Wraps the in-memory backend with switchable failures and a slow room.
    pub(crate) struct FlakyBackend {
        pub inner: InMemoryBackend,
        pub fail_mutations: AtomicBool,
        pub fail_fetch: AtomicBool,
        pub slow_mutations: AtomicBool,
        pub slow_room: std::sync::Mutex<Option<RoomId>>,
    }

    impl FlakyBackend {
        async fn check(&self) -> BackendResult<()> {
            if self.slow_mutations.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if self.fail_mutations.load(Ordering::SeqCst) {
                return Err(BackendError::Transport("connection reset".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ChatBackend for FlakyBackend {
        async fn list_rooms(&self, user_id: &str) -> BackendResult<Vec<ChatRoom>> {
            self.inner.list_rooms(user_id).await
        }

        async fn fetch_messages(
            &self,
            user_id: &str,
            room_id: &str,
            before: Option<&str>,
            limit: usize,
        ) -> BackendResult<MessagePage> {
            let slow = self.slow_room.lock().unwrap().as_deref() == Some(room_id);
            if slow {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if self.fail_fetch.load(Ordering::SeqCst) {
                return Err(BackendError::Transport("connection reset".to_string()));
            }
            self.inner
                .fetch_messages(user_id, room_id, before, limit)
                .await
        }

        async fn send_message(
            &self,
            user_id: &str,
            room_id: &str,
            message: OutgoingMessage,
        ) -> BackendResult<Message> {
            self.check().await?;
            self.inner.send_message(user_id, room_id, message).await
        }

        async fn edit_message(
            &self,
            user_id: &str,
            message_id: &str,
            content: &str,
        ) -> BackendResult<Message> {
            self.check().await?;
            self.inner.edit_message(user_id, message_id, content).await
        }

        async fn delete_message(&self, user_id: &str, message_id: &str) -> BackendResult<Message> {
            self.check().await?;
            self.inner.delete_message(user_id, message_id).await
        }

        async fn add_reaction(
            &self,
            user_id: &str,
            message_id: &str,
            emoji: &str,
        ) -> BackendResult<Message> {
            self.check().await?;
            self.inner.add_reaction(user_id, message_id, emoji).await
        }

        async fn remove_reaction(
            &self,
            user_id: &str,
            message_id: &str,
            emoji: &str,
        ) -> BackendResult<Message> {
            self.check().await?;
            self.inner.remove_reaction(user_id, message_id, emoji).await
        }

        async fn create_room(&self, user_id: &str, room: NewChatRoom) -> BackendResult<ChatRoom> {
            self.inner.create_room(user_id, room).await
        }

        async fn add_member(
            &self,
            user_id: &str,
            room_id: &str,
            member_id: &str,
        ) -> BackendResult<ChatRoom> {
            self.inner.add_member(user_id, room_id, member_id).await
        }

        async fn remove_member(
            &self,
            user_id: &str,
            room_id: &str,
            member_id: &str,
        ) -> BackendResult<ChatRoom> {
            self.inner.remove_member(user_id, room_id, member_id).await
        }

        async fn set_typing(&self, user_id: &str, room_id: &str, typing: bool) -> BackendResult<()> {
            self.inner.set_typing(user_id, room_id, typing).await
        }

        async fn upload_attachment(
            &self,
            user_id: &str,
            name: String,
            content: Vec<u8>,
        ) -> BackendResult<Attachment> {
            self.check().await?;
            self.inner.upload_attachment(user_id, name, content).await
        }
    }

    pub(crate) struct Session {
        pub backend: Arc<FlakyBackend>,
        pub ada: Arc<ChatProvider<FlakyBackend>>,
        pub grace: Arc<ChatProvider<FlakyBackend>>,
        pub room: ChatRoom,
    }

    pub(crate) async fn session() -> Session {
        let inner = InMemoryBackend::new(1024);
        let ada = profile("ada", "Ada", "Lovelace");
        let grace = profile("grace", "Grace", "Hopper");
        inner.register_user(ada.clone()).await;
        inner.register_user(grace.clone()).await;
        inner.register_user(profile("alan", "Alan", "Turing")).await;

        let backend = Arc::new(FlakyBackend {
            inner,
            fail_mutations: AtomicBool::new(false),
            fail_fetch: AtomicBool::new(false),
            slow_mutations: AtomicBool::new(false),
            slow_room: std::sync::Mutex::new(None),
        });
        let settings = Settings {
            page_size: 3,
            ..Settings::default()
        };
        let ada = Arc::new(ChatProvider::new(
            Arc::clone(&backend),
            ada.summary(),
            &settings,
        ));
        let grace = Arc::new(ChatProvider::new(
            Arc::clone(&backend),
            grace.summary(),
            &settings,
        ));
        let room = ada
            .create_chat_room("Q3 OKRs", RoomType::Group, &["grace".to_string()])
            .await
            .unwrap();
        grace.load_rooms().await.unwrap();
        grace.select_room(&room.id).await.unwrap();
        Session {
            backend,
            ada,
            grace,
            room,
        }
    }

    async fn pump(
        provider: &ChatProvider<FlakyBackend>,
        events: &mut tokio::sync::mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        while let Ok(event) = events.try_recv() {
            provider.handle_event(event).await;
        }
    }

    #[tokio::test]
    async fn create_room_selects_it() {
        let s = session().await;
        let snapshot = s.ada.snapshot().await;
        assert_eq!(snapshot.current_room_id.as_deref(), Some(s.room.id.as_str()));
        assert_eq!(snapshot.load_state, LoadState::Ready);
        assert!(snapshot.messages.is_empty());
    }

    #[tokio::test]
    async fn create_room_rejects_empty_name_or_members() {
        let s = session().await;
        let err = s
            .ada
            .create_chat_room("   ", RoomType::Group, &["grace".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::EmptyRoomName));

        let err = s
            .ada
            .create_chat_room("Planning", RoomType::Group, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NoRoomMembers));
        assert_eq!(s.ada.snapshot().await.rooms.len(), 1);
    }

    #[tokio::test]
    async fn empty_message_is_rejected_before_the_backend() {
        let s = session().await;
        s.backend.fail_mutations.store(true, Ordering::SeqCst);
        let err = s
            .ada
            .send_message(OutgoingMessage::text("  \t "))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::EmptyMessage));
        assert!(s.ada.snapshot().await.messages.is_empty());
    }

    #[tokio::test]
    async fn sent_message_reaches_other_members() {
        let s = session().await;
        let mut grace_events = s.backend.inner.subscribe("grace").await;

        let sent = s
            .ada
            .send_message(OutgoingMessage::text("  kickoff at 10  "))
            .await
            .unwrap();
        assert_eq!(sent.content(), Some("kickoff at 10"));

        let ada_view = s.ada.snapshot().await;
        assert_eq!(ada_view.messages, vec![sent.clone()]);
        assert!(ada_view.pending_message_ids.is_empty());

        pump(&s.grace, &mut grace_events).await;
        assert_eq!(s.grace.snapshot().await.messages, vec![sent]);
    }

    #[tokio::test]
    async fn pushed_copy_of_own_message_is_not_duplicated() {
        let s = session().await;
        let mut ada_events = s.backend.inner.subscribe("ada").await;
        s.ada
            .send_message(OutgoingMessage::text("once"))
            .await
            .unwrap();
        pump(&s.ada, &mut ada_events).await;
        assert_eq!(s.ada.snapshot().await.messages.len(), 1);
    }

    #[tokio::test]
    async fn failed_send_removes_the_placeholder() {
        let s = session().await;
        s.backend.fail_mutations.store(true, Ordering::SeqCst);
        let err = s
            .ada
            .send_message(OutgoingMessage::text("lost"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Backend(BackendError::Transport(_))));

        let snapshot = s.ada.snapshot().await;
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.recent_failures.len(), 1);
        assert_eq!(snapshot.recent_failures[0].kind, MutationKind::Send);
    }

    #[tokio::test]
    async fn send_without_room_fails() {
        let s = session().await;
        let alan = ChatProvider::new(
            Arc::clone(&s.backend),
            profile("alan", "Alan", "Turing").summary(),
            &Settings::default(),
        );
        let err = alan
            .send_message(OutgoingMessage::text("hello?"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NoActiveRoom));
    }

    #[tokio::test]
    async fn unchanged_edit_is_a_no_op() {
        let s = session().await;
        let sent = s
            .ada
            .send_message(OutgoingMessage::text("ship it"))
            .await
            .unwrap();
        s.backend.fail_mutations.store(true, Ordering::SeqCst);
        assert!(!s.ada.edit_message(&sent.id, " ship it ").await.unwrap());
        assert!(!s.ada.snapshot().await.messages[0].was_edited());
    }

    #[tokio::test]
    async fn edit_marks_message_edited() {
        let s = session().await;
        let sent = s
            .ada
            .send_message(OutgoingMessage::text("ship it"))
            .await
            .unwrap();
        assert!(s.ada.edit_message(&sent.id, "ship it friday").await.unwrap());
        let message = s.ada.snapshot().await.messages[0].clone();
        assert_eq!(message.content(), Some("ship it friday"));
        assert!(message.was_edited());
    }

    #[tokio::test]
    async fn failed_edit_rolls_back() {
        let s = session().await;
        let sent = s
            .ada
            .send_message(OutgoingMessage::text("original"))
            .await
            .unwrap();
        s.backend.fail_mutations.store(true, Ordering::SeqCst);
        assert!(s.ada.edit_message(&sent.id, "changed").await.is_err());

        let snapshot = s.ada.snapshot().await;
        assert_eq!(snapshot.messages, vec![sent]);
        assert!(matches!(
            snapshot.recent_failures[0].status,
            MutationStatus::Failed(_)
        ));
    }

    #[tokio::test]
    async fn only_author_edits_locally() {
        let s = session().await;
        let mut grace_events = s.backend.inner.subscribe("grace").await;
        let sent = s
            .ada
            .send_message(OutgoingMessage::text("mine"))
            .await
            .unwrap();
        pump(&s.grace, &mut grace_events).await;
        let err = s.grace.edit_message(&sent.id, "theirs").await.unwrap_err();
        assert!(matches!(err, ChatError::NotAuthor(_)));
    }

    #[tokio::test]
    async fn delete_is_soft_and_idempotent() {
        let s = session().await;
        let sent = s
            .ada
            .send_message(OutgoingMessage::text("oops"))
            .await
            .unwrap();
        assert!(s.ada.delete_message(&sent.id).await.unwrap());
        assert!(!s.ada.delete_message(&sent.id).await.unwrap());

        let snapshot = s.ada.snapshot().await;
        assert_eq!(snapshot.messages.len(), 1);
        assert!(snapshot.messages[0].is_deleted());

        let err = s.ada.edit_message(&sent.id, "revive").await.unwrap_err();
        assert!(matches!(err, ChatError::MessageDeleted(_)));
    }

    #[tokio::test]
    async fn double_toggle_restores_reactions() {
        let s = session().await;
        let sent = s
            .ada
            .send_message(OutgoingMessage::text("launch"))
            .await
            .unwrap();
        let before = s.ada.snapshot().await.messages[0].reactions.clone();

        assert!(s.ada.toggle_reaction(&sent.id, "🚀").await.unwrap());
        assert!(s.ada.snapshot().await.messages[0].has_reacted("ada", "🚀"));
        assert!(!s.ada.toggle_reaction(&sent.id, "🚀").await.unwrap());
        assert_eq!(s.ada.snapshot().await.messages[0].reactions, before);
    }

    #[tokio::test]
    async fn failed_reaction_rolls_back() {
        let s = session().await;
        let sent = s
            .ada
            .send_message(OutgoingMessage::text("launch"))
            .await
            .unwrap();
        s.backend.fail_mutations.store(true, Ordering::SeqCst);
        assert!(s.ada.toggle_reaction(&sent.id, "🚀").await.is_err());
        assert!(s.ada.snapshot().await.messages[0].reactions.is_empty());
    }

    #[tokio::test]
    async fn failed_delete_rolls_back() {
        let s = session().await;
        let sent = s
            .ada
            .send_message(OutgoingMessage::text("keep me"))
            .await
            .unwrap();
        s.backend.fail_mutations.store(true, Ordering::SeqCst);
        assert!(s.ada.delete_message(&sent.id).await.is_err());

        let snapshot = s.ada.snapshot().await;
        assert_eq!(snapshot.messages, vec![sent]);
        assert_eq!(snapshot.recent_failures[0].kind, MutationKind::Delete);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_edit_keeps_update_pushed_meanwhile() {
        let s = session().await;
        let sent = s
            .ada
            .send_message(OutgoingMessage::text("original"))
            .await
            .unwrap();
        s.backend.slow_mutations.store(true, Ordering::SeqCst);
        s.backend.fail_mutations.store(true, Ordering::SeqCst);

        let ada = Arc::clone(&s.ada);
        let message_id = sent.id.clone();
        let edit = tokio::spawn(async move { ada.edit_message(&message_id, "changed").await });
        tokio::task::yield_now().await;
        assert_eq!(s.ada.snapshot().await.messages[0].content(), Some("changed"));

        let mut pushed = sent.clone();
        pushed.add_reaction(&profile("grace", "Grace", "Hopper").summary(), "👍");
        s.ada
            .handle_event(ServerEvent::MessageUpdated {
                message: pushed.clone(),
            })
            .await;

        assert!(edit.await.unwrap().is_err());
        let snapshot = s.ada.snapshot().await;
        assert_eq!(snapshot.messages, vec![pushed]);
        assert!(matches!(
            snapshot.recent_failures[0].status,
            MutationStatus::Failed(_)
        ));
    }

    #[tokio::test]
    async fn failed_room_load_leaves_room_ready_and_empty() {
        let s = session().await;
        s.ada
            .send_message(OutgoingMessage::text("agenda"))
            .await
            .unwrap();
        s.backend.fail_fetch.store(true, Ordering::SeqCst);

        let err = s.grace.select_room(&s.room.id).await.unwrap_err();
        assert!(matches!(err, ChatError::Backend(BackendError::Transport(_))));

        let snapshot = s.grace.snapshot().await;
        assert_eq!(snapshot.current_room_id.as_deref(), Some(s.room.id.as_str()));
        assert_eq!(snapshot.load_state, LoadState::Ready);
        assert!(snapshot.messages.is_empty());
        assert!(!snapshot.has_more_messages);
    }

    #[tokio::test]
    async fn created_room_is_returned_even_if_it_fails_to_load() {
        let s = session().await;
        s.backend.fail_fetch.store(true, Ordering::SeqCst);
        let room = s
            .ada
            .create_chat_room("Design", RoomType::Group, &["grace".to_string()])
            .await
            .unwrap();

        let snapshot = s.ada.snapshot().await;
        assert_eq!(snapshot.rooms.len(), 2);
        assert_eq!(snapshot.current_room_id.as_deref(), Some(room.id.as_str()));
        assert_eq!(snapshot.load_state, LoadState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn load_more_is_ignored_while_already_loading() {
        let s = session().await;
        for i in 0..5 {
            s.ada
                .send_message(OutgoingMessage::text(format!("m{i}")))
                .await
                .unwrap();
        }
        s.grace.select_room(&s.room.id).await.unwrap();
        *s.backend.slow_room.lock().unwrap() = Some(s.room.id.clone());

        let grace = Arc::clone(&s.grace);
        let first = tokio::spawn(async move { grace.load_more_messages().await });
        tokio::task::yield_now().await;

        let snapshot = s.grace.snapshot().await;
        assert_eq!(snapshot.load_state, LoadState::LoadingMore);
        assert!(snapshot.is_loading_messages());
        assert_eq!(s.grace.load_more_messages().await.unwrap(), 0);

        assert_eq!(first.await.unwrap().unwrap(), 2);
        assert_eq!(s.grace.snapshot().await.messages.len(), 5);
    }

    #[tokio::test]
    async fn pagination_prepends_older_messages() {
        let s = session().await;
        for i in 0..5 {
            s.ada
                .send_message(OutgoingMessage::text(format!("m{i}")))
                .await
                .unwrap();
        }
        s.grace.select_room(&s.room.id).await.unwrap();
        let snapshot = s.grace.snapshot().await;
        assert_eq!(snapshot.messages.len(), 3);
        assert!(snapshot.has_more_messages);

        assert_eq!(s.grace.load_more_messages().await.unwrap(), 2);
        let snapshot = s.grace.snapshot().await;
        let contents: Vec<_> = snapshot
            .messages
            .iter()
            .filter_map(Message::content)
            .collect();
        assert_eq!(contents, ["m0", "m1", "m2", "m3", "m4"]);
        assert!(!snapshot.has_more_messages);

        assert_eq!(s.grace.load_more_messages().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_room_load_is_discarded() {
        let s = session().await;
        let other = s
            .ada
            .create_chat_room("Design", RoomType::Group, &["grace".to_string()])
            .await
            .unwrap();
        s.ada
            .send_message(OutgoingMessage::text("in design"))
            .await
            .unwrap();
        *s.backend.slow_room.lock().unwrap() = Some(s.room.id.clone());

        let ada = Arc::clone(&s.ada);
        let slow_room = s.room.id.clone();
        let slow = tokio::spawn(async move { ada.select_room(&slow_room).await });
        tokio::task::yield_now().await;

        s.ada.select_room(&other.id).await.unwrap();
        slow.await.unwrap().unwrap();

        let snapshot = s.ada.snapshot().await;
        assert_eq!(snapshot.current_room_id.as_deref(), Some(other.id.as_str()));
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.load_state, LoadState::Ready);
    }

    #[tokio::test]
    async fn messages_in_other_rooms_count_as_unread() {
        let s = session().await;
        let mut grace_events = s.backend.inner.subscribe("grace").await;
        let side = s
            .ada
            .create_chat_room("Side", RoomType::Group, &["grace".to_string()])
            .await
            .unwrap();
        s.ada
            .send_message(OutgoingMessage::text("psst"))
            .await
            .unwrap();
        pump(&s.grace, &mut grace_events).await;

        let snapshot = s.grace.snapshot().await;
        let unread = snapshot.rooms.iter().find(|r| r.id == side.id).unwrap();
        assert_eq!(unread.unread_count, 1);

        s.grace.select_room(&side.id).await.unwrap();
        let snapshot = s.grace.snapshot().await;
        assert_eq!(snapshot.rooms.iter().find(|r| r.id == side.id).unwrap().unread_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_signals_are_throttled_and_expire() {
        let s = session().await;
        let mut grace_events = s.backend.inner.subscribe("grace").await;

        assert!(s.ada.start_typing().await.unwrap());
        assert!(!s.ada.start_typing().await.unwrap());
        pump(&s.grace, &mut grace_events).await;
        assert_eq!(s.grace.snapshot().await.typing_names(), ["Ada Lovelace"]);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(s.grace.snapshot().await.typing_users.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_the_indicator() {
        let s = session().await;
        let mut grace_events = s.backend.inner.subscribe("grace").await;

        s.ada.start_typing().await.unwrap();
        assert!(s.ada.stop_typing().await.unwrap());
        assert!(!s.ada.stop_typing().await.unwrap());
        pump(&s.grace, &mut grace_events).await;
        assert!(s.grace.snapshot().await.typing_users.is_empty());
    }

    #[tokio::test]
    async fn leaving_a_room_clears_the_session() {
        let s = session().await;
        s.grace
            .remove_member_from_chat_room(&s.room.id, "grace")
            .await
            .unwrap();
        let snapshot = s.grace.snapshot().await;
        assert!(snapshot.rooms.is_empty());
        assert!(snapshot.current_room_id.is_none());
        assert_eq!(snapshot.load_state, LoadState::Idle);
    }

    #[tokio::test]
    async fn removed_member_drops_the_room_on_push() {
        let s = session().await;
        let mut grace_events = s.backend.inner.subscribe("grace").await;
        s.ada
            .remove_member_from_chat_room(&s.room.id, "grace")
            .await
            .unwrap();
        pump(&s.grace, &mut grace_events).await;
        assert!(s.grace.snapshot().await.current_room_id.is_none());

        let room = s.ada.snapshot().await.current_room.unwrap();
        assert!(!room.has_member("grace"));
    }
}
