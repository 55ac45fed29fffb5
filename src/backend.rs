use async_trait::async_trait;

use crate::error::BackendResult;
use crate::model::{Attachment, ChatRoom, Message, MessagePage, NewChatRoom, OutgoingMessage};

/// The chat endpoints the session client talks to. Every call is made on
/// behalf of `user_id`; implementations enforce membership and authorship.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_rooms(&self, user_id: &str) -> BackendResult<Vec<ChatRoom>>;

    /// Returns up to `limit` messages older than `before` (or the newest
    /// messages when `before` is `None`), oldest first. A `limit` of zero
    /// is treated as one.
    async fn fetch_messages(
        &self,
        user_id: &str,
        room_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> BackendResult<MessagePage>;

    async fn send_message(
        &self,
        user_id: &str,
        room_id: &str,
        message: OutgoingMessage,
    ) -> BackendResult<Message>;

    async fn edit_message(
        &self,
        user_id: &str,
        message_id: &str,
        content: &str,
    ) -> BackendResult<Message>;

    async fn delete_message(&self, user_id: &str, message_id: &str) -> BackendResult<Message>;

    async fn add_reaction(
        &self,
        user_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> BackendResult<Message>;

    async fn remove_reaction(
        &self,
        user_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> BackendResult<Message>;

    async fn create_room(&self, user_id: &str, room: NewChatRoom) -> BackendResult<ChatRoom>;

    async fn add_member(
        &self,
        user_id: &str,
        room_id: &str,
        member_id: &str,
    ) -> BackendResult<ChatRoom>;

    async fn remove_member(
        &self,
        user_id: &str,
        room_id: &str,
        member_id: &str,
    ) -> BackendResult<ChatRoom>;

    async fn set_typing(&self, user_id: &str, room_id: &str, typing: bool) -> BackendResult<()>;

    async fn upload_attachment(
        &self,
        user_id: &str,
        name: String,
        content: Vec<u8>,
    ) -> BackendResult<Attachment>;
}
