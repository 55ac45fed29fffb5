use serde::{Deserialize, Serialize};

use crate::model::{
    Attachment, ChatRoom, Message, MessageId, MessagePage, NewChatRoom, OutgoingMessage,
    RoomId, UserId, UserProfile,
};

/// Real-time updates pushed by the backend to room members.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated { message: Message },
    /// Edits, soft deletes and reaction changes all carry the full message.
    MessageUpdated { message: Message },
    TypingStarted { room_id: RoomId, user_id: UserId },
    TypingStopped { room_id: RoomId, user_id: UserId },
    RoomCreated { room: ChatRoom },
    RoomUpdated { room: ChatRoom },
    MemberRemoved { room_id: RoomId, user_id: UserId },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Identify {
        user: UserProfile,
    },
    ListRooms,
    FetchMessages {
        room_id: RoomId,
        before: Option<MessageId>,
        limit: Option<usize>,
    },
    SendMessage {
        room_id: RoomId,
        message: OutgoingMessage,
    },
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    AddReaction {
        message_id: MessageId,
        emoji: String,
    },
    RemoveReaction {
        message_id: MessageId,
        emoji: String,
    },
    CreateRoom {
        room: NewChatRoom,
    },
    AddMember {
        room_id: RoomId,
        user_id: UserId,
    },
    RemoveMember {
        room_id: RoomId,
        user_id: UserId,
    },
    Typing {
        room_id: RoomId,
        typing: bool,
    },
    UploadAttachment {
        name: String,
        content: String, // base64
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Identified {
        user_id: UserId,
    },
    Event {
        event: ServerEvent,
    },
    Rooms {
        rooms: Vec<ChatRoom>,
    },
    MessagePage {
        room_id: RoomId,
        page: MessagePage,
    },
    AttachmentUploaded {
        attachment: Attachment,
    },
    Error {
        message: String,
    },
}
