use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type RoomId = String;
pub type MessageId = String;
pub type AttachmentId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl UserProfile {
    pub fn display_name(&self) -> String {
        display_name(&self.first_name, &self.last_name, &self.id)
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
        }
    }
}

/// The author fields carried on messages and reactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
}

impl UserSummary {
    pub fn display_name(&self) -> String {
        display_name(&self.first_name, &self.last_name, &self.id)
    }
}

fn display_name(first: &str, last: &str, fallback: &str) -> String {
    let name = format!("{first} {last}");
    let name = name.trim();
    if name.is_empty() {
        fallback.to_string()
    } else {
        name.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMember {
    pub user_id: UserId,
    pub role: MemberRole,
    pub user: UserProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    pub id: RoomId,
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub members: Vec<ChatMember>,
    #[serde(default)]
    pub unread_count: u32,
}

impl ChatRoom {
    pub fn member(&self, user_id: &str) -> Option<&ChatMember> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    pub fn has_member(&self, user_id: &str) -> bool {
        self.member(user_id).is_some()
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.member(user_id)
            .is_some_and(|m| m.role == MemberRole::Admin)
    }

    /// Direct rooms are titled after the other participant.
    pub fn title_for(&self, viewer: &str) -> String {
        if self.room_type == RoomType::Direct {
            if let Some(other) = self.members.iter().find(|m| m.user_id != viewer) {
                return other.user.display_name();
            }
        }
        self.name.clone()
    }
}

/// Message payload. A deleted message keeps its slot in the list but no
/// longer carries its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "state",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum MessageBody {
    Active { content: String },
    Deleted { deleted_at: SystemTime },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
    pub user: UserSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: AttachmentId,
    pub name: String,
    pub size: u64,
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub body: MessageBody,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    pub user: UserSummary,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
}

impl Message {
    pub fn content(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Active { content } => Some(content),
            MessageBody::Deleted { .. } => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.body, MessageBody::Deleted { .. })
    }

    pub fn was_edited(&self) -> bool {
        self.updated_at > self.created_at
    }

    pub fn has_reacted(&self, user_id: &str, emoji: &str) -> bool {
        self.reactions
            .iter()
            .any(|r| r.user_id == user_id && r.emoji == emoji)
    }

    pub fn edit(&mut self, content: String, at: SystemTime) {
        self.body = MessageBody::Active { content };
        self.updated_at = strictly_after(self.created_at, at);
    }

    pub fn soft_delete(&mut self, at: SystemTime) {
        self.body = MessageBody::Deleted { deleted_at: at };
        self.attachments.clear();
    }

    /// Returns false when the user already reacted with this emoji.
    pub fn add_reaction(&mut self, user: &UserSummary, emoji: &str) -> bool {
        if self.has_reacted(&user.id, emoji) {
            return false;
        }
        self.reactions.push(Reaction {
            user_id: user.id.clone(),
            emoji: emoji.to_string(),
            user: user.clone(),
        });
        true
    }

    pub fn remove_reaction(&mut self, user_id: &str, emoji: &str) -> bool {
        let before = self.reactions.len();
        self.reactions
            .retain(|r| !(r.user_id == user_id && r.emoji == emoji));
        self.reactions.len() != before
    }
}

// Clocks can hand out the same instant twice; an edit must still read as edited.
fn strictly_after(created_at: SystemTime, at: SystemTime) -> SystemTime {
    if at > created_at {
        at
    } else {
        created_at + Duration::from_millis(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChatRoom {
    pub name: String,
    #[serde(rename = "type")]
    pub room_type: RoomType,
    pub member_ids: Vec<UserId>,
}

/// A window of messages in ascending creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}
