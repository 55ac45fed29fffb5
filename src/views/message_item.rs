use log::error;

use crate::backend::ChatBackend;
use crate::error::ChatResult;
use crate::model::{Attachment, Message, MessageId, Reaction};
use crate::provider::{is_local_id, ChatProvider, ChatSnapshot};

pub const DELETED_PLACEHOLDER: &str = "This message was deleted";
const REPLY_EXCERPT_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub reacted_by_me: bool,
    pub user_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPreview {
    pub message_id: MessageId,
    pub author: String,
    pub excerpt: String,
}

/// Everything a message row renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: MessageId,
    pub author: String,
    pub text: String,
    pub deleted: bool,
    pub edited: bool,
    pub pending: bool,
    pub is_own: bool,
    pub can_edit: bool,
    pub can_delete: bool,
    pub reply: Option<ReplyPreview>,
    pub reactions: Vec<ReactionGroup>,
    pub attachments: Vec<Attachment>,
}

impl MessageView {
    pub fn build(message: &Message, snapshot: &ChatSnapshot) -> Self {
        let viewer = snapshot.current_user.id.as_str();
        let is_own = message.user.id == viewer;
        let deleted = message.is_deleted();
        let confirmed = !is_local_id(&message.id);
        let is_admin = snapshot
            .current_room
            .as_ref()
            .is_some_and(|room| room.is_admin(viewer));

        MessageView {
            id: message.id.clone(),
            author: message.user.display_name(),
            text: message
                .content()
                .map_or_else(|| DELETED_PLACEHOLDER.to_string(), str::to_string),
            deleted,
            edited: !deleted && message.was_edited(),
            pending: !confirmed || snapshot.is_pending(&message.id),
            is_own,
            can_edit: is_own && !deleted && confirmed,
            can_delete: (is_own || is_admin) && !deleted && confirmed,
            reply: message
                .reply_to_id
                .as_deref()
                .and_then(|id| reply_preview(id, &snapshot.messages)),
            reactions: if deleted {
                Vec::new()
            } else {
                group_reactions(&message.reactions, viewer)
            },
            attachments: if deleted {
                Vec::new()
            } else {
                message.attachments.clone()
            },
        }
    }
}

/// Resolves a reply target within the loaded window. Targets outside the
/// window yield no preview.
pub fn reply_preview(target_id: &str, loaded: &[Message]) -> Option<ReplyPreview> {
    let target = loaded.iter().find(|m| m.id == target_id)?;
    let excerpt = match target.content() {
        Some(content) => excerpt(content),
        None => DELETED_PLACEHOLDER.to_string(),
    };
    Some(ReplyPreview {
        message_id: target.id.clone(),
        author: target.user.display_name(),
        excerpt,
    })
}

fn excerpt(content: &str) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(REPLY_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Groups reactions by emoji in order of first appearance.
pub fn group_reactions(reactions: &[Reaction], viewer: &str) -> Vec<ReactionGroup> {
    let mut groups: Vec<ReactionGroup> = Vec::new();
    for reaction in reactions {
        let index = match groups.iter().position(|g| g.emoji == reaction.emoji) {
            Some(index) => index,
            None => {
                groups.push(ReactionGroup {
                    emoji: reaction.emoji.clone(),
                    count: 0,
                    reacted_by_me: false,
                    user_names: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[index];
        group.count += 1;
        group.reacted_by_me |= reaction.user_id == viewer;
        group.user_names.push(reaction.user.display_name());
    }
    groups
}

/// Local UI state of one message row.
#[derive(Debug, Default)]
pub struct MessageItemState {
    editing: Option<String>,
    confirming_delete: bool,
    emoji_picker_open: bool,
}

impl MessageItemState {
    pub fn is_editing(&self) -> bool {
        self.editing.is_some()
    }

    pub fn edit_text(&self) -> Option<&str> {
        self.editing.as_deref()
    }

    pub fn is_confirming_delete(&self) -> bool {
        self.confirming_delete
    }

    pub fn is_emoji_picker_open(&self) -> bool {
        self.emoji_picker_open
    }

    pub fn begin_edit(&mut self, view: &MessageView) {
        if view.can_edit {
            self.editing = Some(view.text.clone());
        }
    }

    pub fn update_edit(&mut self, text: impl Into<String>) {
        if let Some(editing) = self.editing.as_mut() {
            *editing = text.into();
        }
    }

    pub fn cancel_edit(&mut self) {
        self.editing = None;
    }

    /// Leaves edit mode when the save succeeds; failures are logged and the
    /// row stays in edit mode.
    pub async fn save_edit<B: ChatBackend>(
        &mut self,
        provider: &ChatProvider<B>,
        message_id: &str,
    ) -> ChatResult<bool> {
        let Some(text) = self.editing.clone() else {
            return Ok(false);
        };
        match provider.edit_message(message_id, &text).await {
            Ok(changed) => {
                self.editing = None;
                Ok(changed)
            }
            Err(e) => {
                error!("Error editing message: {e}");
                Err(e)
            }
        }
    }

    pub fn request_delete(&mut self) {
        self.confirming_delete = true;
    }

    pub fn cancel_delete(&mut self) {
        self.confirming_delete = false;
    }

    pub async fn confirm_delete<B: ChatBackend>(
        &mut self,
        provider: &ChatProvider<B>,
        message_id: &str,
    ) -> ChatResult<bool> {
        if !self.confirming_delete {
            return Ok(false);
        }
        self.confirming_delete = false;
        provider.delete_message(message_id).await.inspect_err(|e| {
            error!("Error deleting message: {e}");
        })
    }

    pub fn toggle_emoji_picker(&mut self) {
        self.emoji_picker_open = !self.emoji_picker_open;
    }

    /// Picking an emoji closes the picker and toggles the reaction.
    pub async fn pick_emoji<B: ChatBackend>(
        &mut self,
        provider: &ChatProvider<B>,
        message_id: &str,
        emoji: &str,
    ) -> ChatResult<bool> {
        self.emoji_picker_open = false;
        provider
            .toggle_reaction(message_id, emoji)
            .await
            .inspect_err(|e| error!("Error toggling reaction: {e}"))
    }
}
