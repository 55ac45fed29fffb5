use crate::model::{MessageId, RoomType};
use crate::provider::ChatSnapshot;
use crate::views::message_item::MessageView;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatHeader {
    pub title: String,
    pub room_type: RoomType,
    pub member_count: usize,
}

/// Renders the typing line for the given display names.
pub fn typing_indicator_text(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{one} is typing…")),
        [first, second] => Some(format!("{first} and {second} are typing…")),
        [first, second, rest @ ..] => Some(format!(
            "{first}, {second}, and {} more are typing…",
            rest.len()
        )),
    }
}

/// Layout-level UI state: tracks the newest rendered message so the list
/// scrolls to the bottom only when it changes.
#[derive(Debug, Default)]
pub struct ChatLayout {
    newest_seen: Option<MessageId>,
}

impl ChatLayout {
    pub fn header(snapshot: &ChatSnapshot) -> Option<ChatHeader> {
        let room = snapshot.current_room.as_ref()?;
        Some(ChatHeader {
            title: room.title_for(&snapshot.current_user.id),
            room_type: room.room_type,
            member_count: room.members.len(),
        })
    }

    pub fn typing_text(snapshot: &ChatSnapshot) -> Option<String> {
        typing_indicator_text(&snapshot.typing_names())
    }

    pub fn can_load_more(snapshot: &ChatSnapshot) -> bool {
        snapshot.has_more_messages && !snapshot.is_loading_messages()
    }

    pub fn message_views(snapshot: &ChatSnapshot) -> Vec<MessageView> {
        snapshot
            .messages
            .iter()
            .map(|message| MessageView::build(message, snapshot))
            .collect()
    }

    /// Returns true when the newest message differs from the last render.
    /// Prepending older pages leaves the newest message alone.
    pub fn should_scroll_to_bottom(&mut self, snapshot: &ChatSnapshot) -> bool {
        let newest = snapshot.messages.last().map(|m| m.id.clone());
        if newest == self.newest_seen {
            return false;
        }
        self.newest_seen = newest;
        self.newest_seen.is_some()
    }
}
