//! View state for the chat screens. Nothing here owns canonical data; all
//! durable changes go through [`crate::provider::ChatProvider`].

pub mod create_room;
pub mod layout;
pub mod message_input;
pub mod message_item;

pub use create_room::CreateRoomForm;
pub use layout::{typing_indicator_text, ChatHeader, ChatLayout};
pub use message_input::{Composer, StagedAttachment};
pub use message_item::{
    group_reactions, reply_preview, MessageItemState, MessageView, ReactionGroup, ReplyPreview,
    DELETED_PLACEHOLDER,
};
