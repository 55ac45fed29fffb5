use thiserror::Error;

use crate::model::MessageId;

/// Failures reported by a chat backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Invalid request: {0}")]
    Invalid(String),
    #[error("Attachment of {size} bytes exceeds the {limit} byte limit")]
    AttachmentTooLarge { size: u64, limit: u64 },
    #[error("Transport failure: {0}")]
    Transport(String),
}

impl BackendError {
    pub(crate) fn not_found(entity: &'static str, id: &str) -> Self {
        BackendError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message has no content and no attachments")]
    EmptyMessage,
    #[error("No chat room is selected")]
    NoActiveRoom,
    #[error("Message {0} is not loaded")]
    MessageNotFound(MessageId),
    #[error("Message {0} has been deleted")]
    MessageDeleted(MessageId),
    #[error("Message {0} has not been confirmed yet")]
    MessagePending(MessageId),
    #[error("Only the author can change message {0}")]
    NotAuthor(MessageId),
    #[error("Chat room name must not be empty")]
    EmptyRoomName,
    #[error("Select at least one member for the chat room")]
    NoRoomMembers,
    #[error("Attachment {name} is {size} bytes, the limit is {limit}")]
    AttachmentTooLarge { name: String, size: u64, limit: u64 },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::ConfigError),
}

pub type ChatResult<T> = Result<T, ChatError>;
