use log::error;

use crate::backend::ChatBackend;
use crate::error::ChatResult;
use crate::model::{ChatRoom, RoomType, UserId};
use crate::provider::{validate_new_room, ChatProvider};

/// The "new chat" dialog.
#[derive(Debug, Clone)]
pub struct CreateRoomForm {
    pub name: String,
    pub room_type: RoomType,
    selected_users: Vec<UserId>,
}

impl Default for CreateRoomForm {
    fn default() -> Self {
        CreateRoomForm {
            name: String::new(),
            room_type: RoomType::Group,
            selected_users: Vec::new(),
        }
    }
}

impl CreateRoomForm {
    pub fn selected_users(&self) -> &[UserId] {
        &self.selected_users
    }

    pub fn is_selected(&self, user_id: &str) -> bool {
        self.selected_users.iter().any(|id| id == user_id)
    }

    pub fn toggle_user(&mut self, user_id: &str) {
        if self.is_selected(user_id) {
            self.selected_users.retain(|id| id != user_id);
        } else {
            self.selected_users.push(user_id.to_string());
        }
    }

    pub fn can_submit(&self) -> bool {
        validate_new_room(&self.name, self.room_type, &self.selected_users).is_ok()
    }

    /// Creates and selects the room; the form resets on success.
    pub async fn submit<B: ChatBackend>(
        &mut self,
        provider: &ChatProvider<B>,
    ) -> ChatResult<ChatRoom> {
        match provider
            .create_chat_room(&self.name, self.room_type, &self.selected_users)
            .await
        {
            Ok(room) => {
                *self = CreateRoomForm::default();
                Ok(room)
            }
            Err(e) => {
                error!("Error creating chat room: {e}");
                Err(e)
            }
        }
    }
}
