use log::{error, warn};

use crate::attachments::sha256_hex;
use crate::backend::ChatBackend;
use crate::error::{ChatError, ChatResult};
use crate::model::{Message, MessageId, OutgoingMessage};
use crate::provider::ChatProvider;

/// A file picked by the user but not uploaded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAttachment {
    pub name: String,
    pub content: Vec<u8>,
    pub sha256: String,
}

impl StagedAttachment {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// State of the compose box.
#[derive(Debug)]
pub struct Composer {
    draft: String,
    reply_to: Option<MessageId>,
    staged: Vec<StagedAttachment>,
    max_attachment_bytes: u64,
    focus_requested: bool,
    sending: bool,
}

impl Composer {
    pub fn new(max_attachment_bytes: u64) -> Self {
        Composer {
            draft: String::new(),
            reply_to: None,
            staged: Vec::new(),
            max_attachment_bytes,
            focus_requested: false,
            sending: false,
        }
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn staged(&self) -> &[StagedAttachment] {
        &self.staged
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub fn can_send(&self) -> bool {
        !self.sending && (!self.draft.trim().is_empty() || !self.staged.is_empty())
    }

    /// Updates the draft and signals typing while it holds text.
    pub async fn on_input<B: ChatBackend>(
        &mut self,
        provider: &ChatProvider<B>,
        text: impl Into<String>,
    ) {
        self.draft = text.into();
        let result = if self.draft.trim().is_empty() {
            provider.stop_typing().await
        } else {
            provider.start_typing().await
        };
        if let Err(e) = result {
            warn!("Failed to send typing signal: {e}");
        }
    }

    pub async fn on_blur<B: ChatBackend>(&mut self, provider: &ChatProvider<B>) {
        if let Err(e) = provider.stop_typing().await {
            warn!("Failed to send typing stop: {e}");
        }
    }

    pub fn set_reply_to(&mut self, message_id: impl Into<MessageId>) {
        self.reply_to = Some(message_id.into());
        self.focus_requested = true;
    }

    pub fn clear_reply(&mut self) {
        self.reply_to = None;
    }

    /// Returns true once per focus request.
    pub fn take_focus_request(&mut self) -> bool {
        std::mem::take(&mut self.focus_requested)
    }

    /// Stages a file. Returns false when identical content is already staged.
    pub fn stage_attachment(&mut self, name: impl Into<String>, content: Vec<u8>) -> ChatResult<bool> {
        let name = name.into();
        let size = content.len() as u64;
        if size > self.max_attachment_bytes {
            return Err(ChatError::AttachmentTooLarge {
                name,
                size,
                limit: self.max_attachment_bytes,
            });
        }
        let sha256 = sha256_hex(&content);
        if self.staged.iter().any(|s| s.sha256 == sha256) {
            return Ok(false);
        }
        self.staged.push(StagedAttachment {
            name,
            content,
            sha256,
        });
        Ok(true)
    }

    pub fn unstage(&mut self, index: usize) -> Option<StagedAttachment> {
        (index < self.staged.len()).then(|| self.staged.remove(index))
    }

    /// Uploads staged files and sends the message. The compose box is
    /// cleared only after the backend accepts the message; failures are
    /// logged and leave the draft in place.
    pub async fn submit<B: ChatBackend>(
        &mut self,
        provider: &ChatProvider<B>,
    ) -> ChatResult<Option<Message>> {
        if !self.can_send() {
            return Ok(None);
        }
        self.sending = true;
        let result = self.upload_and_send(provider).await;
        self.sending = false;

        match result {
            Ok(message) => {
                self.draft.clear();
                self.reply_to = None;
                self.staged.clear();
                if let Err(e) = provider.stop_typing().await {
                    warn!("Failed to send typing stop: {e}");
                }
                Ok(Some(message))
            }
            Err(e) => {
                error!("Error sending message: {e}");
                Err(e)
            }
        }
    }

    async fn upload_and_send<B: ChatBackend>(
        &self,
        provider: &ChatProvider<B>,
    ) -> ChatResult<Message> {
        let mut attachments = Vec::with_capacity(self.staged.len());
        for staged in &self.staged {
            let attachment = provider
                .upload_attachment(staged.name.clone(), staged.content.clone())
                .await?;
            attachments.push(attachment);
        }
        provider
            .send_message(OutgoingMessage {
                content: self.draft.clone(),
                reply_to_id: self.reply_to.clone(),
                attachments,
            })
            .await
    }
}
