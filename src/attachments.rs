use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BackendError, BackendResult};
use crate::model::{Attachment, AttachmentId};

#[derive(Debug)]
struct StoredAttachment {
    attachment: Attachment,
    content: Arc<Vec<u8>>,
}

/// In-memory attachment blobs, deduplicated by SHA-256.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    files: Arc<RwLock<HashMap<AttachmentId, StoredAttachment>>>,
    max_size: u64,
}

pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

impl AttachmentStore {
    pub fn new(max_size: u64) -> Self {
        AttachmentStore {
            files: Arc::new(RwLock::new(HashMap::new())),
            max_size,
        }
    }

    pub async fn upload(&self, name: String, content: Vec<u8>) -> BackendResult<Attachment> {
        let size = content.len() as u64;
        if size > self.max_size {
            return Err(BackendError::AttachmentTooLarge {
                size,
                limit: self.max_size,
            });
        }
        if name.trim().is_empty() {
            return Err(BackendError::Invalid("attachment name is empty".to_string()));
        }

        let sha256 = sha256_hex(&content);

        let mut files = self.files.write().await;
        if let Some(existing) = files.values().find(|f| f.attachment.sha256 == sha256) {
            debug!("Attachment {} deduplicated against {}", name, existing.attachment.id);
            return Ok(existing.attachment.clone());
        }

        let id = Uuid::new_v4().to_string();
        let attachment = Attachment {
            url: format!("/attachments/{id}"),
            id: id.clone(),
            name,
            size,
            sha256,
        };
        files.insert(
            id,
            StoredAttachment {
                attachment: attachment.clone(),
                content: Arc::new(content),
            },
        );
        Ok(attachment)
    }

    pub async fn get(&self, id: &str) -> Option<(Attachment, Arc<Vec<u8>>)> {
        let files = self.files.read().await;
        let entry = files.get(id)?;
        Some((entry.attachment.clone(), Arc::clone(&entry.content)))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.files.read().await.contains_key(id)
    }
}
