use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::model::MessageId;

const SETTLED_HISTORY: usize = 256;

pub type MutationId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Send,
    Edit,
    Delete,
    AddReaction,
    RemoveReaction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    Committed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub message_id: MessageId,
    pub status: MutationStatus,
}

/// Status of the optimistic mutations issued by this session. Settled
/// records are kept for a bounded history.
#[derive(Debug, Default)]
pub struct MutationLog {
    records: HashMap<MutationId, MutationRecord>,
    settled: VecDeque<MutationId>,
}

impl MutationLog {
    pub fn begin(&mut self, kind: MutationKind, message_id: &str) -> MutationId {
        let id = Uuid::new_v4();
        self.records.insert(
            id,
            MutationRecord {
                kind,
                message_id: message_id.to_string(),
                status: MutationStatus::Pending,
            },
        );
        id
    }

    /// Marks the mutation committed. Sends pass the server-assigned id,
    /// which replaces the local placeholder id.
    pub fn commit(&mut self, id: MutationId, message_id: Option<&str>) {
        if let Some(record) = self.records.get_mut(&id) {
            record.status = MutationStatus::Committed;
            if let Some(message_id) = message_id {
                record.message_id = message_id.to_string();
            }
            self.settle(id);
        }
    }

    pub fn fail(&mut self, id: MutationId, reason: impl Into<String>) {
        if let Some(record) = self.records.get_mut(&id) {
            record.status = MutationStatus::Failed(reason.into());
            self.settle(id);
        }
    }

    pub fn get(&self, id: &MutationId) -> Option<&MutationRecord> {
        self.records.get(id)
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.records
            .values()
            .any(|r| r.message_id == message_id && r.status == MutationStatus::Pending)
    }

    pub fn pending_message_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .records
            .values()
            .filter(|r| r.status == MutationStatus::Pending)
            .map(|r| r.message_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Failed mutations, most recent last.
    pub fn recent_failures(&self) -> Vec<MutationRecord> {
        self.settled
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| matches!(r.status, MutationStatus::Failed(_)))
            .cloned()
            .collect()
    }

    fn settle(&mut self, id: MutationId) {
        self.settled.push_back(id);
        while self.settled.len() > SETTLED_HISTORY {
            if let Some(oldest) = self.settled.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }
}
