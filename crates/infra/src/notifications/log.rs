use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use consular_core::{CaseId, NotificationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// Outcome record of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationLogEntry {
    pub id: NotificationId,
    pub address: String,
    pub template_id: String,
    pub workflow: String,
    pub case_id: CaseId,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl NotificationLogEntry {
    pub fn pending(
        address: impl Into<String>,
        template_id: impl Into<String>,
        workflow: impl Into<String>,
        case_id: CaseId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            address: address.into(),
            template_id: template_id.into(),
            workflow: workflow.into(),
            case_id,
            status: DeliveryStatus::Pending,
            error: None,
            created_at: now,
            sent_at: None,
        }
    }

    pub fn mark_sent(&mut self, at: DateTime<Utc>) {
        self.status = DeliveryStatus::Sent;
        self.sent_at = Some(at);
    }

    /// Failed is final: no retry is attempted for this entry.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = DeliveryStatus::Failed;
        self.error = Some(error.into());
    }
}

#[derive(Debug, Error)]
pub enum NotificationLogError {
    #[error("notification {0} not found")]
    NotFound(NotificationId),

    #[error("storage error: {0}")]
    Storage(String),
}

pub trait NotificationLog: Send + Sync {
    fn append(&self, entry: &NotificationLogEntry) -> Result<(), NotificationLogError>;

    /// Replace a previously appended entry.
    fn update(&self, entry: &NotificationLogEntry) -> Result<(), NotificationLogError>;

    fn get(&self, id: NotificationId) -> Result<Option<NotificationLogEntry>, NotificationLogError>;

    /// Entries for one case, oldest first.
    fn list_for_case(&self, case_id: CaseId) -> Result<Vec<NotificationLogEntry>, NotificationLogError>;
}

#[derive(Debug, Default)]
pub struct InMemoryNotificationLog {
    entries: RwLock<Vec<NotificationLogEntry>>,
}

impl InMemoryNotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> NotificationLogError {
    NotificationLogError::Storage("lock poisoned".to_string())
}

impl NotificationLog for InMemoryNotificationLog {
    fn append(&self, entry: &NotificationLogEntry) -> Result<(), NotificationLogError> {
        self.entries.write().map_err(|_| poisoned())?.push(entry.clone());
        Ok(())
    }

    fn update(&self, entry: &NotificationLogEntry) -> Result<(), NotificationLogError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let slot = entries
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or(NotificationLogError::NotFound(entry.id))?;
        *slot = entry.clone();
        Ok(())
    }

    fn get(&self, id: NotificationId) -> Result<Option<NotificationLogEntry>, NotificationLogError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.iter().find(|e| e.id == id).cloned())
    }

    fn list_for_case(&self, case_id: CaseId) -> Result<Vec<NotificationLogEntry>, NotificationLogError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut found: Vec<_> = entries.iter().filter(|e| e.case_id == case_id).cloned().collect();
        found.sort_by_key(|e| e.created_at);
        Ok(found)
    }
}
