//! Persistence seam for finalized messages

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no placeholder for message {0}")]
    PlaceholderNotFound(String),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// A finalized assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub session_id: String,
    pub message_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Text ends with an error marker
    #[serde(default)]
    pub is_error: bool,
    /// Stream was stopped before it finished
    #[serde(default)]
    pub is_partial: bool,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            text: text.into(),
            reasoning: None,
            is_error: false,
            is_partial: false,
            updated_at: Utc::now(),
        }
    }

    pub fn with_reasoning(mut self, reasoning: Option<String>) -> Self {
        self.reasoning = reasoning.filter(|r| !r.trim().is_empty());
        self
    }

    pub fn partial(mut self) -> Self {
        self.is_partial = true;
        self
    }

    pub fn errored(mut self) -> Self {
        self.is_error = true;
        self
    }
}

/// Where finalized messages go
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store the final message, replacing its placeholder
    async fn commit(&self, record: MessageRecord) -> Result<(), StoreError>;

    /// Drop the empty placeholder shown while waiting for the first token
    async fn remove_placeholder(&self, message_id: &str) -> Result<(), StoreError>;

    /// Persist the conversation history
    async fn save_history(&self) -> Result<(), StoreError>;
}

/// Store kept in memory, used by the replay CLI and tests
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    records: Mutex<Vec<MessageRecord>>,
    placeholders: Mutex<HashSet<String>>,
    saves: AtomicUsize,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_placeholder(&self, message_id: impl Into<String>) {
        self.placeholders.lock().insert(message_id.into());
    }

    pub fn has_placeholder(&self, message_id: &str) -> bool {
        self.placeholders.lock().contains(message_id)
    }

    pub fn records(&self) -> Vec<MessageRecord> {
        self.records.lock().clone()
    }

    pub fn record(&self, message_id: &str) -> Option<MessageRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.message_id == message_id)
            .cloned()
    }

    /// How many times history was saved
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn commit(&self, record: MessageRecord) -> Result<(), StoreError> {
        self.placeholders.lock().remove(&record.message_id);
        let mut records = self.records.lock();
        match records
            .iter_mut()
            .find(|r| r.message_id == record.message_id)
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        Ok(())
    }

    async fn remove_placeholder(&self, message_id: &str) -> Result<(), StoreError> {
        if self.placeholders.lock().remove(message_id) {
            Ok(())
        } else {
            Err(StoreError::PlaceholderNotFound(message_id.to_string()))
        }
    }

    async fn save_history(&self) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
