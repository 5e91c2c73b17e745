//! Per-session processor registry
//!
//! Owns one processor (and its block manager) per `(session, message)`.
//! Each stream channel has at most one active session; switching away from
//! a session cancels and evicts its resources when isolation is strict, so
//! a late event from an old session can never touch the new one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blocks::SharedBlockManager;
use crate::config::EngineConfig;
use crate::stream::StreamEventProcessor;

/// Independent output channel; each has its own active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChannel {
    Text,
    Image,
}

type EntryKey = (String, String);

#[derive(Debug)]
struct ProcessorEntry {
    processor: Arc<StreamEventProcessor>,
    last_used: Instant,
}

#[derive(Debug)]
pub struct SessionIsolationManager {
    config: EngineConfig,
    processors: DashMap<EntryKey, ProcessorEntry>,
    active: RwLock<HashMap<StreamChannel, String>>,
}

impl SessionIsolationManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            processors: DashMap::new(),
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Processor for a message, created on first use
    pub fn get_message_processor(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Arc<StreamEventProcessor> {
        let key = (session_id.to_string(), message_id.to_string());
        let mut entry = self
            .processors
            .entry(key)
            .or_insert_with(|| self.new_entry(session_id, message_id));
        entry.last_used = Instant::now();
        entry.processor.clone()
    }

    /// Processor for a new stream on a message. One left over from a
    /// finished or cancelled stream is replaced, never reused.
    pub fn restart_message_processor(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Arc<StreamEventProcessor> {
        let key = (session_id.to_string(), message_id.to_string());
        let mut entry = self
            .processors
            .entry(key)
            .or_insert_with(|| self.new_entry(session_id, message_id));
        if entry.processor.phase().is_terminal() || entry.processor.is_cancelled() {
            debug!(session_id, message_id, "Replacing finished stream processor");
            entry.processor = Arc::new(StreamEventProcessor::new(
                session_id,
                message_id,
                &self.config,
            ));
        }
        entry.last_used = Instant::now();
        entry.processor.clone()
    }

    fn new_entry(&self, session_id: &str, message_id: &str) -> ProcessorEntry {
        debug!(session_id, message_id, "Creating stream processor");
        ProcessorEntry {
            processor: Arc::new(StreamEventProcessor::new(
                session_id,
                message_id,
                &self.config,
            )),
            last_used: Instant::now(),
        }
    }

    /// Block manager fed by the message's processor
    pub fn get_block_manager(&self, session_id: &str, message_id: &str) -> SharedBlockManager {
        self.get_message_processor(session_id, message_id)
            .block_manager()
    }

    pub fn switch_to_text_session(&self, session_id: &str) -> Option<String> {
        self.switch_session(StreamChannel::Text, session_id)
    }

    pub fn switch_to_image_session(&self, session_id: &str) -> Option<String> {
        self.switch_session(StreamChannel::Image, session_id)
    }

    /// Make `session_id` active on `channel`, returning the session it
    /// replaced
    pub fn switch_session(&self, channel: StreamChannel, session_id: &str) -> Option<String> {
        let previous = {
            let mut active = self.active.write();
            let previous = active.insert(channel, session_id.to_string());
            if previous.as_deref() == Some(session_id) {
                return previous;
            }
            previous
        };

        if let Some(prev) = previous.as_deref() {
            info!(
                channel = ?channel,
                from = prev,
                to = session_id,
                "Switching active session"
            );
            // Still active on the other channel: leave it alone
            if self.config.sessions.strict_isolation && !self.is_active(prev) {
                self.clear_session_resources(prev);
            }
        }
        previous
    }

    /// Cancel and drop every processor of a session. Returns how many
    /// were dropped.
    pub fn clear_session_resources(&self, session_id: &str) -> usize {
        let before = self.processors.len();
        self.processors.retain(|(session, _), entry| {
            if session == session_id {
                entry.processor.cancel();
                false
            } else {
                true
            }
        });
        self.active.write().retain(|_, active| active.as_str() != session_id);

        let removed = before.saturating_sub(self.processors.len());
        if removed > 0 {
            info!(session_id, removed, "Cleared session resources");
        }
        removed
    }

    /// Mark every running stream of a session as completed. Returns how
    /// many were still running.
    pub fn force_complete_session_streams(&self, session_id: &str) -> usize {
        let completed = self
            .processors
            .iter()
            .filter(|entry| entry.key().0 == session_id)
            .filter(|entry| entry.processor.force_complete())
            .count();
        if completed > 0 {
            info!(session_id, completed, "Force-completed session streams");
        }
        completed
    }

    /// Evict finished processors past the grace window, then the least
    /// recently used processors of inactive sessions until the cache is
    /// under its ceiling. Returns how many were evicted.
    pub fn collect_garbage(&self) -> usize {
        let grace = self.config.sessions.completed_grace();
        let before = self.processors.len();
        self.processors
            .retain(|_, entry| !matches!(entry.processor.idle_for(), Some(idle) if idle >= grace));
        let mut evicted = before.saturating_sub(self.processors.len());

        let ceiling = self.config.sessions.max_cached_processors;
        if self.processors.len() > ceiling {
            let mut candidates: Vec<(EntryKey, Instant)> = self
                .processors
                .iter()
                .filter(|entry| !self.is_active(&entry.key().0))
                .map(|entry| (entry.key().clone(), entry.last_used))
                .collect();
            candidates.sort_by_key(|(_, last_used)| *last_used);

            let excess = self.processors.len().saturating_sub(ceiling);
            for (key, _) in candidates.into_iter().take(excess) {
                if let Some((_, entry)) = self.processors.remove(&key) {
                    entry.processor.cancel();
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = self.processors.len(), "Processor GC");
        }
        evicted
    }

    pub fn active_session(&self, channel: StreamChannel) -> Option<String> {
        self.active.read().get(&channel).cloned()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.read().values().any(|s| s == session_id)
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }
}
