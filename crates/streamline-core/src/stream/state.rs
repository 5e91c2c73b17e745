//! Per-message stream state
//!
//! Owned by exactly one processor and only mutated under its lock.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Lifecycle of one message stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Idle,
    /// Streaming, reasoning deltas arriving
    Reasoning,
    /// Streaming, answer text arriving
    Content,
    Completed,
    Errored,
    Cancelled,
}

impl StreamPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamPhase::Completed | StreamPhase::Errored | StreamPhase::Cancelled
        )
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, StreamPhase::Reasoning | StreamPhase::Content)
    }
}

/// Runtime state of one assistant-message stream
#[derive(Debug)]
pub struct MessageStreamState {
    pub session_id: String,
    pub message_id: String,
    /// Latest cumulative answer text
    pub accumulated_text: String,
    /// Reasoning deltas appended in order
    pub accumulated_reasoning: String,
    /// Digests of content payloads already applied
    pub seen_chunk_digests: HashSet<u64>,
    pub is_cancelled: bool,
    pub is_reasoning_complete: bool,
    pub phase: StreamPhase,
    /// Last backend status stage
    pub status: Option<String>,
    /// Output kind announced by the backend
    pub output_kind: Option<String>,
    /// Error message once the stream failed
    pub error: Option<String>,
    /// When the first event arrived
    pub started_at: Option<Instant>,
    /// When the stream reached a terminal phase
    pub finished_at: Option<Instant>,
}

impl MessageStreamState {
    pub fn new(session_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            accumulated_text: String::new(),
            accumulated_reasoning: String::new(),
            seen_chunk_digests: HashSet::new(),
            is_cancelled: false,
            is_reasoning_complete: false,
            phase: StreamPhase::Idle,
            status: None,
            output_kind: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Mark the stream as started on its first event
    pub fn touch(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    /// Move to a terminal phase, keeping the first one reached
    pub fn finish(&mut self, phase: StreamPhase) {
        if self.phase.is_terminal() {
            return;
        }
        self.phase = phase;
        self.finished_at = Some(Instant::now());
    }

    /// Time spent streaming so far
    pub fn duration(&self) -> Option<Duration> {
        let start = self.started_at?;
        Some(match self.finished_at {
            Some(end) => end.saturating_duration_since(start),
            None => start.elapsed(),
        })
    }

    /// Time since the stream reached a terminal phase
    pub fn idle_for(&self) -> Option<Duration> {
        self.finished_at.map(|at| at.elapsed())
    }

    /// Back to a fresh, idle state for the same message
    pub fn reset(&mut self) {
        *self = Self::new(
            std::mem::take(&mut self.session_id),
            std::mem::take(&mut self.message_id),
        );
    }
}

/// Read-only copy of a processor's state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSnapshot {
    pub session_id: String,
    pub message_id: String,
    pub text: String,
    pub reasoning: Option<String>,
    pub phase: StreamPhase,
    pub is_reasoning_complete: bool,
    pub status: Option<String>,
    pub output_kind: Option<String>,
    pub error: Option<String>,
}

impl From<&MessageStreamState> for StreamSnapshot {
    fn from(state: &MessageStreamState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            message_id: state.message_id.clone(),
            text: state.accumulated_text.clone(),
            reasoning: (!state.accumulated_reasoning.is_empty())
                .then(|| state.accumulated_reasoning.clone()),
            phase: state.phase,
            is_reasoning_complete: state.is_reasoning_complete,
            status: state.status.clone(),
            output_kind: state.output_kind.clone(),
            error: state.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_terminal_phase_wins() {
        let mut state = MessageStreamState::new("s1", "m1");
        state.phase = StreamPhase::Content;
        state.finish(StreamPhase::Errored);
        state.finish(StreamPhase::Completed);
        assert_eq!(state.phase, StreamPhase::Errored);
        assert!(state.idle_for().is_some());
    }

    #[test]
    fn test_reset_keeps_identity() {
        let mut state = MessageStreamState::new("s1", "m1");
        state.accumulated_text.push_str("text");
        state.is_cancelled = true;
        state.touch();
        state.reset();
        assert_eq!(state.session_id, "s1");
        assert_eq!(state.message_id, "m1");
        assert!(state.accumulated_text.is_empty());
        assert!(!state.is_cancelled);
        assert_eq!(state.phase, StreamPhase::Idle);
        assert!(state.duration().is_none());
    }
}
