//! Per-message stream event processor
//!
//! Consumes tagged stream events for one assistant message and turns them
//! into [`ProcessedEventResult`]s. All mutable state sits behind a single
//! lock, so calls are serialized even if they come from several callbacks.
//!
//! Content payloads are cumulative and *replace* the accumulated text;
//! reasoning payloads are deltas and are *appended*.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::dedup::ContentDeduplicator;
use super::event::{ProcessedEventResult, StreamEvent};
use super::state::{MessageStreamState, StreamPhase, StreamSnapshot};
use crate::blocks::{correct_format, MarkdownBlock, MarkdownBlockManager, SharedBlockManager};
use crate::config::EngineConfig;

/// Everything guarded by the processor lock
#[derive(Debug)]
struct ProcessorInner {
    state: MessageStreamState,
    dedup: ContentDeduplicator,
}

/// State machine for one assistant-message stream
#[derive(Debug)]
pub struct StreamEventProcessor {
    session_id: String,
    message_id: String,
    inner: Mutex<ProcessorInner>,
    blocks: SharedBlockManager,
}

impl StreamEventProcessor {
    pub fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        config: &EngineConfig,
    ) -> Self {
        Self::with_blocks(
            session_id,
            message_id,
            config,
            MarkdownBlockManager::shared(&config.blocks),
        )
    }

    /// Build a processor that drives an existing block manager
    pub fn with_blocks(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        config: &EngineConfig,
        blocks: SharedBlockManager,
    ) -> Self {
        let session_id = session_id.into();
        let message_id = message_id.into();
        Self {
            inner: Mutex::new(ProcessorInner {
                state: MessageStreamState::new(session_id.clone(), message_id.clone()),
                dedup: ContentDeduplicator::new(&config.dedup),
            }),
            session_id,
            message_id,
            blocks,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Apply one event
    pub fn process_event(&self, event: StreamEvent) -> ProcessedEventResult {
        let mut inner = self.inner.lock();
        if inner.state.is_cancelled {
            return ProcessedEventResult::Cancelled;
        }
        inner.state.touch();
        debug!(
            session_id = %self.session_id,
            message_id = %self.message_id,
            event = event.kind(),
            "Processing stream event"
        );

        match event {
            StreamEvent::Content { text }
            | StreamEvent::ContentFinal { text }
            | StreamEvent::Text { text } => self.apply_content(&mut inner, text),
            StreamEvent::Reasoning { text } => {
                let state = &mut inner.state;
                if state.phase.is_terminal() || text.is_empty() {
                    return ProcessedEventResult::NoChange;
                }
                state.accumulated_reasoning.push_str(&text);
                state.is_reasoning_complete = false;
                state.phase = StreamPhase::Reasoning;
                ProcessedEventResult::ReasoningUpdated {
                    text: state.accumulated_reasoning.clone(),
                }
            }
            StreamEvent::Finish => {
                let state = &mut inner.state;
                if state.phase.is_terminal() {
                    return ProcessedEventResult::NoChange;
                }
                state.is_reasoning_complete = true;
                state.finish(StreamPhase::Completed);
                info!(
                    session_id = %self.session_id,
                    message_id = %self.message_id,
                    chars = state.accumulated_text.len(),
                    duration = ?state.duration(),
                    "Stream completed"
                );
                ProcessedEventResult::ReasoningComplete
            }
            StreamEvent::ToolCall { .. } => {
                inner.state.is_reasoning_complete = true;
                ProcessedEventResult::ReasoningComplete
            }
            StreamEvent::Error { message } => {
                let state = &mut inner.state;
                state.error = Some(message.clone());
                state.finish(StreamPhase::Errored);
                info!(
                    session_id = %self.session_id,
                    message_id = %self.message_id,
                    error = %message,
                    "Stream errored"
                );
                ProcessedEventResult::Error { message }
            }
            StreamEvent::StatusUpdate { stage } => {
                inner.state.status = Some(stage.clone());
                ProcessedEventResult::StatusUpdate { stage }
            }
            StreamEvent::WebSearchResults { results } => {
                ProcessedEventResult::WebSearchResults { results }
            }
            StreamEvent::OutputType { kind } => {
                inner.state.output_kind = Some(kind);
                ProcessedEventResult::NoChange
            }
        }
    }

    fn apply_content(&self, inner: &mut ProcessorInner, text: String) -> ProcessedEventResult {
        let ProcessorInner { state, dedup } = inner;

        if text.is_empty() {
            return ProcessedEventResult::NoChange;
        }
        if matches!(state.phase, StreamPhase::Completed | StreamPhase::Errored) {
            debug!(
                message_id = %self.message_id,
                "Ignoring content after stream end"
            );
            return ProcessedEventResult::NoChange;
        }
        if !state.seen_chunk_digests.insert(digest(&text)) || text == state.accumulated_text {
            return ProcessedEventResult::NoChange;
        }
        if state.accumulated_text.starts_with(&text) {
            debug!(
                message_id = %self.message_id,
                stale_len = text.len(),
                current_len = state.accumulated_text.len(),
                "Dropping stale cumulative payload"
            );
            return ProcessedEventResult::NoChange;
        }

        if text.starts_with(state.accumulated_text.as_str()) {
            dedup.record(&text);
        } else if dedup.is_duplicate(&text) {
            return ProcessedEventResult::NoChange;
        }

        if state.accumulated_text.is_empty() {
            // Reasoning box collapses once the answer starts
            state.is_reasoning_complete = true;
        }
        state.phase = StreamPhase::Content;
        state.accumulated_text = text;
        self.sync_blocks(&state.accumulated_text);

        ProcessedEventResult::ContentUpdated {
            text: state.accumulated_text.clone(),
        }
    }

    fn sync_blocks(&self, raw: &str) {
        let corrected = correct_format(raw);
        let source = if corrected.trim().is_empty() {
            raw
        } else {
            corrected.as_str()
        };
        self.blocks.lock().sync_text(source);
    }

    /// Stop processing; every later event yields `Cancelled`
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if inner.state.is_cancelled {
            return;
        }
        inner.state.is_cancelled = true;
        inner.state.finish(StreamPhase::Cancelled);
        info!(
            session_id = %self.session_id,
            message_id = %self.message_id,
            "Stream processor cancelled"
        );
    }

    /// Forget everything and go back to `Idle`
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state.reset();
        inner.dedup.clear();
        self.blocks.lock().clear();
    }

    /// Mark a still-running stream as completed. Returns false if it
    /// already reached a terminal phase.
    pub fn force_complete(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.phase.is_terminal() {
            return false;
        }
        inner.state.is_reasoning_complete = true;
        inner.state.finish(StreamPhase::Completed);
        true
    }

    pub fn current_text(&self) -> String {
        self.inner.lock().state.accumulated_text.clone()
    }

    pub fn current_reasoning(&self) -> Option<String> {
        let inner = self.inner.lock();
        (!inner.state.accumulated_reasoning.is_empty())
            .then(|| inner.state.accumulated_reasoning.clone())
    }

    pub fn phase(&self) -> StreamPhase {
        self.inner.lock().state.phase
    }

    pub fn is_reasoning_complete(&self) -> bool {
        self.inner.lock().state.is_reasoning_complete
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().state.is_cancelled
    }

    /// Time since the stream reached a terminal phase
    pub fn idle_for(&self) -> Option<Duration> {
        self.inner.lock().state.idle_for()
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        StreamSnapshot::from(&self.inner.lock().state)
    }

    pub fn block_manager(&self) -> SharedBlockManager {
        self.blocks.clone()
    }

    pub fn blocks(&self) -> Vec<MarkdownBlock> {
        self.blocks.lock().blocks()
    }
}

fn digest(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> StreamEventProcessor {
        StreamEventProcessor::new("session-1", "message-1", &EngineConfig::default())
    }

    fn content(text: &str) -> StreamEvent {
        StreamEvent::Content {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_end_to_end_scenario() {
        let p = processor();
        assert_eq!(
            p.process_event(StreamEvent::Reasoning {
                text: "Thinking...".to_string()
            }),
            ProcessedEventResult::ReasoningUpdated {
                text: "Thinking...".to_string()
            }
        );
        assert_eq!(p.phase(), StreamPhase::Reasoning);
        assert!(!p.is_reasoning_complete());

        assert_eq!(
            p.process_event(content("Hello")),
            ProcessedEventResult::ContentUpdated {
                text: "Hello".to_string()
            }
        );
        assert!(p.is_reasoning_complete());
        assert_eq!(p.phase(), StreamPhase::Content);

        assert_eq!(
            p.process_event(content("Hello, world!")),
            ProcessedEventResult::ContentUpdated {
                text: "Hello, world!".to_string()
            }
        );
        assert_eq!(
            p.process_event(StreamEvent::Finish),
            ProcessedEventResult::ReasoningComplete
        );

        assert_eq!(p.current_reasoning().as_deref(), Some("Thinking..."));
        assert_eq!(p.current_text(), "Hello, world!");
        assert!(p.is_reasoning_complete());
        assert_eq!(p.phase(), StreamPhase::Completed);
    }

    #[test]
    fn test_content_final_is_idempotent() {
        let p = processor();
        let event = StreamEvent::ContentFinal {
            text: "Final answer".to_string(),
        };
        assert!(p.process_event(event.clone()).is_change());
        let first = p.current_text();
        assert_eq!(p.process_event(event), ProcessedEventResult::NoChange);
        assert_eq!(p.current_text(), first);
    }

    #[test]
    fn test_reasoning_is_appended() {
        let p = processor();
        p.process_event(StreamEvent::Reasoning {
            text: "Step one. ".to_string(),
        });
        let result = p.process_event(StreamEvent::Reasoning {
            text: "Step two.".to_string(),
        });
        assert_eq!(
            result,
            ProcessedEventResult::ReasoningUpdated {
                text: "Step one. Step two.".to_string()
            }
        );
    }

    #[test]
    fn test_stale_replay_does_not_regress_text() {
        let p = processor();
        p.process_event(content("The answer"));
        p.process_event(content("The answer is 42"));
        assert_eq!(
            p.process_event(content("The answer")),
            ProcessedEventResult::NoChange
        );
        assert_eq!(
            p.process_event(content("The ans")),
            ProcessedEventResult::NoChange
        );
        assert_eq!(p.current_text(), "The answer is 42");
    }

    #[test]
    fn test_repeat_glitch_is_suppressed() {
        let p = processor();
        p.process_event(content("Rust is a systems programming language."));
        // Same text re-emitted with different spacing and case
        assert_eq!(
            p.process_event(content("rust is a  systems programming language.")),
            ProcessedEventResult::NoChange
        );
        assert_eq!(p.current_text(), "Rust is a systems programming language.");

        // A genuinely different rewrite is accepted
        assert!(p
            .process_event(content("Completely new wording arrives here"))
            .is_change());
    }

    #[test]
    fn test_cancel_short_circuits() {
        let p = processor();
        p.process_event(content("Partial"));
        p.cancel();
        assert_eq!(
            p.process_event(content("Partial answer")),
            ProcessedEventResult::Cancelled
        );
        assert_eq!(p.process_event(StreamEvent::Finish), ProcessedEventResult::Cancelled);
        assert_eq!(p.current_text(), "Partial");
        assert_eq!(p.phase(), StreamPhase::Cancelled);
    }

    #[test]
    fn test_error_keeps_text() {
        let p = processor();
        p.process_event(content("Some text"));
        assert_eq!(
            p.process_event(StreamEvent::Error {
                message: "backend overloaded".to_string()
            }),
            ProcessedEventResult::Error {
                message: "backend overloaded".to_string()
            }
        );
        assert_eq!(p.current_text(), "Some text");
        assert_eq!(p.phase(), StreamPhase::Errored);
        assert_eq!(
            p.process_event(content("Some text and more")),
            ProcessedEventResult::NoChange
        );
    }

    #[test]
    fn test_tool_call_completes_reasoning() {
        let p = processor();
        p.process_event(StreamEvent::Reasoning {
            text: "Let me look that up".to_string(),
        });
        assert_eq!(
            p.process_event(StreamEvent::ToolCall {
                data: serde_json::json!({"name": "search"})
            }),
            ProcessedEventResult::ReasoningComplete
        );
        assert!(p.is_reasoning_complete());
        assert!(!p.phase().is_terminal());
    }

    #[test]
    fn test_blocks_follow_content() {
        let p = processor();
        p.process_event(content("Intro\n```py\nprint(1)"));
        p.process_event(content("Intro\n```py\nprint(1)\nprint(2)\n```"));
        let blocks = p.blocks();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[1].content().contains("print(2)"));
    }

    #[test]
    fn test_legacy_text_and_metadata_events() {
        let p = processor();
        assert_eq!(
            p.process_event(StreamEvent::OutputType {
                kind: "text".to_string()
            }),
            ProcessedEventResult::NoChange
        );
        assert_eq!(
            p.process_event(StreamEvent::StatusUpdate {
                stage: "searching".to_string()
            }),
            ProcessedEventResult::StatusUpdate {
                stage: "searching".to_string()
            }
        );
        assert!(p
            .process_event(StreamEvent::Text {
                text: "legacy".to_string()
            })
            .is_change());
        let snapshot = p.snapshot();
        assert_eq!(snapshot.text, "legacy");
        assert_eq!(snapshot.output_kind.as_deref(), Some("text"));
        assert_eq!(snapshot.status.as_deref(), Some("searching"));
    }

    #[test]
    fn test_reset() {
        let p = processor();
        p.process_event(content("Hello"));
        p.cancel();
        p.reset();
        assert_eq!(p.phase(), StreamPhase::Idle);
        assert!(p.current_text().is_empty());
        assert!(p.blocks().is_empty());
        assert!(p.process_event(content("Hello")).is_change());
    }

    #[test]
    fn test_force_complete() {
        let p = processor();
        p.process_event(content("Half"));
        assert!(p.force_complete());
        assert!(!p.force_complete());
        assert_eq!(p.phase(), StreamPhase::Completed);
    }
}
