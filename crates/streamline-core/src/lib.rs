//! Streaming chat-content engine
//!
//! Turns a stream of typed events for an assistant message into
//! deduplicated, format-repaired text and an ordered list of render-ready
//! blocks, with per-session isolation and cancellation that keeps whatever
//! the user already saw.
//!
//! Key components:
//! - `stream` - event types, wire decoding and the per-message processor
//! - `blocks` - format repair, segmentation and the block manager
//! - `output` - throttled, size-capped delivery to the UI
//! - `session` - session registry, stream jobs and cancellation
//! - `config` - TOML configuration with environment overrides

pub mod blocks;
pub mod config;
pub mod output;
pub mod session;
pub mod stream;

pub use blocks::{BlockKind, MarkdownBlock, MarkdownBlockManager};
pub use config::{ConfigError, EngineConfig};
pub use output::{OutputUpdate, StreamingOutputController};
pub use session::{
    CancellationCoordinator, CancellationReason, InMemoryMessageStore, MessageRecord,
    MessageStore, SessionIsolationManager, StreamChannel, StreamOutcome, StreamRequest, UiUpdate,
    UiUpdateKind,
};
pub use stream::{
    ContentDeduplicator, ProcessedEventResult, StreamEvent, StreamEventProcessor, StreamPhase,
    WireDecoder,
};
