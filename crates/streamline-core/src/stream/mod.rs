//! Stream event handling
//!
//! Typed events, their wire decoding, and the per-message processor that
//! folds them into accumulated text, reasoning and blocks.

pub mod dedup;
pub mod event;
mod processor;
mod state;
pub mod wire;

pub use dedup::ContentDeduplicator;
pub use event::{ProcessedEventResult, StreamEvent, WebSearchResult};
pub use processor::StreamEventProcessor;
pub use state::{MessageStreamState, StreamPhase, StreamSnapshot};
pub use wire::{decode_event, WireDecoder, WireError};
