//! Throttled output delivery
//!
//! Sits between the processor and the UI. Updates are only pushed when
//! enough new text has arrived *and* enough time has passed since the last
//! push, or when flushed explicitly. A hard size cap bounds memory for
//! runaway streams.

use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::OutputConfig;

/// Appended once when the cap is hit
pub const TRUNCATION_MARKER: &str = "\n\n[Output truncated]";

/// Text pushed to the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputUpdate {
    pub text: String,
    /// Set once the size cap was hit
    pub truncated: bool,
}

#[derive(Debug)]
pub struct StreamingOutputController {
    buffer: String,
    /// Char count of `buffer`
    chars: usize,
    /// Chars changed since the last emission
    pending_chars: usize,
    dirty: bool,
    last_emit: Option<Instant>,
    min_interval: Duration,
    min_chunk_chars: usize,
    max_chars: usize,
    overflowing: bool,
    tx: mpsc::UnboundedSender<OutputUpdate>,
}

impl StreamingOutputController {
    pub fn new(config: &OutputConfig, tx: mpsc::UnboundedSender<OutputUpdate>) -> Self {
        Self {
            buffer: String::new(),
            chars: 0,
            pending_chars: 0,
            dirty: false,
            last_emit: None,
            min_interval: config.update_interval(),
            min_chunk_chars: config.min_chunk_chars,
            max_chars: config.max_chars.max(1),
            overflowing: false,
            tx,
        }
    }

    /// Controller plus the receiving end of its update channel
    pub fn channel(config: &OutputConfig) -> (Self, mpsc::UnboundedReceiver<OutputUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(config, tx), rx)
    }

    /// Append a delta. Returns false once the cap has been hit.
    pub fn add_text(&mut self, text: &str) -> bool {
        if self.overflowing {
            return false;
        }
        if text.is_empty() {
            return true;
        }

        let added = text.chars().count();
        self.buffer.push_str(text);
        self.chars += added;
        self.pending_chars += added;
        self.dirty = true;
        self.after_change()
    }

    /// Replace the whole buffer with cumulative text. Returns false once
    /// the cap has been hit.
    pub fn replace_text(&mut self, text: &str) -> bool {
        if self.overflowing {
            return false;
        }
        if text == self.buffer {
            return true;
        }

        let new_chars = text.chars().count();
        self.pending_chars += new_chars.abs_diff(self.chars).max(1);
        self.buffer.clear();
        self.buffer.push_str(text);
        self.chars = new_chars;
        self.dirty = true;
        self.after_change()
    }

    /// Push the current text now, ignoring the thresholds
    pub fn flush_update(&mut self) {
        if self.dirty {
            self.emit();
        }
    }

    pub fn current_text(&self) -> &str {
        &self.buffer
    }

    pub fn is_overflowing(&self) -> bool {
        self.overflowing
    }

    /// Drop all text and lift the overflow state
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.chars = 0;
        self.pending_chars = 0;
        self.dirty = false;
        self.last_emit = None;
        self.overflowing = false;
    }

    fn after_change(&mut self) -> bool {
        if self.chars > self.max_chars {
            self.truncate();
            return false;
        }

        let interval_elapsed = match self.last_emit {
            Some(at) => at.elapsed() >= self.min_interval,
            None => true,
        };
        if self.pending_chars >= self.min_chunk_chars && interval_elapsed {
            self.emit();
        }
        true
    }

    fn truncate(&mut self) {
        if let Some((cut, _)) = self.buffer.char_indices().nth(self.max_chars) {
            self.buffer.truncate(cut);
        }
        self.buffer.push_str(TRUNCATION_MARKER);
        self.chars = self.buffer.chars().count();
        self.overflowing = true;
        warn!(max_chars = self.max_chars, "Output cap reached, truncating");
        self.emit();
    }

    fn emit(&mut self) {
        let update = OutputUpdate {
            text: self.buffer.clone(),
            truncated: self.overflowing,
        };
        if self.tx.send(update).is_err() {
            debug!("Output receiver dropped");
        }
        self.last_emit = Some(Instant::now());
        self.pending_chars = 0;
        self.dirty = false;
    }
}
