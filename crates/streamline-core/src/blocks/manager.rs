//! Overwrite-safe block list for one message
//!
//! Blocks are keyed by `(kind, position)`. Re-sending a segment overwrites
//! the block in place, so the list length always equals the number of
//! distinct segments no matter how often the cumulative text is replayed.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::elements::{BlockEvent, BlockKey, BlockKind, MarkdownBlock};
use super::splitter::{latex_density, BlockSplitter};
use crate::config::BlockConfig;

/// Shared handle used by the session registry and the processor
pub type SharedBlockManager = Arc<Mutex<MarkdownBlockManager>>;

/// What `process_event` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockChange {
    Inserted,
    Updated,
    /// A block of another kind held this position and was replaced
    Diverged,
    Unchanged,
}

#[derive(Debug)]
pub struct MarkdownBlockManager {
    entries: Vec<(BlockKey, MarkdownBlock)>,
    splitter: BlockSplitter,
    latex_density_threshold: f64,
}

impl Default for MarkdownBlockManager {
    fn default() -> Self {
        Self::new(&BlockConfig::default())
    }
}

impl MarkdownBlockManager {
    pub fn new(config: &BlockConfig) -> Self {
        Self {
            entries: Vec::new(),
            splitter: BlockSplitter::new(),
            latex_density_threshold: config.latex_density_threshold,
        }
    }

    pub fn shared(config: &BlockConfig) -> SharedBlockManager {
        Arc::new(Mutex::new(Self::new(config)))
    }

    /// Upsert one segment
    pub fn process_event(&mut self, event: BlockEvent) -> BlockChange {
        let event = self.reclassify(event);
        let key = event.key();

        if let Some((_, block)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            if *block == event.block {
                return BlockChange::Unchanged;
            }
            *block = event.block;
            return BlockChange::Updated;
        }

        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.position == key.position)
        {
            debug!(
                position = key.position,
                from = entry.0.kind.as_str(),
                to = key.kind.as_str(),
                "Segment diverged, replacing block"
            );
            *entry = (key, event.block);
            return BlockChange::Diverged;
        }

        let at = self
            .entries
            .iter()
            .position(|(k, _)| k.position > key.position)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, (key, event.block));
        BlockChange::Inserted
    }

    /// Upsert a segment described by an upstream `block_type` tag.
    /// Returns `None` for tags this manager does not know.
    pub fn process_tagged(
        &mut self,
        block_type: &str,
        position: usize,
        content: &str,
        language: Option<&str>,
    ) -> Option<BlockChange> {
        let block = match BlockKind::parse(block_type)? {
            BlockKind::Text => MarkdownBlock::Text {
                content: content.to_string(),
            },
            BlockKind::CodeBlock => MarkdownBlock::Code {
                content: content.to_string(),
                language: language.filter(|l| !l.is_empty()).map(str::to_string),
            },
            BlockKind::Math => MarkdownBlock::Math {
                latex: content.trim().to_string(),
                is_display: true,
            },
            BlockKind::Header => {
                let trimmed = content.trim_start();
                let hashes = trimmed.chars().take_while(|c| *c == '#').count();
                MarkdownBlock::Header {
                    level: hashes.clamp(1, 6) as u8,
                    content: trimmed[hashes..].trim().to_string(),
                }
            }
            BlockKind::ListItem => MarkdownBlock::ListItem {
                content: content.to_string(),
            },
        };
        Some(self.process_event(BlockEvent::new(position, block)))
    }

    /// Re-segment the full accumulated text. Blocks past the new segment
    /// count are dropped. Returns the segment count.
    pub fn sync_text(&mut self, text: &str) -> usize {
        let events = self.splitter.split(text);
        let count = events.len();
        let mut changed = 0usize;
        for event in events {
            if self.process_event(event) != BlockChange::Unchanged {
                changed += 1;
            }
        }
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k.position < count);
        if changed > 0 || before != self.entries.len() {
            debug!(
                segments = count,
                changed,
                dropped = before - self.entries.len(),
                "Blocks synced"
            );
        }
        count
    }

    /// Snapshot of the blocks in order
    pub fn blocks(&self) -> Vec<MarkdownBlock> {
        self.entries.iter().map(|(_, b)| b.clone()).collect()
    }

    pub fn get(&self, key: BlockKey) -> Option<&MarkdownBlock> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, b)| b)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Untagged code dense with LaTeX commands is really display math
    fn reclassify(&self, event: BlockEvent) -> BlockEvent {
        match event.block {
            MarkdownBlock::Code {
                ref content,
                language: None,
            } if latex_density(content) >= self.latex_density_threshold => BlockEvent::new(
                event.position,
                MarkdownBlock::Math {
                    latex: content.trim().to_string(),
                    is_display: true,
                },
            ),
            _ => event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_segment_overwrites() {
        let mut manager = MarkdownBlockManager::default();
        manager.sync_text("```py\nprint(1)");
        assert_eq!(manager.len(), 1);

        manager.sync_text("```py\nprint(1)\nprint(2)\n```");
        assert_eq!(manager.len(), 1);
        let blocks = manager.blocks();
        match &blocks[0] {
            MarkdownBlock::Code { content, language } => {
                assert!(content.contains("print(2)"));
                assert_eq!(language.as_deref(), Some("py"));
            }
            other => panic!("Expected Code, got {:?}", other),
        }
    }

    #[test]
    fn test_growing_text_appends_new_segments() {
        let mut manager = MarkdownBlockManager::default();
        assert_eq!(manager.sync_text("Intro"), 1);
        assert_eq!(manager.sync_text("Intro paragraph\n\n```rs\nlet x"), 2);
        assert_eq!(manager.sync_text("Intro paragraph\n\n```rs\nlet x = 1;\n```\n\nDone."), 3);

        let blocks = manager.blocks();
        assert_eq!(blocks[0].kind(), BlockKind::Text);
        assert_eq!(blocks[1].kind(), BlockKind::CodeBlock);
        assert_eq!(blocks[2].content(), "Done.");
    }

    #[test]
    fn test_divergence_replaces_instead_of_duplicating() {
        let mut manager = MarkdownBlockManager::default();
        manager.process_event(BlockEvent::new(
            0,
            MarkdownBlock::Header {
                level: 1,
                content: String::new(),
            },
        ));
        let change = manager.process_event(BlockEvent::new(
            0,
            MarkdownBlock::Text {
                content: "#hashtag".to_string(),
            },
        ));
        assert_eq!(change, BlockChange::Diverged);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.blocks()[0].kind(), BlockKind::Text);
    }

    #[test]
    fn test_shrinking_segmentation_drops_stale_blocks() {
        let mut manager = MarkdownBlockManager::default();
        manager.sync_text("one\n\ntwo\n\nthree");
        assert_eq!(manager.len(), 3);
        manager.sync_text("one two three");
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_insert_keeps_position_order() {
        let mut manager = MarkdownBlockManager::default();
        manager.process_tagged("text", 2, "third", None);
        manager.process_tagged("text", 0, "first", None);
        manager.process_tagged("code_block", 1, "x = 1", Some("py"));
        let contents: Vec<String> = manager
            .blocks()
            .iter()
            .map(|b| b.content().to_string())
            .collect();
        assert_eq!(contents, vec!["first", "x = 1", "third"]);
    }

    #[test]
    fn test_tagged_events_overwrite_by_key() {
        let mut manager = MarkdownBlockManager::default();
        assert_eq!(
            manager.process_tagged("text", 0, "Hel", None),
            Some(BlockChange::Inserted)
        );
        assert_eq!(
            manager.process_tagged("text", 0, "Hello", None),
            Some(BlockChange::Updated)
        );
        assert_eq!(
            manager.process_tagged("text", 0, "Hello", None),
            Some(BlockChange::Unchanged)
        );
        assert_eq!(manager.process_tagged("table", 1, "|a|", None), None);
        assert_eq!(manager.len(), 1);

        manager.process_tagged("header", 1, "## Setup", None);
        assert_eq!(
            manager.get(BlockKey {
                kind: BlockKind::Header,
                position: 1
            }),
            Some(&MarkdownBlock::Header {
                level: 2,
                content: "Setup".to_string()
            })
        );
    }

    #[test]
    fn test_latex_dense_fence_becomes_math() {
        let mut manager = MarkdownBlockManager::default();
        manager.sync_text("```\n\\frac{a}{b} + \\sqrt{c}\n```");
        assert_eq!(
            manager.blocks(),
            vec![MarkdownBlock::Math {
                latex: "\\frac{a}{b} + \\sqrt{c}".to_string(),
                is_display: true
            }]
        );

        // A language hint keeps it as code
        manager.clear();
        manager.sync_text("```latex\n\\frac{a}{b} + \\sqrt{c}\n```");
        assert_eq!(manager.blocks()[0].kind(), BlockKind::CodeBlock);
    }
}
