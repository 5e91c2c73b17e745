//! Render-ready content blocks
//!
//! Accumulated assistant text is repaired (`format`), segmented
//! (`splitter`) and kept in an overwrite-safe ordered list (`manager`).

mod elements;
pub mod format;
mod manager;
mod splitter;

pub use elements::{BlockEvent, BlockKey, BlockKind, MarkdownBlock};
pub use format::{clean_excessive_whitespace, contains_math_content, correct_format};
pub use manager::{BlockChange, MarkdownBlockManager, SharedBlockManager};
pub use splitter::{latex_density, BlockSplitter};
