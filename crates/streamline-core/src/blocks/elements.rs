//! Markdown block types

use serde::Serialize;

/// Kind tag of a block, half of its identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    CodeBlock,
    Math,
    Header,
    ListItem,
}

impl BlockKind {
    /// Parse an upstream `block_type` tag
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "text" | "paragraph" => Some(BlockKind::Text),
            "code_block" | "code" => Some(BlockKind::CodeBlock),
            "math" | "math_block" => Some(BlockKind::Math),
            "header" | "heading" => Some(BlockKind::Header),
            "list_item" => Some(BlockKind::ListItem),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Text => "text",
            BlockKind::CodeBlock => "code_block",
            BlockKind::Math => "math",
            BlockKind::Header => "header",
            BlockKind::ListItem => "list_item",
        }
    }
}

/// Render-ready block
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarkdownBlock {
    /// Paragraph text, inline markdown left as-is
    Text { content: String },
    /// Fenced code with optional language
    Code {
        content: String,
        language: Option<String>,
    },
    /// LaTeX expression
    Math { latex: String, is_display: bool },
    /// Heading with level (1-6)
    Header { level: u8, content: String },
    ListItem { content: String },
}

impl MarkdownBlock {
    pub fn kind(&self) -> BlockKind {
        match self {
            MarkdownBlock::Text { .. } => BlockKind::Text,
            MarkdownBlock::Code { .. } => BlockKind::CodeBlock,
            MarkdownBlock::Math { .. } => BlockKind::Math,
            MarkdownBlock::Header { .. } => BlockKind::Header,
            MarkdownBlock::ListItem { .. } => BlockKind::ListItem,
        }
    }

    /// Main text payload of the block
    pub fn content(&self) -> &str {
        match self {
            MarkdownBlock::Text { content }
            | MarkdownBlock::Code { content, .. }
            | MarkdownBlock::Header { content, .. }
            | MarkdownBlock::ListItem { content } => content,
            MarkdownBlock::Math { latex, .. } => latex,
        }
    }
}

/// Identity of a block within one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockKey {
    pub kind: BlockKind,
    /// Ordinal of the logical segment within the message
    pub position: usize,
}

/// One segment update, as produced by the splitter
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEvent {
    pub position: usize,
    pub block: MarkdownBlock,
}

impl BlockEvent {
    pub fn new(position: usize, block: MarkdownBlock) -> Self {
        Self { position, block }
    }

    pub fn key(&self) -> BlockKey {
        BlockKey {
            kind: self.block.kind(),
            position: self.position,
        }
    }
}
