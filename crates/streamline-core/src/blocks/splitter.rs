//! Markdown segmentation using pulldown-cmark
//!
//! Splits accumulated text into logical segments and numbers them in
//! document order. The ordinal is the segment's stable position key.

use std::ops::Range;

use once_cell::sync::Lazy;
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use regex::Regex;

use super::elements::{BlockEvent, MarkdownBlock};

/// LaTeX command like `\frac` or `\alpha`
static LATEX_COMMAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\[a-zA-Z]+").unwrap());

/// Leading list marker of an item's first line
static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*+]|\d{1,9}[.)])[ \t]?").unwrap());

/// Fewer commands than this never count as math
const MIN_LATEX_COMMANDS: usize = 2;

type OffsetEvent<'a> = (Event<'a>, Range<usize>);

/// LaTeX commands per non-whitespace char
pub fn latex_density(text: &str) -> f64 {
    let commands = LATEX_COMMAND.find_iter(text).count();
    if commands < MIN_LATEX_COMMANDS {
        return 0.0;
    }
    let chars = text.chars().filter(|c| !c.is_whitespace()).count();
    if chars == 0 {
        return 0.0;
    }
    commands as f64 / chars as f64
}

/// Splits raw markdown into ordered block events
#[derive(Debug, Clone, Default)]
pub struct BlockSplitter;

impl BlockSplitter {
    pub fn new() -> Self {
        Self
    }

    /// Segment `text`; positions run from 0 in document order
    pub fn split(&self, text: &str) -> Vec<BlockEvent> {
        let options = Options::ENABLE_TABLES
            | Options::ENABLE_STRIKETHROUGH
            | Options::ENABLE_TASKLISTS
            | Options::ENABLE_MATH;

        let events: Vec<OffsetEvent<'_>> = Parser::new_ext(text, options)
            .into_offset_iter()
            .collect();

        let mut blocks = Vec::new();
        let mut idx = 0;

        while idx < events.len() {
            let (event, range) = &events[idx];
            match event {
                Event::Start(Tag::Paragraph) => {
                    let end = find_end(&events, idx);
                    if let Some(block) = paragraph_block(source(text, range)) {
                        blocks.push(block);
                    }
                    idx = end + 1;
                }
                Event::Start(Tag::Heading { level, .. }) => {
                    let end = find_end(&events, idx);
                    let content = collect_inline(inner(&events, idx, end));
                    blocks.push(MarkdownBlock::Header {
                        level: *level as u8,
                        content,
                    });
                    idx = end + 1;
                }
                Event::Start(Tag::CodeBlock(kind)) => {
                    let end = find_end(&events, idx);
                    let language = match kind {
                        CodeBlockKind::Fenced(info) => info
                            .split_whitespace()
                            .next()
                            .filter(|lang| !lang.is_empty())
                            .map(str::to_string),
                        CodeBlockKind::Indented => None,
                    };
                    let content = collect_code(inner(&events, idx, end));
                    blocks.push(MarkdownBlock::Code { content, language });
                    idx = end + 1;
                }
                Event::Start(Tag::List(_)) => {
                    let end = find_end(&events, idx);
                    blocks.extend(list_items(text, inner(&events, idx, end)));
                    idx = end + 1;
                }
                Event::Start(_) => {
                    // Tables, quotes, html: keep the source as one text segment
                    let end = find_end(&events, idx);
                    push_text(&mut blocks, source(text, range));
                    idx = end + 1;
                }
                Event::Rule | Event::Html(_) | Event::Text(_) | Event::DisplayMath(_) => {
                    push_text(&mut blocks, source(text, range));
                    idx += 1;
                }
                _ => {
                    idx += 1;
                }
            }
        }

        blocks
            .into_iter()
            .enumerate()
            .map(|(position, block)| BlockEvent::new(position, block))
            .collect()
    }
}

fn source<'a>(text: &'a str, range: &Range<usize>) -> &'a str {
    text.get(range.clone()).unwrap_or_default()
}

fn push_text(blocks: &mut Vec<MarkdownBlock>, src: &str) {
    let content = src.trim();
    if !content.is_empty() {
        blocks.push(MarkdownBlock::Text {
            content: content.to_string(),
        });
    }
}

/// Index of the `End` matching the `Start` at `start`
fn find_end(events: &[OffsetEvent<'_>], start: usize) -> usize {
    let mut depth = 0usize;
    for (idx, (event, _)) in events.iter().enumerate().skip(start) {
        match event {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return idx;
                }
            }
            _ => {}
        }
    }
    events.len().saturating_sub(1)
}

/// Events strictly between a `Start` and its `End`
fn inner<'e, 'a>(events: &'e [OffsetEvent<'a>], start: usize, end: usize) -> &'e [OffsetEvent<'a>] {
    events.get(start + 1..end).unwrap_or(&[])
}

/// Paragraph source, promoted to display math when fully delimited
fn paragraph_block(src: &str) -> Option<MarkdownBlock> {
    let content = src.trim();
    if content.is_empty() {
        return None;
    }

    let display = [("$$", "$$"), ("\\[", "\\]")]
        .iter()
        .find_map(|(open, close)| {
            let inner = content.strip_prefix(*open)?.strip_suffix(*close)?;
            (!inner.trim().is_empty()).then(|| inner.trim().to_string())
        });

    Some(match display {
        Some(latex) => MarkdownBlock::Math {
            latex,
            is_display: true,
        },
        None => MarkdownBlock::Text {
            content: content.to_string(),
        },
    })
}

/// Flatten inline events back into lightly-marked text
fn collect_inline(events: &[OffsetEvent<'_>]) -> String {
    let mut out = String::new();
    for (event, _) in events {
        match event {
            Event::Text(text) => out.push_str(text),
            Event::Code(code) => {
                out.push('`');
                out.push_str(code);
                out.push('`');
            }
            Event::InlineMath(math) => {
                out.push('$');
                out.push_str(math);
                out.push('$');
            }
            Event::Start(Tag::Strong) | Event::End(TagEnd::Strong) => out.push_str("**"),
            Event::Start(Tag::Emphasis) | Event::End(TagEnd::Emphasis) => out.push('*'),
            Event::Start(Tag::Strikethrough) | Event::End(TagEnd::Strikethrough) => {
                out.push_str("~~")
            }
            Event::SoftBreak | Event::HardBreak => out.push(' '),
            _ => {}
        }
    }
    out.trim().to_string()
}

fn collect_code(events: &[OffsetEvent<'_>]) -> String {
    let mut code = String::new();
    for (event, _) in events {
        if let Event::Text(text) = event {
            code.push_str(text);
        }
    }
    code
}

/// One segment per top-level item; nested lists stay inside their item
fn list_items(text: &str, events: &[OffsetEvent<'_>]) -> Vec<MarkdownBlock> {
    let mut items = Vec::new();
    let mut idx = 0;

    while idx < events.len() {
        match &events[idx] {
            (Event::Start(Tag::Item), range) => {
                let end = find_end(events, idx);
                let src = source(text, range);
                let content = LIST_MARKER.replace(src, "").trim_end().to_string();
                items.push(MarkdownBlock::ListItem { content });
                idx = end + 1;
            }
            _ => {
                idx += 1;
            }
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(text: &str) -> Vec<MarkdownBlock> {
        BlockSplitter::new()
            .split(text)
            .into_iter()
            .map(|e| e.block)
            .collect()
    }

    #[test]
    fn test_mixed_document() {
        let blocks =
            split("# Title\n\nSome *text*.\n\n- one\n- two\n\n```rust\nfn main() {}\n```\n");
        assert_eq!(blocks.len(), 5);
        assert_eq!(
            blocks[0],
            MarkdownBlock::Header {
                level: 1,
                content: "Title".to_string()
            }
        );
        assert_eq!(
            blocks[1],
            MarkdownBlock::Text {
                content: "Some *text*.".to_string()
            }
        );
        assert_eq!(
            blocks[2],
            MarkdownBlock::ListItem {
                content: "one".to_string()
            }
        );
        assert_eq!(
            blocks[3],
            MarkdownBlock::ListItem {
                content: "two".to_string()
            }
        );
        assert_eq!(
            blocks[4],
            MarkdownBlock::Code {
                content: "fn main() {}\n".to_string(),
                language: Some("rust".to_string())
            }
        );
    }

    #[test]
    fn test_positions_are_ordinal() {
        let events = BlockSplitter::new().split("a\n\nb\n\nc");
        let positions: Vec<usize> = events.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[test]
    fn test_unclosed_fence_is_one_code_block() {
        let blocks = split("```py\nprint(1)");
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            MarkdownBlock::Code { content, language } => {
                assert!(content.contains("print(1)"));
                assert_eq!(language.as_deref(), Some("py"));
            }
            other => panic!("Expected Code, got {:?}", other),
        }
    }

    #[test]
    fn test_display_math_paragraphs() {
        let blocks = split("$$\nE = mc^2\n$$\n\n\\[ a^2 + b^2 \\]");
        assert_eq!(blocks.len(), 2);
        assert_eq!(
            blocks[0],
            MarkdownBlock::Math {
                latex: "E = mc^2".to_string(),
                is_display: true
            }
        );
        assert!(matches!(
            &blocks[1],
            MarkdownBlock::Math { latex, is_display: true } if latex == "a^2 + b^2"
        ));
    }

    #[test]
    fn test_latex_density() {
        assert!(latex_density("\\frac{a}{b} + \\sqrt{c}") > 0.04);
        assert_eq!(latex_density("println!(\"\\n\");"), 0.0);
        assert_eq!(latex_density(""), 0.0);
    }

    #[test]
    fn test_ordered_list_marker_stripped() {
        let blocks = split("1. first\n2. second");
        assert_eq!(
            blocks,
            vec![
                MarkdownBlock::ListItem {
                    content: "first".to_string()
                },
                MarkdownBlock::ListItem {
                    content: "second".to_string()
                },
            ]
        );
    }
}
