//! Format correction for truncated streaming text
//!
//! Purely syntactic repairs. Complete code fences and balanced math spans
//! are never touched, and `correct_format` is idempotent.

use once_cell::sync::Lazy;
use regex::Regex;

/// Balanced math spans: `$$…$$`, `\[…\]`, `\(…\)`
static MATH_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\$\$.+?\$\$|\\\[.+?\\\]|\\\(.+?\\\)").unwrap());

/// Anything that looks like LaTeX
static MATH_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\$\$|\\\[|\\\(|\\(?:frac|sqrt|sum|int|prod|lim|alpha|beta|gamma|delta|theta|lambda|mu|pi|sigma|omega|begin|end|cdot|times|infty|partial|nabla|mathbb|mathrm|left|right)\b|\$[^\s$][^$\n]*?[\\^_{}][^$\n]*?\$",
    )
    .unwrap()
});

/// `\}` left dangling in front of `\]` by a cut-off chunk
static ORPHAN_BRACE_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\\\}[ \t]*)+\\\]").unwrap());

static HEADER_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ {0,3}#{1,6}(?:[ \t]|$)").unwrap());

static LIST_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[ \t]*(?:[-*+]|\d{1,9}[.)])[ \t]+\S").unwrap());

const MASK_OPEN: char = '\u{E000}';
const MASK_CLOSE: char = '\u{E001}';

/// One output line and whether it sits inside a code fence
#[derive(Debug, Clone)]
struct Line {
    text: String,
    protected: bool,
}

impl Line {
    fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            protected: false,
        }
    }

    fn protected(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            protected: true,
        }
    }

    fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    fn is_header(&self) -> bool {
        !self.protected && HEADER_LINE.is_match(&self.text)
    }

    fn is_list_item(&self) -> bool {
        !self.protected && LIST_LINE.is_match(&self.text)
    }
}

/// Opening fence marker of a line, e.g. "```" or "~~~~"
fn fence_marker(line: &str) -> Option<&str> {
    let indent = line.len() - line.trim_start_matches(' ').len();
    if indent > 3 {
        return None;
    }
    let rest = &line[indent..];
    let ch = rest.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let run = rest.len() - rest.trim_start_matches(ch).len();
    if run < 3 {
        return None;
    }
    // Backtick fences cannot carry backticks in the info string
    if ch == '`' && rest[run..].contains('`') {
        return None;
    }
    Some(&rest[..run])
}

/// Whether `line` closes a fence opened with `marker`
fn closes_fence(line: &str, marker: &str) -> bool {
    let trimmed = line.trim();
    let Some(ch) = marker.chars().next() else {
        return false;
    };
    let run = trimmed.len() - trimmed.trim_start_matches(ch).len();
    run >= marker.len() && trimmed[run..].trim().is_empty()
}

/// Push buffered plain lines with their math spans masked
fn flush_plain(plain: &mut Vec<&str>, lines: &mut Vec<Line>, masks: &mut Vec<String>) {
    if plain.is_empty() {
        return;
    }
    let joined = plain.join("\n");
    plain.clear();
    let masked = MATH_SPAN.replace_all(&joined, |caps: &regex::Captures| {
        masks.push(caps[0].to_string());
        format!("{}{}{}", MASK_OPEN, masks.len() - 1, MASK_CLOSE)
    });
    lines.extend(masked.split('\n').map(Line::plain));
}

/// Split text into lines, masking math spans in plain regions.
/// Returns the lines, the masked spans and the marker of an unclosed fence.
fn split_regions(text: &str) -> (Vec<Line>, Vec<String>, Option<String>) {
    let mut lines = Vec::new();
    let mut masks = Vec::new();
    let mut plain = Vec::new();
    let mut open_fence: Option<String> = None;

    for raw in text.lines() {
        match open_fence.as_deref() {
            Some(marker) => {
                let closing = closes_fence(raw, marker);
                lines.push(Line::protected(raw));
                if closing {
                    open_fence = None;
                }
            }
            None => {
                if let Some(marker) = fence_marker(raw) {
                    flush_plain(&mut plain, &mut lines, &mut masks);
                    open_fence = Some(marker.to_string());
                    lines.push(Line::protected(raw));
                } else {
                    plain.push(raw);
                }
            }
        }
    }
    flush_plain(&mut plain, &mut lines, &mut masks);

    (lines, masks, open_fence)
}

fn unmask(text: &str, masks: &[String]) -> String {
    if masks.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(MASK_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + MASK_OPEN.len_utf8()..];
        let Some(end) = after.find(MASK_CLOSE) else {
            out.push_str(&rest[start..]);
            return out;
        };
        let token_end = start + MASK_OPEN.len_utf8() + end + MASK_CLOSE.len_utf8();
        match after[..end].parse::<usize>().ok().and_then(|i| masks.get(i)) {
            Some(original) => out.push_str(original),
            None => out.push_str(&rest[start..token_end]),
        }
        rest = &rest[token_end..];
    }
    out.push_str(rest);
    out
}

fn join_lines(lines: &[Line], masks: &[String], trailing_newline: bool) -> String {
    let mut joined = lines
        .iter()
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if trailing_newline && !joined.is_empty() {
        joined.push('\n');
    }
    unmask(&joined, masks)
}

/// Drop runs of blank plain lines down to one empty line
fn collapse_blank_runs(lines: Vec<Line>) -> Vec<Line> {
    let mut out: Vec<Line> = Vec::with_capacity(lines.len());
    for line in lines {
        if !line.protected && line.is_blank() {
            if let Some(prev) = out.last_mut().filter(|p| !p.protected && p.is_blank()) {
                prev.text.clear();
                continue;
            }
        }
        out.push(line);
    }
    out
}

/// Remove orphan `\}`/`\]` fragments from plain lines. Repeats until
/// nothing matches, since a removal can join two halves of a new one.
fn strip_orphan_fragments(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let (lines, masks, _) = split_regions(&current);
        let mut changed = false;
        let lines: Vec<Line> = lines
            .into_iter()
            .map(|mut line| {
                if !line.protected && ORPHAN_BRACE_CLOSE.is_match(&line.text) {
                    line.text = ORPHAN_BRACE_CLOSE.replace_all(&line.text, "").into_owned();
                    changed = true;
                }
                line
            })
            .collect();
        if !changed {
            return current;
        }
        current = join_lines(&lines, &masks, current.ends_with('\n'));
    }
}

/// Repair common streaming-truncation artifacts
pub fn correct_format(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    // Fences are detected after stripping, a removal can expose one
    let text = strip_orphan_fragments(text);
    let trailing_newline = text.ends_with('\n');
    let (lines, masks, open_fence) = split_regions(&text);

    let mut spaced: Vec<Line> = Vec::with_capacity(lines.len() + 8);
    let count = lines.len();
    for (idx, line) in lines.into_iter().enumerate() {
        let prev = spaced.last();
        let needs_gap = match prev {
            Some(prev) if !prev.is_blank() => {
                line.is_header()
                    || (line.is_list_item()
                        && !prev.is_list_item()
                        && !prev.text.starts_with([' ', '\t']))
            }
            _ => false,
        };
        if needs_gap {
            spaced.push(Line::plain(""));
        }
        let header = line.is_header();
        spaced.push(line);
        if header && idx + 1 < count {
            spaced.push(Line::plain(""));
        }
    }

    let mut lines = collapse_blank_runs(spaced);
    if let Some(marker) = open_fence {
        lines.push(Line::protected(marker));
    }

    join_lines(&lines, &masks, trailing_newline)
}

/// Whether the text carries LaTeX-looking content
pub fn contains_math_content(text: &str) -> bool {
    MATH_HINT.is_match(text)
}

/// Trim trailing spaces and collapse blank runs outside code fences
pub fn clean_excessive_whitespace(text: &str) -> String {
    let (lines, masks, _) = split_regions(text);
    let trimmed: Vec<Line> = lines
        .into_iter()
        .map(|mut line| {
            if !line.protected {
                line.text = line.text.trim_end().to_string();
            }
            line
        })
        .collect();
    let mut lines = collapse_blank_runs(trimmed);
    while lines
        .first()
        .is_some_and(|l| !l.protected && l.text.is_empty())
    {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| !l.protected && l.text.is_empty()) {
        lines.pop();
    }
    join_lines(&lines, &masks, false)
}
