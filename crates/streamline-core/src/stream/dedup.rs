//! Content deduplication
//!
//! Backends occasionally re-emit a payload they already sent, sometimes with
//! cosmetic differences in case or spacing. The deduplicator keeps a small
//! FIFO of recently accepted contents and judges new content against it.

use std::collections::VecDeque;

use tracing::debug;

use crate::config::DedupConfig;

/// Content longer than this (in chars) is deliberately skipped by the
/// edit-distance check when no config is supplied
const DEFAULT_MAX_EDIT_DISTANCE_LEN: usize = 2048;

/// Similarity judge over a bounded window of recent contents
#[derive(Debug)]
pub struct ContentDeduplicator {
    /// Normalized recent contents, oldest first
    history: VecDeque<String>,
    window_size: usize,
    threshold: f64,
    max_edit_distance_len: usize,
}

impl Default for ContentDeduplicator {
    fn default() -> Self {
        Self::new(&DedupConfig::default())
    }
}

impl ContentDeduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.window_size),
            window_size: config.window_size.max(1),
            threshold: config.similarity_threshold,
            max_edit_distance_len: if config.max_edit_distance_len == 0 {
                DEFAULT_MAX_EDIT_DISTANCE_LEN
            } else {
                config.max_edit_distance_len
            },
        }
    }

    /// Returns true when `content` repeats something in the window.
    /// Non-duplicates are remembered.
    pub fn is_duplicate(&mut self, content: &str) -> bool {
        let normalized = normalize(content);
        if normalized.is_empty() {
            return false;
        }

        let duplicate = self
            .history
            .iter()
            .any(|seen| self.is_similar(seen, &normalized));

        if duplicate {
            debug!("Duplicate content suppressed ({} chars)", content.len());
        } else {
            self.push(normalized);
        }
        duplicate
    }

    /// Remember `content` without judging it
    pub fn record(&mut self, content: &str) {
        let normalized = normalize(content);
        if normalized.is_empty() || self.history.back() == Some(&normalized) {
            return;
        }
        self.push(normalized);
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    fn push(&mut self, normalized: String) {
        if let Some(pos) = self.history.iter().position(|seen| *seen == normalized) {
            self.history.remove(pos);
        }
        self.history.push_back(normalized);
        while self.history.len() > self.window_size {
            self.history.pop_front();
        }
    }

    fn is_similar(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }

        let len_a = a.chars().count();
        let len_b = b.chars().count();
        let (shorter, longer, short_len, long_len) = if len_a <= len_b {
            (a, b, len_a, len_b)
        } else {
            (b, a, len_b, len_a)
        };

        // Cost control: wildly different lengths are never similar
        if short_len == 0 || long_len > short_len * 2 {
            return false;
        }

        let length_ratio = short_len as f64 / long_len as f64;
        if longer.contains(shorter) && length_ratio > self.threshold {
            return true;
        }

        if long_len > self.max_edit_distance_len {
            return false;
        }

        let distance = levenshtein(a, b);
        let similarity = 1.0 - distance as f64 / long_len as f64;
        similarity > self.threshold
    }
}

/// Trim, collapse whitespace runs, lowercase
fn normalize(content: &str) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Two-row Levenshtein distance over chars
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_and_whitespace_variants() {
        let mut dedup = ContentDeduplicator::default();
        assert!(!dedup.is_duplicate("Hello world"));
        assert!(dedup.is_duplicate("hello   world"));
        assert!(!dedup.is_duplicate("A completely different sentence"));
    }

    #[test]
    fn test_empty_input_is_never_duplicate() {
        let mut dedup = ContentDeduplicator::default();
        assert!(!dedup.is_duplicate(""));
        assert!(!dedup.is_duplicate("   \n\t"));
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_near_identical_by_edit_distance() {
        let mut dedup = ContentDeduplicator::default();
        assert!(!dedup.is_duplicate("The quick brown fox jumps over the lazy dog"));
        // One character changed out of 43
        assert!(dedup.is_duplicate("The quick brown fox jumps over the lazy cog"));
    }

    #[test]
    fn test_substring_needs_high_ratio() {
        let mut dedup = ContentDeduplicator::default();
        assert!(!dedup.is_duplicate("Streaming answers arrive in cumulative chunks"));
        // Short prefix: ratio well under the threshold
        assert!(!dedup.is_duplicate("Streaming answers"));
        // Nearly the whole sentence
        assert!(dedup.is_duplicate("Streaming answers arrive in cumulative chunk"));
    }

    #[test]
    fn test_length_ratio_short_circuit() {
        let mut dedup = ContentDeduplicator::default();
        assert!(!dedup.is_duplicate("abc"));
        assert!(!dedup.is_duplicate("abcabcabc"));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let config = DedupConfig {
            window_size: 2,
            ..DedupConfig::default()
        };
        let mut dedup = ContentDeduplicator::new(&config);
        assert!(!dedup.is_duplicate("first entry in the window"));
        assert!(!dedup.is_duplicate("second, unrelated content"));
        assert!(!dedup.is_duplicate("third one pushes out the first"));
        assert_eq!(dedup.len(), 2);
        // "first" was evicted, so it is accepted again
        assert!(!dedup.is_duplicate("first entry in the window"));
    }

    #[test]
    fn test_clear() {
        let mut dedup = ContentDeduplicator::default();
        dedup.record("Hello world");
        assert!(dedup.is_duplicate("HELLO WORLD"));
        dedup.clear();
        assert!(!dedup.is_duplicate("HELLO WORLD"));
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
