//! Text chunking for ingestion.
//!
//! Fixed-size windows with trailing overlap. The cursor only ever moves
//! forward: the next chunk starts at `end - overlap` but never at or
//! behind the previous chunk's start, so pathological configurations
//! (overlap >= max size) cannot loop or underflow. Inputs smaller than
//! `min_chunk_size` become a single chunk untouched by overlap.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 2000,
            min_chunk_size: 50,
            overlap: 200,
        }
    }
}

/// One chunk with its character offset into the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub start: usize,
}

/// Split `text` into overlapping chunks. Offsets are in characters, so
/// multi-byte input cannot split inside a code point.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let max = config.max_chunk_size.max(1);
    if chars.len() <= config.min_chunk_size || chars.len() <= max {
        return vec![Chunk {
            text: text.to_string(),
            start: 0,
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        let end = (start + max).min(chars.len());
        chunks.push(Chunk {
            text: chars[start..end].iter().collect(),
            start,
        });
        if end == chars.len() {
            break;
        }
        // Overlap backtracks from `end` but stays strictly ahead of the
        // previous start.
        start = end.saturating_sub(config.overlap).max(start + 1);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize, min: usize, overlap: usize) -> ChunkerConfig {
        ChunkerConfig {
            max_chunk_size: max,
            min_chunk_size: min,
            overlap,
        }
    }

    #[test]
    fn small_input_single_chunk() {
        let text = "x".repeat(350);
        let chunks = chunk_text(&text, &config(2000, 50, 200));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn empty_input_no_chunks() {
        assert!(chunk_text("", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn input_below_min_never_overlaps() {
        let text = "tiny";
        let chunks = chunk_text(text, &config(2, 50, 200));
        // Below min_chunk_size: one chunk even though max is smaller.
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "tiny");
    }

    #[test]
    fn starts_strictly_increase() {
        let text = "a".repeat(5000);
        let chunks = chunk_text(&text, &config(2000, 50, 200));
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(pair[1].start > pair[0].start);
            assert!(pair[1].start <= text.len());
        }
    }

    #[test]
    fn overlap_repeats_tail_of_previous_chunk() {
        let text: String = (0..600).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = chunk_text(&text, &config(500, 50, 100));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].start, 400);
        // The second chunk re-covers the last 100 chars of the first.
        assert_eq!(&chunks[0].text[400..], &chunks[1].text[..100]);
    }

    #[test]
    fn overlap_larger_than_max_still_terminates() {
        let text = "b".repeat(1000);
        // Degenerate configuration: overlap >= max.
        let chunks = chunk_text(&text, &config(100, 10, 150));
        assert!(!chunks.is_empty());
        for pair in chunks.windows(2) {
            assert!(pair[1].start > pair[0].start);
        }
        // Full coverage.
        let last = chunks.last().unwrap();
        assert_eq!(last.start + last.text.chars().count(), 1000);
    }

    #[test]
    fn multibyte_input_does_not_panic() {
        let text = "héllo wörld ✓ ".repeat(300);
        let chunks = chunk_text(&text, &ChunkerConfig::default());
        assert!(!chunks.is_empty());
        let total: String = chunks.first().unwrap().text.clone();
        assert!(total.starts_with("héllo"));
    }
}
