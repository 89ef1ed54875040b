//! Separator-priority text chunker.
//!
//! Splits normalized document text into bounded, overlapping chunks. The
//! splitter tries separators from coarse to fine (`"\n\n"`, `"\n"`, `" "`,
//! then raw character windows): pieces produced by one separator that still
//! exceed the chunk size are re-split with the next one, and adjacent chunks
//! keep `overlap` characters of shared context across the boundary.
//!
//! Identical input always yields identical chunks. Each chunk carries a
//! SHA-256 fingerprint of its text, the dedup and fusion identity.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::models::Chunk;

/// Separators in priority order; an empty pattern means character windows.
const SEPARATORS: [&str; 3] = ["\n\n", "\n", " "];

/// SHA-256 hex digest of chunk text.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split `text` into ordered chunk strings of at most `chunk_size` characters
/// with `overlap` characters shared between neighbors.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if char_len(text) <= chunk_size {
        return vec![text.to_string()];
    }
    split_with(text, chunk_size, overlap, &SEPARATORS)
}

/// Chunk one source's text, assigning dense 0-based sequence indices and
/// fingerprints.
pub fn chunk_document(source_id: &str, text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    split_text(text, chunk_size, overlap)
        .into_iter()
        .enumerate()
        .map(|(seq, text)| {
            let fingerprint = fingerprint(&text);
            Chunk {
                id: Uuid::new_v4().to_string(),
                source_id: source_id.to_string(),
                seq: seq as i64,
                text,
                fingerprint,
            }
        })
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn split_with(text: &str, chunk_size: usize, overlap: usize, seps: &[&str]) -> Vec<String> {
    let (sep, rest) = match seps.split_first() {
        Some(pair) => pair,
        None => return char_windows(text, chunk_size, overlap),
    };
    if !text.contains(sep) {
        return split_with(text, chunk_size, overlap, rest);
    }

    let mut chunks = Vec::new();
    let mut good: Vec<String> = Vec::new();
    for piece in text.split(sep) {
        if piece.is_empty() {
            continue;
        }
        if char_len(piece) <= chunk_size {
            good.push(piece.to_string());
        } else {
            // Flush what fits before descending to the finer separator.
            if !good.is_empty() {
                chunks.extend(merge_pieces(&good, sep, chunk_size, overlap));
                good.clear();
            }
            chunks.extend(split_with(piece, chunk_size, overlap, rest));
        }
    }
    if !good.is_empty() {
        chunks.extend(merge_pieces(&good, sep, chunk_size, overlap));
    }
    chunks
}

/// Greedily pack pieces into windows of at most `chunk_size` characters,
/// retaining a tail of up to `overlap` characters when a window closes.
fn merge_pieces(pieces: &[String], sep: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let sep_len = char_len(sep);
    let mut out = Vec::new();
    let mut window: VecDeque<&String> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let len = char_len(piece);
        let joined = total + len + if window.is_empty() { 0 } else { sep_len };
        if joined > chunk_size && !window.is_empty() {
            push_joined(&mut out, &window, sep);
            // Drop from the front until the retained tail fits the overlap
            // budget and leaves room for the incoming piece.
            while total > overlap
                || (total + len + if window.is_empty() { 0 } else { sep_len } > chunk_size
                    && total > 0)
            {
                let Some(first) = window.pop_front() else { break };
                total -= char_len(first) + if window.is_empty() { 0 } else { sep_len };
            }
        }
        total += len + if window.is_empty() { 0 } else { sep_len };
        window.push_back(piece);
    }
    if !window.is_empty() {
        push_joined(&mut out, &window, sep);
    }
    out
}

fn push_joined(out: &mut Vec<String>, window: &VecDeque<&String>, sep: &str) {
    let joined = window
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(sep);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

/// Last-resort split: fixed-size character windows advancing by
/// `chunk_size - overlap` so neighbors share `overlap` characters.
fn char_windows(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let step = chunk_size.saturating_sub(overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_single_chunk() {
        let chunks = split_text("Hello, world!", 8000, 800);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn empty_text_no_chunks() {
        assert!(split_text("", 8000, 800).is_empty());
    }

    #[test]
    fn splits_on_paragraphs_first() {
        let text = "alpha alpha alpha\n\nbeta beta beta\n\ngamma gamma gamma";
        let chunks = split_text(text, 20, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], "alpha alpha alpha");
        assert_eq!(chunks[2], "gamma gamma gamma");
    }

    #[test]
    fn respects_chunk_size() {
        let text = "word ".repeat(500);
        for chunk in split_text(&text, 64, 16) {
            assert!(chunk.chars().count() <= 64, "oversized chunk: {}", chunk.len());
        }
    }

    #[test]
    fn neighbors_overlap() {
        let text = "one two three four five six seven eight nine ten";
        let chunks = split_text(text, 20, 10);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let tail_word = pair[0].split_whitespace().last().unwrap();
            assert!(
                pair[1].contains(tail_word),
                "no overlap between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn long_unbroken_run_falls_back_to_char_windows() {
        let text = "x".repeat(100);
        let chunks = split_text(&text, 30, 5);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 30);
        }
        let rejoined_len: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(rejoined_len >= 100);
    }

    #[test]
    fn deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma gamma gamma gamma\n\nDelta";
        let a = split_text(text, 16, 4);
        let b = split_text(text, 16, 4);
        assert_eq!(a, b);
    }

    #[test]
    fn document_indices_dense_and_fingerprinted() {
        let text = "para one here\n\npara two here\n\npara three here";
        let chunks = chunk_document("doc.txt", text, 15, 0);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq, i as i64);
            assert_eq!(chunk.source_id, "doc.txt");
            assert_eq!(chunk.fingerprint, fingerprint(&chunk.text));
        }
    }

    #[test]
    fn multibyte_text_counts_chars_not_bytes() {
        let text = "việt nam ".repeat(40);
        for chunk in split_text(&text, 50, 10) {
            assert!(chunk.chars().count() <= 50);
        }
    }
}
