//! Content-fingerprint deduplication.
//!
//! Runs after chunking and before persistence, on freshly extracted chunks,
//! on manually injected chunks, and across the merge of both. Within a batch
//! the first occurrence of a fingerprint wins; later duplicates are dropped.

use std::collections::HashSet;

use crate::models::Chunk;

/// Keep the first chunk per fingerprint, preserving order. Returns the
/// surviving chunks and the number dropped.
pub fn dedupe(chunks: Vec<Chunk>) -> (Vec<Chunk>, usize) {
    let mut seen: HashSet<String> = HashSet::with_capacity(chunks.len());
    let before = chunks.len();
    let unique: Vec<Chunk> = chunks
        .into_iter()
        .filter(|chunk| seen.insert(chunk.fingerprint.clone()))
        .collect();
    let dropped = before - unique.len();
    (unique, dropped)
}

/// Drop chunks whose fingerprint is already persisted in the index, keeping
/// the store's fingerprint-uniqueness invariant across sync passes.
pub fn drop_persisted(chunks: Vec<Chunk>, persisted: &HashSet<String>) -> (Vec<Chunk>, usize) {
    let before = chunks.len();
    let fresh: Vec<Chunk> = chunks
        .into_iter()
        .filter(|chunk| !persisted.contains(&chunk.fingerprint))
        .collect();
    let dropped = before - fresh.len();
    (fresh, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::fingerprint;

    fn make_chunk(source_id: &str, seq: i64, text: &str) -> Chunk {
        Chunk {
            id: format!("{}-{}", source_id, seq),
            source_id: source_id.to_string(),
            seq,
            text: text.to_string(),
            fingerprint: fingerprint(text),
        }
    }

    #[test]
    fn first_occurrence_wins() {
        let chunks = vec![
            make_chunk("a.txt", 0, "shared text"),
            make_chunk("a.txt", 1, "unique text"),
            make_chunk("b.txt", 0, "shared text"),
        ];
        let (unique, dropped) = dedupe(chunks);
        assert_eq!(dropped, 1);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].source_id, "a.txt");
        assert_eq!(unique[1].text, "unique text");
    }

    #[test]
    fn already_persisted_fingerprints_are_dropped() {
        let persisted: HashSet<String> = [fingerprint("old news")].into_iter().collect();
        let chunks = vec![make_chunk("a.txt", 0, "old news"), make_chunk("a.txt", 1, "fresh")];
        let (fresh, dropped) = drop_persisted(chunks, &persisted);
        assert_eq!(dropped, 1);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].text, "fresh");
    }

    #[test]
    fn empty_batch_is_fine() {
        let (unique, dropped) = dedupe(Vec::new());
        assert!(unique.is_empty());
        assert_eq!(dropped, 0);
    }
}
