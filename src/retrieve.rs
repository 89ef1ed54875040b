//! Hybrid retrieval by weighted rank fusion.
//!
//! For a query, the vector store and the lexical index each produce a ranked
//! top-N list. Each list position `i` (0-indexed, list of size N) scores
//! `1 - i/N`; the lists are unioned on (source id, fingerprint) identity with
//! a missing side scoring 0, combined as `w_sem * semantic + w_lex * lexical`,
//! and the best k survive. Ties break by original semantic rank, then lexical
//! rank, so output order is deterministic.
//!
//! Lexical unavailability (empty corpus, FTS failure) degrades to
//! semantic-only ranking; retrieval never fails because of it.

use anyhow::Result;
use std::collections::HashMap;
use tracing::warn;

use crate::embedding::{embed_query, Embedder};
use crate::store::{ChunkRow, VectorStore};

/// Fusion weights. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub semantic: f64,
    pub lexical: f64,
}

impl Weights {
    pub fn new(semantic: f64, lexical: f64) -> Self {
        debug_assert!((semantic + lexical - 1.0).abs() < 1e-9);
        Weights { semantic, lexical }
    }
}

/// One fused retrieval result.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub source_id: String,
    pub fingerprint: String,
    pub text: String,
    pub semantic_score: f64,
    pub lexical_score: f64,
    pub combined_score: f64,
    /// 1-based position after fusion.
    pub rank: usize,
}

/// Retrieve the top `k` chunks for `query`.
pub async fn retrieve(
    store: &VectorStore,
    embedder: &dyn Embedder,
    query: &str,
    weights: Weights,
    candidate_n: usize,
    k: usize,
) -> Result<Vec<RetrievalResult>> {
    let query_vec = embed_query(embedder, query).await?;
    let semantic = store.semantic_query(&query_vec, candidate_n).await?;

    let lexical = match store.lexical_query(query, candidate_n).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "lexical index unavailable, semantic-only ranking");
            Vec::new()
        }
    };

    Ok(fuse(&semantic, &lexical, weights, k))
}

struct FusionEntry<'a> {
    row: &'a ChunkRow,
    semantic_rank: Option<usize>,
    lexical_rank: Option<usize>,
}

/// Fuse two ranked lists into the top `k`.
pub fn fuse(
    semantic: &[ChunkRow],
    lexical: &[ChunkRow],
    weights: Weights,
    k: usize,
) -> Vec<RetrievalResult> {
    let mut entries: HashMap<(String, String), FusionEntry<'_>> = HashMap::new();

    for (i, row) in semantic.iter().enumerate() {
        entries
            .entry((row.source_id.clone(), row.fingerprint.clone()))
            .or_insert(FusionEntry { row, semantic_rank: None, lexical_rank: None })
            .semantic_rank = Some(i);
    }
    for (i, row) in lexical.iter().enumerate() {
        let entry = entries
            .entry((row.source_id.clone(), row.fingerprint.clone()))
            .or_insert(FusionEntry { row, semantic_rank: None, lexical_rank: None });
        if entry.lexical_rank.is_none() {
            entry.lexical_rank = Some(i);
        }
    }

    let mut fused: Vec<(RetrievalResult, Option<usize>, Option<usize>)> = entries
        .into_values()
        .map(|entry| {
            let semantic_score = rank_score(entry.semantic_rank, semantic.len());
            let lexical_score = rank_score(entry.lexical_rank, lexical.len());
            let combined_score =
                weights.semantic * semantic_score + weights.lexical * lexical_score;
            let result = RetrievalResult {
                source_id: entry.row.source_id.clone(),
                fingerprint: entry.row.fingerprint.clone(),
                text: entry.row.text.clone(),
                semantic_score,
                lexical_score,
                combined_score,
                rank: 0,
            };
            (result, entry.semantic_rank, entry.lexical_rank)
        })
        .collect();

    fused.sort_by(|a, b| {
        b.0.combined_score
            .partial_cmp(&a.0.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| rank_key(a.1).cmp(&rank_key(b.1)))
            .then_with(|| rank_key(a.2).cmp(&rank_key(b.2)))
    });
    fused.truncate(k);

    fused
        .into_iter()
        .enumerate()
        .map(|(i, (mut result, _, _))| {
            result.rank = i + 1;
            result
        })
        .collect()
}

/// Position `i` in a list of size `n` scores `1 - i/n`; absent scores 0.
fn rank_score(rank: Option<usize>, n: usize) -> f64 {
    match rank {
        Some(i) if n > 0 => 1.0 - (i as f64 / n as f64),
        _ => 0.0,
    }
}

fn rank_key(rank: Option<usize>) -> usize {
    rank.unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::fingerprint;

    fn make_row(source_id: &str, text: &str) -> ChunkRow {
        ChunkRow {
            chunk_id: format!("{}:{}", source_id, text),
            source_id: source_id.to_string(),
            seq: 0,
            text: text.to_string(),
            fingerprint: fingerprint(text),
        }
    }

    #[test]
    fn positional_scores_follow_one_minus_i_over_n() {
        let semantic = vec![make_row("a", "first"), make_row("a", "second")];
        let results = fuse(&semantic, &[], Weights::new(1.0, 0.0), 10);
        assert!((results[0].semantic_score - 1.0).abs() < 1e-9);
        assert!((results[1].semantic_score - 0.5).abs() < 1e-9);
        // The tail of an N-length list scores 1 - (N-1)/N, never negative.
        assert!(results[1].semantic_score > 0.0);
    }

    #[test]
    fn chunk_in_both_lists_outscores_single_list_twin() {
        // "both" appears in both lists at the same position as "solo" does in
        // the semantic list alone.
        let semantic = vec![make_row("a", "both"), make_row("b", "solo")];
        let lexical = vec![make_row("a", "both")];
        let results = fuse(&semantic, &lexical, Weights::new(0.6, 0.4), 10);
        let both = results.iter().find(|r| r.text == "both").unwrap();
        let solo = results.iter().find(|r| r.text == "solo").unwrap();
        assert!(both.combined_score > solo.combined_score);
        assert_eq!(both.rank, 1);
    }

    #[test]
    fn missing_side_scores_zero() {
        let lexical = vec![make_row("a", "lexical only")];
        let results = fuse(&[], &lexical, Weights::new(0.7, 0.3), 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].semantic_score, 0.0);
        assert!((results[0].combined_score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn ties_break_by_semantic_then_lexical_rank() {
        // Two chunks with identical combined scores: semantic-ranked one wins.
        let semantic = vec![make_row("a", "sem")];
        let lexical = vec![make_row("b", "lex")];
        let results = fuse(&semantic, &lexical, Weights::new(0.5, 0.5), 10);
        assert_eq!(results[0].text, "sem");
        assert_eq!(results[1].text, "lex");
        assert!((results[0].combined_score - results[1].combined_score).abs() < 1e-9);
    }

    #[test]
    fn truncates_to_k_with_dense_ranks() {
        let semantic: Vec<ChunkRow> =
            (0..8).map(|i| make_row("a", &format!("chunk {}", i))).collect();
        let results = fuse(&semantic, &[], Weights::new(0.8, 0.2), 3);
        assert_eq!(results.len(), 3);
        assert_eq!(
            results.iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn identity_is_source_and_fingerprint() {
        // Same text from two different sources stays two results.
        let semantic = vec![make_row("a", "shared"), make_row("b", "shared")];
        let results = fuse(&semantic, &[], Weights::new(1.0, 0.0), 10);
        assert_eq!(results.len(), 2);
    }
}
