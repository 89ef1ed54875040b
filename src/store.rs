//! Persisted vector store and lexical index.
//!
//! The store directory is opaque to callers: a SQLite database (WAL mode)
//! holding chunks, their embedding BLOBs, and an FTS5 table used as the
//! lexical index. Access goes through open / add / query / persist only.
//!
//! Semantic queries scan candidate vectors and rank by cosine similarity in
//! process. The FTS5 table is rebuilt from the chunks table every time an
//! index handle is opened, so the lexical side always reflects exactly the
//! persisted chunk set; if FTS5 fails, retrieval degrades to semantic-only
//! upstream.
//!
//! An open failure is a corrupt index: the synchronizer evicts the directory
//! and rebuilds from scratch.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::PipelineError;
use crate::models::Chunk;

const DB_FILE: &str = "index.sqlite";

/// One persisted chunk as returned by queries.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub source_id: String,
    pub seq: i64,
    pub text: String,
    pub fingerprint: String,
}

pub struct VectorStore {
    pool: SqlitePool,
    dir: PathBuf,
}

impl VectorStore {
    /// Open (or create) the store under `dir`. Any failure here means the
    /// store is unusable and should be evicted.
    pub async fn open(dir: &Path) -> Result<Self, PipelineError> {
        let open_inner = async {
            std::fs::create_dir_all(dir)?;
            let db_path = dir.join(DB_FILE);
            let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?;
            migrate(&pool).await?;
            Ok::<SqlitePool, anyhow::Error>(pool)
        };
        match open_inner.await {
            Ok(pool) => Ok(VectorStore { pool, dir: dir.to_path_buf() }),
            Err(e) => Err(PipelineError::CorruptIndex(format!("{}: {}", dir.display(), e))),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist embedded chunks in one transaction. The fingerprint column is
    /// UNIQUE; callers deduplicate first, the constraint backs the invariant.
    pub async fn add_chunks(&self, items: &[(Chunk, Vec<f32>)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (chunk, vector) in items {
            sqlx::query(
                "INSERT INTO chunks (id, source_id, seq, text, fingerprint) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.source_id)
            .bind(chunk.seq)
            .bind(&chunk.text)
            .bind(&chunk.fingerprint)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunk_vectors (chunk_id, embedding) VALUES (?, ?)")
                .bind(&chunk.id)
                .bind(vec_to_blob(vector))
                .execute(&mut *tx)
                .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, source_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.source_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Top-`n` chunks by cosine similarity to `query`.
    pub async fn semantic_query(&self, query: &[f32], n: usize) -> Result<Vec<ChunkRow>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.source_id, c.seq, c.text, c.fingerprint, v.embedding
            FROM chunk_vectors v
            JOIN chunks c ON c.id = v.chunk_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<(f32, ChunkRow)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query, &blob_to_vec(&blob));
                (similarity, row_to_chunk(row))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.chunk_id.cmp(&b.1.chunk_id))
        });
        scored.truncate(n);
        Ok(scored.into_iter().map(|(_, row)| row).collect())
    }

    /// Top-`n` chunks by FTS5 rank. Query terms are quoted and OR-joined so
    /// raw user punctuation cannot break the MATCH syntax.
    pub async fn lexical_query(&self, query: &str, n: usize) -> Result<Vec<ChunkRow>> {
        let match_expr = fts_match_expr(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT f.chunk_id, c.source_id, c.seq, c.text, c.fingerprint
            FROM chunks_fts f
            JOIN chunks c ON c.id = f.chunk_id
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_chunk).collect())
    }

    /// Rebuild the lexical index from the persisted chunk set.
    pub async fn rebuild_lexical(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts").execute(&mut *tx).await?;
        sqlx::query("INSERT INTO chunks_fts (chunk_id, source_id, text) SELECT id, source_id, text FROM chunks")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// All fingerprints ever persisted into this index.
    pub async fn fingerprints(&self) -> Result<HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar("SELECT fingerprint FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Drop one source's chunks, vectors, and lexical entries.
    pub async fn delete_source(&self, source_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN (SELECT id FROM chunks WHERE source_id = ?)",
        )
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn chunk_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM chunks").fetch_one(&self.pool).await?)
    }

    /// Flush the WAL to the main database file.
    pub async fn persist(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> ChunkRow {
    ChunkRow {
        chunk_id: row.get(0),
        source_id: row.get(1),
        seq: row.get(2),
        text: row.get(3),
        fingerprint: row.get(4),
    }
}

/// Quote terms and OR-join them: term overlap ranks like a bag-of-words
/// scorer and no user punctuation reaches the MATCH parser.
fn fts_match_expr(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{}\"", token))
        .collect::<Vec<_>>()
        .join(" OR ")
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            fingerprint TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;
    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                source_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source_id ON chunks(source_id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::fingerprint;
    use tempfile::TempDir;

    fn make_chunk(source_id: &str, seq: i64, text: &str) -> Chunk {
        Chunk {
            id: format!("{}#{}", source_id, seq),
            source_id: source_id.to_string(),
            seq,
            text: text.to_string(),
            fingerprint: fingerprint(text),
        }
    }

    #[tokio::test]
    async fn add_then_query_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&tmp.path().join("store")).await.unwrap();
        let items = vec![
            (make_chunk("a.txt", 0, "rust systems programming"), vec![1.0, 0.0]),
            (make_chunk("a.txt", 1, "python machine learning"), vec![0.0, 1.0]),
        ];
        store.add_chunks(&items).await.unwrap();

        let semantic = store.semantic_query(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(semantic.len(), 1);
        assert_eq!(semantic[0].text, "rust systems programming");

        let lexical = store.lexical_query("python", 10).await.unwrap();
        assert_eq!(lexical.len(), 1);
        assert_eq!(lexical[0].text, "python machine learning");

        assert_eq!(store.chunk_count().await.unwrap(), 2);
        store.persist().await.unwrap();
        store.close().await;
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&tmp.path().join("store")).await.unwrap();
        let first = vec![(make_chunk("a.txt", 0, "same text"), vec![1.0])];
        store.add_chunks(&first).await.unwrap();
        let second = vec![(make_chunk("b.txt", 0, "same text"), vec![1.0])];
        assert!(store.add_chunks(&second).await.is_err());
        store.close().await;
    }

    #[tokio::test]
    async fn delete_source_removes_all_rows() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&tmp.path().join("store")).await.unwrap();
        let items = vec![
            (make_chunk("a.txt", 0, "keep me"), vec![1.0]),
            (make_chunk("b.txt", 0, "drop me"), vec![1.0]),
        ];
        store.add_chunks(&items).await.unwrap();
        store.delete_source("b.txt").await.unwrap();
        assert_eq!(store.chunk_count().await.unwrap(), 1);
        assert!(store.lexical_query("drop", 10).await.unwrap().is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn punctuation_heavy_query_does_not_break_match() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&tmp.path().join("store")).await.unwrap();
        let items = vec![(make_chunk("a.txt", 0, "capacity report 2023"), vec![1.0])];
        store.add_chunks(&items).await.unwrap();
        let hits = store.lexical_query("\"capacity\" (2023)?!", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        store.close().await;
    }

    #[tokio::test]
    async fn rebuild_lexical_reflects_chunks_table() {
        let tmp = TempDir::new().unwrap();
        let store = VectorStore::open(&tmp.path().join("store")).await.unwrap();
        let items = vec![(make_chunk("a.txt", 0, "findable text"), vec![1.0])];
        store.add_chunks(&items).await.unwrap();
        store.rebuild_lexical().await.unwrap();
        assert_eq!(store.lexical_query("findable", 10).await.unwrap().len(), 1);
        store.close().await;
    }
}
