//! Incremental index synchronization.
//!
//! [`Engine`] owns the per-namespace document libraries and their indexes.
//! One synchronization pass runs per namespace at a time (an async mutex per
//! namespace serializes writers); retrieval is read-only and runs
//! concurrently against handle snapshots.
//!
//! A sync pass: load the manifest, diff against the desired source ids,
//! extract → chunk → dedupe the new sources, merge newly injected custom
//! chunks, dedupe again across the merge and against persisted fingerprints,
//! embed, persist into the vector store, export the new chunks for
//! inspection, and only then append the manifests. Data always lands before
//! membership, so a crash can leave chunks persisted-but-unrecorded (repaired
//! by the next pass) but never recorded-but-missing.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::answer::{self, AnswerProvider};
use crate::analyze::{analyze, QueryAnalysis};
use crate::chunk::{chunk_document, fingerprint};
use crate::config::Config;
use crate::dedupe::{dedupe, drop_persisted};
use crate::embedding::{create_embedder, Embedder};
use crate::error::PipelineError;
use crate::extract::extract_batch;
use crate::fetch::{self, HttpFetcher, PageFetcher};
use crate::manifest::Manifest;
use crate::models::{Chunk, CrawlReport, ExtractionStatus, SavedPage, SkippedSource, SyncReport};
use crate::ocr::{create_provider as create_ocr, OcrProvider};
use crate::retrieve::{self, RetrievalResult};
use crate::store::VectorStore;

/// An opened index for one namespace. Holders should treat a stale handle as
/// an instruction to ask the engine for a fresh one.
pub struct IndexHandle {
    pub namespace: String,
    store: VectorStore,
    stale: AtomicBool,
}

impl IndexHandle {
    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    /// True after a deletion or eviction invalidated this handle.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }
}

/// Result of a sync pass: the (possibly unchanged) handle plus what happened.
pub struct SyncOutcome {
    pub handle: Arc<IndexHandle>,
    pub report: SyncReport,
}

/// Answer to a question, with the distinct sources that backed it.
#[derive(Debug)]
pub struct AnswerOutcome {
    pub answer: String,
    pub sources: Vec<String>,
    pub analysis: QueryAnalysis,
}

/// On-disk layout of one namespace.
struct NamespacePaths {
    docs: PathBuf,
    custom: PathBuf,
    manifest: PathBuf,
    custom_manifest: PathBuf,
    export: PathBuf,
    store: PathBuf,
}

impl NamespacePaths {
    fn new(root: &Path, namespace: &str) -> Self {
        let base = root.join(namespace);
        let index = base.join("index");
        NamespacePaths {
            docs: base.join("docs"),
            custom: base.join("custom-chunks"),
            manifest: index.join("manifest"),
            custom_manifest: index.join("custom-chunk-manifest"),
            export: index.join("chunk-export"),
            store: index.join("store"),
        }
    }
}

pub struct Engine {
    config: Config,
    embedder: Box<dyn Embedder>,
    ocr: Box<dyn OcrProvider>,
    fetcher: Box<dyn PageFetcher>,
    answerer: Box<dyn AnswerProvider>,
    /// One writer lock per namespace.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Cached open handles, evicted on deletion.
    handles: Mutex<HashMap<String, Arc<IndexHandle>>>,
}

impl Engine {
    /// Build an engine with explicit collaborators (the seam tests use).
    pub fn new(
        config: Config,
        embedder: Box<dyn Embedder>,
        ocr: Box<dyn OcrProvider>,
        fetcher: Box<dyn PageFetcher>,
        answerer: Box<dyn AnswerProvider>,
    ) -> Self {
        Engine {
            config,
            embedder,
            ocr,
            fetcher,
            answerer,
            locks: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Build an engine with the providers named in the configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let ocr = create_ocr(&config.ocr)?;
        let fetcher: Box<dyn PageFetcher> = Box::new(HttpFetcher::new(&config.fetch)?);
        let answerer = answer::create_provider(&config.answer)?;
        Ok(Engine::new(config, embedder, ocr, fetcher, answerer))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn paths(&self, namespace: &str) -> NamespacePaths {
        NamespacePaths::new(&self.config.storage.root, namespace)
    }

    async fn namespace_lock(&self, namespace: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(namespace.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Write an uploaded document into the namespace's library. The caller
    /// syncs afterwards to index it.
    pub fn add_document(&self, namespace: &str, file_name: &str, bytes: &[u8]) -> Result<()> {
        let paths = self.paths(namespace);
        std::fs::create_dir_all(&paths.docs)?;
        std::fs::write(paths.docs.join(file_name), bytes)
            .with_context(|| format!("Failed to save document {}", file_name))?;
        Ok(())
    }

    /// Source ids currently present in the namespace's library, matching the
    /// configured include patterns, sorted.
    pub fn list_documents(&self, namespace: &str) -> Result<Vec<String>> {
        let paths = self.paths(namespace);
        if !paths.docs.exists() {
            return Ok(Vec::new());
        }
        let include = build_globset(&self.config.storage.include_globs)?;
        let mut ids = Vec::new();
        for entry in WalkDir::new(&paths.docs).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if include.is_match(&name) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// True when `current_ids` contains sources the manifest does not, or
    /// un-recorded custom chunk files exist.
    pub fn has_pending_changes(&self, namespace: &str, current_ids: &[String]) -> Result<bool> {
        let paths = self.paths(namespace);
        let indexed = Manifest::new(&paths.manifest).load()?;
        if current_ids.iter().any(|id| !indexed.contains(id)) {
            return Ok(true);
        }
        let recorded = Manifest::new(&paths.custom_manifest).load()?;
        Ok(list_custom_chunks(&paths.custom)?.iter().any(|(id, _)| !recorded.contains(id)))
    }

    /// Synchronize the namespace's index with `desired_ids`. Idempotent: a
    /// pass with nothing new returns the cached handle and an empty report.
    pub async fn sync(&self, namespace: &str, desired_ids: &[String]) -> Result<SyncOutcome> {
        let lock = self.namespace_lock(namespace).await;
        let _guard = lock.lock().await;

        let paths = self.paths(namespace);
        std::fs::create_dir_all(&paths.docs)?;
        let handle = self.open_handle(namespace, &paths).await?;

        let manifest = Manifest::new(&paths.manifest);
        let custom_manifest = Manifest::new(&paths.custom_manifest);
        let indexed = manifest.load()?;
        let recorded_custom = custom_manifest.load()?;

        let new_sources: Vec<String> =
            desired_ids.iter().filter(|id| !indexed.contains(*id)).cloned().collect();
        let new_custom: Vec<(String, String)> = list_custom_chunks(&paths.custom)?
            .into_iter()
            .filter(|(id, _)| !recorded_custom.contains(id))
            .collect();

        if new_sources.is_empty() && new_custom.is_empty() {
            return Ok(SyncOutcome { handle, report: SyncReport::default() });
        }

        info!(
            namespace,
            new_sources = new_sources.len(),
            new_custom = new_custom.len(),
            "synchronizing index"
        );

        let mut report = SyncReport::default();

        // Read source bytes; a missing or unreadable file is a network-class
        // skip (retryable, never recorded).
        let mut sources: Vec<(String, Vec<u8>)> = Vec::new();
        for id in &new_sources {
            match std::fs::read(paths.docs.join(id)) {
                Ok(bytes) => sources.push((id.clone(), bytes)),
                Err(e) => report.skipped.push(SkippedSource {
                    source_id: id.clone(),
                    reason: PipelineError::Network(e.to_string()),
                }),
            }
        }

        let (extracted, skipped) = extract_batch(sources, self.ocr.as_ref()).await;
        report.ocr_fallbacks = extracted
            .iter()
            .filter(|doc| doc.status == ExtractionStatus::OcrFallback)
            .map(|doc| doc.source_id.clone())
            .collect();
        report.skipped.extend(skipped);

        let mut chunks: Vec<Chunk> = Vec::new();
        for doc in &extracted {
            chunks.extend(chunk_document(
                &doc.source_id,
                &doc.text,
                self.config.chunking.chunk_size,
                self.config.chunking.overlap,
            ));
        }
        for (id, text) in &new_custom {
            chunks.push(custom_chunk(id, text));
        }

        let (unique, batch_dupes) = dedupe(chunks);
        let persisted = handle.store.fingerprints().await?;
        let (fresh, persisted_dupes) = drop_persisted(unique, &persisted);
        report.duplicates_dropped = batch_dupes + persisted_dupes;

        if !fresh.is_empty() {
            let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
            let vectors = match self.embedder.embed(&texts).await {
                Ok(vectors) if vectors.len() == fresh.len() => vectors,
                Ok(_) => {
                    return self.abort_pass(
                        handle,
                        report,
                        new_sources,
                        new_custom,
                        "embedding returned a short batch",
                    );
                }
                Err(e) => {
                    return self.abort_pass(handle, report, new_sources, new_custom, &e.to_string());
                }
            };

            let items: Vec<(Chunk, Vec<f32>)> = fresh.into_iter().zip(vectors).collect();
            handle.store.add_chunks(&items).await?;
            handle.store.persist().await?;
            export_chunks(&paths.export, &items)?;
            report.chunks_persisted = items.len();
        }

        // Membership last. Extraction-class failures are recorded (their
        // re-extraction is deterministic); network-class skips are not.
        let retryable: Vec<&String> = report
            .skipped
            .iter()
            .filter(|s| matches!(s.reason, PipelineError::Network(_)))
            .map(|s| &s.source_id)
            .collect();
        let committed: Vec<String> =
            new_sources.into_iter().filter(|id| !retryable.contains(&id)).collect();
        manifest.append(&committed)?;
        report.indexed = committed;

        let custom_ids: Vec<String> = new_custom.into_iter().map(|(id, _)| id).collect();
        custom_manifest.append(&custom_ids)?;
        report.custom_indexed = custom_ids;

        Ok(SyncOutcome { handle, report })
    }

    /// Embedding was unavailable: report every pending item as a retryable
    /// skip, mutate no manifest, and hand back the still-usable handle.
    fn abort_pass(
        &self,
        handle: Arc<IndexHandle>,
        mut report: SyncReport,
        new_sources: Vec<String>,
        new_custom: Vec<(String, String)>,
        error: &str,
    ) -> Result<SyncOutcome> {
        warn!(error, "embedding unavailable, deferring batch to next sync");
        for id in new_sources.into_iter().chain(new_custom.into_iter().map(|(id, _)| id)) {
            if !report.skipped.iter().any(|s| s.source_id == id) {
                report
                    .skipped
                    .push(SkippedSource { source_id: id, reason: PipelineError::Network(error.to_string()) });
            }
        }
        Ok(SyncOutcome { handle, report })
    }

    /// Remove a source's bytes, strike it from the manifest, drop its store
    /// rows, and invalidate the cached handle.
    pub async fn delete_source(&self, namespace: &str, source_id: &str) -> Result<bool> {
        let lock = self.namespace_lock(namespace).await;
        let _guard = lock.lock().await;

        let paths = self.paths(namespace);
        let doc_path = paths.docs.join(source_id);
        let file_removed = match std::fs::remove_file(&doc_path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let struck = Manifest::new(&paths.manifest).strike(source_id)?;

        if struck {
            let handle = self.open_handle(namespace, &paths).await?;
            handle.store.delete_source(source_id).await?;
            handle.store.persist().await?;
        }

        let mut handles = self.handles.lock().await;
        if let Some(handle) = handles.remove(namespace) {
            handle.mark_stale();
        }

        Ok(struck || file_removed)
    }

    /// Re-embed every currently present custom chunk, membership or not.
    /// Used to repair an index suspected to be missing manual corrections.
    pub async fn force_refresh_custom_chunks(&self, namespace: &str) -> Result<SyncOutcome> {
        let lock = self.namespace_lock(namespace).await;
        let _guard = lock.lock().await;

        let paths = self.paths(namespace);
        let handle = self.open_handle(namespace, &paths).await?;
        let custom_manifest = Manifest::new(&paths.custom_manifest);
        custom_manifest.clear()?;

        let present = list_custom_chunks(&paths.custom)?;
        let mut report = SyncReport::default();
        if present.is_empty() {
            return Ok(SyncOutcome { handle, report });
        }

        // Drop the old rows so the re-embed is genuine, not deduplicated away.
        for (id, _) in &present {
            handle.store.delete_source(id).await?;
        }

        let chunks: Vec<Chunk> =
            present.iter().map(|(id, text)| custom_chunk(id, text)).collect();
        let (unique, dropped) = dedupe(chunks);
        let persisted = handle.store.fingerprints().await?;
        let (fresh, persisted_dupes) = drop_persisted(unique, &persisted);
        report.duplicates_dropped = dropped + persisted_dupes;

        if !fresh.is_empty() {
            let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
            let vectors =
                self.embedder.embed(&texts).await.context("re-embedding custom chunks")?;
            let items: Vec<(Chunk, Vec<f32>)> = fresh.into_iter().zip(vectors).collect();
            handle.store.add_chunks(&items).await?;
            handle.store.persist().await?;
            export_chunks(&paths.export, &items)?;
            report.chunks_persisted = items.len();
        }

        let ids: Vec<String> = present.into_iter().map(|(id, _)| id).collect();
        custom_manifest.append(&ids)?;
        report.custom_indexed = ids;

        Ok(SyncOutcome { handle, report })
    }

    /// Retrieve top-k context for a query, with weights recommended by the
    /// query analyzer. Read-only; safe to run concurrently.
    pub async fn retrieve(
        &self,
        namespace: &str,
        query: &str,
        k: Option<usize>,
    ) -> Result<(Vec<RetrievalResult>, QueryAnalysis)> {
        let paths = self.paths(namespace);
        let handle = self.open_handle(namespace, &paths).await?;
        let analysis = analyze(query);
        let results = retrieve::retrieve(
            &handle.store,
            self.embedder.as_ref(),
            query,
            analysis.recommended_weights,
            self.config.retrieval.candidate_n,
            k.unwrap_or(self.config.retrieval.final_k),
        )
        .await?;
        Ok((results, analysis))
    }

    /// Answer a question from retrieved context and conversation history.
    pub async fn answer(
        &self,
        namespace: &str,
        question: &str,
        history: &[crate::models::ChatMessage],
    ) -> Result<AnswerOutcome> {
        let (results, analysis) = self.retrieve(namespace, question, None).await?;
        let context = answer::assemble_context(&results);
        let sources = answer::source_list(&results);
        let text = self.answerer.complete(&context, history, question).await?;
        Ok(AnswerOutcome { answer: text, sources, analysis })
    }

    /// Fetch one URL into the namespace's library.
    pub async fn fetch_into(
        &self,
        namespace: &str,
        url: &str,
    ) -> Result<Option<SavedPage>, PipelineError> {
        let paths = self.paths(namespace);
        fetch::save_url(self.fetcher.as_ref(), &paths.docs, url).await
    }

    /// Crawl same-domain pages from `start_url` into the namespace's library.
    pub async fn crawl_into(
        &self,
        namespace: &str,
        start_url: &str,
        max_pages: Option<usize>,
    ) -> Result<CrawlReport, PipelineError> {
        let paths = self.paths(namespace);
        fetch::crawl(
            self.fetcher.as_ref(),
            &paths.docs,
            start_url,
            max_pages.unwrap_or(self.config.fetch.max_pages),
        )
        .await
    }

    /// Return the cached handle, or open the store, evicting and rebuilding
    /// it if it cannot be opened.
    async fn open_handle(
        &self,
        namespace: &str,
        paths: &NamespacePaths,
    ) -> Result<Arc<IndexHandle>> {
        {
            let handles = self.handles.lock().await;
            if let Some(handle) = handles.get(namespace) {
                if !handle.is_stale() {
                    return Ok(handle.clone());
                }
            }
        }

        let store = match VectorStore::open(&paths.store).await {
            Ok(store) => store,
            Err(e) => {
                warn!(namespace, error = %e, "evicting corrupt store");
                let _ = std::fs::remove_dir_all(&paths.store);
                // Membership must not outlive the data it records.
                Manifest::new(&paths.manifest).clear()?;
                Manifest::new(&paths.custom_manifest).clear()?;
                VectorStore::open(&paths.store).await.map_err(|e| anyhow::anyhow!(e))?
            }
        };
        store.rebuild_lexical().await?;

        let handle = Arc::new(IndexHandle {
            namespace: namespace.to_string(),
            store,
            stale: AtomicBool::new(false),
        });
        let mut handles = self.handles.lock().await;
        handles.insert(namespace.to_string(), handle.clone());
        Ok(handle)
    }
}

/// A manually injected chunk bypasses extraction and chunking entirely.
fn custom_chunk(id: &str, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        source_id: id.to_string(),
        seq: 0,
        text: text.to_string(),
        fingerprint: fingerprint(text),
    }
}

/// `(id, text)` for every `.txt` file in the custom-chunk directory, sorted
/// by id. The file name is the chunk id.
fn list_custom_chunks(dir: &Path) -> Result<Vec<(String, String)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut chunks = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.to_ascii_lowercase().ends_with(".txt") {
            continue;
        }
        let text = std::fs::read_to_string(entry.path())
            .with_context(|| format!("Failed to read custom chunk {}", name))?;
        if !text.trim().is_empty() {
            chunks.push((name, text));
        }
    }
    chunks.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(chunks)
}

/// One file per newly persisted chunk:
/// `<source-basename>_chunk_<4-digit-seq>.txt`.
fn export_chunks(export_dir: &Path, items: &[(Chunk, Vec<f32>)]) -> Result<()> {
    std::fs::create_dir_all(export_dir)?;
    for (chunk, _) in items {
        let base = Path::new(&chunk.source_id)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| chunk.source_id.clone());
        let name = format!("{}_chunk_{:04}.txt", base, chunk.seq);
        std::fs::write(export_dir.join(name), &chunk.text)?;
    }
    Ok(())
}

fn build_globset(patterns: &[String]) -> Result<globset::GlobSet> {
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(globset::Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_layout_under_root() {
        let paths = NamespacePaths::new(Path::new("/data"), "alice");
        assert_eq!(paths.docs, Path::new("/data/alice/docs"));
        assert_eq!(paths.manifest, Path::new("/data/alice/index/manifest"));
        assert_eq!(
            paths.custom_manifest,
            Path::new("/data/alice/index/custom-chunk-manifest")
        );
        assert_eq!(paths.export, Path::new("/data/alice/index/chunk-export"));
        assert_eq!(paths.store, Path::new("/data/alice/index/store"));
    }

    #[test]
    fn export_names_are_reproducible() {
        let tmp = tempfile::TempDir::new().unwrap();
        let chunk = custom_chunk("report.pdf", "body");
        let items = vec![(Chunk { seq: 7, ..chunk }, vec![0.0f32])];
        export_chunks(tmp.path(), &items).unwrap();
        assert!(tmp.path().join("report_chunk_0007.txt").exists());
    }
}
