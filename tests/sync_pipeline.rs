//! Synchronization pipeline tests: incremental sync, dedup, manifests,
//! deletion, custom chunks, and failure isolation, driven through the
//! library API with deterministic in-test providers.

use anyhow::Result;
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use docchat::answer::{AnswerProvider, DisabledAnswer};
use docchat::config::Config;
use docchat::embedding::Embedder;
use docchat::fetch::HttpFetcher;
use docchat::models::ChatMessage;
use docchat::ocr::{DisabledOcr, OcrProvider};
use docchat::sync::Engine;

/// Deterministic embedder: 4 dims derived from byte sums, call-counted.
struct StubEmbedder {
    calls: Arc<AtomicUsize>,
    texts_embedded: Arc<AtomicUsize>,
}

impl StubEmbedder {
    fn new() -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let texts = Arc::new(AtomicUsize::new(0));
        (Self { calls: calls.clone(), texts_embedded: texts.clone() }, calls, texts)
    }

    fn vector_for(text: &str) -> Vec<f32> {
        let mut v = [1.0f32; 4];
        for (i, b) in text.bytes().enumerate() {
            v[i % 4] += b as f32;
        }
        v.to_vec()
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    fn model_name(&self) -> &str {
        "stub"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }
}

/// Embedder that always fails, simulating provider unavailability.
struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }
    fn dims(&self) -> usize {
        4
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        anyhow::bail!("embedding endpoint unreachable")
    }
}

/// OCR stub that recognizes a fixed phrase on any page.
struct StubOcr {
    page_text: &'static str,
}

#[async_trait]
impl OcrProvider for StubOcr {
    async fn image_to_text(&self, _image: &[u8]) -> Result<String> {
        Ok(self.page_text.to_string())
    }
    async fn page_to_text(&self, _pdf: &[u8], _page: usize) -> Result<String> {
        Ok(self.page_text.to_string())
    }
}

fn make_engine(root: &Path) -> (Engine, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    make_engine_with_ocr(root, Box::new(DisabledOcr))
}

fn make_engine_with_ocr(
    root: &Path,
    ocr: Box<dyn OcrProvider>,
) -> (Engine, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let config = Config::with_root(root);
    let (embedder, calls, texts) = StubEmbedder::new();
    let fetcher = HttpFetcher::new(&config.fetch).unwrap();
    let engine = Engine::new(
        config,
        Box::new(embedder),
        ocr,
        Box::new(fetcher),
        Box::new(DisabledAnswer) as Box<dyn AnswerProvider>,
    );
    (engine, calls, texts)
}

fn write_doc(root: &Path, namespace: &str, name: &str, content: &str) {
    let docs = root.join(namespace).join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join(name), content).unwrap();
}

fn write_custom_chunk(root: &Path, namespace: &str, name: &str, content: &str) {
    let dir = root.join(namespace).join("custom-chunks");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), content).unwrap();
}

fn manifest_ids(root: &Path, namespace: &str) -> Vec<String> {
    let path = root.join(namespace).join("index").join("manifest");
    if !path.exists() {
        return Vec::new();
    }
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Minimal single-page PDF drawing `text` with Helvetica; valid xref so both
/// pdf-extract and the OCR page walk can parse it.
fn minimal_pdf(text: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET\n", text);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!("4 0 obj << /Length {} >> stream\n{}endstream endobj\n", content.len(), content)
            .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

#[tokio::test]
async fn clean_and_scanned_pdfs_both_index() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, _) = make_engine_with_ocr(
        tmp.path(),
        Box::new(StubOcr { page_text: "Scanned storage capacity table for 2023" }),
    );

    let docs = tmp.path().join("default").join("docs");
    fs::create_dir_all(&docs).unwrap();
    let clean_body = "The facility capacity report covers storage volumes measured across all \
                      regional warehouses during the 2023 audit period";
    fs::write(docs.join("report.pdf"), minimal_pdf(clean_body)).unwrap();
    // Draws nothing: direct extraction comes back empty, forcing the fallback.
    fs::write(docs.join("scan.pdf"), minimal_pdf("")).unwrap();

    let desired = vec!["report.pdf".to_string(), "scan.pdf".to_string()];
    let outcome = engine.sync("default", &desired).await.unwrap();

    assert_eq!(outcome.report.ocr_fallbacks, vec!["scan.pdf".to_string()]);
    assert!(outcome.report.skipped.is_empty());
    assert_eq!(outcome.report.indexed.len(), 2);

    let mut ids = manifest_ids(tmp.path(), "default");
    ids.sort();
    assert_eq!(ids, vec!["report.pdf".to_string(), "scan.pdf".to_string()]);

    // Both documents are retrievable.
    let (results, _) = engine.retrieve("default", "storage capacity", None).await.unwrap();
    let sources: Vec<&str> = results.iter().map(|r| r.source_id.as_str()).collect();
    assert!(sources.contains(&"report.pdf"));
    assert!(sources.contains(&"scan.pdf"));
}

#[tokio::test]
async fn second_sync_is_a_noop() {
    let tmp = TempDir::new().unwrap();
    let (engine, calls, _) = make_engine(tmp.path());
    write_doc(tmp.path(), "default", "a.txt", "alpha document body");
    write_doc(tmp.path(), "default", "b.txt", "beta document body");

    let desired = vec!["a.txt".to_string(), "b.txt".to_string()];
    let first = engine.sync("default", &desired).await.unwrap();
    assert_eq!(first.report.indexed.len(), 2);
    let calls_after_first = calls.load(Ordering::SeqCst);
    assert!(calls_after_first > 0);

    let second = engine.sync("default", &desired).await.unwrap();
    assert!(second.report.is_noop());
    assert_eq!(calls.load(Ordering::SeqCst), calls_after_first);
    // The handle comes back unchanged.
    assert!(Arc::ptr_eq(&first.handle, &second.handle));
}

#[tokio::test]
async fn identical_content_is_deduplicated_by_fingerprint() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, texts) = make_engine(tmp.path());
    write_doc(tmp.path(), "default", "one.txt", "the very same content");
    write_doc(tmp.path(), "default", "two.txt", "the very same content");

    let outcome = engine
        .sync("default", &["one.txt".to_string(), "two.txt".to_string()])
        .await
        .unwrap();
    assert_eq!(outcome.report.chunks_persisted, 1);
    assert_eq!(outcome.report.duplicates_dropped, 1);
    assert_eq!(texts.load(Ordering::SeqCst), 1);

    // A later source with the same content embeds nothing new either.
    write_doc(tmp.path(), "default", "three.txt", "the very same content");
    let again = engine
        .sync(
            "default",
            &["one.txt".to_string(), "two.txt".to_string(), "three.txt".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(again.report.chunks_persisted, 0);
    assert_eq!(again.report.duplicates_dropped, 1);
    assert_eq!(again.report.indexed, vec!["three.txt".to_string()]);
}

#[tokio::test]
async fn identity_is_by_id_not_content() {
    let tmp = TempDir::new().unwrap();
    let (engine, calls, _) = make_engine(tmp.path());
    write_doc(tmp.path(), "default", "a.txt", "original content");

    engine.sync("default", &["a.txt".to_string()]).await.unwrap();
    let calls_after_first = calls.load(Ordering::SeqCst);

    // Content changes on disk, but the id is already in the manifest.
    write_doc(tmp.path(), "default", "a.txt", "completely different content");
    let outcome = engine.sync("default", &["a.txt".to_string()]).await.unwrap();
    assert!(outcome.report.is_noop());
    assert_eq!(calls.load(Ordering::SeqCst), calls_after_first);
}

#[tokio::test]
async fn deleted_source_is_not_resynced_until_rerequested() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, _) = make_engine(tmp.path());
    write_doc(tmp.path(), "default", "report.txt", "report body text");
    write_doc(tmp.path(), "default", "other.txt", "other body text");

    let all = vec!["report.txt".to_string(), "other.txt".to_string()];
    engine.sync("default", &all).await.unwrap();

    assert!(engine.delete_source("default", "report.txt").await.unwrap());
    assert!(!tmp.path().join("default/docs/report.txt").exists());
    assert_eq!(manifest_ids(tmp.path(), "default"), vec!["other.txt".to_string()]);

    // Absent from the desired set: not re-added.
    let outcome = engine.sync("default", &["other.txt".to_string()]).await.unwrap();
    assert!(outcome.report.is_noop());

    // Re-requested: treated as new and re-embedded.
    write_doc(tmp.path(), "default", "report.txt", "report body text");
    let outcome = engine.sync("default", &all).await.unwrap();
    assert_eq!(outcome.report.indexed, vec!["report.txt".to_string()]);
    assert_eq!(outcome.report.chunks_persisted, 1);
}

#[tokio::test]
async fn custom_chunks_sync_and_force_refresh_reembeds() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, texts) = make_engine(tmp.path());
    write_custom_chunk(tmp.path(), "default", "correction-01.txt", "the correct figure is 42");

    // Custom chunks alone make a sync pass non-trivial.
    let outcome = engine.sync("default", &[]).await.unwrap();
    assert_eq!(outcome.report.custom_indexed, vec!["correction-01.txt".to_string()]);
    assert_eq!(outcome.report.chunks_persisted, 1);
    let embedded_before = texts.load(Ordering::SeqCst);

    // Already recorded: a plain sync is a no-op.
    let outcome = engine.sync("default", &[]).await.unwrap();
    assert!(outcome.report.is_noop());
    assert_eq!(texts.load(Ordering::SeqCst), embedded_before);

    // Force refresh re-embeds despite the manifest entry.
    let outcome = engine.force_refresh_custom_chunks("default").await.unwrap();
    assert_eq!(outcome.report.custom_indexed, vec!["correction-01.txt".to_string()]);
    assert_eq!(outcome.report.chunks_persisted, 1);
    assert_eq!(texts.load(Ordering::SeqCst), embedded_before + 1);
}

#[tokio::test]
async fn embedding_failure_leaves_manifest_untouched_and_retries() {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_root(tmp.path());
    let fetcher = HttpFetcher::new(&config.fetch).unwrap();
    let engine = Engine::new(
        config,
        Box::new(FailingEmbedder),
        Box::new(DisabledOcr),
        Box::new(fetcher),
        Box::new(DisabledAnswer),
    );
    write_doc(tmp.path(), "default", "a.txt", "document that cannot embed yet");

    let outcome = engine.sync("default", &["a.txt".to_string()]).await.unwrap();
    assert!(outcome.report.indexed.is_empty());
    assert_eq!(outcome.report.skipped.len(), 1);
    assert_eq!(outcome.report.skipped[0].source_id, "a.txt");
    assert!(manifest_ids(tmp.path(), "default").is_empty());

    // The provider recovers (fresh engine, same disk state): the item retries.
    let (engine, _, _) = make_engine(tmp.path());
    let outcome = engine.sync("default", &["a.txt".to_string()]).await.unwrap();
    assert_eq!(outcome.report.indexed, vec!["a.txt".to_string()]);
    assert_eq!(outcome.report.chunks_persisted, 1);
}

#[tokio::test]
async fn extraction_failures_are_isolated_and_reported() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, _) = make_engine(tmp.path());
    write_doc(tmp.path(), "default", "good.txt", "healthy document");
    // A docx that is not a ZIP archive cannot extract.
    write_doc(tmp.path(), "default", "broken.docx", "not a zip archive");

    let outcome = engine
        .sync("default", &["good.txt".to_string(), "broken.docx".to_string()])
        .await
        .unwrap();
    assert_eq!(outcome.report.chunks_persisted, 1);
    assert_eq!(outcome.report.skipped.len(), 1);
    assert_eq!(outcome.report.skipped[0].source_id, "broken.docx");
    // Extraction failures are deterministic: the id is recorded, not retried.
    let mut ids = manifest_ids(tmp.path(), "default");
    ids.sort();
    assert_eq!(ids, vec!["broken.docx".to_string(), "good.txt".to_string()]);
}

#[tokio::test]
async fn corrupt_store_is_evicted_and_rebuilt() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, _) = make_engine(tmp.path());
    write_doc(tmp.path(), "default", "a.txt", "fresh start content");

    // A store directory with a garbage database, plus a manifest claiming a
    // source the store never saw.
    let index = tmp.path().join("default").join("index");
    fs::create_dir_all(index.join("store")).unwrap();
    fs::write(index.join("store").join("index.sqlite"), b"this is not sqlite").unwrap();
    fs::write(index.join("manifest"), "ghost.pdf\n").unwrap();

    let outcome = engine.sync("default", &["a.txt".to_string()]).await.unwrap();
    assert_eq!(outcome.report.indexed, vec!["a.txt".to_string()]);
    // Eviction cleared the stale membership.
    assert_eq!(manifest_ids(tmp.path(), "default"), vec!["a.txt".to_string()]);
}

#[tokio::test]
async fn pending_changes_tracks_new_sources_and_custom_chunks() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, _) = make_engine(tmp.path());
    write_doc(tmp.path(), "default", "a.txt", "first document");

    let current = engine.list_documents("default").unwrap();
    assert!(engine.has_pending_changes("default", &current).unwrap());

    engine.sync("default", &current).await.unwrap();
    assert!(!engine.has_pending_changes("default", &current).unwrap());

    // A deleted-on-disk source alone is not pending work.
    assert!(!engine.has_pending_changes("default", &[]).unwrap());

    write_custom_chunk(tmp.path(), "default", "note.txt", "manual note");
    assert!(engine.has_pending_changes("default", &current).unwrap());
}

#[tokio::test]
async fn concurrent_syncs_serialize_to_one_embedding_pass() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, texts) = make_engine(tmp.path());
    write_doc(tmp.path(), "default", "a.txt", "contended document body");
    let engine = Arc::new(engine);

    let desired = vec!["a.txt".to_string()];
    let (left, right) = tokio::join!(
        engine.sync("default", &desired),
        engine.sync("default", &desired),
    );
    left.unwrap();
    right.unwrap();

    // One pass embedded the chunk; the other saw the manifest and no-op'd.
    assert_eq!(texts.load(Ordering::SeqCst), 1);
    assert_eq!(manifest_ids(tmp.path(), "default"), vec!["a.txt".to_string()]);
}

#[tokio::test]
async fn namespaces_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, _) = make_engine(tmp.path());
    write_doc(tmp.path(), "alice", "a.txt", "alice private notes");
    write_doc(tmp.path(), "bob", "b.txt", "bob private notes");

    engine.sync("alice", &["a.txt".to_string()]).await.unwrap();
    engine.sync("bob", &["b.txt".to_string()]).await.unwrap();

    assert_eq!(manifest_ids(tmp.path(), "alice"), vec!["a.txt".to_string()]);
    assert_eq!(manifest_ids(tmp.path(), "bob"), vec!["b.txt".to_string()]);

    let (results, _) = engine.retrieve("alice", "private notes", None).await.unwrap();
    assert!(results.iter().all(|r| r.source_id == "a.txt"));
}

#[tokio::test]
async fn chunk_export_files_are_written() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, _) = make_engine(tmp.path());
    // The upload path collaborators use: write bytes, then sync.
    engine.add_document("default", "report.txt", b"exported body text").unwrap();

    engine.sync("default", &["report.txt".to_string()]).await.unwrap();

    let export = tmp.path().join("default").join("index").join("chunk-export");
    let exported = export.join("report_chunk_0000.txt");
    assert!(exported.exists());
    assert_eq!(fs::read_to_string(exported).unwrap(), "exported body text");
}

#[tokio::test]
async fn answer_surface_reports_disabled_provider() {
    let tmp = TempDir::new().unwrap();
    let (engine, _, _) = make_engine(tmp.path());
    write_doc(tmp.path(), "default", "a.txt", "context body");
    engine.sync("default", &["a.txt".to_string()]).await.unwrap();

    let history: Vec<ChatMessage> = Vec::new();
    let err = engine.answer("default", "what is this?", &history).await.unwrap_err();
    assert!(err.to_string().contains("disabled"));
}
