//! Core data models used throughout docchat.
//!
//! These types represent the documents, chunks, and operation reports that
//! flow through the ingestion and retrieval pipeline. Operations return
//! structured reports rather than flipping display flags somewhere shared.

use crate::error::PipelineError;

/// File format tag derived from the source id's extension. Extraction
/// dispatches on this, one strategy per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocType {
    Pdf,
    Text,
    /// Legacy binary Word document (`.doc`).
    DocLegacy,
    /// OOXML Word document (`.docx`).
    Docx,
    /// Legacy binary spreadsheet (`.xls`).
    XlsLegacy,
    /// OOXML spreadsheet (`.xlsx`).
    Xlsx,
}

impl DocType {
    /// Maps a source id (file name or URL slug) to its format tag.
    /// Returns `None` for unrecognized extensions.
    pub fn from_source_id(source_id: &str) -> Option<DocType> {
        let lower = source_id.to_ascii_lowercase();
        let ext = lower.rsplit('.').next()?;
        match ext {
            "pdf" => Some(DocType::Pdf),
            "txt" | "md" => Some(DocType::Text),
            "doc" => Some(DocType::DocLegacy),
            "docx" => Some(DocType::Docx),
            "xls" => Some(DocType::XlsLegacy),
            "xlsx" => Some(DocType::Xlsx),
            _ => None,
        }
    }
}

/// How a source's text was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStatus {
    /// Direct extraction succeeded.
    Ok,
    /// Direct extraction was empty or garbled; OCR produced the text.
    OcrFallback,
}

/// Normalized text extracted from one source.
#[derive(Debug, Clone)]
pub struct ExtractedDoc {
    pub source_id: String,
    pub text: String,
    pub status: ExtractionStatus,
}

/// A bounded slice of normalized document text: the unit of embedding and
/// retrieval. Immutable once persisted.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    /// Stable id of the source this chunk came from (file name or URL slug;
    /// custom chunks use their injected file name).
    pub source_id: String,
    /// Dense, 0-based position within the source. Stable across runs, which
    /// keeps export file names reproducible.
    pub seq: i64,
    pub text: String,
    /// SHA-256 hex digest of `text`. Fusion identity and dedup key.
    pub fingerprint: String,
}

/// One source that was skipped during a sync pass, with the reason.
#[derive(Debug)]
pub struct SkippedSource {
    pub source_id: String,
    pub reason: PipelineError,
}

/// Outcome of one synchronization pass. Partial success is the norm: the
/// caller learns which sources landed and which were skipped and why.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// Source ids newly committed to the manifest this pass.
    pub indexed: Vec<String>,
    /// Injected chunk ids newly committed to the custom-chunk manifest.
    pub custom_indexed: Vec<String>,
    /// Unique chunks embedded and persisted this pass.
    pub chunks_persisted: usize,
    /// Duplicate chunks dropped by fingerprint before persistence.
    pub duplicates_dropped: usize,
    /// Sources that fell back to OCR.
    pub ocr_fallbacks: Vec<String>,
    /// Sources skipped, with reasons.
    pub skipped: Vec<SkippedSource>,
}

impl SyncReport {
    /// True when the pass changed nothing (the no-op fast path).
    pub fn is_noop(&self) -> bool {
        self.indexed.is_empty() && self.custom_indexed.is_empty() && self.chunks_persisted == 0
    }
}

/// What a fetched URL was saved as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedKind {
    Pdf,
    Html,
}

/// A page fetched and written into the namespace's document directory.
#[derive(Debug, Clone)]
pub struct SavedPage {
    pub file_name: String,
    pub kind: SavedKind,
}

/// Outcome of one crawl invocation. All traversal state (frontier, visited
/// set, page budget) lives inside the call that produced this.
#[derive(Debug, Default)]
pub struct CrawlReport {
    pub pages_visited: usize,
    pub saved: Vec<SavedPage>,
    /// (url, error) pairs for pages that failed; the crawl continues past them.
    pub failures: Vec<(String, String)>,
}

/// One turn of conversation history handed to the answer provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: ChatRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage { role: ChatRole::Assistant, content: content.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_type_dispatch_by_extension() {
        assert_eq!(DocType::from_source_id("report.pdf"), Some(DocType::Pdf));
        assert_eq!(DocType::from_source_id("REPORT.PDF"), Some(DocType::Pdf));
        assert_eq!(DocType::from_source_id("notes.txt"), Some(DocType::Text));
        assert_eq!(DocType::from_source_id("old.doc"), Some(DocType::DocLegacy));
        assert_eq!(DocType::from_source_id("new.docx"), Some(DocType::Docx));
        assert_eq!(DocType::from_source_id("sheet.xls"), Some(DocType::XlsLegacy));
        assert_eq!(DocType::from_source_id("sheet.xlsx"), Some(DocType::Xlsx));
        assert_eq!(DocType::from_source_id("archive.zip"), None);
    }

    #[test]
    fn sync_report_noop() {
        let report = SyncReport::default();
        assert!(report.is_noop());
    }
}
