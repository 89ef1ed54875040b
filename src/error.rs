//! Per-item pipeline errors.
//!
//! One document's failure never aborts the batch it arrived in: these errors
//! are collected into [`crate::models::SyncReport`] as skips, and only
//! conditions that leave the caller without any usable index surface as
//! terminal `anyhow` errors at the orchestration layer.

use thiserror::Error;

/// Recoverable per-item failure raised while ingesting one source.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The file extension maps to no extraction strategy.
    #[error("unsupported file type: {0}")]
    UnsupportedFormat(String),

    /// Direct text extraction failed or was judged garbled.
    #[error("text extraction failed: {0}")]
    Extraction(String),

    /// The OCR fallback itself failed; the source stays unindexed.
    #[error("ocr fallback failed: {0}")]
    Ocr(String),

    /// A page fetch or embedding call failed. No manifest mutation happens
    /// for the item, so it is retried on the next sync.
    #[error("network operation failed: {0}")]
    Network(String),

    /// The vector store could not be opened; the store at that path is
    /// evicted and rebuilt from scratch.
    #[error("index store corrupt: {0}")]
    CorruptIndex(String),
}

impl PipelineError {
    /// Short tag used in reports and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UnsupportedFormat(_) => "unsupported-format",
            PipelineError::Extraction(_) => "extraction-failure",
            PipelineError::Ocr(_) => "ocr-failure",
            PipelineError::Network(_) => "network-failure",
            PipelineError::CorruptIndex(_) => "corrupt-index",
        }
    }
}
