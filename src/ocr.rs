//! OCR provider contract.
//!
//! The engine internals are external; this module only defines how the
//! fallback is invoked. Two operations: recognize an embedded page image, and
//! recognize a whole page when it carries no embedded images. Rasterization
//! for the latter happens provider-side, next to the render engine.
//!
//! Calls use a bounded timeout and are not retried here; the extraction
//! layer treats any error as an OCR failure and skips the source with a
//! warning.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::OcrConfig;

#[async_trait]
pub trait OcrProvider: Send + Sync {
    /// Recognize text in one embedded image.
    async fn image_to_text(&self, image: &[u8]) -> Result<String>;

    /// Rasterize and recognize one page (0-based) of a PDF.
    async fn page_to_text(&self, pdf: &[u8], page: usize) -> Result<String>;
}

/// Build the configured provider.
pub fn create_provider(config: &OcrConfig) -> Result<Box<dyn OcrProvider>> {
    match config.provider.as_str() {
        "http" => Ok(Box::new(HttpOcrProvider::new(config)?)),
        "disabled" => Ok(Box::new(DisabledOcr)),
        other => bail!("Unknown ocr provider: {}", other),
    }
}

/// No-op provider: every fallback attempt fails, so garbled sources are
/// skipped with a warning instead of OCR'd.
pub struct DisabledOcr;

#[async_trait]
impl OcrProvider for DisabledOcr {
    async fn image_to_text(&self, _image: &[u8]) -> Result<String> {
        bail!("OCR provider is disabled")
    }

    async fn page_to_text(&self, _pdf: &[u8], _page: usize) -> Result<String> {
        bail!("OCR provider is disabled")
    }
}

/// HTTP-backed provider. Posts raw bytes to `<endpoint>/image` or
/// `<endpoint>/page?page=N` and expects the recognized text as the plain
/// response body.
pub struct HttpOcrProvider {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpOcrProvider {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ocr.endpoint required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { endpoint: endpoint.trim_end_matches('/').to_string(), client })
    }

    async fn post_bytes(&self, url: String, content_type: &str, body: Vec<u8>) -> Result<String> {
        let response = self
            .client
            .post(&url)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await
            .with_context(|| format!("OCR request failed: {}", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("OCR endpoint returned {}", status);
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl OcrProvider for HttpOcrProvider {
    async fn image_to_text(&self, image: &[u8]) -> Result<String> {
        self.post_bytes(
            format!("{}/image", self.endpoint),
            "application/octet-stream",
            image.to_vec(),
        )
        .await
    }

    async fn page_to_text(&self, pdf: &[u8], page: usize) -> Result<String> {
        self.post_bytes(
            format!("{}/page?page={}", self.endpoint, page),
            "application/pdf",
            pdf.to_vec(),
        )
        .await
    }
}
