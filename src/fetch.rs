//! Page fetching and crawling.
//!
//! A fetched URL lands in the namespace's document directory: PDFs verbatim
//! as `<slug>.pdf`, HTML reduced to its visible text as `<slug>.txt`. From
//! there the files sync like any uploaded document.
//!
//! Crawling is an iterative breadth-first traversal. The frontier queue,
//! visited set, and page budget all live inside one [`crawl`] call; two
//! concurrent crawls share nothing.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Url;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::config::FetchConfig;
use crate::error::PipelineError;
use crate::models::{CrawlReport, SavedKind, SavedPage};

/// One fetched page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// URL → bytes + content type. External collaborator; the HTTP
/// implementation uses a bounded timeout and a stable User-Agent.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedPage { final_url, content_type, bytes })
    }
}

/// Filesystem-safe slug: lowercased, non-alphanumeric runs collapsed to `_`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_sep = true;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    slug.trim_matches('_').to_string()
}

/// Fetch one URL and save it under `docs_dir`. Returns `None` when the slug
/// already exists there (nothing written).
pub async fn save_url(
    fetcher: &dyn PageFetcher,
    docs_dir: &Path,
    url: &str,
) -> Result<Option<SavedPage>, PipelineError> {
    let parsed = Url::parse(url).map_err(|e| PipelineError::Network(format!("{}: {}", url, e)))?;
    let page = fetcher
        .fetch(parsed.as_str())
        .await
        .map_err(|e| PipelineError::Network(format!("{}: {}", url, e)))?;
    persist_page(docs_dir, &parsed, &page)
}

fn persist_page(
    docs_dir: &Path,
    url: &Url,
    page: &FetchedPage,
) -> Result<Option<SavedPage>, PipelineError> {
    let base = slugify(&format!("{}{}", url.host_str().unwrap_or(""), url.path()));
    let base = if base.is_empty() { "page".to_string() } else { base };
    let is_pdf =
        url.path().to_ascii_lowercase().ends_with(".pdf") || page.content_type.contains("application/pdf");

    std::fs::create_dir_all(docs_dir).map_err(|e| PipelineError::Network(e.to_string()))?;

    if is_pdf {
        let file_name = format!("{}.pdf", base);
        let path = docs_dir.join(&file_name);
        if path.exists() {
            return Ok(None);
        }
        std::fs::write(&path, &page.bytes).map_err(|e| PipelineError::Network(e.to_string()))?;
        return Ok(Some(SavedPage { file_name, kind: SavedKind::Pdf }));
    }

    let text = visible_text(&page.bytes);
    if text.is_empty() {
        return Err(PipelineError::Extraction(format!("no textual content at {}", url)));
    }
    let file_name = format!("{}.txt", base);
    let path = docs_dir.join(&file_name);
    if path.exists() {
        return Ok(None);
    }
    std::fs::write(&path, text).map_err(|e| PipelineError::Network(e.to_string()))?;
    Ok(Some(SavedPage { file_name, kind: SavedKind::Html }))
}

/// Elements whose content never counts as visible text.
const SKIPPED_ELEMENTS: [&[u8]; 5] = [b"script", b"style", b"noscript", b"iframe", b"meta"];

/// Reduce an HTML document to its visible text: skipped elements removed,
/// lines trimmed, blank lines dropped, survivors joined by blank lines.
/// Parsing is loose and best-effort; malformed markup ends the scan with
/// whatever was collected.
pub fn visible_text(html: &[u8]) -> String {
    let mut reader = quick_xml::Reader::from_reader(html);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;

    let mut buf = Vec::new();
    let mut raw = String::new();
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if SKIPPED_ELEMENTS.contains(&e.local_name().as_ref()) {
                    skip_depth += 1;
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if SKIPPED_ELEMENTS.contains(&e.local_name().as_ref()) {
                    skip_depth = skip_depth.saturating_sub(1);
                }
            }
            Ok(quick_xml::events::Event::Text(t)) if skip_depth == 0 => {
                let text = match t.unescape() {
                    Ok(cow) => cow.into_owned(),
                    Err(_) => String::from_utf8_lossy(&t).into_owned(),
                };
                raw.push_str(&text);
                raw.push('\n');
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Absolute http(s) links found in `<a href>` attributes, resolved against
/// `base`, fragments stripped.
pub fn extract_links(html: &[u8], base: &Url) -> Vec<Url> {
    let mut reader = quick_xml::Reader::from_reader(html);
    reader.config_mut().check_end_names = false;

    let mut buf = Vec::new();
    let mut links = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e))
                if e.local_name().as_ref() == b"a" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"href" {
                        let href = attr.unescape_value().unwrap_or_default();
                        if let Ok(mut url) = base.join(href.as_ref()) {
                            url.set_fragment(None);
                            if url.scheme() == "http" || url.scheme() == "https" {
                                links.push(url);
                            }
                        }
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    links
}

/// Breadth-first crawl from `start_url`, same-domain only, visiting at most
/// `max_pages` pages. Every visited page is saved via the fetch path; per-page
/// failures are recorded and the crawl continues.
pub async fn crawl(
    fetcher: &dyn PageFetcher,
    docs_dir: &Path,
    start_url: &str,
    max_pages: usize,
) -> Result<CrawlReport, PipelineError> {
    let start =
        Url::parse(start_url).map_err(|e| PipelineError::Network(format!("{}: {}", start_url, e)))?;
    let domain = start
        .host_str()
        .ok_or_else(|| PipelineError::Network(format!("no host in {}", start_url)))?
        .to_string();

    let mut report = CrawlReport::default();
    let mut frontier: VecDeque<Url> = VecDeque::from([start]);
    let mut visited: HashSet<String> = HashSet::new();
    let mut budget = max_pages;

    while let Some(url) = frontier.pop_front() {
        if budget == 0 {
            break;
        }
        if !visited.insert(url.to_string()) {
            continue;
        }
        budget -= 1;
        report.pages_visited += 1;

        let page = match fetcher.fetch(url.as_str()).await {
            Ok(page) => page,
            Err(e) => {
                warn!(url = %url, error = %e, "crawl fetch failed");
                report.failures.push((url.to_string(), e.to_string()));
                continue;
            }
        };

        let is_html = page.content_type.contains("text/html");
        match persist_page(docs_dir, &url, &page) {
            Ok(Some(saved)) => report.saved.push(saved),
            Ok(None) => {}
            Err(e) => report.failures.push((url.to_string(), e.to_string())),
        }

        if is_html {
            for link in extract_links(&page.bytes, &url) {
                if link.host_str() == Some(domain.as_str()) && !visited.contains(link.as_str()) {
                    frontier.push_back(link);
                }
            }
        }
    }

    Ok(report)
}
