//! Multi-format text extraction.
//!
//! Each source id maps to one extraction strategy by extension. Strategies
//! return a tagged outcome: extracted text, needs-OCR-fallback, or a per-item
//! error. A failure in one source never aborts the rest of the batch; the
//! batch driver collects skips with reasons instead.
//!
//! PDF text that comes back empty or garbled (alphanumeric ratio below 0.3)
//! triggers the OCR fallback: page by page, embedded images first, whole-page
//! recognition when a page has none.

use std::io::Read;

use tracing::warn;

use crate::error::PipelineError;
use crate::models::{DocType, ExtractedDoc, ExtractionStatus, SkippedSource};
use crate::ocr::OcrProvider;

/// Garbled-text threshold: below this alphanumeric ratio, direct PDF
/// extraction is judged failed. Strictly below; exactly 0.3 passes.
const GARBLED_RATIO: f64 = 0.3;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Sheet cap per workbook.
const XLSX_MAX_SHEETS: usize = 100;

/// Outcome of one direct-extraction strategy.
pub enum Direct {
    Ok(String),
    /// Extraction technically ran but produced nothing usable; the caller
    /// escalates to OCR for eligible types.
    NeedsFallback { reason: String },
}

type ExtractFn = fn(&[u8]) -> Result<Direct, PipelineError>;

/// Strategy table: one extraction function per format tag.
fn strategy(doc_type: DocType) -> ExtractFn {
    match doc_type {
        DocType::Pdf => extract_pdf,
        DocType::Text => extract_plain_text,
        DocType::Docx => extract_docx_direct,
        DocType::DocLegacy => extract_legacy_word,
        DocType::Xlsx => extract_xlsx_direct,
        DocType::XlsLegacy => extract_legacy_spreadsheet,
    }
}

/// Extract a batch of sources. Returns the successfully extracted documents
/// and the skipped ones with reasons; the two lists partition the input.
pub async fn extract_batch(
    sources: Vec<(String, Vec<u8>)>,
    ocr: &dyn OcrProvider,
) -> (Vec<ExtractedDoc>, Vec<SkippedSource>) {
    let mut extracted = Vec::new();
    let mut skipped = Vec::new();

    for (source_id, bytes) in sources {
        match extract_source(&source_id, &bytes, ocr).await {
            Ok(doc) => extracted.push(doc),
            Err(reason) => {
                warn!(source = %source_id, error = %reason, "skipping source");
                skipped.push(SkippedSource { source_id, reason });
            }
        }
    }

    (extracted, skipped)
}

/// Extract one source, escalating to OCR where the format is eligible.
pub async fn extract_source(
    source_id: &str,
    bytes: &[u8],
    ocr: &dyn OcrProvider,
) -> Result<ExtractedDoc, PipelineError> {
    let doc_type = DocType::from_source_id(source_id)
        .ok_or_else(|| PipelineError::UnsupportedFormat(source_id.to_string()))?;

    match strategy(doc_type)(bytes)? {
        Direct::Ok(text) => Ok(ExtractedDoc {
            source_id: source_id.to_string(),
            text,
            status: ExtractionStatus::Ok,
        }),
        Direct::NeedsFallback { reason } => {
            if doc_type != DocType::Pdf {
                return Err(PipelineError::Extraction(reason));
            }
            warn!(source = %source_id, %reason, "direct extraction failed, trying OCR");
            let text = ocr_pdf(bytes, ocr).await?;
            Ok(ExtractedDoc {
                source_id: source_id.to_string(),
                text,
                status: ExtractionStatus::OcrFallback,
            })
        }
    }
}

/// True when text is empty or its alphanumeric ratio is strictly below the
/// garbled threshold.
pub fn is_garbled(text: &str) -> bool {
    if text.is_empty() {
        return true;
    }
    let total = text.chars().count();
    let alnum = text.chars().filter(|c| c.is_alphanumeric()).count();
    (alnum as f64 / total.max(1) as f64) < GARBLED_RATIO
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<Direct, PipelineError> {
    match pdf_extract::extract_text_from_mem(bytes) {
        Ok(text) if !is_garbled(&text) => Ok(Direct::Ok(text)),
        Ok(_) => Ok(Direct::NeedsFallback { reason: "extracted text empty or garbled".to_string() }),
        Err(e) => Ok(Direct::NeedsFallback { reason: e.to_string() }),
    }
}

/// OCR a PDF page by page: recognize each embedded page image; when a page
/// has no embedded images, hand the whole page to the provider instead.
/// Individual page failures are logged and skipped; the fallback fails only
/// when no page yields any text.
async fn ocr_pdf(bytes: &[u8], ocr: &dyn OcrProvider) -> Result<String, PipelineError> {
    let doc =
        lopdf::Document::load_mem(bytes).map_err(|e| PipelineError::Ocr(e.to_string()))?;
    let mut page_blocks = Vec::new();

    for (page_no, page_id) in doc.get_pages() {
        let images = page_images(&doc, page_id);
        let mut texts = Vec::new();

        if images.is_empty() {
            match ocr.page_to_text(bytes, (page_no - 1) as usize).await {
                Ok(text) if !text.trim().is_empty() => texts.push(text),
                Ok(_) => {}
                Err(e) => warn!(page = page_no, error = %e, "page OCR failed"),
            }
        } else {
            for image in images {
                match ocr.image_to_text(&image).await {
                    Ok(text) if !text.trim().is_empty() => texts.push(text),
                    Ok(_) => {}
                    Err(e) => warn!(page = page_no, error = %e, "image OCR failed"),
                }
            }
        }

        if !texts.is_empty() {
            page_blocks.push(format!("Page {}:\n{}", page_no, texts.join("\n")));
        }
    }

    if page_blocks.is_empty() {
        return Err(PipelineError::Ocr("no text recognized on any page".to_string()));
    }
    Ok(page_blocks.join("\n\n"))
}

/// Raw streams of the image XObjects referenced by one page.
fn page_images(doc: &lopdf::Document, page_id: lopdf::ObjectId) -> Vec<Vec<u8>> {
    use lopdf::Object;

    let mut images = Vec::new();
    let Ok(page_dict) = doc.get_dictionary(page_id) else {
        return images;
    };
    let Some(resources) = page_dict.get(b"Resources").ok().and_then(|o| as_dict(doc, o)) else {
        return images;
    };
    let Some(xobjects) = resources.get(b"XObject").ok().and_then(|o| as_dict(doc, o)) else {
        return images;
    };

    for (_name, entry) in xobjects.iter() {
        let resolved = match entry {
            Object::Reference(id) => match doc.get_object(*id) {
                Ok(object) => object,
                Err(_) => continue,
            },
            other => other,
        };
        if let Object::Stream(stream) = resolved {
            let is_image =
                matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(n)) if n == b"Image");
            if is_image {
                images.push(stream.content.clone());
            }
        }
    }
    images
}

fn as_dict<'a>(doc: &'a lopdf::Document, obj: &'a lopdf::Object) -> Option<&'a lopdf::Dictionary> {
    use lopdf::Object;
    match obj {
        Object::Dictionary(dict) => Some(dict),
        Object::Reference(id) => doc.get_object(*id).ok().and_then(|o| o.as_dict().ok()),
        _ => None,
    }
}

// ============ Plain text ============

/// Prioritized decode ladder: UTF-8 strict, then UTF-16 via BOM, then
/// Windows-1252 as the terminal catch-all.
fn extract_plain_text(bytes: &[u8]) -> Result<Direct, PipelineError> {
    Ok(Direct::Ok(decode_text(bytes)))
}

pub fn decode_text(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.strip_prefix('\u{feff}').unwrap_or(text).to_string();
    }
    if let Some(text) = decode_utf16(bytes) {
        return text;
    }
    decode_windows_1252(bytes)
}

fn decode_utf16(bytes: &[u8]) -> Option<String> {
    let (le, body) = match bytes {
        [0xFF, 0xFE, rest @ ..] => (true, rest),
        [0xFE, 0xFF, rest @ ..] => (false, rest),
        _ => return None,
    };
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if le {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16(&units).ok()
}

/// 0x80–0x9F differs from Latin-1; the rest maps byte-for-byte.
const CP1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{FFFD}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{FFFD}', '\u{017D}', '\u{FFFD}',
    '\u{FFFD}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{FFFD}', '\u{017E}', '\u{0178}',
];

fn decode_windows_1252(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| match b {
            0x80..=0x9F => CP1252_HIGH[(b - 0x80) as usize],
            other => other as char,
        })
        .collect()
}

// ============ Word documents ============

fn extract_docx_direct(bytes: &[u8]) -> Result<Direct, PipelineError> {
    extract_docx(bytes).map(Direct::Ok)
}

/// Legacy `.doc`: try the OOXML reader first (mislabeled modern files are
/// common), otherwise the binary format is unextractable here.
fn extract_legacy_word(bytes: &[u8]) -> Result<Direct, PipelineError> {
    fallback_chain(bytes, &[("ooxml", extract_docx)], "legacy .doc binary").map(Direct::Ok)
}

fn extract_legacy_spreadsheet(bytes: &[u8]) -> Result<Direct, PipelineError> {
    fallback_chain(bytes, &[("ooxml", extract_xlsx)], "legacy .xls binary").map(Direct::Ok)
}

/// Try readers in order; first success wins, otherwise an aggregated failure.
fn fallback_chain(
    bytes: &[u8],
    attempts: &[(&str, fn(&[u8]) -> Result<String, PipelineError>)],
    label: &str,
) -> Result<String, PipelineError> {
    let mut errors = Vec::new();
    for (name, reader) in attempts {
        match reader(bytes) {
            Ok(text) => return Ok(text),
            Err(e) => errors.push(format!("{}: {}", name, e)),
        }
    }
    Err(PipelineError::Extraction(format!("{} ({})", label, errors.join("; "))))
}

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, PipelineError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| PipelineError::Extraction(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, PipelineError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| PipelineError::Extraction(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| PipelineError::Extraction(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(PipelineError::Extraction(format!(
            "ZIP entry {} exceeds size limit",
            name
        )));
    }
    Ok(out)
}

/// Unzip `word/document.xml` and collect `<w:t>` runs, one line per
/// paragraph.
fn extract_docx(bytes: &[u8]) -> Result<String, PipelineError> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;

    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) if e.local_name().as_ref() == b"t" => {
                in_text_run = true;
            }
            Ok(quick_xml::events::Event::Text(t)) if in_text_run => {
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    if !out.ends_with('\n') && !out.is_empty() {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(PipelineError::Extraction(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

// ============ Spreadsheets ============

fn extract_xlsx_direct(bytes: &[u8]) -> Result<Direct, PipelineError> {
    extract_xlsx(bytes).map(Direct::Ok)
}

/// Flatten a workbook sheet by sheet: `Sheet: <name>` header, then rows as
/// tab-separated cell text.
fn extract_xlsx(bytes: &[u8]) -> Result<String, PipelineError> {
    let mut archive = open_zip(bytes)?;
    let shared = read_shared_strings(&mut archive).unwrap_or_default();
    let names = workbook_sheet_names(&mut archive).unwrap_or_default();
    let files = worksheet_files(&mut archive);

    let mut out = String::new();
    for (idx, file) in files.into_iter().take(XLSX_MAX_SHEETS).enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, &file)?;
        let body = sheet_rows(&xml, &shared)?;
        let name = names.get(idx).cloned().unwrap_or_else(|| format!("Sheet{}", idx + 1));
        out.push_str(&format!("Sheet: {}\n{}\n\n", name, body));
    }
    if out.is_empty() {
        return Err(PipelineError::Extraction("workbook has no worksheets".to_string()));
    }
    Ok(out)
}

/// Sheet display names from `xl/workbook.xml`, in document order. Worksheet
/// part files are numbered in that same order.
fn workbook_sheet_names(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, PipelineError> {
    let xml = read_zip_entry_bounded(archive, "xl/workbook.xml")?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut names = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) | Ok(quick_xml::events::Event::Empty(e))
                if e.local_name().as_ref() == b"sheet" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"name" {
                        names.push(attr.unescape_value().unwrap_or_default().into_owned());
                    }
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(PipelineError::Extraction(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(names)
}

fn worksheet_files(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut files: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    files.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    files
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, PipelineError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(t)) if in_t => {
                current.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(PipelineError::Extraction(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One worksheet's cells: rows joined by newlines, cells by tabs. Shared
/// strings are resolved through the string table; other `<v>` values are
/// taken verbatim.
fn sheet_rows(xml: &[u8], shared: &[String]) -> Result<String, PipelineError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut lines: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_is_shared = false;
    let mut in_value = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => row.clear(),
                b"c" => {
                    cell_is_shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(t)) if in_value => {
                let raw = t.unescape().unwrap_or_default();
                let value = raw.trim();
                if value.is_empty() {
                    // blank cell
                } else if cell_is_shared {
                    if let Ok(i) = value.parse::<usize>() {
                        if let Some(s) = shared.get(i) {
                            row.push(s.clone());
                        }
                    }
                } else {
                    row.push(value.to_string());
                }
                in_value = false;
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_is_shared = false,
                b"row" => {
                    if !row.is_empty() {
                        lines.push(row.join("\t"));
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(PipelineError::Extraction(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(lines.join("\n"))
}
