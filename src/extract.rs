//! Multi-format text extraction for uploaded study material.
//!
//! Turns raw upload bytes plus a content type into located [`Segment`]s:
//! PDF pages, PPTX slides, Markdown sections, or a single unlocated
//! segment for formats without a natural location. Extraction never
//! panics; a failure means the upload is rejected as an unsupported format.

use std::io::Read;

use quick_xml::events::Event;
use thiserror::Error;

use crate::models::Locator;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Why a byte payload could not be turned into text.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("content is not valid UTF-8 text")]
    NotText,
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),
}

/// A run of extracted text with its location in the source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub locator: Option<Locator>,
    pub text: String,
}

impl Segment {
    fn new(locator: Option<Locator>, text: impl Into<String>) -> Self {
        Self {
            locator,
            text: text.into(),
        }
    }
}

/// Resolve the content type of an upload from its file extension, falling
/// back to the type declared by the client.
pub fn detect_content_type(filename: &str, declared: Option<&str>) -> String {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let by_ext = match ext.as_str() {
        "pdf" => Some(MIME_PDF),
        "docx" => Some(MIME_DOCX),
        "pptx" => Some(MIME_PPTX),
        "xlsx" => Some(MIME_XLSX),
        "md" | "markdown" => Some(MIME_MARKDOWN),
        "txt" | "text" => Some(MIME_TEXT),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    };

    if let Some(ct) = by_ext {
        return ct.to_string();
    }

    match declared.map(|d| d.split(';').next().unwrap_or(d).trim()) {
        Some(d) if !d.is_empty() => d.to_ascii_lowercase(),
        _ => MIME_OCTET_STREAM.to_string(),
    }
}

/// Extract located text segments from `bytes`.
///
/// Unknown content types are accepted when the bytes are UTF-8 text.
pub fn extract_segments(bytes: &[u8], content_type: &str) -> Result<Vec<Segment>, ExtractError> {
    match content_type {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_PPTX => extract_pptx(bytes),
        MIME_XLSX => extract_xlsx(bytes),
        MIME_MARKDOWN => Ok(split_markdown(decode_utf8(bytes)?)),
        ct if ct.starts_with("image/") => Err(ExtractError::UnsupportedContentType(format!(
            "{} (image text recognition is not available)",
            ct
        ))),
        _ => Ok(vec![Segment::new(None, decode_utf8(bytes)?)]),
    }
}

/// Decode bytes as text; NUL bytes mark binary content even when the
/// sequence happens to be valid UTF-8.
fn decode_utf8(bytes: &[u8]) -> Result<&str, ExtractError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ExtractError::NotText)?;
    if text.contains('\0') {
        return Err(ExtractError::NotText);
    }
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

fn extract_pdf(bytes: &[u8]) -> Result<Vec<Segment>, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;

    // Pages are separated by form feeds when the producer emits them.
    if !text.contains('\u{c}') {
        return Ok(vec![Segment::new(None, text)]);
    }
    Ok(text
        .split('\u{c}')
        .enumerate()
        .map(|(i, page)| Segment::new(Some(Locator::Page(i as u32 + 1)), page))
        .collect())
}

/// Split Markdown on ATX headings; each section is located by its heading.
fn split_markdown(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut heading: Option<String> = None;
    let mut body = String::new();

    for line in text.lines() {
        let trimmed = line.trim_start();
        let is_heading = trimmed.starts_with('#')
            && trimmed
                .trim_start_matches('#')
                .starts_with(|c: char| c.is_whitespace());
        if is_heading {
            if !body.trim().is_empty() {
                segments.push(Segment::new(
                    heading.clone().map(Locator::Section),
                    body.clone(),
                ));
            }
            body.clear();
            let title = trimmed.trim_start_matches('#').trim();
            heading = Some(title.to_string());
            // The heading text is part of the section's content.
            body.push_str(title);
            body.push_str(".\n");
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }
    if !body.trim().is_empty() {
        segments.push(Segment::new(heading.map(Locator::Section), body));
    }
    segments
}

fn open_zip(bytes: &[u8]) -> Result<zip::ZipArchive<std::io::Cursor<&[u8]>>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Sorted entry names `"<prefix><n>.xml"` with their numeric index.
fn numbered_entries(
    archive: &zip::ZipArchive<std::io::Cursor<&[u8]>>,
    prefix: &str,
) -> Vec<(u32, String)> {
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|n| {
            let num = n.strip_prefix(prefix)?.strip_suffix(".xml")?.parse().ok()?;
            Some((num, n.to_string()))
        })
        .collect();
    names.sort();
    names
}

fn extract_docx(bytes: &[u8]) -> Result<Vec<Segment>, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    Ok(vec![Segment::new(None, extract_text_runs(&xml)?)])
}

fn extract_pptx(bytes: &[u8]) -> Result<Vec<Segment>, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let mut segments = Vec::new();
    for (num, name) in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        segments.push(Segment::new(
            Some(Locator::Slide(num)),
            extract_text_runs(&xml)?,
        ));
    }
    Ok(segments)
}

/// Collect `<*:t>` run text, ending each `<*:p>` paragraph with a newline.
/// Works for both WordprocessingML (`w:`) and DrawingML (`a:`).
fn extract_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(Event::Text(te)) if in_t => {
                let text = te.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_t = false;
                } else if name.as_ref() == b"p" && !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_xlsx(bytes: &[u8]) -> Result<Vec<Segment>, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };
    let mut segments = Vec::new();
    for (num, name) in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let cells = extract_sheet_cells(&xml, &shared_strings)?;
        segments.push(Segment::new(
            Some(Locator::Section(format!("sheet {}", num))),
            cells,
        ));
    }
    Ok(segments)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, ExtractError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    let text = te.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                    s.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one worksheet: shared strings resolved, inline strings
/// and numbers kept as written.
fn extract_sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut cell_is_shared_str = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    cell_is_shared_str = e.attributes().flatten().any(|a| {
                        a.key.local_name().as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?;
                let value = raw.trim();
                if cell_is_shared_str {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => cell_is_shared_str = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, body) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn content_type_from_extension_wins() {
        assert_eq!(detect_content_type("Notes.PDF", Some("text/plain")), MIME_PDF);
        assert_eq!(detect_content_type("a.md", None), MIME_MARKDOWN);
        assert_eq!(detect_content_type("scan.jpeg", None), "image/jpeg");
    }

    #[test]
    fn content_type_falls_back_to_declared() {
        assert_eq!(
            detect_content_type("README", Some("text/plain; charset=utf-8")),
            "text/plain"
        );
        assert_eq!(detect_content_type("blob", None), MIME_OCTET_STREAM);
    }

    #[test]
    fn images_are_unsupported() {
        let err = extract_segments(b"\x89PNG", "image/png").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn binary_bytes_are_not_text() {
        let err = extract_segments(&[0xff, 0xfe, 0x00, 0x81], MIME_OCTET_STREAM).unwrap_err();
        assert!(matches!(err, ExtractError::NotText));
        let err = extract_segments(b"abc\0def", MIME_TEXT).unwrap_err();
        assert!(matches!(err, ExtractError::NotText));
    }

    #[test]
    fn plain_text_is_one_unlocated_segment() {
        let segs = extract_segments("\u{feff}Hello notes.".as_bytes(), MIME_TEXT).unwrap();
        assert_eq!(segs, vec![Segment::new(None, "Hello notes.")]);
    }

    #[test]
    fn markdown_splits_on_headings() {
        let md = "Intro line.\n\n# Cells\nCells are small.\n\n## Mitochondria\nPowerhouse.\n";
        let segs = extract_segments(md.as_bytes(), MIME_MARKDOWN).unwrap();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[0].locator, None);
        assert_eq!(segs[1].locator, Some(Locator::Section("Cells".into())));
        assert!(segs[1].text.contains("Cells are small."));
        assert_eq!(
            segs[2].locator,
            Some(Locator::Section("Mitochondria".into()))
        );
    }

    #[test]
    fn hashtag_is_not_a_heading() {
        let segs = split_markdown("#hashtag text\n");
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].locator, None);
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_segments(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_segments(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Ooxml(_)));
    }

    #[test]
    fn docx_paragraphs_become_lines() {
        let xml = r#"<?xml version="1.0"?><w:document xmlns:w="w"><w:body><w:p><w:r><w:t>Photo</w:t></w:r><w:r><w:t>synthesis.</w:t></w:r></w:p><w:p><w:r><w:t>Second &amp; last.</w:t></w:r></w:p></w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", xml)]);
        let segs = extract_segments(&bytes, MIME_DOCX).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].text, "Photosynthesis.\nSecond & last.\n");
    }

    #[test]
    fn pptx_slides_are_located_in_order() {
        let slide = |t: &str| {
            format!(r#"<p:sld xmlns:p="p" xmlns:a="a"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>"#, t)
        };
        let s1 = slide("First slide");
        let s10 = slide("Tenth slide");
        let s2 = slide("Second slide");
        let bytes = zip_with(&[
            ("ppt/slides/slide10.xml", s10.as_str()),
            ("ppt/slides/slide1.xml", s1.as_str()),
            ("ppt/slides/slide2.xml", s2.as_str()),
        ]);
        let segs = extract_segments(&bytes, MIME_PPTX).unwrap();
        let locs: Vec<_> = segs.iter().map(|s| s.locator.clone()).collect();
        assert_eq!(
            locs,
            vec![
                Some(Locator::Slide(1)),
                Some(Locator::Slide(2)),
                Some(Locator::Slide(10))
            ]
        );
        assert!(segs[2].text.contains("Tenth slide"));
    }

    #[test]
    fn xlsx_resolves_shared_strings() {
        let shared = r#"<sst xmlns="x"><si><t>Osmosis</t></si><si><t>Diffusion</t></si></sst>"#;
        let sheet = r#"<worksheet xmlns="x"><sheetData><row><c r="A1" t="s"><v>1</v></c><c r="B1"><v>42</v></c></row></sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let segs = extract_segments(&bytes, MIME_XLSX).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].text, "Diffusion 42");
        assert_eq!(segs[0].locator, Some(Locator::Section("sheet 1".into())));
    }
}
