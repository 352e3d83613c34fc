//! Builtin text extraction for the recognized formats.
//!
//! Produces Markdown-flavoured plain text: paragraphs for Word documents,
//! one `## Slide N` section per slide, one `## Sheet N` section per worksheet
//! with ` | `-separated rows. Text formats pass through; JSON is
//! pretty-printed; XML and HTML are reduced to their text content.

use std::io::Read;

use crate::error::ConvertError;
use crate::models::Format;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet.
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

/// Extracts normalized text from the raw bytes of a document.
pub fn extract_text(bytes: &[u8], format: Format) -> Result<String, ConvertError> {
    match format {
        Format::Pdf => extract_pdf(bytes),
        Format::Docx => extract_docx(bytes),
        Format::Pptx => extract_pptx(bytes),
        Format::Xlsx => extract_xlsx(bytes),
        Format::Json => extract_json(bytes),
        Format::Xml => extract_xml(bytes),
        Format::Html => Ok(extract_html(&decode_utf8(bytes)?)),
        Format::Csv | Format::Markdown | Format::Text => decode_utf8(bytes),
    }
}

fn corrupt(e: impl std::fmt::Display) -> ConvertError {
    ConvertError::CorruptFile(e.to_string())
}

fn decode_utf8(bytes: &[u8]) -> Result<String, ConvertError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ConvertError::CorruptFile(format!("not valid UTF-8: {}", e)))
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ConvertError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| corrupt(format!("PDF: {}", e)))
}

/// Compound File (OLE2) header. Encrypted OOXML and legacy `.doc`/`.xls`/
/// `.ppt` files use it instead of a ZIP container.
const OLE2_MAGIC: &[u8] = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1";

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ConvertError> {
    if bytes.starts_with(OLE2_MAGIC) {
        return Err(ConvertError::UnsupportedFormat(
            "encrypted or legacy binary Office file".to_string(),
        ));
    }
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| corrupt(format!("ZIP: {}", e)))
}

fn read_zip_entry_bounded(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ConvertError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| corrupt(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(corrupt)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(corrupt(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Sorted `prefix<N>.xml` entry names, numeric order.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_docx(bytes: &[u8]) -> Result<String, ConvertError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    paragraphs(&xml, b"p")
}

/// Collects `<t>` text, emitting one line per `paragraph_tag` element.
fn paragraphs(xml: &[u8], paragraph_tag: &[u8]) -> Result<String, ConvertError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                current.push_str(&te.unescape().map_err(corrupt)?);
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == paragraph_tag {
                    let line = current.trim();
                    if !line.is_empty() {
                        lines.push(line.to_string());
                    }
                    current.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(e)),
            _ => {}
        }
        buf.clear();
    }

    let tail = current.trim();
    if !tail.is_empty() {
        lines.push(tail.to_string());
    }
    Ok(lines.join("\n\n"))
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ConvertError> {
    let mut archive = open_archive(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");
    if slides.is_empty() {
        return Err(corrupt("no slides found"));
    }

    let mut sections = Vec::new();
    for (i, name) in slides.iter().enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, name)?;
        let text = paragraphs(&xml, b"p")?;
        sections.push(format!("## Slide {}\n\n{}", i + 1, text));
    }
    Ok(sections.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ConvertError> {
    let mut archive = open_archive(bytes)?;
    let shared_strings = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        read_shared_strings(&mut archive)?
    } else {
        Vec::new()
    };

    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");
    if sheets.is_empty() {
        return Err(corrupt("no worksheets found"));
    }

    let mut sections = Vec::new();
    for (i, name) in sheets.iter().take(XLSX_MAX_SHEETS).enumerate() {
        let xml = read_zip_entry_bounded(&mut archive, name)?;
        let rows = sheet_rows(&xml, &shared_strings)?;
        sections.push(format!("## Sheet {}\n\n{}", i + 1, rows.join("\n")));
    }
    Ok(sections.join("\n\n"))
}

fn read_shared_strings(archive: &mut Archive<'_>) -> Result<Vec<String>, ConvertError> {
    use quick_xml::events::Event;

    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml")?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => current.push_str(&te.unescape().map_err(corrupt)?),
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// One ` | `-joined line per non-empty row. Shared-string cells are
/// resolved; numeric and inline cells are kept verbatim.
fn sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<String>, ConvertError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    let mut cells = 0usize;

    loop {
        if cells >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().map_err(corrupt)?;
                let value = raw.trim();
                if !value.is_empty() {
                    let text = if shared {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared_strings.get(i))
                            .cloned()
                            .unwrap_or_default()
                    } else {
                        value.to_string()
                    };
                    if !text.is_empty() {
                        row.push(text);
                        cells += 1;
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared = false,
                b"row" => {
                    if !row.is_empty() {
                        rows.push(row.join(" | "));
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(e)),
            _ => {}
        }
        buf.clear();
    }

    if !row.is_empty() {
        rows.push(row.join(" | "));
    }
    Ok(rows)
}

fn extract_json(bytes: &[u8]) -> Result<String, ConvertError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| corrupt(format!("JSON: {}", e)))?;
    let pretty = serde_json::to_string_pretty(&value).map_err(corrupt)?;
    Ok(format!("```json\n{}\n```", pretty))
}

fn extract_xml(bytes: &[u8]) -> Result<String, ConvertError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(bytes);
    let mut buf = Vec::new();
    let mut parts = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(te)) => {
                let text = te.unescape().map_err(corrupt)?;
                let text = text.trim();
                if !text.is_empty() {
                    parts.push(text.to_string());
                }
            }
            Ok(Event::CData(cd)) => {
                let text = String::from_utf8_lossy(&cd.into_inner()).trim().to_string();
                if !text.is_empty() {
                    parts.push(text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(corrupt(format!("XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(parts.join("\n"))
}

/// Lenient HTML-to-text: drops tags, `<script>`/`<style>` bodies and
/// comments, decodes the common entities, and collapses blank runs.
fn extract_html(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len() / 2);
    let mut i = 0;

    while i < html.len() {
        let rest = &lower[i..];
        if rest.starts_with("<!--") {
            i += rest.find("-->").map(|p| p + 3).unwrap_or(rest.len());
        } else if rest.starts_with("<script") || rest.starts_with("<style") {
            let close = if rest.starts_with("<script") {
                "</script>"
            } else {
                "</style>"
            };
            i += rest
                .find(close)
                .map(|p| p + close.len())
                .unwrap_or(rest.len());
        } else if rest.starts_with('<') {
            let end = rest.find('>').map(|p| p + 1).unwrap_or(rest.len());
            let tag = &rest[..end];
            if is_block_tag(tag) {
                out.push('\n');
            }
            i += end;
        } else {
            let next = rest.find('<').unwrap_or(rest.len());
            out.push_str(&html[i..i + next]);
            i += next;
        }
    }

    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    decoded
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_block_tag(tag: &str) -> bool {
    const BLOCK: [&str; 12] = [
        "p", "br", "div", "li", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "table",
    ];
    let name: String = tag
        .trim_start_matches('<')
        .trim_start_matches('/')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    BLOCK.contains(&name.as_str())
}
