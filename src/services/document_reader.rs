// Document Reader
// Plain text extraction from .txt / .docx / .pdf inputs

use docx_rs::{DocumentChild, ParagraphChild, RunChild};
use regex::Regex;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{info, warn};
use zip::ZipArchive;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("DOCX parse error: {0}")]
    Docx(String),
    #[error("PDF extraction error: {0}")]
    Pdf(String),
}

fn xml_paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<w:p[ >].*?</w:p>").expect("paragraph regex"))
}

fn xml_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<w:t(?:\s[^>]*)?>([^<]*)</w:t>").expect("text run regex"))
}

/// Read a file from disk and extract its text by extension.
pub fn read_document(path: &Path) -> Result<String, DocumentError> {
    let bytes = std::fs::read(path)?;
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    decode_document(&name, &bytes)
}

/// Extract text from in-memory bytes; unknown extensions decode as UTF-8.
pub fn decode_document(file_name: &str, bytes: &[u8]) -> Result<String, DocumentError> {
    let lower = file_name.to_lowercase();
    let text = if lower.ends_with(".docx") {
        extract_docx_text(bytes)?
    } else if lower.ends_with(".pdf") {
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| DocumentError::Pdf(e.to_string()))?
    } else {
        decode_text(bytes)
    };
    info!(
        "[DOCUMENT] {} extracted {} chars from {} bytes",
        file_name,
        text.chars().count(),
        bytes.len()
    );
    Ok(text)
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.trim_start_matches('\u{feff}').to_string(),
        Err(_) => {
            warn!("[DOCUMENT] Input is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// One line per paragraph. Falls back to scanning `word/document.xml`
/// when the structured reader rejects the file.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String, DocumentError> {
    match docx_rs::read_docx(bytes) {
        Ok(docx) => {
            let paragraphs: Vec<String> = docx
                .document
                .children
                .iter()
                .filter_map(|child| match child {
                    DocumentChild::Paragraph(p) => Some(
                        p.children
                            .iter()
                            .filter_map(|pc| match pc {
                                ParagraphChild::Run(run) => Some(run_text(&run.children)),
                                _ => None,
                            })
                            .collect::<String>(),
                    ),
                    _ => None,
                })
                .collect();
            Ok(paragraphs.join("\n"))
        }
        Err(e) => {
            warn!("[DOCUMENT] docx reader failed ({}), scanning raw XML", e);
            extract_docx_xml(bytes).map_err(|fallback| DocumentError::Docx(format!("{}; raw XML: {}", e, fallback)))
        }
    }
}

fn run_text(children: &[RunChild]) -> String {
    let mut out = String::new();
    for child in children {
        match child {
            RunChild::Text(t) => out.push_str(&t.text),
            RunChild::Tab(_) => out.push('\t'),
            _ => {}
        }
    }
    out
}

fn extract_docx_xml(bytes: &[u8]) -> Result<String, DocumentError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut xml = String::new();
    archive.by_name("word/document.xml")?.read_to_string(&mut xml)?;
    Ok(paragraphs_from_xml(&xml).join("\n"))
}

fn paragraphs_from_xml(xml: &str) -> Vec<String> {
    xml_paragraph_re()
        .find_iter(xml)
        .map(|p| {
            xml_text_re()
                .captures_iter(p.as_str())
                .filter_map(|c| c.get(1))
                .map(|m| unescape_xml(m.as_str()))
                .collect::<String>()
        })
        .collect()
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// `zh-CN` when more than 30% of non-whitespace chars are CJK ideographs.
pub fn guess_language(text: &str) -> &'static str {
    let cjk = text.chars().filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c)).count();
    let total = text.chars().filter(|c| !c.is_whitespace()).count();
    if total > 0 && cjk as f64 / total as f64 > 0.3 {
        "zh-CN"
    } else {
        "en"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_zip(document_xml: &str) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let opts = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", opts).unwrap();
            zip.write_all(document_xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_decode_plain_text() {
        let text = decode_document("a.txt", "\u{feff}你好，世界".as_bytes()).unwrap();
        assert_eq!(text, "你好，世界");
        let lossy = decode_document("b.txt", &[b'o', b'k', 0xff]).unwrap();
        assert!(lossy.starts_with("ok"));
    }

    #[test]
    fn test_paragraphs_from_xml() {
        let xml = r#"<w:body><w:p><w:r><w:t>Tom &amp; Jerry</w:t></w:r></w:p><w:p w:rsidR="1"><w:r><w:t xml:space="preserve">第二</w:t></w:r><w:r><w:t>段</w:t></w:r></w:p></w:body>"#;
        assert_eq!(paragraphs_from_xml(xml), vec!["Tom & Jerry".to_string(), "第二段".to_string()]);
    }

    #[test]
    fn test_docx_xml_fallback() {
        let bytes = docx_zip(r#"<w:document><w:body><w:p><w:r><w:t>hello</w:t></w:r></w:p></w:body></w:document>"#);
        assert_eq!(extract_docx_xml(&bytes).unwrap(), "hello");
        assert!(matches!(extract_docx_xml(b"not a zip"), Err(DocumentError::Zip(_))));
    }

    #[test]
    fn test_guess_language() {
        assert_eq!(guess_language("这是一个中文句子。"), "zh-CN");
        assert_eq!(guess_language("An English sentence."), "en");
        assert_eq!(guess_language(""), "en");
    }
}
