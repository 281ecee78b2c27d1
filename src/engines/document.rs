//! Document / RAG-corpus scanner.
//!
//! Plain text is streamed through a sliding window so an arbitrarily large
//! file never needs to be held in memory at once. Structured formats
//! (PDF, DOCX, PPTX) go through their own bounded extraction before the
//! same line-oriented match loop runs over the extracted text.
//!
//! Prompt-injection patterns are checked first; on a hit the scan stops
//! there. Otherwise the same chunk is matched against the secret/PII set,
//! and a hit there stops the scan too -- unlike the dataset engine, this
//! one never keeps collecting after its first match.

use std::io::Read;
use std::path::Path;

use crate::pipeline::{CancelToken, Finding, Severity, ThreatKind};
use crate::signatures::SignatureStore;

const WINDOW_SIZE: usize = 1024 * 1024;
const WINDOW_OVERLAP: usize = 4 * 1024;
const LINE_TRUNCATE: usize = 4096;
const PDF_PAGE_CAP: usize = 50;
const PARAGRAPH_CAP: usize = 2000;

pub fn scan(path: &Path, signatures: &SignatureStore, cancel: &CancelToken) -> Vec<Finding> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => scan_pdf(path, signatures, cancel),
        "docx" | "pptx" => scan_office_xml(path, signatures, &ext, cancel),
        _ => scan_text_file(path, signatures, cancel),
    }
}

fn scan_text_file(path: &Path, signatures: &SignatureStore, cancel: &CancelToken) -> Vec<Finding> {
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            return vec![Finding::new(
                path,
                "document-read-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not open file: {e}"),
            )]
        }
    };

    let mut findings = Vec::new();
    let mut buf = vec![0u8; WINDOW_SIZE];
    let mut carry = String::new();
    let mut line_base = 1usize;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let read = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                findings.push(Finding::new(
                    path,
                    "document-read-error",
                    Severity::High,
                    ThreatKind::ScanError,
                    format!("read failed mid-stream: {e}"),
                ));
                break;
            }
        };

        let chunk = String::from_utf8_lossy(&buf[..read]);
        carry.push_str(&chunk);

        let lines_in_window: Vec<&str> = carry.lines().collect();
        // Hold back the last partial-looking segment as overlap for the
        // next window unless this is the final read.
        let consume_upto = if read == WINDOW_SIZE {
            lines_in_window.len().saturating_sub(WINDOW_OVERLAP / 64)
        } else {
            lines_in_window.len()
        };

        let mut fail_fast = false;
        for (i, line) in lines_in_window.iter().enumerate().take(consume_upto) {
            let line_number = line_base + i;
            if scan_line(path, line_number, line, signatures, &mut findings) {
                fail_fast = true;
                break;
            }
        }

        if fail_fast {
            break;
        }

        line_base += consume_upto;
        carry = lines_in_window[consume_upto..].join("\n");

        if read < WINDOW_SIZE {
            break;
        }
    }

    findings
}

fn scan_pdf(path: &Path, signatures: &SignatureStore, cancel: &CancelToken) -> Vec<Finding> {
    let text = match pdf_extract::extract_text(path) {
        Ok(t) => t,
        Err(e) => {
            return vec![Finding::new(
                path,
                "pdf-extract-error",
                Severity::Warning,
                ThreatKind::ScanError,
                format!("could not extract PDF text: {e}"),
            )]
        }
    };

    let mut findings = Vec::new();
    // pdf-extract has no page-count API on the extracted string; approximate
    // the page cap via form-feed boundaries, which it emits between pages.
    let capped: String = text.split('\x0c').take(PDF_PAGE_CAP).collect::<Vec<_>>().join("\x0c");

    for (i, line) in capped.lines().enumerate() {
        if cancel.is_cancelled() || scan_line(path, i + 1, line, signatures, &mut findings) {
            break;
        }
    }
    findings
}

fn scan_office_xml(
    path: &Path,
    signatures: &SignatureStore,
    ext: &str,
    cancel: &CancelToken,
) -> Vec<Finding> {
    let content = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) => {
            return vec![Finding::new(
                path,
                "document-read-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not read file: {e}"),
            )]
        }
    };

    let reader = std::io::Cursor::new(content);
    let mut archive = match zip::ZipArchive::new(reader) {
        Ok(a) => a,
        Err(e) => {
            return vec![Finding::new(
                path,
                "document-zip-error",
                Severity::Warning,
                ThreatKind::ScanError,
                format!("could not open {ext} container: {e}"),
            )]
        }
    };

    let member_prefix = if ext == "docx" {
        "word/document.xml"
    } else {
        "ppt/slides/slide"
    };

    let mut text_runs: Vec<String> = Vec::new();
    for i in 0..archive.len() {
        if cancel.is_cancelled() {
            break;
        }
        let mut entry = match archive.by_index(i) {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.name().starts_with(member_prefix) {
            continue;
        }
        let mut xml = String::new();
        if entry.read_to_string(&mut xml).is_err() {
            continue;
        }
        text_runs.extend(extract_xml_text(&xml));
        if text_runs.len() >= PARAGRAPH_CAP {
            text_runs.truncate(PARAGRAPH_CAP);
            break;
        }
    }

    let mut findings = Vec::new();
    for (i, run) in text_runs.iter().enumerate() {
        if cancel.is_cancelled() || scan_line(path, i + 1, run, signatures, &mut findings) {
            break;
        }
    }
    findings
}

fn extract_xml_text(xml: &str) -> Vec<String> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut runs = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(e)) => {
                if let Ok(text) = e.unescape() {
                    if !text.trim().is_empty() {
                        runs.push(text.into_owned());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    runs
}

/// Returns true on the first injection or secret/PII match -- either one
/// ends the scan for this file.
fn scan_line(
    path: &Path,
    line_number: usize,
    line: &str,
    signatures: &SignatureStore,
    findings: &mut Vec<Finding>,
) -> bool {
    let truncated: &str = if line.len() > LINE_TRUNCATE {
        &line[..LINE_TRUNCATE]
    } else {
        line
    };

    for (pattern, rule) in signatures.prompt_injection_patterns() {
        if pattern.is_match(truncated) {
            findings.push(
                Finding::new(
                    path,
                    rule.clone(),
                    Severity::High,
                    ThreatKind::Injection,
                    "possible prompt injection",
                )
                .at_line(line_number),
            );
            return true;
        }
    }

    for (pattern, rule) in signatures.suspicious_string_patterns() {
        if pattern.is_match(truncated) {
            findings.push(
                Finding::new(
                    path,
                    rule.clone(),
                    Severity::Medium,
                    ThreatKind::Secret,
                    "possible leaked secret or PII",
                )
                .at_line(line_number),
            );
            return true;
        }
    }

    false
}
