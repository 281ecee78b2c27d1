//! Extension-based dispatch to the engine that understands a given file.
//!
//! Every engine converts its own internal failures into a `Finding` with
//! `ThreatKind::ScanError` rather than propagating an error -- one corrupt
//! file never aborts a scan.

pub mod dataset;
pub mod dependency;
pub mod document;
pub mod keras;
pub mod notebook;
pub mod pickle;

use std::path::Path;

use crate::config::WardenConfig;
use crate::pipeline::{CancelToken, Finding};
use crate::signatures::SignatureStore;

const PICKLE_EXTS: &[&str] = &["pt", "pth", "bin", "pkl", "ckpt"];
const KERAS_EXTS: &[&str] = &["h5", "keras"];
const NOTEBOOK_EXTS: &[&str] = &["ipynb"];
const DOCUMENT_EXTS: &[&str] = &[
    "txt", "md", "rst", "json", "yaml", "yml", "toml", "csv", "html", "htm", "xml", "py", "js",
    "pdf", "docx", "pptx",
];
const DATASET_EXTS: &[&str] = &["parquet", "jsonl"];
const DEPENDENCY_FILES: &[&str] = &["requirements.txt", "pyproject.toml"];

pub fn dispatch(
    path: &Path,
    config: &WardenConfig,
    signatures: &SignatureStore,
    cancel: &CancelToken,
) -> Vec<Finding> {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

    if DEPENDENCY_FILES.contains(&file_name) {
        return dependency::scan(path, signatures);
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    // dataset_engine's own CSV dispatch overlaps with document_engine's
    // generic text scan; tabular files get the row/column-aware scanner.
    if ext == "csv" || DATASET_EXTS.contains(&ext.as_str()) {
        return dataset::scan(path, signatures, false, cancel);
    }

    if PICKLE_EXTS.contains(&ext.as_str()) {
        return pickle::scan(path, config, signatures, cancel);
    }

    if KERAS_EXTS.contains(&ext.as_str()) {
        return keras::scan(path, signatures);
    }

    if NOTEBOOK_EXTS.contains(&ext.as_str()) {
        return notebook::scan(path, config, signatures, cancel);
    }

    if DOCUMENT_EXTS.contains(&ext.as_str()) {
        return document::scan(path, signatures, cancel);
    }

    Vec::new()
}
