//! Tabular dataset scanner: Parquet, CSV, and line-delimited JSON.
//!
//! String columns/fields are streamed in bounded batches and matched
//! against the same prompt-injection and secret/PII signatures the
//! document engine uses. Injection matches fail fast (HIGH, stop
//! scanning this file); secret/URL matches are collected without
//! short-circuiting. Scanning stops once `MAX_ROWS_DEFAULT` rows have
//! been inspected unless the caller asked for a full scan.

use std::fs::File;
use std::path::Path;

use arrow::array::Array;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::pipeline::{CancelToken, Finding, Severity, ThreatKind};
use crate::signatures::SignatureStore;

const MAX_ROWS_DEFAULT: usize = 10_000;
const PARQUET_BATCH_SIZE: usize = 1000;
const LINE_TRUNCATE: usize = 4096;

pub fn scan(
    path: &Path,
    signatures: &SignatureStore,
    full_scan: bool,
    cancel: &CancelToken,
) -> Vec<Finding> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "parquet" => scan_parquet(path, signatures, full_scan, cancel),
        "jsonl" => scan_jsonl(path, signatures, full_scan, cancel),
        _ => scan_csv(path, signatures, full_scan, cancel),
    }
}

fn row_limit(full_scan: bool) -> usize {
    if full_scan {
        usize::MAX
    } else {
        MAX_ROWS_DEFAULT
    }
}

fn scan_parquet(
    path: &Path,
    signatures: &SignatureStore,
    full_scan: bool,
    cancel: &CancelToken,
) -> Vec<Finding> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            return vec![Finding::new(
                path,
                "dataset-read-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not open file: {e}"),
            )]
        }
    };

    let builder = match ParquetRecordBatchReaderBuilder::try_new(file) {
        Ok(b) => b.with_batch_size(PARQUET_BATCH_SIZE),
        Err(e) => {
            return vec![Finding::new(
                path,
                "parquet-open-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not open parquet file: {e}"),
            )]
        }
    };

    let reader = match builder.build() {
        Ok(r) => r,
        Err(e) => {
            return vec![Finding::new(
                path,
                "parquet-reader-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not build parquet reader: {e}"),
            )]
        }
    };

    let mut findings = Vec::new();
    let mut rows_seen = 0usize;
    let limit = row_limit(full_scan);

    for batch_result in reader {
        if cancel.is_cancelled() {
            break;
        }
        let batch = match batch_result {
            Ok(b) => b,
            Err(e) => {
                findings.push(Finding::new(
                    path,
                    "parquet-batch-error",
                    Severity::Warning,
                    ThreatKind::ScanError,
                    format!("failed to read batch: {e}"),
                ));
                continue;
            }
        };

        for col in batch.columns() {
            if let Some(strings) = col.as_any().downcast_ref::<arrow::array::StringArray>() {
                for i in 0..strings.len() {
                    if rows_seen >= limit {
                        return findings;
                    }
                    rows_seen += 1;
                    if strings.is_null(i) {
                        continue;
                    }
                    if scan_value(path, rows_seen, strings.value(i), signatures, &mut findings) {
                        return findings;
                    }
                }
            } else if let Some(strings) = col
                .as_any()
                .downcast_ref::<arrow::array::LargeStringArray>()
            {
                for i in 0..strings.len() {
                    if rows_seen >= limit {
                        return findings;
                    }
                    rows_seen += 1;
                    if strings.is_null(i) {
                        continue;
                    }
                    if scan_value(path, rows_seen, strings.value(i), signatures, &mut findings) {
                        return findings;
                    }
                }
            }
        }
    }

    findings
}

fn scan_csv(
    path: &Path,
    signatures: &SignatureStore,
    full_scan: bool,
    cancel: &CancelToken,
) -> Vec<Finding> {
    let mut reader = match csv::ReaderBuilder::new().flexible(true).from_path(path) {
        Ok(r) => r,
        Err(e) => {
            return vec![Finding::new(
                path,
                "csv-open-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not open CSV file: {e}"),
            )]
        }
    };

    let mut findings = Vec::new();
    let limit = row_limit(full_scan);

    for (row_number, record) in reader.records().enumerate() {
        if row_number >= limit || cancel.is_cancelled() {
            break;
        }
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                findings.push(Finding::new(
                    path,
                    "csv-row-error",
                    Severity::Warning,
                    ThreatKind::ScanError,
                    format!("malformed row {row_number}: {e}"),
                ));
                continue;
            }
        };

        for field in record.iter() {
            if scan_value(path, row_number + 1, field, signatures, &mut findings) {
                return findings;
            }
        }
    }

    findings
}

fn scan_jsonl(
    path: &Path,
    signatures: &SignatureStore,
    full_scan: bool,
    cancel: &CancelToken,
) -> Vec<Finding> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            return vec![Finding::new(
                path,
                "jsonl-read-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not read file: {e}"),
            )]
        }
    };

    let mut findings = Vec::new();
    let limit = row_limit(full_scan);

    for (line_number, line) in content.lines().enumerate() {
        if line_number >= limit || cancel.is_cancelled() {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        let mut strings = Vec::new();
        extract_strings(&value, &mut strings);
        for s in strings {
            if scan_value(path, line_number + 1, &s, signatures, &mut findings) {
                return findings;
            }
        }
    }

    findings
}

fn extract_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => {
            for item in items {
                extract_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for v in map.values() {
                extract_strings(v, out);
            }
        }
        _ => {}
    }
}

/// Returns true when an injection match fired (signal to fail fast).
fn scan_value(
    path: &Path,
    row_number: usize,
    value: &str,
    signatures: &SignatureStore,
    findings: &mut Vec<Finding>,
) -> bool {
    let truncated = if value.len() > LINE_TRUNCATE {
        &value[..LINE_TRUNCATE]
    } else {
        value
    };

    for (pattern, rule) in signatures.prompt_injection_patterns() {
        if pattern.is_match(truncated) {
            findings.push(
                Finding::new(
                    path,
                    rule.clone(),
                    Severity::High,
                    ThreatKind::Injection,
                    "possible prompt injection in dataset row",
                )
                .at_line(row_number),
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
                    "possible leaked secret, PII, or URL in dataset row",
                )
                .at_line(row_number),
            );
        }
    }

    false
}
