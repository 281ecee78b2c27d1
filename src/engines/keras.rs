//! Keras model scanner, covering both packaging formats in the wild:
//! legacy HDF5 checkpoints and the zip-packaged Keras v3 format.
//!
//! Logic mirrors the approach used by ModelScan: a `Lambda` layer embeds an
//! arbitrary serialized Python callable and is always flagged; `Model`,
//! `Functional`, and `Sequential` layers nest their own layer graph and are
//! walked recursively, bounded to prevent a crafted config from recursing
//! forever.

use std::io::Read;
use std::path::Path;

use serde_json::Value;

use crate::pipeline::{Finding, Severity, ThreatKind};
use crate::signatures::SignatureStore;

const HDF5_MAGIC: [u8; 8] = [0x89, 0x48, 0x44, 0x46, 0x0d, 0x0a, 0x1a, 0x0a];
const MAX_DEPTH: usize = 64;
const CONTAINER_CLASSES: &[&str] = &["Model", "Functional", "Sequential"];

pub fn scan(path: &Path, _signatures: &SignatureStore) -> Vec<Finding> {
    let mut header = [0u8; 8];
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            return vec![Finding::new(
                path,
                "keras-read-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not open file: {e}"),
            )]
        }
    };
    let read = file.read(&mut header).unwrap_or(0);

    if read >= 2 && &header[0..2] == b"PK" {
        return scan_zip(path);
    }

    if read == 8 && header == HDF5_MAGIC {
        return scan_hdf5(path);
    }

    vec![Finding::new(
        path,
        "keras-unrecognized-container",
        Severity::Warning,
        ThreatKind::UnknownFile,
        "file is neither a zip nor an HDF5 container",
    )]
}

fn scan_hdf5(path: &Path) -> Vec<Finding> {
    // No HDF5-reading capability is linked into this build; a checkpoint in
    // this format is flagged for manual review rather than silently passed.
    vec![Finding::new(
        path,
        "hdf5-unavailable",
        Severity::Warning,
        ThreatKind::UnknownFile,
        "HDF5 container detected but cannot be inspected in this build",
    )]
}

fn scan_zip(path: &Path) -> Vec<Finding> {
    let content = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) => {
            return vec![Finding::new(
                path,
                "keras-read-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not read file: {e}"),
            )]
        }
    };

    let reader = std::io::Cursor::new(&content);
    let mut archive = match zip::ZipArchive::new(reader) {
        Ok(a) => a,
        Err(e) => {
            return vec![Finding::new(
                path,
                "keras-zip-error",
                Severity::Warning,
                ThreatKind::ScanError,
                format!("could not open zip container: {e}"),
            )]
        }
    };

    let mut config_text = String::new();
    let found = match archive.by_name("config.json") {
        Ok(mut f) => f.read_to_string(&mut config_text).is_ok(),
        Err(_) => false,
    };

    if !found {
        return vec![Finding::new(
            path,
            "keras-zip-no-config",
            Severity::Warning,
            ThreatKind::UnknownFile,
            "zip container has no config.json member",
        )];
    }

    let config: Value = match serde_json::from_str(&config_text) {
        Ok(v) => v,
        Err(e) => {
            return vec![Finding::new(
                path,
                "keras-config-parse-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("config.json is not valid JSON: {e}"),
            )]
        }
    };

    let mut findings = Vec::new();
    analyze_model_config(path, &config, 0, &mut findings);
    findings
}

fn analyze_model_config(path: &Path, config: &Value, depth: usize, findings: &mut Vec<Finding>) {
    if depth > MAX_DEPTH {
        findings.push(Finding::new(
            path,
            "keras-recursion-bound",
            Severity::Medium,
            ThreatKind::ScanError,
            "model config graph nesting exceeded the depth limit",
        ));
        return;
    }

    // The layer list lives either at `config.layers` or, one level up, at
    // `config.config.layers` depending on whether this node is itself a
    // wrapped model entry.
    let inner = config.get("config").unwrap_or(config);
    let layers = match inner.get("layers").and_then(Value::as_array) {
        Some(l) => l,
        None => return,
    };

    for layer in layers {
        let class_name = layer
            .get("class_name")
            .and_then(Value::as_str)
            .unwrap_or("");

        if class_name == "Lambda" {
            let layer_name = layer
                .get("config")
                .and_then(|c| c.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("unnamed");
            findings.push(Finding::new(
                path,
                "keras-lambda-layer",
                Severity::Critical,
                ThreatKind::UnsafeReference,
                format!("Lambda layer '{layer_name}' embeds an arbitrary serialized callable"),
            ));
        } else if CONTAINER_CLASSES.contains(&class_name) {
            analyze_model_config(path, layer, depth + 1, findings);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_keras_v3(dir: &tempfile::TempDir, config_json: &str) -> std::path::PathBuf {
        let path = dir.path().join("model.keras");
        let zip_file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(zip_file);
        writer
            .start_file("config.json", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(config_json.as_bytes()).unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn lambda_layer_in_zip_is_flagged_critical() {
        let config = serde_json::json!({
            "class_name": "Sequential",
            "config": {
                "layers": [
                    {"class_name": "Dense", "config": {"name": "dense_1"}},
                    {"class_name": "Lambda", "config": {"name": "evil_lambda"}},
                ]
            }
        });
        let dir = tempfile::tempdir().unwrap();
        let path = write_keras_v3(&dir, &config.to_string());
        let signatures = SignatureStore::load_or_default(Path::new("/nonexistent")).unwrap();
        let findings = scan(&path, &signatures);

        assert!(findings
            .iter()
            .any(|f| f.rule == "keras-lambda-layer" && f.severity == Severity::Critical));
    }

    #[test]
    fn sequential_without_lambda_is_clean() {
        let config = serde_json::json!({
            "class_name": "Sequential",
            "config": {
                "layers": [
                    {"class_name": "Dense", "config": {"name": "dense_1"}},
                    {"class_name": "Dropout", "config": {"name": "dropout_1"}},
                ]
            }
        });
        let dir = tempfile::tempdir().unwrap();
        let path = write_keras_v3(&dir, &config.to_string());
        let signatures = SignatureStore::load_or_default(Path::new("/nonexistent")).unwrap();
        let findings = scan(&path, &signatures);

        assert!(findings.is_empty());
    }
}
