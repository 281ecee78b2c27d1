//! Runtime configuration.
//!
//! Precedence: environment variables > `warden.yaml` in the current
//! directory > hardcoded defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::WardenError;
use crate::pipeline::Severity;

const DEFAULT_CONFIG_PATH: &str = "warden.yaml";

/// Output rendering selected for the `scan` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Table,
    Json,
    Sarif,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "sarif" => Ok(OutputFormat::Sarif),
            other => Err(format!("unknown output format '{other}'")),
        }
    }
}

/// File-level representation of `warden.yaml`; every field is optional so a
/// partial file only overrides what it names.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    allowed_modules: Option<Vec<String>>,
    ignored_rules: Option<Vec<String>>,
    fail_on_severity: Option<String>,
    hf_token: Option<String>,
    private_key_path: Option<String>,
    output_format: Option<String>,
    strict_pickle: Option<bool>,
}

/// Fully resolved runtime configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    /// Extends the pickle/notebook engines' module whitelist.
    pub allowed_modules: HashSet<String>,
    /// Rule IDs filtered out of the final findings list post-scan.
    pub ignored_rules: HashSet<String>,
    /// Minimum severity that blocks the global verdict.
    pub fail_on_severity: Severity,
    /// Bearer token for the upstream model registry.
    pub hf_token: Option<String>,
    /// Path to the private key used by the signing helper.
    pub private_key_path: Option<String>,
    /// Default rendering for the `scan` command.
    pub output_format: OutputFormat,
    /// When set, the pickle engine flags every non-whitelisted module
    /// reference at MEDIUM instead of only ones on the severity map.
    pub strict_pickle: bool,
}

impl Default for WardenConfig {
    fn default() -> Self {
        WardenConfig {
            allowed_modules: HashSet::new(),
            ignored_rules: HashSet::new(),
            fail_on_severity: Severity::Critical,
            hf_token: None,
            private_key_path: None,
            output_format: OutputFormat::Table,
            strict_pickle: false,
        }
    }
}

impl WardenConfig {
    /// Load configuration from `warden.yaml` (if present) and the
    /// environment, layered over the defaults.
    pub fn load() -> Result<Self, WardenError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    pub fn load_from(path: &Path) -> Result<Self, WardenError> {
        let mut cfg = WardenConfig::default();

        if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| WardenError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let file: ConfigFile =
                serde_yaml::from_str(&raw).map_err(|source| WardenError::ConfigParse {
                    path: path.to_path_buf(),
                    source,
                })?;
            tracing::info!(path = %path.display(), "loaded configuration file");
            apply_file(&mut cfg, file);
        }

        apply_env(&mut cfg);

        Ok(cfg)
    }
}

fn apply_file(cfg: &mut WardenConfig, file: ConfigFile) {
    if let Some(modules) = file.allowed_modules {
        cfg.allowed_modules.extend(modules);
    }
    if let Some(rules) = file.ignored_rules {
        cfg.ignored_rules.extend(rules);
    }
    if let Some(sev) = file.fail_on_severity.and_then(|s| Severity::parse(&s)) {
        cfg.fail_on_severity = sev;
    }
    if let Some(token) = file.hf_token {
        cfg.hf_token = Some(token);
    }
    if let Some(key) = file.private_key_path {
        cfg.private_key_path = Some(key);
    }
    if let Some(fmt) = file.output_format.and_then(|f| f.parse().ok()) {
        cfg.output_format = fmt;
    }
    if let Some(strict) = file.strict_pickle {
        cfg.strict_pickle = strict;
    }
}

fn apply_env(cfg: &mut WardenConfig) {
    if let Ok(token) = std::env::var("AEGIS_HF_TOKEN").or_else(|_| std::env::var("HF_TOKEN")) {
        cfg.hf_token = Some(token);
    }
    if let Ok(key) = std::env::var("AEGIS_PRIVATE_KEY_PATH") {
        cfg.private_key_path = Some(key);
    }
    if let Ok(sev) = std::env::var("AEGIS_FAIL_ON") {
        if let Some(parsed) = Severity::parse(&sev) {
            cfg.fail_on_severity = parsed;
        } else {
            tracing::warn!(value = %sev, "AEGIS_FAIL_ON not a recognized severity, ignoring");
        }
    }
    if let Ok(strict) = std::env::var("AEGIS_STRICT_PICKLE") {
        cfg.strict_pickle = strict == "1" || strict.eq_ignore_ascii_case("true");
    }
}

/// Path to the user-home signature file, written by `warden update`.
pub fn home_signature_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
        .join("signatures.yaml")
}

/// Path to the embedded hash-cache database.
pub fn home_cache_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".warden")
        .join("cache.db")
}
