//! Signature store: the YAML-defined knowledge base engines consult to turn
//! raw observations (an imported module, a regex match, a package name) into
//! a severity.
//!
//! Ships with sane embedded defaults so a fresh install scans usefully with
//! no network access; `warden update` refreshes `~/.warden/signatures.yaml`
//! from a remote feed.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::WardenError;
use crate::pipeline::Severity;

const WILDCARD: &str = "*";

/// Modules a strict-mode pickle scan never flags, even when they're absent
/// from the severity map -- the everyday numerical/ML stack a legitimate
/// checkpoint references via `__reduce__`.
const SCIENTIFIC_COMPUTING_MODULES: &[&str] = &[
    "numpy",
    "numpy.core.multiarray",
    "numpy.core.numeric",
    "torch",
    "torch._utils",
    "torch.storage",
    "torch.nn",
    "torch.nn.parameter",
    "tensorflow",
    "pandas",
    "scipy",
    "sklearn",
    "collections",
];

/// On-disk / wire shape of the signature feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureFile {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub unsafe_globals: UnsafeGlobals,
    #[serde(default)]
    pub prompt_injections: Vec<String>,
    #[serde(default)]
    pub suspicious_strings: Vec<String>,
    #[serde(default)]
    pub known_malicious: Vec<String>,
    #[serde(default)]
    pub popular_packages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsafeGlobals {
    #[serde(default)]
    pub critical: HashMap<String, String>,
    #[serde(default)]
    pub high: HashMap<String, String>,
    #[serde(default)]
    pub medium: HashMap<String, String>,
}

/// Compiled, query-ready form of a `SignatureFile`.
pub struct SignatureStore {
    globals: Vec<(String, String, Severity)>,
    prompt_injection: Vec<(Regex, String)>,
    suspicious_strings: Vec<(Regex, String)>,
    known_malicious: Vec<String>,
    popular_packages: Vec<String>,
}

impl SignatureStore {
    /// Load from `path` if it exists, otherwise fall back to the embedded
    /// defaults compiled into the binary.
    pub fn load_or_default(path: &Path) -> Result<Self, WardenError> {
        if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| WardenError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let file: SignatureFile =
                serde_yaml::from_str(&raw).map_err(|source| WardenError::SignatureParse {
                    path: path.to_path_buf(),
                    source,
                })?;
            tracing::info!(path = %path.display(), version = %file.version, "loaded signature file");
            Self::compile(file)
        } else {
            tracing::debug!("no signature file on disk, using embedded defaults");
            Self::compile(default_signature_file())
        }
    }

    fn compile(file: SignatureFile) -> Result<Self, WardenError> {
        let mut globals = Vec::new();
        for (severity, map) in [
            (Severity::Critical, &file.unsafe_globals.critical),
            (Severity::High, &file.unsafe_globals.high),
            (Severity::Medium, &file.unsafe_globals.medium),
        ] {
            for (module, attrs) in map {
                for attr in attrs.split(',').map(str::trim) {
                    globals.push((module.clone(), attr.to_string(), severity));
                }
            }
        }

        let prompt_injection = compile_patterns(&file.prompt_injections)?;
        let suspicious_strings = compile_patterns(&file.suspicious_strings)?;

        Ok(SignatureStore {
            globals,
            prompt_injection,
            suspicious_strings,
            known_malicious: file.known_malicious,
            popular_packages: file.popular_packages,
        })
    }

    /// Severity of importing/calling `module.attribute`, if any rule
    /// matches. A rule with attribute `"*"` matches any attribute of that
    /// module. Returns the highest matching severity.
    pub fn severity_of(&self, module: &str, attribute: &str) -> Option<Severity> {
        self.globals
            .iter()
            .filter(|(m, a, _)| m == module && (a == WILDCARD || a == attribute))
            .map(|(_, _, sev)| *sev)
            .max()
    }

    pub fn prompt_injection_patterns(&self) -> &[(Regex, String)] {
        &self.prompt_injection
    }

    pub fn suspicious_string_patterns(&self) -> &[(Regex, String)] {
        &self.suspicious_strings
    }

    pub fn is_known_malicious(&self, package: &str) -> bool {
        self.known_malicious
            .iter()
            .any(|p| p.eq_ignore_ascii_case(package))
    }

    pub fn popular_packages(&self) -> &[String] {
        &self.popular_packages
    }

    /// Whether `module` is on the scientific-computing whitelist consulted
    /// by the pickle engine's strict mode.
    pub fn is_scientific_module(&self, module: &str) -> bool {
        SCIENTIFIC_COMPUTING_MODULES.contains(&module)
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<(Regex, String)>, WardenError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map(|re| (re, p.clone()))
                .map_err(|source| WardenError::InvalidPattern {
                    pattern: p.clone(),
                    source,
                })
        })
        .collect()
}

fn default_signature_file() -> SignatureFile {
    let mut critical = HashMap::new();
    critical.insert("os".to_string(), WILDCARD.to_string());
    critical.insert("subprocess".to_string(), WILDCARD.to_string());
    critical.insert("builtins".to_string(), "eval,exec".to_string());
    critical.insert("nt".to_string(), WILDCARD.to_string());
    critical.insert("posix".to_string(), WILDCARD.to_string());
    critical.insert("pty".to_string(), WILDCARD.to_string());
    critical.insert("socket".to_string(), WILDCARD.to_string());

    let mut high = HashMap::new();
    high.insert("pickle".to_string(), WILDCARD.to_string());
    high.insert("shutil".to_string(), WILDCARD.to_string());
    high.insert("ctypes".to_string(), WILDCARD.to_string());
    high.insert("runpy".to_string(), WILDCARD.to_string());
    high.insert("importlib".to_string(), WILDCARD.to_string());

    let mut medium = HashMap::new();
    medium.insert("urllib.request".to_string(), WILDCARD.to_string());
    medium.insert("requests".to_string(), WILDCARD.to_string());

    SignatureFile {
        version: "embedded-default".to_string(),
        unsafe_globals: UnsafeGlobals {
            critical,
            high,
            medium,
        },
        prompt_injections: vec![
            r"(?i)ignore (all )?previous instructions".to_string(),
            r"(?i)disregard (the )?(system|above) prompt".to_string(),
            r"(?i)you are now (in )?dan mode".to_string(),
            r"(?i)reveal (your|the) system prompt".to_string(),
            r"(?i)act as if you have no restrictions".to_string(),
        ],
        suspicious_strings: vec![
            r"(?i)aws_secret_access_key\s*[:=]".to_string(),
            r"-----BEGIN (RSA|OPENSSH|EC|DSA) PRIVATE KEY-----".to_string(),
            r"(?i)api[_-]?key\s*[:=]\s*['\x22][A-Za-z0-9_\-]{16,}".to_string(),
            r"(?i)password\s*[:=]\s*['\x22][^'\x22\s]{6,}".to_string(),
            r"https?://[^\s'\x22]+/[a-z0-9]{32,}".to_string(),
            r"ghp_[A-Za-z0-9]{36}".to_string(),
        ],
        known_malicious: vec!["tourch".to_string(), "pythonn".to_string()],
        popular_packages: vec![
            "torch".to_string(),
            "tensorflow".to_string(),
            "numpy".to_string(),
            "pandas".to_string(),
            "requests".to_string(),
            "scipy".to_string(),
            "transformers".to_string(),
            "pillow".to_string(),
            "scikit-learn".to_string(),
            "matplotlib".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_attribute_matches_anything() {
        let store = SignatureStore::compile(default_signature_file()).unwrap();
        assert_eq!(store.severity_of("os", "system"), Some(Severity::Critical));
        assert_eq!(
            store.severity_of("os", "anything_else"),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn unknown_module_has_no_severity() {
        let store = SignatureStore::compile(default_signature_file()).unwrap();
        assert_eq!(store.severity_of("numpy", "array"), None);
    }

    #[test]
    fn known_malicious_lookup_is_case_insensitive() {
        let store = SignatureStore::compile(default_signature_file()).unwrap();
        assert!(store.is_known_malicious("TOURCH"));
        assert!(!store.is_known_malicious("torch"));
    }

    #[test]
    fn scientific_computing_whitelist_excludes_unrelated_modules() {
        let store = SignatureStore::compile(default_signature_file()).unwrap();
        assert!(store.is_scientific_module("numpy"));
        assert!(store.is_scientific_module("torch.storage"));
        assert!(!store.is_scientific_module("os"));
        assert!(!store.is_scientific_module("some_untrusted_pkg"));
    }
}
