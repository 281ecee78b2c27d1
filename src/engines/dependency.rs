//! Dependency manifest scanner: requirements.txt and pyproject.toml.
//!
//! Checks each declared package against a known-malicious list and against
//! the popular-package list for a typosquat (edit distance exactly 1), then
//! batches the full dependency set to the OSV vulnerability oracle. Network
//! failures degrade gracefully -- a dependency scan never blocks on
//! connectivity.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pipeline::{Finding, Severity, ThreatKind};
use crate::signatures::SignatureStore;

pub fn scan(path: &Path, signatures: &SignatureStore) -> Vec<Finding> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            return vec![Finding::new(
                path,
                "dependency-read-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not read file: {e}"),
            )]
        }
    };

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let packages = if file_name == "pyproject.toml" {
        parse_pyproject(&content)
    } else {
        parse_requirements(&content)
    };

    let mut findings = Vec::new();
    for pkg in &packages {
        if signatures.is_known_malicious(&pkg.name) {
            findings.push(
                Finding::new(
                    path,
                    "dependency-known-malicious",
                    Severity::Critical,
                    ThreatKind::Typosquat,
                    format!("{} is a known-malicious package", pkg.name),
                )
                .at_line(pkg.line),
            );
            continue;
        }

        if let Some(target) = find_typosquat_target(&pkg.name, signatures.popular_packages()) {
            findings.push(
                Finding::new(
                    path,
                    "dependency-typosquat",
                    Severity::High,
                    ThreatKind::Typosquat,
                    format!("{} closely resembles popular package {target}", pkg.name),
                )
                .at_line(pkg.line),
            );
        }
    }

    findings.extend(query_osv(path, &packages));
    findings
}

struct Dependency {
    name: String,
    version: Option<String>,
    line: usize,
}

fn parse_requirements(content: &str) -> Vec<Dependency> {
    content
        .lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('-') {
                return None;
            }
            let (name, version) = split_name_version(trimmed);
            if name.is_empty() {
                return None;
            }
            Some(Dependency {
                name,
                version,
                line: i + 1,
            })
        })
        .collect()
}

fn split_name_version(spec: &str) -> (String, Option<String>) {
    for sep in ["==", ">=", "<=", "~=", "!=", ">", "<"] {
        if let Some((name, version)) = spec.split_once(sep) {
            return (name.trim().to_string(), Some(version.trim().to_string()));
        }
    }
    (spec.trim().to_string(), None)
}

/// Pulls dependencies out of pyproject.toml by line scanning rather than a
/// full TOML parse. Handles both shapes seen in the wild: the
/// `[project.dependencies]` table (`name = "version"` per line) and the
/// flat PEP 621 array (`dependencies = ["name==version", ...]`).
fn parse_pyproject(content: &str) -> Vec<Dependency> {
    let mut deps = Vec::new();
    let mut in_table = false;
    let mut in_array = false;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();

        if trimmed.starts_with('[') {
            in_table = trimmed.trim_start_matches('[').starts_with("project.dependencies");
            in_array = false;
            continue;
        }

        if !in_array && trimmed.starts_with("dependencies") && trimmed.contains('[') {
            in_array = true;
        }

        if in_table {
            if let Some((name, spec)) = trimmed.split_once('=') {
                let name = name.trim().trim_matches('"').trim_matches('\'');
                let version = spec.trim().trim_matches('"').trim_matches('\'');
                if !name.is_empty() {
                    deps.push(Dependency {
                        name: name.to_string(),
                        version: if version.is_empty() {
                            None
                        } else {
                            Some(version.to_string())
                        },
                        line: i + 1,
                    });
                }
            }
        } else if in_array {
            if let Some(start) = trimmed.find('"') {
                if let Some(end) = trimmed[start + 1..].find('"') {
                    let spec = &trimmed[start + 1..start + 1 + end];
                    let (name, version) = split_name_version(spec);
                    if !name.is_empty() {
                        deps.push(Dependency {
                            name,
                            version,
                            line: i + 1,
                        });
                    }
                }
            }
            if trimmed.contains(']') {
                in_array = false;
            }
        }
    }

    deps
}

/// Bounded Levenshtein-distance-1 check via a two-pointer scan: walk both
/// strings together, and on the first mismatch try substitution, deletion,
/// and insertion; if none of those realigns the rest of the strings, the
/// distance is greater than one.
fn is_typo(a: &str, b: &str) -> bool {
    if a == b {
        return false;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (a, b) = if a.len() <= b.len() { (a, b) } else { (b, a) };

    if b.len() - a.len() > 1 {
        return false;
    }

    let mut i = 0;
    let mut j = 0;
    let mut edits = 0;

    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            i += 1;
            j += 1;
            continue;
        }
        edits += 1;
        if edits > 1 {
            return false;
        }
        if a.len() == b.len() {
            // substitution
            i += 1;
            j += 1;
        } else {
            // deletion/insertion: skip the longer string's character
            j += 1;
        }
    }

    if i < a.len() || j < b.len() {
        edits += 1;
    }

    edits == 1
}

fn find_typosquat_target<'a>(name: &str, popular: &'a [String]) -> Option<&'a str> {
    popular
        .iter()
        .find(|p| is_typo(name, p))
        .map(|s| s.as_str())
}

#[derive(Debug, Serialize)]
struct OsvBatchQuery {
    queries: Vec<OsvQuery>,
}

#[derive(Debug, Serialize)]
struct OsvQuery {
    package: OsvPackage,
    version: Option<String>,
}

#[derive(Debug, Serialize)]
struct OsvPackage {
    name: String,
    ecosystem: &'static str,
}

#[derive(Debug, Deserialize)]
struct OsvBatchResponse {
    #[serde(default)]
    results: Vec<OsvResult>,
}

#[derive(Debug, Deserialize)]
struct OsvResult {
    #[serde(default)]
    vulns: Vec<OsvVuln>,
}

#[derive(Debug, Deserialize)]
struct OsvVuln {
    id: String,
}

const OSV_ENDPOINT: &str = "https://api.osv.dev/v1/querybatch";

fn query_osv(path: &Path, packages: &[Dependency]) -> Vec<Finding> {
    if packages.is_empty() {
        return Vec::new();
    }

    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    let query = OsvBatchQuery {
        queries: packages
            .iter()
            .map(|p| OsvQuery {
                package: OsvPackage {
                    name: p.name.clone(),
                    ecosystem: "PyPI",
                },
                version: p.version.clone(),
            })
            .collect(),
    };

    let response = match client.post(OSV_ENDPOINT).json(&query).send() {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "OSV query failed, skipping vulnerability check");
            return Vec::new();
        }
    };

    let parsed: OsvBatchResponse = match response.json() {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "OSV response not parseable, skipping vulnerability check");
            return Vec::new();
        }
    };

    parsed
        .results
        .into_iter()
        .zip(packages.iter())
        .flat_map(|(result, pkg)| {
            result.vulns.into_iter().map(move |vuln| {
                Finding::new(
                    path,
                    "dependency-vulnerability",
                    Severity::High,
                    ThreatKind::Vulnerability,
                    format!(
                        "CVE detected in {}=={}: {}",
                        pkg.name,
                        pkg.version.clone().unwrap_or_else(|| "unknown".to_string()),
                        vuln.id
                    ),
                )
                .at_line(pkg.line)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_is_a_typo() {
        assert!(is_typo("turch", "torch"));
    }

    #[test]
    fn deletion_is_a_typo() {
        assert!(is_typo("toch", "torch"));
    }

    #[test]
    fn insertion_is_a_typo() {
        assert!(is_typo("ttorch", "torch"));
    }

    #[test]
    fn distance_greater_than_one_is_not_a_typo() {
        assert!(!is_typo("tor", "torch"));
    }

    #[test]
    fn identical_strings_are_not_a_typo() {
        assert!(!is_typo("torch", "torch"));
    }

    #[test]
    fn requirements_typosquat_detected() {
        let content = "pndas==1.0.0\n";
        let deps = parse_requirements(content);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].name, "pndas");
    }

    #[test]
    fn pyproject_dependency_table_is_parsed() {
        let content = "\n[project.dependencies]\ntorch = \">=2.0\"\nreqests = \"0.1\"\n";
        let deps = parse_pyproject(content);

        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].name, "torch");
        assert_eq!(deps[0].version.as_deref(), Some(">=2.0"));
        assert_eq!(deps[1].name, "reqests");
        assert_eq!(deps[1].version.as_deref(), Some("0.1"));
    }

    #[test]
    fn pyproject_table_typosquat_detected() {
        use crate::signatures::SignatureStore;

        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("pyproject.toml");
        std::fs::write(
            &manifest_path,
            "\n[project.dependencies]\ntorch = \">=2.0\"\nreqests = \"0.1\"\n",
        )
        .unwrap();

        let signatures = SignatureStore::load_or_default(Path::new("/nonexistent")).unwrap();
        let findings = scan(&manifest_path, &signatures);

        assert!(findings.iter().any(|f| f.rule == "dependency-typosquat"
            && f.message.contains("reqests")
            && f.message.contains("requests")));
    }

    #[test]
    fn known_malicious_requirement_is_flagged_critical() {
        use crate::signatures::SignatureStore;

        let dir = tempfile::tempdir().unwrap();
        let requirements_path = dir.path().join("requirements.txt");
        std::fs::write(&requirements_path, "tourch==1.0.0\n").unwrap();

        let signatures = SignatureStore::load_or_default(Path::new("/nonexistent")).unwrap();
        let findings = scan(&requirements_path, &signatures);

        assert!(findings
            .iter()
            .any(|f| f.rule == "dependency-known-malicious" && f.severity == Severity::Critical));
    }
}
