//! Rendering for the `scan` command: table, JSON, and SARIF 2.1.0.

use std::collections::HashSet;

use colored::Colorize;

use crate::pipeline::{Finding, FileStatus, ScanReport, Severity, Verdict};

pub fn print_verdict(verdict: Verdict) {
    println!();
    let line = "=".repeat(60);

    match verdict {
        Verdict::Pass => {
            println!("{}", line.green());
            println!("{}", "  PASS -- no blocking findings".green().bold());
            println!("{}", line.green());
        }
        Verdict::Blocked => {
            println!("{}", line.red().bold());
            println!(
                "{}",
                "  BLOCKING DEPLOYMENT -- threats at or above the fail-on severity"
                    .red()
                    .bold()
            );
            println!("{}", line.red().bold());
        }
        Verdict::ForcedApproval => {
            println!("{}", line.yellow());
            println!(
                "{}",
                "  MALWARE/INTEGRITY RISKS DETECTED (Ignored by user)"
                    .yellow()
                    .bold()
            );
            println!("{}", line.yellow());
        }
    }
    println!();
}

pub fn print_report_json(report: &ScanReport) {
    println!(
        "{}",
        serde_json::to_string_pretty(report).unwrap_or_default()
    );
}

pub fn print_report_table(report: &ScanReport) {
    for result in &report.results {
        let status_marker = match result.status {
            FileStatus::Clean => "[*]".green().to_string(),
            FileStatus::Flagged => "[!]".yellow().to_string(),
            FileStatus::Error => "[x]".red().to_string(),
        };

        println!("  {} {}", status_marker, result.file.display().to_string().bold());

        if let Some(digest) = &result.digest {
            println!("       sha256: {}", digest.dimmed());
        }
        println!("       identity: {:?}", result.identity_state);

        for finding in &result.findings {
            let severity_str = format_severity(finding.severity);
            let location = match finding.line {
                Some(line) => format!("{}:{}", finding.file.display(), line),
                None => finding.file.display().to_string(),
            };
            println!(
                "       {} [{}] {} -- {}",
                severity_str,
                finding.rule.dimmed(),
                location,
                finding.message
            );
        }
    }

    println!();
    println!(
        "  {} files scanned, {} flagged, {} errored",
        report.files_scanned,
        report
            .results
            .iter()
            .filter(|r| r.status == FileStatus::Flagged)
            .count(),
        report
            .results
            .iter()
            .filter(|r| r.status == FileStatus::Error)
            .count()
    );
}

fn format_severity(severity: Severity) -> String {
    match severity {
        Severity::Warning => "WARNING ".dimmed().to_string(),
        Severity::Low => "LOW     ".normal().to_string(),
        Severity::Medium => "MEDIUM  ".yellow().to_string(),
        Severity::High => "HIGH    ".red().to_string(),
        Severity::Critical => "CRITICAL".red().bold().to_string(),
    }
}

fn severity_to_sarif_level(severity: Severity) -> &'static str {
    match severity {
        Severity::Warning | Severity::Low => "note",
        Severity::Medium => "warning",
        Severity::High | Severity::Critical => "error",
    }
}

pub fn print_report_sarif(report: &ScanReport, target: &str) {
    let all_findings: Vec<&Finding> = report.results.iter().flat_map(|r| &r.findings).collect();

    let sarif = serde_json::json!({
        "$schema": "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/main/sarif-2.1/schema/sarif-schema-2.1.0.json",
        "version": "2.1.0",
        "runs": [{
            "tool": {
                "driver": {
                    "name": "warden",
                    "version": env!("CARGO_PKG_VERSION"),
                    "informationUri": "https://warden.dev",
                    "rules": generate_rules(&all_findings)
                }
            },
            "results": all_findings.iter().map(|f| {
                serde_json::json!({
                    "ruleId": f.rule,
                    "level": severity_to_sarif_level(f.severity),
                    "message": { "text": f.message.clone() },
                    "locations": [{
                        "physicalLocation": {
                            "artifactLocation": {
                                "uri": f.file.display().to_string(),
                                "uriBaseId": "%SRCROOT%"
                            },
                            "region": {
                                "startLine": f.line.unwrap_or(1),
                                "startColumn": 1
                            }
                        }
                    }],
                    "properties": {
                        "kind": format!("{:?}", f.kind)
                    }
                })
            }).collect::<Vec<_>>(),
            "invocations": [{
                "executionSuccessful": true,
                "properties": {
                    "verdict": format!("{:?}", report.verdict),
                    "filesScanned": report.files_scanned
                }
            }],
            "artifacts": [{
                "location": { "uri": target, "uriBaseId": "%SRCROOT%" }
            }]
        }]
    });

    println!("{}", serde_json::to_string_pretty(&sarif).unwrap());
}

fn generate_rules(findings: &[&Finding]) -> Vec<serde_json::Value> {
    let mut seen = HashSet::new();
    findings
        .iter()
        .filter_map(|f| {
            if seen.insert(f.rule.clone()) {
                Some(serde_json::json!({
                    "id": f.rule,
                    "shortDescription": {
                        "text": f.message.chars().take(100).collect::<String>()
                    },
                    "defaultConfiguration": {
                        "level": severity_to_sarif_level(f.severity)
                    }
                }))
            } else {
                None
            }
        })
        .collect()
}
