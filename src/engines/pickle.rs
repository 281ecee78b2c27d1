//! Opcode-level pickle stream scanner.
//!
//! Never builds or executes an object graph -- the stream is walked
//! opcode-by-opcode purely to recover which `(module, attribute)` pairs a
//! `GLOBAL`/`STACK_GLOBAL` opcode would resolve to, and whether anything
//! outside the signature whitelist is referenced.

use std::io::Read;
use std::path::Path;

use crate::config::WardenConfig;
use crate::pipeline::{CancelToken, Finding, Severity, ThreatKind};
use crate::signatures::SignatureStore;

// Opcodes relevant to this scan; everything else just needs its operand
// length skipped so the cursor stays aligned.
const MARK: u8 = b'(';
const STOP: u8 = b'.';
const GLOBAL: u8 = b'c';
const STACK_GLOBAL: u8 = 0x93;
const SHORT_BINUNICODE: u8 = 0x8c;
const BINUNICODE: u8 = b'X';
const BINUNICODE8: u8 = 0x8d;
const SHORT_BINSTRING: u8 = b'U';
const BINSTRING: u8 = b'T';
const PROTO: u8 = 0x80;
const FRAME: u8 = 0x95;
const MEMOIZE: u8 = 0x94;
const BINPUT: u8 = b'q';
const LONG_BINPUT: u8 = b'r';
const PUT: u8 = b'p';
const BINGET: u8 = b'h';
const LONG_BINGET: u8 = b'j';
const GET: u8 = b'g';
const BININT: u8 = b'J';
const BININT1: u8 = b'K';
const BININT2: u8 = b'M';
const LONG1: u8 = 0x8a;
const LONG4: u8 = 0x8b;
const NONE: u8 = b'N';
const NEWTRUE: u8 = 0x88;
const NEWFALSE: u8 = 0x89;
const EMPTY_DICT: u8 = b'}';
const EMPTY_LIST: u8 = b']';
const EMPTY_TUPLE: u8 = b')';
const TUPLE1: u8 = 0x85;
const TUPLE2: u8 = 0x86;
const TUPLE3: u8 = 0x87;
const REDUCE: u8 = b'R';
const BUILD: u8 = b'b';
const SETITEM: u8 = b's';
const SETITEMS: u8 = b'u';
const APPEND: u8 = b'a';
const APPENDS: u8 = b'e';
const DICT: u8 = b'd';
const LIST: u8 = b'l';
const TUPLE: u8 = b't';
const POP: u8 = b'0';
const POP_MARK: u8 = b'1';
const DUP: u8 = b'2';
const PERSID: u8 = b'P';
const BINPERSID: u8 = b'Q';
const EXT1: u8 = 0x82;
const EXT2: u8 = 0x83;
const EXT4: u8 = 0x84;

pub fn scan(
    path: &Path,
    config: &WardenConfig,
    signatures: &SignatureStore,
    cancel: &CancelToken,
) -> Vec<Finding> {
    let content = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) => {
            return vec![Finding::new(
                path,
                "pickle-read-error",
                Severity::High,
                ThreatKind::ScanError,
                format!("could not read file: {e}"),
            )]
        }
    };

    if content.len() >= 4 && &content[0..2] == b"PK" {
        return scan_zip_container(path, &content, config, signatures, cancel);
    }

    scan_stream(path, &content, config, signatures, config.strict_pickle, cancel)
}

/// PyTorch/framework checkpoints are zip archives containing one or more
/// `*/data.pkl` members plus raw tensor storage blobs.
fn scan_zip_container(
    path: &Path,
    content: &[u8],
    config: &WardenConfig,
    signatures: &SignatureStore,
    cancel: &CancelToken,
) -> Vec<Finding> {
    let reader = std::io::Cursor::new(content);
    let mut archive = match zip::ZipArchive::new(reader) {
        Ok(a) => a,
        Err(e) => {
            return vec![Finding::new(
                path,
                "pickle-zip-error",
                Severity::Warning,
                ThreatKind::ScanError,
                format!("could not open zip container: {e}"),
            )]
        }
    };

    let mut findings = Vec::new();
    let member_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .filter(|name| name.ends_with("data.pkl"))
        .collect();

    if member_names.is_empty() {
        findings.push(Finding::new(
            path,
            "pickle-zip-no-member",
            Severity::Warning,
            ThreatKind::UnknownFile,
            "zip container has no data.pkl member",
        ));
        return findings;
    }

    for name in member_names {
        if cancel.is_cancelled() {
            break;
        }
        let mut buf = Vec::new();
        let read_result = archive
            .by_name(&name)
            .map_err(|e| e.to_string())
            .and_then(|mut f| f.read_to_end(&mut buf).map_err(|e| e.to_string()));

        match read_result {
            Ok(_) => findings.extend(scan_stream(
                path,
                &buf,
                config,
                signatures,
                config.strict_pickle,
                cancel,
            )),
            Err(e) => findings.push(Finding::new(
                path,
                "pickle-zip-member-error",
                Severity::Warning,
                ThreatKind::ScanError,
                format!("could not read member {name}: {e}"),
            )),
        }
    }

    findings
}

#[allow(clippy::too_many_arguments)]
fn scan_stream(
    path: &Path,
    data: &[u8],
    config: &WardenConfig,
    signatures: &SignatureStore,
    strict: bool,
    cancel: &CancelToken,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut cursor = 0usize;
    // Tracks the most recently pushed short-string-like operand, used to
    // resolve STACK_GLOBAL's two-operand (module, name) pop.
    let mut string_stack: Vec<String> = Vec::new();

    while cursor < data.len() {
        if cancel.is_cancelled() {
            break;
        }
        let opcode = data[cursor];
        cursor += 1;

        match opcode {
            STOP => break,
            PROTO => {
                if cursor >= data.len() {
                    findings.push(truncated(path));
                    break;
                }
                let proto = data[cursor];
                cursor += 1;
                if proto > 5 {
                    findings.push(Finding::new(
                        path,
                        "pickle-unsupported-protocol",
                        Severity::Warning,
                        ThreatKind::UnknownFile,
                        format!("pickle protocol {proto} is newer than supported"),
                    ));
                }
            }
            FRAME => cursor += 8,
            GLOBAL => match read_line(data, &mut cursor).zip(read_line(data, &mut cursor)) {
                Some((module, attr)) => {
                    check_global(path, &module, &attr, config, signatures, strict, &mut findings);
                }
                _ => {
                    findings.push(truncated(path));
                    break;
                }
            },
            STACK_GLOBAL => {
                if string_stack.len() < 2 {
                    findings.push(truncated(path));
                    break;
                }
                let attr = string_stack.pop().unwrap();
                let module = string_stack.pop().unwrap();
                check_global(path, &module, &attr, config, signatures, strict, &mut findings);
            }
            SHORT_BINUNICODE | SHORT_BINSTRING => {
                if cursor >= data.len() {
                    findings.push(truncated(path));
                    break;
                }
                let len = data[cursor] as usize;
                cursor += 1;
                match read_exact_string(data, &mut cursor, len) {
                    Some(s) => string_stack.push(s),
                    None => {
                        findings.push(truncated(path));
                        break;
                    }
                }
            }
            BINUNICODE | BINSTRING => {
                if cursor + 4 > data.len() {
                    findings.push(truncated(path));
                    break;
                }
                let len = u32::from_le_bytes(data[cursor..cursor + 4].try_into().unwrap()) as usize;
                cursor += 4;
                match read_exact_string(data, &mut cursor, len) {
                    Some(s) => string_stack.push(s),
                    None => {
                        findings.push(truncated(path));
                        break;
                    }
                }
            }
            BINUNICODE8 | LONG4 => {
                if cursor + 8 > data.len() {
                    findings.push(truncated(path));
                    break;
                }
                let len = u64::from_le_bytes(data[cursor..cursor + 8].try_into().unwrap()) as usize;
                cursor += 8;
                if opcode == BINUNICODE8 {
                    match read_exact_string(data, &mut cursor, len) {
                        Some(s) => string_stack.push(s),
                        None => {
                            findings.push(truncated(path));
                            break;
                        }
                    }
                } else if cursor + len > data.len() {
                    findings.push(truncated(path));
                    break;
                } else {
                    cursor += len;
                }
            }
            BINPUT | GET | PUT => cursor += 1,
            LONG_BINPUT | LONG_BINGET | BINGET => {
                cursor += if opcode == BINGET { 1 } else { 4 };
            }
            BININT => cursor += 4,
            BININT1 => cursor += 1,
            BININT2 => cursor += 2,
            LONG1 => {
                if cursor >= data.len() {
                    findings.push(truncated(path));
                    break;
                }
                let len = data[cursor] as usize;
                cursor += 1 + len;
            }
            EXT1 => cursor += 1,
            EXT2 => cursor += 2,
            EXT4 => cursor += 4,
            MARK => {}
            MEMOIZE | NONE | NEWTRUE | NEWFALSE | EMPTY_DICT | EMPTY_LIST | EMPTY_TUPLE
            | TUPLE1 | TUPLE2 | TUPLE3 | REDUCE | BUILD | SETITEM | SETITEMS | APPEND
            | APPENDS | DICT | LIST | TUPLE | POP | POP_MARK | DUP | PERSID | BINPERSID => {}
            _ => {
                // Unrecognized opcode: treat subsequent bytes as opaque and
                // keep scanning rather than aborting the whole file.
            }
        }

        if cursor > data.len() {
            findings.push(truncated(path));
            break;
        }
    }

    if findings.is_empty() && data.is_empty() {
        findings.push(Finding::new(
            path,
            "pickle-empty",
            Severity::Warning,
            ThreatKind::ScanError,
            "pickle stream is empty",
        ));
    }

    findings
}

#[allow(clippy::too_many_arguments)]
fn check_global(
    path: &Path,
    module: &str,
    attr: &str,
    config: &WardenConfig,
    signatures: &SignatureStore,
    strict: bool,
    findings: &mut Vec<Finding>,
) {
    if config.allowed_modules.contains(module) {
        return;
    }

    if let Some(severity) = signatures.severity_of(module, attr) {
        findings.push(Finding::new(
            path,
            "pickle-unsafe-global",
            severity,
            ThreatKind::UnsafeReference,
            format!("references {module}.{attr}"),
        ));
    } else if strict && !signatures.is_scientific_module(module) {
        findings.push(Finding::new(
            path,
            "pickle-strict-unwhitelisted",
            Severity::Medium,
            ThreatKind::UnsafeReference,
            format!("references {module}.{attr}, outside the scientific-computing whitelist"),
        ));
    }
}

fn truncated(path: &Path) -> Finding {
    Finding::new(
        path,
        "pickle-truncated",
        Severity::Critical,
        ThreatKind::ScanError,
        "pickle stream ended unexpectedly (truncated or malformed)",
    )
}

fn read_line(data: &[u8], cursor: &mut usize) -> Option<String> {
    let start = *cursor;
    let newline = data[start..].iter().position(|&b| b == b'\n')?;
    let s = std::str::from_utf8(&data[start..start + newline]).ok()?.to_string();
    *cursor = start + newline + 1;
    Some(s)
}

fn read_exact_string(data: &[u8], cursor: &mut usize, len: usize) -> Option<String> {
    if *cursor + len > data.len() {
        return None;
    }
    let s = String::from_utf8_lossy(&data[*cursor..*cursor + len]).into_owned();
    *cursor += len;
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::SignatureStore;
    use std::path::PathBuf;

    fn empty_config() -> WardenConfig {
        WardenConfig::default()
    }

    #[test]
    fn empty_dict_pickle_is_clean() {
        // Protocol 2 pickle for `{}`: PROTO 2, EMPTY_DICT, STOP.
        let data = vec![PROTO, 2, EMPTY_DICT, STOP];
        let store = SignatureStore::load_or_default(&PathBuf::from("/nonexistent")).unwrap();
        let findings = scan_stream(
            &PathBuf::from("test.pkl"),
            &data,
            &empty_config(),
            &store,
            false,
            &CancelToken::new(),
        );
        assert!(findings.is_empty());
    }

    #[test]
    fn global_os_system_is_flagged_critical() {
        let mut data = Vec::new();
        data.push(GLOBAL);
        data.extend(b"os\n");
        data.extend(b"system\n");
        data.push(STOP);

        let store = SignatureStore::load_or_default(&PathBuf::from("/nonexistent")).unwrap();
        let findings = scan_stream(
            &PathBuf::from("test.pkl"),
            &data,
            &empty_config(),
            &store,
            false,
            &CancelToken::new(),
        );
        assert!(findings
            .iter()
            .any(|f| f.severity == Severity::Critical && f.rule == "pickle-unsafe-global"));
    }

    fn global_pickle(module: &str, attr: &str) -> Vec<u8> {
        let mut data = Vec::new();
        data.push(GLOBAL);
        data.extend(module.as_bytes());
        data.push(b'\n');
        data.extend(attr.as_bytes());
        data.push(b'\n');
        data.push(STOP);
        data
    }

    #[test]
    fn strict_mode_flags_unwhitelisted_module_at_medium() {
        let data = global_pickle("some_untrusted_pkg", "Loader");
        let store = SignatureStore::load_or_default(&PathBuf::from("/nonexistent")).unwrap();
        let findings = scan_stream(
            &PathBuf::from("test.pkl"),
            &data,
            &empty_config(),
            &store,
            true,
            &CancelToken::new(),
        );
        assert!(findings
            .iter()
            .any(|f| f.severity == Severity::Medium && f.rule == "pickle-strict-unwhitelisted"));
    }

    #[test]
    fn strict_mode_does_not_flag_whitelisted_scientific_module() {
        let data = global_pickle("numpy.core.multiarray", "_reconstruct");
        let store = SignatureStore::load_or_default(&PathBuf::from("/nonexistent")).unwrap();
        let findings = scan_stream(
            &PathBuf::from("test.pkl"),
            &data,
            &empty_config(),
            &store,
            true,
            &CancelToken::new(),
        );
        assert!(findings.is_empty());
    }

    #[test]
    fn non_strict_mode_does_not_flag_unwhitelisted_module() {
        let data = global_pickle("some_untrusted_pkg", "Loader");
        let store = SignatureStore::load_or_default(&PathBuf::from("/nonexistent")).unwrap();
        let findings = scan_stream(
            &PathBuf::from("test.pkl"),
            &data,
            &empty_config(),
            &store,
            false,
            &CancelToken::new(),
        );
        assert!(findings.is_empty());
    }
}
