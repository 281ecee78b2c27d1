//! Shells out to an external cosign-compatible binary to sign a container
//! image reference once a scan passes.

use std::process::Command;

use crate::errors::WardenError;

const BINARY: &str = "cosign";

pub fn is_available() -> bool {
    which(BINARY).is_some()
}

fn which(binary: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// Sign `image_ref` with the key at `key_path`, attaching `annotations` as
/// `key=value` pairs.
pub fn sign(
    image_ref: &str,
    key_path: &str,
    annotations: &[(String, String)],
) -> Result<(), WardenError> {
    if !is_available() {
        return Err(WardenError::SigningBinaryMissing {
            binary: BINARY.to_string(),
        });
    }

    let mut cmd = Command::new(BINARY);
    cmd.arg("sign")
        .arg("--key")
        .arg(key_path)
        .arg("--yes")
        .arg(image_ref);
    for (k, v) in annotations {
        cmd.arg("-a").arg(format!("{k}={v}"));
    }

    let output = cmd
        .output()
        .map_err(|source| WardenError::Io {
            path: std::path::PathBuf::from(BINARY),
            source,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(WardenError::SigningFailed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Generates a cosign key pair, writing `<prefix>.key` / `<prefix>.pub` to
/// the current directory.
pub fn generate_key_pair(prefix: &str) -> Result<(), WardenError> {
    if !is_available() {
        return Err(WardenError::SigningBinaryMissing {
            binary: BINARY.to_string(),
        });
    }

    let output = Command::new(BINARY)
        .arg("generate-key-pair")
        .arg(format!("--output-key-prefix={prefix}"))
        .output()
        .map_err(|source| WardenError::Io {
            path: std::path::PathBuf::from(BINARY),
            source,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(WardenError::SigningFailed {
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
