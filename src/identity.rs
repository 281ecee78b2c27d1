//! Identity verification against an upstream model registry.
//!
//! Fails open on network/unknown-identity conditions -- a registry that is
//! unreachable or has never heard of the file does not block a scan by
//! itself. A confirmed digest mismatch does.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_REGISTRY_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

pub enum IdentityResult {
    Verified,
    Mismatch { expected: String },
    UnknownInRepo,
}

#[derive(Debug, Deserialize)]
struct SibFile {
    rfilename: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    sha256: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<SibFile>,
}

pub struct IdentityClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    token: Option<String>,
}

impl IdentityClient {
    pub fn new(token: Option<String>) -> Self {
        Self::with_endpoint(DEFAULT_REGISTRY_ENDPOINT.to_string(), token)
    }

    pub fn with_endpoint(endpoint: String, token: Option<String>) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        IdentityClient {
            http,
            endpoint,
            token,
        }
    }

    /// Look up `(repo, file_name)` in the registry and compare against
    /// `local_digest`.
    pub fn verify(
        &self,
        repo: &str,
        file_name: &str,
        local_digest: &str,
    ) -> Result<IdentityResult, IdentityError> {
        let url = format!("{}/api/models/{}", self.endpoint, repo);
        let mut req = self.http.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send()?;
        if !resp.status().is_success() {
            tracing::warn!(status = %resp.status(), repo, "registry lookup returned non-success");
            return Ok(IdentityResult::UnknownInRepo);
        }

        let info: RepoInfo = match resp.json() {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(error = %e, "registry response not parseable");
                return Ok(IdentityResult::UnknownInRepo);
            }
        };

        let remote_digest = info
            .siblings
            .iter()
            .find(|s| s.rfilename == file_name)
            .and_then(|s| s.sha256.clone().or_else(|| s.lfs.as_ref().and_then(|l| l.sha256.clone())));

        match remote_digest {
            Some(expected) if expected.eq_ignore_ascii_case(local_digest) => {
                Ok(IdentityResult::Verified)
            }
            Some(expected) => Ok(IdentityResult::Mismatch { expected }),
            None => Ok(IdentityResult::UnknownInRepo),
        }
    }
}
