// crates/changegate-providers/src/code_host.rs
// ============================================================================
// Module: HTTP Code Host Client
// Description: The one concrete CodeHostClient: a GitHub-REST-shaped async
//              client, rate-limited and idempotent at the write call sites.
// Purpose: Give the Write Gate and read-only stage workers a real backend.
// Dependencies: changegate-core, reqwest, serde_json, tokio
// ============================================================================

//! ## Overview
//! [`HttpCodeHostClient`] implements every [`CodeHostClient`] method against
//! a GitHub-REST-shaped API. Read methods are unguarded, as the trait
//! documents; write methods are normally only reached through the Write
//! Gate. A [`RateLimiter`] serializes outbound calls to respect the host's
//! per-token rate limit (`SPEC_FULL.md` §5: "a single-flight rate-limiting
//! wrapper around the client"), and `open_pull_request` checks for an
//! existing pull request on the head branch before opening a new one, the
//! idempotence rule §5 requires of PR creation.

use std::time::Duration;

use async_trait::async_trait;
use changegate_core::identifiers::WorkflowId;
use changegate_core::interfaces::BranchRef;
use changegate_core::interfaces::CodeHostClient;
use changegate_core::interfaces::CodeHostError;
use changegate_core::interfaces::OpenedPullRequest;
use changegate_core::interfaces::TreeEntry;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum spacing enforced between outbound requests by [`RateLimiter`].
const MIN_REQUEST_SPACING: Duration = Duration::from_millis(100);

/// Configuration for [`HttpCodeHostClient`].
#[derive(Debug, Clone)]
pub struct HttpCodeHostConfig {
    /// Base URL of the code host's REST API, e.g. `https://api.github.com`.
    pub base_url: String,
    /// Bearer credential sent as `Authorization: Bearer <token>`.
    pub app_credential: String,
}

/// Serializes outbound requests to respect the host's per-token rate limit.
/// "Single-flight" here means one request in flight at a time through this
/// client, with a minimum spacing enforced between requests regardless of
/// how many callers are waiting.
struct RateLimiter {
    /// Guards the timestamp of the last request start; holding the lock is
    /// what makes requests single-flight.
    last_request_at: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a rate limiter with no prior request recorded.
    fn new() -> Self {
        Self { last_request_at: Mutex::new(None) }
    }

    /// Waits until at least [`MIN_REQUEST_SPACING`] has elapsed since the
    /// previous call returned, then records the new call's start time.
    async fn acquire(&self) {
        let mut last = self.last_request_at.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < MIN_REQUEST_SPACING {
                tokio::time::sleep(MIN_REQUEST_SPACING - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// A [`CodeHostClient`] backed by a GitHub-REST-shaped HTTP API.
pub struct HttpCodeHostClient {
    /// Client configuration (endpoint, credential).
    config: HttpCodeHostConfig,
    /// The underlying async HTTP client.
    client: reqwest::Client,
    /// Per-token rate limiter shared across every call this client makes.
    rate_limiter: RateLimiter,
}

impl HttpCodeHostClient {
    /// Builds a client from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`CodeHostError::Transient`] if the HTTP client cannot be
    /// constructed.
    pub fn new(config: HttpCodeHostConfig) -> Result<Self, CodeHostError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| CodeHostError::Transient(format!("http client build failed: {err}")))?;
        Ok(Self { config, client, rate_limiter: RateLimiter::new() })
    }

    /// Issues one rate-limited request, mapping transport/HTTP status
    /// failures into [`CodeHostError`].
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, CodeHostError> {
        self.rate_limiter.acquire().await;
        let url = format!("{}{path}", self.config.base_url.trim_end_matches('/'));
        let mut builder = self.client.request(method, url).bearer_auth(&self.config.app_credential);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = builder.send().await.map_err(|err| CodeHostError::Transient(format!("code host request failed: {err}")))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(CodeHostError::NotFound(path.to_owned()));
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(CodeHostError::Transient(format!("code host returned {status}")));
        }
        if !status.is_success() {
            return Err(CodeHostError::Transient(format!("code host returned {status}")));
        }
        if status.as_u16() == 204 {
            return Ok(Value::Null);
        }
        response.json().await.map_err(|err| CodeHostError::Transient(format!("code host response decode failed: {err}")))
    }
}

#[async_trait]
impl CodeHostClient for HttpCodeHostClient {
    async fn get_tree(&self, owner: &str, repo: &str, sha: &str, recursive: bool) -> Result<Vec<TreeEntry>, CodeHostError> {
        let path = format!("/repos/{owner}/{repo}/git/trees/{sha}{}", if recursive { "?recursive=1" } else { "" });
        let payload = self.request(reqwest::Method::GET, &path, None).await?;
        let entries = payload
            .get("tree")
            .and_then(Value::as_array)
            .ok_or_else(|| CodeHostError::Transient("tree response missing tree array".to_owned()))?;
        Ok(entries
            .iter()
            .filter_map(|entry| {
                let path = entry.get("path")?.as_str()?.to_owned();
                let entry_type = entry.get("type")?.as_str()?;
                Some(TreeEntry { path, is_directory: entry_type == "tree" })
            })
            .collect())
    }

    async fn get_file_contents(&self, owner: &str, repo: &str, path: &str, reference: &str) -> Result<Vec<u8>, CodeHostError> {
        let request_path = format!("/repos/{owner}/{repo}/contents/{path}?ref={reference}");
        let payload = self.request(reqwest::Method::GET, &request_path, None).await?;
        let encoded = payload
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| CodeHostError::Transient("file response missing content".to_owned()))?;
        decode_base64(encoded.trim())
    }

    async fn get_branch(&self, owner: &str, repo: &str, branch: &str) -> Result<BranchRef, CodeHostError> {
        let path = format!("/repos/{owner}/{repo}/branches/{branch}");
        let payload = self.request(reqwest::Method::GET, &path, None).await?;
        let sha = payload
            .get("commit")
            .and_then(|commit| commit.get("sha"))
            .and_then(Value::as_str)
            .ok_or_else(|| CodeHostError::Transient("branch response missing commit.sha".to_owned()))?;
        Ok(BranchRef { name: branch.to_owned(), sha: sha.to_owned() })
    }

    async fn list_workflow_runs(&self, owner: &str, repo: &str) -> Result<Vec<String>, CodeHostError> {
        let path = format!("/repos/{owner}/{repo}/actions/runs");
        let payload = self.request(reqwest::Method::GET, &path, None).await?;
        Ok(payload
            .get("workflow_runs")
            .and_then(Value::as_array)
            .map(|runs| runs.iter().filter_map(|run| run.get("id").map(ToString::to_string)).collect())
            .unwrap_or_default())
    }

    async fn get_workflow_run_jobs(&self, owner: &str, repo: &str, run_id: &str) -> Result<Vec<String>, CodeHostError> {
        let path = format!("/repos/{owner}/{repo}/actions/runs/{run_id}/jobs");
        let payload = self.request(reqwest::Method::GET, &path, None).await?;
        Ok(payload
            .get("jobs")
            .and_then(Value::as_array)
            .map(|jobs| jobs.iter().filter_map(|job| job.get("name").and_then(Value::as_str).map(ToOwned::to_owned)).collect())
            .unwrap_or_default())
    }

    async fn create_branch(
        &self,
        _workflow_id: &WorkflowId,
        owner: &str,
        repo: &str,
        branch: &str,
        from_sha: &str,
    ) -> Result<BranchRef, CodeHostError> {
        if let Ok(existing) = self.get_branch(owner, repo, branch).await {
            if existing.sha == from_sha {
                return Ok(existing);
            }
        }
        let path = format!("/repos/{owner}/{repo}/git/refs");
        let body = json!({"ref": format!("refs/heads/{branch}"), "sha": from_sha});
        self.request(reqwest::Method::POST, &path, Some(body)).await?;
        Ok(BranchRef { name: branch.to_owned(), sha: from_sha.to_owned() })
    }

    async fn update_file(
        &self,
        _workflow_id: &WorkflowId,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
        contents: &[u8],
    ) -> Result<(), CodeHostError> {
        let existing_sha = match self.request(reqwest::Method::GET, &format!("/repos/{owner}/{repo}/contents/{path}?ref={branch}"), None).await {
            Ok(payload) => payload.get("sha").and_then(Value::as_str).map(ToOwned::to_owned),
            Err(CodeHostError::NotFound(_)) => None,
            Err(other) => return Err(other),
        };
        let request_path = format!("/repos/{owner}/{repo}/contents/{path}");
        let mut body = json!({
            "message": format!("changegate: update {path}"),
            "content": encode_base64(contents),
            "branch": branch,
        });
        if let Some(sha) = existing_sha {
            body["sha"] = Value::String(sha);
        }
        self.request(reqwest::Method::PUT, &request_path, Some(body)).await?;
        Ok(())
    }

    async fn open_pull_request(
        &self,
        _workflow_id: &WorkflowId,
        owner: &str,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<OpenedPullRequest, CodeHostError> {
        let list_path = format!("/repos/{owner}/{repo}/pulls?head={owner}:{head}&state=open");
        let existing = self.request(reqwest::Method::GET, &list_path, None).await?;
        if let Some(pull_request) = existing.as_array().and_then(|pulls| pulls.first()) {
            return parse_pull_request(pull_request);
        }

        let path = format!("/repos/{owner}/{repo}/pulls");
        let request_body = json!({"title": title, "body": body, "head": head, "base": base});
        let created = self.request(reqwest::Method::POST, &path, Some(request_body)).await?;
        parse_pull_request(&created)
    }

    async fn dispatch_workflow(
        &self,
        _workflow_id: &WorkflowId,
        owner: &str,
        repo: &str,
        workflow_file: &str,
        reference: &str,
    ) -> Result<(), CodeHostError> {
        let path = format!("/repos/{owner}/{repo}/actions/workflows/{workflow_file}/dispatches");
        let body = json!({"ref": reference});
        self.request(reqwest::Method::POST, &path, Some(body)).await?;
        Ok(())
    }
}

/// Extracts `{number, url}` from a GitHub-shaped pull request JSON object.
fn parse_pull_request(payload: &Value) -> Result<OpenedPullRequest, CodeHostError> {
    let number = payload
        .get("number")
        .and_then(Value::as_u64)
        .ok_or_else(|| CodeHostError::Transient("pull request response missing number".to_owned()))?;
    let url = payload
        .get("html_url")
        .and_then(Value::as_str)
        .ok_or_else(|| CodeHostError::Transient("pull request response missing html_url".to_owned()))?;
    Ok(OpenedPullRequest { number, url: url.to_owned() })
}

/// Encodes bytes as standard base64, the encoding GitHub's contents API
/// expects. No base64 crate exists in this workspace's dependency table, so
/// this is a small hand-written encoder rather than an unlisted dependency.
fn encode_base64(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied();
        let b2 = chunk.get(2).copied();
        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1.unwrap_or(0) >> 4)) as usize] as char);
        out.push(if let Some(b1) = b1 { ALPHABET[(((b1 & 0x0F) << 2) | (b2.unwrap_or(0) >> 6)) as usize] as char } else { '=' });
        out.push(if let Some(b2) = b2 { ALPHABET[(b2 & 0x3F) as usize] as char } else { '=' });
    }
    out
}

/// Decodes standard base64, the inverse of [`encode_base64`].
fn decode_base64(text: &str) -> Result<Vec<u8>, CodeHostError> {
    fn value(byte: u8) -> Option<u8> {
        match byte {
            b'A'..=b'Z' => Some(byte - b'A'),
            b'a'..=b'z' => Some(byte - b'a' + 26),
            b'0'..=b'9' => Some(byte - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let cleaned: Vec<u8> = text.bytes().filter(|byte| !byte.is_ascii_whitespace()).collect();
    let mut out = Vec::with_capacity(cleaned.len() / 4 * 3);
    for chunk in cleaned.chunks(4) {
        let padding = chunk.iter().filter(|byte| **byte == b'=').count();
        let values: Vec<u8> = chunk
            .iter()
            .filter(|byte| **byte != b'=')
            .map(|byte| value(*byte).ok_or_else(|| CodeHostError::Transient("invalid base64 content".to_owned())))
            .collect::<Result<_, _>>()?;
        if values.is_empty() {
            continue;
        }
        let n = values.iter().enumerate().fold(0u32, |acc, (i, v)| acc | (u32::from(*v) << (18 - 6 * i)));
        out.push((n >> 16) as u8);
        if padding < 2 {
            out.push((n >> 8) as u8);
        }
        if padding < 1 {
            out.push(n as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "test assertions")]

    use super::*;

    #[test]
    fn base64_round_trips_arbitrary_bytes() {
        let original = b"hello, changegate!";
        let encoded = encode_base64(original);
        let decoded = decode_base64(&encoded).expect("decodes");
        assert_eq!(decoded, original);
    }

    #[test]
    fn base64_handles_padding_for_short_inputs() {
        assert_eq!(decode_base64(&encode_base64(b"a")).expect("decodes"), b"a");
        assert_eq!(decode_base64(&encode_base64(b"ab")).expect("decodes"), b"ab");
    }

    #[test]
    fn parse_pull_request_reads_number_and_url() {
        let payload = json!({"number": 42, "html_url": "https://example.invalid/pull/42"});
        let pull_request = parse_pull_request(&payload).expect("parses");
        assert_eq!(pull_request.number, 42);
        assert_eq!(pull_request.url, "https://example.invalid/pull/42");
    }
}
