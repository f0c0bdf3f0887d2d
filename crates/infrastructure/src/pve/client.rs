//! Raw Proxmox VE HTTP client
//!
//! Thin JSON client over reqwest: API-token authentication, the `data`
//! response envelope, and synchronous waiting on UPID-addressed tasks.
//! Classification of failures into transient/permanent happens in the
//! adapter; this layer only distinguishes transport failures from HTTP
//! status failures.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::debug;

use proxmox_ca_shared::config::ProxmoxConfig;

/// Per-call deadline; exceeding it is treated as a transient failure.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for UPID-addressed tasks (image downloads can be slow).
const TASK_TIMEOUT: Duration = Duration::from_secs(1800);

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(thiserror::Error, Debug)]
pub enum PveError {
    /// The API answered with a non-success status
    #[error("proxmox api returned {code}: {message}")]
    Status { code: StatusCode, message: String },

    /// The request never completed: connect failure, timeout, bad payload
    #[error("proxmox transport error: {0}")]
    Transport(String),

    /// A UPID task finished with a non-OK exit status
    #[error("proxmox task failed: {upid}: {exitstatus}")]
    TaskFailed { upid: String, exitstatus: String },

    /// A UPID task did not finish within the task deadline
    #[error("timed out waiting for proxmox task: {upid}")]
    TaskTimeout { upid: String },
}

impl PveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PveError::Status { code, .. } if *code == StatusCode::NOT_FOUND)
    }
}

impl From<reqwest::Error> for PveError {
    fn from(err: reqwest::Error) -> Self {
        PveError::Transport(err.to_string())
    }
}

pub struct PveClient {
    http: reqwest::Client,
    base_url: String,
    node: String,
    auth_header: String,
}

impl PveClient {
    pub fn new(config: &ProxmoxConfig) -> Result<Self, PveError> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;
        Ok(Self {
            http,
            base_url: normalize_api_base(&config.api_url),
            node: config.node.clone(),
            auth_header: format!(
                "PVEAPIToken={}={}",
                config.token_id, config.token_secret
            ),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Issue a request against `/api2/json<path>` and unwrap the `data`
    /// envelope.
    pub async fn json(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<Value, PveError> {
        let url = format!("{}/api2/json{}", self.base_url, path);
        debug!(target: "proxmox_ca::pve", %method, %path, "proxmox api call");
        let mut request = self
            .http
            .request(method, &url)
            .header("Authorization", &self.auth_header);
        if let Some(fields) = form {
            request = request.form(fields);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PveError::Status {
                code: status,
                message,
            });
        }
        let payload: Value = response.json().await?;
        Ok(payload.get("data").cloned().unwrap_or(Value::Null))
    }

    pub async fn get(&self, path: &str) -> Result<Value, PveError> {
        self.json(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, form: &[(&str, String)]) -> Result<Value, PveError> {
        self.json(Method::POST, path, Some(form)).await
    }

    pub async fn put(&self, path: &str, form: &[(&str, String)]) -> Result<Value, PveError> {
        self.json(Method::PUT, path, Some(form)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, PveError> {
        self.json(Method::DELETE, path, None).await
    }

    /// Upload a volume into a storage via multipart form.
    pub async fn upload(
        &self,
        storage: &str,
        content: &str,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<Value, PveError> {
        let url = format!(
            "{}/api2/json/nodes/{}/storage/{}/upload",
            self.base_url, self.node, storage
        );
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new()
            .text("content", content.to_string())
            .part("filename", part);
        let response = self
            .http
            .post(&url)
            .header("Authorization", &self.auth_header)
            .multipart(form)
            // Uploads get the task deadline, not the per-call one.
            .timeout(TASK_TIMEOUT)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PveError::Status {
                code: status,
                message,
            });
        }
        let payload: Value = response.json().await?;
        Ok(payload.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Block until the task named by `upid` stops, failing on a non-OK exit.
    pub async fn wait_task(&self, upid: &str) -> Result<(), PveError> {
        let deadline = tokio::time::Instant::now() + TASK_TIMEOUT;
        let path = format!(
            "/nodes/{}/tasks/{}/status",
            self.node,
            urlencode(upid)
        );
        while tokio::time::Instant::now() < deadline {
            let status = self.get(&path).await?;
            if status.get("status").and_then(Value::as_str) == Some("stopped") {
                let exitstatus = status
                    .get("exitstatus")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if !exitstatus.is_empty() && exitstatus != "OK" {
                    return Err(PveError::TaskFailed {
                        upid: upid.to_string(),
                        exitstatus,
                    });
                }
                return Ok(());
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
        Err(PveError::TaskTimeout {
            upid: upid.to_string(),
        })
    }

    /// Wait on a response value when it is a UPID; plain values pass through.
    pub async fn wait_if_task(&self, value: &Value) -> Result<(), PveError> {
        if let Some(upid) = value.as_str() {
            if upid.starts_with("UPID:") {
                return self.wait_task(upid).await;
            }
        }
        Ok(())
    }
}

/// The configured URL may or may not carry the `/api2/json` suffix.
fn normalize_api_base(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    trimmed
        .strip_suffix("/api2/json")
        .unwrap_or(trimmed)
        .to_string()
}

/// Percent-encode a path segment (UPIDs contain `:`).
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
