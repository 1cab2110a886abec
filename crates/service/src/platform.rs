//! HTTP adapter for the remote sandbox platform.
//!
//! The agent crate only knows the `SandboxPlatform` traits; this module
//! binds them to the deployment's sandbox API. Configuration comes from
//! `SANDBOX_API_URL` / `SANDBOX_API_TOKEN`; preview URLs are built from
//! the host the create/get responses advertise.

use async_trait::async_trait;
use atelier_agent::sandbox::platform::{
    CommandExit, LogChunk, SandboxCommand, SandboxError, SandboxHandle, SandboxPlatform, WriteFile,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn transient(e: reqwest::Error) -> SandboxError {
    // Connection-level failures are worth retrying; everything else is
    // treated as a hard failure by callers via status checks.
    if e.is_timeout() || e.is_connect() || e.is_request() {
        SandboxError::Transient(e.to_string())
    } else {
        SandboxError::Fatal(e.to_string())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SandboxError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(SandboxError::Transient(format!("{status}: {body}")))
    } else {
        Err(SandboxError::Fatal(format!("{status}: {body}")))
    }
}

#[derive(Deserialize)]
struct SandboxRecord {
    sandbox_id: String,
    cwd: String,
    preview_host: String,
}

#[derive(Deserialize)]
struct CommandRecord {
    command_id: String,
}

#[derive(Deserialize)]
struct ExitRecord {
    exit_code: i32,
}

#[derive(Deserialize)]
struct LogLine {
    #[serde(default)]
    data: String,
}

struct PlatformClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl PlatformClient {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
    }
}

pub struct RemotePlatform {
    client: Arc<PlatformClient>,
}

impl RemotePlatform {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client: Arc::new(PlatformClient {
                http,
                base_url: base_url.into().trim_end_matches('/').to_string(),
                api_token: api_token.into(),
            }),
        }
    }

    pub fn from_env(http: reqwest::Client) -> anyhow::Result<Self> {
        let base_url = std::env::var("SANDBOX_API_URL")
            .map_err(|_| anyhow::anyhow!("SANDBOX_API_URL is not set"))?;
        let api_token = std::env::var("SANDBOX_API_TOKEN").unwrap_or_default();
        Ok(Self::new(http, base_url, api_token))
    }

    fn handle_from(&self, record: SandboxRecord) -> Arc<dyn SandboxHandle> {
        Arc::new(RemoteHandle {
            client: self.client.clone(),
            sandbox_id: record.sandbox_id,
            cwd: record.cwd,
            preview_host: record.preview_host,
        })
    }
}

#[async_trait]
impl SandboxPlatform for RemotePlatform {
    async fn create(
        &self,
        timeout_ms: u64,
        runtime: Option<&str>,
        ports: Option<&[u16]>,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let resp = self
            .client
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&json!({"timeout_ms": timeout_ms, "runtime": runtime, "ports": ports}))
            .send()
            .await
            .map_err(transient)?;
        let record: SandboxRecord = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Fatal(e.to_string()))?;
        Ok(self.handle_from(record))
    }

    async fn get(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let resp = self
            .client
            .request(reqwest::Method::GET, &format!("/sandboxes/{sandbox_id}"))
            .send()
            .await
            .map_err(transient)?;
        let record: SandboxRecord = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Fatal(e.to_string()))?;
        Ok(self.handle_from(record))
    }
}

struct RemoteHandle {
    client: Arc<PlatformClient>,
    sandbox_id: String,
    cwd: String,
    preview_host: String,
}

#[async_trait]
impl SandboxHandle for RemoteHandle {
    fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    fn cwd(&self) -> &str {
        &self.cwd
    }

    fn domain(&self, port: u16) -> String {
        format!("https://{}-{}.{}", self.sandbox_id, port, self.preview_host)
    }

    async fn write_files(&self, files: &[WriteFile]) -> Result<(), SandboxError> {
        let payload: Vec<_> = files
            .iter()
            .map(|f| json!({"path": f.path, "content_b64": BASE64.encode(&f.content)}))
            .collect();
        let resp = self
            .client
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/files", self.sandbox_id),
            )
            .json(&json!({"files": payload}))
            .send()
            .await
            .map_err(transient)?;
        check_status(resp).await.map(|_| ())
    }

    async fn run_command(
        &self,
        argv0: &str,
        argv: &[String],
    ) -> Result<Arc<dyn SandboxCommand>, SandboxError> {
        self.spawn(argv0, argv, None, false, false).await
    }

    async fn run_command_detached(
        &self,
        argv0: &str,
        argv: &[String],
        env: Option<&HashMap<String, String>>,
        sudo: bool,
    ) -> Result<Arc<dyn SandboxCommand>, SandboxError> {
        self.spawn(argv0, argv, env, sudo, true).await
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        let resp = self
            .client
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/stop", self.sandbox_id),
            )
            .send()
            .await
            .map_err(transient)?;
        check_status(resp).await.map(|_| ())
    }
}

impl RemoteHandle {
    async fn spawn(
        &self,
        argv0: &str,
        argv: &[String],
        env: Option<&HashMap<String, String>>,
        sudo: bool,
        detached: bool,
    ) -> Result<Arc<dyn SandboxCommand>, SandboxError> {
        let resp = self
            .client
            .request(
                reqwest::Method::POST,
                &format!("/sandboxes/{}/commands", self.sandbox_id),
            )
            .json(&json!({
                "argv0": argv0,
                "argv": argv,
                "env": env,
                "sudo": sudo,
                "detached": detached,
            }))
            .send()
            .await
            .map_err(transient)?;
        let record: CommandRecord = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Fatal(e.to_string()))?;
        Ok(Arc::new(RemoteCommand {
            client: self.client.clone(),
            sandbox_id: self.sandbox_id.clone(),
            command_id: record.command_id,
        }))
    }
}

struct RemoteCommand {
    client: Arc<PlatformClient>,
    sandbox_id: String,
    command_id: String,
}

#[async_trait]
impl SandboxCommand for RemoteCommand {
    /// Stream newline-delimited JSON log records as they arrive.
    fn logs(&self) -> BoxStream<'static, LogChunk> {
        let client = self.client.clone();
        let path = format!(
            "/sandboxes/{}/commands/{}/logs",
            self.sandbox_id, self.command_id
        );
        let stream = async_stream_logs(client, path);
        stream.boxed()
    }

    async fn wait(&self) -> Result<CommandExit, SandboxError> {
        let resp = self
            .client
            .request(
                reqwest::Method::GET,
                &format!(
                    "/sandboxes/{}/commands/{}/wait",
                    self.sandbox_id, self.command_id
                ),
            )
            .send()
            .await
            .map_err(transient)?;
        let record: ExitRecord = check_status(resp)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Fatal(e.to_string()))?;
        Ok(CommandExit {
            exit_code: record.exit_code,
        })
    }

    async fn stdout(&self) -> Result<String, SandboxError> {
        let resp = self
            .client
            .request(
                reqwest::Method::GET,
                &format!(
                    "/sandboxes/{}/commands/{}/stdout",
                    self.sandbox_id, self.command_id
                ),
            )
            .send()
            .await
            .map_err(transient)?;
        check_status(resp)
            .await?
            .text()
            .await
            .map_err(|e| SandboxError::Fatal(e.to_string()))
    }
}

fn async_stream_logs(
    client: Arc<PlatformClient>,
    path: String,
) -> impl futures_util::Stream<Item = LogChunk> + Send + 'static {
    futures_util::stream::once(async move {
        let resp = client
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .ok()
            .filter(|r| r.status().is_success());
        let Some(resp) = resp else {
            return futures_util::stream::iter(Vec::new()).boxed();
        };

        // Re-chunk the byte stream on newlines and decode each JSON line.
        let mut buffer = String::new();
        resp.bytes_stream()
            .filter_map(move |bytes| {
                let mut out = Vec::new();
                if let Ok(bytes) = bytes {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(idx) = buffer.find('\n') {
                        let line: String = buffer.drain(..=idx).collect();
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if let Ok(parsed) = serde_json::from_str::<LogLine>(line) {
                            out.push(LogChunk { data: parsed.data });
                        }
                    }
                }
                futures_util::future::ready(if out.is_empty() {
                    None
                } else {
                    Some(futures_util::stream::iter(out))
                })
            })
            .flatten()
            .boxed()
    })
    .flatten()
}
