//! Contract with the remote sandbox platform.
//!
//! The session manager and play flow depend only on these traits; the
//! embedder injects the production client, tests inject scripted fakes.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum SandboxError {
    /// Worth retrying: network blips, transient write failures.
    #[error("sandbox transient error: {0}")]
    Transient(String),
    /// Not worth retrying: create/bootstrap failures, unknown sandboxes.
    #[error("sandbox error: {0}")]
    Fatal(String),
}

/// One file to write into a sandbox working directory.
#[derive(Debug, Clone)]
pub struct WriteFile {
    pub path: String,
    pub content: Vec<u8>,
}

/// One chunk from a process log stream.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub data: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandExit {
    pub exit_code: i32,
}

/// A command spawned inside a sandbox.
#[async_trait]
pub trait SandboxCommand: Send + Sync {
    /// Stream of log chunks. Consumable once per command.
    fn logs(&self) -> BoxStream<'static, LogChunk>;

    /// Wait for process exit.
    async fn wait(&self) -> Result<CommandExit, SandboxError>;

    /// Full stdout after the command settles.
    async fn stdout(&self) -> Result<String, SandboxError>;
}

/// A live remote sandbox.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn sandbox_id(&self) -> &str;

    /// Absolute working directory inside the sandbox.
    fn cwd(&self) -> &str;

    /// Public preview URL for an exposed port.
    fn domain(&self, port: u16) -> String;

    async fn write_files(&self, files: &[WriteFile]) -> Result<(), SandboxError>;

    /// Attached convenience spawn.
    async fn run_command(
        &self,
        argv0: &str,
        argv: &[String],
    ) -> Result<Arc<dyn SandboxCommand>, SandboxError>;

    async fn run_command_detached(
        &self,
        argv0: &str,
        argv: &[String],
        env: Option<&HashMap<String, String>>,
        sudo: bool,
    ) -> Result<Arc<dyn SandboxCommand>, SandboxError>;

    async fn stop(&self) -> Result<(), SandboxError>;

    /// Release the underlying client connection. Best-effort.
    async fn close(&self) {}
}

#[async_trait]
pub trait SandboxPlatform: Send + Sync {
    async fn create(
        &self,
        timeout_ms: u64,
        runtime: Option<&str>,
        ports: Option<&[u16]>,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError>;

    async fn get(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError>;
}
