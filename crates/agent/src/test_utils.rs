//! Scripted fakes for the sandbox platform and the chat gateway.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::gateway::{AssistantTurn, ChatClient, ChatMessage, FunctionCall, GatewayError, ToolCall, ToolDef};
use crate::sandbox::platform::{
    CommandExit, LogChunk, SandboxCommand, SandboxError, SandboxHandle, SandboxPlatform, WriteFile,
};
use crate::token::RunTokenPayload;
use crate::token::TokenSigner;

pub fn empty_run_payload() -> RunTokenPayload {
    RunTokenPayload {
        user_id: "u1".into(),
        message_history: Vec::new(),
        query: String::new(),
        project: crate::project::ProjectFiles::new(),
        model: None,
    }
}

pub fn test_signer() -> TokenSigner {
    TokenSigner::new(b"test-secret".to_vec(), Duration::from_secs(900))
}

/// A scripted sandbox command: delayed log chunks, an optional delayed
/// exit (never exits when `None`), and a canned stdout.
pub struct FakeCommand {
    chunks: Vec<(Duration, String)>,
    exit: Option<(Duration, i32)>,
    stdout_value: String,
}

impl FakeCommand {
    pub fn finished(stdout: &str, exit_code: i32) -> Arc<Self> {
        Arc::new(Self {
            chunks: Vec::new(),
            exit: Some((Duration::ZERO, exit_code)),
            stdout_value: stdout.to_string(),
        })
    }

    pub fn with_logs(chunks: Vec<(Duration, &str)>, exit: Option<(Duration, i32)>) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks
                .into_iter()
                .map(|(d, s)| (d, s.to_string()))
                .collect(),
            exit,
            stdout_value: String::new(),
        })
    }
}

#[async_trait]
impl SandboxCommand for FakeCommand {
    fn logs(&self) -> BoxStream<'static, LogChunk> {
        let chunks = self.chunks.clone();
        futures_util::stream::iter(chunks)
            .then(|(delay, data)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                LogChunk { data }
            })
            .boxed()
    }

    async fn wait(&self) -> Result<CommandExit, SandboxError> {
        match self.exit {
            Some((delay, exit_code)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(CommandExit { exit_code })
            }
            None => futures_util::future::pending().await,
        }
    }

    async fn stdout(&self) -> Result<String, SandboxError> {
        Ok(self.stdout_value.clone())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedSpawn {
    pub argv0: String,
    pub argv: Vec<String>,
    pub env: Option<HashMap<String, String>>,
    pub sudo: bool,
    pub detached: bool,
}

pub struct FakeHandle {
    id: String,
    cwd: String,
    pub writes: Mutex<Vec<Vec<WriteFile>>>,
    pub write_failures: AtomicUsize,
    pub spawns: Mutex<Vec<RecordedSpawn>>,
    detached_script: Mutex<VecDeque<Arc<FakeCommand>>>,
    attached_script: Mutex<VecDeque<Arc<FakeCommand>>>,
    pub stopped: AtomicBool,
    pub closed: AtomicBool,
}

impl FakeHandle {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            cwd: "/sandbox".to_string(),
            writes: Mutex::new(Vec::new()),
            write_failures: AtomicUsize::new(0),
            spawns: Mutex::new(Vec::new()),
            detached_script: Mutex::new(VecDeque::new()),
            attached_script: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Queue the command returned by the next `run_command_detached`.
    pub fn push_detached(&self, cmd: Arc<FakeCommand>) {
        self.detached_script.lock().push_back(cmd);
    }

    /// Queue the command returned by the next `run_command` (snapshots,
    /// file sampling).
    pub fn push_attached(&self, cmd: Arc<FakeCommand>) {
        self.attached_script.lock().push_back(cmd);
    }

    pub fn written_paths(&self) -> Vec<String> {
        self.writes
            .lock()
            .iter()
            .flatten()
            .map(|f| f.path.clone())
            .collect()
    }
}

#[async_trait]
impl SandboxHandle for FakeHandle {
    fn sandbox_id(&self) -> &str {
        &self.id
    }

    fn cwd(&self) -> &str {
        &self.cwd
    }

    fn domain(&self, port: u16) -> String {
        format!("https://{}-{}.sandbox.test", self.id, port)
    }

    async fn write_files(&self, files: &[WriteFile]) -> Result<(), SandboxError> {
        if self.write_failures.load(Ordering::SeqCst) > 0 {
            self.write_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(SandboxError::Transient("write_files blip".into()));
        }
        self.writes.lock().push(files.to_vec());
        Ok(())
    }

    async fn run_command(
        &self,
        argv0: &str,
        argv: &[String],
    ) -> Result<Arc<dyn SandboxCommand>, SandboxError> {
        self.spawns.lock().push(RecordedSpawn {
            argv0: argv0.to_string(),
            argv: argv.to_vec(),
            env: None,
            sudo: false,
            detached: false,
        });
        let cmd = self
            .attached_script
            .lock()
            .pop_front()
            .unwrap_or_else(|| FakeCommand::finished("", 0));
        Ok(cmd)
    }

    async fn run_command_detached(
        &self,
        argv0: &str,
        argv: &[String],
        env: Option<&HashMap<String, String>>,
        sudo: bool,
    ) -> Result<Arc<dyn SandboxCommand>, SandboxError> {
        self.spawns.lock().push(RecordedSpawn {
            argv0: argv0.to_string(),
            argv: argv.to_vec(),
            env: env.cloned(),
            sudo,
            detached: true,
        });
        let cmd = self
            .detached_script
            .lock()
            .pop_front()
            .unwrap_or_else(|| FakeCommand::finished("", 0));
        Ok(cmd)
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakePlatform {
    queued: Mutex<VecDeque<Arc<FakeHandle>>>,
    pub created: Mutex<Vec<(u64, Option<String>, Option<Vec<u16>>)>>,
    by_id: Mutex<HashMap<String, Arc<FakeHandle>>>,
    pub fail_create: AtomicBool,
    counter: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the handle returned by the next `create`.
    pub fn push_handle(&self, handle: Arc<FakeHandle>) {
        self.by_id
            .lock()
            .insert(handle.sandbox_id().to_string(), handle.clone());
        self.queued.lock().push_back(handle);
    }

    pub fn handle(&self, sandbox_id: &str) -> Option<Arc<FakeHandle>> {
        self.by_id.lock().get(sandbox_id).cloned()
    }
}

#[async_trait]
impl SandboxPlatform for FakePlatform {
    async fn create(
        &self,
        timeout_ms: u64,
        runtime: Option<&str>,
        ports: Option<&[u16]>,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::Fatal("create refused".into()));
        }
        self.created.lock().push((
            timeout_ms,
            runtime.map(str::to_string),
            ports.map(<[u16]>::to_vec),
        ));
        let handle = self.queued.lock().pop_front().unwrap_or_else(|| {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            FakeHandle::new(&format!("sb_{n}"))
        });
        self.by_id
            .lock()
            .insert(handle.sandbox_id().to_string(), handle.clone());
        Ok(handle)
    }

    async fn get(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        self.by_id
            .lock()
            .get(sandbox_id)
            .cloned()
            .map(|h| h as Arc<dyn SandboxHandle>)
            .ok_or_else(|| SandboxError::Fatal(format!("unknown sandbox: {sandbox_id}")))
    }
}

/// Chat client that replays scripted assistant turns.
#[derive(Default)]
pub struct FakeChat {
    turns: Mutex<VecDeque<AssistantTurn>>,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl FakeChat {
    pub fn scripted(turns: Vec<AssistantTurn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    pub fn turn_with_calls(calls: Vec<ToolCall>) -> AssistantTurn {
        AssistantTurn {
            content: None,
            tool_calls: calls,
        }
    }

    pub fn final_turn(content: &str) -> AssistantTurn {
        AssistantTurn {
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
        }
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: &[ToolDef],
    ) -> Result<AssistantTurn, GatewayError> {
        self.requests.lock().push(messages.to_vec());
        Ok(self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| AssistantTurn {
                content: Some("done".into()),
                tool_calls: Vec::new(),
            }))
    }
}

/// Chat client that always fails; used for the exception surfacing path.
pub struct FailingChat;

#[async_trait]
impl ChatClient for FailingChat {
    async fn chat(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _tools: &[ToolDef],
    ) -> Result<AssistantTurn, GatewayError> {
        Err(GatewayError::Api {
            status: 500,
            body: "gateway down".into(),
        })
    }
}
