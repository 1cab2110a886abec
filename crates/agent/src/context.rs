//! Per-run state container.
//!
//! A `RunContext` is created when a run (or resume) starts and discarded
//! when its stream terminates; it is never shared across runs. Tool
//! handlers are the only writers of their own events; the runner's event
//! pump is the only reader. The context lock is held only for short,
//! non-suspending sections.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::events::ToolEvent;
use crate::project::ProjectFiles;
use crate::token::RunTokenPayload;

pub type SharedContext = Arc<Mutex<RunContext>>;

#[derive(Debug)]
pub struct RunContext {
    /// Ignore-filtered project mapping, mutated in place by project tools.
    pub project: ProjectFiles,
    /// Ordered tool-event log.
    pub events: Vec<ToolEvent>,
    /// Execution result carried by a resume request (trailing 100 KiB).
    pub exec_result: Option<String>,
    /// Set when `request_code_execution` pauses the run.
    pub defer_requested: bool,
    /// Original request fields needed to mint a fresh resume token.
    pub base_payload: RunTokenPayload,

    /// Name used when a sandbox tool omits `name`.
    pub active_sandbox: Option<String>,
    /// Sandbox name -> remote sandbox id.
    pub sandbox_ids: HashMap<String, String>,
    /// Sandbox name -> requested runtime.
    pub sandbox_runtimes: HashMap<String, String>,
    /// Sandbox name -> exposed ports.
    pub sandbox_ports: HashMap<String, Vec<u16>>,
    /// Sandbox name -> default environment for commands.
    pub sandbox_envs: HashMap<String, HashMap<String, String>>,
    /// Sandbox name -> last seen file list.
    pub sandbox_files: HashMap<String, Vec<String>>,
    /// Sandbox name -> path -> "mtime size" snapshot.
    pub sandbox_file_meta: HashMap<String, BTreeMap<String, String>>,
}

impl RunContext {
    pub fn new(
        project: ProjectFiles,
        base_payload: RunTokenPayload,
        exec_result: Option<String>,
    ) -> Self {
        Self {
            project,
            events: Vec::new(),
            exec_result,
            defer_requested: false,
            base_payload,
            active_sandbox: None,
            sandbox_ids: HashMap::new(),
            sandbox_runtimes: HashMap::new(),
            sandbox_ports: HashMap::new(),
            sandbox_envs: HashMap::new(),
            sandbox_files: HashMap::new(),
            sandbox_file_meta: HashMap::new(),
        }
    }

    pub fn shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }

    /// Allocate a tool id and record the `started` event.
    pub fn begin_tool(&mut self, name: &str, arguments: Value) -> String {
        let tool_id = format!("tc_{}", self.events.len() + 1);
        self.events.push(ToolEvent::Started {
            tool_id: tool_id.clone(),
            name: name.to_string(),
            arguments,
        });
        tool_id
    }

    pub fn complete_tool(&mut self, tool_id: &str, name: &str, output_data: Value) {
        self.events.push(ToolEvent::Completed {
            tool_id: tool_id.to_string(),
            name: name.to_string(),
            output_data,
        });
    }

    pub fn log_tool(&mut self, tool_id: &str, name: &str, data: impl Into<String>) {
        self.events.push(ToolEvent::Log {
            tool_id: tool_id.to_string(),
            name: name.to_string(),
            data: data.into(),
        });
    }

    /// Resolve the effective sandbox name: explicit, else active, else
    /// "default". First resolution also sets the active name.
    pub fn resolve_sandbox_name(&mut self, name: Option<&str>) -> String {
        let resolved = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| self.active_sandbox.clone())
            .unwrap_or_else(|| "default".to_string());
        if self.active_sandbox.is_none() {
            self.active_sandbox = Some(resolved.clone());
        }
        resolved
    }
}
