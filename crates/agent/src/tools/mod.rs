//! Agent-callable tools.
//!
//! Every tool appends a `started` event, performs its effect, appends a
//! `completed` event with the same tool id, and returns a short string to
//! the agent. Domain failures (missing files, bad ranges, sandbox errors)
//! are carried inside `output_data.error` and the run continues.

pub mod execution;
pub mod project_tools;
pub mod sandbox_tools;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::context::SharedContext;
use crate::gateway::ToolDef;
use crate::sandbox::SessionManager;

pub use execution::RequestCodeExecutionTool;
pub use project_tools::{
    CreateFileTool, CreateFolderTool, DeleteFileTool, DeleteFolderTool, EditCodeTool,
    RenameFileTool, RenameFolderTool, ThinkTool,
};
pub use sandbox_tools::{
    SandboxCreateTool, SandboxRunTool, SandboxSetEnvTool, SandboxShowPreviewTool, SandboxStopTool,
};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("tool error: {0}")]
    Internal(String),
}

/// Everything a tool handler can reach during a run.
#[derive(Clone)]
pub struct ToolCtx {
    pub context: SharedContext,
    pub sessions: Arc<SessionManager>,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Function-tool schema advertised to the model.
    fn definition(&self) -> ToolDef;

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError>;
}

/// Deserialize tool-call arguments into their typed form.
pub(crate) fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Registry of available tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// The full built-in tool set for agent runs.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry
            .add(Arc::new(ThinkTool))
            .add(Arc::new(EditCodeTool))
            .add(Arc::new(CreateFileTool))
            .add(Arc::new(DeleteFileTool))
            .add(Arc::new(RenameFileTool))
            .add(Arc::new(CreateFolderTool))
            .add(Arc::new(DeleteFolderTool))
            .add(Arc::new(RenameFolderTool))
            .add(Arc::new(RequestCodeExecutionTool))
            .add(Arc::new(SandboxCreateTool))
            .add(Arc::new(SandboxStopTool))
            .add(Arc::new(SandboxRunTool))
            .add(Arc::new(SandboxSetEnvTool))
            .add(Arc::new(SandboxShowPreviewTool));
        registry
    }

    pub fn add(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_the_full_tool_surface() {
        let registry = ToolRegistry::builtin();
        for name in [
            "think",
            "edit_code",
            "create_file",
            "delete_file",
            "rename_file",
            "create_folder",
            "delete_folder",
            "rename_folder",
            "request_code_execution",
            "sandbox_create",
            "sandbox_stop",
            "sandbox_run",
            "sandbox_set_env",
            "sandbox_show_preview",
        ] {
            assert!(registry.find(name).is_some(), "missing tool {name}");
        }
        assert_eq!(registry.names().len(), 14);
    }

    #[test]
    fn definitions_are_function_tools_with_schemas() {
        let registry = ToolRegistry::builtin();
        for def in registry.definitions() {
            assert_eq!(def.tool_type, "function");
            assert!(!def.function.description.is_empty());
            assert_eq!(def.function.parameters["type"], "object");
        }
    }
}
