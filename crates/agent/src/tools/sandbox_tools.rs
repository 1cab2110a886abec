//! Sandbox orchestration tools. The heavy lifting lives in
//! `sandbox::SessionManager`; env and preview declarations are handled
//! here because they only touch the run context.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::gateway::{FunctionDef, ToolDef};
use crate::sandbox::heuristics::parse_env_list;
use crate::sandbox::session::{CreateParams, RunParams};
use crate::tools::{Tool, ToolCtx, ToolError, parse_args};

fn function_def(name: &str, description: &str, parameters: Value) -> ToolDef {
    ToolDef {
        tool_type: "function".to_string(),
        function: FunctionDef {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        },
    }
}

// ── sandbox_create ─────────────────────────────────────────────────────

pub struct SandboxCreateTool;

#[async_trait]
impl Tool for SandboxCreateTool {
    fn name(&self) -> &str {
        "sandbox_create"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Create a persistent sandbox and remember it for this run. Ruby and Go \
             runtimes are bootstrapped on a node base image.",
            json!({
                "type": "object",
                "properties": {
                    "runtime": {"type": "string", "description": "Runtime, e.g. \"node22\", \"python3.13\", \"ruby3.2\"."},
                    "ports": {"type": "array", "items": {"type": "integer"}, "description": "Ports to expose for previews."},
                    "timeout_ms": {"type": "integer", "description": "Sandbox lifetime timeout in milliseconds."},
                    "name": {"type": "string", "description": "Name for addressing this sandbox later."}
                }
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let params: CreateParams = parse_args(args)?;
        Ok(ctx.sessions.create(&ctx.context, params).await)
    }
}

// ── sandbox_stop ───────────────────────────────────────────────────────

pub struct SandboxStopTool;

#[derive(Deserialize)]
struct StopArgs {
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl Tool for SandboxStopTool {
    fn name(&self) -> &str {
        "sandbox_stop"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Stop and release the specified sandbox (or the active/default one).",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Sandbox name; defaults to the active sandbox."}
                }
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: StopArgs = parse_args(args)?;
        Ok(ctx.sessions.stop(&ctx.context, args.name.as_deref()).await)
    }
}

// ── sandbox_run ────────────────────────────────────────────────────────

pub struct SandboxRunTool;

#[async_trait]
impl Tool for SandboxRunTool {
    fn name(&self) -> &str {
        "sandbox_run"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Run a shell command in the active sandbox, optionally streaming logs and \
             detecting readiness. Returns status, exit code, preview URL, and a \
             filesystem delta.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to run."},
                    "cwd": {"type": "string", "description": "Working directory inside the sandbox; defaults to the sandbox cwd."},
                    "env": {"type": "array", "items": {"type": "string"}, "description": "Extra environment variables as KEY=VALUE entries."},
                    "detached": {"type": "boolean", "description": "If true, do not wait for process exit."},
                    "ready_patterns": {"type": "array", "items": {"type": "string"}, "description": "Return once any pattern appears in the logs."},
                    "port": {"type": "integer", "description": "Compute a preview URL from this port when ready."},
                    "wait_timeout_ms": {"type": "integer", "description": "Max time to wait for readiness when detached."},
                    "stream_logs": {"type": "boolean", "description": "Stream logs into the run timeline."},
                    "name": {"type": "string", "description": "Sandbox name; defaults to the active sandbox."},
                    "auto_python_ensure": {"type": "boolean", "description": "Auto-ensure Python tooling for Python commands."},
                    "auto_ready_patterns": {"type": "boolean", "description": "Auto-detect common server readiness banners."},
                    "auto_ruby_ensure": {"type": "boolean", "description": "Auto-ensure Ruby and Bundler for Ruby commands."},
                    "auto_go_ensure": {"type": "boolean", "description": "Auto-ensure the Go toolchain for Go commands."}
                },
                "required": ["command"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let params: RunParams = parse_args(args)?;
        Ok(ctx.sessions.run(&ctx.context, params).await)
    }
}

// ── sandbox_set_env ────────────────────────────────────────────────────

pub struct SandboxSetEnvTool;

#[derive(Deserialize)]
struct SetEnvArgs {
    env: Vec<String>,
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl Tool for SandboxSetEnvTool {
    fn name(&self) -> &str {
        "sandbox_set_env"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Set default environment variables for subsequent sandbox_run commands in \
             a named sandbox (or the active/default one).",
            json!({
                "type": "object",
                "properties": {
                    "env": {"type": "array", "items": {"type": "string"}, "description": "KEY=VALUE entries."},
                    "name": {"type": "string", "description": "Sandbox name; defaults to the active sandbox."}
                },
                "required": ["env"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: SetEnvArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let sb_name = guard.resolve_sandbox_name(args.name.as_deref());
        let tool_id = guard.begin_tool(self.name(), json!({"env": args.env, "name": sb_name}));

        let parsed = parse_env_list(&args.env);
        let per_env = guard.sandbox_envs.entry(sb_name.clone()).or_default();
        for (key, value) in &parsed {
            per_env.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let mut keys: Vec<&String> = parsed.keys().collect();
        keys.sort();
        let output = json!({"ok": true, "env_keys": keys, "name": sb_name});
        guard.complete_tool(&tool_id, self.name(), output.clone());
        Ok(output.to_string())
    }
}

// ── sandbox_show_preview ───────────────────────────────────────────────

pub struct SandboxShowPreviewTool;

#[derive(Deserialize)]
struct ShowPreviewArgs {
    url: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl Tool for SandboxShowPreviewTool {
    fn name(&self) -> &str {
        "sandbox_show_preview"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Emit a preview URL for the active sandbox so the UI can render it.",
            json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "The full preview URL."},
                    "port": {"type": "integer", "description": "Port used by the service."},
                    "label": {"type": "string", "description": "Descriptive label, e.g. 'frontend'."},
                    "name": {"type": "string", "description": "Sandbox name; defaults to the active sandbox."}
                },
                "required": ["url"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: ShowPreviewArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let sb_name = guard.resolve_sandbox_name(args.name.as_deref());
        let tool_id = guard.begin_tool(
            self.name(),
            json!({"url": args.url, "port": args.port, "label": args.label, "name": sb_name}),
        );

        let mut output = json!({"url": args.url, "name": sb_name});
        if let Some(port) = args.port {
            output["port"] = json!(port);
        }
        if let Some(label) = &args.label {
            output["label"] = json!(label);
        }
        guard.complete_tool(&tool_id, self.name(), output.clone());
        Ok(output.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunContext;
    use crate::project::ProjectFiles;
    use crate::sandbox::{HandleCache, SessionManager};
    use crate::test_utils::{FakePlatform, empty_run_payload};
    use std::sync::Arc;

    fn tool_ctx() -> ToolCtx {
        ToolCtx {
            context: RunContext::new(ProjectFiles::new(), empty_run_payload(), None).shared(),
            sessions: Arc::new(SessionManager::new(
                FakePlatform::new(),
                Arc::new(HandleCache::new()),
            )),
        }
    }

    #[tokio::test]
    async fn set_env_keeps_existing_keys() {
        let ctx = tool_ctx();
        SandboxSetEnvTool
            .call(json!({"env": ["A=1", "B=2"]}), &ctx)
            .await
            .unwrap();
        // A second call must not clobber keys set earlier.
        let result = SandboxSetEnvTool
            .call(json!({"env": ["A=override", "C=3"]}), &ctx)
            .await
            .unwrap();

        let output: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(output["ok"], true);
        assert_eq!(output["name"], "default");

        let guard = ctx.context.lock();
        let env = &guard.sandbox_envs["default"];
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "2");
        assert_eq!(env["C"], "3");
    }

    #[tokio::test]
    async fn show_preview_echoes_optional_fields() {
        let ctx = tool_ctx();
        let result = SandboxShowPreviewTool
            .call(
                json!({"url": "https://x.test", "port": 3000, "label": "frontend"}),
                &ctx,
            )
            .await
            .unwrap();
        let output: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(output["url"], "https://x.test");
        assert_eq!(output["port"], 3000);
        assert_eq!(output["label"], "frontend");

        let guard = ctx.context.lock();
        assert_eq!(guard.events.len(), 2);
    }

    #[tokio::test]
    async fn stop_without_a_sandbox_reports_no_sandbox() {
        let ctx = tool_ctx();
        let result = SandboxStopTool.call(json!({}), &ctx).await.unwrap();
        let output: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(output["stopped"], false);
        assert_eq!(output["error"], "no sandbox");
    }
}
