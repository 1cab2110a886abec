//! Named sandbox lifecycle, project sync, command execution, FS deltas.
//!
//! One `SessionManager` serves the whole process; per-run naming state
//! lives in the `RunContext` tables. All remote failures are folded into
//! the tool's `completed` payload (`{"error": ...}`) so the agent can
//! observe and react; nothing here aborts a run.

use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::SharedContext;
use crate::ignore_rules::IgnorePredicate;
use crate::sandbox::cache::HandleCache;
use crate::sandbox::heuristics::{
    CommandTraits, PYTHON_ENSURE_SH, auto_ready_patterns, infer_port, parse_env_list,
    prepare_rails_server, safe_cwd, wrap_with_bundler,
};
use crate::sandbox::platform::{
    SandboxCommand, SandboxError, SandboxHandle, SandboxPlatform, WriteFile,
};
use crate::sandbox::runtime_plan::{BUNDLER_INSTALL_SH, GO_INSTALL_SH, RUBY_INSTALL_SH, RuntimePlan};

const DEFAULT_SANDBOX_TIMEOUT_MS: u64 = 600_000;
const SYNC_CHUNK_SIZE: usize = 64;
const SYNC_MAX_RETRIES: u32 = 3;
const SYNC_BACKOFF_MS: u64 = 250;
const SNAPSHOT_SAMPLE_LIMIT: usize = 50;
const SNAPSHOT_SAMPLE_MAX_BYTES: u64 = 200_000;
const TRANSCRIPT_LIMIT_BYTES: usize = 16 * 1024;

fn default_true() -> bool {
    true
}

fn default_wait_timeout_ms() -> Option<u64> {
    Some(30_000)
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CreateParams {
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub ports: Option<Vec<u16>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunParams {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub detached: bool,
    #[serde(default)]
    pub ready_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub stream_logs: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub auto_python_ensure: bool,
    #[serde(default = "default_true")]
    pub auto_ready_patterns: bool,
    #[serde(default = "default_true")]
    pub auto_ruby_ensure: bool,
    #[serde(default = "default_true")]
    pub auto_go_ensure: bool,
}

#[derive(Default)]
struct RaceState {
    ready: bool,
    timed_out: bool,
    exited_early: bool,
    exit_code: Option<i32>,
    preview_url: Option<String>,
    collected: String,
}

pub struct SessionManager {
    platform: Arc<dyn SandboxPlatform>,
    cache: Arc<HandleCache>,
}

impl SessionManager {
    pub fn new(platform: Arc<dyn SandboxPlatform>, cache: Arc<HandleCache>) -> Self {
        Self { platform, cache }
    }

    pub fn platform(&self) -> &Arc<dyn SandboxPlatform> {
        &self.platform
    }

    /// Look up the sandbox for `name`, creating one with the stored
    /// per-name preferences when none exists yet.
    pub async fn get_or_create(
        &self,
        ctx: &SharedContext,
        name: &str,
    ) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        let sid = ctx.lock().sandbox_ids.get(name).cloned();
        if let Some(sid) = sid {
            if let Some(handle) = self.cache.get(&sid) {
                return Ok(handle);
            }
            let handle = self.platform.get(&sid).await?;
            self.cache.insert(handle.clone());
            return Ok(handle);
        }

        let (runtime, ports) = {
            let guard = ctx.lock();
            (
                guard.sandbox_runtimes.get(name).cloned(),
                guard.sandbox_ports.get(name).cloned(),
            )
        };
        let plan = RuntimePlan::resolve(runtime.as_deref());
        let handle = self
            .platform
            .create(
                DEFAULT_SANDBOX_TIMEOUT_MS,
                plan.effective.as_deref(),
                ports.as_deref(),
            )
            .await?;
        {
            let mut guard = ctx.lock();
            guard
                .sandbox_ids
                .insert(name.to_string(), handle.sandbox_id().to_string());
            guard.active_sandbox = Some(name.to_string());
        }
        self.cache.insert(handle.clone());
        if self.sync_project(ctx, handle.as_ref()).await.is_ok() {
            self.snapshot_into_context(ctx, handle.as_ref(), name).await;
        }
        Ok(handle)
    }

    /// `sandbox_create` tool body: create, sync, bootstrap, snapshot.
    /// Appends its own started/log/completed events; returns the string
    /// handed back to the agent.
    pub async fn create(&self, ctx: &SharedContext, params: CreateParams) -> String {
        let (name, tool_id) = {
            let mut guard = ctx.lock();
            let name = guard.resolve_sandbox_name(params.name.as_deref());
            let tool_id = guard.begin_tool(
                "sandbox_create",
                json!({
                    "runtime": params.runtime,
                    "ports": params.ports,
                    "timeout_ms": params.timeout_ms,
                    "name": name,
                }),
            );
            (name, tool_id)
        };

        let plan = RuntimePlan::resolve(params.runtime.as_deref());
        let timeout_ms = params.timeout_ms.unwrap_or(DEFAULT_SANDBOX_TIMEOUT_MS);

        let handle = match self
            .platform
            .create(timeout_ms, plan.effective.as_deref(), params.ports.as_deref())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(name = %name, error = %e, "sandbox create failed");
                let output = json!({"error": format!("Sandbox create failed: {e}"), "name": name});
                ctx.lock().complete_tool(&tool_id, "sandbox_create", output.clone());
                return output.to_string();
            }
        };
        info!(name = %name, sandbox_id = %handle.sandbox_id(), "sandbox created");

        {
            let mut guard = ctx.lock();
            guard
                .sandbox_ids
                .insert(name.clone(), handle.sandbox_id().to_string());
            guard.active_sandbox = Some(name.clone());
            if let Some(label) = plan.label() {
                guard.sandbox_runtimes.insert(name.clone(), label);
            }
            if let Some(ports) = &params.ports {
                guard.sandbox_ports.insert(name.clone(), ports.clone());
            }
        }
        self.cache.insert(handle.clone());

        let mut synced = 0usize;
        match self.sync_project(ctx, handle.as_ref()).await {
            Ok(count) => {
                synced = count;
                self.snapshot_into_context(ctx, handle.as_ref(), &name).await;
                ctx.lock().log_tool(
                    &tool_id,
                    "sandbox_create",
                    format!("Synced {count} project files to sandbox.\n"),
                );
            }
            Err(e) => {
                ctx.lock().log_tool(
                    &tool_id,
                    "sandbox_create",
                    format!("Project sync error: {e}\n"),
                );
            }
        }

        if plan.synthetic.is_some() {
            self.bootstrap_synthetic(ctx, handle.as_ref(), &name, &tool_id, &plan)
                .await;
            // Bootstrap can generate files (Gemfile, binstubs); refresh the
            // baseline so the first run's delta does not re-report them.
            self.snapshot_into_context(ctx, handle.as_ref(), &name).await;
        }

        let mut output = Map::new();
        output.insert("sandbox_id".into(), json!(handle.sandbox_id()));
        output.insert("runtime".into(), json!(plan.label()));
        output.insert("ports".into(), json!(params.ports));
        output.insert("synced_files".into(), json!(synced));
        output.insert("name".into(), json!(name));
        if plan.synthetic.is_some() {
            output.insert("synthetic_runtime".into(), json!(true));
            output.insert("effective_runtime".into(), json!(plan.effective));
        }
        let output = Value::Object(output);
        ctx.lock().complete_tool(&tool_id, "sandbox_create", output.clone());
        output.to_string()
    }

    async fn bootstrap_synthetic(
        &self,
        ctx: &SharedContext,
        handle: &dyn SandboxHandle,
        name: &str,
        tool_id: &str,
        plan: &RuntimePlan,
    ) {
        if let Some(banner) = plan.banner() {
            ctx.lock().log_tool(tool_id, "sandbox_create", banner);
        }
        for step in plan.bootstrap_steps(handle.cwd()) {
            let spawned = handle
                .run_command_detached(
                    "bash",
                    &["-lc".to_string(), step.script.clone()],
                    None,
                    step.sudo,
                )
                .await;
            match spawned {
                Ok(cmd) => {
                    self.pump_command_logs(ctx, tool_id, "sandbox_create", cmd.as_ref(), true)
                        .await;
                    let _ = cmd.wait().await;
                }
                Err(e) => {
                    ctx.lock().log_tool(
                        tool_id,
                        "sandbox_create",
                        format!("Bootstrap error: {e}\n"),
                    );
                    return;
                }
            }
        }

        let defaults = plan.env_defaults(handle.cwd());
        if !defaults.is_empty() {
            let mut guard = ctx.lock();
            let per_env = guard.sandbox_envs.entry(name.to_string()).or_default();
            per_env.extend(defaults);
        }
        if let Some(message) = plan.ready_message() {
            ctx.lock().log_tool(tool_id, "sandbox_create", message);
        }
    }

    /// `sandbox_stop` tool body.
    pub async fn stop(&self, ctx: &SharedContext, name: Option<&str>) -> String {
        let (sb_name, tool_id, sid) = {
            let mut guard = ctx.lock();
            let sb_name = guard.resolve_sandbox_name(name);
            let tool_id = guard.begin_tool("sandbox_stop", json!({"name": sb_name}));
            let sid = guard.sandbox_ids.get(&sb_name).cloned();
            (sb_name, tool_id, sid)
        };

        let output = match sid {
            None => json!({"stopped": false, "error": "no sandbox"}),
            Some(sid) => match self.stop_by_id(&sid).await {
                Ok(()) => {
                    let mut guard = ctx.lock();
                    guard.sandbox_ids.remove(&sb_name);
                    guard.sandbox_envs.remove(&sb_name);
                    guard.sandbox_files.remove(&sb_name);
                    guard.sandbox_file_meta.remove(&sb_name);
                    if guard.active_sandbox.as_deref() == Some(sb_name.as_str()) {
                        guard.active_sandbox = None;
                    }
                    json!({"stopped": true})
                }
                Err(e) => json!({"stopped": false, "error": e.to_string()}),
            },
        };
        ctx.lock().complete_tool(&tool_id, "sandbox_stop", output.clone());
        output.to_string()
    }

    /// Stop and evict one sandbox by id (also used by the play DELETE).
    pub async fn stop_by_id(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let handle = match self.cache.get(sandbox_id) {
            Some(handle) => handle,
            None => self.platform.get(sandbox_id).await?,
        };
        handle.stop().await?;
        // best-effort refresh of the remote record
        let _ = self.platform.get(sandbox_id).await;
        handle.close().await;
        self.cache.remove(sandbox_id);
        Ok(())
    }

    /// Stream every (ignore-filtered) project file into the sandbox in
    /// chunks, retrying transient failures with exponential backoff.
    pub async fn sync_project(
        &self,
        ctx: &SharedContext,
        handle: &dyn SandboxHandle,
    ) -> Result<usize, SandboxError> {
        let to_write: Vec<WriteFile> = {
            let guard = ctx.lock();
            let predicate = IgnorePredicate::build(&guard.project);
            guard
                .project
                .iter()
                .filter(|(path, _)| !predicate.is_ignored(path))
                .filter_map(|(path, content)| {
                    let path = path.trim_start_matches("./");
                    if path.is_empty() {
                        return None;
                    }
                    Some(WriteFile {
                        path: path.to_string(),
                        content: content.as_bytes().to_vec(),
                    })
                })
                .collect()
        };

        let written = to_write.len();
        for chunk in to_write.chunks(SYNC_CHUNK_SIZE) {
            let mut attempt: u32 = 0;
            loop {
                match handle.write_files(chunk).await {
                    Ok(()) => break,
                    Err(e) => {
                        attempt += 1;
                        if attempt > SYNC_MAX_RETRIES {
                            return Err(e);
                        }
                        let backoff = SYNC_BACKOFF_MS * 2u64.pow(attempt - 1);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        Ok(written)
    }

    fn find_script(cwd: &str) -> String {
        format!(
            "cd {cwd} && find . \\( -path './.git/*' -o -path './node_modules/*' \
             -o -path './vendor/*' -o -path './.bundle/*' -o -path './.cache/*' \
             -o -path './tmp/*' -o -path './log/*' -o -path './logs/*' \\) -prune \
             -o -type f -printf '%P\\t%T@\\t%s\\n' 2>/dev/null | sort"
        )
    }

    async fn snapshot_raw(
        &self,
        handle: &dyn SandboxHandle,
    ) -> Result<BTreeMap<String, String>, SandboxError> {
        let cmd = handle
            .run_command(
                "bash",
                &["-lc".to_string(), Self::find_script(handle.cwd())],
            )
            .await?;
        let out = cmd.stdout().await?;
        let mut current = BTreeMap::new();
        for line in out.lines() {
            let mut parts = line.splitn(3, '\t');
            let (Some(rel), Some(mtime), Some(size)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            current.insert(rel.to_string(), format!("{mtime} {size}"));
        }
        Ok(current)
    }

    /// Record the current (ignore-filtered) sandbox file listing in the
    /// per-name context tables. Best-effort.
    pub async fn snapshot_into_context(
        &self,
        ctx: &SharedContext,
        handle: &dyn SandboxHandle,
        name: &str,
    ) {
        let Ok(current) = self.snapshot_raw(handle).await else {
            return;
        };
        let mut guard = ctx.lock();
        let predicate = IgnorePredicate::build(&guard.project);
        let filtered: BTreeMap<String, String> = current
            .into_iter()
            .filter(|(path, _)| !predicate.is_ignored(path))
            .collect();
        guard
            .sandbox_files
            .insert(name.to_string(), filtered.keys().cloned().collect());
        guard.sandbox_file_meta.insert(name.to_string(), filtered);
    }

    /// Compute created/updated/deleted against the previous snapshot,
    /// sample small created+updated files, refresh the context tables.
    pub async fn snapshot_delta(
        &self,
        ctx: &SharedContext,
        handle: &dyn SandboxHandle,
        name: &str,
    ) -> Value {
        let current = match self.snapshot_raw(handle).await {
            Ok(current) => current,
            Err(e) => return json!({"files": [], "error": e.to_string()}),
        };

        let (prev, predicate) = {
            let guard = ctx.lock();
            (
                guard.sandbox_file_meta.get(name).cloned().unwrap_or_default(),
                IgnorePredicate::build(&guard.project),
            )
        };
        let current: BTreeMap<String, String> = current
            .into_iter()
            .filter(|(path, _)| !predicate.is_ignored(path))
            .collect();

        let mut created = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();
        for (path, meta) in &current {
            match prev.get(path) {
                None => created.push(path.clone()),
                Some(prev_meta) if prev_meta != meta => updated.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in prev.keys() {
            if !current.contains_key(path) {
                deleted.push(path.clone());
            }
        }

        let files: Vec<String> = current.keys().cloned().collect();
        {
            let mut guard = ctx.lock();
            guard.sandbox_files.insert(name.to_string(), files.clone());
            guard
                .sandbox_file_meta
                .insert(name.to_string(), current.clone());
        }

        let mut data = Vec::new();
        let sample_paths: Vec<&String> = created.iter().chain(updated.iter()).collect();
        for path in sample_paths.into_iter().take(SNAPSHOT_SAMPLE_LIMIT) {
            if let Some(content) = self.sample_file(handle, path).await {
                data.push(json!({"path": path, "encoding": "base64", "content": content}));
            }
        }

        json!({
            "files": files,
            "created": created,
            "updated": updated,
            "deleted": deleted,
            "data": data,
        })
    }

    async fn sample_file(&self, handle: &dyn SandboxHandle, path: &str) -> Option<String> {
        let safe = path.replace('"', "\\\"");
        let script = format!(
            "cd {cwd} && if [ -f '{safe}' ] && \
             [ $(stat -c %s '{safe}' 2>/dev/null || stat -f %z '{safe}') -le {max} ]; then \
             base64 '{safe}'; else echo '__SKIP__'; fi",
            cwd = handle.cwd(),
            max = SNAPSHOT_SAMPLE_MAX_BYTES,
        );
        let cmd = handle
            .run_command("bash", &["-lc".to_string(), script])
            .await
            .ok()?;
        let out = cmd.stdout().await.ok()?;
        let out = out.trim().to_string();
        if out.is_empty() || out == "__SKIP__" {
            return None;
        }
        Some(out)
    }

    async fn pump_command_logs(
        &self,
        ctx: &SharedContext,
        tool_id: &str,
        name: &str,
        cmd: &dyn SandboxCommand,
        stream_logs: bool,
    ) {
        use futures_util::StreamExt;
        let mut logs = cmd.logs();
        while let Some(chunk) = logs.next().await {
            if stream_logs {
                ctx.lock().log_tool(tool_id, name, chunk.data);
            }
        }
    }

    async fn run_ensure_step(
        &self,
        ctx: &SharedContext,
        handle: &dyn SandboxHandle,
        tool_id: &str,
        script: String,
        env: &HashMap<String, String>,
        sudo: bool,
        stream_logs: bool,
    ) {
        let env_opt = if env.is_empty() { None } else { Some(env) };
        match handle
            .run_command_detached("bash", &["-lc".to_string(), script], env_opt, sudo)
            .await
        {
            Ok(cmd) => {
                self.pump_command_logs(ctx, tool_id, "sandbox_run", cmd.as_ref(), stream_logs)
                    .await;
                let _ = cmd.wait().await;
            }
            Err(e) => {
                ctx.lock()
                    .log_tool(tool_id, "sandbox_run", format!("Setup step failed: {e}\n"));
            }
        }
    }

    /// `sandbox_run` tool body. Appends its own events; returns the
    /// transcript summary handed back to the agent.
    pub async fn run(&self, ctx: &SharedContext, params: RunParams) -> String {
        let sb_name = ctx.lock().resolve_sandbox_name(params.name.as_deref());
        let handle = match self.get_or_create(ctx, &sb_name).await {
            Ok(handle) => handle,
            Err(e) => {
                let mut guard = ctx.lock();
                let tool_id = guard.begin_tool(
                    "sandbox_run",
                    json!({"command": params.command, "name": sb_name}),
                );
                let output = json!({"error": format!("Sandbox unavailable: {e}"), "name": sb_name});
                guard.complete_tool(&tool_id, "sandbox_run", output.clone());
                return output.to_string();
            }
        };

        let base_cwd = handle.cwd().to_string();
        let mut cwd = safe_cwd(&base_cwd, params.cwd.as_deref());
        let traits = CommandTraits::classify(&params.command);

        // Rails app-root heuristic: when exactly one <app>/bin/rails exists
        // in the last snapshot, run Rails commands from that directory.
        if traits.rails_cwd_candidate(&params.command, params.cwd.as_deref()) {
            let files = ctx
                .lock()
                .sandbox_files
                .get(&sb_name)
                .cloned()
                .unwrap_or_default();
            let roots: Vec<&str> = files
                .iter()
                .filter_map(|p| p.strip_suffix("/bin/rails"))
                .collect();
            if let [root] = roots.as_slice() {
                cwd = format!("{base_cwd}/{root}").trim_end_matches('/').to_string();
            }
        }

        let tool_id = ctx.lock().begin_tool(
            "sandbox_run",
            json!({
                "command": params.command,
                "cwd": cwd,
                "requested_cwd": params.cwd,
                "env": params.env,
                "detached": params.detached,
                "ready_patterns": params.ready_patterns,
                "port": params.port,
                "wait_timeout_ms": params.wait_timeout_ms,
                "stream_logs": params.stream_logs,
                "name": sb_name,
            }),
        );

        // Fresh project state before executing anything.
        match self.sync_project(ctx, handle.as_ref()).await {
            Ok(count) => {
                self.snapshot_into_context(ctx, handle.as_ref(), &sb_name).await;
                if params.stream_logs {
                    ctx.lock().log_tool(
                        &tool_id,
                        "sandbox_run",
                        format!("Synced {count} project files to sandbox before run.\n"),
                    );
                }
            }
            Err(e) => {
                if params.stream_logs {
                    ctx.lock().log_tool(
                        &tool_id,
                        "sandbox_run",
                        format!("Pre-run sync failed: {e}\n"),
                    );
                }
            }
        }

        let mut full_env = ctx
            .lock()
            .sandbox_envs
            .get(&sb_name)
            .cloned()
            .unwrap_or_default();
        if let Some(env_list) = &params.env {
            full_env.extend(parse_env_list(env_list));
        }
        let cd_prefix = format!("cd {cwd} && ");

        // Scaffold/install commands requested detached with no readiness
        // criteria are attached so the caller observes completion and the
        // resulting file snapshot.
        let mut detached = params.detached;
        let caller_patterns = params
            .ready_patterns
            .clone()
            .filter(|p| !p.is_empty());
        if detached
            && caller_patterns.is_none()
            && params.port.is_none()
            && traits.is_scaffold_or_install
        {
            detached = false;
        }

        if params.auto_python_ensure && traits.uses_python {
            self.run_ensure_step(
                ctx,
                handle.as_ref(),
                &tool_id,
                format!("{cd_prefix}{PYTHON_ENSURE_SH}"),
                &full_env,
                false,
                params.stream_logs,
            )
            .await;
        }

        if params.auto_ruby_ensure && traits.uses_ruby {
            self.run_ensure_step(
                ctx,
                handle.as_ref(),
                &tool_id,
                format!("{cd_prefix}{RUBY_INSTALL_SH}"),
                &full_env,
                true,
                params.stream_logs,
            )
            .await;
            self.run_ensure_step(
                ctx,
                handle.as_ref(),
                &tool_id,
                format!("{cd_prefix}{BUNDLER_INSTALL_SH}"),
                &full_env,
                true,
                params.stream_logs,
            )
            .await;
            self.run_ensure_step(
                ctx,
                handle.as_ref(),
                &tool_id,
                format!(
                    "cd {cwd} && mkdir -p vendor/bundle && \
                     bundle config set --local path vendor/bundle"
                ),
                &full_env,
                false,
                params.stream_logs,
            )
            .await;
        }

        let mut command = wrap_with_bundler(&params.command, &traits);

        if params.auto_go_ensure && traits.uses_go {
            self.run_ensure_step(
                ctx,
                handle.as_ref(),
                &tool_id,
                format!("{cd_prefix}{GO_INSTALL_SH}"),
                &full_env,
                true,
                params.stream_logs,
            )
            .await;
        }

        let mut ready_patterns = caller_patterns.unwrap_or_default();
        if params.auto_ready_patterns && ready_patterns.is_empty() {
            if let Some(patterns) = auto_ready_patterns(&traits) {
                ready_patterns = patterns;
            }
        }
        let port = params.port.or_else(|| infer_port(&params.command, &traits));

        if traits.is_rails_server {
            let host = url::Url::parse(&handle.domain(port.unwrap_or(3000)))
                .ok()
                .and_then(|u| u.host_str().map(str::to_string));
            command = prepare_rails_server(&command, host.as_deref());
        }

        let spawned = handle
            .run_command_detached(
                "bash",
                &["-lc".to_string(), format!("{cd_prefix}{command}")],
                if full_env.is_empty() { None } else { Some(&full_env) },
                false,
            )
            .await;
        let cmd = match spawned {
            Ok(cmd) => cmd,
            Err(e) => {
                let output = json!({"error": format!("Command failed to start: {e}"), "name": sb_name});
                ctx.lock().complete_tool(&tool_id, "sandbox_run", output.clone());
                return output.to_string();
            }
        };

        let should_wait = !ready_patterns.is_empty() || port.is_some();
        let state = Arc::new(parking_lot::Mutex::new(RaceState::default()));

        let mut output = if detached && !should_wait {
            // Fire-and-forget: report started without blocking on logs.
            json!({"started": true})
        } else {
            self.race_command(
                ctx,
                handle.clone(),
                cmd.clone(),
                state.clone(),
                &tool_id,
                &sb_name,
                &ready_patterns,
                port,
                if detached { params.wait_timeout_ms } else { None },
                params.stream_logs,
            )
            .await;

            let snapshot = state.lock();
            let mut out = Map::new();
            if detached {
                out.insert("started".into(), json!(true));
            }
            if let Some(url) = &snapshot.preview_url {
                out.insert("preview_url".into(), json!(url));
            }
            out.insert("ready".into(), json!(snapshot.ready));
            out.insert("timed_out".into(), json!(snapshot.timed_out));
            out.insert("exited_early".into(), json!(snapshot.exited_early));
            if let Some(code) = snapshot.exit_code {
                out.insert("exit_code".into(), json!(code));
            }
            Value::Object(out)
        };

        let fs = self.snapshot_delta(ctx, handle.as_ref(), &sb_name).await;
        if let Value::Object(ref mut map) = output {
            map.insert("fs".into(), fs);
        }
        ctx.lock().complete_tool(&tool_id, "sandbox_run", output.clone());

        self.run_summary(&sb_name, &output, &state.lock())
    }

    #[allow(clippy::too_many_arguments)]
    async fn race_command(
        &self,
        ctx: &SharedContext,
        handle: Arc<dyn SandboxHandle>,
        cmd: Arc<dyn SandboxCommand>,
        state: Arc<parking_lot::Mutex<RaceState>>,
        tool_id: &str,
        sb_name: &str,
        ready_patterns: &[String],
        port: Option<u16>,
        wait_timeout_ms: Option<u64>,
        stream_logs: bool,
    ) {
        use futures_util::StreamExt;

        let stop = CancellationToken::new();

        let pump = {
            let ctx = ctx.clone();
            let state = state.clone();
            let stop = stop.clone();
            let cmd = cmd.clone();
            let handle = handle.clone();
            let tool_id = tool_id.to_string();
            let sb_name = sb_name.to_string();
            let ready_patterns = ready_patterns.to_vec();
            tokio::spawn(async move {
                let mut logs = cmd.logs();
                while let Some(chunk) = logs.next().await {
                    if stop.is_cancelled() {
                        return;
                    }
                    if stream_logs {
                        ctx.lock().log_tool(&tool_id, "sandbox_run", chunk.data.clone());
                    }
                    let matched = {
                        let mut guard = state.lock();
                        guard.collected.push_str(&chunk.data);
                        ready_patterns
                            .iter()
                            .any(|p| !p.is_empty() && chunk.data.contains(p.as_str()))
                    };
                    if matched {
                        let preview = port.map(|p| handle.domain(p));
                        {
                            let mut guard = state.lock();
                            guard.ready = true;
                            if guard.preview_url.is_none() {
                                guard.preview_url = preview.clone();
                            }
                        }
                        if let Some(url) = preview {
                            ctx.lock().log_tool(
                                &tool_id,
                                "sandbox_run",
                                format!("[{sb_name}] Preview available at: {url}\n"),
                            );
                        }
                        stop.cancel();
                        return;
                    }
                }
            })
        };

        let waiter = {
            let state = state.clone();
            let stop = stop.clone();
            let cmd = cmd.clone();
            tokio::spawn(async move {
                if let Ok(done) = cmd.wait().await {
                    let mut guard = state.lock();
                    guard.exit_code = Some(done.exit_code);
                    guard.exited_early = true;
                }
                stop.cancel();
            })
        };

        let timer = wait_timeout_ms.map(|timeout_ms| {
            let state = state.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if !stop.is_cancelled() {
                    state.lock().timed_out = true;
                    stop.cancel();
                }
            })
        });

        stop.cancelled().await;
        pump.abort();
        waiter.abort();
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    fn run_summary(&self, sb_name: &str, output: &Value, state: &RaceState) -> String {
        let status = if state.ready {
            "ready"
        } else if state.timed_out {
            "timed_out"
        } else if state.exited_early {
            "exited"
        } else {
            "started"
        };

        let mut logs_text = state.collected.as_str();
        let mut trimmed = false;
        if logs_text.len() > TRANSCRIPT_LIMIT_BYTES {
            let cut = logs_text.len() - TRANSCRIPT_LIMIT_BYTES;
            let cut = (cut..logs_text.len())
                .find(|i| logs_text.is_char_boundary(*i))
                .unwrap_or(logs_text.len());
            logs_text = &logs_text[cut..];
            trimmed = true;
        }

        let fs = output.get("fs").cloned().unwrap_or_default();
        let count = |key: &str| fs.get(key).and_then(Value::as_array).map_or(0, Vec::len);

        let mut parts = vec![
            format!("sandbox_run completed (name={sb_name})"),
            format!("status={status}"),
        ];
        if let Some(url) = output.get("preview_url").and_then(Value::as_str) {
            parts.push(format!("preview_url={url}"));
        }
        if let Some(code) = output.get("exit_code").and_then(Value::as_i64) {
            parts.push(format!("exit_code={code}"));
        }
        parts.push(format!(
            "fs: files_total={} created={} updated={} deleted={}",
            count("files"),
            count("created"),
            count("updated"),
            count("deleted"),
        ));
        parts.push(if trimmed {
            format!("logs (trimmed to last {TRANSCRIPT_LIMIT_BYTES} bytes):")
        } else {
            "logs:".to_string()
        });
        parts.push(logs_text.to_string());
        parts.join("\n")
    }
}
