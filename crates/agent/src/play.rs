//! The play flow: compile/install/run a single entry file in a fresh
//! sandbox and stream its logs, without involving the agent.
//!
//! The sandbox outlives the stream; the client stops it later through the
//! DELETE endpoint with the sandbox id announced in `play_sandbox`.

use futures_util::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::events::{EventType, ProgressEvent};
use crate::ignore_rules::IgnorePredicate;
use crate::project::ProjectFiles;
use crate::sandbox::platform::{SandboxHandle, SandboxPlatform, WriteFile};
use crate::stream::ProgressSender;
use crate::token::PlayTokenPayload;

const SANDBOX_TIMEOUT_MS: u64 = 600_000;
const SYNC_CHUNK_SIZE: usize = 64;
const SYNC_MAX_RETRIES: u32 = 3;
const SYNC_BACKOFF_MS: u64 = 250;
const DEFAULT_APP_PORT: u16 = 8000;
const RUBY_APP_PORT: u16 = 4567;

const FASTAPI_RUNNER: &str = "import importlib.util, os\n\
entry = os.environ.get('ENTRY_PATH','main.py')\n\
app_var = os.environ.get('APP_VAR','app')\n\
spec = importlib.util.spec_from_file_location('app_module', entry)\n\
mod = importlib.util.module_from_spec(spec)\n\
spec.loader.exec_module(mod)\n\
app = getattr(mod, app_var)\n\
import uvicorn\n\
uvicorn.run(app, host='0.0.0.0', port=int(os.environ.get('PORT','8000')))\n";

/// Start a play execution; returns the progress stream for the client.
pub fn run_play_flow(
    platform: Arc<dyn SandboxPlatform>,
    payload: PlayTokenPayload,
    task_id: String,
) -> ReceiverStream<ProgressEvent> {
    let (tx, rx) = ProgressSender::channel(task_id);
    tokio::spawn(drive_play(platform, payload, tx));
    ReceiverStream::new(rx)
}

fn python_entry_command(entry_path: &str) -> String {
    format!(
        "PYBIN=$(command -v python3 || command -v python) && \
         [ -n \"$PYBIN\" ] && \"$PYBIN\" {entry_path}"
    )
}

/// Decide the sandbox runtime and shell command from the entry file
/// extension (or an explicit override). `None` means unsupported.
pub fn detect_runtime_and_command(
    entry_path: &str,
    runtime_override: Option<&str>,
) -> Option<(Option<String>, String)> {
    let entry = entry_path.to_lowercase();
    if let Some(rt) = runtime_override {
        if rt.starts_with("python") {
            return Some((Some(rt.to_string()), python_entry_command(entry_path)));
        }
        if rt.starts_with("node") {
            if entry.ends_with(".ts") || entry.ends_with(".tsx") {
                return Some((
                    Some(rt.to_string()),
                    format!(
                        "(npx -y ts-node {entry_path} || npx -y tsx {entry_path} || node {entry_path})"
                    ),
                ));
            }
            return Some((Some(rt.to_string()), format!("(node {entry_path})")));
        }
        return Some((
            Some(rt.to_string()),
            format!("(python3 {entry_path} || node {entry_path})"),
        ));
    }

    if entry.ends_with(".py") {
        return Some((
            Some("python3.13".to_string()),
            python_entry_command(entry_path),
        ));
    }
    if entry.ends_with(".js") || entry.ends_with(".mjs") || entry.ends_with(".cjs") {
        return Some((Some("node22".to_string()), format!("(node {entry_path})")));
    }
    if entry.ends_with(".ts") || entry.ends_with(".tsx") {
        return Some((
            Some("node22".to_string()),
            format!("(npx -y tsx {entry_path} || npx -y ts-node {entry_path})"),
        ));
    }
    if entry.ends_with(".rb") {
        return Some((Some("ruby3.2".to_string()), format!("(ruby {entry_path})")));
    }
    None
}

/// Find the closest manifest (requirements.txt, Gemfile, package.json)
/// walking up from the entry file's directory, falling back to the root.
pub fn find_closest_file(
    project: &ProjectFiles,
    start_path: &str,
    names: &[&str],
) -> Option<String> {
    let mut dir = match start_path.rfind('/') {
        Some(i) => &start_path[..i],
        None => "",
    };
    loop {
        for name in names {
            let candidate = if dir.is_empty() {
                (*name).to_string()
            } else {
                format!("{dir}/{name}")
            };
            if project.contains_key(candidate.trim_start_matches("./")) {
                return Some(candidate.trim_start_matches("./").to_string());
            }
        }
        if dir.is_empty() {
            break;
        }
        dir = match dir.rfind('/') {
            Some(i) => &dir[..i],
            None => "",
        };
    }
    names
        .iter()
        .find(|n| project.contains_key(**n))
        .map(|n| (*n).to_string())
}

fn app_port() -> u16 {
    std::env::var("SANDBOX_APP_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_APP_PORT)
}

async fn drive_play(
    platform: Arc<dyn SandboxPlatform>,
    payload: PlayTokenPayload,
    tx: ProgressSender,
) {
    let predicate = IgnorePredicate::build(&payload.project);
    let filtered = predicate.filter(&payload.project);
    let entry_path = payload.entry_path.clone();

    let Some((runtime, command)) =
        detect_runtime_and_command(&entry_path, payload.runtime.as_deref())
    else {
        tx.emit_error(
            EventType::PlayFailed,
            format!("Unsupported entry file: {entry_path}"),
        )
        .await;
        return;
    };

    // The entry content is needed even when an ignore rule would hide it.
    let content = filtered
        .get(&entry_path)
        .or_else(|| payload.project.get(&entry_path))
        .cloned()
        .unwrap_or_default();
    let is_fastapi = entry_path.to_lowercase().ends_with(".py")
        && (content.contains("FastAPI(")
            || content.contains("from fastapi")
            || content.contains("import fastapi"));
    let is_ruby = entry_path.to_lowercase().ends_with(".rb");
    let port = if is_fastapi {
        Some(app_port())
    } else if is_ruby {
        Some(RUBY_APP_PORT)
    } else {
        None
    };

    info!(
        task_id = %tx.task_id(),
        entry = %entry_path,
        runtime = runtime.as_deref().unwrap_or("auto"),
        "play start"
    );
    tx.emit(
        EventType::PlayStarted,
        json!({"entry_path": entry_path, "runtime": runtime.as_deref().unwrap_or("auto")}),
    )
    .await;

    let ports = if is_fastapi { port.map(|p| vec![p]) } else { None };
    let handle = match platform
        .create(SANDBOX_TIMEOUT_MS, runtime.as_deref(), ports.as_deref())
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            tx.emit_error(EventType::PlayFailed, e.to_string()).await;
            return;
        }
    };

    tx.emit(
        EventType::PlaySandbox,
        json!({"sandbox_id": handle.sandbox_id()}),
    )
    .await;

    run_in_sandbox(
        &tx,
        handle.as_ref(),
        &filtered,
        &entry_path,
        &command,
        &payload.env,
        is_fastapi,
        is_ruby,
        port,
    )
    .await;

    // Close the client connection only; the sandbox stays up until the
    // client stops it by id.
    handle.close().await;
}

#[allow(clippy::too_many_arguments)]
async fn run_in_sandbox(
    tx: &ProgressSender,
    handle: &dyn SandboxHandle,
    project: &ProjectFiles,
    entry_path: &str,
    command: &str,
    env: &HashMap<String, String>,
    is_fastapi: bool,
    is_ruby: bool,
    port: Option<u16>,
) {
    if !sync_files(tx, handle, project).await {
        return;
    }
    if !install_dependencies(tx, handle, project, entry_path, is_fastapi).await {
        return;
    }

    let cwd = handle.cwd();
    let spawn = if is_fastapi && port.is_some() {
        let written = handle
            .write_files(&[WriteFile {
                path: "run_fastapi.py".to_string(),
                content: FASTAPI_RUNNER.as_bytes().to_vec(),
            }])
            .await;
        if let Err(e) = written {
            tx.emit_error(EventType::PlayFailed, e.to_string()).await;
            return;
        }
        let mut env_to_use = env.clone();
        env_to_use.insert("ENTRY_PATH".to_string(), entry_path.to_string());
        env_to_use.insert("APP_VAR".to_string(), "app".to_string());
        env_to_use.insert("PORT".to_string(), port.unwrap_or(DEFAULT_APP_PORT).to_string());
        handle
            .run_command_detached(
                "bash",
                &[
                    "-lc".to_string(),
                    format!(
                        "cd {cwd} && PYBIN=$(command -v python3 || command -v python) && \
                         exec \"$PYBIN\" run_fastapi.py"
                    ),
                ],
                Some(&env_to_use),
                false,
            )
            .await
    } else {
        let command_to_run = if is_ruby {
            format!("( [ -f Gemfile ] && bundle exec {command} || {command} )")
        } else {
            command.to_string()
        };
        handle
            .run_command_detached(
                "bash",
                &["-lc".to_string(), format!("cd {cwd} && {command_to_run}")],
                if env.is_empty() { None } else { Some(env) },
                false,
            )
            .await
    };

    let cmd = match spawn {
        Ok(cmd) => cmd,
        Err(e) => {
            tx.emit_error(EventType::PlayFailed, e.to_string()).await;
            return;
        }
    };

    let mut preview_sent = false;
    let mut logs = cmd.logs();
    while let Some(chunk) = logs.next().await {
        tx.emit(EventType::PlayLog, json!(chunk.data)).await;

        let fastapi_ready = is_fastapi
            && (chunk.data.contains("Application startup complete")
                || chunk.data.contains("Uvicorn running on"));
        let ruby_ready = is_ruby
            && (chunk.data.contains("Listening on")
                || chunk.data.contains("tcp://0.0.0.0:")
                || chunk.data.contains("Sinatra has taken the stage"));
        if !preview_sent && (fastapi_ready || ruby_ready) {
            if let Some(port) = port {
                let url = handle.domain(port);
                tx.emit(EventType::PlayPreview, json!({"url": url, "port": port}))
                    .await;
                preview_sent = true;
            }
        }
    }

    match cmd.wait().await {
        Ok(done) if done.exit_code == 0 => {
            tx.emit(EventType::PlayComplete, json!({"exit_code": done.exit_code}))
                .await;
        }
        Ok(done) => {
            tx.emit_error(
                EventType::PlayFailed,
                format!("Process exited with code {}", done.exit_code),
            )
            .await;
        }
        Err(e) => {
            tx.emit_error(EventType::PlayFailed, e.to_string()).await;
        }
    }
}

/// Chunked, retried file sync. Emits retry logs; returns false after the
/// retry budget is exhausted (with `play_failed` already sent).
async fn sync_files(tx: &ProgressSender, handle: &dyn SandboxHandle, project: &ProjectFiles) -> bool {
    let files: Vec<WriteFile> = project
        .iter()
        .map(|(path, content)| WriteFile {
            path: path.clone(),
            content: content.as_bytes().to_vec(),
        })
        .collect();

    for chunk in files.chunks(SYNC_CHUNK_SIZE) {
        let mut attempt: u32 = 0;
        loop {
            match handle.write_files(chunk).await {
                Ok(()) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt > SYNC_MAX_RETRIES {
                        tx.emit_error(EventType::PlayFailed, e.to_string()).await;
                        return false;
                    }
                    tx.emit(
                        EventType::PlayLog,
                        json!(format!(
                            "Retrying file sync ({attempt}/{SYNC_MAX_RETRIES}) due to error: {e}\n"
                        )),
                    )
                    .await;
                    let backoff = SYNC_BACKOFF_MS * 2u64.pow(attempt - 1);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }
    true
}

/// Run the dependency install step for the entry's ecosystem. Returns
/// false when the flow should abort (`play_failed` already sent).
async fn install_dependencies(
    tx: &ProgressSender,
    handle: &dyn SandboxHandle,
    project: &ProjectFiles,
    entry_path: &str,
    is_fastapi: bool,
) -> bool {
    let entry = entry_path.to_lowercase();

    if entry.ends_with(".py") {
        if let Some(req_path) = find_closest_file(project, entry_path, &["requirements.txt"]) {
            tx.emit(
                EventType::PlayLog,
                json!(format!("Installing Python dependencies from {req_path}...\n")),
            )
            .await;
            let script = format!(
                "PYBIN=$(command -v python3 || command -v python); \
                 if [ -z \"$PYBIN\" ]; then echo 'python not found in sandbox'; exit 1; fi; \
                 $PYBIN -m ensurepip --upgrade || true; \
                 $PYBIN -m pip install --upgrade pip; \
                 $PYBIN -m pip install --no-cache-dir -r {req_path}"
            );
            if !run_install_step(tx, handle, &script, "Dependency install failed").await {
                return false;
            }
        }

        if is_fastapi {
            tx.emit(
                EventType::PlayLog,
                json!("Ensuring FastAPI and Uvicorn are installed...\n"),
            )
            .await;
            let script = "PYBIN=$(command -v python3 || command -v python); \
                 if [ -z \"$PYBIN\" ]; then echo 'python not found in sandbox'; exit 1; fi; \
                 $PYBIN -c \"import fastapi, uvicorn\" \
                 || ($PYBIN -m pip install --upgrade pip || true; \
                 $PYBIN -m pip install --no-cache-dir fastapi uvicorn)";
            if !run_install_step(tx, handle, script, "Failed to install FastAPI/Uvicorn").await {
                return false;
            }
        }
    } else if entry.ends_with(".rb") {
        if let Some(gemfile) = find_closest_file(project, entry_path, &["Gemfile"]) {
            tx.emit(
                EventType::PlayLog,
                json!(format!(
                    "Installing Ruby dependencies from {gemfile} via Bundler...\n"
                )),
            )
            .await;
            let script = "if ! command -v bundle >/dev/null 2>&1; then \
                 gem list -i bundler >/dev/null 2>&1 || gem install --no-document bundler; fi; \
                 bundle --version || true; \
                 mkdir -p vendor/bundle; \
                 bundle config set --local path vendor/bundle; \
                 bundle config set --local without 'development:test'; \
                 bundle install";
            if !run_install_step(tx, handle, script, "Dependency install failed").await {
                return false;
            }
        }
    } else if [".js", ".mjs", ".cjs", ".ts", ".tsx"]
        .iter()
        .any(|ext| entry.ends_with(ext))
    {
        if let Some(pkg_json) = find_closest_file(project, entry_path, &["package.json"]) {
            let pkg_dir = pkg_json
                .rfind('/')
                .map(|i| pkg_json[..i].to_string())
                .unwrap_or_default();
            let cd_part = if pkg_dir.is_empty() {
                String::new()
            } else {
                format!("cd {pkg_dir} && ")
            };
            let lock_path = if pkg_dir.is_empty() {
                "package-lock.json".to_string()
            } else {
                format!("{pkg_dir}/package-lock.json")
            };
            let npm_install = if project.contains_key(&lock_path) {
                "npm ci --loglevel info"
            } else {
                "npm install --loglevel info"
            };
            tx.emit(
                EventType::PlayLog,
                json!(format!(
                    "Installing Node dependencies in {}...\n",
                    if pkg_dir.is_empty() { "." } else { &pkg_dir }
                )),
            )
            .await;
            let script = format!("{cd_part}{npm_install} || npm install --loglevel info");
            if !run_install_step(tx, handle, &script, "Dependency install failed").await {
                return false;
            }
        }
    }

    true
}

async fn run_install_step(
    tx: &ProgressSender,
    handle: &dyn SandboxHandle,
    script: &str,
    failure_label: &str,
) -> bool {
    let cwd = handle.cwd();
    let spawned = handle
        .run_command_detached(
            "bash",
            &["-lc".to_string(), format!("cd {cwd} && {script}")],
            None,
            false,
        )
        .await;
    let cmd = match spawned {
        Ok(cmd) => cmd,
        Err(e) => {
            tx.emit_error(EventType::PlayFailed, format!("{failure_label}: {e}"))
                .await;
            return false;
        }
    };

    let mut logs = cmd.logs();
    while let Some(chunk) = logs.next().await {
        tx.emit(EventType::PlayLog, json!(chunk.data)).await;
    }
    match cmd.wait().await {
        Ok(done) if done.exit_code == 0 => true,
        Ok(done) => {
            tx.emit_error(
                EventType::PlayFailed,
                format!("{failure_label} (exit {})", done.exit_code),
            )
            .await;
            false
        }
        Err(e) => {
            tx.emit_error(EventType::PlayFailed, format!("{failure_label}: {e}"))
                .await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeCommand, FakeHandle, FakePlatform};
    use futures_util::StreamExt;
    use indexmap::indexmap;
    use std::sync::atomic::Ordering;

    fn play_payload(project: ProjectFiles, entry: &str) -> PlayTokenPayload {
        PlayTokenPayload {
            user_id: "u1".into(),
            project,
            entry_path: entry.into(),
            runtime: None,
            env: HashMap::new(),
        }
    }

    async fn collect(stream: ReceiverStream<ProgressEvent>) -> Vec<ProgressEvent> {
        stream.collect().await
    }

    fn kinds(events: &[ProgressEvent]) -> Vec<EventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    // ── runtime detection ──────────────────────────────────────────────

    #[test]
    fn runtime_detection_by_extension() {
        let (rt, cmd) = detect_runtime_and_command("app.py", None).unwrap();
        assert_eq!(rt.as_deref(), Some("python3.13"));
        assert!(cmd.contains("app.py"));

        let (rt, cmd) = detect_runtime_and_command("index.ts", None).unwrap();
        assert_eq!(rt.as_deref(), Some("node22"));
        assert!(cmd.contains("tsx"));

        let (rt, cmd) = detect_runtime_and_command("server.rb", None).unwrap();
        assert_eq!(rt.as_deref(), Some("ruby3.2"));
        assert!(cmd.contains("ruby server.rb"));

        assert!(detect_runtime_and_command("style.css", None).is_none());
    }

    #[test]
    fn runtime_override_is_respected() {
        let (rt, cmd) = detect_runtime_and_command("script.py", Some("python3.11")).unwrap();
        assert_eq!(rt.as_deref(), Some("python3.11"));
        assert!(cmd.contains("script.py"));

        let (rt, _) = detect_runtime_and_command("main.js", Some("node20")).unwrap();
        assert_eq!(rt.as_deref(), Some("node20"));
    }

    #[test]
    fn closest_manifest_walks_up_from_the_entry() {
        let project = indexmap! {
            "apps/api/main.py".to_string() => "x".to_string(),
            "apps/requirements.txt".to_string() => "flask".to_string(),
            "requirements.txt".to_string() => "fastapi".to_string(),
        };
        assert_eq!(
            find_closest_file(&project, "apps/api/main.py", &["requirements.txt"]),
            Some("apps/requirements.txt".to_string())
        );
        assert_eq!(
            find_closest_file(&project, "other/main.py", &["requirements.txt"]),
            Some("requirements.txt".to_string())
        );
        assert_eq!(find_closest_file(&project, "x.py", &["Gemfile"]), None);
    }

    // ── flows ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unsupported_entry_fails_fast() {
        let platform = FakePlatform::new();
        let project = indexmap! { "style.css".to_string() => "body{}".to_string() };
        let stream = run_play_flow(platform, play_payload(project, "style.css"), "p1".into());
        let events = collect(stream).await;

        assert_eq!(kinds(&events), vec![EventType::PlayFailed]);
        assert_eq!(
            events[0].error,
            json!("Unsupported entry file: style.css")
        );
    }

    #[tokio::test]
    async fn plain_python_entry_runs_to_completion() {
        let platform = FakePlatform::new();
        let handle = FakeHandle::new("sb_play");
        handle.push_detached(FakeCommand::with_logs(
            vec![(Duration::ZERO, "hello from script\n")],
            Some((Duration::ZERO, 0)),
        ));
        platform.push_handle(handle.clone());

        let project = indexmap! { "main.py".to_string() => "print('hello')\n".to_string() };
        let stream = run_play_flow(platform, play_payload(project, "main.py"), "p2".into());
        let events = collect(stream).await;

        let kinds = kinds(&events);
        assert_eq!(kinds[0], EventType::PlayStarted);
        assert_eq!(kinds[1], EventType::PlaySandbox);
        assert!(kinds.contains(&EventType::PlayLog));
        assert_eq!(*kinds.last().unwrap(), EventType::PlayComplete);

        assert_eq!(events[1].data["sandbox_id"], "sb_play");
        assert!(handle.written_paths().contains(&"main.py".to_string()));
        assert!(handle.closed.load(Ordering::SeqCst));
        assert!(!handle.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn install_failure_aborts_before_running() {
        let platform = FakePlatform::new();
        let handle = FakeHandle::new("sb_fail");
        // install step exits non-zero; the entry command is never spawned
        handle.push_detached(FakeCommand::with_logs(
            vec![(Duration::ZERO, "ERROR: no matching distribution\n")],
            Some((Duration::ZERO, 1)),
        ));
        platform.push_handle(handle.clone());

        let project = indexmap! {
            "main.py".to_string() => "import flask\n".to_string(),
            "requirements.txt".to_string() => "flask\n".to_string(),
        };
        let stream = run_play_flow(platform, play_payload(project, "main.py"), "p3".into());
        let events = collect(stream).await;

        let failed: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EventType::PlayFailed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error, json!("Dependency install failed (exit 1)"));
        // install spawn only; no entry-command spawn afterwards
        assert_eq!(
            handle
                .spawns
                .lock()
                .iter()
                .filter(|s| s.detached)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn fastapi_entry_emits_preview_on_banner() {
        let platform = FakePlatform::new();
        let handle = FakeHandle::new("sb_api");
        // ensure-fastapi step, then the uvicorn runner
        handle.push_detached(FakeCommand::finished("", 0));
        handle.push_detached(FakeCommand::with_logs(
            vec![
                (Duration::ZERO, "INFO: Started server process\n"),
                (Duration::ZERO, "INFO: Uvicorn running on http://0.0.0.0:8000\n"),
            ],
            Some((Duration::ZERO, 0)),
        ));
        platform.push_handle(handle.clone());

        let project = indexmap! {
            "app.py".to_string() => "from fastapi import FastAPI\napp = FastAPI()\n".to_string(),
        };
        let stream = run_play_flow(platform.clone(), play_payload(project, "app.py"), "p4".into());
        let events = collect(stream).await;

        let preview: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EventType::PlayPreview)
            .collect();
        assert_eq!(preview.len(), 1);
        assert_eq!(
            preview[0].data["url"],
            json!("https://sb_api-8000.sandbox.test")
        );
        assert_eq!(preview[0].data["port"], 8000);

        // the runner shim was written into the sandbox and the port exposed
        assert!(
            handle
                .written_paths()
                .contains(&"run_fastapi.py".to_string())
        );
        let created = platform.created.lock();
        assert_eq!(created[0].2.as_deref(), Some(&[8000u16][..]));
    }

    #[tokio::test]
    async fn transient_sync_errors_are_retried_with_logs() {
        let platform = FakePlatform::new();
        let handle = FakeHandle::new("sb_retry");
        handle.write_failures.store(1, Ordering::SeqCst);
        handle.push_detached(FakeCommand::finished("", 0));
        platform.push_handle(handle.clone());

        let project = indexmap! { "main.py".to_string() => "print(1)\n".to_string() };
        let stream = run_play_flow(platform, play_payload(project, "main.py"), "p5".into());
        let events = collect(stream).await;

        assert!(events.iter().any(|e| {
            e.event_type == EventType::PlayLog
                && e.data
                    .as_str()
                    .is_some_and(|s| s.starts_with("Retrying file sync (1/3)"))
        }));
        assert_eq!(
            events.last().unwrap().event_type,
            EventType::PlayComplete
        );
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_play() {
        let platform = FakePlatform::new();
        let handle = FakeHandle::new("sb_err");
        handle.push_detached(FakeCommand::with_logs(
            vec![(Duration::ZERO, "Traceback (most recent call last)\n")],
            Some((Duration::ZERO, 2)),
        ));
        platform.push_handle(handle);

        let project = indexmap! { "boom.py".to_string() => "raise SystemExit(2)\n".to_string() };
        let stream = run_play_flow(platform, play_payload(project, "boom.py"), "p6".into());
        let events = collect(stream).await;

        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::PlayFailed);
        assert_eq!(last.error, json!("Process exited with code 2"));
    }
}
