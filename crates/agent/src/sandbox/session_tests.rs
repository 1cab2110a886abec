use indexmap::indexmap;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::context::{RunContext, SharedContext};
use crate::events::ToolEvent;
use crate::project::ProjectFiles;
use crate::sandbox::cache::HandleCache;
use crate::sandbox::platform::SandboxHandle;
use crate::sandbox::session::{CreateParams, RunParams, SessionManager};
use crate::test_utils::{FakeCommand, FakeHandle, FakePlatform, empty_run_payload};

fn manager(platform: Arc<FakePlatform>) -> SessionManager {
    SessionManager::new(platform, Arc::new(HandleCache::new()))
}

fn shared_ctx(project: ProjectFiles) -> SharedContext {
    RunContext::new(project, empty_run_payload(), None).shared()
}

fn run_params(command: &str) -> RunParams {
    serde_json::from_value(json!({"command": command})).unwrap()
}

fn completed_output(ctx: &SharedContext, name: &str) -> Value {
    let guard = ctx.lock();
    guard
        .events
        .iter()
        .rev()
        .find_map(|e| match e {
            ToolEvent::Completed {
                name: n,
                output_data,
                ..
            } if n == name => Some(output_data.clone()),
            _ => None,
        })
        .unwrap()
}

fn log_lines(ctx: &SharedContext) -> Vec<String> {
    ctx.lock()
        .events
        .iter()
        .filter_map(|e| match e {
            ToolEvent::Log { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}

// ── create ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_registers_tables_and_syncs_project() {
    let platform = FakePlatform::new();
    let handle = FakeHandle::new("sb_1");
    platform.push_handle(handle.clone());
    let mgr = manager(platform.clone());
    let ctx = shared_ctx(indexmap! {
        "./main.py".to_string() => "print(1)\n".to_string(),
        "src/app.py".to_string() => "x = 1\n".to_string(),
    });

    let result = mgr
        .create(
            &ctx,
            serde_json::from_value(json!({"runtime": "python3.13", "ports": [8000], "name": "web"}))
                .unwrap(),
        )
        .await;
    let output: Value = serde_json::from_str(&result).unwrap();
    assert_eq!(output["sandbox_id"], "sb_1");
    assert_eq!(output["name"], "web");
    assert_eq!(output["runtime"], "python3.13");
    assert_eq!(output["synced_files"], 2);
    assert!(output.get("synthetic_runtime").is_none());

    {
        let guard = ctx.lock();
        assert_eq!(guard.sandbox_ids["web"], "sb_1");
        assert_eq!(guard.active_sandbox.as_deref(), Some("web"));
        assert_eq!(guard.sandbox_runtimes["web"], "python3.13");
        assert_eq!(guard.sandbox_ports["web"], vec![8000]);
    }

    let created = platform.created.lock();
    assert_eq!(created[0].0, 600_000);
    assert_eq!(created[0].1.as_deref(), Some("python3.13"));

    // leading ./ is stripped before writing
    let paths = handle.written_paths();
    assert!(paths.contains(&"main.py".to_string()));
    assert!(paths.contains(&"src/app.py".to_string()));

    assert!(
        log_lines(&ctx)
            .iter()
            .any(|l| l == "Synced 2 project files to sandbox.\n")
    );
}

#[tokio::test]
async fn create_failure_reports_error_and_still_completes() {
    let platform = FakePlatform::new();
    platform.fail_create.store(true, Ordering::SeqCst);
    let mgr = manager(platform);
    let ctx = shared_ctx(ProjectFiles::new());

    let result = mgr.create(&ctx, CreateParams::default()).await;
    let output: Value = serde_json::from_str(&result).unwrap();
    assert!(
        output["error"]
            .as_str()
            .unwrap()
            .starts_with("Sandbox create failed")
    );

    // started/completed pairing survives the failure
    let guard = ctx.lock();
    assert!(matches!(guard.events[0], ToolEvent::Started { .. }));
    assert!(matches!(guard.events[1], ToolEvent::Completed { .. }));
}

#[tokio::test]
async fn synthetic_ruby_create_bootstraps_on_node_base() {
    let platform = FakePlatform::new();
    let handle = FakeHandle::new("sb_rb");
    // four bootstrap steps stream their output as log events
    handle.push_detached(FakeCommand::with_logs(
        vec![(Duration::ZERO, "ruby 3.2.4 (2024-04-23)\n")],
        Some((Duration::ZERO, 0)),
    ));
    handle.push_detached(FakeCommand::with_logs(
        vec![(Duration::ZERO, "Bundler version 2.5\n")],
        Some((Duration::ZERO, 0)),
    ));
    handle.push_detached(FakeCommand::finished("", 0));
    handle.push_detached(FakeCommand::finished("", 0));
    // initial snapshot (empty), then the post-bootstrap snapshot sees the
    // generated Gemfile
    handle.push_attached(FakeCommand::finished("", 0));
    handle.push_attached(FakeCommand::finished("Gemfile\t1700.0\t120\nbin/rack\t1700.0\t40\n", 0));
    platform.push_handle(handle.clone());

    let mgr = manager(platform.clone());
    let ctx = shared_ctx(ProjectFiles::new());
    let result = mgr
        .create(
            &ctx,
            serde_json::from_value(json!({"runtime": "ruby3.2"})).unwrap(),
        )
        .await;
    let output: Value = serde_json::from_str(&result).unwrap();
    assert_eq!(output["synthetic_runtime"], true);
    assert_eq!(output["runtime"], "ruby3.2");
    assert_eq!(output["effective_runtime"], "node22");

    // the platform saw the node base image, not ruby
    assert_eq!(platform.created.lock()[0].1.as_deref(), Some("node22"));

    // sudo installs, then unprivileged bundler config
    let spawns = handle.spawns.lock();
    let detached: Vec<_> = spawns.iter().filter(|s| s.detached).collect();
    assert_eq!(detached.len(), 4);
    assert!(detached[0].sudo);
    assert!(detached[1].sudo);
    assert!(!detached[2].sudo);
    assert!(detached[3].argv[1].contains("bundle add rack puma"));
    drop(spawns);

    let logs = log_lines(&ctx);
    assert!(logs.iter().any(|l| l.contains("Initializing Ruby runtime")));
    assert!(logs.iter().any(|l| l.contains("ruby 3.2.4")));
    assert!(logs.iter().any(|l| l.contains("Synthetic Ruby runtime ready")));

    let guard = ctx.lock();
    assert_eq!(guard.sandbox_envs["default"]["BUNDLE_PATH"], "vendor/bundle");
    assert!(
        guard.sandbox_files["default"]
            .iter()
            .any(|p| p == "Gemfile")
    );
}

// ── project sync ───────────────────────────────────────────────────────

#[tokio::test]
async fn sync_chunks_by_64_and_filters_ignored_paths() {
    let platform = FakePlatform::new();
    let handle = FakeHandle::new("sb_sync");
    platform.push_handle(handle.clone());
    let mgr = manager(platform);

    let mut project = ProjectFiles::new();
    for i in 0..130 {
        project.insert(format!("src/f{i}.py"), "x\n".to_string());
    }
    project.insert("node_modules/x.js".to_string(), "no".to_string());
    let ctx = shared_ctx(project);

    let handle_dyn: Arc<dyn SandboxHandle> = handle.clone();
    let written = mgr.sync_project(&ctx, handle_dyn.as_ref()).await.unwrap();
    assert_eq!(written, 130);

    let chunks = handle.writes.lock();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].len(), 64);
    assert_eq!(chunks[1].len(), 64);
    assert_eq!(chunks[2].len(), 2);
    assert!(
        chunks
            .iter()
            .flatten()
            .all(|f| !f.path.starts_with("node_modules/"))
    );
}

#[tokio::test(start_paused = true)]
async fn sync_retries_transient_failures_with_backoff() {
    let platform = FakePlatform::new();
    let handle = FakeHandle::new("sb_retry");
    handle.write_failures.store(2, Ordering::SeqCst);
    platform.push_handle(handle.clone());
    let mgr = manager(platform);
    let ctx = shared_ctx(indexmap! { "a.py".to_string() => "x".to_string() });

    let handle_dyn: Arc<dyn SandboxHandle> = handle.clone();
    let written = mgr.sync_project(&ctx, handle_dyn.as_ref()).await.unwrap();
    assert_eq!(written, 1);
    assert_eq!(handle.writes.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sync_gives_up_after_retry_budget() {
    let platform = FakePlatform::new();
    let handle = FakeHandle::new("sb_dead");
    handle.write_failures.store(10, Ordering::SeqCst);
    platform.push_handle(handle.clone());
    let mgr = manager(platform);
    let ctx = shared_ctx(indexmap! { "a.py".to_string() => "x".to_string() });

    let handle_dyn: Arc<dyn SandboxHandle> = handle.clone();
    assert!(mgr.sync_project(&ctx, handle_dyn.as_ref()).await.is_err());
}

// ── run ────────────────────────────────────────────────────────────────

fn seeded(platform: &FakePlatform, ctx: &SharedContext, handle: Arc<FakeHandle>) {
    platform.push_handle(handle.clone());
    ctx.lock()
        .sandbox_ids
        .insert("default".to_string(), handle.sandbox_id().to_string());
}

#[tokio::test]
async fn attached_run_collects_logs_and_exit_code() {
    let platform = FakePlatform::new();
    let ctx = shared_ctx(indexmap! { "a.txt".to_string() => "hi".to_string() });
    let handle = FakeHandle::new("sb_run");
    handle.push_detached(FakeCommand::with_logs(
        vec![(Duration::ZERO, "hello\n"), (Duration::ZERO, "world\n")],
        Some((Duration::from_millis(10), 0)),
    ));
    seeded(&platform, &ctx, handle.clone());
    let mgr = manager(platform);

    let summary = mgr.run(&ctx, run_params("echo hello")).await;
    assert!(summary.contains("sandbox_run completed (name=default)"));
    assert!(summary.contains("status=exited"));
    assert!(summary.contains("exit_code=0"));
    assert!(summary.contains("hello\nworld\n"));

    let output = completed_output(&ctx, "sandbox_run");
    assert_eq!(output["exited_early"], true);
    assert_eq!(output["exit_code"], 0);
    assert!(output.get("started").is_none());
    assert!(output["fs"].is_object());

    // log events carried the process output
    assert!(log_lines(&ctx).iter().any(|l| l == "hello\n"));
}

#[tokio::test]
async fn detached_uvicorn_run_reaches_ready_with_preview() {
    let platform = FakePlatform::new();
    let ctx = shared_ctx(ProjectFiles::new());
    let handle = FakeHandle::new("sb_uv");
    // python ensure step runs first
    handle.push_detached(FakeCommand::finished("", 0));
    // the server never exits; readiness comes from its banner
    handle.push_detached(FakeCommand::with_logs(
        vec![
            (Duration::from_millis(5), "INFO: Started server process\n"),
            (
                Duration::from_millis(5),
                "INFO: Uvicorn running on http://0.0.0.0:8000\n",
            ),
        ],
        None,
    ));
    seeded(&platform, &ctx, handle.clone());
    let mgr = manager(platform);

    let mut params = run_params("uvicorn app:app --port 8000");
    params.detached = true;
    let summary = mgr.run(&ctx, params).await;

    assert!(summary.contains("status=ready"));
    assert!(summary.contains("preview_url=https://sb_uv-8000.sandbox.test"));

    let output = completed_output(&ctx, "sandbox_run");
    assert_eq!(output["started"], true);
    assert_eq!(output["ready"], true);
    assert_eq!(output["timed_out"], false);
    assert_eq!(output["preview_url"], "https://sb_uv-8000.sandbox.test");

    assert!(
        log_lines(&ctx)
            .iter()
            .any(|l| l.contains("[default] Preview available at: https://sb_uv-8000.sandbox.test"))
    );
}

#[tokio::test(start_paused = true)]
async fn detached_run_times_out_without_readiness() {
    let platform = FakePlatform::new();
    let ctx = shared_ctx(ProjectFiles::new());
    let handle = FakeHandle::new("sb_to");
    // never logs, never exits
    handle.push_detached(FakeCommand::with_logs(vec![], None));
    seeded(&platform, &ctx, handle.clone());
    let mgr = manager(platform);

    let mut params = run_params("sleep 600");
    params.detached = true;
    params.ready_patterns = Some(vec!["Listening".to_string()]);
    params.wait_timeout_ms = Some(200);
    let summary = mgr.run(&ctx, params).await;

    assert!(summary.contains("status=timed_out"));
    let output = completed_output(&ctx, "sandbox_run");
    assert_eq!(output["timed_out"], true);
    assert_eq!(output["ready"], false);
}

#[tokio::test]
async fn detached_run_detects_early_exit() {
    let platform = FakePlatform::new();
    let ctx = shared_ctx(ProjectFiles::new());
    let handle = FakeHandle::new("sb_exit");
    handle.push_detached(FakeCommand::with_logs(
        vec![(Duration::ZERO, "boom: config missing\n")],
        Some((Duration::from_millis(5), 1)),
    ));
    seeded(&platform, &ctx, handle.clone());
    let mgr = manager(platform);

    let mut params = run_params("./server --bad-flag");
    params.detached = true;
    params.ready_patterns = Some(vec!["Listening".to_string()]);
    let summary = mgr.run(&ctx, params).await;

    assert!(summary.contains("status=exited"));
    assert!(summary.contains("exit_code=1"));
    let output = completed_output(&ctx, "sandbox_run");
    assert_eq!(output["exited_early"], true);
    assert_eq!(output["exit_code"], 1);
}

#[tokio::test]
async fn scaffold_commands_are_auto_attached() {
    let platform = FakePlatform::new();
    let ctx = shared_ctx(ProjectFiles::new());
    let handle = FakeHandle::new("sb_scaffold");
    handle.push_detached(FakeCommand::with_logs(
        vec![(Duration::ZERO, "Fetching gem metadata\n")],
        Some((Duration::from_millis(5), 0)),
    ));
    seeded(&platform, &ctx, handle.clone());
    let mgr = manager(platform);

    let mut params = run_params("bundle install");
    params.detached = true;
    params.auto_ruby_ensure = false;
    let summary = mgr.run(&ctx, params).await;

    // attached output shape: no "started" marker, exit observed
    assert!(summary.contains("status=exited"));
    let output = completed_output(&ctx, "sandbox_run");
    assert!(output.get("started").is_none());
    assert_eq!(output["exited_early"], true);
}

#[tokio::test]
async fn env_merge_prefers_call_site_over_stored() {
    let platform = FakePlatform::new();
    let ctx = shared_ctx(ProjectFiles::new());
    let handle = FakeHandle::new("sb_env");
    handle.push_detached(FakeCommand::finished("", 0));
    seeded(&platform, &ctx, handle.clone());
    ctx.lock().sandbox_envs.insert(
        "default".to_string(),
        std::collections::HashMap::from([
            ("A".to_string(), "stored".to_string()),
            ("PATH".to_string(), "/stored/bin".to_string()),
        ]),
    );
    let mgr = manager(platform);

    let mut params = run_params("ls -la");
    params.env = Some(vec!["A=call".to_string(), "B=2".to_string()]);
    mgr.run(&ctx, params).await;

    let spawns = handle.spawns.lock();
    let main_spawn = spawns
        .iter()
        .find(|s| s.detached && s.argv[1].contains("ls -la"))
        .unwrap();
    let env = main_spawn.env.as_ref().unwrap();
    assert_eq!(env["A"], "call");
    assert_eq!(env["B"], "2");
    assert_eq!(env["PATH"], "/stored/bin");
}

#[tokio::test]
async fn rails_commands_run_from_the_single_app_root() {
    let platform = FakePlatform::new();
    let ctx = shared_ctx(ProjectFiles::new());
    let handle = FakeHandle::new("sb_rails");
    handle.push_detached(FakeCommand::finished("", 0));
    seeded(&platform, &ctx, handle.clone());
    ctx.lock().sandbox_files.insert(
        "default".to_string(),
        vec![
            "blog/bin/rails".to_string(),
            "blog/config/routes.rb".to_string(),
        ],
    );
    let mgr = manager(platform);

    let mut params = run_params("bin/rails db:migrate");
    params.auto_ruby_ensure = false;
    mgr.run(&ctx, params).await;

    let started_args = {
        let guard = ctx.lock();
        guard
            .events
            .iter()
            .find_map(|e| match e {
                ToolEvent::Started {
                    name, arguments, ..
                } if name == "sandbox_run" => Some(arguments.clone()),
                _ => None,
            })
            .unwrap()
    };
    assert_eq!(started_args["cwd"], "/sandbox/blog");

    let spawns = handle.spawns.lock();
    let main_spawn = spawns
        .iter()
        .find(|s| s.detached && s.argv[1].contains("db:migrate"))
        .unwrap();
    assert!(main_spawn.argv[1].starts_with("cd /sandbox/blog && "));
}

#[tokio::test]
async fn bare_ruby_commands_get_bundler_wrapped_in_spawn() {
    let platform = FakePlatform::new();
    let ctx = shared_ctx(ProjectFiles::new());
    let handle = FakeHandle::new("sb_wrap");
    handle.push_detached(FakeCommand::finished("", 0));
    seeded(&platform, &ctx, handle.clone());
    let mgr = manager(platform);

    let mut params = run_params("ruby app.rb");
    params.auto_ruby_ensure = false;
    params.auto_ready_patterns = false;
    params.wait_timeout_ms = None;
    mgr.run(&ctx, params).await;

    let spawns = handle.spawns.lock();
    let main_spawn = spawns
        .iter()
        .find(|s| s.detached && s.argv[1].contains("app.rb"))
        .unwrap();
    assert!(main_spawn.argv[1].contains("bundle exec ruby app.rb"));
}

// ── fs delta ───────────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_delta_classifies_created_updated_deleted() {
    let platform = FakePlatform::new();
    let ctx = shared_ctx(ProjectFiles::new());
    let handle = FakeHandle::new("sb_fs");
    // the find walk, then one sample per created/updated file
    handle.push_attached(FakeCommand::finished(
        "kept.py\t100.0\t10\nchanged.py\t200.0\t25\nnew.py\t300.0\t30\n",
        0,
    ));
    handle.push_attached(FakeCommand::finished("bmV3\n", 0));
    handle.push_attached(FakeCommand::finished("__SKIP__\n", 0));
    platform.push_handle(handle.clone());
    ctx.lock().sandbox_file_meta.insert(
        "default".to_string(),
        std::collections::BTreeMap::from([
            ("kept.py".to_string(), "100.0 10".to_string()),
            ("changed.py".to_string(), "100.0 20".to_string()),
            ("gone.py".to_string(), "50.0 5".to_string()),
        ]),
    );
    let mgr = manager(platform);

    let handle_dyn: Arc<dyn SandboxHandle> = handle.clone();
    let delta = mgr.snapshot_delta(&ctx, handle_dyn.as_ref(), "default").await;

    assert_eq!(delta["created"], json!(["new.py"]));
    assert_eq!(delta["updated"], json!(["changed.py"]));
    assert_eq!(delta["deleted"], json!(["gone.py"]));
    assert_eq!(
        delta["files"],
        json!(["changed.py", "kept.py", "new.py"])
    );
    // one sample survived, the other was skipped for size
    assert_eq!(delta["data"].as_array().unwrap().len(), 1);
    assert_eq!(delta["data"][0]["encoding"], "base64");

    // context baseline advanced to the new snapshot
    let guard = ctx.lock();
    assert_eq!(
        guard.sandbox_file_meta["default"]["changed.py"],
        "200.0 25"
    );
    assert!(!guard.sandbox_file_meta["default"].contains_key("gone.py"));
}

#[tokio::test]
async fn snapshot_delta_is_ignore_filtered() {
    let platform = FakePlatform::new();
    let ctx = shared_ctx(ProjectFiles::new());
    let handle = FakeHandle::new("sb_ign");
    handle.push_attached(FakeCommand::finished(
        "src/a.ts\t1.0\t1\n__pycache__/m.pyc\t1.0\t2\n",
        0,
    ));
    handle.push_attached(FakeCommand::finished("YQ==\n", 0));
    platform.push_handle(handle.clone());
    let mgr = manager(platform);

    let handle_dyn: Arc<dyn SandboxHandle> = handle.clone();
    let delta = mgr.snapshot_delta(&ctx, handle_dyn.as_ref(), "default").await;
    assert_eq!(delta["created"], json!(["src/a.ts"]));
    assert_eq!(delta["files"], json!(["src/a.ts"]));
}

// ── stop ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_tears_down_and_clears_mappings() {
    let platform = FakePlatform::new();
    let handle = FakeHandle::new("sb_bye");
    platform.push_handle(handle.clone());
    let mgr = manager(platform);
    let ctx = shared_ctx(ProjectFiles::new());

    mgr.create(&ctx, CreateParams::default()).await;
    assert_eq!(ctx.lock().active_sandbox.as_deref(), Some("default"));

    let result = mgr.stop(&ctx, None).await;
    let output: Value = serde_json::from_str(&result).unwrap();
    assert_eq!(output["stopped"], true);

    assert!(handle.stopped.load(Ordering::SeqCst));
    assert!(handle.closed.load(Ordering::SeqCst));

    let guard = ctx.lock();
    assert!(guard.sandbox_ids.is_empty());
    assert!(guard.active_sandbox.is_none());
}

#[tokio::test]
async fn stop_without_mapping_reports_no_sandbox() {
    let platform = FakePlatform::new();
    let mgr = manager(platform);
    let ctx = shared_ctx(ProjectFiles::new());

    let result = mgr.stop(&ctx, Some("ghost")).await;
    let output: Value = serde_json::from_str(&result).unwrap();
    assert_eq!(output["stopped"], false);
    assert_eq!(output["error"], "no sandbox");
}

// ── handle reuse ───────────────────────────────────────────────────────

#[tokio::test]
async fn successive_calls_reuse_the_cached_handle() {
    let platform = FakePlatform::new();
    let handle = FakeHandle::new("sb_cache");
    handle.push_detached(FakeCommand::finished("", 0));
    handle.push_detached(FakeCommand::finished("", 0));
    platform.push_handle(handle.clone());
    let mgr = manager(platform.clone());
    let ctx = shared_ctx(ProjectFiles::new());

    mgr.run(&ctx, run_params("true")).await;
    mgr.run(&ctx, run_params("true")).await;

    // one create, despite two runs
    assert_eq!(platform.created.lock().len(), 1);
}
