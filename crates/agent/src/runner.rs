//! Run orchestrator: drives the agent turn loop and pumps tool events
//! into the client stream.
//!
//! The agent task and the event pump run concurrently; the pump drains
//! newly appended context events every 50 ms and keeps going until the
//! agent settles. A client disconnect stops the pump silently; the agent
//! task runs to completion and its output is dropped.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::context::{RunContext, SharedContext};
use crate::error::AgentError;
use crate::events::{EventType, ProgressEvent, ToolEvent};
use crate::gateway::{ChatClient, ChatMessage, DEFAULT_MODEL, ToolCall};
use crate::ignore_rules::IgnorePredicate;
use crate::project::build_project_input;
use crate::sandbox::SessionManager;
use crate::stream::{ProgressSender, tool_event_to_progress};
use crate::token::{RunTokenPayload, TokenSigner};
use crate::tools::{Tool, ToolCtx, ToolRegistry};

pub const MAX_TURNS: usize = 50;
const PUMP_INTERVAL: Duration = Duration::from_millis(50);
const EXEC_RESULT_LIMIT_BYTES: usize = 100_000;

const INSTRUCTIONS: &str = "\
You are an IDE assistant that helps with coding tasks over an entire project \
(multiple files).
Always start with a brief plan for anything non-trivial.

You will be given a project file tree and a query. The project is presented as \
a list of files with their full paths and contents, each file rendered with \
line numbers for easy reference.

Your job is to either respond to the query with an answer, or use the \
available tools to propose edits to a specific file. When editing, you MUST \
specify which file you are editing via `file_path`, and you MUST target a \
concrete range of lines and provide the replacement text. Do not include line \
numbers in the replacement text itself.

When code is shown to you as:
[1]def hello_world():
[2]    print(\"Hello, world!\")

the actual code has no [n] prefixes.

You can create new files with `create_file`, reorganize with the rename and \
folder tools, and run code in a remote sandbox with the sandbox_* tools. Use \
`request_code_execution` when you need the UI to run code for you.

In your final response, clearly and concisely explain what you did without \
writing any code snippets. The UI will show diffs to the user.";

/// Shared collaborators every run needs.
#[derive(Clone)]
pub struct RunnerDeps {
    pub chat: Arc<dyn ChatClient>,
    pub sessions: Arc<SessionManager>,
    pub signer: Arc<TokenSigner>,
}

/// Start a fresh agent run; returns the progress stream for the client.
pub fn run_agent_flow(
    deps: RunnerDeps,
    payload: RunTokenPayload,
    task_id: String,
) -> ReceiverStream<ProgressEvent> {
    let (tx, rx) = ProgressSender::channel(task_id);
    tokio::spawn(drive_run(deps, payload, tx));
    ReceiverStream::new(rx)
}

/// Resume a deferred run with an execution result.
pub fn resume_agent_flow(
    deps: RunnerDeps,
    payload: RunTokenPayload,
    task_id: String,
    exec_result: String,
) -> ReceiverStream<ProgressEvent> {
    let (tx, rx) = ProgressSender::channel(task_id);
    tokio::spawn(drive_resume(deps, payload, tx, exec_result));
    ReceiverStream::new(rx)
}

fn filtered_base(payload: &RunTokenPayload) -> RunTokenPayload {
    let predicate = IgnorePredicate::build(&payload.project);
    RunTokenPayload {
        user_id: payload.user_id.clone(),
        message_history: payload.message_history.clone(),
        query: payload.query.clone(),
        project: predicate.filter(&payload.project),
        model: payload.model.clone(),
    }
}

async fn drive_run(deps: RunnerDeps, payload: RunTokenPayload, tx: ProgressSender) {
    info!(
        task_id = %tx.task_id(),
        model = payload.model.as_deref().unwrap_or("default"),
        project_files = payload.project.len(),
        history = payload.message_history.len(),
        "run start"
    );

    let base_payload = filtered_base(&payload);
    let input_text = build_project_input(
        &base_payload.query,
        &base_payload.project,
        &base_payload.message_history,
    );
    let ctx = RunContext::new(base_payload.project.clone(), base_payload.clone(), None).shared();

    let agent = {
        let chat = deps.chat.clone();
        let model = base_payload
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let tool_ctx = ToolCtx {
            context: ctx.clone(),
            sessions: deps.sessions.clone(),
        };
        tokio::spawn(async move {
            agent_loop(chat, &model, ToolRegistry::builtin(), tool_ctx, input_text).await
        })
    };

    if !tx.emit(EventType::RunLog, json!("Agent run scheduled")).await {
        return;
    }

    let mut last_idx = 0;
    while !agent.is_finished() {
        if !drain_events(&tx, &ctx, &deps.signer, &mut last_idx).await {
            return;
        }
        tokio::time::sleep(PUMP_INTERVAL).await;
    }

    let result = match agent.await {
        Ok(result) => result,
        Err(e) => Err(AgentError::Internal(e.to_string())),
    };

    let final_output = match result {
        Ok(output) => output,
        Err(e) => {
            error!(task_id = %tx.task_id(), error = %e, "run error");
            tx.emit(EventType::RunLog, json!(format!("Exception: {e}")))
                .await;
            tx.emit_error(EventType::RunFailed, e.to_string()).await;
            return;
        }
    };

    if !drain_events(&tx, &ctx, &deps.signer, &mut last_idx).await {
        return;
    }

    if ctx.lock().defer_requested {
        // The resume token went out with the request_code_execution
        // completion; the stream simply ends here.
        return;
    }

    match final_output {
        Some(output) if !output.is_empty() => {
            tx.emit(EventType::AgentOutput, json!(output)).await;
        }
        _ => {
            warn!(task_id = %tx.task_id(), "run completed with no output");
            tx.emit(EventType::RunLog, json!("No final_output produced"))
                .await;
            tx.emit_error(EventType::RunFailed, "No output produced.")
                .await;
        }
    }
}

async fn drive_resume(
    deps: RunnerDeps,
    payload: RunTokenPayload,
    tx: ProgressSender,
    exec_result: String,
) {
    info!(
        task_id = %tx.task_id(),
        model = payload.model.as_deref().unwrap_or("default"),
        project_files = payload.project.len(),
        history = payload.message_history.len(),
        "resume"
    );

    let base_payload = filtered_base(&payload);
    let input_text = build_project_input(
        &base_payload.query,
        &base_payload.project,
        &base_payload.message_history,
    );

    // Very large execution logs are trimmed to their tail to keep the
    // prompt within budget.
    let trimmed = trim_to_trailing_bytes(&exec_result, EXEC_RESULT_LIMIT_BYTES);
    let ctx = RunContext::new(
        base_payload.project.clone(),
        base_payload.clone(),
        Some(trimmed),
    )
    .shared();

    let model = base_payload
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let tool_ctx = ToolCtx {
        context: ctx.clone(),
        sessions: deps.sessions.clone(),
    };
    let result = agent_loop(
        deps.chat.clone(),
        &model,
        ToolRegistry::builtin(),
        tool_ctx,
        input_text,
    )
    .await;

    let mut last_idx = 0;
    if !drain_events(&tx, &ctx, &deps.signer, &mut last_idx).await {
        return;
    }

    match result {
        Ok(Some(output)) if !output.is_empty() => {
            tx.emit(EventType::AgentOutput, json!(output)).await;
        }
        Ok(_) => {
            tx.emit_error(EventType::RunFailed, "No output produced.")
                .await;
        }
        Err(e) => {
            tx.emit_error(EventType::RunFailed, e.to_string()).await;
        }
    }
}

fn trim_to_trailing_bytes(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let cut = s.len() - limit;
    let cut = (cut..s.len())
        .find(|i| s.is_char_boundary(*i))
        .unwrap_or(s.len());
    s[cut..].to_string()
}

/// Forward context events appended since `last_idx` to the client.
/// Returns false once the client is gone.
async fn drain_events(
    tx: &ProgressSender,
    ctx: &SharedContext,
    signer: &TokenSigner,
    last_idx: &mut usize,
) -> bool {
    loop {
        let (event, base_payload, project) = {
            let guard = ctx.lock();
            let Some(event) = guard.events.get(*last_idx).cloned() else {
                return true;
            };
            (event, guard.base_payload.clone(), guard.project.clone())
        };
        *last_idx += 1;

        let progress = tool_event_to_progress(tx.task_id(), &event, signer, &base_payload, &project);
        match event {
            ToolEvent::Log { .. } => tx.send_log(progress),
            _ => {
                if !tx.send(progress).await {
                    return false;
                }
            }
        }
    }
}

/// The agent turn loop: at most `MAX_TURNS` gateway calls, dispatching
/// tool calls sequentially between them. Returns the final output, or
/// `None` after a defer.
async fn agent_loop(
    chat: Arc<dyn ChatClient>,
    model: &str,
    registry: ToolRegistry,
    tool_ctx: ToolCtx,
    input_text: String,
) -> Result<Option<String>, AgentError> {
    let defs = registry.definitions();
    let mut messages = vec![
        ChatMessage::system(INSTRUCTIONS),
        ChatMessage::user(input_text),
    ];

    for _ in 0..MAX_TURNS {
        let turn = chat.chat(model, &messages, &defs).await?;

        if turn.tool_calls.is_empty() {
            return Ok(turn.content);
        }

        messages.push(ChatMessage::assistant(
            turn.content.clone(),
            turn.tool_calls.clone(),
        ));
        for call in &turn.tool_calls {
            let result = dispatch_tool(&registry, call, &tool_ctx).await;
            messages.push(ChatMessage::tool_result(call.id.clone(), result));
        }

        if tool_ctx.context.lock().defer_requested {
            return Ok(None);
        }
    }

    Err(AgentError::MaxTurnsExceeded(MAX_TURNS))
}

/// Run one tool call; failures become strings the agent can read and act
/// on, never run-fatal errors.
async fn dispatch_tool(registry: &ToolRegistry, call: &ToolCall, tool_ctx: &ToolCtx) -> String {
    let name = call.function.name.as_str();
    let Some(tool) = registry.find(name) else {
        return format!("Unknown tool: {name}");
    };

    let raw = call.function.arguments.trim();
    let args = if raw.is_empty() {
        json!({})
    } else {
        match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => return format!("Invalid tool arguments: {e}"),
        }
    };

    match tool.call(args, tool_ctx).await {
        Ok(result) => result,
        Err(e) => format!("Tool {name} failed: {e}"),
    }
}
