//! Progress channel and event-stream framing.
//!
//! Flows push `ProgressEvent`s into a bounded channel; the HTTP layer
//! frames each one as `data: <json>\n\n`. Lifecycle events wait for
//! capacity; log events are dropped (newest first) on backpressure so a
//! slow client cannot stall a run.

use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::events::{EventType, ProgressEvent, ToolEvent};
use crate::project::ProjectFiles;
use crate::token::{RunTokenPayload, TokenSigner};

/// Channel capacity for one client stream.
pub const CHANNEL_CAPACITY: usize = 256;

/// Response headers every stream endpoint sets.
pub const STREAM_HEADERS: [(&str, &str); 4] = [
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
    ("X-Accel-Buffering", "no"),
];

/// Frame one event for the wire.
pub fn sse_frame(event: &ProgressEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}

/// Sending half of a progress channel.
#[derive(Clone)]
pub struct ProgressSender {
    task_id: String,
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    pub fn channel(task_id: impl Into<String>) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                task_id: task_id.into(),
                tx,
            },
            rx,
        )
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Deliver a lifecycle event. Returns false once the client is gone.
    pub async fn emit(&self, event_type: EventType, data: Value) -> bool {
        self.send(ProgressEvent::data(&self.task_id, event_type, data))
            .await
    }

    pub async fn emit_error(&self, event_type: EventType, error: impl Into<String>) -> bool {
        self.send(ProgressEvent::error(&self.task_id, event_type, error))
            .await
    }

    pub async fn send(&self, event: ProgressEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Deliver a log event without waiting; dropped on backpressure.
    pub fn send_log(&self, event: ProgressEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// Frame a tool `started` event the way the browser IDE expects.
pub fn tool_started_event(task_id: &str, tool_id: &str, name: &str, arguments: &Value) -> ProgressEvent {
    ProgressEvent::data(
        task_id,
        EventType::ProgressUpdateToolActionStarted,
        json!({
            "args": [{
                "id": tool_id,
                "function": {"name": name, "arguments": arguments},
            }]
        }),
    )
}

/// Frame a tool `completed` event. When the tool is
/// `request_code_execution` and its output is an object, a fresh resume
/// token over the current project state is spliced into `output_data`.
pub fn tool_completed_event(
    task_id: &str,
    tool_id: &str,
    name: &str,
    output_data: &Value,
    signer: &TokenSigner,
    base_payload: &RunTokenPayload,
    project: &ProjectFiles,
) -> ProgressEvent {
    let mut output_data = output_data.clone();
    if name == "request_code_execution" {
        if let Value::Object(ref mut map) = output_data {
            let token_payload = RunTokenPayload {
                user_id: base_payload.user_id.clone(),
                message_history: base_payload.message_history.clone(),
                query: base_payload.query.clone(),
                project: project.clone(),
                model: base_payload.model.clone(),
            };
            if let Ok(token) = signer.sign(&token_payload) {
                map.insert("resume_token".to_string(), Value::String(token));
            }
        }
    }

    ProgressEvent::data(
        task_id,
        EventType::ProgressUpdateToolActionCompleted,
        json!({
            "result": {
                "tool_call": {
                    "id": tool_id,
                    "function": {"name": name, "arguments": Value::Null},
                },
                "output_data": output_data,
            }
        }),
    )
}

/// Frame a tool `log` event.
pub fn tool_log_event(task_id: &str, tool_id: &str, name: &str, data: &str) -> ProgressEvent {
    ProgressEvent::data(
        task_id,
        EventType::ProgressUpdateToolActionLog,
        json!({"id": tool_id, "name": name, "data": data}),
    )
}

/// Convert one context log entry into its wire frame.
pub fn tool_event_to_progress(
    task_id: &str,
    event: &ToolEvent,
    signer: &TokenSigner,
    base_payload: &RunTokenPayload,
    project: &ProjectFiles,
) -> ProgressEvent {
    match event {
        ToolEvent::Started {
            tool_id,
            name,
            arguments,
        } => tool_started_event(task_id, tool_id, name, arguments),
        ToolEvent::Completed {
            tool_id,
            name,
            output_data,
        } => tool_completed_event(task_id, tool_id, name, output_data, signer, base_payload, project),
        ToolEvent::Log {
            tool_id,
            name,
            data,
        } => tool_log_event(task_id, tool_id, name, data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{empty_run_payload, test_signer};
    use serde_json::json;

    // ── framing ────────────────────────────────────────────────────────

    #[test]
    fn frames_are_data_prefixed_with_double_newline() {
        let ev = ProgressEvent::data("t1", EventType::RunLog, json!("hi"));
        let frame = sse_frame(&ev);
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
        let inner: Value = serde_json::from_str(&frame[6..frame.len() - 2]).unwrap();
        assert_eq!(inner["event_type"], "run_log");
        assert_eq!(inner["task_id"], "t1");
        assert_eq!(inner["data"], "hi");
    }

    // ── tool frames ────────────────────────────────────────────────────

    #[test]
    fn started_frame_wraps_call_in_args_array() {
        let ev = tool_started_event("t1", "tc_1", "edit_code", &json!({"file_path": "a.py"}));
        assert_eq!(ev.event_type, EventType::ProgressUpdateToolActionStarted);
        assert_eq!(ev.data["args"][0]["id"], "tc_1");
        assert_eq!(ev.data["args"][0]["function"]["name"], "edit_code");
        assert_eq!(ev.data["args"][0]["function"]["arguments"]["file_path"], "a.py");
    }

    #[test]
    fn completed_frame_nests_result_and_output() {
        let signer = test_signer();
        let base = empty_run_payload();
        let ev = tool_completed_event(
            "t1",
            "tc_2",
            "create_file",
            &json!({"created": true}),
            &signer,
            &base,
            &ProjectFiles::new(),
        );
        assert_eq!(ev.data["result"]["tool_call"]["id"], "tc_2");
        assert_eq!(ev.data["result"]["output_data"]["created"], true);
        assert!(ev.data["result"]["output_data"].get("resume_token").is_none());
    }

    #[test]
    fn defer_completion_embeds_a_valid_resume_token() {
        let signer = test_signer();
        let mut base = empty_run_payload();
        base.query = "run it".into();
        let mut project = ProjectFiles::new();
        project.insert("main.py".into(), "print(1)\n".into());

        let ev = tool_completed_event(
            "t1",
            "tc_3",
            "request_code_execution",
            &json!({"response_on_reject": "ok then"}),
            &signer,
            &base,
            &project,
        );
        let token = ev.data["result"]["output_data"]["resume_token"]
            .as_str()
            .unwrap();
        let payload: RunTokenPayload = signer.verify(token).unwrap();
        assert_eq!(payload.query, "run it");
        assert_eq!(payload.project["main.py"], "print(1)\n");
    }

    #[test]
    fn log_frame_is_flat() {
        let ev = tool_log_event("t1", "tc_4", "sandbox_run", "building...\n");
        assert_eq!(ev.data["id"], "tc_4");
        assert_eq!(ev.data["name"], "sandbox_run");
        assert_eq!(ev.data["data"], "building...\n");
    }

    // ── channel policy ─────────────────────────────────────────────────

    #[tokio::test]
    async fn logs_are_dropped_on_backpressure_but_channel_survives() {
        let (tx, mut rx) = ProgressSender::channel("t1");
        for i in 0..(CHANNEL_CAPACITY + 50) {
            tx.send_log(ProgressEvent::data(
                "t1",
                EventType::ProgressUpdateToolActionLog,
                json!(format!("line {i}")),
            ));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CHANNEL_CAPACITY);
        // lifecycle events still deliver after the flood
        assert!(tx.emit(EventType::RunLog, json!("after")).await);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn emit_reports_disconnected_client() {
        let (tx, rx) = ProgressSender::channel("t1");
        drop(rx);
        assert!(!tx.emit(EventType::RunLog, json!("x")).await);
    }
}
