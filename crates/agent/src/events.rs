//! Tool events and the progress-event wire format.
//!
//! A run accumulates `ToolEvent`s in its context log; the runner's event
//! pump converts them into `ProgressEvent`s for the client stream. Tool ids
//! are `tc_<N>` where N is the 1-based index into the log at allocation
//! time, so a started/completed pair always shares one id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::macros::format_description;

/// One phase of a tool call as recorded in the run context log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ToolEvent {
    Started {
        tool_id: String,
        name: String,
        arguments: Value,
    },
    Completed {
        tool_id: String,
        name: String,
        output_data: Value,
    },
    Log {
        tool_id: String,
        name: String,
        data: String,
    },
}

impl ToolEvent {
    pub fn tool_id(&self) -> &str {
        match self {
            ToolEvent::Started { tool_id, .. }
            | ToolEvent::Completed { tool_id, .. }
            | ToolEvent::Log { tool_id, .. } => tool_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ToolEvent::Started { name, .. }
            | ToolEvent::Completed { name, .. }
            | ToolEvent::Log { name, .. } => name,
        }
    }
}

/// Wire-level event type tags understood by the browser IDE.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunLog,
    RunFailed,
    AgentOutput,
    ProgressUpdateToolActionStarted,
    ProgressUpdateToolActionCompleted,
    ProgressUpdateToolActionLog,
    PlayStarted,
    PlaySandbox,
    PlayLog,
    PlayPreview,
    PlayComplete,
    PlayFailed,
}

/// A single framed progress event as delivered over the event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_type: EventType,
    pub task_id: String,
    pub timestamp: String,
    pub data: Value,
    pub error: Value,
}

impl ProgressEvent {
    pub fn new(task_id: &str, event_type: EventType, data: Value, error: Value) -> Self {
        Self {
            event_type,
            task_id: task_id.to_string(),
            timestamp: utc_timestamp(),
            data,
            error,
        }
    }

    pub fn data(task_id: &str, event_type: EventType, data: Value) -> Self {
        Self::new(task_id, event_type, data, Value::Null)
    }

    pub fn error(task_id: &str, event_type: EventType, error: impl Into<String>) -> Self {
        Self::new(task_id, event_type, Value::Null, Value::String(error.into()))
    }
}

fn utc_timestamp() -> String {
    let format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]+00:00");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00+00:00"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── ToolEvent ──────────────────────────────────────────────────────

    #[test]
    fn tool_event_serializes_with_phase_tag() {
        let ev = ToolEvent::Started {
            tool_id: "tc_1".into(),
            name: "edit_code".into(),
            arguments: json!({"file_path": "main.py"}),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["phase"], "started");
        assert_eq!(v["tool_id"], "tc_1");
        assert_eq!(v["arguments"]["file_path"], "main.py");
    }

    #[test]
    fn tool_event_accessors_cover_all_phases() {
        let events = [
            ToolEvent::Started {
                tool_id: "tc_1".into(),
                name: "think".into(),
                arguments: Value::Null,
            },
            ToolEvent::Completed {
                tool_id: "tc_1".into(),
                name: "think".into(),
                output_data: Value::Null,
            },
            ToolEvent::Log {
                tool_id: "tc_1".into(),
                name: "think".into(),
                data: String::new(),
            },
        ];
        for ev in &events {
            assert_eq!(ev.tool_id(), "tc_1");
            assert_eq!(ev.name(), "think");
        }
    }

    // ── ProgressEvent ──────────────────────────────────────────────────

    #[test]
    fn event_type_uses_snake_case_tags() {
        let v = serde_json::to_value(EventType::ProgressUpdateToolActionStarted).unwrap();
        assert_eq!(v, "progress_update_tool_action_started");
        let v = serde_json::to_value(EventType::RunFailed).unwrap();
        assert_eq!(v, "run_failed");
        let v = serde_json::to_value(EventType::PlayPreview).unwrap();
        assert_eq!(v, "play_preview");
    }

    #[test]
    fn progress_event_carries_task_and_timestamp() {
        let ev = ProgressEvent::data("task_1", EventType::RunLog, json!("hello"));
        assert_eq!(ev.task_id, "task_1");
        assert!(ev.timestamp.ends_with("+00:00"));
        assert_eq!(ev.data, json!("hello"));
        assert!(ev.error.is_null());
    }

    #[test]
    fn error_constructor_leaves_data_null() {
        let ev = ProgressEvent::error("t", EventType::RunFailed, "boom");
        assert!(ev.data.is_null());
        assert_eq!(ev.error, json!("boom"));
    }
}
