//! The defer point: `request_code_execution`.
//!
//! On a fresh run this pauses the agent and hands control back to the
//! client (the runner embeds a resume token in the completed event). On a
//! resumed run the cached execution result is returned to the agent
//! directly; an empty string is a valid result.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::gateway::{FunctionDef, ToolDef};
use crate::tools::{Tool, ToolCtx, ToolError, parse_args};

pub const EXECUTION_REQUESTED: &str = "EXECUTION_REQUESTED";

pub struct RequestCodeExecutionTool;

#[derive(Deserialize)]
struct ExecutionArgs {
    response_on_reject: String,
}

#[async_trait]
impl Tool for RequestCodeExecutionTool {
    fn name(&self) -> &str {
        "request_code_execution"
    }

    fn definition(&self) -> ToolDef {
        ToolDef {
            tool_type: "function".to_string(),
            function: FunctionDef {
                name: self.name().to_string(),
                description: "Ask the UI to execute code and return output. If execution is \
                              not yet available, the run defers and resumes later with the \
                              result."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "response_on_reject": {
                            "type": "string",
                            "description": "Fallback message if the user declines execution."
                        }
                    },
                    "required": ["response_on_reject"]
                }),
            },
        }
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: ExecutionArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let tool_id = guard.begin_tool(
            self.name(),
            json!({"response_on_reject": args.response_on_reject}),
        );

        if let Some(result) = guard.exec_result.clone() {
            guard.complete_tool(&tool_id, self.name(), json!({"result": result}));
            return Ok(result);
        }

        // Defer; the runner mints a resume token into the completed event.
        guard.defer_requested = true;
        guard.complete_tool(
            &tool_id,
            self.name(),
            json!({"response_on_reject": args.response_on_reject}),
        );
        Ok(EXECUTION_REQUESTED.to_string())
    }
}
