//! Project mutation tools: scoped edits, file and folder operations, and
//! the journaling `think` tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::gateway::{FunctionDef, ToolDef};
use crate::project::{self, EditArgs, EditError};
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

// ── think ──────────────────────────────────────────────────────────────

pub struct ThinkTool;

#[derive(Deserialize)]
struct ThinkArgs {
    thoughts: String,
}

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Record a concise plan for the current task before non-trivial changes.",
            json!({
                "type": "object",
                "properties": {
                    "thoughts": {
                        "type": "string",
                        "description": "Short plan or reasoning to log."
                    }
                },
                "required": ["thoughts"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: ThinkArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let tool_id = guard.begin_tool(self.name(), json!({"thoughts": args.thoughts}));
        guard.complete_tool(&tool_id, self.name(), Value::String(args.thoughts.clone()));
        Ok(args.thoughts)
    }
}

// ── edit_code ──────────────────────────────────────────────────────────

pub struct EditCodeTool;

#[async_trait]
impl Tool for EditCodeTool {
    fn name(&self) -> &str {
        "edit_code"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Make a precise, in-place change within a file. Operates only on lines \
             [find_start_line, find_end_line] (1-based, inclusive); 'find' must appear \
             within that range and only the matched text is replaced. Replacement text \
             must not contain line-number markers.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Project-relative file path."},
                    "find": {"type": "string", "description": "Exact text to replace within the range."},
                    "find_start_line": {"type": "integer", "description": "Start line (1-based, inclusive)."},
                    "find_end_line": {"type": "integer", "description": "End line (1-based, inclusive)."},
                    "replace": {"type": "string", "description": "Replacement text (no line numbers)."}
                },
                "required": ["file_path", "find", "find_start_line", "find_end_line", "replace"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: EditArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let tool_id = guard.begin_tool(
            self.name(),
            json!({
                "file_path": args.file_path,
                "find": args.find,
                "find_start_line": args.find_start_line,
                "find_end_line": args.find_end_line,
                "replace": args.replace,
            }),
        );

        let output = match guard.project.get(&args.file_path) {
            None => json!({"error": format!("File not found: {}", args.file_path)}),
            Some(content) => match project::apply_edit(content, &args) {
                Ok(outcome) => {
                    guard
                        .project
                        .insert(args.file_path.clone(), outcome.new_code.clone());
                    json!({
                        "find": args.find,
                        "find_start_line": args.find_start_line,
                        "find_end_line": args.find_end_line,
                        "replace": args.replace,
                        "old_text": outcome.old_text,
                        "new_text": outcome.new_text,
                        "new_code": outcome.new_code,
                        "file_path": args.file_path,
                        "new_file_content": outcome.new_code,
                    })
                }
                Err(EditError::OutOfRange { total_lines }) => json!({
                    "error": "Line numbers out of range or invalid",
                    "total_lines": total_lines,
                }),
                Err(EditError::FindNotInRange { existing_text }) => json!({
                    "error": "Find text not found at specified lines",
                    "existing_text": existing_text,
                }),
            },
        };

        guard.complete_tool(&tool_id, self.name(), output.clone());
        Ok(output.to_string())
    }
}

// ── create_file ────────────────────────────────────────────────────────

pub struct CreateFileTool;

#[derive(Deserialize)]
struct CreateFileArgs {
    file_path: String,
    content: String,
}

#[async_trait]
impl Tool for CreateFileTool {
    fn name(&self) -> &str {
        "create_file"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Create a new file with the provided content. Does not overwrite an \
             existing file; returns an error instead.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Project-relative path for the new file."},
                    "content": {"type": "string", "description": "Full content of the file."}
                },
                "required": ["file_path", "content"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: CreateFileArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let tool_id = guard.begin_tool(
            self.name(),
            json!({"file_path": args.file_path, "content": args.content}),
        );

        let output = if guard.project.contains_key(&args.file_path) {
            json!({
                "error": format!("File already exists: {}", args.file_path),
                "file_path": args.file_path,
            })
        } else {
            guard
                .project
                .insert(args.file_path.clone(), args.content.clone());
            json!({
                "file_path": args.file_path,
                "new_file_content": args.content,
                "created": true,
            })
        };

        guard.complete_tool(&tool_id, self.name(), output.clone());
        Ok(output.to_string())
    }
}

// ── delete_file ────────────────────────────────────────────────────────

pub struct DeleteFileTool;

#[derive(Deserialize)]
struct DeleteFileArgs {
    file_path: String,
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Delete an existing file. Prefer edits or renames when appropriate.",
            json!({
                "type": "object",
                "properties": {
                    "file_path": {"type": "string", "description": "Path of the file to remove."}
                },
                "required": ["file_path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: DeleteFileArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let tool_id = guard.begin_tool(self.name(), json!({"file_path": args.file_path}));

        let output = if guard.project.shift_remove(&args.file_path).is_some() {
            json!({"file_path": args.file_path, "deleted": true})
        } else {
            json!({
                "error": format!("File not found: {}", args.file_path),
                "file_path": args.file_path,
            })
        };

        guard.complete_tool(&tool_id, self.name(), output.clone());
        Ok(output.to_string())
    }
}

// ── rename_file ────────────────────────────────────────────────────────

pub struct RenameFileTool;

#[derive(Deserialize)]
struct RenamePathArgs {
    old_path: String,
    new_path: String,
}

#[async_trait]
impl Tool for RenameFileTool {
    fn name(&self) -> &str {
        "rename_file"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Rename or move a file; overwrites the destination if it exists. Does not \
             update imports or references; follow up with edit_code.",
            json!({
                "type": "object",
                "properties": {
                    "old_path": {"type": "string", "description": "Current file path."},
                    "new_path": {"type": "string", "description": "Destination path."}
                },
                "required": ["old_path", "new_path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: RenamePathArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let tool_id = guard.begin_tool(
            self.name(),
            json!({"old_path": args.old_path, "new_path": args.new_path}),
        );

        let output = match guard.project.shift_remove(&args.old_path) {
            None => json!({
                "error": format!("File not found: {}", args.old_path),
                "old_path": args.old_path,
                "new_path": args.new_path,
            }),
            Some(content) => {
                let overwritten = guard
                    .project
                    .insert(args.new_path.clone(), content)
                    .is_some();
                let mut output = json!({
                    "old_path": args.old_path,
                    "new_path": args.new_path,
                    "renamed": true,
                });
                if overwritten {
                    output["overwritten"] = json!(true);
                }
                output
            }
        };

        guard.complete_tool(&tool_id, self.name(), output.clone());
        Ok(output.to_string())
    }
}

// ── create_folder ──────────────────────────────────────────────────────

pub struct CreateFolderTool;

#[derive(Deserialize)]
struct FolderArgs {
    folder_path: String,
}

#[async_trait]
impl Tool for CreateFolderTool {
    fn name(&self) -> &str {
        "create_folder"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Declare a folder in the virtual project (UI-level only; no files are \
             created). Fails if a file with the same path exists.",
            json!({
                "type": "object",
                "properties": {
                    "folder_path": {"type": "string", "description": "Folder path to declare."}
                },
                "required": ["folder_path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: FolderArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let tool_id = guard.begin_tool(self.name(), json!({"folder_path": args.folder_path}));

        // Folders are implied by file paths; only a file/folder name clash
        // is an error.
        let output = if guard.project.contains_key(&args.folder_path) {
            json!({
                "error": format!("Conflicts with existing file: {}", args.folder_path),
                "folder_path": args.folder_path,
            })
        } else {
            json!({"folder_path": args.folder_path, "created": true})
        };

        guard.complete_tool(&tool_id, self.name(), output.clone());
        Ok(output.to_string())
    }
}

// ── delete_folder ──────────────────────────────────────────────────────

pub struct DeleteFolderTool;

#[async_trait]
impl Tool for DeleteFolderTool {
    fn name(&self) -> &str {
        "delete_folder"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Delete a folder and every file beneath it. Prefer rename_folder to \
             archive first when possible.",
            json!({
                "type": "object",
                "properties": {
                    "folder_path": {"type": "string", "description": "Folder path to remove."}
                },
                "required": ["folder_path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: FolderArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let tool_id = guard.begin_tool(self.name(), json!({"folder_path": args.folder_path}));

        let removed = project::delete_folder(&mut guard.project, &args.folder_path);
        let output = json!({
            "folder_path": args.folder_path,
            "deleted": true,
            "removed_files": removed,
        });

        guard.complete_tool(&tool_id, self.name(), output.clone());
        Ok(output.to_string())
    }
}

// ── rename_folder ──────────────────────────────────────────────────────

pub struct RenameFolderTool;

#[async_trait]
impl Tool for RenameFolderTool {
    fn name(&self) -> &str {
        "rename_folder"
    }

    fn definition(&self) -> ToolDef {
        function_def(
            self.name(),
            "Rename or move a folder and all contained files by rewriting path \
             prefixes. Does not update imports or references; follow up with \
             edit_code as needed.",
            json!({
                "type": "object",
                "properties": {
                    "old_path": {"type": "string", "description": "Existing folder path."},
                    "new_path": {"type": "string", "description": "New folder path."}
                },
                "required": ["old_path", "new_path"]
            }),
        )
    }

    async fn call(&self, args: Value, ctx: &ToolCtx) -> Result<String, ToolError> {
        let args: RenamePathArgs = parse_args(args)?;
        let mut guard = ctx.context.lock();
        let tool_id = guard.begin_tool(
            self.name(),
            json!({"old_path": args.old_path, "new_path": args.new_path}),
        );

        let moved = project::rename_folder(&mut guard.project, &args.old_path, &args.new_path);
        let output = json!({
            "old_path": args.old_path,
            "new_path": args.new_path,
            "renamed": true,
            "moved_files": moved,
        });

        guard.complete_tool(&tool_id, self.name(), output.clone());
        Ok(output.to_string())
    }
}
