//! File tools bound to a single workspace.
//!
//! Every path argument is resolved by the workspace sandbox, so these tools
//! only ever see the calling session's tree.

use crate::registry::ToolRegistry;
use crate::tool::{flag, optional_str, optional_usize, required_str, Tool, ToolDescriptor};
use async_trait::async_trait;
use okvm_core::{OkvmError, OkvmResult};
use okvm_workspace::{Workspace, WriteMode};
use serde_json::{json, Value};
use std::sync::Arc;

/// Registers the workspace file tools into `registry`.
pub fn register_workspace_tools(registry: &mut ToolRegistry, workspace: Arc<Workspace>) {
    registry.register(Arc::new(WriteFileTool::new(Arc::clone(&workspace))));
    registry.register(Arc::new(ReadFileTool::new(Arc::clone(&workspace))));
    registry.register(Arc::new(EditFileTool::new(Arc::clone(&workspace))));
    registry.register(Arc::new(ListDirectoryTool::new(Arc::clone(&workspace))));
    registry.register(Arc::new(DeleteFileTool::new(workspace)));
}

fn decode_text(path: &str, bytes: Vec<u8>) -> OkvmResult<String> {
    String::from_utf8(bytes)
        .map_err(|_| OkvmError::ToolExecution(format!("'{path}' is not a UTF-8 text file")))
}

/// Writes (or appends) text to a file in the workspace.
pub struct WriteFileTool {
    descriptor: ToolDescriptor,
    workspace: Arc<Workspace>,
}

impl WriteFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "write_file".to_string(),
                description: "Write text to a file in the workspace, creating parent directories as needed.".to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Path relative to the workspace root"
                        },
                        "content": {
                            "type": "string",
                            "description": "Content to write"
                        },
                        "append": {
                            "type": "boolean",
                            "description": "Append instead of overwriting (default: false)"
                        }
                    },
                    "required": ["path", "content"]
                }),
            },
            workspace,
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, arguments: &Value) -> OkvmResult<Value> {
        let path = required_str(arguments, "path")?;
        let content = required_str(arguments, "content")?;
        let mode = if flag(arguments, "append") {
            WriteMode::Append
        } else {
            WriteMode::Overwrite
        };
        let receipt = self
            .workspace
            .write_file(path, content.as_bytes().to_vec(), mode)
            .await?;
        Ok(serde_json::to_value(receipt)?)
    }
}

/// Reads a text file, optionally a window of lines.
pub struct ReadFileTool {
    descriptor: ToolDescriptor,
    workspace: Arc<Workspace>,
}

impl ReadFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "read_file".to_string(),
                description: "Read a text file from the workspace.".to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "offset": {
                            "type": "integer",
                            "description": "Number of lines to skip"
                        },
                        "limit": {
                            "type": "integer",
                            "description": "Maximum number of lines to return"
                        }
                    },
                    "required": ["path"]
                }),
            },
            workspace,
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, arguments: &Value) -> OkvmResult<Value> {
        let path = required_str(arguments, "path")?;
        let offset = optional_usize(arguments, "offset")?.unwrap_or(0);
        let limit = optional_usize(arguments, "limit")?;

        let text = decode_text(path, self.workspace.read_file(path).await?)?;
        let total_lines = text.lines().count();
        let content = if offset == 0 && limit.is_none() {
            text
        } else {
            let window = text.lines().skip(offset);
            match limit {
                Some(n) => window.take(n).collect::<Vec<_>>().join("\n"),
                None => window.collect::<Vec<_>>().join("\n"),
            }
        };
        Ok(json!({
            "path": path,
            "content": content,
            "total_lines": total_lines,
        }))
    }
}

/// Replaces an exact substring in a text file.
pub struct EditFileTool {
    descriptor: ToolDescriptor,
    workspace: Arc<Workspace>,
}

impl EditFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "edit_file".to_string(),
                description: "Replace text in a workspace file. old_string must be unique unless replace_all is set.".to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "old_string": { "type": "string" },
                        "new_string": { "type": "string" },
                        "replace_all": { "type": "boolean" }
                    },
                    "required": ["path", "old_string", "new_string"]
                }),
            },
            workspace,
        }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, arguments: &Value) -> OkvmResult<Value> {
        let path = required_str(arguments, "path")?;
        let old = required_str(arguments, "old_string")?;
        let new = required_str(arguments, "new_string")?;
        let replace_all = flag(arguments, "replace_all");
        if old.is_empty() {
            return Err(OkvmError::ToolExecution("'old_string' must not be empty".into()));
        }
        if old == new {
            return Err(OkvmError::ToolExecution(
                "'old_string' and 'new_string' must differ".into(),
            ));
        }

        let text = decode_text(path, self.workspace.read_file(path).await?)?;
        let count = text.matches(old).count();
        if count == 0 {
            return Err(OkvmError::ToolExecution(format!(
                "'old_string' not found in '{path}'"
            )));
        }
        if count > 1 && !replace_all {
            return Err(OkvmError::ToolExecution(format!(
                "'old_string' occurs {count} times in '{path}'; pass replace_all to replace every occurrence"
            )));
        }
        let (updated, replacements) = if replace_all {
            (text.replace(old, new), count)
        } else {
            (text.replacen(old, new, 1), 1)
        };
        self.workspace
            .write_file(path, updated.into_bytes(), WriteMode::Overwrite)
            .await?;
        Ok(json!({ "path": path, "replacements": replacements }))
    }
}

/// Lists a workspace directory.
pub struct ListDirectoryTool {
    descriptor: ToolDescriptor,
    workspace: Arc<Workspace>,
}

impl ListDirectoryTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "list_directory".to_string(),
                description: "List the entries of a workspace directory (default: the root).".to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" }
                    }
                }),
            },
            workspace,
        }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, arguments: &Value) -> OkvmResult<Value> {
        let path = optional_str(arguments, "path")
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(".");
        let entries = self.workspace.list_directory(path).await?;
        Ok(json!({ "path": path, "entries": entries }))
    }
}

/// Deletes a file or directory from the workspace.
pub struct DeleteFileTool {
    descriptor: ToolDescriptor,
    workspace: Arc<Workspace>,
}

impl DeleteFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: "delete_file".to_string(),
                description: "Delete a file or directory in the workspace.".to_string(),
                parameters_schema: json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" }
                    },
                    "required": ["path"]
                }),
            },
            workspace,
        }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, arguments: &Value) -> OkvmResult<Value> {
        let path = required_str(arguments, "path")?;
        let freed = self.workspace.delete_path(path).await?;
        Ok(json!({ "path": path, "deleted": true, "freed_bytes": freed }))
    }
}
