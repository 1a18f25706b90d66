//! File tools: `read_file`, `write_file`, `list_directory`.
//!
//! Path arguments have already passed the security gate when these run, so the
//! handlers only resolve them against the workspace.

use std::path::Path;

use async_trait::async_trait;
use ignore::WalkBuilder;

use crate::core::tool_parser::{ArgValue, ToolArgs};
use crate::utils::truncate_output;

use super::spec::{
    ArgKind, ArgSpec, ToolContext, ToolDescriptor, ToolError, ToolHandler, optional_str,
    required_str,
};

const MAX_LIST_ENTRIES: usize = 500;

// === read_file ===

pub struct ReadFileTool;

#[async_trait]
impl ToolHandler for ReadFileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "read_file",
            description: "Read a UTF-8 text file from the workspace.",
            mutates: false,
            needs_confirmation: false,
            args: vec![ArgSpec::required("path", ArgKind::Path)],
        }
    }

    async fn execute(&self, args: &ToolArgs, context: &ToolContext) -> Result<String, ToolError> {
        let raw = required_str(args, "path")?;
        let path = context.resolve_path(raw);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| ToolError::execution_failed(format!("Cannot read {raw}: {err}")))?;
        if metadata.is_dir() {
            return Err(ToolError::invalid_input(format!(
                "{raw} is a directory; use list_directory"
            )));
        }

        let bytes = tokio::fs::read(&path).await?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(truncate_output(&text, context.max_read_bytes))
    }
}

// === write_file ===

pub struct WriteFileTool;

#[async_trait]
impl ToolHandler for WriteFileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "write_file",
            description: "Create or overwrite a file in the workspace.",
            mutates: true,
            needs_confirmation: false,
            args: vec![
                ArgSpec::required("path", ArgKind::Path),
                ArgSpec::required("content", ArgKind::Text),
            ],
        }
    }

    async fn execute(&self, args: &ToolArgs, context: &ToolContext) -> Result<String, ToolError> {
        let raw = required_str(args, "path")?;
        let content: Vec<u8> = match args.get("content") {
            Some(ArgValue::Text(text)) => text.clone().into_bytes(),
            Some(ArgValue::Bytes(bytes)) => bytes.clone(),
            None => return Err(ToolError::missing_field("content")),
        };
        let path = context.resolve_path(raw);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);
        tokio::fs::write(&path, &content).await?;

        let verb = if existed { "Overwrote" } else { "Created" };
        Ok(format!("{verb} {raw} ({} bytes)", content.len()))
    }
}

// === list_directory ===

pub struct ListDirTool;

#[async_trait]
impl ToolHandler for ListDirTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "list_directory",
            description: "List files in a workspace directory (respects .gitignore).",
            mutates: false,
            needs_confirmation: false,
            args: vec![
                ArgSpec::optional("path", ArgKind::Path),
                ArgSpec::optional("depth", ArgKind::Text),
            ],
        }
    }

    async fn execute(&self, args: &ToolArgs, context: &ToolContext) -> Result<String, ToolError> {
        let raw = optional_str(args, "path").unwrap_or(".").to_string();
        let depth = match optional_str(args, "depth") {
            Some(depth) => depth
                .parse::<usize>()
                .map_err(|_| ToolError::invalid_input(format!("depth must be a number, got {depth}")))?
                .clamp(1, 5),
            None => 1,
        };
        let root = context.resolve_path(&raw);
        if !root.is_dir() {
            return Err(ToolError::invalid_input(format!("{raw} is not a directory")));
        }

        let entries = tokio::task::spawn_blocking(move || list_entries(&root, depth))
            .await
            .map_err(|err| ToolError::execution_failed(err.to_string()))?;

        if entries.is_empty() {
            return Ok(format!("{raw} is empty"));
        }
        let mut output = entries.join("\n");
        if entries.len() == MAX_LIST_ENTRIES {
            output.push_str(&format!("\n[listing capped at {MAX_LIST_ENTRIES} entries]"));
        }
        Ok(output)
    }
}

fn list_entries(root: &Path, depth: usize) -> Vec<String> {
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(false)
        .follow_links(false)
        .max_depth(Some(depth))
        .filter_entry(|entry| entry.file_name() != ".git");

    let mut entries: Vec<String> = builder
        .build()
        .flatten()
        .filter(|entry| entry.depth() > 0)
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(root).ok()?;
            let mut display = rel.to_string_lossy().replace('\\', "/");
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                display.push('/');
            }
            Some(display)
        })
        .collect();
    entries.sort();
    entries.truncate(MAX_LIST_ENTRIES);
    entries
}
