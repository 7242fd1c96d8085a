//! Workspace file capabilities: list, read, write.

use serde::Deserialize;

use crate::tools::tool::{CapabilitySpec, MAX_OUTPUT_SIZE, ParamSpec, ToolContext, ToolError};
use crate::util::truncate_output;

pub const LIST_FILES: CapabilitySpec = CapabilitySpec {
    name: "list_files",
    description: "Lists files in a specified directory.",
    params: &[ParamSpec::optional(
        "path",
        "directory to list, relative to the workspace (default \".\")",
    )],
};

pub const READ_FILE: CapabilitySpec = CapabilitySpec {
    name: "read_file",
    description: "Reads the content of a file.",
    params: &[ParamSpec::required("path", "file to read")],
};

pub const WRITE_FILE: CapabilitySpec = CapabilitySpec {
    name: "write_file",
    description: "Writes content to a file, creating parent directories as needed.",
    params: &[
        ParamSpec::required("path", "file to write"),
        ParamSpec::required("content", "full new content of the file"),
    ],
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListFilesArgs {
    #[serde(default = "current_dir")]
    pub path: String,
}

fn current_dir() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadFileArgs {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFileArgs {
    pub path: String,
    pub content: String,
}

pub async fn list_files(ctx: &ToolContext, args: &ListFilesArgs) -> String {
    match try_list(ctx, &args.path).await {
        Ok(listing) => listing,
        Err(e) => format!("Error listing files: {e}"),
    }
}

async fn try_list(ctx: &ToolContext, path: &str) -> Result<String, ToolError> {
    let mut entries = tokio::fs::read_dir(ctx.resolve(path)).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            name.push('/');
        }
        names.push(name);
    }
    if names.is_empty() {
        return Ok("(empty directory)".to_string());
    }
    names.sort();
    Ok(truncate_output(&names.join("\n"), MAX_OUTPUT_SIZE))
}

pub async fn read_file(ctx: &ToolContext, args: &ReadFileArgs) -> String {
    match tokio::fs::read_to_string(ctx.resolve(&args.path)).await {
        Ok(content) => truncate_output(&content, MAX_OUTPUT_SIZE),
        Err(e) => format!("Error reading file: {e}"),
    }
}

pub async fn write_file(ctx: &ToolContext, args: &WriteFileArgs) -> String {
    match try_write(ctx, args).await {
        Ok(()) => format!("Successfully wrote to {}.", args.path),
        Err(e) => format!("Error writing to file: {e}"),
    }
}

async fn try_write(ctx: &ToolContext, args: &WriteFileArgs) -> Result<(), ToolError> {
    let path = ctx.resolve(&args.path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &args.content).await?;
    Ok(())
}
