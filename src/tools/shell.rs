//! `run_command`: execute an allow-listed command inside the workspace.
//!
//! The command line is split with `shlex` and executed directly, never through
//! a shell, so pipes and substitutions the gate did not see cannot run.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::core::tool_parser::ToolArgs;
use crate::utils::truncate_output;

use super::spec::{
    ArgKind, ArgSpec, ToolContext, ToolDescriptor, ToolError, ToolHandler, optional_str,
    required_str,
};

const MAX_OUTPUT_SIZE: usize = 30_000;

pub struct RunCommandTool;

#[async_trait]
impl ToolHandler for RunCommandTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "run_command",
            description: "Run an allow-listed command (git, cargo, npm, pytest, ls, ...) in the workspace.",
            mutates: false,
            needs_confirmation: true,
            args: vec![
                ArgSpec::required("command", ArgKind::Command).with_aliases(&["cmd"]),
                ArgSpec::optional("cwd", ArgKind::Path),
            ],
        }
    }

    async fn execute(&self, args: &ToolArgs, context: &ToolContext) -> Result<String, ToolError> {
        let command = required_str(args, "command")?;
        let argv = shlex::split(command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| ToolError::invalid_input(format!("cannot parse command: {command}")))?;
        let work_dir = match optional_str(args, "cwd") {
            Some(cwd) => context.resolve_path(cwd),
            None => context.workspace.clone(),
        };

        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => ToolError::not_available(format!("{} is not installed", argv[0])),
                _ => ToolError::execution_failed(format!("Failed to execute {}: {err}", argv[0])),
            })?;

        let output = match tokio::time::timeout(context.command_timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    seconds: context.command_timeout.as_secs(),
                });
            }
        };

        let code = output.status.code().unwrap_or(-1);
        let rendered = render_output(
            code,
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        );
        if output.status.success() {
            Ok(rendered)
        } else {
            Err(ToolError::execution_failed(rendered))
        }
    }
}

fn render_output(code: i32, stdout: &str, stderr: &str) -> String {
    let mut rendered = format!("exit_code: {code}");
    if !stdout.trim().is_empty() {
        rendered.push_str("\nstdout:\n");
        rendered.push_str(&truncate_output(stdout.trim_end(), MAX_OUTPUT_SIZE));
    }
    if !stderr.trim().is_empty() {
        rendered.push_str("\nstderr:\n");
        rendered.push_str(&truncate_output(stderr.trim_end(), MAX_OUTPUT_SIZE));
    }
    rendered
}
