//! Prompt assembly.
//!
//! The model sees one flat text per invocation: the system prompt, a window of
//! recent turns, the current request and everything exchanged so far in this
//! turn.

use std::fmt::Write as _;
use std::path::Path;

use crate::core::turn::Turn;
use crate::tools::ToolRegistry;
use crate::utils::truncate_with_ellipsis;

// Prompt files loaded at compile time
pub const BASE_PROMPT: &str = include_str!("prompts/base.txt");

const CONTINUE_INSTRUCTION: &str = "Continue from the tool results above. Emit more TOOL_CALL lines if you need them, otherwise give your final answer.";

/// Longest rendering of a past answer kept in the history window.
const HISTORY_RESPONSE_CHARS: usize = 2_000;

/// Base prompt plus the tool catalogue and a short project summary.
#[must_use]
pub fn system_prompt(registry: &ToolRegistry, workspace: &Path) -> String {
    let mut prompt = BASE_PROMPT.trim().to_string();

    prompt.push_str("\n\n## Tools\n");
    for descriptor in registry.descriptors() {
        let _ = write!(
            prompt,
            "\n{}\n  {}\n",
            descriptor.usage_line(),
            descriptor.description
        );
    }

    let _ = write!(
        prompt,
        "\n## Workspace\n{}\n**Summary:** {}",
        workspace.display(),
        crate::utils::summarize_project(workspace)
    );
    prompt
}

/// Render the full prompt for one model invocation.
///
/// `transcript` holds this turn's model outputs and encoded results in order.
#[must_use]
pub fn build_turn_prompt(
    system: &str,
    history: &[Turn],
    window: usize,
    user: &str,
    transcript: &[String],
) -> String {
    let mut prompt = system.trim_end().to_string();

    let recent = &history[history.len().saturating_sub(window)..];
    if !recent.is_empty() {
        prompt.push_str("\n\n## Conversation so far\n");
        for turn in recent {
            let _ = write!(prompt, "\nUser: {}\n", turn.user);
            let tools: Vec<&str> = turn.tool_names().collect();
            if !tools.is_empty() {
                let _ = writeln!(prompt, "(tools used: {})", tools.join(", "));
            }
            let _ = writeln!(
                prompt,
                "Assistant: {}",
                truncate_with_ellipsis(&turn.response, HISTORY_RESPONSE_CHARS, "...")
            );
        }
    }

    let _ = write!(prompt, "\n\n## Current request\nUser: {user}\n");

    if !transcript.is_empty() {
        prompt.push_str("\n## This turn\n");
        for entry in transcript {
            let _ = write!(prompt, "\n{entry}\n");
        }
        let _ = write!(prompt, "\n{CONTINUE_INSTRUCTION}\n");
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::governor::Credential;
    use crate::core::turn::TurnStatus;
    use crate::tools::{ToolContext, ToolRegistryBuilder};
    use chrono::Utc;

    fn turn(index: u64, user: &str, response: &str) -> Turn {
        Turn {
            index,
            user: user.to_string(),
            exchanges: Vec::new(),
            response: response.to_string(),
            credential: Credential::new("1"),
            timestamp: Utc::now(),
            status: TurnStatus::Completed,
        }
    }

    #[test]
    fn history_window_keeps_the_latest_turns() {
        let history = vec![turn(0, "first", "a"), turn(1, "second", "b"), turn(2, "third", "c")];
        let prompt = build_turn_prompt("SYSTEM", &history, 2, "now", &[]);
        assert!(prompt.starts_with("SYSTEM"));
        assert!(!prompt.contains("User: first"));
        assert!(prompt.contains("User: second\nAssistant: b"));
        assert!(prompt.contains("## Current request\nUser: now"));
        assert!(!prompt.contains("## This turn"));
    }

    #[test]
    fn transcript_follows_the_request() {
        let transcript = vec![
            "TOOL_CALL: list_directory | path=src".to_string(),
            "TOOL_RESULT: list_directory | path=src | status=success | output=main.rs".to_string(),
        ];
        let prompt = build_turn_prompt("SYSTEM", &[], 5, "list src", &transcript);
        let request = prompt.find("User: list src").unwrap();
        let result = prompt.find("TOOL_RESULT:").unwrap();
        assert!(request < result);
        assert!(prompt.ends_with(&format!("{CONTINUE_INSTRUCTION}\n")));
    }

    #[test]
    fn system_prompt_lists_registered_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistryBuilder::new(ToolContext::new(dir.path()))
            .with_file_tools()
            .build();
        let prompt = system_prompt(&registry, dir.path());
        assert!(prompt.contains("TOOL_CALL: read_file | path=<path>"));
        assert!(prompt.contains("## Workspace"));
    }
}
