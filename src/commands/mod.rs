//! Console commands for the interactive chat.
//!
//! A line is a command only when it is exactly a command word (optionally with a
//! leading `/`). Anything else is sent to the model as a request.

use std::fmt::Write;

use crate::approval::ApprovalMode;
use crate::core::governor::CredentialStatus;
use crate::core::turn::{Turn, TurnStatus};
use crate::utils::one_line;

const HISTORY_PREVIEW_CHARS: usize = 80;

/// What the chat loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Quit,
    /// Archive committed history and start fresh.
    ClearHistory,
    ShowHistory,
    ShowStatus,
}

/// Result of executing a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Optional message to display to the user
    pub message: Option<String>,
    /// Optional action for the chat loop to take
    pub action: Option<CommandAction>,
}

impl CommandResult {
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            message: Some(msg.into()),
            action: None,
        }
    }

    pub fn action(action: CommandAction) -> Self {
        Self {
            message: None,
            action: Some(action),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            message: Some(format!("Error: {}", msg.into())),
            action: None,
        }
    }
}

/// Command metadata for help
#[derive(Debug, Clone, Copy)]
pub struct CommandInfo {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub description: &'static str,
    pub usage: &'static str,
}

/// All registered commands
pub const COMMANDS: &[CommandInfo] = &[
    CommandInfo {
        name: "help",
        aliases: &["?"],
        description: "Show help information",
        usage: "help [command]",
    },
    CommandInfo {
        name: "clear",
        aliases: &[],
        description: "Archive the conversation history and start fresh",
        usage: "clear",
    },
    CommandInfo {
        name: "history",
        aliases: &[],
        description: "List the committed turns of this conversation",
        usage: "history",
    },
    CommandInfo {
        name: "status",
        aliases: &["accounts"],
        description: "Show session, approval policy and per-account usage",
        usage: "status",
    },
    CommandInfo {
        name: "exit",
        aliases: &["quit", "q"],
        description: "Exit and write the session handoff",
        usage: "exit",
    },
];

/// Get command info by name or alias
pub fn get_command_info(name: &str) -> Option<&'static CommandInfo> {
    let name = name.strip_prefix('/').unwrap_or(name);
    COMMANDS
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

/// Execute `input` if it is a command; `None` means it is a model request.
pub fn execute(input: &str) -> Option<CommandResult> {
    let trimmed = input.trim();
    let slashed = trimmed.starts_with('/');
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let word = parts.next()?.to_lowercase();
    let arg = parts.next().map(str::trim).filter(|arg| !arg.is_empty());
    let command = word.strip_prefix('/').unwrap_or(&word);

    // Bare words only count when they stand alone, except `help <topic>`.
    let info = get_command_info(command);
    if !slashed && (info.is_none() || (arg.is_some() && info.map(|i| i.name) != Some("help"))) {
        return None;
    }

    let result = match command {
        "help" | "?" => help(arg),
        "clear" => CommandResult::action(CommandAction::ClearHistory),
        "history" => CommandResult::action(CommandAction::ShowHistory),
        "status" | "accounts" => CommandResult::action(CommandAction::ShowStatus),
        "exit" | "quit" | "q" => CommandResult::action(CommandAction::Quit),
        _ => CommandResult::error(format!(
            "Unknown command: /{command}. Type help for available commands."
        )),
    };
    Some(result)
}

/// Show help information
pub fn help(topic: Option<&str>) -> CommandResult {
    if let Some(topic) = topic {
        return match get_command_info(topic) {
            Some(cmd) => {
                let mut help = format!("{}\n\n  {}\n\n  Usage: {}", cmd.name, cmd.description, cmd.usage);
                if !cmd.aliases.is_empty() {
                    let _ = write!(help, "\n  Aliases: {}", cmd.aliases.join(", "));
                }
                CommandResult::message(help)
            }
            None => CommandResult::error(format!("Unknown command: {topic}")),
        };
    }

    let width = COMMANDS.iter().map(|cmd| cmd.usage.len()).max().unwrap_or(0);
    let mut out = String::from("Commands:\n");
    for cmd in COMMANDS {
        let _ = writeln!(out, "  {:<width$}  {}", cmd.usage, cmd.description);
    }
    out.push_str("\nAnything else is sent to the assistant. Ctrl-C cancels a running turn.");
    CommandResult::message(out)
}

/// One line per committed turn.
#[must_use]
pub fn format_history(turns: &[Turn]) -> String {
    if turns.is_empty() {
        return "No turns yet.".to_string();
    }
    let mut out = String::new();
    for turn in turns {
        let marker = match turn.status {
            TurnStatus::Completed => "",
            TurnStatus::Truncated => " [truncated]",
        };
        let _ = write!(
            out,
            "#{} {}{marker}\n    {}",
            turn.index,
            one_line(&turn.user, HISTORY_PREVIEW_CHARS),
            one_line(&turn.response, HISTORY_PREVIEW_CHARS)
        );
        let tools: Vec<&str> = turn.tool_names().collect();
        if !tools.is_empty() {
            let _ = write!(out, "\n    tools: {}", tools.join(", "));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Session header plus one row per credential.
#[must_use]
pub fn format_status(session_id: &str, mode: ApprovalMode, turns: u64, accounts: &[CredentialStatus]) -> String {
    let mut out = format!("Session {session_id}\nApproval policy: {mode}\nTurns: {turns}\n\nAccounts:\n");
    for status in accounts {
        let _ = writeln!(
            out,
            "  {:<12} {}/{} this window (soft {}), circuit {}, {} requests, {} failures",
            status.credential.to_string(),
            status.window_count,
            status.window_limit,
            status.soft_limit,
            status.circuit,
            status.total_requests,
            status.total_failures
        );
    }
    out.trim_end().to_string()
}
