//! Subprocess model channel.
//!
//! Runs a configured program once per prompt, e.g.
//! `bash gemini-account.sh {account}` with the prompt on stdin. `{account}` in
//! the arguments is replaced by the credential id; if an argument contains
//! `{prompt}` the prompt is substituted there instead of being written to stdin.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::core::governor::Credential;
use crate::llm_client::{ChannelError, ModelChannel};
use crate::utils::one_line;

const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "rate limit",
    "rate-limit",
    "ratelimit",
    "429",
    "resource_exhausted",
    "resource exhausted",
];

#[derive(Debug, Clone)]
pub struct CommandChannel {
    program: String,
    args: Vec<String>,
}

impl CommandChannel {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn render_args(&self, prompt: &str, credential: &Credential) -> (Vec<String>, bool) {
        let mut prompt_inline = false;
        let args = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains("{prompt}") {
                    prompt_inline = true;
                }
                arg.replace("{account}", credential.id())
                    .replace("{prompt}", prompt)
            })
            .collect();
        (args, prompt_inline)
    }
}

#[async_trait]
impl ModelChannel for CommandChannel {
    async fn invoke(
        &self,
        prompt: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<String, ChannelError> {
        let (args, prompt_inline) = self.render_args(prompt, credential);
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(if prompt_inline { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ChannelError::Transport(format!("failed to start {}: {err}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = prompt.to_string();
            tokio::spawn(async move {
                // The child may exit without reading; a broken pipe is not our error.
                let _ = stdin.write_all(payload.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| ChannelError::Transport(err.to_string()))?,
            Err(_) => {
                tracing::warn!(%credential, ?timeout, "model process timed out, killed");
                return Err(ChannelError::Timeout(timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let detail = if stderr.trim().is_empty() {
                one_line(&stdout, 200)
            } else {
                one_line(&stderr, 200)
            };
            let lowered = stderr.to_lowercase();
            if QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker)) {
                return Err(ChannelError::QuotaExceeded(detail));
            }
            return Err(ChannelError::Transport(format!(
                "exit code {}: {detail}",
                output.status.code().unwrap_or(-1)
            )));
        }

        let text = stdout.trim();
        if text.is_empty() {
            return Err(ChannelError::Transport(
                "empty response (possible rate limiting)".to_string(),
            ));
        }
        Ok(text.to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandChannel {
        CommandChannel::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn prompt_is_written_to_stdin() {
        let channel = CommandChannel::new("cat", Vec::new());
        let reply = channel
            .invoke("hello model", &Credential::new("1"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(reply, "hello model");
    }

    #[tokio::test]
    async fn placeholders_are_substituted() {
        let channel = CommandChannel::new(
            "echo",
            vec!["account={account}".to_string(), "{prompt}".to_string()],
        );
        let reply = channel
            .invoke("hi", &Credential::new("2"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(reply, "account=2 hi");
    }

    #[tokio::test]
    async fn quota_messages_map_to_quota_exceeded() {
        let err = sh("echo 'HTTP 429: Rate limit reached' >&2; exit 1")
            .invoke("x", &Credential::new("1"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn other_failures_are_transport_errors() {
        let err = sh("echo boom >&2; exit 3")
            .invoke("x", &Credential::new("1"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Transport("exit code 3: boom".to_string()));
    }

    #[tokio::test]
    async fn empty_output_is_a_transport_error() {
        let err = CommandChannel::new("true", Vec::new())
            .invoke("x", &Credential::new("1"), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Transport(msg) if msg.contains("empty response")));
    }

    #[tokio::test]
    async fn slow_process_times_out() {
        let err = CommandChannel::new("sleep", vec!["5".to_string()])
            .invoke("x", &Credential::new("1"), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Timeout(Duration::from_millis(100)));
    }
}
