//! Offline harness for exercising tool loops without a real model.
//!
//! [`ScriptedChannel`] replays canned replies in order and records every
//! prompt it receives, so tests can drive the engine end to end.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::core::governor::Credential;
use crate::llm_client::{ChannelError, ModelChannel};

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(String),
    Fail(ChannelError),
    /// Wait before replying; fails with `Timeout` if the wait exceeds the call timeout.
    Delayed(Duration, String),
}

/// What the channel saw on one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub prompt: String,
    pub credential: Credential,
}

#[derive(Debug, Default)]
pub struct ScriptedChannel {
    steps: Mutex<VecDeque<ScriptStep>>,
    /// Returned once the script runs out.
    fallback: Option<String>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedChannel {
    #[must_use]
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback: None,
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Replies in order, then fails.
    #[must_use]
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(|reply| ScriptStep::Reply(reply.into())))
    }

    /// Answers every prompt with the same text.
    #[must_use]
    pub fn repeating(reply: impl Into<String>) -> Self {
        Self {
            fallback: Some(reply.into()),
            ..Self::default()
        }
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    fn next_step(&self) -> Option<ScriptStep> {
        let scripted = self.steps.lock().ok().and_then(|mut steps| steps.pop_front());
        scripted.or_else(|| self.fallback.clone().map(ScriptStep::Reply))
    }
}

#[async_trait]
impl ModelChannel for ScriptedChannel {
    async fn invoke(
        &self,
        prompt: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<String, ChannelError> {
        if let Ok(mut calls) = self.invocations.lock() {
            calls.push(Invocation {
                prompt: prompt.to_string(),
                credential: credential.clone(),
            });
        }
        match self.next_step() {
            Some(ScriptStep::Reply(reply)) => Ok(reply),
            Some(ScriptStep::Fail(err)) => Err(err),
            Some(ScriptStep::Delayed(delay, reply)) => {
                if delay > timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(ChannelError::Timeout(timeout));
                }
                tokio::time::sleep(delay).await;
                Ok(reply)
            }
            None => Err(ChannelError::Transport("script exhausted".to_string())),
        }
    }
}

/// Lay down a small Rust project to run scenarios against.
pub fn seed_workspace(root: &Path) -> Result<()> {
    let src = root.join("src");
    fs::create_dir_all(&src).with_context(|| format!("failed to create {}", src.display()))?;
    fs::write(
        root.join("Cargo.toml"),
        "[package]\nname = \"demo\"\nversion = \"0.1.0\"\nedition = \"2021\"\n",
    )?;
    fs::write(src.join("main.rs"), "fn main() {\n    println!(\"{}\", demo::add(1, 2));\n}\n")?;
    fs::write(src.join("lib.rs"), "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n")?;
    fs::write(root.join("README.md"), "# demo\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_runs_dry() {
        let channel = ScriptedChannel::replies(["one", "two"]);
        let cred = Credential::new("1");
        let timeout = Duration::from_secs(1);
        assert_eq!(channel.invoke("a", &cred, timeout).await.unwrap(), "one");
        assert_eq!(channel.invoke("b", &cred, timeout).await.unwrap(), "two");
        assert!(channel.invoke("c", &cred, timeout).await.is_err());
        assert_eq!(channel.invocation_count(), 3);
        assert_eq!(channel.invocations()[1].prompt, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_steps_time_out() {
        let channel = ScriptedChannel::new([ScriptStep::Delayed(Duration::from_secs(10), "late".into())]);
        let err = channel
            .invoke("x", &Credential::new("1"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Timeout(Duration::from_secs(2)));
    }

    #[test]
    fn seeds_a_rust_project() {
        let dir = tempfile::tempdir().unwrap();
        seed_workspace(dir.path()).unwrap();
        assert!(dir.path().join("src/lib.rs").is_file());
        assert_eq!(crate::utils::summarize_project(dir.path()), "A Rust project");
    }
}
