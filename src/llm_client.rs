//! Model channel contract.
//!
//! The engine only sees text in and text out. Everything about how a model is
//! reached (a subprocess, a socket, a scripted fake in tests) lives behind
//! [`ModelChannel`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::governor::{Credential, Outcome};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl ChannelError {
    /// How the failure is reported to the governor.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::QuotaExceeded(_) => Outcome::RateLimited,
            Self::Timeout(_) | Self::Transport(_) => Outcome::Failure,
        }
    }

    /// Short error code for the audit log.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "channel_timeout",
            Self::QuotaExceeded(_) => "channel_quota",
            Self::Transport(_) => "channel_transport",
        }
    }
}

#[async_trait]
pub trait ModelChannel: Send + Sync {
    /// Send `prompt` on behalf of `credential` and return the raw model text.
    async fn invoke(
        &self,
        prompt: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<String, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_spend_the_window() {
        assert_eq!(
            ChannelError::QuotaExceeded("429".into()).outcome(),
            Outcome::RateLimited
        );
        assert_eq!(
            ChannelError::Timeout(Duration::from_secs(1)).outcome(),
            Outcome::Failure
        );
        assert_eq!(ChannelError::Transport("x".into()).code(), "channel_transport");
    }
}
