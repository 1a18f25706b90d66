//! Parallel sub-conversations.
//!
//! Each query becomes one job on its own Tokio task. Jobs wait on a shared
//! semaphore, take their own credential from the [`Governor`], invoke the model
//! once and report the outcome. Results come back in input order regardless of
//! completion order; one job failing or timing out never affects the others.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::core::governor::{Credential, Governor, GovernorError, Outcome};
use crate::llm_client::{ChannelError, ModelChannel};

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Upper bound on jobs in flight; the governor's soft capacity also applies.
    pub max_concurrency: Option<usize>,
    pub job_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            acquire_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("{credential}: {source}")]
    Channel {
        credential: Credential,
        source: ChannelError,
    },
    #[error(transparent)]
    Exhausted(GovernorError),
    #[error("job failed: {0}")]
    Internal(String),
}

/// One query and what became of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnJob {
    pub query: String,
    /// Credential that served the job, if one was assigned.
    pub credential: Option<Credential>,
    pub result: Result<String, SpawnError>,
}

pub struct SpawnCoordinator {
    channel: Arc<dyn ModelChannel>,
    governor: Arc<Governor>,
    config: SpawnConfig,
}

impl SpawnCoordinator {
    #[must_use]
    pub fn new(channel: Arc<dyn ModelChannel>, governor: Arc<Governor>, config: SpawnConfig) -> Self {
        Self {
            channel,
            governor,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    /// Run every query in parallel; results in input order.
    pub async fn spawn_many(&self, queries: Vec<String>) -> Vec<Result<String, SpawnError>> {
        self.run_jobs(queries).await.into_iter().map(|job| job.result).collect()
    }

    /// Like [`Self::spawn_many`] with `context` prepended to every prompt.
    pub async fn spawn_with_context(&self, context: &str, queries: Vec<String>) -> Vec<SpawnJob> {
        let jobs = queries
            .into_iter()
            .map(|query| {
                let prompt = format_prompt(Some(context), &query);
                (query, prompt)
            })
            .collect();
        self.run(jobs).await
    }

    /// Run every query in parallel and keep the per-job details.
    pub async fn run_jobs(&self, queries: Vec<String>) -> Vec<SpawnJob> {
        let jobs = queries
            .into_iter()
            .map(|query| {
                let prompt = query.clone();
                (query, prompt)
            })
            .collect();
        self.run(jobs).await
    }

    /// Jobs allowed in flight at once.
    pub async fn concurrency_limit(&self) -> usize {
        let soft = self.governor.soft_capacity().await;
        self.config
            .max_concurrency
            .map_or(soft, |cap| cap.min(soft))
            .max(1)
    }

    async fn run(&self, jobs: Vec<(String, String)>) -> Vec<SpawnJob> {
        if jobs.is_empty() {
            return Vec::new();
        }
        let limit = self.concurrency_limit().await;
        tracing::debug!(jobs = jobs.len(), limit, "spawning jobs");
        let semaphore = Arc::new(Semaphore::new(limit));

        let mut slots: Vec<Option<SpawnJob>> = Vec::with_capacity(jobs.len());
        let mut queries = Vec::with_capacity(jobs.len());
        let mut set = JoinSet::new();
        for (idx, (query, prompt)) in jobs.into_iter().enumerate() {
            slots.push(None);
            queries.push(query.clone());
            let semaphore = semaphore.clone();
            let channel = self.channel.clone();
            let governor = self.governor.clone();
            let config = self.config.clone();
            set.spawn(async move {
                let job = run_job(query, prompt, semaphore, channel, governor, config).await;
                (idx, job)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, job)) => slots[idx] = Some(job),
                Err(err) => tracing::error!(error = %err, "spawn job task failed"),
            }
        }

        slots
            .into_iter()
            .zip(queries)
            .map(|(slot, query)| {
                slot.unwrap_or_else(|| SpawnJob {
                    query,
                    credential: None,
                    result: Err(SpawnError::Internal("job task did not finish".to_string())),
                })
            })
            .collect()
    }
}

async fn run_job(
    query: String,
    prompt: String,
    semaphore: Arc<Semaphore>,
    channel: Arc<dyn ModelChannel>,
    governor: Arc<Governor>,
    config: SpawnConfig,
) -> SpawnJob {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(err) => {
            return SpawnJob {
                query,
                credential: None,
                result: Err(SpawnError::Internal(err.to_string())),
            };
        }
    };

    let credential = match governor
        .acquire(None, Some(Instant::now() + config.acquire_timeout))
        .await
    {
        Ok(credential) => credential,
        Err(err) => {
            return SpawnJob {
                query,
                credential: None,
                result: Err(SpawnError::Exhausted(err)),
            };
        }
    };

    let invocation = channel.invoke(&prompt, &credential, config.job_timeout);
    let result = match tokio::time::timeout(config.job_timeout, invocation).await {
        Ok(Ok(reply)) => {
            governor.report(&credential, Outcome::Success).await;
            Ok(reply)
        }
        Ok(Err(ChannelError::Timeout(_))) | Err(_) => {
            governor.report(&credential, Outcome::Failure).await;
            Err(SpawnError::Timeout(config.job_timeout))
        }
        Ok(Err(source)) => {
            governor.report(&credential, source.outcome()).await;
            Err(SpawnError::Channel {
                credential: credential.clone(),
                source,
            })
        }
    };
    if let Err(err) = &result {
        tracing::warn!(%credential, error = %err, "spawn job failed");
    }

    SpawnJob {
        query,
        credential: Some(credential),
        result,
    }
}

/// Prefix `prompt` with shared background.
#[must_use]
pub fn format_prompt(shared_context: Option<&str>, prompt: &str) -> String {
    match shared_context.map(str::trim).filter(|context| !context.is_empty()) {
        Some(context) => format!("Shared context:\n{context}\n\nTask:\n{prompt}"),
        None => prompt.to_string(),
    }
}
