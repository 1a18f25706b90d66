//! Account/rate governor.
//!
//! Chooses which credential serves the next model call. Each credential has a
//! fixed-window request counter with a soft threshold (preferred ceiling) and a
//! hard limit, plus a circuit breaker fed by [`Governor::report`]. All state
//! sits behind one mutex; callers that find nothing usable park on a
//! [`Notify`] until a window resets, a cool-down expires or a report arrives.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

// === Types ===

/// Identifier of one model channel, e.g. account `1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "account {}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GovernorConfig {
    pub window: Duration,
    pub window_limit: u32,
    /// Fraction of `window_limit` preferred before spilling onto other credentials.
    pub soft_ratio: f64,
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            window_limit: 60,
            soft_ratio: 0.9,
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl GovernorConfig {
    /// `floor(window_limit * soft_ratio)`, at least 1.
    #[must_use]
    pub fn soft_limit(&self) -> u32 {
        let soft = (f64::from(self.window_limit) * self.soft_ratio.clamp(0.0, 1.0)).floor() as u32;
        soft.clamp(1, self.window_limit.max(1))
    }
}

/// Result of one model invocation, reported back by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// The channel reported quota exhaustion; the rest of its window is spent.
    RateLimited,
    /// The caller gave up before the channel answered (cancel, deadline).
    /// Releases a half-open trial without counting as a failure.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Read-only snapshot of one credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialStatus {
    pub credential: Credential,
    pub circuit: CircuitState,
    pub window_count: u32,
    pub window_limit: u32,
    pub soft_limit: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    #[serde(skip)]
    pub window_resets_in: Duration,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GovernorError {
    #[error("all channels exhausted")]
    Exhausted,
    #[error("unknown credential: {0}")]
    UnknownCredential(String),
    #[error("{0} is unavailable (circuit open)")]
    CircuitOpen(Credential),
    #[error("no credentials configured")]
    NoCredentials,
}

// === State ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Circuit {
    Closed,
    Open { until: Instant },
    /// One trial in flight. A trial that never reports frees the slot for a
    /// new trial once `lease_until` passes.
    HalfOpen { lease_until: Instant },
}

#[derive(Debug)]
struct Slot {
    credential: Credential,
    window_start: Instant,
    count: u32,
    circuit: Circuit,
    failures: VecDeque<Instant>,
    total_requests: u64,
    total_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Availability {
    Closed,
    /// Open, cool-down elapsed; next use is the half-open trial.
    TrialReady,
    Unavailable,
}

impl Slot {
    fn new(credential: Credential, now: Instant) -> Self {
        Self {
            credential,
            window_start: now,
            count: 0,
            circuit: Circuit::Closed,
            failures: VecDeque::new(),
            total_requests: 0,
            total_failures: 0,
        }
    }

    fn roll_window(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.window_start = now;
            self.count = 0;
        }
    }

    fn availability(&self, now: Instant) -> Availability {
        match self.circuit {
            Circuit::Closed => Availability::Closed,
            Circuit::Open { until } if now >= until => Availability::TrialReady,
            Circuit::HalfOpen { lease_until } if now >= lease_until => Availability::TrialReady,
            Circuit::Open { .. } | Circuit::HalfOpen { .. } => Availability::Unavailable,
        }
    }

    fn take(&mut self, now: Instant, trial_lease: Duration) -> Credential {
        if self.availability(now) == Availability::TrialReady {
            tracing::info!(credential = %self.credential, "circuit half-open, sending trial call");
            self.circuit = Circuit::HalfOpen {
                lease_until: now + trial_lease,
            };
        }
        self.count += 1;
        self.total_requests += 1;
        self.credential.clone()
    }

    fn window_reset_at(&self, window: Duration) -> Instant {
        self.window_start + window
    }
}

struct GovernorState {
    slots: Vec<Slot>,
    cursor: usize,
}

enum Pick {
    Ready(Credential),
    /// Nothing usable; the earliest instant at which that may change.
    Wait(Option<Instant>),
}

#[derive(Clone, Copy)]
enum Request<'a> {
    Acquire {
        preferred: Option<&'a Credential>,
        exclude: Option<&'a Credential>,
    },
    Renew(&'a Credential),
}

impl GovernorState {
    fn roll(&mut self, now: Instant, config: &GovernorConfig) {
        for slot in &mut self.slots {
            slot.roll_window(now, config.window);
        }
    }

    fn position(&self, credential: &Credential) -> Result<usize, GovernorError> {
        self.slots
            .iter()
            .position(|slot| &slot.credential == credential)
            .ok_or_else(|| GovernorError::UnknownCredential(credential.id().to_string()))
    }

    fn pick(
        &mut self,
        request: Request<'_>,
        now: Instant,
        config: &GovernorConfig,
    ) -> Result<Pick, GovernorError> {
        if self.slots.is_empty() {
            return Err(GovernorError::NoCredentials);
        }
        self.roll(now, config);
        match request {
            Request::Renew(credential) => self.pick_renew(credential, now, config),
            Request::Acquire { preferred, exclude } => {
                Ok(self.pick_acquire(preferred, exclude, now, config))
            }
        }
    }

    fn pick_renew(
        &mut self,
        credential: &Credential,
        now: Instant,
        config: &GovernorConfig,
    ) -> Result<Pick, GovernorError> {
        let idx = self.position(credential)?;
        let slot = &mut self.slots[idx];
        if matches!(slot.circuit, Circuit::Open { .. }) {
            return Err(GovernorError::CircuitOpen(credential.clone()));
        }
        if slot.count < config.window_limit {
            return Ok(Pick::Ready(slot.take(now, config.cooldown)));
        }
        Ok(Pick::Wait(Some(slot.window_reset_at(config.window))))
    }

    fn pick_acquire(
        &mut self,
        preferred: Option<&Credential>,
        exclude: Option<&Credential>,
        now: Instant,
        config: &GovernorConfig,
    ) -> Pick {
        let soft = config.soft_limit();
        let hard = config.window_limit;
        // With a single credential there is nothing to fail over to.
        let exclude = exclude.filter(|_| self.slots.len() > 1);
        let usable = |slot: &Slot| exclude != Some(&slot.credential);

        if let Some(preferred) = preferred
            && let Some(slot) = self.slots.iter_mut().find(|slot| &slot.credential == preferred)
            && usable(slot)
            && slot.availability(now) == Availability::Closed
            && slot.count < soft
        {
            return Pick::Ready(slot.take(now, config.cooldown));
        }

        let len = self.slots.len();
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            let slot = &self.slots[idx];
            if usable(slot) && slot.availability(now) != Availability::Unavailable && slot.count < soft {
                self.cursor = (idx + 1) % len;
                return Pick::Ready(self.slots[idx].take(now, config.cooldown));
            }
        }

        let least_loaded = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                usable(slot) && slot.availability(now) != Availability::Unavailable && slot.count < hard
            })
            .min_by_key(|(_, slot)| slot.count)
            .map(|(idx, _)| idx);
        if let Some(idx) = least_loaded {
            return Pick::Ready(self.slots[idx].take(now, config.cooldown));
        }

        let next_event = self
            .slots
            .iter()
            .filter(|slot| usable(slot))
            .filter_map(|slot| match slot.circuit {
                Circuit::Open { until } if until > now => Some(until),
                Circuit::HalfOpen { lease_until } if lease_until > now => Some(lease_until),
                _ => Some(slot.window_reset_at(config.window)),
            })
            .min();
        Pick::Wait(next_event)
    }
}

// === Governor ===

pub struct Governor {
    config: GovernorConfig,
    state: Mutex<GovernorState>,
    notify: Notify,
}

impl Governor {
    #[must_use]
    pub fn new(credentials: Vec<Credential>, config: GovernorConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            state: Mutex::new(GovernorState {
                slots: credentials
                    .into_iter()
                    .map(|credential| Slot::new(credential, now))
                    .collect(),
                cursor: 0,
            }),
            notify: Notify::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Credentials in rotation order.
    pub async fn credentials(&self) -> Vec<Credential> {
        let state = self.state.lock().await;
        state.slots.iter().map(|slot| slot.credential.clone()).collect()
    }

    /// Requests that fit under the soft thresholds of all credentials in one window.
    pub async fn soft_capacity(&self) -> usize {
        let state = self.state.lock().await;
        state.slots.len() * self.config.soft_limit() as usize
    }

    /// Pick a credential for a new turn or job.
    pub async fn acquire(
        &self,
        preferred: Option<&Credential>,
        deadline: Option<Instant>,
    ) -> Result<Credential, GovernorError> {
        self.wait_for(
            Request::Acquire {
                preferred,
                exclude: None,
            },
            deadline,
        )
        .await
    }

    /// Pick any credential except `exclude`, for the retry after a channel failure.
    pub async fn acquire_alternate(
        &self,
        exclude: &Credential,
        deadline: Option<Instant>,
    ) -> Result<Credential, GovernorError> {
        self.wait_for(
            Request::Acquire {
                preferred: None,
                exclude: Some(exclude),
            },
            deadline,
        )
        .await
    }

    /// Count one more request on the credential a turn already holds.
    pub async fn renew(
        &self,
        credential: &Credential,
        deadline: Option<Instant>,
    ) -> Result<Credential, GovernorError> {
        self.wait_for(Request::Renew(credential), deadline).await
    }

    /// Feed the outcome of an invocation back into the circuit breaker.
    pub async fn report(&self, credential: &Credential, outcome: Outcome) {
        {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let Ok(idx) = state.position(credential) else {
                tracing::warn!(%credential, "outcome reported for unknown credential");
                return;
            };
            let config = &self.config;
            let slot = &mut state.slots[idx];

            match outcome {
                Outcome::Abandoned => {
                    if matches!(slot.circuit, Circuit::HalfOpen { .. }) {
                        tracing::debug!(%credential, "trial abandoned, next caller tries again");
                        slot.circuit = Circuit::HalfOpen { lease_until: now };
                    }
                }
                Outcome::Success => {
                    if matches!(slot.circuit, Circuit::HalfOpen { .. }) {
                        tracing::info!(%credential, "trial succeeded, circuit closed");
                        slot.circuit = Circuit::Closed;
                        slot.failures.clear();
                    }
                }
                Outcome::Failure | Outcome::RateLimited => {
                    slot.total_failures += 1;
                    if outcome == Outcome::RateLimited {
                        slot.count = slot.count.max(config.window_limit);
                    }
                    slot.failures.push_back(now);
                    while slot
                        .failures
                        .front()
                        .is_some_and(|at| now.duration_since(*at) > config.failure_window)
                    {
                        slot.failures.pop_front();
                    }

                    let trip = match slot.circuit {
                        Circuit::HalfOpen { .. } => true,
                        Circuit::Closed => slot.failures.len() >= config.failure_threshold.max(1) as usize,
                        Circuit::Open { .. } => false,
                    };
                    if trip {
                        tracing::warn!(
                            %credential,
                            cooldown_secs = config.cooldown.as_secs(),
                            "circuit opened after repeated failures"
                        );
                        slot.circuit = Circuit::Open {
                            until: now + config.cooldown,
                        };
                        slot.failures.clear();
                    }
                }
            }
        }
        self.notify.notify_waiters();
    }

    pub async fn status(&self) -> Vec<CredentialStatus> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.roll(now, &self.config);
        state
            .slots
            .iter()
            .map(|slot| CredentialStatus {
                credential: slot.credential.clone(),
                circuit: match slot.circuit {
                    Circuit::Closed => CircuitState::Closed,
                    Circuit::Open { .. } => CircuitState::Open,
                    Circuit::HalfOpen { .. } => CircuitState::HalfOpen,
                },
                window_count: slot.count,
                window_limit: self.config.window_limit,
                soft_limit: self.config.soft_limit(),
                total_requests: slot.total_requests,
                total_failures: slot.total_failures,
                window_resets_in: slot
                    .window_reset_at(self.config.window)
                    .saturating_duration_since(now),
            })
            .collect()
    }

    async fn wait_for(
        &self,
        request: Request<'_>,
        deadline: Option<Instant>,
    ) -> Result<Credential, GovernorError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_event = {
                let mut state = self.state.lock().await;
                match state.pick(request, Instant::now(), &self.config)? {
                    Pick::Ready(credential) => {
                        tracing::debug!(%credential, "credential acquired");
                        return Ok(credential);
                    }
                    Pick::Wait(next_event) => next_event,
                }
            };

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(GovernorError::Exhausted);
            }
            let wake_at = match (next_event, deadline) {
                (Some(next), Some(deadline)) => Some(next.min(deadline)),
                (next, deadline) => next.or(deadline),
            };
            tracing::debug!(?wake_at, "no credential usable, waiting");
            match wake_at {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}
