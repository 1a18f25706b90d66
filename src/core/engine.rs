//! Conversation engine.
//!
//! Runs one turn at a time: invoke the model, decode tool calls, pass each
//! through the security gate and the confirmation policy, dispatch, feed the
//! encoded results back and repeat until the model answers in plain text or
//! the iteration bound is reached. The engine never touches persisted history;
//! callers pass the committed turns in and commit the returned [`Turn`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalMode, ApprovalRequest, Confirmer, ReviewDecision};
use crate::audit::{AuditLog, sanitize_args};
use crate::error_taxonomy::ErrorEnvelope;
use crate::llm_client::{ChannelError, ModelChannel};
use crate::prompts;
use crate::security::{SecurityDecision, SecurityGate};
use crate::tools::ToolRegistry;
use crate::tools::spec::{ToolResult, ToolStatus};
use crate::utils::one_line;

use super::events::{Event, TurnOutcomeStatus};
use super::governor::{Credential, Governor, GovernorError, Outcome};
use super::tool_parser::{self, DecodeError, ToolArgs, ToolCall};
use super::turn::{Exchange, InvalidTransition, Transition, Turn, TurnState, TurnStatus};

// === Types ===

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum model replies per turn.
    pub max_iterations: u32,
    /// Number of committed turns included in each prompt.
    pub history_window: usize,
    /// Per-invocation model timeout.
    pub model_timeout: Duration,
    /// Per-call tool timeout.
    pub tool_timeout: Duration,
    /// How long to wait for a credential before giving up.
    pub acquire_timeout: Duration,
    /// Optional bound on the whole turn.
    pub turn_timeout: Option<Duration>,
    pub approval_mode: ApprovalMode,
    /// Start every turn from the rotation instead of the last credential used.
    pub rotate_per_turn: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            history_window: 6,
            model_timeout: Duration::from_secs(180),
            tool_timeout: Duration::from_secs(120),
            acquire_timeout: Duration::from_secs(120),
            turn_timeout: None,
            approval_mode: ApprovalMode::default(),
            rotate_per_turn: true,
        }
    }
}

/// Why a turn ended without a committed record.
///
/// Every variant carries the exchanges completed so far, for display only.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("model channel failed on {credential}: {source}")]
    Channel {
        credential: Credential,
        source: ChannelError,
        partial: Vec<Exchange>,
    },
    #[error("no model credential available: {source}")]
    Exhausted {
        source: GovernorError,
        partial: Vec<Exchange>,
    },
    #[error("turn cancelled")]
    Cancelled { partial: Vec<Exchange> },
    #[error("turn exceeded its deadline")]
    DeadlineExceeded { partial: Vec<Exchange> },
    #[error("engine state error: {source}")]
    State {
        source: InvalidTransition,
        partial: Vec<Exchange>,
    },
}

impl TurnError {
    #[must_use]
    pub fn partial(&self) -> &[Exchange] {
        match self {
            Self::Channel { partial, .. }
            | Self::Exhausted { partial, .. }
            | Self::Cancelled { partial }
            | Self::DeadlineExceeded { partial }
            | Self::State { partial, .. } => partial,
        }
    }

    fn outcome_status(&self) -> TurnOutcomeStatus {
        match self {
            Self::Cancelled { .. } | Self::DeadlineExceeded { .. } => TurnOutcomeStatus::Interrupted,
            _ => TurnOutcomeStatus::Failed,
        }
    }
}

/// Suspension point interrupted by the token or the turn deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Deadline,
}

impl Interrupt {
    fn message(self) -> &'static str {
        match self {
            Self::Cancelled => "Interrupted: the turn was cancelled before the call finished",
            Self::Deadline => "Interrupted: the turn deadline passed before the call finished",
        }
    }
}

/// Internal stop reason; becomes a [`TurnError`] once the partial exchanges are attached.
#[derive(Debug)]
enum Stop {
    Interrupted(Interrupt),
    Channel {
        credential: Credential,
        source: ChannelError,
    },
    Exhausted(GovernorError),
    State(InvalidTransition),
}

impl From<Interrupt> for Stop {
    fn from(interrupt: Interrupt) -> Self {
        Stop::Interrupted(interrupt)
    }
}

impl Stop {
    fn into_turn_error(self, partial: Vec<Exchange>) -> TurnError {
        match self {
            Stop::Interrupted(Interrupt::Cancelled) => TurnError::Cancelled { partial },
            Stop::Interrupted(Interrupt::Deadline) => TurnError::DeadlineExceeded { partial },
            Stop::Channel { credential, source } => TurnError::Channel {
                credential,
                source,
                partial,
            },
            Stop::Exhausted(source) => TurnError::Exhausted { source, partial },
            Stop::State(source) => TurnError::State { source, partial },
        }
    }
}

/// Per-turn scratch state.
struct TurnRun<'a> {
    index: u64,
    user: &'a str,
    history: &'a [Turn],
    state: TurnState,
    iteration: u32,
    transcript: Vec<String>,
    exchanges: Vec<Exchange>,
    deadline: Option<Instant>,
}

// === Engine ===

pub struct Engine {
    config: EngineConfig,
    channel: Arc<dyn ModelChannel>,
    governor: Arc<Governor>,
    registry: Arc<ToolRegistry>,
    gate: SecurityGate,
    confirmer: Arc<dyn Confirmer>,
    system_prompt: String,
    events: Option<mpsc::UnboundedSender<Event>>,
    audit: Option<AuditLog>,
    session_approvals: HashSet<String>,
    last_credential: Option<Credential>,
}

impl Engine {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        channel: Arc<dyn ModelChannel>,
        governor: Arc<Governor>,
        registry: Arc<ToolRegistry>,
        gate: SecurityGate,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        let system_prompt = prompts::system_prompt(&registry, gate.root());
        Self {
            config,
            channel,
            governor,
            registry,
            gate,
            confirmer,
            system_prompt,
            events: None,
            audit: None,
            session_approvals: HashSet::new(),
            last_credential: None,
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    #[must_use]
    pub fn approval_mode(&self) -> ApprovalMode {
        self.config.approval_mode
    }

    /// Forget tools approved "for this session".
    pub fn clear_session_approvals(&mut self) {
        self.session_approvals.clear();
    }

    /// Run one turn for `user`, with `history` as the committed conversation.
    pub async fn run_turn(
        &mut self,
        index: u64,
        user: &str,
        history: &[Turn],
        cancel: &CancellationToken,
    ) -> Result<Turn, TurnError> {
        self.emit(Event::TurnStarted { index });
        let mut run = TurnRun {
            index,
            user,
            history,
            state: TurnState::Idle,
            iteration: 0,
            transcript: Vec::new(),
            exchanges: Vec::new(),
            deadline: self.config.turn_timeout.map(|timeout| Instant::now() + timeout),
        };

        let result = match self.drive(&mut run, cancel).await {
            Ok(turn) => Ok(turn),
            Err(stop) => Err(stop.into_turn_error(std::mem::take(&mut run.exchanges))),
        };

        match &result {
            Ok(turn) => {
                tracing::info!(
                    turn = turn.index,
                    status = %turn.status,
                    tools = turn.exchanges.len(),
                    "turn finished"
                );
                self.emit(Event::TurnComplete {
                    status: turn.status.into(),
                    error: None,
                });
            }
            Err(err) => {
                tracing::warn!(turn = index, error = %err, "turn ended early");
                let envelope = ErrorEnvelope::from(err);
                self.audit_event(
                    "turn_failed",
                    json!({"turn": index, "error": envelope.to_audit(), "completed_calls": err.partial().len()}),
                );
                self.emit(Event::TurnComplete {
                    status: err.outcome_status(),
                    error: Some(err.to_string()),
                });
            }
        }
        result
    }

    async fn drive(&mut self, run: &mut TurnRun<'_>, cancel: &CancellationToken) -> Result<Turn, Stop> {
        self.advance(run, Transition::Submit)?;

        let preferred = if self.config.rotate_per_turn {
            None
        } else {
            self.last_credential.clone()
        };
        let acquire = self
            .governor
            .acquire(preferred.as_ref(), Some(self.acquire_deadline()));
        let mut credential = guarded(acquire, cancel, run.deadline)
            .await?
            .map_err(Stop::Exhausted)?;

        loop {
            // === AwaitingModel ===
            if run.iteration > 0 {
                credential = self.renew(credential, cancel, run.deadline).await?;
            }
            run.iteration += 1;
            let prompt = prompts::build_turn_prompt(
                &self.system_prompt,
                run.history,
                self.config.history_window,
                run.user,
                &run.transcript,
            );
            let reply = self
                .invoke_model(&prompt, &mut credential, run.iteration, cancel, run.deadline)
                .await?;
            self.last_credential = Some(credential.clone());
            self.advance(run, Transition::ModelReplied)?;

            // === HasToolCalls ===
            let decoded: Vec<Result<ToolCall, DecodeError>> = tool_parser::decode_calls(&reply).collect();
            if decoded.is_empty() {
                self.advance(run, Transition::NoCalls)?;
                return Ok(self.finish(run, reply.trim().to_string(), credential, TurnStatus::Completed));
            }
            self.advance(run, Transition::CallsFound)?;
            if run.state == TurnState::Done(TurnStatus::Truncated) {
                self.emit(Event::error(
                    format!(
                        "Stopped after {} model rounds without a final answer",
                        self.config.max_iterations
                    ),
                    true,
                ));
                let response = truncated_response(&reply, self.config.max_iterations);
                return Ok(self.finish(run, response, credential, TurnStatus::Truncated));
            }

            // === Executing ===
            run.transcript.push(reply.trim().to_string());
            for decoded in decoded {
                match self.execute_call(run.index, decoded, &credential, cancel, run.deadline).await {
                    Ok(exchange) => {
                        run.transcript.push(tool_parser::encode_result(&exchange.result));
                        run.exchanges.push(exchange);
                    }
                    Err((exchange, interrupt)) => {
                        run.exchanges.push(exchange);
                        return Err(interrupt.into());
                    }
                }
            }
            self.advance(run, Transition::ResultsAppended)?;
        }
    }

    fn finish(&self, run: &mut TurnRun<'_>, response: String, credential: Credential, status: TurnStatus) -> Turn {
        Turn {
            index: run.index,
            user: run.user.to_string(),
            exchanges: std::mem::take(&mut run.exchanges),
            response,
            credential,
            timestamp: Utc::now(),
            status,
        }
    }

    fn advance(&self, run: &mut TurnRun<'_>, transition: Transition) -> Result<(), Stop> {
        run.state = run
            .state
            .advance(transition, run.iteration, self.config.max_iterations)
            .map_err(Stop::State)?;
        tracing::debug!(state = %run.state, iteration = run.iteration, "turn state");
        self.emit(Event::StateChanged {
            state: run.state,
            iteration: run.iteration,
        });
        Ok(())
    }

    fn acquire_deadline(&self) -> Instant {
        Instant::now() + self.config.acquire_timeout
    }

    // === Model ===

    async fn renew(
        &self,
        credential: Credential,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Credential, Stop> {
        let renewed = guarded(
            self.governor.renew(&credential, Some(self.acquire_deadline())),
            cancel,
            deadline,
        )
        .await?;
        match renewed {
            Ok(credential) => Ok(credential),
            Err(GovernorError::CircuitOpen(_)) => {
                self.emit(Event::status(format!("{credential} is cooling down, switching")));
                guarded(
                    self.governor
                        .acquire_alternate(&credential, Some(self.acquire_deadline())),
                    cancel,
                    deadline,
                )
                .await?
                .map_err(Stop::Exhausted)
            }
            Err(err) => Err(Stop::Exhausted(err)),
        }
    }

    /// Invoke the model, retrying once on an alternate credential.
    async fn invoke_model(
        &self,
        prompt: &str,
        credential: &mut Credential,
        iteration: u32,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<String, Stop> {
        self.emit(Event::ModelRequest {
            credential: credential.clone(),
            iteration,
        });
        let first = self.call_channel(prompt, credential, cancel, deadline).await?;
        let err = match first {
            Ok(reply) => {
                self.governor.report(credential, Outcome::Success).await;
                return Ok(reply);
            }
            Err(err) => err,
        };

        self.governor.report(credential, err.outcome()).await;
        tracing::warn!(%credential, error = %err, "model invocation failed, retrying on another credential");
        self.audit_event(
            "channel_error",
            json!({"credential": credential.id(), "code": err.code(), "error": err.to_string()}),
        );
        self.emit(Event::status(format!("{credential} failed ({err}); retrying")));

        let alternate = guarded(
            self.governor
                .acquire_alternate(credential, Some(self.acquire_deadline())),
            cancel,
            deadline,
        )
        .await?
        .map_err(Stop::Exhausted)?;
        *credential = alternate;
        self.emit(Event::ModelRequest {
            credential: credential.clone(),
            iteration,
        });

        let second = self.call_channel(prompt, credential, cancel, deadline).await?;
        match second {
            Ok(reply) => {
                self.governor.report(credential, Outcome::Success).await;
                Ok(reply)
            }
            Err(source) => {
                self.governor.report(credential, source.outcome()).await;
                self.audit_event(
                    "channel_error",
                    json!({"credential": credential.id(), "code": source.code(), "error": source.to_string()}),
                );
                Err(Stop::Channel {
                    credential: credential.clone(),
                    source,
                })
            }
        }
    }

    /// One invocation bounded by `model_timeout`, even if the channel ignores it.
    /// An interrupted call is reported as abandoned so a half-open trial is freed.
    async fn call_channel(
        &self,
        prompt: &str,
        credential: &Credential,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Result<String, ChannelError>, Stop> {
        let timeout = self.config.model_timeout;
        let invocation = async {
            tokio::time::timeout(timeout, self.channel.invoke(prompt, credential, timeout))
                .await
                .unwrap_or(Err(ChannelError::Timeout(timeout)))
        };
        match guarded(invocation, cancel, deadline).await {
            Ok(result) => Ok(result),
            Err(interrupt) => {
                self.governor.report(credential, Outcome::Abandoned).await;
                Err(interrupt.into())
            }
        }
    }

    // === Tools ===

    /// Authorize and run one decoded call. An interrupted call still gets a result.
    async fn execute_call(
        &mut self,
        turn: u64,
        decoded: Result<ToolCall, DecodeError>,
        credential: &Credential,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Exchange, (Exchange, Interrupt)> {
        let mut call = match decoded {
            Ok(call) => call,
            Err(err) => {
                let call = err.placeholder_call();
                tracing::debug!(reason = %err.reason, raw = %err.raw, "undecodable tool call");
                let result = ToolResult::error(
                    &call.name,
                    ToolArgs::new(),
                    format!("{err}. Expected: TOOL_CALL: <tool> | key=value | ..."),
                );
                return Ok(self.complete(turn, call, result, credential));
            }
        };

        let descriptor = self.registry.descriptor(&call.name);
        if let Some(descriptor) = &descriptor {
            descriptor.canonicalize(&mut call.args);
        }

        self.emit(Event::ToolCallStarted {
            name: call.name.clone(),
            summary: one_line(&tool_parser::encode_call(&call), 160),
        });

        if let Some(descriptor) = descriptor {
            match self.gate.evaluate(&call, &descriptor) {
                SecurityDecision::Allow => {}
                SecurityDecision::Deny(reason) => {
                    tracing::info!(tool = %call.name, %reason, "call denied by policy");
                    self.audit_event(
                        "security_denied",
                        json!({"turn": turn, "tool": call.name, "args": sanitize_args(&call.args), "reason": reason}),
                    );
                    let result = ToolResult::blocked(
                        &call.name,
                        call.args.clone(),
                        format!("Blocked by security policy: {reason}"),
                    );
                    return Ok(self.complete(turn, call, result, credential));
                }
                SecurityDecision::RequireConfirmation(reason) => {
                    let decision = match guarded(self.confirm(&call.name, &reason), cancel, deadline).await {
                        Ok(decision) => decision,
                        Err(interrupt) => {
                            let result = ToolResult::error(&call.name, call.args.clone(), interrupt.message());
                            return Err((self.complete(turn, call, result, credential), interrupt));
                        }
                    };
                    match decision {
                        ReviewDecision::Approved => {}
                        ReviewDecision::ApprovedForSession => {
                            self.session_approvals.insert(call.name.clone());
                        }
                        ReviewDecision::Denied | ReviewDecision::Abort => {
                            self.audit_event(
                                "confirmation_rejected",
                                json!({
                                    "turn": turn,
                                    "tool": call.name,
                                    "args": sanitize_args(&call.args),
                                    "reason": reason,
                                    "policy": self.config.approval_mode.label(),
                                }),
                            );
                            let output = if self.config.approval_mode == ApprovalMode::Never {
                                format!("Declined: approval policy is `never` ({reason}). Do not retry this call.")
                            } else {
                                format!("Declined by the user ({reason}). Try a different approach or ask the user.")
                            };
                            let result = ToolResult::blocked(&call.name, call.args.clone(), output);
                            let exchange = self.complete(turn, call, result, credential);
                            if decision == ReviewDecision::Abort {
                                return Err((exchange, Interrupt::Cancelled));
                            }
                            return Ok(exchange);
                        }
                    }
                }
            }
        }

        let tool_deadline = match deadline {
            Some(turn_deadline) => turn_deadline.min(Instant::now() + self.config.tool_timeout),
            None => Instant::now() + self.config.tool_timeout,
        };
        match guarded(self.registry.dispatch(&call, Some(tool_deadline)), cancel, deadline).await {
            Ok(result) => Ok(self.complete(turn, call, result, credential)),
            Err(interrupt) => {
                let result = ToolResult::error(&call.name, call.args.clone(), interrupt.message());
                Err((self.complete(turn, call, result, credential), interrupt))
            }
        }
    }

    /// Apply the approval policy to a call the gate wants confirmed.
    async fn confirm(&self, tool: &str, reason: &str) -> ReviewDecision {
        match self.config.approval_mode {
            ApprovalMode::Auto => ReviewDecision::Approved,
            ApprovalMode::Never => ReviewDecision::Denied,
            ApprovalMode::Suggest if self.session_approvals.contains(tool) => ReviewDecision::Approved,
            ApprovalMode::Suggest => {
                let request = ApprovalRequest {
                    tool_name: tool.to_string(),
                    reason: reason.to_string(),
                };
                self.confirmer.confirm(&request).await
            }
        }
    }

    fn complete(&self, turn: u64, call: ToolCall, result: ToolResult, credential: &Credential) -> Exchange {
        self.audit_event(
            "tool_call",
            json!({
                "turn": turn,
                "tool": call.name,
                "args": sanitize_args(&call.args),
                "status": result.status.as_str(),
                "credential": credential.id(),
                "output": one_line(&result.output, 200),
            }),
        );
        if result.status == ToolStatus::Error {
            tracing::debug!(tool = %call.name, output = %one_line(&result.output, 200), "tool call failed");
        }
        self.emit(Event::ToolCallComplete {
            name: call.name.clone(),
            status: result.status,
            preview: one_line(&result.output, 160),
        });
        Exchange { call, result }
    }

    // === Plumbing ===

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            // The console may have gone away; the turn carries on regardless.
            let _ = events.send(event);
        }
    }

    fn audit_event(&self, event: &str, details: serde_json::Value) {
        if let Some(audit) = &self.audit {
            audit.log_event(event, details);
        }
    }
}

/// Await `future` unless the token fires or the deadline passes first.
async fn guarded<F: Future>(
    future: F,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Interrupt::Cancelled),
        () = sleep_until_deadline(deadline) => Err(Interrupt::Deadline),
        output = future => Ok(output),
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn truncated_response(reply: &str, max_iterations: u32) -> String {
    let notice = format!(
        "[Stopped after {max_iterations} model rounds: the tool-call limit was reached before a final answer. Ask to continue if more work is needed.]"
    );
    let text = tool_parser::strip_tool_calls(reply);
    if text.is_empty() {
        notice
    } else {
        format!("{text}\n\n{notice}")
    }
}

#[cfg(test)]
mod tests;
