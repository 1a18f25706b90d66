use super::*;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::approval::FixedConfirmer;
use crate::core::governor::GovernorConfig;
use crate::eval::{ScriptStep, ScriptedChannel, seed_workspace};
use crate::security::RuleSet;
use crate::tools::{ToolContext, ToolRegistryBuilder};

struct Harness {
    dir: TempDir,
    channel: Arc<ScriptedChannel>,
    engine: Engine,
}

fn harness(channel: ScriptedChannel, config: EngineConfig, confirmer: Arc<dyn Confirmer>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    seed_workspace(dir.path()).unwrap();
    let channel = Arc::new(channel);
    let governor = Arc::new(Governor::new(
        vec![Credential::new("1"), Credential::new("2")],
        GovernorConfig::default(),
    ));
    let registry = Arc::new(
        ToolRegistryBuilder::new(ToolContext::new(dir.path()))
            .with_file_tools()
            .with_shell_tools()
            .build(),
    );
    let gate = SecurityGate::new(dir.path(), RuleSet::default());
    let engine = Engine::new(config, channel.clone(), governor, registry, gate, confirmer)
        .with_system_prompt("SYSTEM")
        .with_audit(AuditLog::in_state_dir(&dir.path().join(".state")));
    Harness { dir, channel, engine }
}

fn approving(channel: ScriptedChannel) -> Harness {
    harness(
        channel,
        EngineConfig::default(),
        Arc::new(FixedConfirmer(ReviewDecision::Approved)),
    )
}

/// Counts how often it is asked.
struct CountingConfirmer {
    answer: ReviewDecision,
    asked: AtomicUsize,
}

#[async_trait]
impl Confirmer for CountingConfirmer {
    async fn confirm(&self, _request: &ApprovalRequest) -> ReviewDecision {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.answer
    }
}

#[tokio::test]
async fn plain_answer_completes_in_one_round() {
    let mut h = approving(ScriptedChannel::replies(["  Hello there.  "]));
    let turn = h
        .engine
        .run_turn(0, "hi", &[], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(turn.status, TurnStatus::Completed);
    assert_eq!(turn.response, "Hello there.");
    assert!(turn.exchanges.is_empty());
    assert_eq!(h.channel.invocation_count(), 1);
}

#[tokio::test]
async fn list_files_round_trip() {
    let mut h = approving(ScriptedChannel::replies([
        "Let me look.\nTOOL_CALL: list_directory | path=src",
        "src/ holds lib.rs and main.rs.",
    ]));
    let turn = h
        .engine
        .run_turn(0, "List files in src/", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(turn.status, TurnStatus::Completed);
    assert_eq!(turn.exchanges.len(), 1);
    let exchange = &turn.exchanges[0];
    assert_eq!(exchange.call.name, "list_directory");
    assert_eq!(exchange.result.status, ToolStatus::Success);
    assert_eq!(exchange.result.output, "lib.rs\nmain.rs");
    assert_eq!(turn.response, "src/ holds lib.rs and main.rs.");

    let prompts = h.channel.invocations();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].prompt.contains("TOOL_RESULT:"));
    assert!(prompts[1].prompt.contains("TOOL_RESULT: list_directory | path=src | status=success"));
    assert!(prompts[1].prompt.contains("Let me look."));
}

#[tokio::test]
async fn destructive_command_is_blocked_without_asking() {
    let confirmer = Arc::new(CountingConfirmer {
        answer: ReviewDecision::Approved,
        asked: AtomicUsize::new(0),
    });
    let mut h = harness(
        ScriptedChannel::replies(["TOOL_CALL: run_command | command=rm -rf /", "Understood."]),
        EngineConfig::default(),
        confirmer.clone(),
    );
    let turn = h
        .engine
        .run_turn(0, "wipe it", &[], &CancellationToken::new())
        .await
        .unwrap();

    let result = &turn.exchanges[0].result;
    assert_eq!(result.status, ToolStatus::Blocked);
    assert!(result.output.starts_with("Blocked by security policy: command blocked by pattern"));
    assert_eq!(confirmer.asked.load(Ordering::SeqCst), 0);
    assert!(h.channel.invocations()[1].prompt.contains("status=blocked"));
}

#[tokio::test]
async fn runaway_loop_is_truncated_at_the_bound() {
    let config = EngineConfig {
        max_iterations: 3,
        ..EngineConfig::default()
    };
    let mut h = harness(
        ScriptedChannel::repeating("Still looking.\nTOOL_CALL: list_directory | path=."),
        config,
        Arc::new(FixedConfirmer(ReviewDecision::Approved)),
    );
    let turn = h
        .engine
        .run_turn(0, "find it", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(turn.status, TurnStatus::Truncated);
    assert_eq!(h.channel.invocation_count(), 3);
    assert_eq!(turn.exchanges.len(), 2);
    assert!(turn.response.starts_with("Still looking."));
    assert!(turn.response.contains("Stopped after 3 model rounds"));
    assert!(!turn.response.contains("TOOL_CALL"));
}

#[tokio::test]
async fn malformed_call_gets_an_error_result() {
    let mut h = approving(ScriptedChannel::replies([
        "TOOL_CALL: read_file | path\nTOOL_CALL: read_file | path=README.md",
        "Done.",
    ]));
    let turn = h
        .engine
        .run_turn(0, "read", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(turn.exchanges.len(), 2);
    let broken = &turn.exchanges[0];
    assert_eq!(broken.call.name, "read_file");
    assert_eq!(broken.result.status, ToolStatus::Error);
    assert!(broken.result.output.starts_with("malformed tool call: "));
    assert_eq!(turn.exchanges[1].result.status, ToolStatus::Success);
    assert_eq!(turn.exchanges[1].result.output, "# demo\n");
}

#[tokio::test]
async fn declined_write_leaves_the_file_alone() {
    let mut h = harness(
        ScriptedChannel::replies([
            "TOOL_CALL: write_file | path=README.md | content=replaced",
            "Okay, leaving it.",
        ]),
        EngineConfig::default(),
        Arc::new(FixedConfirmer(ReviewDecision::Denied)),
    );
    let turn = h
        .engine
        .run_turn(0, "rewrite readme", &[], &CancellationToken::new())
        .await
        .unwrap();

    let result = &turn.exchanges[0].result;
    assert_eq!(result.status, ToolStatus::Blocked);
    assert!(result.output.starts_with("Declined by the user"));
    assert_eq!(fs::read_to_string(h.dir.path().join("README.md")).unwrap(), "# demo\n");
}

#[tokio::test]
async fn never_policy_blocks_without_asking() {
    let confirmer = Arc::new(CountingConfirmer {
        answer: ReviewDecision::Approved,
        asked: AtomicUsize::new(0),
    });
    let config = EngineConfig {
        approval_mode: ApprovalMode::Never,
        ..EngineConfig::default()
    };
    let mut h = harness(
        ScriptedChannel::replies(["TOOL_CALL: write_file | path=README.md | content=x", "ok"]),
        config,
        confirmer.clone(),
    );
    let turn = h
        .engine
        .run_turn(0, "go", &[], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(turn.exchanges[0].result.status, ToolStatus::Blocked);
    assert!(turn.exchanges[0].result.output.contains("approval policy is `never`"));
    assert_eq!(confirmer.asked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn session_approval_is_remembered() {
    let confirmer = Arc::new(CountingConfirmer {
        answer: ReviewDecision::ApprovedForSession,
        asked: AtomicUsize::new(0),
    });
    let mut h = harness(
        ScriptedChannel::replies([
            "TOOL_CALL: write_file | path=README.md | content=one\nTOOL_CALL: write_file | path=src/lib.rs | content=two",
            "Both written.",
        ]),
        EngineConfig::default(),
        confirmer.clone(),
    );
    let turn = h
        .engine
        .run_turn(0, "write both", &[], &CancellationToken::new())
        .await
        .unwrap();

    assert!(turn.exchanges.iter().all(|exchange| exchange.result.is_success()));
    assert_eq!(confirmer.asked.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read_to_string(h.dir.path().join("src/lib.rs")).unwrap(), "two");
}

#[tokio::test]
async fn abort_ends_the_turn_with_partial_exchanges() {
    let mut h = harness(
        ScriptedChannel::replies([
            "TOOL_CALL: read_file | path=README.md\nTOOL_CALL: write_file | path=README.md | content=x",
            "unreachable",
        ]),
        EngineConfig::default(),
        Arc::new(FixedConfirmer(ReviewDecision::Abort)),
    );
    let err = h
        .engine
        .run_turn(0, "go", &[], &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, TurnError::Cancelled { .. }));
    let partial = err.partial();
    assert_eq!(partial.len(), 2);
    assert_eq!(partial[0].result.status, ToolStatus::Success);
    assert_eq!(partial[1].result.status, ToolStatus::Blocked);
    assert_eq!(h.channel.invocation_count(), 1);
}

#[tokio::test]
async fn channel_failure_retries_on_another_credential() {
    let mut h = approving(ScriptedChannel::new([
        ScriptStep::Fail(ChannelError::Transport("connection reset".into())),
        ScriptStep::Reply("Recovered.".into()),
    ]));
    let turn = h
        .engine
        .run_turn(0, "hi", &[], &CancellationToken::new())
        .await
        .unwrap();

    let calls = h.channel.invocations();
    assert_eq!(calls.len(), 2);
    assert_ne!(calls[0].credential, calls[1].credential);
    assert_eq!(turn.credential, calls[1].credential);
    assert_eq!(turn.response, "Recovered.");
}

#[tokio::test]
async fn second_channel_failure_ends_the_turn() {
    let mut h = approving(ScriptedChannel::new([
        ScriptStep::Fail(ChannelError::QuotaExceeded("429".into())),
        ScriptStep::Fail(ChannelError::Transport("down".into())),
    ]));
    let err = h
        .engine
        .run_turn(0, "hi", &[], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TurnError::Channel { source: ChannelError::Transport(_), .. }
    ));
    assert!(err.partial().is_empty());

    let log = fs::read_to_string(h.dir.path().join(".state/audit.log")).unwrap();
    let last: serde_json::Value = serde_json::from_str(log.lines().last().unwrap()).unwrap();
    assert_eq!(last["event"], "turn_failed");
    assert_eq!(last["details"]["error"]["code"], "channel_transport");
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_the_model_wait() {
    let mut h = approving(ScriptedChannel::new([ScriptStep::Delayed(
        Duration::from_secs(60),
        "too late".into(),
    )]));
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = h.engine.run_turn(0, "hi", &[], &token).await.unwrap_err();
    assert!(matches!(err, TurnError::Cancelled { .. }));
}

#[tokio::test(start_paused = true)]
async fn turn_deadline_is_enforced() {
    let config = EngineConfig {
        turn_timeout: Some(Duration::from_secs(5)),
        ..EngineConfig::default()
    };
    let mut h = harness(
        ScriptedChannel::new([ScriptStep::Delayed(Duration::from_secs(60), "late".into())]),
        config,
        Arc::new(FixedConfirmer(ReviewDecision::Approved)),
    );
    let err = h
        .engine
        .run_turn(0, "hi", &[], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TurnError::DeadlineExceeded { .. }));
}

#[tokio::test]
async fn events_bracket_the_turn() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let h = approving(ScriptedChannel::replies(["TOOL_CALL: read_file | path=README.md", "Done."]));
    let mut engine = h.engine.with_events(tx);
    engine
        .run_turn(7, "read", &[], &CancellationToken::new())
        .await
        .unwrap();
    drop(engine);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.first(), Some(&Event::TurnStarted { index: 7 }));
    assert_eq!(
        events.last(),
        Some(&Event::TurnComplete {
            status: TurnOutcomeStatus::Completed,
            error: None,
        })
    );
    assert!(events.iter().any(|event| matches!(
        event,
        Event::ToolCallComplete { name, status: ToolStatus::Success, .. } if name == "read_file"
    )));
    assert!(events.contains(&Event::StateChanged {
        state: TurnState::Executing,
        iteration: 1,
    }));
}

#[tokio::test]
async fn decisions_are_audited() {
    let mut h = approving(ScriptedChannel::replies([
        "TOOL_CALL: read_file | path=.env\nTOOL_CALL: read_file | path=README.md",
        "Done.",
    ]));
    h.engine
        .run_turn(0, "read", &[], &CancellationToken::new())
        .await
        .unwrap();

    let log = fs::read_to_string(h.dir.path().join(".state/audit.log")).unwrap();
    let events: Vec<String> = log
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["event"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(events, vec!["security_denied", "tool_call", "tool_call"]);
}

#[test]
fn truncation_notice_replaces_call_lines() {
    let response = truncated_response("TOOL_CALL: read_file | path=a", 10);
    assert!(response.starts_with("[Stopped after 10 model rounds"));
}

/// Never answers and ignores the timeout it is given.
struct StuckChannel;

#[async_trait]
impl ModelChannel for StuckChannel {
    async fn invoke(
        &self,
        _prompt: &str,
        _credential: &Credential,
        _timeout: Duration,
    ) -> Result<String, ChannelError> {
        std::future::pending().await
    }
}

fn bare_engine(
    dir: &TempDir,
    channel: Arc<dyn ModelChannel>,
    governor: Arc<Governor>,
    config: EngineConfig,
) -> Engine {
    let registry = Arc::new(ToolRegistryBuilder::new(ToolContext::new(dir.path())).build());
    let gate = SecurityGate::new(dir.path(), RuleSet::default());
    Engine::new(
        config,
        channel,
        governor,
        registry,
        gate,
        Arc::new(FixedConfirmer(ReviewDecision::Approved)),
    )
}

#[tokio::test(start_paused = true)]
async fn model_timeout_bounds_a_channel_that_ignores_it() {
    let dir = tempfile::tempdir().unwrap();
    let governor = Arc::new(Governor::new(
        vec![Credential::new("1"), Credential::new("2")],
        GovernorConfig::default(),
    ));
    let config = EngineConfig {
        model_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    };
    let mut engine = bare_engine(&dir, Arc::new(StuckChannel), governor, config);

    let started = Instant::now();
    let err = engine
        .run_turn(0, "hi", &[], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TurnError::Channel { source: ChannelError::Timeout(_), .. }
    ));
    // First attempt plus the retry on the other credential.
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn cancelled_trial_does_not_strand_the_credential() {
    let dir = tempfile::tempdir().unwrap();
    let only = Credential::new("1");
    let governor = Arc::new(Governor::new(
        vec![only.clone()],
        GovernorConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(30),
            ..GovernorConfig::default()
        },
    ));
    governor.report(&only, Outcome::Failure).await;
    tokio::time::advance(Duration::from_secs(31)).await;

    let channel = Arc::new(ScriptedChannel::new([ScriptStep::Delayed(
        Duration::from_secs(60),
        "too late".into(),
    )]));
    let mut engine = bare_engine(&dir, channel, governor.clone(), EngineConfig::default());
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });
    let err = engine.run_turn(0, "hi", &[], &token).await.unwrap_err();
    assert!(matches!(err, TurnError::Cancelled { .. }));

    // The abandoned trial is released at once instead of holding the slot.
    let next = governor
        .acquire(None, Some(Instant::now() + Duration::from_secs(1)))
        .await;
    assert_eq!(next, Ok(only));
}
