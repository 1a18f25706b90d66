//! Crash recovery: committed turns survive a session that never shut down.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use agentic_cli::approval::{FixedConfirmer, ReviewDecision};
use agentic_cli::core::engine::{Engine, EngineConfig};
use agentic_cli::core::governor::{Credential, Governor, GovernorConfig};
use agentic_cli::eval::{ScriptedChannel, seed_workspace};
use agentic_cli::security::{RuleSet, SecurityGate};
use agentic_cli::session_manager::{HandoffSummary, SessionManager};
use agentic_cli::tools::{ToolContext, ToolRegistryBuilder};

fn engine(root: &std::path::Path, channel: Arc<ScriptedChannel>) -> Engine {
    let registry = Arc::new(
        ToolRegistryBuilder::new(ToolContext::new(root))
            .with_file_tools()
            .build(),
    );
    Engine::new(
        EngineConfig::default(),
        channel,
        Arc::new(Governor::new(vec![Credential::new("1")], GovernorConfig::default())),
        registry,
        SecurityGate::new(root, RuleSet::default()),
        Arc::new(FixedConfirmer(ReviewDecision::Approved)),
    )
}

#[tokio::test]
async fn crashed_session_offers_its_last_turn() {
    let workspace = tempfile::tempdir().unwrap();
    seed_workspace(workspace.path()).unwrap();
    let state = workspace.path().join(".agentic");
    let cancel = CancellationToken::new();

    // First run: two committed turns, then the process "dies" without shutdown.
    {
        let channel = Arc::new(ScriptedChannel::replies([
            "TOOL_CALL: list_directory | path=src",
            "lib.rs and main.rs",
            "It adds two numbers.",
        ]));
        let mut engine = engine(workspace.path(), channel);
        let (mut session, report) = SessionManager::start(&state).unwrap();
        assert!(report.recovery.is_none());

        let turn = engine
            .run_turn(session.next_index(), "List files in src/", session.history(), &cancel)
            .await
            .unwrap();
        session.commit_turn(turn).unwrap();
        let turn = engine
            .run_turn(session.next_index(), "What does lib.rs do?", session.history(), &cancel)
            .await
            .unwrap();
        session.commit_turn(turn).unwrap();
        // Dropped without `shutdown`: the liveness marker stays behind.
    }

    let (session, report) = SessionManager::start(&state).unwrap();
    assert_eq!(report.replayed, 2);
    let recovery = report.recovery.expect("crash should be detected");
    let last = recovery.last_turn.expect("last committed turn");
    assert_eq!(last.user, "What does lib.rs do?");
    assert_eq!(last.response, "It adds two numbers.");
    assert_eq!(recovery.checkpoint.map(|c| c.turn_count), Some(2));
    assert_eq!(session.history()[0].tool_names().collect::<Vec<_>>(), vec!["list_directory"]);

    // The recovered history reaches the model on the next turn.
    let channel = Arc::new(ScriptedChannel::replies(["Yes, it is."]));
    let mut engine = engine(workspace.path(), channel.clone());
    let turn = engine
        .run_turn(session.next_index(), "Is it tested?", session.history(), &cancel)
        .await
        .unwrap();
    assert_eq!(turn.index, 2);
    let prompt = &channel.invocations()[0].prompt;
    assert!(prompt.contains("User: List files in src/\n(tools used: list_directory)"));
    assert!(prompt.contains("User: What does lib.rs do?"));

    session.shutdown(&HandoffSummary::default()).unwrap();
}

#[tokio::test]
async fn interrupted_write_loses_only_the_partial_record() {
    let workspace = tempfile::tempdir().unwrap();
    seed_workspace(workspace.path()).unwrap();
    let state = workspace.path().join(".agentic");
    let channel = Arc::new(ScriptedChannel::replies(["Hello."]));
    let mut engine = engine(workspace.path(), channel);

    let (mut session, _) = SessionManager::start(&state).unwrap();
    let turn = engine
        .run_turn(0, "hi", &[], &CancellationToken::new())
        .await
        .unwrap();
    session.commit_turn(turn).unwrap();
    drop(session);

    let history = state.join("history.jsonl");
    let mut file = OpenOptions::new().append(true).open(&history).unwrap();
    file.write_all(b"{\"index\":1,\"user\":\"half writ").unwrap();
    drop(file);

    let (session, report) = SessionManager::start(&state).unwrap();
    assert!(report.dropped_partial_record);
    assert_eq!(report.replayed, 1);
    assert_eq!(session.next_index(), 1);
    assert!(fs::read_to_string(&history).unwrap().ends_with('\n'));
    assert!(report.recovery.is_some());
}

#[tokio::test]
async fn clean_shutdown_is_not_a_crash() {
    let workspace = tempfile::tempdir().unwrap();
    let state = workspace.path().join(".agentic");

    let (session, _) = SessionManager::start(&state).unwrap();
    let handoff = session.shutdown(&HandoffSummary::default()).unwrap();
    assert!(fs::read_to_string(handoff).unwrap().starts_with("# Session Handoff"));

    let (_session, report) = SessionManager::start(&state).unwrap();
    assert!(report.recovery.is_none());
}
