//! CLI entry point for the agentic assistant.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use dotenvy::dotenv;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agentic_cli::approval::{ApprovalMode, Confirmer, ConsoleConfirmer};
use agentic_cli::audit::AuditLog;
use agentic_cli::client::CommandChannel;
use agentic_cli::commands::{self, CommandAction};
use agentic_cli::config::Config;
use agentic_cli::core::engine::Engine;
use agentic_cli::core::events::{Event, TurnOutcomeStatus};
use agentic_cli::core::governor::Governor;
use agentic_cli::core::spawn::SpawnCoordinator;
use agentic_cli::core::turn::TurnStatus;
use agentic_cli::error_taxonomy::{ErrorEnvelope, ErrorSeverity};
use agentic_cli::input::LineReader;
use agentic_cli::llm_client::ModelChannel;
use agentic_cli::logging;
use agentic_cli::security::SecurityGate;
use agentic_cli::session_manager::{self, HandoffSummary, Recovery, SessionManager};
use agentic_cli::tools::swarm::format_report;
use agentic_cli::tools::{ToolContext, ToolRegistryBuilder, ToolStatus};
use agentic_cli::utils::one_line;

const PROMPT: &str = "agentic> ";

#[derive(Parser, Debug)]
#[command(
    name = "agentic",
    author,
    version,
    about = "Agentic CLI - a tool-using assistant driven by an external model",
    long_about = "Runs a conversation with an external model program. The model asks for tools \
                  through TOOL_CALL lines; every call passes a security gate before it runs.\n\n\
                  Just run 'agentic' to start chatting."
)]
struct Cli {
    /// Subcommand to run (defaults to chat)
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Config profile name
    #[arg(long)]
    profile: Option<String>,

    /// Workspace directory (sandbox root for tools)
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    /// Approve every call the security gate allows without asking
    #[arg(short, long)]
    yes: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Interactive conversation (default)
    Chat,
    /// Run a single request and exit
    Run {
        /// The request to send
        prompt: String,
    },
    /// Ask several independent questions in parallel
    Spawn {
        /// Background shared by every query
        #[arg(long)]
        context: Option<String>,
        /// Queries to run
        #[arg(required = true)]
        queries: Vec<String>,
    },
    /// Show session state and account limits
    Status,
    /// Show committed conversation history
    History {
        /// Archive the history and start fresh
        #[arg(long)]
        clear: bool,
    },
}

/// Shared pieces built once from configuration.
struct Runtime {
    config: Config,
    workspace: PathBuf,
    state_dir: PathBuf,
    approval_mode: ApprovalMode,
    governor: Arc<Governor>,
    channel: Arc<dyn ModelChannel>,
    coordinator: Arc<SpawnCoordinator>,
    input: Arc<LineReader>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let runtime = build_runtime(&cli)?;
    match cli.command.clone().unwrap_or(Commands::Chat) {
        Commands::Chat => run_chat(&runtime).await,
        Commands::Run { prompt } => run_once(&runtime, &prompt).await,
        Commands::Spawn { context, queries } => run_spawn(&runtime, context.as_deref(), queries).await,
        Commands::Status => show_status(&runtime).await,
        Commands::History { clear } => show_history(&runtime, clear),
    }
}

// === Setup ===

fn load_config_from_cli(cli: &Cli) -> Result<Config> {
    let profile = cli
        .profile
        .clone()
        .or_else(|| std::env::var("AGENTIC_PROFILE").ok());
    let mut config = Config::load(cli.config.clone(), profile.as_deref())?;
    if let Some(workspace) = &cli.workspace {
        config.workspace = Some(workspace.display().to_string());
    }
    Ok(config)
}

fn build_runtime(cli: &Cli) -> Result<Runtime> {
    let config = load_config_from_cli(cli)?;
    let workspace = config.workspace()?;
    let state_dir = config.state_dir(&workspace);
    let approval_mode = if cli.yes {
        ApprovalMode::Auto
    } else {
        config.approval_mode()
    };

    let credentials = config.credentials();
    tracing::debug!(accounts = credentials.len(), workspace = %workspace.display(), "runtime configured");
    let governor = Arc::new(Governor::new(credentials, config.governor_config()));
    let (command, args) = config.model_command();
    let channel: Arc<dyn ModelChannel> = Arc::new(CommandChannel::new(command, args));
    let coordinator = Arc::new(SpawnCoordinator::new(
        channel.clone(),
        governor.clone(),
        config.spawn_config(),
    ));
    let input = Arc::new(LineReader::terminal().context("Failed to initialize line editor")?);

    Ok(Runtime {
        config,
        workspace,
        state_dir,
        approval_mode,
        governor,
        channel,
        coordinator,
        input,
    })
}

fn build_engine(runtime: &Runtime, events: mpsc::UnboundedSender<Event>) -> Result<Engine> {
    let mut engine_config = runtime.config.engine_config();
    engine_config.approval_mode = runtime.approval_mode;

    let context = ToolContext::new(&runtime.workspace).with_command_timeout(engine_config.tool_timeout);
    let registry = Arc::new(
        ToolRegistryBuilder::new(context)
            .with_file_tools()
            .with_shell_tools()
            .with_research_tool(runtime.coordinator.clone(), runtime.config.max_queries())
            .build(),
    );
    let gate = SecurityGate::new(&runtime.workspace, runtime.config.rule_set()?);
    let confirmer: Arc<dyn Confirmer> = Arc::new(ConsoleConfirmer::new(runtime.input.clone()));

    Ok(Engine::new(
        engine_config,
        runtime.channel.clone(),
        runtime.governor.clone(),
        registry,
        gate,
        confirmer,
    )
    .with_events(events)
    .with_audit(AuditLog::in_state_dir(&runtime.state_dir)))
}

// === Conversation ===

/// Console side of one engine: the engine plus the renderer that acknowledges
/// each finished turn.
struct Console {
    engine: Engine,
    turn_done: mpsc::UnboundedReceiver<()>,
}

impl Console {
    fn start(runtime: &Runtime) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, turn_done) = mpsc::unbounded_channel();
        tokio::spawn(render_events(events_rx, done_tx));
        Ok(Self {
            engine: build_engine(runtime, events_tx)?,
            turn_done,
        })
    }

    /// Run one turn with Ctrl-C wired to cancellation, then commit it.
    async fn turn(&mut self, session: &mut SessionManager, input: &str) -> Result<()> {
        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let index = session.next_index();
        let result = self
            .engine
            .run_turn(index, input, session.history(), &cancel)
            .await;
        watcher.abort();
        // Let the renderer catch up before printing the answer.
        let _ = self.turn_done.recv().await;

        match result {
            Ok(turn) => {
                println!("\n{}\n", turn.response);
                if turn.status == TurnStatus::Truncated {
                    eprintln!(
                        "{}",
                        "The turn hit the tool round limit; the answer above may be incomplete.".yellow()
                    );
                }
                session.commit_turn(turn).context("Failed to save turn")?;
            }
            Err(err) => {
                let envelope = ErrorEnvelope::from(&err);
                let line = format!("Turn not saved: {}", envelope.message);
                match envelope.severity {
                    ErrorSeverity::Info => eprintln!("{}", line.dimmed()),
                    ErrorSeverity::Warning => eprintln!("{}", line.yellow()),
                    ErrorSeverity::Error | ErrorSeverity::Critical => eprintln!("{}", line.red()),
                }
                let completed = err.partial().len();
                if completed > 0 {
                    eprintln!(
                        "{}",
                        format!("{completed} tool call(s) had already run before it stopped.").dimmed()
                    );
                }
            }
        }
        Ok(())
    }
}

async fn run_chat(runtime: &Runtime) -> Result<()> {
    let (mut session, report) = SessionManager::start(&runtime.state_dir)
        .with_context(|| format!("Failed to start session in {}", runtime.state_dir.display()))?;

    print_banner(runtime, &session, report.replayed);
    if report.dropped_partial_record {
        eprintln!("{}", "Dropped an incomplete history record from the last run.".yellow());
    }
    if let Some(recovery) = &report.recovery {
        offer_recovery(&mut session, recovery, &runtime.input).await?;
    }

    let mut console = Console::start(runtime)?;
    let outcome = chat_loop(runtime, &mut console, &mut session).await;
    drop(console);
    close_session(runtime, session).await?;
    outcome
}

async fn chat_loop(
    runtime: &Runtime,
    console: &mut Console,
    session: &mut SessionManager,
) -> Result<()> {
    loop {
        let line = match runtime.input.read_line(PROMPT).await {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => return Ok(()),
            Err(err) => return Err(err).context("Failed to read input"),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        runtime.input.add_history(input);

        if let Some(result) = commands::execute(input) {
            if let Some(message) = &result.message {
                println!("{message}");
            }
            match result.action {
                Some(CommandAction::Quit) => return Ok(()),
                Some(CommandAction::ClearHistory) => {
                    let archived = session.discard_history().context("Failed to clear history")?;
                    console.engine.clear_session_approvals();
                    match archived {
                        Some(path) => println!("History archived to {}", path.display()),
                        None => println!("History cleared."),
                    }
                }
                Some(CommandAction::ShowHistory) => println!("{}", commands::format_history(session.history())),
                Some(CommandAction::ShowStatus) => {
                    let accounts = runtime.governor.status().await;
                    println!(
                        "{}",
                        commands::format_status(
                            session.session_id(),
                            console.engine.approval_mode(),
                            session.history().len() as u64,
                            &accounts
                        )
                    );
                }
                None => {}
            }
            continue;
        }

        console.turn(session, input).await?;
    }
}

async fn run_once(runtime: &Runtime, prompt: &str) -> Result<()> {
    let (mut session, report) = SessionManager::start(&runtime.state_dir)
        .with_context(|| format!("Failed to start session in {}", runtime.state_dir.display()))?;
    if let Some(recovery) = &report.recovery {
        session.add_note(format!("Continued after session {} ended unexpectedly", recovery.previous_session));
        eprintln!(
            "{}",
            format!(
                "Previous session {} did not shut down cleanly; continuing with its history.",
                recovery.previous_session
            )
            .yellow()
        );
    }

    let mut console = Console::start(runtime)?;
    let outcome = console.turn(&mut session, prompt).await;
    drop(console);
    close_session(runtime, session).await?;
    outcome
}

async fn offer_recovery(session: &mut SessionManager, recovery: &Recovery, input: &LineReader) -> Result<()> {
    eprintln!(
        "{}",
        format!("Session {} ended without shutting down.", recovery.previous_session).yellow()
    );
    let Some(last) = &recovery.last_turn else {
        return Ok(());
    };
    eprintln!("  Last saved request: {}", one_line(&last.user, 80).bold());
    eprintln!("  Last answer: {}", one_line(&last.response, 80));

    let answer = match input.read_line("Continue that conversation? [Y/n] ").await {
        Ok(answer) => answer,
        Err(ReadlineError::Interrupted | ReadlineError::Eof) => String::new(),
        Err(err) => return Err(err).context("Failed to read input"),
    };
    if matches!(answer.trim().to_ascii_lowercase().as_str(), "n" | "no") {
        if let Some(path) = session.discard_history().context("Failed to discard history")? {
            eprintln!("Previous history archived to {}", path.display());
        }
    } else {
        session.add_note(format!("Recovered history from session {}", recovery.previous_session));
    }
    Ok(())
}

async fn close_session(runtime: &Runtime, session: SessionManager) -> Result<()> {
    let summary = HandoffSummary {
        credentials: runtime.governor.status().await,
        notes: Vec::new(),
    };
    let path = session.shutdown(&summary).context("Failed to close session")?;
    tracing::info!(handoff = %path.display(), "handoff written");
    Ok(())
}

fn print_banner(runtime: &Runtime, session: &SessionManager, replayed: usize) {
    println!("{}", "Agentic CLI".bold());
    println!("  workspace: {}", runtime.workspace.display());
    println!("  session:   {}", session.session_id());
    println!("  approval:  {}", runtime.approval_mode);
    if replayed > 0 {
        println!("  history:   {replayed} turn(s) restored");
    }
    println!("{}", "Type 'help' for commands, 'exit' to quit.".dimmed());
}

// === Event rendering ===

async fn render_events(mut events: mpsc::UnboundedReceiver<Event>, turn_done: mpsc::UnboundedSender<()>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::TurnStarted { index } => tracing::debug!(turn = index, "turn started"),
            Event::StateChanged { state, iteration } => {
                if logging::is_verbose() {
                    eprintln!("{}", format!("  [{state} #{iteration}]").dimmed());
                }
            }
            Event::ModelRequest { credential, iteration } => {
                eprintln!("{}", format!("  asking the model ({credential}, round {iteration})").dimmed());
            }
            Event::ToolCallStarted { name, summary } => {
                eprintln!("  {} {} {}", "->".cyan(), name.cyan().bold(), summary.dimmed());
            }
            Event::ToolCallComplete { name, status, preview } => {
                let label = match status {
                    ToolStatus::Success => status.as_str().green(),
                    ToolStatus::Error => status.as_str().red(),
                    ToolStatus::Blocked => status.as_str().yellow(),
                };
                eprintln!("     {name} {label}: {}", preview.dimmed());
            }
            Event::Error { message, recoverable } => {
                if recoverable {
                    eprintln!("{}", message.yellow());
                } else {
                    eprintln!("{}", message.red());
                }
            }
            Event::Status { message } => eprintln!("{}", message.dimmed()),
            Event::TurnComplete { status, error } => {
                if status == TurnOutcomeStatus::Interrupted {
                    eprintln!("{}", "Turn cancelled.".dimmed());
                }
                if let Some(error) = error {
                    tracing::debug!(%error, "turn ended with error");
                }
                let _ = io::stderr().flush();
                let _ = turn_done.send(());
            }
        }
    }
}

// === One-shot subcommands ===

async fn run_spawn(runtime: &Runtime, context: Option<&str>, queries: Vec<String>) -> Result<()> {
    let max = runtime.config.max_queries();
    if queries.len() > max {
        anyhow::bail!("Too many queries ({}, max {max})", queries.len());
    }
    let count = queries.len();
    let jobs = match context {
        Some(context) => runtime.coordinator.spawn_with_context(context, queries).await,
        None => runtime.coordinator.run_jobs(queries).await,
    };
    println!("{}", format_report(count, &jobs));
    if jobs.iter().all(|job| job.result.is_err()) {
        anyhow::bail!("Every query failed");
    }
    Ok(())
}

async fn show_status(runtime: &Runtime) -> Result<()> {
    let snapshot = session_manager::inspect(&runtime.state_dir)
        .with_context(|| format!("Failed to read {}", runtime.state_dir.display()))?;
    let session_id = snapshot
        .running
        .as_ref()
        .map_or_else(|| "(none running)".to_string(), |marker| format!("{} (pid {})", marker.session_id, marker.pid));
    let accounts = runtime.governor.status().await;
    println!("Workspace: {}", runtime.workspace.display());
    println!("State dir: {}", runtime.state_dir.display());
    println!(
        "{}",
        commands::format_status(&session_id, runtime.approval_mode, snapshot.history.len() as u64, &accounts)
    );
    Ok(())
}

fn show_history(runtime: &Runtime, clear: bool) -> Result<()> {
    if clear {
        let (mut session, _) = SessionManager::start(&runtime.state_dir)
            .with_context(|| format!("Failed to open session in {}", runtime.state_dir.display()))?;
        let archived = session.discard_history().context("Failed to clear history")?;
        session.release().context("Failed to release session")?;
        match archived {
            Some(path) => println!("History archived to {}", path.display()),
            None => println!("No history to clear."),
        }
        return Ok(());
    }
    let snapshot = session_manager::inspect(&runtime.state_dir)
        .with_context(|| format!("Failed to read {}", runtime.state_dir.display()))?;
    println!("{}", commands::format_history(&snapshot.history));
    Ok(())
}
