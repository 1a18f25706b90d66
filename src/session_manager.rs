//! Session lifecycle: liveness marker, durable history and crash recovery.
//!
//! Layout of the state directory:
//! - `session.lock`: JSON marker written at start, removed on clean shutdown
//! - `history.jsonl`: one committed [`Turn`] per line, append-only
//! - `checkpoint.json`: turn count and last activity, replaced atomically
//! - `HANDOFF.md`: summary written on shutdown
//!
//! A marker whose process is gone means the previous run died; its checkpoint
//! and last committed turn are offered back through [`StartReport::recovery`].

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::core::governor::CredentialStatus;
use crate::core::turn::{Turn, TurnStatus};
use crate::utils::one_line;

pub const LOCK_FILE: &str = "session.lock";
pub const HISTORY_FILE: &str = "history.jsonl";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const HANDOFF_FILE: &str = "HANDOFF.md";

const HANDOFF_RECENT_REQUESTS: usize = 5;

// === Types ===

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("another session ({session_id}) is running as pid {pid}")]
    AlreadyRunning { session_id: String, pid: u32 },
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },
    #[error("history line {line} is corrupt: {source}")]
    CorruptHistory {
        line: usize,
        source: serde_json::Error,
    },
    #[error("failed to serialize session data: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SessionError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Contents of `session.lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessMarker {
    pub session_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Contents of `checkpoint.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub turn_count: u64,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// What a crashed predecessor left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub previous_session: String,
    pub checkpoint: Option<Checkpoint>,
    pub last_turn: Option<Turn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartReport {
    pub session_id: String,
    /// Turns replayed from history.
    pub replayed: usize,
    /// A trailing half-written record was found and dropped.
    pub dropped_partial_record: bool,
    pub recovery: Option<Recovery>,
}

/// Extra material for `HANDOFF.md` that the session does not track itself.
#[derive(Debug, Clone, Default)]
pub struct HandoffSummary {
    pub credentials: Vec<CredentialStatus>,
    pub notes: Vec<String>,
}

// === Manager ===

#[derive(Debug)]
pub struct SessionManager {
    dir: PathBuf,
    session_id: String,
    started_at: DateTime<Utc>,
    history: Vec<Turn>,
    /// History length when this session started.
    first_session_turn: usize,
    notes: Vec<String>,
}

impl SessionManager {
    /// Claim the state directory, detect a crashed predecessor and replay history.
    pub fn start(dir: &Path) -> Result<(Self, StartReport), SessionError> {
        fs::create_dir_all(dir).map_err(|err| SessionError::io("failed to create", dir, err))?;

        let lock_path = dir.join(LOCK_FILE);
        let mut crashed: Option<String> = None;
        match read_marker(&lock_path)? {
            MarkerState::Absent => {}
            MarkerState::Unreadable => {
                crate::logging::warn(format!(
                    "ignoring unreadable session marker {}",
                    lock_path.display()
                ));
                crashed = Some("unknown".to_string());
            }
            MarkerState::Present(marker) => {
                if marker.pid != std::process::id() && is_process_alive(marker.pid) {
                    return Err(SessionError::AlreadyRunning {
                        session_id: marker.session_id,
                        pid: marker.pid,
                    });
                }
                tracing::warn!(
                    session = %marker.session_id,
                    pid = marker.pid,
                    "previous session ended without shutting down"
                );
                crashed = Some(marker.session_id);
            }
        }

        let (history, dropped_partial_record) = replay_history(&dir.join(HISTORY_FILE))?;

        let recovery = match crashed {
            Some(previous_session) => Some(Recovery {
                previous_session,
                checkpoint: read_checkpoint(&dir.join(CHECKPOINT_FILE)),
                last_turn: history.last().cloned(),
            }),
            None => None,
        };

        let started_at = Utc::now();
        let session_id = generate_session_id(started_at);
        let marker = LivenessMarker {
            session_id: session_id.clone(),
            pid: std::process::id(),
            started_at,
        };
        let content = serde_json::to_string_pretty(&marker)?;
        fs::write(&lock_path, content)
            .map_err(|err| SessionError::io("failed to write", &lock_path, err))?;

        let replayed = history.len();
        let manager = Self {
            dir: dir.to_path_buf(),
            session_id: session_id.clone(),
            started_at,
            first_session_turn: replayed,
            history,
            notes: Vec::new(),
        };
        manager.write_checkpoint()?;

        Ok((
            manager,
            StartReport {
                session_id,
                replayed,
                dropped_partial_record,
                recovery,
            },
        ))
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Index for the next turn.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.history.last().map_or(0, |turn| turn.index + 1)
    }

    /// Turns committed since this session started.
    #[must_use]
    pub fn session_turns(&self) -> &[Turn] {
        &self.history[self.first_session_turn.min(self.history.len())..]
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Durably append `turn`; on error nothing is recorded in memory.
    pub fn commit_turn(&mut self, turn: Turn) -> Result<(), SessionError> {
        let mut record = serde_json::to_string(&turn)?;
        record.push('\n');

        let path = self.dir.join(HISTORY_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| SessionError::io("failed to open", &path, err))?;
        let len_before = file
            .metadata()
            .map_err(|err| SessionError::io("failed to stat", &path, err))?
            .len();
        append_record(&mut file, len_before, record.as_bytes())
            .map_err(|err| SessionError::io("failed to append to", &path, err))?;
        file.sync_data()
            .map_err(|err| SessionError::io("failed to sync", &path, err))?;

        self.history.push(turn);
        self.write_checkpoint()
    }

    /// Move the history file aside and start from an empty conversation.
    ///
    /// Returns the archive path, if there was anything to archive.
    pub fn discard_history(&mut self) -> Result<Option<PathBuf>, SessionError> {
        let path = self.dir.join(HISTORY_FILE);
        let archived = if path.exists() {
            let archive = self.dir.join(format!(
                "history-{}.jsonl",
                Utc::now().format("%Y%m%d-%H%M%S%.3f")
            ));
            fs::rename(&path, &archive)
                .map_err(|err| SessionError::io("failed to archive", &path, err))?;
            Some(archive)
        } else {
            None
        };
        self.history.clear();
        self.first_session_turn = 0;
        self.write_checkpoint()?;
        Ok(archived)
    }

    /// Write `HANDOFF.md`, then remove the checkpoint and the liveness marker.
    pub fn shutdown(self, summary: &HandoffSummary) -> Result<PathBuf, SessionError> {
        let ended_at = Utc::now();
        let handoff = self.render_handoff(summary, ended_at);
        let handoff_path = self.dir.join(HANDOFF_FILE);
        fs::write(&handoff_path, handoff)
            .map_err(|err| SessionError::io("failed to write", &handoff_path, err))?;

        self.release()?;
        Ok(handoff_path)
    }

    /// End the session without a handoff: remove the checkpoint and the marker.
    pub fn release(self) -> Result<(), SessionError> {
        for name in [CHECKPOINT_FILE, LOCK_FILE] {
            let path = self.dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(SessionError::io("failed to remove", &path, err)),
            }
        }
        tracing::info!(session = %self.session_id, "session closed");
        Ok(())
    }

    fn write_checkpoint(&self) -> Result<(), SessionError> {
        let checkpoint = Checkpoint {
            session_id: self.session_id.clone(),
            turn_count: self.history.len() as u64,
            last_activity: Utc::now(),
            notes: self.notes.clone(),
        };
        let path = self.dir.join(CHECKPOINT_FILE);
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|err| SessionError::io("failed to create temp file in", &self.dir, err))?;
        serde_json::to_writer_pretty(&mut tmp, &checkpoint)?;
        tmp.as_file()
            .sync_data()
            .map_err(|err| SessionError::io("failed to sync", tmp.path(), err))?;
        tmp.persist(&path)
            .map_err(|err| SessionError::io("failed to replace", &path, err.error))?;
        Ok(())
    }

    fn render_handoff(&self, summary: &HandoffSummary, ended_at: DateTime<Utc>) -> String {
        let turns = self.session_turns();
        let mut out = String::from("# Session Handoff\n\n");
        let _ = writeln!(out, "**Session ID**: {}", self.session_id);
        let _ = writeln!(out, "**Started**: {}", self.started_at.to_rfc3339());
        let _ = writeln!(out, "**Ended**: {}", ended_at.to_rfc3339());
        let _ = writeln!(
            out,
            "**Duration**: {}",
            format_duration((ended_at - self.started_at).num_seconds())
        );
        let _ = writeln!(
            out,
            "**Turns**: {} this session, {} in history",
            turns.len(),
            self.history.len()
        );

        if !turns.is_empty() {
            out.push_str("\n## Recent Requests\n");
            let skip = turns.len().saturating_sub(HANDOFF_RECENT_REQUESTS);
            for turn in &turns[skip..] {
                let marker = match turn.status {
                    TurnStatus::Completed => "x",
                    TurnStatus::Truncated => "~",
                };
                let _ = writeln!(out, "- [{marker}] {}", one_line(&turn.user, 100));
            }

            let mut usage: BTreeMap<&str, usize> = BTreeMap::new();
            for name in turns.iter().flat_map(Turn::tool_names) {
                *usage.entry(name).or_default() += 1;
            }
            if !usage.is_empty() {
                out.push_str("\n## Tool Usage\n");
                for (name, count) in usage {
                    let _ = writeln!(out, "- {name}: {count}");
                }
            }
        }

        if !summary.credentials.is_empty() {
            out.push_str("\n## Credentials\n");
            for status in &summary.credentials {
                let _ = writeln!(
                    out,
                    "- {}: {}, {}/{} this window, {} requests, {} failures",
                    status.credential,
                    status.circuit,
                    status.window_count,
                    status.window_limit,
                    status.total_requests,
                    status.total_failures
                );
            }
        }

        let notes: Vec<&String> = self.notes.iter().chain(&summary.notes).collect();
        if !notes.is_empty() {
            out.push_str("\n## Notes\n");
            for note in notes {
                let _ = writeln!(out, "- {note}");
            }
        }
        out
    }
}

// === Helpers ===

enum MarkerState {
    Absent,
    Unreadable,
    Present(LivenessMarker),
}

/// Read-only view of a state directory.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// Marker of a session that is still running.
    pub running: Option<LivenessMarker>,
    pub checkpoint: Option<Checkpoint>,
    /// Complete records only; the file is left untouched.
    pub history: Vec<Turn>,
}

/// Look at `dir` without claiming it.
pub fn inspect(dir: &Path) -> Result<SessionSnapshot, SessionError> {
    let running = match read_marker(&dir.join(LOCK_FILE))? {
        MarkerState::Present(marker) if is_process_alive(marker.pid) => Some(marker),
        _ => None,
    };
    let history_path = dir.join(HISTORY_FILE);
    let history = match fs::read_to_string(&history_path) {
        Ok(content) => {
            let complete_len = content.rfind('\n').map_or(0, |pos| pos + 1);
            parse_history(&content[..complete_len])?
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(SessionError::io("failed to read", &history_path, err)),
    };
    Ok(SessionSnapshot {
        running,
        checkpoint: read_checkpoint(&dir.join(CHECKPOINT_FILE)),
        history,
    })
}

fn read_marker(path: &Path) -> Result<MarkerState, SessionError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(MarkerState::Absent),
        Err(err) => return Err(SessionError::io("failed to read", path, err)),
    };
    Ok(serde_json::from_str(&content).map_or(MarkerState::Unreadable, MarkerState::Present))
}

fn read_checkpoint(path: &Path) -> Option<Checkpoint> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(checkpoint) => Some(checkpoint),
        Err(err) => {
            crate::logging::warn(format!("ignoring corrupt checkpoint {}: {err}", path.display()));
            None
        }
    }
}

/// History sink that can be cut back to an earlier length.
trait Truncate: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl Truncate for fs::File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append one record. A write that fails partway is cut back off so the next
/// append does not land on the same line.
fn append_record<T: Truncate>(out: &mut T, len_before: u64, record: &[u8]) -> io::Result<()> {
    let Err(err) = out.write_all(record) else {
        return Ok(());
    };
    if let Err(cut) = out.truncate_to(len_before) {
        tracing::warn!(error = %cut, "failed to roll back a partial history record");
    }
    Err(err)
}

/// Load every complete record. A final line without its newline is a write
/// that never finished: it is dropped and cut from the file.
fn replay_history(path: &Path) -> Result<(Vec<Turn>, bool), SessionError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(err) => return Err(SessionError::io("failed to read", path, err)),
    };

    let complete_len = content.rfind('\n').map_or(0, |pos| pos + 1);
    let dropped = complete_len < content.len();
    if dropped {
        tracing::warn!(
            bytes = content.len() - complete_len,
            "dropping truncated trailing history record"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| SessionError::io("failed to open", path, err))?;
        file.set_len(complete_len as u64)
            .map_err(|err| SessionError::io("failed to truncate", path, err))?;
    }

    Ok((parse_history(&content[..complete_len])?, dropped))
}

fn parse_history(content: &str) -> Result<Vec<Turn>, SessionError> {
    let mut turns = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let turn = serde_json::from_str(line).map_err(|source| SessionError::CorruptHistory {
            line: idx + 1,
            source,
        })?;
        turns.push(turn);
    }
    Ok(turns)
}

fn generate_session_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

fn format_duration(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Check if a process is still running.
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn is_process_alive(pid: u32) -> bool {
    // pid_t is i32; anything larger would address a process group.
    let Ok(pid_t) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // kill(pid, 0) checks existence without sending a signal; EPERM means it exists.
    let result = unsafe { libc::kill(pid_t, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::governor::Credential;
    use crate::core::tool_parser::{ToolArgs, ToolCall};
    use crate::core::turn::Exchange;
    use crate::tools::spec::ToolResult;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn turn(index: u64, user: &str) -> Turn {
        let args = ToolArgs::new().with("path", "src");
        Turn {
            index,
            user: user.to_string(),
            exchanges: vec![Exchange {
                call: ToolCall {
                    name: "list_directory".to_string(),
                    args: args.clone(),
                    raw: "TOOL_CALL: list_directory | path=src".to_string(),
                },
                result: ToolResult::success("list_directory", args, "main.rs"),
            }],
            response: format!("answer {index}"),
            credential: Credential::new("1"),
            timestamp: Utc::now(),
            status: TurnStatus::Completed,
        }
    }

    /// Accepts `room` bytes, then fails every write.
    struct FullDisk {
        data: Vec<u8>,
        room: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::Error::other("no space left on device"));
            }
            let n = buf.len().min(self.room);
            self.data.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Truncate for FullDisk {
        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn failed_append_leaves_no_fragment() {
        let existing = b"{\"index\":0}\n".to_vec();
        let mut out = FullDisk {
            data: existing.clone(),
            room: 5,
        };
        let err = append_record(&mut out, existing.len() as u64, b"{\"index\":1}\n").unwrap_err();
        assert_eq!(err.to_string(), "no space left on device");
        assert_eq!(out.data, existing);

        out.room = 64;
        append_record(&mut out, existing.len() as u64, b"{\"index\":1}\n").unwrap();
        assert_eq!(out.data, b"{\"index\":0}\n{\"index\":1}\n".to_vec());
    }

    #[test]
    fn fresh_directory_starts_clean() {
        let dir = tempdir().unwrap();
        let (session, report) = SessionManager::start(dir.path()).unwrap();
        assert_eq!(report.replayed, 0);
        assert!(report.recovery.is_none());
        assert_eq!(session.next_index(), 0);

        let marker: LivenessMarker =
            serde_json::from_str(&fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap()).unwrap();
        assert_eq!(marker.pid, std::process::id());
        assert_eq!(marker.session_id, session.session_id());
    }

    #[test]
    fn committed_turns_survive_a_restart() {
        let dir = tempdir().unwrap();
        let (mut session, _) = SessionManager::start(dir.path()).unwrap();
        session.commit_turn(turn(0, "first")).unwrap();
        session.commit_turn(turn(1, "second")).unwrap();
        session.shutdown(&HandoffSummary::default()).unwrap();

        let (session, report) = SessionManager::start(dir.path()).unwrap();
        assert_eq!(report.replayed, 2);
        assert!(report.recovery.is_none());
        assert_eq!(session.history()[1].user, "second");
        assert_eq!(session.next_index(), 2);
        assert!(session.session_turns().is_empty());
    }

    #[test]
    fn inspect_reads_without_claiming() {
        let dir = tempdir().unwrap();
        let (mut session, _) = SessionManager::start(dir.path()).unwrap();
        session.commit_turn(turn(0, "first")).unwrap();
        let history_path = dir.path().join(HISTORY_FILE);
        let mut file = OpenOptions::new().append(true).open(&history_path).unwrap();
        file.write_all(b"{\"index\":1").unwrap();
        let before = fs::read_to_string(&history_path).unwrap();

        let snapshot = inspect(dir.path()).unwrap();
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(
            snapshot.running.map(|marker| marker.session_id),
            Some(session.session_id().to_string())
        );
        assert_eq!(snapshot.checkpoint.map(|c| c.turn_count), Some(1));
        assert_eq!(fs::read_to_string(&history_path).unwrap(), before);
    }

    #[test]
    fn release_removes_marker_without_handoff() {
        let dir = tempdir().unwrap();
        let (session, _) = SessionManager::start(dir.path()).unwrap();
        session.release().unwrap();
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(!dir.path().join(HANDOFF_FILE).exists());
        assert!(inspect(dir.path()).unwrap().running.is_none());
    }

    #[test]
    fn crash_offers_the_last_committed_turn() {
        let dir = tempdir().unwrap();
        let (mut session, first) = SessionManager::start(dir.path()).unwrap();
        session.commit_turn(turn(0, "first")).unwrap();
        session.commit_turn(turn(1, "second")).unwrap();
        drop(session);

        let (_session, report) = SessionManager::start(dir.path()).unwrap();
        let recovery = report.recovery.expect("crash should be detected");
        assert_eq!(recovery.previous_session, first.session_id);
        assert_eq!(recovery.last_turn.unwrap().user, "second");
        assert_eq!(recovery.checkpoint.unwrap().turn_count, 2);
    }

    #[test]
    fn truncated_trailing_record_is_dropped() {
        let dir = tempdir().unwrap();
        let (mut session, _) = SessionManager::start(dir.path()).unwrap();
        session.commit_turn(turn(0, "kept")).unwrap();
        drop(session);

        let path = dir.path().join(HISTORY_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"index":1,"user":"half"#).unwrap();
        drop(file);

        let (mut session, report) = SessionManager::start(dir.path()).unwrap();
        assert!(report.dropped_partial_record);
        assert_eq!(report.replayed, 1);
        session.commit_turn(turn(1, "next")).unwrap();
        drop(session);

        let (session, report) = SessionManager::start(dir.path()).unwrap();
        assert!(!report.dropped_partial_record);
        let users: Vec<&str> = session.history().iter().map(|t| t.user.as_str()).collect();
        assert_eq!(users, vec!["kept", "next"]);
    }

    #[test]
    fn corrupt_complete_line_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(HISTORY_FILE), "not json\n").unwrap();
        let err = SessionManager::start(dir.path()).unwrap_err();
        assert!(matches!(err, SessionError::CorruptHistory { line: 1, .. }));
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn live_foreign_marker_refuses_to_start() {
        let dir = tempdir().unwrap();
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let marker = LivenessMarker {
            session_id: "session_other".to_string(),
            pid: child.id(),
            started_at: Utc::now(),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_string(&marker).unwrap()).unwrap();

        let result = SessionManager::start(dir.path());
        let _ = child.kill();
        let _ = child.wait();
        assert!(matches!(
            result,
            Err(SessionError::AlreadyRunning { pid, .. }) if pid == marker.pid
        ));
    }

    #[test]
    fn discard_archives_history() {
        let dir = tempdir().unwrap();
        let (mut session, _) = SessionManager::start(dir.path()).unwrap();
        session.commit_turn(turn(0, "old")).unwrap();
        let archive = session.discard_history().unwrap().unwrap();
        assert!(archive.exists());
        assert!(!dir.path().join(HISTORY_FILE).exists());
        assert!(session.history().is_empty());
        assert_eq!(session.next_index(), 0);
    }

    #[test]
    fn shutdown_writes_handoff_and_clears_markers() {
        let dir = tempdir().unwrap();
        let (mut session, _) = SessionManager::start(dir.path()).unwrap();
        session.commit_turn(turn(0, "List files in src/")).unwrap();
        session.add_note("left off in src/");
        let handoff = session
            .shutdown(&HandoffSummary {
                credentials: Vec::new(),
                notes: vec!["resume tomorrow".to_string()],
            })
            .unwrap();

        let text = fs::read_to_string(handoff).unwrap();
        assert!(text.starts_with("# Session Handoff"));
        assert!(text.contains("**Turns**: 1 this session, 1 in history"));
        assert!(text.contains("- [x] List files in src/"));
        assert!(text.contains("- list_directory: 1"));
        assert!(text.contains("- left off in src/\n- resume tomorrow"));
        assert!(!dir.path().join(LOCK_FILE).exists());
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());
    }

    #[test]
    fn durations_read_naturally() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3_725), "1h 2m 5s");
    }
}
