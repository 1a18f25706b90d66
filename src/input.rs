//! Console line input shared by the chat prompt and approval prompts.
//!
//! Reads run on the blocking pool. When the caller stops waiting (a turn is
//! cancelled while an approval prompt is open) the read keeps going in the
//! background; [`LineReader`] parks it and hands its line to the next caller
//! instead of letting it swallow the user's next input.

use std::sync::{Arc, Mutex};

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::task::JoinHandle;

/// Blocking line source, normally the terminal editor.
pub trait LineSource: Send + 'static {
    fn read_line(&mut self, prompt: &str) -> Result<String, ReadlineError>;

    fn add_history(&mut self, _line: &str) {}
}

impl LineSource for DefaultEditor {
    fn read_line(&mut self, prompt: &str) -> Result<String, ReadlineError> {
        self.readline(prompt)
    }

    fn add_history(&mut self, line: &str) {
        let _ = self.add_history_entry(line);
    }
}

type PendingRead = JoinHandle<Result<String, ReadlineError>>;

pub struct LineReader {
    source: Arc<Mutex<Box<dyn LineSource>>>,
    inflight: Mutex<Option<PendingRead>>,
}

impl LineReader {
    #[must_use]
    pub fn new(source: impl LineSource) -> Self {
        Self {
            source: Arc::new(Mutex::new(Box::new(source))),
            inflight: Mutex::new(None),
        }
    }

    /// Terminal editor with default settings.
    pub fn terminal() -> Result<Self, ReadlineError> {
        Ok(Self::new(DefaultEditor::new()?))
    }

    /// Next line of input. If an abandoned read is still waiting on the user,
    /// its line is returned and `prompt` is not shown again.
    pub async fn read_line(&self, prompt: &str) -> Result<String, ReadlineError> {
        let handle = match self.take_inflight() {
            Some(handle) => handle,
            None => {
                let source = Arc::clone(&self.source);
                let prompt = prompt.to_string();
                tokio::task::spawn_blocking(move || {
                    let mut source = source
                        .lock()
                        .map_err(|_| ReadlineError::Io(std::io::Error::other("line source poisoned")))?;
                    source.read_line(&prompt)
                })
            }
        };

        let mut pending = Parked {
            slot: &self.inflight,
            handle: Some(handle),
        };
        let Some(handle) = pending.handle.as_mut() else {
            return Err(ReadlineError::Eof);
        };
        let joined = handle.await;
        pending.handle = None;
        joined.map_err(|err| ReadlineError::Io(std::io::Error::other(err)))?
    }

    pub fn add_history(&self, line: &str) {
        if let Ok(mut source) = self.source.lock() {
            source.add_history(line);
        }
    }

    fn take_inflight(&self) -> Option<PendingRead> {
        self.inflight.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Puts an unfinished read back when the waiting future is dropped.
struct Parked<'a> {
    slot: &'a Mutex<Option<PendingRead>>,
    handle: Option<PendingRead>,
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Ok(mut slot) = self.slot.lock()
        {
            *slot = Some(handle);
        }
    }
}
