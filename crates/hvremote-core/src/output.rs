//! Broadcast + history store for remote output lines.
//!
//! Elevated tasks report their output incrementally; this store lets a host
//! attach late, replay what was already emitted and then follow live lines.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default history size limit (16 MB).
const HISTORY_BYTES: usize = 16 * 1024 * 1024;

/// One unit of remote output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "line", rename_all = "snake_case")]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
    Finished,
}

impl OutputLine {
    fn approx_bytes(&self) -> usize {
        match self {
            Self::Stdout(s) | Self::Stderr(s) => s.len() + 8,
            Self::Finished => 8,
        }
    }
}

#[derive(Clone)]
struct StoredLine {
    line: OutputLine,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredLine>,
    total_bytes: usize,
    limit: usize,
}

/// Output store with broadcast and bounded history.
pub struct OutputLog {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<OutputLine>,
}

impl fmt::Debug for OutputLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("OutputLog")
            .field("lines", &inner.history.len())
            .field("bytes", &inner.total_bytes)
            .field("limit", &inner.limit)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputLog {
    /// Create a store with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(HISTORY_BYTES)
    }

    /// Create a store keeping at most `limit` bytes of history.
    #[must_use]
    pub fn with_history_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
                limit,
            }),
            sender,
        }
    }

    /// Push a line to both live listeners and history.
    pub fn push(&self, line: OutputLine) {
        let _ = self.sender.send(line.clone());
        let bytes = line.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        while inner.total_bytes.saturating_add(bytes) > inner.limit {
            let Some(front) = inner.history.pop_front() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
        }
        inner.history.push_back(StoredLine { line, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Push a stdout line.
    pub fn push_stdout<S: Into<String>>(&self, s: S) {
        self.push(OutputLine::Stdout(s.into()));
    }

    /// Push a stderr line.
    pub fn push_stderr<S: Into<String>>(&self, s: S) {
        self.push(OutputLine::Stderr(s.into()));
    }

    /// Mark the output as complete.
    pub fn push_finished(&self) {
        self.push(OutputLine::Finished);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OutputLine> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> Vec<OutputLine> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.line.clone())
            .collect()
    }

    /// Stream that yields history first, then live lines, until `Finished`.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, OutputLine> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));

        hist.chain(live)
            .take_while(|line| future::ready(!matches!(line, OutputLine::Finished)))
            .boxed()
    }

    /// Stream of stdout lines only.
    #[must_use]
    pub fn stdout_stream(&self) -> futures::stream::BoxStream<'static, String> {
        self.history_plus_stream()
            .filter_map(|line| async move {
                match line {
                    OutputLine::Stdout(s) => Some(s),
                    _ => None,
                }
            })
            .boxed()
    }

    /// Share this store.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}
