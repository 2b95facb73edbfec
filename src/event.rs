//! Run event stream
//!
//! The coordinator emits [`RunEvent`]s in causal order on an unbounded
//! channel. Consumers may drop events but must not reorder them. Events
//! serialize to server-sent-event frames (`data: <json>\n\n`); serde_json
//! leaves non-ASCII characters unescaped, as the transport requires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::graph::StageName;
use crate::state::ResearchState;

/// One event on the run stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StageStart {
        stage: StageName,
    },
    StageEnd {
        stage: StageName,
        duration_ms: u64,
    },
    /// Analyzer trace line; one per research iteration.
    Thought {
        text: String,
    },
    FindingAdded {
        url: String,
    },
    /// Writer output token, forwarded as it arrives.
    PartialReportToken {
        text: String,
    },
    Done {
        state: Box<ResearchState>,
    },
    Error {
        kind: String,
        detail: String,
    },
    /// Stream terminator.
    End,
}

impl RunEvent {
    /// Encode as one SSE frame.
    pub fn to_sse_frame(&self) -> String {
        // RunEvent contains no map with non-string keys, so serialization
        // cannot fail.
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {json}\n\n")
    }
}

/// Sending half of the event stream. Emission never fails: once the
/// consumer is gone, events are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventSink {
    /// Create a sink and its receiving half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    pub fn thought(&self, text: impl Into<String>) {
        self.emit(RunEvent::Thought { text: text.into() });
    }

    pub fn finding_added(&self, url: impl Into<String>) {
        self.emit(RunEvent::FindingAdded { url: url.into() });
    }

    pub fn report_token(&self, text: impl Into<String>) {
        self.emit(RunEvent::PartialReportToken { text: text.into() });
    }
}

/// Cooperative cancellation token shared by every suspension point.
///
/// Cancellation is level-triggered: `cancelled()` resolves immediately if
/// the token was already cancelled, so it is safe inside `select!` arms.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake all waiters.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve when cancellation is requested.
    pub async fn cancelled(&self) {
        // Register before re-checking the flag so a cancel between the
        // check and the await cannot be missed.
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
