//! Status events pushed to clients while a request is being resolved.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::resolver::search::Candidate;

/// One status update. Serialized with a `status` tag, e.g.
/// `{"status":"found","title":"...","duration_seconds":212.0,...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StreamStatusEvent {
    Searching {
        query: String,
    },
    Found {
        title: String,
        duration_seconds: Option<f64>,
        thumbnail_url: Option<String>,
    },
    #[serde(rename = "ready")]
    ReadyToStream {
        /// Direct media URL the client may play.
        locator: String,
        /// Path on this server that streams the same track.
        stream_path: String,
    },
    Error {
        message: String,
    },
}

impl StreamStatusEvent {
    pub fn found(candidate: &Candidate) -> Self {
        Self::Found {
            title: candidate.title.clone(),
            duration_seconds: candidate.duration_seconds,
            thumbnail_url: candidate.thumbnail_url.clone(),
        }
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Searching { .. } => "searching",
            Self::Found { .. } => "found",
            Self::ReadyToStream { .. } => "ready",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ReadyToStream { .. } | Self::Error { .. })
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Searching { .. } => 1,
            Self::Found { .. } => 2,
            Self::ReadyToStream { .. } => 3,
            Self::Error { .. } => 3,
        }
    }
}

/// Why an event was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedError {
    /// The event would break `searching -> found -> ready`, or a terminal
    /// event was already sent.
    OutOfOrder,
    /// The client is gone.
    Closed,
}

/// Sending side of a status stream. Enforces the event order
/// `searching -> found -> ready`, with `error` allowed at any point, and
/// exactly one terminal event.
#[derive(Debug)]
pub struct StatusFeed {
    tx: mpsc::Sender<StreamStatusEvent>,
    last_rank: u8,
    finished: bool,
}

impl StatusFeed {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamStatusEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                last_rank: 0,
                finished: false,
            },
            rx,
        )
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the client has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the client has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub async fn emit(&mut self, event: StreamStatusEvent) -> Result<(), FeedError> {
        let allowed = !self.finished
            && match &event {
                StreamStatusEvent::Error { .. } => true,
                other => other.rank() == self.last_rank + 1,
            };
        if !allowed {
            warn!(event = event.name(), "Dropping out-of-order status event");
            return Err(FeedError::OutOfOrder);
        }

        self.last_rank = event.rank();
        self.finished = event.is_terminal();
        self.tx.send(event).await.map_err(|_| FeedError::Closed)
    }
}
