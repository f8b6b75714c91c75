//! Usage analytics
//!
//! Events are handed to a sink and forgotten. `record` never blocks the
//! caller, and delivery failures stay inside this module apart from the
//! returned error, which callers only log.

use crate::db::Database;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Kind of usage event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageSent,
    MessageFailed,
    VoiceUsed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::MessageSent => write!(f, "message_sent"),
            EventKind::MessageFailed => write!(f, "message_failed"),
            EventKind::VoiceUsed => write!(f, "voice_used"),
        }
    }
}

/// One resolved exchange, with enough correlation data to find it again
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalyticsEvent {
    pub user_id: String,
    pub conversation_id: String,
    pub kind: EventKind,
    /// Assistant turn on success, user turn on failure
    pub sequence: i64,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
    /// Set for failures only
    pub retryable: Option<bool>,
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("Analytics queue is full, event dropped")]
    QueueFull,
    #[error("Analytics sink is closed")]
    Closed,
}

/// Destination for usage events
pub trait AnalyticsSink: Send + Sync {
    /// Accept an event and return immediately
    fn record(&self, event: AnalyticsEvent) -> Result<(), AnalyticsError>;
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AnalyticsSink for TracingSink {
    fn record(&self, event: AnalyticsEvent) -> Result<(), AnalyticsError> {
        tracing::info!(
            user_id = %event.user_id,
            conv_id = %event.conversation_id,
            kind = %event.kind,
            seq = event.sequence,
            latency_ms = event.latency_ms,
            retryable = ?event.retryable,
            "analytics event"
        );
        Ok(())
    }
}

/// Sink that queues events for a background writer
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<AnalyticsEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its queue
    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<AnalyticsEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Create a sink whose events are written to the database by a
    /// background task. The task drains what is queued and exits once
    /// `shutdown` is cancelled.
    pub fn spawn(
        db: Database,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sink, rx) = Self::with_capacity(capacity);
        let handle = tokio::spawn(run_writer(rx, db, shutdown));
        (sink, handle)
    }
}

impl AnalyticsSink for ChannelSink {
    fn record(&self, event: AnalyticsEvent) -> Result<(), AnalyticsError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AnalyticsError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => AnalyticsError::Closed,
        })
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<AnalyticsEvent>,
    db: Database,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            Some(event) = rx.recv() => write_event(&db, event).await,

            () = shutdown.cancelled() => {
                rx.close();
                while let Some(event) = rx.recv().await {
                    write_event(&db, event).await;
                }
                break;
            }

            else => break,
        }
    }
    tracing::info!("Analytics writer stopped");
}

async fn write_event(db: &Database, event: AnalyticsEvent) {
    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || db.insert_analytics_event(&event)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to persist analytics event"),
        Err(e) => tracing::warn!(error = %e, "Analytics write task failed"),
    }
}
