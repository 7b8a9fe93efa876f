use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::model::{Event, ExpiryReport, ResetReport, TableId};

const CHANNEL_CAPACITY: usize = 256;

/// Delivery attempts per notification before it is dropped.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Everything the core announces after a successful local commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "payload")]
pub enum Notification {
    Committed(Event),
    ExpirySwept(ExpiryReport),
    ResetSwept(ResetReport),
}

/// Broadcast hub: one channel carrying everything, plus lazily created
/// per-table channels for listeners that watch a single table.
pub struct NotifyHub {
    all: broadcast::Sender<Notification>,
    tables: DashMap<TableId, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            tables: DashMap::new(),
        }
    }

    /// Subscribe to one table's events. Creates the channel if needed.
    pub fn subscribe(&self, table_id: TableId) -> broadcast::Receiver<Notification> {
        self.tables
            .entry(table_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Fan a committed event out to the global channel and to every table it
    /// touches. No-op for channels nobody listens on.
    pub fn publish(&self, event: &Event) {
        let note = Notification::Committed(event.clone());
        for table_id in event.table_ids() {
            if let Some(sender) = self.tables.get(&table_id) {
                let _ = sender.send(note.clone());
            }
        }
        let _ = self.all.send(note);
    }

    pub fn publish_report(&self, note: Notification) {
        let _ = self.all.send(note);
    }

    /// Drop a table's channel once the table is gone.
    pub fn remove(&self, table_id: &TableId) {
        self.tables.remove(table_id);
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier unavailable: {0}")]
    Unavailable(String),
    #[error("could not encode notification: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outbound seam to an external table registry or messaging service.
/// Failures are logged by the forwarder and never roll anything back.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, note: &Notification) -> Result<(), NotifyError>;
}

/// Writes each notification as one JSON log line.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, note: &Notification) -> Result<(), NotifyError> {
        let json = serde_json::to_string(note)?;
        info!(target: "tablekeep::notify", "{json}");
        Ok(())
    }
}

async fn deliver_with_retry(notifier: &dyn Notifier, note: &Notification) -> bool {
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match notifier.deliver(note).await {
            Ok(()) => return true,
            Err(e) if attempt < MAX_DELIVERY_ATTEMPTS => {
                warn!(attempt, error = %e, "notification delivery failed, retrying");
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => {
                warn!(attempt, error = %e, "notification dropped");
            }
        }
    }
    false
}

/// Pump the hub's global channel into `notifier` until shutdown.
pub fn spawn_forwarder(
    hub: &NotifyHub,
    notifier: Arc<dyn Notifier>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = hub.subscribe_all();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(note) => {
                        if !deliver_with_retry(notifier.as_ref(), &note).await {
                            metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL)
                                .increment(1);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "notification forwarder lagged");
                        metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL)
                            .increment(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}
