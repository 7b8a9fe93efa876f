mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
mod sweeps;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use conflict::{
    check_availability, current_reservation, derive_table_status, first_blocking, is_expired,
    next_reservation,
};
pub use error::{EngineError, EntityKind};
pub use store::InMemoryStore;
pub use sweeps::ResetOutcome;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};

use crate::clock::Clock;
use crate::limits::{DEFAULT_DURATION_MINUTES, MAX_RESOLVE_ATTEMPTS};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedTableState = Arc<RwLock<TableState>>;
pub(crate) type TableGuard = OwnedRwLockWriteGuard<TableState>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued, then
/// flush and fsync once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Write and fsync the whole batch, or cut the file back to where it stood
/// before the batch so no half-written frame sits in front of later ones.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!(error = %e, "WAL rollback after failed batch failed");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The reservation manager. Every mutation is validated against the conflict
/// rules, written to the WAL, applied to the in-memory store, then announced
/// on the notify hub, in that order.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    /// Serializes admin changes to areas and tables (names, area links, deletes).
    pub(super) catalog_lock: Mutex<()>,
    pub(super) default_duration_minutes: u32,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        store.replay(&events);
        tracing::info!(
            events = events.len(),
            tables = store.table_count(),
            areas = store.area_count(),
            "store recovered from WAL"
        );

        Ok(Self {
            store,
            wal_tx,
            notify,
            clock,
            catalog_lock: Mutex::new(()),
            default_duration_minutes: DEFAULT_DURATION_MINUTES,
        })
    }

    pub fn with_default_duration(mut self, minutes: u32) -> Self {
        self.default_duration_minutes = minutes;
        self
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn default_duration_minutes(&self) -> u32 {
        self.default_duration_minutes
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply to every locked table the event touches, notify.
    pub(super) async fn persist_and_apply(
        &self,
        states: &mut [&mut TableState],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for ts in states.iter_mut() {
            self.store.apply_to_table(ts, event);
        }
        self.notify.publish(event);
        Ok(())
    }

    /// WAL-append, apply and notify for area-level events and table creation.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_catalog(event);
        self.notify.publish(event);
        Ok(())
    }

    pub(super) async fn lock_table(&self, id: TableId) -> Result<TableGuard, EngineError> {
        let rs = self
            .store
            .get_table(&id)
            .ok_or(EngineError::not_found(EntityKind::Table, id))?;
        let guard = rs.write_owned().await;
        if guard.retired {
            return Err(EngineError::not_found(EntityKind::Table, id));
        }
        Ok(guard)
    }

    /// Lock the table that holds reservation `id`. If the reservation moved
    /// while we waited for the lock, re-resolve a bounded number of times.
    pub(super) async fn lock_reservation(
        &self,
        id: ReservationId,
    ) -> Result<TableGuard, EngineError> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let table_id = self
                .store
                .table_for_reservation(&id)
                .ok_or(EngineError::not_found(EntityKind::Reservation, id))?;
            let guard = match self.lock_table(table_id).await {
                Ok(g) => g,
                Err(EngineError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if guard.reservation(id).is_some() {
                return Ok(guard);
            }
        }
        Err(EngineError::ConcurrencyConflict {
            kind: EntityKind::Reservation,
            id,
        })
    }

    /// Lock the reservation's current table and `target`, in ascending id
    /// order. Returns `(source, Some(target))` for a move, `(source, None)`
    /// when the target is the same table.
    pub(super) async fn lock_reservation_with_target(
        &self,
        id: ReservationId,
        target: TableId,
    ) -> Result<(TableGuard, Option<TableGuard>), EngineError> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let source_id = self
                .store
                .table_for_reservation(&id)
                .ok_or(EngineError::not_found(EntityKind::Reservation, id))?;
            if source_id == target {
                let guard = match self.lock_table(source_id).await {
                    Ok(g) => g,
                    Err(EngineError::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                };
                if guard.reservation(id).is_some() {
                    return Ok((guard, None));
                }
                continue;
            }

            let (source, target_guard) = if source_id < target {
                let source = self.lock_table(source_id).await;
                let target_guard = self.lock_table(target).await?;
                (source, target_guard)
            } else {
                let target_guard = self.lock_table(target).await?;
                let source = self.lock_table(source_id).await;
                (source, target_guard)
            };
            match source {
                Ok(source) if source.reservation(id).is_some() => {
                    return Ok((source, Some(target_guard)));
                }
                Ok(_) | Err(EngineError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::ConcurrencyConflict {
            kind: EntityKind::Reservation,
            id,
        })
    }

    /// Bring a non-override table's status in line with its reservations.
    pub(super) async fn settle_table_status(
        &self,
        ts: &mut TableState,
        now: NaiveDateTime,
    ) -> Result<bool, EngineError> {
        if ts.table.status.is_override() {
            return Ok(false);
        }
        let derived = derive_table_status(ts, now);
        if derived == ts.table.status {
            return Ok(false);
        }
        self.set_table_status(ts, derived).await?;
        Ok(true)
    }

    /// Status follow-up to a reservation change that is already committed.
    /// A failure here leaves the change in place; the table is re-derived
    /// by the next expiry sweep's refresh pass.
    pub(super) async fn settle_after_commit(&self, ts: &mut TableState, now: NaiveDateTime) {
        if let Err(e) = self.settle_table_status(ts, now).await {
            tracing::warn!(table_id = ts.table.id, error = %e, "table status not settled after commit");
        }
    }

    pub(super) async fn set_table_status(
        &self,
        ts: &mut TableState,
        status: TableStatus,
    ) -> Result<(), EngineError> {
        let event = Event::TableStatusChanged {
            table_id: ts.table.id,
            status,
        };
        self.persist_and_apply(&mut [&mut *ts], &event).await?;
        tracing::debug!(table_id = ts.table.id, %status, "table status changed");
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Holds the catalog lock and a read lock on every table until the swap is
    /// done, so no event can land in the old file after its snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut events: Vec<Event> = self
            .store
            .areas()
            .into_iter()
            .map(|area| Event::AreaCreated { area })
            .collect();

        let mut guards = Vec::new();
        let mut reservations = Vec::new();
        for table_id in self.store.table_ids() {
            let Some(rs) = self.store.get_table(&table_id) else {
                continue;
            };
            let guard = rs.read_owned().await;
            if guard.retired {
                continue;
            }
            events.push(Event::TableCreated {
                table: guard.table.clone(),
            });
            reservations.extend(guard.reservations.iter().cloned());
            guards.push(guard);
        }
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationCreated { reservation }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
