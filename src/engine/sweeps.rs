use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use tracing::debug;

use crate::model::*;

use super::conflict::{derive_table_status, is_expired};
use super::{Engine, EngineError};

/// Cancellation reason stamped on reservations the expiry sweep cancels.
pub const EXPIRY_REASON: &str = "auto-expired: not honoured within the grace period";

/// What the nightly reset did with one InService table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Reset,
    /// Left InService because this many Booked/Confirmed reservations are still to come.
    Kept { upcoming: usize },
    /// No longer InService by the time we got the lock.
    Skipped,
}

impl Engine {
    /// Expired reservations grouped by table. A snapshot: each one is
    /// re-checked under the table's write lock before it is touched.
    pub async fn collect_expired_reservations(
        &self,
        now: NaiveDateTime,
        grace_minutes: u32,
    ) -> BTreeMap<TableId, Vec<ReservationId>> {
        let mut expired = BTreeMap::new();
        for table_id in self.store.table_ids() {
            let Some(rs) = self.store.get_table(&table_id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            let ids: Vec<ReservationId> = guard
                .pending()
                .filter(|r| is_expired(r, now, grace_minutes))
                .map(|r| r.id)
                .collect();
            if !ids.is_empty() {
                expired.insert(table_id, ids);
            }
        }
        expired
    }

    /// Cancel the still-expired subset of `ids` on one table, then settle the
    /// table's status. Returns how many were cancelled.
    pub async fn expire_on_table(
        &self,
        table_id: TableId,
        ids: &[ReservationId],
        now: NaiveDateTime,
        grace_minutes: u32,
    ) -> Result<usize, EngineError> {
        let mut guard = match self.lock_table(table_id).await {
            Ok(g) => g,
            Err(EngineError::NotFound { .. }) => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut cancelled = 0;
        for &id in ids {
            let Some(from) = guard
                .reservation(id)
                .filter(|r| is_expired(r, now, grace_minutes))
                .map(|r| r.status)
            else {
                debug!(reservation_id = id, table_id, "expiry skip: changed since snapshot");
                continue;
            };
            let event = Event::ReservationStatusChanged {
                id,
                table_id,
                from,
                to: ReservationStatus::Cancelled,
                reason: Some(EXPIRY_REASON.to_string()),
                at: now,
            };
            self.persist_and_apply(&mut [&mut *guard], &event).await?;
            cancelled += 1;
        }

        self.settle_table_status(&mut guard, now).await?;
        Ok(cancelled)
    }

    /// Re-derive every non-override table's status at `now`. Returns the
    /// number of tables whose status moved.
    ///
    /// Only tables whose status drifted are write-locked. A table that is
    /// locked by an in-flight mutation is skipped: that mutation settles it,
    /// and the next pass looks again.
    pub async fn refresh_derived_statuses(&self, now: NaiveDateTime) -> Result<usize, EngineError> {
        let mut changed = 0;
        for table_id in self.tables_needing_refresh(now) {
            let mut guard = match self.lock_table(table_id).await {
                Ok(g) => g,
                Err(EngineError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if self.settle_table_status(&mut guard, now).await? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn tables_needing_refresh(&self, now: NaiveDateTime) -> Vec<TableId> {
        let mut ids = Vec::new();
        for table_id in self.store.table_ids() {
            let Some(rs) = self.store.get_table(&table_id) else {
                continue;
            };
            let Ok(guard) = rs.try_read() else {
                debug!(table_id, "refresh skip: table busy");
                continue;
            };
            if !guard.retired
                && !guard.table.status.is_override()
                && derive_table_status(&guard, now) != guard.table.status
            {
                ids.push(table_id);
            }
        }
        ids
    }

    /// Ids of tables currently showing `status`, sorted.
    pub async fn tables_with_status(&self, status: TableStatus) -> Vec<TableId> {
        let mut ids = Vec::new();
        for table_id in self.store.table_ids() {
            let Some(rs) = self.store.get_table(&table_id) else {
                continue;
            };
            let guard = rs.read().await;
            if !guard.retired && guard.table.status == status {
                ids.push(table_id);
            }
        }
        ids
    }

    /// Smart reset of one table: InService becomes Empty unless a
    /// Booked/Confirmed reservation still starts after `now`.
    pub async fn reset_if_idle(
        &self,
        table_id: TableId,
        now: NaiveDateTime,
    ) -> Result<ResetOutcome, EngineError> {
        let mut guard = match self.lock_table(table_id).await {
            Ok(g) => g,
            Err(EngineError::NotFound { .. }) => return Ok(ResetOutcome::Skipped),
            Err(e) => return Err(e),
        };
        if guard.table.status != TableStatus::InService {
            return Ok(ResetOutcome::Skipped);
        }
        let upcoming = guard.pending().filter(|r| r.span().start > now).count();
        if upcoming > 0 {
            return Ok(ResetOutcome::Kept { upcoming });
        }
        self.set_table_status(&mut guard, TableStatus::Empty).await?;
        Ok(ResetOutcome::Reset)
    }
}
