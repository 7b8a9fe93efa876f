use chrono::{NaiveDate, NaiveTime};
use tracing::info;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_booking_window, validate_duration};
use super::{Engine, EngineError, EntityKind};

fn validate_name(name: &str, what: &str) -> Result<String, EngineError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(EngineError::invalid(format!("{what} name must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(trimmed.to_string())
}

fn validate_text(text: &Option<String>) -> Result<(), EngineError> {
    if let Some(t) = text
        && t.len() > MAX_TEXT_LEN
    {
        return Err(EngineError::LimitExceeded("text field too long"));
    }
    Ok(())
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::invalid("table capacity must be positive"));
    }
    if capacity > MAX_TABLE_CAPACITY {
        return Err(EngineError::LimitExceeded("table capacity too large"));
    }
    Ok(())
}

fn validate_customer(name: &str, phone: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::invalid("customer name is required"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("customer name too long"));
    }
    let phone = phone.trim();
    if phone.is_empty() {
        return Err(EngineError::invalid("customer phone is required"));
    }
    if phone.len() > MAX_PHONE_LEN {
        return Err(EngineError::LimitExceeded("customer phone too long"));
    }
    if !phone
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | ' ' | '(' | ')'))
    {
        return Err(EngineError::invalid(format!("malformed phone number: {phone}")));
    }
    Ok(())
}

fn reject_party(party_size: u32, capacity: u32) -> Result<(), EngineError> {
    if party_size == 0 {
        return Err(EngineError::invalid("party size must be positive"));
    }
    if party_size > capacity {
        metrics::counter!(crate::observability::RESERVATION_REJECTIONS_TOTAL, "reason" => "capacity")
            .increment(1);
        return Err(EngineError::CapacityExceeded {
            party_size,
            capacity,
        });
    }
    Ok(())
}

fn reject_maintenance(table: &Table) -> Result<(), EngineError> {
    if table.status == TableStatus::Maintenance {
        metrics::counter!(crate::observability::RESERVATION_REJECTIONS_TOTAL, "reason" => "maintenance")
            .increment(1);
        return Err(EngineError::invalid(format!(
            "table {} is under maintenance",
            table.name
        )));
    }
    Ok(())
}

fn conflict_metric(result: Result<(), EngineError>) -> Result<(), EngineError> {
    if let Err(EngineError::SlotConflict { .. }) = &result {
        metrics::counter!(crate::observability::RESERVATION_REJECTIONS_TOTAL, "reason" => "slot_conflict")
            .increment(1);
    }
    result
}

impl Engine {
    // ── Areas ────────────────────────────────────────────────

    pub async fn create_area(&self, new: NewArea) -> Result<Area, EngineError> {
        let name = validate_name(&new.name, "area")?;
        validate_text(&new.description)?;
        validate_text(&new.image_ref)?;
        validate_text(&new.video_ref)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.store.area_count() >= MAX_AREAS {
            return Err(EngineError::LimitExceeded("too many areas"));
        }
        if self.store.area_named(&name).is_some() {
            return Err(EngineError::DuplicateName(name));
        }

        let area = Area {
            id: self.store.allocate_area_id(),
            name,
            description: new.description,
            image_ref: new.image_ref,
            video_ref: new.video_ref,
            status: new.status.unwrap_or(AreaStatus::Active),
        };
        self.persist_catalog(&Event::AreaCreated { area: area.clone() })
            .await?;
        info!(area_id = area.id, name = %area.name, "area created");
        Ok(area)
    }

    pub async fn update_area(&self, id: AreaId, patch: AreaPatch) -> Result<Area, EngineError> {
        validate_text(&patch.description)?;
        validate_text(&patch.image_ref)?;
        validate_text(&patch.video_ref)?;

        let _catalog = self.catalog_lock.lock().await;
        let mut area = self
            .store
            .get_area(&id)
            .ok_or(EngineError::not_found(EntityKind::Area, id))?;
        if let Some(name) = patch.name {
            let name = validate_name(&name, "area")?;
            if self.store.area_named(&name).is_some_and(|owner| owner != id) {
                return Err(EngineError::DuplicateName(name));
            }
            area.name = name;
        }
        if patch.description.is_some() {
            area.description = patch.description;
        }
        if patch.image_ref.is_some() {
            area.image_ref = patch.image_ref;
        }
        if patch.video_ref.is_some() {
            area.video_ref = patch.video_ref;
        }
        if let Some(status) = patch.status {
            area.status = status;
        }

        self.persist_catalog(&Event::AreaUpdated { area: area.clone() })
            .await?;
        Ok(area)
    }

    pub async fn delete_area(&self, id: AreaId) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.store.contains_area(&id) {
            return Err(EngineError::not_found(EntityKind::Area, id));
        }
        let tables = self.store.tables_in_area(&id);
        if !tables.is_empty() {
            return Err(EngineError::InUse {
                kind: EntityKind::Area,
                id,
                reason: format!("{} table(s) still belong to it", tables.len()),
            });
        }
        self.persist_catalog(&Event::AreaDeleted { id }).await?;
        info!(area_id = id, "area deleted");
        Ok(())
    }

    // ── Tables ───────────────────────────────────────────────

    pub async fn create_table(&self, new: NewTable) -> Result<Table, EngineError> {
        let name = validate_name(&new.name, "table")?;
        validate_capacity(new.capacity)?;
        validate_text(&new.location)?;

        let _catalog = self.catalog_lock.lock().await;
        if self.store.table_count() >= MAX_TABLES {
            return Err(EngineError::LimitExceeded("too many tables"));
        }
        if self.store.table_named(&name).is_some() {
            return Err(EngineError::DuplicateName(name));
        }
        if let Some(area_id) = new.area_id
            && !self.store.contains_area(&area_id)
        {
            return Err(EngineError::not_found(EntityKind::Area, area_id));
        }

        let table = Table {
            id: self.store.allocate_table_id(),
            name,
            capacity: new.capacity,
            area_id: new.area_id,
            location: new.location,
            status: TableStatus::Empty,
        };
        self.persist_catalog(&Event::TableCreated {
            table: table.clone(),
        })
        .await?;
        info!(table_id = table.id, name = %table.name, capacity = table.capacity, "table created");
        Ok(table)
    }

    pub async fn update_table(&self, id: TableId, patch: TablePatch) -> Result<Table, EngineError> {
        validate_text(&patch.location)?;

        let _catalog = self.catalog_lock.lock().await;
        let mut guard = self.lock_table(id).await?;
        let mut table = guard.table.clone();

        if let Some(name) = patch.name {
            let name = validate_name(&name, "table")?;
            if self.store.table_named(&name).is_some_and(|owner| owner != id) {
                return Err(EngineError::DuplicateName(name));
            }
            table.name = name;
        }
        if let Some(capacity) = patch.capacity {
            validate_capacity(capacity)?;
            if let Some(r) = guard.pending().find(|r| r.party_size > capacity) {
                return Err(EngineError::InUse {
                    kind: EntityKind::Table,
                    id,
                    reason: format!(
                        "reservation {} needs {} seats",
                        r.id, r.party_size
                    ),
                });
            }
            table.capacity = capacity;
        }
        if let Some(area_id) = patch.area_id {
            if let Some(a) = area_id
                && !self.store.contains_area(&a)
            {
                return Err(EngineError::not_found(EntityKind::Area, a));
            }
            table.area_id = area_id;
        }
        if patch.location.is_some() {
            table.location = patch.location;
        }

        let event = Event::TableUpdated {
            table: table.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        Ok(table)
    }

    /// Delete a table. Blocked while Booked/Confirmed reservations reference it.
    pub async fn delete_table(&self, id: TableId) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut guard = self.lock_table(id).await?;
        let active = guard.pending().count();
        if active > 0 {
            return Err(EngineError::InUse {
                kind: EntityKind::Table,
                id,
                reason: format!("{active} active reservation(s)"),
            });
        }
        self.persist_and_apply(&mut [&mut *guard], &Event::TableDeleted { id })
            .await?;
        self.notify.remove(&id);
        info!(table_id = id, "table deleted");
        Ok(())
    }

    /// Put a table under maintenance, or lift it back to its derived status.
    pub async fn set_maintenance(&self, id: TableId, on: bool) -> Result<Table, EngineError> {
        let mut guard = self.lock_table(id).await?;
        let now = self.clock.now();
        match (on, guard.table.status) {
            (true, TableStatus::Maintenance) | (false, TableStatus::Empty | TableStatus::Reserved) => {}
            (true, _) => {
                self.set_table_status(&mut guard, TableStatus::Maintenance)
                    .await?;
                info!(table_id = id, "table under maintenance");
            }
            (false, TableStatus::InService) => {
                return Err(EngineError::invalid(format!(
                    "table {} is in service, not under maintenance",
                    guard.table.name
                )));
            }
            (false, TableStatus::Maintenance) => {
                let derived = super::derive_table_status(&guard, now);
                self.set_table_status(&mut guard, derived).await?;
                info!(table_id = id, %derived, "table back from maintenance");
            }
        }
        Ok(guard.table.clone())
    }

    /// The party left: an InService table returns to its derived status.
    pub async fn release_table(&self, id: TableId) -> Result<Table, EngineError> {
        let mut guard = self.lock_table(id).await?;
        if guard.table.status != TableStatus::InService {
            return Err(EngineError::invalid(format!(
                "table {} is {}, not in service",
                guard.table.name, guard.table.status
            )));
        }
        let derived = super::derive_table_status(&guard, self.clock.now());
        self.set_table_status(&mut guard, derived).await?;
        info!(table_id = id, %derived, "table released");
        Ok(guard.table.clone())
    }

    // ── Reservations ─────────────────────────────────────────

    /// Book a table. The availability check and the insert run under the
    /// table's write lock, so two overlapping requests cannot both succeed.
    pub async fn create_reservation(&self, req: NewReservation) -> Result<Reservation, EngineError> {
        let duration = req.duration_minutes.unwrap_or(self.default_duration_minutes);
        validate_duration(duration)?;
        validate_customer(&req.customer.name, &req.customer.phone)?;
        validate_text(&req.customer.note)?;
        validate_text(&req.customer.customer_ref)?;
        let span = Span::from_slot(req.date, req.start_time, duration);

        let mut guard = self.lock_table(req.table_id).await?;
        let now = self.clock.now();
        validate_booking_window(&span, now)?;
        reject_maintenance(&guard.table)?;
        reject_party(req.party_size, guard.table.capacity)?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_TABLE {
            return Err(EngineError::LimitExceeded("too many reservations on table"));
        }
        conflict_metric(check_no_conflict(&guard, &span, None))?;

        let reservation = Reservation {
            id: self.store.allocate_reservation_id(),
            table_id: req.table_id,
            customer_ref: req.customer.customer_ref,
            date: req.date,
            start_time: req.start_time,
            duration_minutes: duration,
            party_size: req.party_size,
            status: ReservationStatus::Booked,
            customer_name: req.customer.name.trim().to_string(),
            customer_phone: req.customer.phone.trim().to_string(),
            note: req.customer.note,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        self.settle_after_commit(&mut guard, now).await;

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        info!(
            reservation_id = reservation.id,
            table_id = reservation.table_id,
            start = %span.start,
            party = reservation.party_size,
            "reservation booked"
        );
        Ok(reservation)
    }

    /// Edit a Booked/Confirmed reservation. Changing its table, date, time or
    /// duration re-runs the conflict check against the target table, ignoring
    /// the reservation's own window.
    pub async fn update_reservation(
        &self,
        id: ReservationId,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        validate_text(&patch.note)?;
        validate_text(&patch.customer_ref)?;
        if let Some(d) = patch.duration_minutes {
            validate_duration(d)?;
        }

        let (mut source, mut target) = match patch.table_id {
            Some(t) => self.lock_reservation_with_target(id, t).await?,
            None => (self.lock_reservation(id).await?, None),
        };
        let now = self.clock.now();
        let existing = source
            .reservation(id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Reservation, id))?;
        if existing.status.is_terminal() {
            return Err(EngineError::invalid(format!(
                "reservation {id} is {} and can no longer be edited",
                existing.status
            )));
        }

        let mut updated = existing.clone();
        if let Some(t) = patch.table_id {
            updated.table_id = t;
        }
        updated.date = patch.date.unwrap_or(existing.date);
        updated.start_time = patch.start_time.unwrap_or(existing.start_time);
        updated.duration_minutes = patch.duration_minutes.unwrap_or(existing.duration_minutes);
        updated.party_size = patch.party_size.unwrap_or(existing.party_size);
        if let Some(r) = patch.customer_ref {
            updated.customer_ref = Some(r);
        }
        if let Some(name) = patch.customer_name {
            updated.customer_name = name.trim().to_string();
        }
        if let Some(phone) = patch.customer_phone {
            updated.customer_phone = phone.trim().to_string();
        }
        if patch.note.is_some() {
            updated.note = patch.note;
        }
        validate_customer(&updated.customer_name, &updated.customer_phone)?;

        let destination = target.as_deref().unwrap_or(&*source);
        let moved_slot = updated.span() != existing.span() || updated.table_id != existing.table_id;
        if updated.table_id != existing.table_id {
            reject_maintenance(&destination.table)?;
        }
        reject_party(updated.party_size, destination.table.capacity)?;
        if moved_slot {
            validate_booking_window(&updated.span(), now)?;
            conflict_metric(check_no_conflict(destination, &updated.span(), Some(id)))?;
        }

        updated.updated_at = now;
        let event = Event::ReservationUpdated {
            previous_table_id: existing.table_id,
            reservation: updated.clone(),
        };
        match target.as_mut() {
            Some(target) => {
                self.persist_and_apply(&mut [&mut *source, &mut **target], &event)
                    .await?;
                self.settle_after_commit(target, now).await;
            }
            None => self.persist_and_apply(&mut [&mut *source], &event).await?,
        }
        self.settle_after_commit(&mut source, now).await;

        info!(
            reservation_id = id,
            table_id = updated.table_id,
            moved = moved_slot,
            "reservation updated"
        );
        Ok(updated)
    }

    /// Move a reservation through its lifecycle and apply the table side effects:
    /// Completed seats the party (InService); every other transition re-derives
    /// the table's status, which leaves overrides alone.
    pub async fn transition_status(
        &self,
        id: ReservationId,
        to: ReservationStatus,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        validate_text(&reason)?;
        let mut guard = self.lock_reservation(id).await?;
        let now = self.clock.now();
        let from = guard
            .reservation(id)
            .map(|r| r.status)
            .ok_or(EngineError::not_found(EntityKind::Reservation, id))?;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }

        let reason = match to {
            ReservationStatus::Cancelled => {
                Some(reason.unwrap_or_else(|| "cancelled without a reason".into()))
            }
            ReservationStatus::NoShow => Some(reason.unwrap_or_else(|| "no-show".into())),
            _ => None,
        };
        let event = Event::ReservationStatusChanged {
            id,
            table_id: guard.table.id,
            from,
            to,
            reason,
            at: now,
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;

        if to == ReservationStatus::Completed {
            if guard.table.status == TableStatus::Maintenance {
                tracing::warn!(
                    table_id = guard.table.id,
                    reservation_id = id,
                    "party seated at a table under maintenance"
                );
            } else if guard.table.status != TableStatus::InService
                && let Err(e) = self.set_table_status(&mut guard, TableStatus::InService).await
            {
                tracing::warn!(
                    table_id = guard.table.id,
                    reservation_id = id,
                    error = %e,
                    "party seated but table not marked in service"
                );
            }
        } else {
            self.settle_after_commit(&mut guard, now).await;
        }

        metrics::counter!(crate::observability::RESERVATION_TRANSITIONS_TOTAL, "to" => to.as_str())
            .increment(1);
        info!(reservation_id = id, table_id = guard.table.id, %from, %to, "reservation transitioned");
        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::not_found(EntityKind::Reservation, id))
    }

    pub async fn confirm(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        self.transition_status(id, ReservationStatus::Confirmed, None)
            .await
    }

    /// Party arrived and was seated.
    pub async fn complete(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        self.transition_status(id, ReservationStatus::Completed, None)
            .await
    }

    pub async fn cancel(
        &self,
        id: ReservationId,
        reason: impl Into<String>,
    ) -> Result<Reservation, EngineError> {
        self.transition_status(id, ReservationStatus::Cancelled, Some(reason.into()))
            .await
    }

    pub async fn mark_no_show(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        self.transition_status(id, ReservationStatus::NoShow, None)
            .await
    }

    /// Convenience for callers that hold a date and a time rather than a request.
    pub async fn book(
        &self,
        table_id: TableId,
        date: NaiveDate,
        start_time: NaiveTime,
        party_size: u32,
        customer: CustomerInfo,
    ) -> Result<Reservation, EngineError> {
        self.create_reservation(NewReservation {
            table_id,
            date,
            start_time,
            duration_minutes: None,
            party_size,
            customer,
        })
        .await
    }
}
