use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::model::*;

use super::SharedTableState;

/// Durable state as it lives in memory: areas, per-table state behind its own
/// lock, and the lookup indexes. Only `Engine` mutates it, and only after the
/// matching event is in the WAL.
pub struct InMemoryStore {
    tables: DashMap<TableId, SharedTableState>,
    areas: DashMap<AreaId, Area>,
    reservation_to_table: DashMap<ReservationId, TableId>,
    area_tables: DashMap<AreaId, Vec<TableId>>,
    table_names: DashMap<String, TableId>,
    area_names: DashMap<String, AreaId>,
    next_area_id: AtomicU64,
    next_table_id: AtomicU64,
    next_reservation_id: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Names are unique ignoring case and surrounding whitespace.
pub(crate) fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            areas: DashMap::new(),
            reservation_to_table: DashMap::new(),
            area_tables: DashMap::new(),
            table_names: DashMap::new(),
            area_names: DashMap::new(),
            next_area_id: AtomicU64::new(1),
            next_table_id: AtomicU64::new(1),
            next_reservation_id: AtomicU64::new(1),
        }
    }

    // ── Id allocation ────────────────────────────────────────

    pub fn allocate_area_id(&self) -> AreaId {
        self.next_area_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn allocate_table_id(&self) -> TableId {
        self.next_table_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn allocate_reservation_id(&self) -> ReservationId {
        self.next_reservation_id.fetch_add(1, Ordering::Relaxed)
    }

    // ── Areas ────────────────────────────────────────────────

    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    pub fn get_area(&self, id: &AreaId) -> Option<Area> {
        self.areas.get(id).map(|e| e.value().clone())
    }

    pub fn contains_area(&self, id: &AreaId) -> bool {
        self.areas.contains_key(id)
    }

    pub fn areas(&self) -> Vec<Area> {
        let mut areas: Vec<Area> = self.areas.iter().map(|e| e.value().clone()).collect();
        areas.sort_by_key(|a| a.id);
        areas
    }

    /// Owner of `name` among areas, if any.
    pub fn area_named(&self, name: &str) -> Option<AreaId> {
        self.area_names.get(&name_key(name)).map(|e| *e.value())
    }

    pub fn tables_in_area(&self, area_id: &AreaId) -> Vec<TableId> {
        self.area_tables
            .get(area_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Tables ───────────────────────────────────────────────

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn get_table(&self, id: &TableId) -> Option<SharedTableState> {
        self.tables.get(id).map(|e| e.value().clone())
    }

    /// All table ids in ascending order (the lock order for multi-table work).
    pub fn table_ids(&self) -> Vec<TableId> {
        let mut ids: Vec<TableId> = self.tables.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn table_named(&self, name: &str) -> Option<TableId> {
        self.table_names.get(&name_key(name)).map(|e| *e.value())
    }

    /// Unlink a retired table from every index. Caller holds its write lock.
    pub fn remove_table(&self, ts: &TableState) {
        let id = ts.table.id;
        self.tables.remove(&id);
        self.table_names.remove(&name_key(&ts.table.name));
        if let Some(area_id) = ts.table.area_id {
            self.detach_from_area(area_id, id);
        }
        for r in &ts.reservations {
            self.reservation_to_table.remove(&r.id);
        }
    }

    fn detach_from_area(&self, area_id: AreaId, table_id: TableId) {
        if let Some(mut ids) = self.area_tables.get_mut(&area_id) {
            ids.retain(|t| *t != table_id);
        }
    }

    // ── Reservation index ────────────────────────────────────

    pub fn table_for_reservation(&self, id: &ReservationId) -> Option<TableId> {
        self.reservation_to_table.get(id).map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Apply an area-level or table-creation event. Table-scoped events go
    /// through `apply_to_table` under the table's lock instead.
    pub fn apply_catalog(&self, event: &Event) {
        match event {
            Event::AreaCreated { area } => {
                self.next_area_id.fetch_max(area.id + 1, Ordering::Relaxed);
                self.area_names.insert(name_key(&area.name), area.id);
                self.areas.insert(area.id, area.clone());
            }
            Event::AreaUpdated { area } => {
                if let Some(old) = self.areas.insert(area.id, area.clone()) {
                    self.area_names.remove(&name_key(&old.name));
                }
                self.area_names.insert(name_key(&area.name), area.id);
            }
            Event::AreaDeleted { id } => {
                if let Some((_, old)) = self.areas.remove(id) {
                    self.area_names.remove(&name_key(&old.name));
                }
                self.area_tables.remove(id);
            }
            Event::TableCreated { table } => {
                self.next_table_id.fetch_max(table.id + 1, Ordering::Relaxed);
                self.table_names.insert(name_key(&table.name), table.id);
                if let Some(area_id) = table.area_id {
                    self.area_tables.entry(area_id).or_default().push(table.id);
                }
                self.tables
                    .insert(table.id, Arc::new(RwLock::new(TableState::new(table.clone()))));
            }
            _ => {}
        }
    }

    /// Apply a table-scoped event to `ts`. The caller holds the write lock.
    /// Moves are applied once to the source table and once to the target.
    pub fn apply_to_table(&self, ts: &mut TableState, event: &Event) {
        match event {
            Event::TableUpdated { table } => {
                let old = std::mem::replace(&mut ts.table, table.clone());
                if name_key(&old.name) != name_key(&table.name) {
                    self.table_names.remove(&name_key(&old.name));
                    self.table_names.insert(name_key(&table.name), table.id);
                }
                if old.area_id != table.area_id {
                    if let Some(area_id) = old.area_id {
                        self.detach_from_area(area_id, table.id);
                    }
                    if let Some(area_id) = table.area_id {
                        self.area_tables.entry(area_id).or_default().push(table.id);
                    }
                }
            }
            Event::TableDeleted { .. } => {
                ts.retired = true;
                self.remove_table(ts);
            }
            Event::TableStatusChanged { status, .. } => {
                ts.table.status = *status;
            }
            Event::ReservationCreated { reservation } => {
                self.next_reservation_id
                    .fetch_max(reservation.id + 1, Ordering::Relaxed);
                self.reservation_to_table
                    .insert(reservation.id, reservation.table_id);
                ts.insert_reservation(reservation.clone());
            }
            Event::ReservationUpdated {
                previous_table_id,
                reservation,
            } => {
                if ts.table.id == *previous_table_id {
                    ts.remove_reservation(reservation.id);
                }
                if ts.table.id == reservation.table_id {
                    ts.remove_reservation(reservation.id);
                    ts.insert_reservation(reservation.clone());
                    self.reservation_to_table
                        .insert(reservation.id, reservation.table_id);
                }
            }
            Event::ReservationStatusChanged {
                id, to, reason, at, ..
            } => {
                if let Some(r) = ts.reservation_mut(*id) {
                    r.status = *to;
                    r.updated_at = *at;
                    if matches!(to, ReservationStatus::Cancelled | ReservationStatus::NoShow) {
                        r.cancel_reason = reason.clone();
                    }
                }
            }
            Event::AreaCreated { .. }
            | Event::AreaUpdated { .. }
            | Event::AreaDeleted { .. }
            | Event::TableCreated { .. } => {}
        }
    }

    /// Rebuild state from a replayed WAL. We are the sole owner of every lock
    /// here, so `try_write` always succeeds; never block inside a runtime.
    pub fn replay(&self, events: &[Event]) {
        for event in events {
            match event {
                Event::AreaCreated { .. }
                | Event::AreaUpdated { .. }
                | Event::AreaDeleted { .. }
                | Event::TableCreated { .. } => self.apply_catalog(event),
                other => {
                    for table_id in other.table_ids() {
                        let Some(rs) = self.get_table(&table_id) else {
                            continue;
                        };
                        match rs.try_write() {
                            Ok(mut guard) => self.apply_to_table(&mut guard, other),
                            Err(_) => tracing::warn!(table_id, "replay: table lock contended, event skipped"),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn table(id: TableId, name: &str, area_id: Option<AreaId>) -> Table {
        Table {
            id,
            name: name.into(),
            capacity: 4,
            area_id,
            location: None,
            status: TableStatus::Empty,
        }
    }

    fn reservation(id: ReservationId, table_id: TableId) -> Reservation {
        let created = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        Reservation {
            id,
            table_id,
            customer_ref: Some("cust-42".into()),
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            start_time: NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
            duration_minutes: 120,
            party_size: 3,
            status: ReservationStatus::Booked,
            customer_name: "Noor".into(),
            customer_phone: "555-0199".into(),
            note: Some("birthday".into()),
            cancel_reason: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn replay_rebuilds_indexes_and_counters() {
        let store = InMemoryStore::new();
        store.replay(&[
            Event::AreaCreated {
                area: Area {
                    id: 4,
                    name: "Rooftop".into(),
                    description: None,
                    image_ref: None,
                    video_ref: None,
                    status: AreaStatus::Active,
                },
            },
            Event::TableCreated {
                table: table(7, "R1", Some(4)),
            },
            Event::ReservationCreated {
                reservation: reservation(11, 7),
            },
        ]);

        assert_eq!(store.area_named("  rooftop "), Some(4));
        assert_eq!(store.table_named("r1"), Some(7));
        assert_eq!(store.tables_in_area(&4), vec![7]);
        assert_eq!(store.table_for_reservation(&11), Some(7));
        assert_eq!(store.allocate_area_id(), 5);
        assert_eq!(store.allocate_table_id(), 8);
        assert_eq!(store.allocate_reservation_id(), 12);
    }

    #[test]
    fn replay_applies_moves_to_both_tables() {
        let store = InMemoryStore::new();
        let mut moved = reservation(1, 2);
        moved.start_time = NaiveTime::from_hms_opt(20, 0, 0).unwrap();
        store.replay(&[
            Event::TableCreated { table: table(1, "A", None) },
            Event::TableCreated { table: table(2, "B", None) },
            Event::ReservationCreated { reservation: reservation(1, 1) },
            Event::ReservationUpdated {
                previous_table_id: 1,
                reservation: moved.clone(),
            },
        ]);

        let a = store.get_table(&1).unwrap();
        let b = store.get_table(&2).unwrap();
        assert!(a.try_read().unwrap().reservations.is_empty());
        assert_eq!(b.try_read().unwrap().reservations, vec![moved]);
        assert_eq!(store.table_for_reservation(&1), Some(2));
    }

    #[test]
    fn table_rename_and_area_move_update_indexes() {
        let store = InMemoryStore::new();
        store.apply_catalog(&Event::TableCreated {
            table: table(1, "A", Some(1)),
        });
        let rs = store.get_table(&1).unwrap();
        let mut guard = rs.try_write().unwrap();
        store.apply_to_table(
            &mut guard,
            &Event::TableUpdated {
                table: table(1, "Patio 1", Some(2)),
            },
        );
        assert_eq!(store.table_named("A"), None);
        assert_eq!(store.table_named("patio 1"), Some(1));
        assert!(store.tables_in_area(&1).is_empty());
        assert_eq!(store.tables_in_area(&2), vec![1]);
    }

    #[test]
    fn deleting_table_retires_state() {
        let store = InMemoryStore::new();
        store.replay(&[
            Event::TableCreated { table: table(3, "Bar", None) },
            Event::ReservationCreated { reservation: reservation(5, 3) },
        ]);
        let rs = store.get_table(&3).unwrap();
        let mut guard = rs.try_write().unwrap();
        store.apply_to_table(&mut guard, &Event::TableDeleted { id: 3 });
        assert!(guard.retired);
        assert!(store.get_table(&3).is_none());
        assert_eq!(store.table_named("bar"), None);
        assert_eq!(store.table_for_reservation(&5), None);
    }

    #[test]
    fn status_change_records_cancel_reason() {
        let store = InMemoryStore::new();
        store.replay(&[
            Event::TableCreated { table: table(1, "A", None) },
            Event::ReservationCreated { reservation: reservation(1, 1) },
        ]);
        let rs = store.get_table(&1).unwrap();
        let mut guard = rs.try_write().unwrap();
        let at = NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        store.apply_to_table(
            &mut guard,
            &Event::ReservationStatusChanged {
                id: 1,
                table_id: 1,
                from: ReservationStatus::Booked,
                to: ReservationStatus::Cancelled,
                reason: Some("guest called".into()),
                at,
            },
        );
        let r = guard.reservation(1).unwrap();
        assert_eq!(r.status, ReservationStatus::Cancelled);
        assert_eq!(r.cancel_reason.as_deref(), Some("guest called"));
        assert_eq!(r.updated_at, at);
    }
}
