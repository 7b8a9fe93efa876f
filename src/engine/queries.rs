use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::limits::*;
use crate::model::*;

use super::availability::free_windows;
use super::conflict::{check_availability, derive_table_status, validate_duration};
use super::{Engine, EngineError, EntityKind};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMATS: [&str; 2] = ["%H:%M", "%H:%M:%S"];

impl SlotQuery {
    /// Parse a client-supplied date and time. Both are required; a missing
    /// or malformed value is a validation error, never "now".
    pub fn parse(
        date: Option<&str>,
        start_time: Option<&str>,
        duration_minutes: Option<u32>,
    ) -> Result<Self, EngineError> {
        let date = date
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::invalid("date is required"))?;
        let start_time = start_time
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::invalid("start time is required"))?;

        let date = NaiveDate::parse_from_str(date, DATE_FORMAT)
            .map_err(|_| EngineError::invalid(format!("malformed date: {date}")))?;
        let start_time = TIME_FORMATS
            .iter()
            .find_map(|f| NaiveTime::parse_from_str(start_time, f).ok())
            .ok_or_else(|| EngineError::invalid(format!("malformed time: {start_time}")))?;

        Ok(Self {
            date,
            start_time,
            duration_minutes,
        })
    }
}

impl Engine {
    fn resolve_span(&self, query: &SlotQuery) -> Result<Span, EngineError> {
        let minutes = query
            .duration_minutes
            .unwrap_or(self.default_duration_minutes);
        validate_duration(minutes)?;
        Ok(Span::from_slot(query.date, query.start_time, minutes))
    }

    async fn read_table<T>(
        &self,
        id: TableId,
        f: impl FnOnce(&TableState) -> T,
    ) -> Result<T, EngineError> {
        let rs = self
            .store
            .get_table(&id)
            .ok_or(EngineError::not_found(EntityKind::Table, id))?;
        let guard = rs.read().await;
        if guard.retired {
            return Err(EngineError::not_found(EntityKind::Table, id));
        }
        Ok(f(&guard))
    }

    /// Is the requested window free on this table? Also reports who sits
    /// there right now and who comes next.
    pub async fn check_availability(
        &self,
        table_id: TableId,
        query: SlotQuery,
    ) -> Result<Availability, EngineError> {
        let span = self.resolve_span(&query)?;
        let now = self.clock.now();
        self.read_table(table_id, |ts| check_availability(ts, &span, now, None))
            .await
    }

    /// Empty/Reserved value computed fresh from the reservation set.
    pub async fn derive_table_status(
        &self,
        table_id: TableId,
        as_of: NaiveDateTime,
    ) -> Result<TableStatus, EngineError> {
        self.read_table(table_id, |ts| derive_table_status(ts, as_of))
            .await
    }

    /// Open windows of at least `min_minutes` on `date`, for suggesting
    /// alternatives after a conflict.
    pub async fn free_windows(
        &self,
        table_id: TableId,
        date: NaiveDate,
        min_minutes: u32,
    ) -> Result<Vec<Span>, EngineError> {
        let day = Span::day(date);
        let windows = self
            .read_table(table_id, |ts| free_windows(ts, &day, None))
            .await?;
        Ok(windows
            .into_iter()
            .filter(|w| w.duration_minutes() >= i64::from(min_minutes))
            .collect())
    }

    // ── Tables and areas ─────────────────────────────────────

    pub async fn get_table(&self, id: TableId) -> Result<Table, EngineError> {
        self.read_table(id, |ts| ts.table.clone()).await
    }

    /// Tables sorted by id, optionally restricted to an area, each with an
    /// availability projection when a slot is given.
    pub async fn list_tables(
        &self,
        area_id: Option<AreaId>,
        projection: Option<SlotQuery>,
    ) -> Result<Vec<TableView>, EngineError> {
        let ids = match area_id {
            Some(a) => {
                if !self.store.contains_area(&a) {
                    return Err(EngineError::not_found(EntityKind::Area, a));
                }
                let mut ids = self.store.tables_in_area(&a);
                ids.sort_unstable();
                ids
            }
            None => self.store.table_ids(),
        };
        let span = projection.as_ref().map(|q| self.resolve_span(q)).transpose()?;
        let now = self.clock.now();

        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(rs) = self.store.get_table(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            views.push(TableView {
                table: guard.table.clone(),
                availability: span.map(|s| check_availability(&guard, &s, now, None)),
            });
        }
        Ok(views)
    }

    pub fn get_area(&self, id: AreaId) -> Result<Area, EngineError> {
        self.store
            .get_area(&id)
            .ok_or(EngineError::not_found(EntityKind::Area, id))
    }

    pub fn list_areas(&self) -> Vec<Area> {
        self.store.areas()
    }

    // ── Reservations ─────────────────────────────────────────

    pub async fn get_reservation(&self, id: ReservationId) -> Result<Reservation, EngineError> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let table_id = self
                .store
                .table_for_reservation(&id)
                .ok_or(EngineError::not_found(EntityKind::Reservation, id))?;
            let Some(rs) = self.store.get_table(&table_id) else {
                continue;
            };
            if let Some(r) = rs.read().await.reservation(id) {
                return Ok(r.clone());
            }
        }
        Err(EngineError::ConcurrencyConflict {
            kind: EntityKind::Reservation,
            id,
        })
    }

    /// Matching reservations ordered by start, then id.
    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        if let (Some(from), Some(to)) = (filter.date_from, filter.date_to) {
            if from > to {
                return Err(EngineError::invalid("date_from is after date_to"));
            }
            if to - from > Duration::days(MAX_QUERY_RANGE_DAYS) {
                return Err(EngineError::LimitExceeded("date range too wide"));
            }
        }

        let ids = match filter.table_id {
            Some(t) => {
                if self.store.get_table(&t).is_none() {
                    return Err(EngineError::not_found(EntityKind::Table, t));
                }
                vec![t]
            }
            None => self.store.table_ids(),
        };

        let mut out = Vec::new();
        for id in ids {
            let Some(rs) = self.store.get_table(&id) else {
                continue;
            };
            let guard = rs.read().await;
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by_key(|r| (r.span().start, r.id));
        Ok(out)
    }

    pub async fn todays_reservations(&self) -> Result<Vec<Reservation>, EngineError> {
        let today = self.clock.today();
        self.list_reservations(&ReservationFilter {
            date_from: Some(today),
            date_to: Some(today),
            ..Default::default()
        })
        .await
    }

    /// Counts by status and party-size figures over the filtered set.
    /// Every status shows up in `by_status`, zero or not.
    pub async fn reservation_stats(
        &self,
        filter: &ReservationFilter,
    ) -> Result<ReservationStats, EngineError> {
        let reservations = self.list_reservations(filter).await?;
        let mut stats = ReservationStats {
            total: reservations.len(),
            by_status: [
                ReservationStatus::Booked,
                ReservationStatus::Confirmed,
                ReservationStatus::Cancelled,
                ReservationStatus::Completed,
                ReservationStatus::NoShow,
            ]
            .into_iter()
            .map(|s| (s, 0))
            .collect(),
            total_guests: 0,
            average_party_size: 0.0,
        };
        for r in &reservations {
            *stats.by_status.entry(r.status).or_default() += 1;
            stats.total_guests += u64::from(r.party_size);
        }
        if stats.total > 0 {
            stats.average_party_size = stats.total_guests as f64 / stats.total as f64;
        }
        Ok(stats)
    }

    /// What billing needs to know about a seated party.
    pub async fn reservation_snapshot(
        &self,
        id: ReservationId,
    ) -> Result<ReservationSnapshot, EngineError> {
        let r = self.get_reservation(id).await?;
        let table = self.get_table(r.table_id).await?;
        Ok(ReservationSnapshot {
            reservation_id: r.id,
            table_id: table.id,
            table_name: table.name,
            party_size: r.party_size,
            status: r.status,
            customer_ref: r.customer_ref,
            customer_name: r.customer_name,
            customer_phone: r.customer_phone,
        })
    }
}
