use std::collections::BTreeMap;
use std::fmt;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

pub type AreaId = u64;
pub type TableId = u64;
pub type ReservationId = u64;

/// Half-open interval `[start, end)` in local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Window of a booking that starts at `date`/`start_time` and lasts `duration_minutes`.
    pub fn from_slot(date: NaiveDate, start_time: NaiveTime, duration_minutes: u32) -> Self {
        let start = date.and_time(start_time);
        Self::new(start, start + Duration::minutes(i64::from(duration_minutes)))
    }

    /// The whole calendar day `[00:00, next 00:00)`.
    pub fn day(date: NaiveDate) -> Self {
        let start = date.and_time(NaiveTime::MIN);
        Self::new(start, start + Duration::days(1))
    }

    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: NaiveDateTime) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Status vocabularies ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AreaStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableStatus {
    Empty,
    Reserved,
    /// Party seated. Set only by an explicit seating, cleared by release or the nightly reset.
    InService,
    /// Manual override, never changed automatically.
    Maintenance,
}

impl TableStatus {
    /// Overrides are never replaced by the derived Empty/Reserved value.
    pub fn is_override(self) -> bool {
        matches!(self, TableStatus::InService | TableStatus::Maintenance)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TableStatus::Empty => "empty",
            TableStatus::Reserved => "reserved",
            TableStatus::InService => "in_service",
            TableStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReservationStatus {
    Booked,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl ReservationStatus {
    /// Statuses that claim a table's time window.
    pub const BLOCKING: [ReservationStatus; 3] = [
        ReservationStatus::Booked,
        ReservationStatus::Confirmed,
        ReservationStatus::Completed,
    ];

    pub fn is_blocking(self) -> bool {
        Self::BLOCKING.contains(&self)
    }

    /// Still waiting for the party to arrive.
    pub fn is_pending(self) -> bool {
        matches!(self, ReservationStatus::Booked | ReservationStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }

    pub fn can_transition_to(self, next: ReservationStatus) -> bool {
        use ReservationStatus::*;
        matches!(
            (self, next),
            (Booked, Confirmed)
                | (Booked | Confirmed, Completed)
                | (Booked | Confirmed, Cancelled)
                | (Booked | Confirmed, NoShow)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Booked => "booked",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
            ReservationStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SweepKind {
    Expiry,
    Reset,
}

impl SweepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SweepKind::Expiry => "expiry",
            SweepKind::Reset => "reset",
        }
    }
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub id: AreaId,
    pub name: String,
    pub description: Option<String>,
    pub image_ref: Option<String>,
    pub video_ref: Option<String>,
    pub status: AreaStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub capacity: u32,
    pub area_id: Option<AreaId>,
    pub location: Option<String>,
    pub status: TableStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub table_id: TableId,
    /// Opaque reference into the customer-identity collaborator. Walk-ins have none.
    pub customer_ref: Option<String>,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub party_size: u32,
    pub status: ReservationStatus,
    pub customer_name: String,
    pub customer_phone: String,
    pub note: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::from_slot(self.date, self.start_time, self.duration_minutes)
    }

    pub fn is_blocking(&self) -> bool {
        self.status.is_blocking()
    }

    pub fn summary(&self) -> ReservationSummary {
        let span = self.span();
        ReservationSummary {
            id: self.id,
            start: span.start,
            end: span.end,
            status: self.status,
            party_size: self.party_size,
            customer_name: self.customer_name.clone(),
        }
    }
}

/// A table together with its reservations, sorted by window start.
#[derive(Debug, Clone)]
pub struct TableState {
    pub table: Table,
    pub reservations: Vec<Reservation>,
    /// Set once the table is deleted; holders of a stale handle must bail out.
    pub retired: bool,
}

impl TableState {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            reservations: Vec::new(),
            retired: false,
        }
    }

    /// Insert a reservation keeping the list sorted by window start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let start = reservation.span().start;
        let pos = self
            .reservations
            .partition_point(|r| r.span().start <= start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: ReservationId) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: ReservationId) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations whose window overlaps `query`, regardless of status.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span().start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span().end > query.start)
    }

    pub fn blocking(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_blocking())
    }

    pub fn pending(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.status.is_pending())
    }
}

/// WAL record and change notification. Every committed mutation is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AreaCreated {
        area: Area,
    },
    AreaUpdated {
        area: Area,
    },
    AreaDeleted {
        id: AreaId,
    },
    TableCreated {
        table: Table,
    },
    TableUpdated {
        table: Table,
    },
    TableDeleted {
        id: TableId,
    },
    TableStatusChanged {
        table_id: TableId,
        status: TableStatus,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    /// Field edit, possibly moving the reservation off `previous_table_id`.
    ReservationUpdated {
        previous_table_id: TableId,
        reservation: Reservation,
    },
    ReservationStatusChanged {
        id: ReservationId,
        table_id: TableId,
        from: ReservationStatus,
        to: ReservationStatus,
        reason: Option<String>,
        at: NaiveDateTime,
    },
}

impl Event {
    /// Tables whose state this event touches. Empty for area-level events.
    pub fn table_ids(&self) -> Vec<TableId> {
        match self {
            Event::AreaCreated { .. } | Event::AreaUpdated { .. } | Event::AreaDeleted { .. } => {
                Vec::new()
            }
            Event::TableCreated { table } | Event::TableUpdated { table } => vec![table.id],
            Event::TableDeleted { id } => vec![*id],
            Event::TableStatusChanged { table_id, .. }
            | Event::ReservationStatusChanged { table_id, .. } => vec![*table_id],
            Event::ReservationCreated { reservation } => vec![reservation.table_id],
            Event::ReservationUpdated {
                previous_table_id,
                reservation,
            } => {
                if *previous_table_id == reservation.table_id {
                    vec![reservation.table_id]
                } else {
                    vec![*previous_table_id, reservation.table_id]
                }
            }
        }
    }
}

// ── Command payloads ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewArea {
    pub name: String,
    pub description: Option<String>,
    pub image_ref: Option<String>,
    pub video_ref: Option<String>,
    pub status: Option<AreaStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AreaPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_ref: Option<String>,
    pub video_ref: Option<String>,
    pub status: Option<AreaStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTable {
    pub name: String,
    pub capacity: u32,
    pub area_id: Option<AreaId>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TablePatch {
    pub name: Option<String>,
    pub capacity: Option<u32>,
    /// `Some(None)` detaches the table from its area.
    pub area_id: Option<Option<AreaId>>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub customer_ref: Option<String>,
    pub name: String,
    pub phone: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReservation {
    pub table_id: TableId,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    /// Falls back to the engine's default duration.
    pub duration_minutes: Option<u32>,
    pub party_size: u32,
    pub customer: CustomerInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReservationPatch {
    pub table_id: Option<TableId>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub duration_minutes: Option<u32>,
    pub party_size: Option<u32>,
    pub customer_ref: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub note: Option<String>,
}

impl ReservationPatch {
    /// True if the patch can move the reservation's window or table.
    pub fn touches_slot(&self) -> bool {
        self.table_id.is_some()
            || self.date.is_some()
            || self.start_time.is_some()
            || self.duration_minutes.is_some()
    }
}

/// A requested date/time window before it is resolved to a `Span`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotQuery {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReservationFilter {
    pub table_id: Option<TableId>,
    pub status: Option<ReservationStatus>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Substring match on the stored phone.
    pub customer_phone: Option<String>,
    /// Case-insensitive substring match on the stored name.
    pub customer_name: Option<String>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        if self.table_id.is_some_and(|t| t != r.table_id) {
            return false;
        }
        if self.status.is_some_and(|s| s != r.status) {
            return false;
        }
        if self.date_from.is_some_and(|d| r.date < d) || self.date_to.is_some_and(|d| r.date > d) {
            return false;
        }
        if let Some(phone) = &self.customer_phone
            && !r.customer_phone.contains(phone.as_str())
        {
            return false;
        }
        if let Some(name) = &self.customer_name
            && !r
                .customer_name
                .to_lowercase()
                .contains(&name.to_lowercase())
        {
            return false;
        }
        true
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSummary {
    pub id: ReservationId,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub status: ReservationStatus,
    pub party_size: u32,
    pub customer_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub table_id: TableId,
    pub requested: Span,
    pub is_available: bool,
    /// First blocking reservation overlapping the requested window.
    pub blocking: Option<ReservationSummary>,
    /// Blocking reservation whose window contains the evaluation instant.
    pub current: Option<ReservationSummary>,
    /// Earliest blocking reservation starting after the evaluation instant.
    pub next: Option<ReservationSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableView {
    pub table: Table,
    pub availability: Option<Availability>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationStats {
    pub total: usize,
    pub by_status: BTreeMap<ReservationStatus, usize>,
    pub total_guests: u64,
    pub average_party_size: f64,
}

/// What the order/payment collaborator needs to turn a seating into a bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSnapshot {
    pub reservation_id: ReservationId,
    pub table_id: TableId,
    pub table_name: String,
    pub party_size: u32,
    pub status: ReservationStatus,
    pub customer_ref: Option<String>,
    pub customer_name: String,
    pub customer_phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryReport {
    pub cancelled: usize,
    pub affected_tables: Vec<TableId>,
    /// Tables whose derived status moved during the refresh pass.
    pub refreshed_tables: usize,
    pub ran_at: NaiveDateTime,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetReport {
    pub reset: usize,
    pub reset_tables: Vec<TableId>,
    /// InService tables left alone because a booking is still to come.
    pub kept_tables: Vec<TableId>,
    pub ran_at: NaiveDateTime,
    pub summary: String,
}
