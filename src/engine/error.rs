use std::fmt;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::model::{ReservationId, ReservationStatus, SweepKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Area,
    Table,
    Reservation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Area => "area",
            EntityKind::Table => "table",
            EntityKind::Reservation => "reservation",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: u64 },

    #[error("party of {party_size} exceeds table capacity of {capacity}")]
    CapacityExceeded { party_size: u32, capacity: u32 },

    #[error("slot conflicts with reservation {reservation_id} ({start} to {end})")]
    SlotConflict {
        reservation_id: ReservationId,
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    #[error("reservation {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: ReservationId,
        from: ReservationStatus,
        to: ReservationStatus,
    },

    #[error("{kind} {id} changed concurrently; retry with fresh data")]
    ConcurrencyConflict { kind: EntityKind, id: u64 },

    #[error("name already in use: {0}")]
    DuplicateName(String),

    #[error("{kind} {id} is still in use: {reason}")]
    InUse {
        kind: EntityKind,
        id: u64,
        reason: String,
    },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("WAL error: {0}")]
    WalError(String),

    #[error("{0} sweep is already running")]
    SweepAlreadyRunning(SweepKind),

    #[error("{sweep} sweep failed: {reason}")]
    SweepFailure { sweep: SweepKind, reason: String },
}

impl EngineError {
    pub(crate) fn not_found(kind: EntityKind, id: u64) -> Self {
        EngineError::NotFound { kind, id }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound { .. } => "not_found",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::SlotConflict { .. } => "slot_conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::ConcurrencyConflict { .. } => "concurrency_conflict",
            EngineError::DuplicateName(_) => "duplicate_name",
            EngineError::InUse { .. } => "in_use",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
            EngineError::SweepAlreadyRunning(_) => "sweep_already_running",
            EngineError::SweepFailure { .. } => "sweep_failure",
        }
    }
}
