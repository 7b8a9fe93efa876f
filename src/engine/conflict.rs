use chrono::{Duration, NaiveDateTime};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_duration(minutes: u32) -> Result<(), EngineError> {
    if minutes < MIN_DURATION_MINUTES {
        return Err(EngineError::invalid(format!(
            "duration must be at least {MIN_DURATION_MINUTES} minutes"
        )));
    }
    if minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    Ok(())
}

/// A new or moved window must not be over already and must not sit too far ahead.
pub(crate) fn validate_booking_window(span: &Span, now: NaiveDateTime) -> Result<(), EngineError> {
    if span.end <= now {
        return Err(EngineError::invalid(format!(
            "window {} to {} is already over",
            span.start, span.end
        )));
    }
    if span.start > now + Duration::days(MAX_BOOKING_AHEAD_DAYS) {
        return Err(EngineError::LimitExceeded("booking too far ahead"));
    }
    Ok(())
}

/// First blocking reservation overlapping `span`, ignoring `exclude`.
pub fn first_blocking<'a>(
    ts: &'a TableState,
    span: &Span,
    exclude: Option<ReservationId>,
) -> Option<&'a Reservation> {
    ts.overlapping(span)
        .find(|r| r.is_blocking() && Some(r.id) != exclude)
}

pub(crate) fn check_no_conflict(
    ts: &TableState,
    span: &Span,
    exclude: Option<ReservationId>,
) -> Result<(), EngineError> {
    match first_blocking(ts, span, exclude) {
        Some(r) => {
            let window = r.span();
            Err(EngineError::SlotConflict {
                reservation_id: r.id,
                start: window.start,
                end: window.end,
            })
        }
        None => Ok(()),
    }
}

/// Blocking reservation whose window contains `as_of`.
pub fn current_reservation(ts: &TableState, as_of: NaiveDateTime) -> Option<&Reservation> {
    ts.blocking().find(|r| r.span().contains_instant(as_of))
}

/// Earliest blocking reservation starting after `as_of`.
pub fn next_reservation(ts: &TableState, as_of: NaiveDateTime) -> Option<&Reservation> {
    // sorted by start, so the first hit is the earliest
    ts.blocking().find(|r| r.span().start > as_of)
}

/// Full availability answer for `requested`, evaluated at `now`.
pub fn check_availability(
    ts: &TableState,
    requested: &Span,
    now: NaiveDateTime,
    exclude: Option<ReservationId>,
) -> Availability {
    let blocking = first_blocking(ts, requested, exclude).map(Reservation::summary);
    Availability {
        table_id: ts.table.id,
        requested: *requested,
        is_available: blocking.is_none(),
        blocking,
        current: current_reservation(ts, now).map(Reservation::summary),
        next: next_reservation(ts, now).map(Reservation::summary),
    }
}

/// Empty/Reserved value the table would show at `as_of`, ignoring overrides.
///
/// Reserved while a blocking reservation is running, or when one still starts
/// later the same day.
pub fn derive_table_status(ts: &TableState, as_of: NaiveDateTime) -> TableStatus {
    let today = as_of.date();
    let claimed = ts.blocking().any(|r| {
        let span = r.span();
        span.contains_instant(as_of) || (span.start > as_of && span.start.date() == today)
    });
    if claimed {
        TableStatus::Reserved
    } else {
        TableStatus::Empty
    }
}

/// Booked/Confirmed reservation that nobody honoured within the grace period.
pub fn is_expired(r: &Reservation, now: NaiveDateTime, grace_minutes: u32) -> bool {
    if !r.status.is_pending() {
        return false;
    }
    let today = now.date();
    if r.date < today {
        return true;
    }
    r.date == today && now > r.date.and_time(r.start_time) + Duration::minutes(i64::from(grace_minutes))
}
