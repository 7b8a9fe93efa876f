//! Hard input limits. Anything past these is rejected with `LimitExceeded`.

pub const MAX_AREAS: usize = 1_000;
pub const MAX_TABLES: usize = 10_000;
pub const MAX_RESERVATIONS_PER_TABLE: usize = 50_000;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_PHONE_LEN: usize = 32;
/// Descriptions, notes, cancellation reasons, media references.
pub const MAX_TEXT_LEN: usize = 2_048;

pub const MAX_TABLE_CAPACITY: u32 = 200;

pub const MIN_DURATION_MINUTES: u32 = 15;
pub const MAX_DURATION_MINUTES: u32 = 12 * 60;
pub const DEFAULT_DURATION_MINUTES: u32 = 120;
pub const DEFAULT_GRACE_MINUTES: u32 = 30;

/// How far ahead a booking may be placed.
pub const MAX_BOOKING_AHEAD_DAYS: i64 = 366;
/// Widest date range accepted by reservation listings and stats.
pub const MAX_QUERY_RANGE_DAYS: i64 = 366;

/// Re-resolve attempts when a reservation moves tables under a concurrent request.
pub const MAX_RESOLVE_ATTEMPTS: usize = 3;
