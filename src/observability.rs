use std::net::SocketAddr;

// ── Reservation traffic ─────────────────────────────────────────

/// Counter: reservations booked.
pub const RESERVATIONS_CREATED_TOTAL: &str = "tablekeep_reservations_created_total";

/// Counter: booking or edit rejected. Labels: reason (capacity, slot_conflict, maintenance).
pub const RESERVATION_REJECTIONS_TOTAL: &str = "tablekeep_reservation_rejections_total";

/// Counter: lifecycle transitions. Labels: to.
pub const RESERVATION_TRANSITIONS_TOTAL: &str = "tablekeep_reservation_transitions_total";

// ── Sweeps ──────────────────────────────────────────────────────

/// Counter: completed sweep runs. Labels: sweep, outcome (ok, failed).
pub const SWEEP_RUNS_TOTAL: &str = "tablekeep_sweep_runs_total";

/// Histogram: sweep wall time in seconds. Labels: sweep.
pub const SWEEP_DURATION_SECONDS: &str = "tablekeep_sweep_duration_seconds";

/// Counter: timer firings skipped because the sweep was still running. Labels: sweep.
pub const SWEEP_SKIPPED_TOTAL: &str = "tablekeep_sweep_skipped_total";

/// Counter: reservations cancelled by the expiry sweep.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "tablekeep_reservations_expired_total";

/// Counter: InService tables returned to Empty by the nightly reset.
pub const TABLES_RESET_TOTAL: &str = "tablekeep_tables_reset_total";

// ── Storage and delivery ────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tablekeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tablekeep_wal_flush_batch_size";

/// Counter: outbound notifications given up on.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "tablekeep_notifications_dropped_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
