use std::time::Instant;

use tracing::{debug, info};

use crate::engine::{Engine, EngineError, ResetOutcome};
use crate::model::{ExpiryReport, ResetReport, SweepKind, TableStatus};
use crate::notify::Notification;
use crate::observability::*;

fn failed(sweep: SweepKind, e: EngineError) -> EngineError {
    match e {
        e @ EngineError::SweepFailure { .. } => e,
        other => EngineError::SweepFailure {
            sweep,
            reason: other.to_string(),
        },
    }
}

fn record_run(sweep: SweepKind, started: Instant, ok: bool) {
    metrics::histogram!(SWEEP_DURATION_SECONDS, "sweep" => sweep.as_str())
        .record(started.elapsed().as_secs_f64());
    let outcome = if ok { "ok" } else { "failed" };
    metrics::counter!(SWEEP_RUNS_TOTAL, "sweep" => sweep.as_str(), "outcome" => outcome)
        .increment(1);
}

/// Cancel every reservation past its grace period, then re-derive table
/// statuses. Running it twice in a row cancels nothing the second time.
pub async fn sweep_expired(engine: &Engine, grace_minutes: u32) -> Result<ExpiryReport, EngineError> {
    let started = Instant::now();
    let result = expire(engine, grace_minutes).await;
    record_run(SweepKind::Expiry, started, result.is_ok());
    let report = result.map_err(|e| failed(SweepKind::Expiry, e))?;
    engine
        .notify
        .publish_report(Notification::ExpirySwept(report.clone()));
    Ok(report)
}

async fn expire(engine: &Engine, grace_minutes: u32) -> Result<ExpiryReport, EngineError> {
    let now = engine.now();
    let candidates = engine.collect_expired_reservations(now, grace_minutes).await;

    // Tables lock independently, so expire them side by side.
    let results = futures::future::join_all(candidates.into_iter().map(|(table_id, ids)| async move {
        let n = engine
            .expire_on_table(table_id, &ids, now, grace_minutes)
            .await;
        (table_id, n)
    }))
    .await;

    let mut cancelled = 0;
    let mut affected_tables = Vec::new();
    for (table_id, n) in results {
        let n = n?;
        if n > 0 {
            debug!(table_id, cancelled = n, "expired reservations on table");
            cancelled += n;
            affected_tables.push(table_id);
        }
    }
    let refreshed_tables = engine.refresh_derived_statuses(now).await?;
    metrics::counter!(RESERVATIONS_EXPIRED_TOTAL).increment(cancelled as u64);

    let summary = if cancelled == 0 {
        format!("no expired reservations; {refreshed_tables} table status(es) refreshed")
    } else {
        format!(
            "auto-expired {cancelled} reservation(s) on {} table(s); {refreshed_tables} table status(es) refreshed",
            affected_tables.len()
        )
    };
    info!(cancelled, tables = affected_tables.len(), refreshed_tables, "expiry sweep done");
    Ok(ExpiryReport {
        cancelled,
        affected_tables,
        refreshed_tables,
        ran_at: now,
        summary,
    })
}

/// Return InService tables to Empty unless a Booked/Confirmed reservation
/// still lies ahead. Maintenance tables are never considered.
pub async fn sweep_reset(engine: &Engine) -> Result<ResetReport, EngineError> {
    let started = Instant::now();
    let result = reset(engine).await;
    record_run(SweepKind::Reset, started, result.is_ok());
    let report = result.map_err(|e| failed(SweepKind::Reset, e))?;
    engine
        .notify
        .publish_report(Notification::ResetSwept(report.clone()));
    Ok(report)
}

async fn reset(engine: &Engine) -> Result<ResetReport, EngineError> {
    let now = engine.now();
    let mut reset_tables = Vec::new();
    let mut kept_tables = Vec::new();

    for table_id in engine.tables_with_status(TableStatus::InService).await {
        match engine.reset_if_idle(table_id, now).await? {
            ResetOutcome::Reset => reset_tables.push(table_id),
            ResetOutcome::Kept { upcoming } => {
                debug!(table_id, upcoming, "reset kept table with upcoming bookings");
                kept_tables.push(table_id);
            }
            ResetOutcome::Skipped => {}
        }
    }
    metrics::counter!(TABLES_RESET_TOTAL).increment(reset_tables.len() as u64);

    let summary = format!(
        "reset {} table(s) to empty; kept {} with upcoming bookings",
        reset_tables.len(),
        kept_tables.len()
    );
    info!(reset = reset_tables.len(), kept = kept_tables.len(), "reset sweep done");
    Ok(ResetReport {
        reset: reset_tables.len(),
        reset_tables,
        kept_tables,
        ran_at: now,
        summary,
    })
}
