use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "haven_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "haven_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "haven_connections_active";
pub const CONNECTIONS_TOTAL: &str = "haven_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "haven_connections_rejected_total";

/// Gauge: number of open tenant stores.
pub const TENANTS_ACTIVE: &str = "haven_tenants_active";

/// Counter: logins refused before the password check.
pub const AUTH_FAILURES_TOTAL: &str = "haven_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "haven_wal_flush_duration_seconds";

/// Histogram: events per WAL group commit.
pub const WAL_FLUSH_BATCH_SIZE: &str = "haven_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "haven_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RegisterUser { .. } => "register_user",
        Command::SelectUser => "get_user",
        Command::InsertBooking { .. } => "book_visit",
        Command::SelectBookings => "list_bookings",
        Command::DeleteBooking { .. } => "cancel_booking",
        Command::ToggleFavorite { .. } => "toggle_favorite",
        Command::SelectFavorites => "list_favorites",
    }
}
