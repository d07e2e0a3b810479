use std::net::SocketAddr;

use crate::api::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: command, status.
pub const REQUESTS_TOTAL: &str = "slotwash_requests_total";

/// Histogram: request latency in seconds. Labels: command.
pub const REQUEST_DURATION_SECONDS: &str = "slotwash_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings created directly (not via promotion).
pub const BOOKINGS_CREATED_TOTAL: &str = "slotwash_bookings_created_total";

/// Counter: booking status changes. Labels: status.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "slotwash_booking_transitions_total";

/// Counter: waitlist entries turned into bookings.
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "slotwash_waitlist_promotions_total";

/// Counter: slot lock attempts that hit the bounded wait.
pub const LOCK_TIMEOUTS_TOTAL: &str = "slotwash_lock_timeouts_total";

/// Gauge: slots currently in the catalog.
pub const SLOTS_ACTIVE: &str = "slotwash_slots_active";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwash_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwash_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwash_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwash_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwash_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RequestBooking { .. } => "request_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::ListBookings { .. } => "list_bookings",
        Command::CheckIn { .. } => "check_in",
        Command::ListSlots { .. } => "list_slots",
        Command::SetSlotEnabled { .. } => "set_slot_enabled",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::RegenerateSlots { .. } => "regenerate_slots",
        Command::JoinWaitlist { .. } => "join_waitlist",
        Command::ListWaitlist => "list_waitlist",
        Command::LeaveWaitlist { .. } => "leave_waitlist",
        Command::ListMachines { .. } => "list_machines",
        Command::SetMachineStatus { .. } => "set_machine_status",
        Command::Listen => "listen",
    }
}
