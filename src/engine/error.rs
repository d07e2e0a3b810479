use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    Conflict(String),
    /// Slot lock could not be taken within the bounded wait. Safe to retry.
    Busy(Ulid),
    /// Engine-wide lock (`catalog`, `registry`) stayed held past the bounded wait.
    LockBusy(&'static str),
    SlotFull { available: u32, required: u32 },
    WaitlistFull(u32),
    DuplicateBooking(Ulid),
    AlreadyWaiting(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    Validation(String),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::Busy(_) | EngineError::LockBusy(_) => "RETRY",
            EngineError::SlotFull { .. } => "SLOT_FULL",
            EngineError::WaitlistFull(_) => "WAITLIST_FULL",
            EngineError::DuplicateBooking(_) => "DUPLICATE_BOOKING",
            EngineError::AlreadyWaiting(_) => "ALREADY_WAITING",
            EngineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::WalError(_) => "STORAGE_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Busy(_) | EngineError::LockBusy(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::Busy(id) => write!(f, "slot {id} is busy, retry shortly"),
            EngineError::LockBusy(what) => write!(f, "{what} is busy, retry shortly"),
            EngineError::SlotFull { available, required } => {
                write!(f, "slot full: need {required} machine(s), {available} available")
            }
            EngineError::WaitlistFull(cap) => write!(f, "waitlist is full (max {cap})"),
            EngineError::DuplicateBooking(id) => {
                write!(f, "already booked on this slot (booking {id})")
            }
            EngineError::AlreadyWaiting(id) => {
                write!(f, "already on the waitlist for this slot (entry {id})")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move booking from {from} to {to}")
            }
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
