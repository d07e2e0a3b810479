use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Wall-clock time at the laundry room. Slots are scheduled in local time.
pub type Timestamp = NaiveDateTime;

pub type UserId = u64;
pub type PairId = u32;

// ── Actors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Attendant,
    Admin,
}

/// Already-authenticated caller identity, supplied per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn student(user_id: UserId) -> Self {
        Self { user_id, role: Role::Student }
    }

    pub fn attendant(user_id: UserId) -> Self {
        Self { user_id, role: Role::Attendant }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self { user_id, role: Role::Admin }
    }

    /// Internal actor used by background jobs.
    pub fn system() -> Self {
        Self { user_id: 0, role: Role::Admin }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Attendant | Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Machines ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Available,
    Maintenance,
    #[serde(alias = "out_of_order")]
    OutOfService,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: Ulid,
    pub pair_id: PairId,
    pub machine_number: u32,
    pub status: MachineStatus,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadType {
    Combined,
    SeparateWhites,
    SeparateColors,
}

impl LoadType {
    /// Machine units a load of this type occupies.
    pub fn machines(self) -> u32 {
        match self {
            LoadType::Combined => 1,
            LoadType::SeparateWhites | LoadType::SeparateColors => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Confirmed,
    Received,
    Washing,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 6] = [
        BookingStatus::Confirmed,
        BookingStatus::Received,
        BookingStatus::Washing,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::NoShow,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }

    /// Edges of the booking lifecycle. Everything not listed is rejected.
    pub fn allowed_targets(self) -> &'static [BookingStatus] {
        use BookingStatus::*;
        match self {
            Confirmed => &[Received, Cancelled, NoShow],
            Received => &[Washing, Cancelled, NoShow],
            Washing => &[Completed, NoShow],
            Completed | Cancelled | NoShow => &[],
        }
    }

    pub fn can_transition_to(self, target: BookingStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Received => "received",
            BookingStatus::Washing => "washing",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BookingStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown booking status: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub ticket_id: Ulid,
    pub user_id: UserId,
    pub slot_id: Ulid,
    pub load_type: LoadType,
    pub machines_used: u32,
    pub status: BookingStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ── Waitlist ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitlistStatus {
    Waiting,
    Promoted,
    Left,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub user_id: UserId,
    pub slot_id: Ulid,
    pub load_type: LoadType,
    /// 1-based, dense among `Waiting` entries of the slot.
    pub position: u32,
    pub status: WaitlistStatus,
    pub created_at: Timestamp,
    pub booking_id: Option<Ulid>,
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub pair_id: PairId,
    pub date: NaiveDate,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub capacity: u32,
    /// Underlying counter. Kept while the slot is disabled.
    pub available_machines: u32,
    pub enabled: bool,
}

impl Slot {
    /// Availability as callers see it: a disabled slot offers nothing.
    pub fn visible_available(&self) -> u32 {
        if self.enabled { self.available_machines } else { 0 }
    }
}

/// Everything guarded by one slot lock: the slot row, its bookings and its waitlist.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub slot: Slot,
    pub bookings: Vec<Booking>,
    /// All entries ever queued on this slot, in join order.
    pub waitlist: Vec<WaitlistEntry>,
    /// Set when the slot is deleted so late lock holders see it is gone.
    pub removed: bool,
}

impl SlotState {
    pub fn new(slot: Slot) -> Self {
        Self {
            slot,
            bookings: Vec::new(),
            waitlist: Vec::new(),
            removed: false,
        }
    }

    /// Machine units held by non-terminal bookings.
    pub fn consumed(&self) -> u32 {
        self.bookings
            .iter()
            .filter(|b| !b.status.is_terminal())
            .map(|b| b.machines_used)
            .sum()
    }

    pub fn has_active_bookings(&self) -> bool {
        self.bookings.iter().any(|b| !b.status.is_terminal())
    }

    pub fn active_booking_for(&self, user_id: UserId) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.user_id == user_id && !b.status.is_terminal())
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn entry(&self, id: Ulid) -> Option<&WaitlistEntry> {
        self.waitlist.iter().find(|e| e.id == id)
    }

    pub fn waiting_for(&self, user_id: UserId) -> Option<&WaitlistEntry> {
        self.waitlist
            .iter()
            .find(|e| e.user_id == user_id && e.status == WaitlistStatus::Waiting)
    }

    pub fn waiting_count(&self) -> u32 {
        self.waitlist
            .iter()
            .filter(|e| e.status == WaitlistStatus::Waiting)
            .count() as u32
    }

    /// Waiting entries in queue order.
    pub fn waiting(&self) -> Vec<&WaitlistEntry> {
        let mut waiting: Vec<&WaitlistEntry> = self
            .waitlist
            .iter()
            .filter(|e| e.status == WaitlistStatus::Waiting)
            .collect();
        waiting.sort_by_key(|e| e.position);
        waiting
    }

    pub fn head_waiting(&self) -> Option<&WaitlistEntry> {
        self.waitlist
            .iter()
            .filter(|e| e.status == WaitlistStatus::Waiting)
            .min_by_key(|e| e.position)
    }

    /// Insert or replace a waitlist entry by id.
    pub fn upsert_entry(&mut self, entry: WaitlistEntry) {
        match self.waitlist.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => self.waitlist.push(entry),
        }
    }

    /// Insert or replace a booking by id.
    pub fn upsert_booking(&mut self, booking: Booking) {
        match self.bookings.iter_mut().find(|b| b.id == booking.id) {
            Some(existing) => *existing = booking,
            None => self.bookings.push(booking),
        }
    }

    /// Move a waiting entry out of the queue and shift everyone behind it forward.
    /// Returns `None` if the entry is unknown or no longer waiting.
    pub fn close_entry(&mut self, id: Ulid, status: WaitlistStatus) -> Option<&WaitlistEntry> {
        let idx = self
            .waitlist
            .iter()
            .position(|e| e.id == id && e.status == WaitlistStatus::Waiting)?;
        let vacated = self.waitlist[idx].position;
        self.waitlist[idx].status = status;
        for e in self.waitlist.iter_mut() {
            if e.status == WaitlistStatus::Waiting && e.position > vacated {
                e.position -= 1;
            }
        }
        Some(&self.waitlist[idx])
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// WAL record format. Flat: no nesting beyond whole records.
/// Slot-affecting events carry the resulting counter so replay never recomputes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MachineRegistered {
        machine: Machine,
    },
    MachineStatusChanged {
        id: Ulid,
        pair_id: PairId,
        status: MachineStatus,
    },
    SlotCreated {
        slot: Slot,
    },
    SlotCapacityChanged {
        id: Ulid,
        capacity: u32,
        available_machines: u32,
    },
    SlotEnabledChanged {
        id: Ulid,
        enabled: bool,
        available_machines: u32,
    },
    SlotDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
        available_machines: u32,
    },
    BookingStatusChanged {
        id: Ulid,
        slot_id: Ulid,
        user_id: UserId,
        status: BookingStatus,
        at: Timestamp,
        available_machines: u32,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistLeft {
        id: Ulid,
        slot_id: Ulid,
        user_id: UserId,
    },
    /// Closes the entry and records its booking in one record.
    WaitlistPromoted {
        id: Ulid,
        slot_id: Ulid,
        user_id: UserId,
        booking: Booking,
        available_machines: u32,
    },
    WaitlistExpired {
        id: Ulid,
        slot_id: Ulid,
        user_id: UserId,
    },
}

impl Event {
    /// The slot this event mutates, if any.
    pub fn slot_id(&self) -> Option<Ulid> {
        match self {
            Event::SlotCreated { slot } => Some(slot.id),
            Event::SlotCapacityChanged { id, .. }
            | Event::SlotEnabledChanged { id, .. }
            | Event::SlotDeleted { id } => Some(*id),
            Event::BookingCreated { booking, .. } => Some(booking.slot_id),
            Event::WaitlistJoined { entry } => Some(entry.slot_id),
            Event::BookingStatusChanged { slot_id, .. }
            | Event::WaitlistLeft { slot_id, .. }
            | Event::WaitlistPromoted { slot_id, .. }
            | Event::WaitlistExpired { slot_id, .. } => Some(*slot_id),
            Event::MachineRegistered { .. } | Event::MachineStatusChanged { .. } => None,
        }
    }

    /// The user an event concerns, for notification fan-out.
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Event::BookingCreated { booking, .. } => Some(booking.user_id),
            Event::WaitlistJoined { entry } => Some(entry.user_id),
            Event::BookingStatusChanged { user_id, .. }
            | Event::WaitlistLeft { user_id, .. }
            | Event::WaitlistPromoted { user_id, .. }
            | Event::WaitlistExpired { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }
}

// ── Query inputs / results ───────────────────────────────────────

/// Externally visible slot row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub id: Ulid,
    pub pair_id: PairId,
    pub date: NaiveDate,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub capacity: u32,
    pub available_machines: u32,
    pub enabled: bool,
    pub waitlist_length: u32,
}

impl SlotInfo {
    pub fn from_state(rs: &SlotState) -> Self {
        Self {
            id: rs.slot.id,
            pair_id: rs.slot.pair_id,
            date: rs.slot.date,
            start_time: rs.slot.start_time,
            end_time: rs.slot.end_time,
            capacity: rs.slot.capacity,
            available_machines: rs.slot.visible_available(),
            enabled: rs.slot.enabled,
            waitlist_length: rs.waiting_count(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub user_id: Option<UserId>,
    pub status: Option<BookingStatus>,
    pub date: Option<NaiveDate>,
}

/// A booking after a status change, plus whoever got promoted off the waitlist as a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub booking: Booking,
    pub promoted: Vec<Booking>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegenerateReport {
    pub created: usize,
    pub pruned: usize,
}
