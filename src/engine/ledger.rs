use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Result of asking for a booking on a slot that may be full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BookingRequest {
    Booked(Booking),
    Waitlisted(WaitlistEntry),
}

impl Engine {
    /// Book a slot for the calling user. Fails with `SlotFull` rather than queueing.
    pub async fn create_booking(
        &self,
        actor: &Actor,
        slot_id: Ulid,
        load_type: LoadType,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.lock_slot(slot_id).await?;
        let now = self.now();
        check_bookable(&guard, actor, now)?;
        let booking = self
            .insert_booking(&mut guard, actor.user_id, load_type, now)
            .await?;
        self.leave_queue_after_booking(&mut guard, actor.user_id).await;
        Ok(booking)
    }

    /// Book if there is room, otherwise join the slot's waitlist, in one critical section.
    pub async fn request_booking(
        &self,
        actor: &Actor,
        slot_id: Ulid,
        load_type: LoadType,
    ) -> Result<BookingRequest, EngineError> {
        let mut guard = self.lock_slot(slot_id).await?;
        let now = self.now();
        check_bookable(&guard, actor, now)?;
        match self
            .insert_booking(&mut guard, actor.user_id, load_type, now)
            .await
        {
            Ok(booking) => {
                self.leave_queue_after_booking(&mut guard, actor.user_id).await;
                Ok(BookingRequest::Booked(booking))
            }
            Err(EngineError::SlotFull { .. }) => {
                let entry = self
                    .enqueue(&mut guard, actor.user_id, load_type, now)
                    .await?;
                Ok(BookingRequest::Waitlisted(entry))
            }
            Err(e) => Err(e),
        }
    }

    /// Create a confirmed booking against the slot's visible availability.
    /// Callers run their own duplicate checks first.
    pub(super) async fn insert_booking(
        &self,
        rs: &mut SlotState,
        user_id: UserId,
        load_type: LoadType,
        now: Timestamp,
    ) -> Result<Booking, EngineError> {
        let required = load_type.machines();
        let available = rs.slot.visible_available();
        if available < required {
            return Err(EngineError::SlotFull { available, required });
        }
        let booking = new_booking(rs, user_id, load_type, now);
        let event = Event::BookingCreated {
            booking: booking.clone(),
            available_machines: rs.slot.available_machines - required,
        };
        self.persist_and_apply(rs, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::debug!("booking {} on slot {} for user {user_id}", booking.id, rs.slot.id);
        Ok(booking)
    }

    /// A user who books a slot directly gives up their place in its queue.
    /// The booking is already durable, so a failure here is only logged;
    /// promotion closes any entry left behind.
    async fn leave_queue_after_booking(&self, rs: &mut SlotState, user_id: UserId) {
        let Some(entry) = rs.waiting_for(user_id).cloned() else {
            return;
        };
        tracing::debug!("user {user_id} booked slot {} directly, leaving its waitlist", rs.slot.id);
        if let Err(e) = self.withdraw(rs, &entry).await {
            tracing::warn!("waitlist entry {} left open: {e}", entry.id);
        }
    }

    /// Staff-driven lifecycle step (receive, wash, complete, no-show, cancel).
    pub async fn advance_status(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        target: BookingStatus,
    ) -> Result<TransitionOutcome, EngineError> {
        if !actor.is_staff() {
            return Err(EngineError::Forbidden("only attendants and admins can change booking status"));
        }
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        self.transition(&mut guard, booking_id, target, true).await
    }

    /// Attendant check-in by ticket: `confirmed → received`.
    pub async fn check_in(&self, actor: &Actor, ticket_id: Ulid) -> Result<Booking, EngineError> {
        if !actor.is_staff() {
            return Err(EngineError::Forbidden("only attendants and admins can check in"));
        }
        let booking_id = self
            .store
            .booking_for_ticket(&ticket_id)
            .ok_or(EngineError::NotFound(ticket_id))?;
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let outcome = self
            .transition(&mut guard, booking_id, BookingStatus::Received, false)
            .await?;
        Ok(outcome.booking)
    }

    pub async fn cancel_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
    ) -> Result<TransitionOutcome, EngineError> {
        let mut guard = self.resolve_entity_write(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        if !actor.is_staff() {
            if booking.user_id != actor.user_id {
                return Err(EngineError::Forbidden("cannot cancel another user's booking"));
            }
            if !matches!(booking.status, BookingStatus::Confirmed | BookingStatus::Received) {
                return Err(EngineError::InvalidTransition {
                    from: booking.status,
                    to: BookingStatus::Cancelled,
                });
            }
            if self.now() > guard.slot.start_time - self.config.cancel_cutoff {
                return Err(EngineError::Conflict(format!(
                    "bookings can only be cancelled up to {} minutes before the slot starts",
                    self.config.cancel_cutoff.num_minutes()
                )));
            }
        }
        self.transition(&mut guard, booking_id, BookingStatus::Cancelled, true)
            .await
    }

    /// Apply one edge of the lifecycle. Terminal targets hand the machines back;
    /// cancellations and no-shows then let the waitlist move when `promote` is set.
    async fn transition(
        &self,
        rs: &mut SlotState,
        booking_id: Ulid,
        target: BookingStatus,
        promote: bool,
    ) -> Result<TransitionOutcome, EngineError> {
        let booking = rs
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if !booking.status.can_transition_to(target) {
            return Err(EngineError::InvalidTransition {
                from: booking.status,
                to: target,
            });
        }

        // available = capacity - machines still held, floored at zero
        let available_machines = if target.is_terminal() {
            let remaining = rs.consumed().saturating_sub(booking.machines_used);
            rs.slot.capacity.saturating_sub(remaining)
        } else {
            rs.slot.available_machines
        };
        let now = self.now();
        let event = Event::BookingStatusChanged {
            id: booking_id,
            slot_id: rs.slot.id,
            user_id: booking.user_id,
            status: target,
            at: now,
            available_machines,
        };
        self.persist_and_apply(rs, &event).await?;
        metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "status" => target.as_str())
            .increment(1);
        tracing::debug!("booking {booking_id}: {} -> {target}", booking.status);

        let mut promoted = Vec::new();
        if promote && matches!(target, BookingStatus::Cancelled | BookingStatus::NoShow) {
            // The status change is already durable; a failed promotion is retried
            // the next time capacity moves on this slot.
            match self.promote_waiting(rs).await {
                Ok(p) => promoted = p,
                Err(e) => tracing::warn!("promotion on slot {} failed: {e}", rs.slot.id),
            }
        }

        let booking = rs
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        Ok(TransitionOutcome { booking, promoted })
    }

    /// Students see their own bookings only; staff may filter by user.
    pub async fn list_bookings(
        &self,
        actor: &Actor,
        filter: &BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        let user_id = if actor.is_staff() {
            filter.user_id
        } else {
            Some(actor.user_id)
        };

        let _gate = self.gate_read().await?;
        let mut rows = Vec::new();
        for slot_id in self.store.slot_ids() {
            let Some(guard) = self.read_slot(slot_id).await? else {
                continue;
            };
            if filter.date.is_some_and(|d| guard.slot.date != d) {
                continue;
            }
            for b in &guard.bookings {
                if user_id.is_some_and(|u| b.user_id != u)
                    || filter.status.is_some_and(|s| b.status != s)
                {
                    continue;
                }
                rows.push((guard.slot.start_time, b.clone()));
            }
        }
        rows.sort_by_key(|(start, b)| (*start, b.created_at, b.id));
        Ok(rows.into_iter().map(|(_, b)| b).collect())
    }

    /// Mark confirmed bookings that were never dropped off as no-shows once
    /// their slot is within `checkin_lead` of starting, handing each freed
    /// machine to the waitlist. Returns how many were marked.
    ///
    /// Only bookings confirmed before the pass are marked; anyone promoted
    /// here is judged on the next pass.
    pub async fn sweep_no_shows(&self, now: Timestamp) -> Result<usize, EngineError> {
        let threshold = now + self.config.checkin_lead;
        let mut marked = 0;

        for slot_id in self.store.slot_ids() {
            let due = match self.read_slot(slot_id).await {
                Ok(Some(guard)) => {
                    guard.slot.start_time <= threshold
                        && guard.bookings.iter().any(|b| b.status == BookingStatus::Confirmed)
                }
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!("no-show sweep skipped slot {slot_id}: {e}");
                    false
                }
            };
            if !due {
                continue;
            }

            let mut guard = match self.lock_slot(slot_id).await {
                Ok(g) => g,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => {
                    tracing::warn!("no-show sweep skipped slot {slot_id}: {e}");
                    continue;
                }
            };
            let ids: Vec<Ulid> = guard
                .bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Confirmed)
                .map(|b| b.id)
                .collect();
            for id in ids {
                self.transition(&mut guard, id, BookingStatus::NoShow, true)
                    .await?;
                marked += 1;
            }
        }
        if marked > 0 {
            tracing::info!("marked {marked} bookings as no-show");
        }
        Ok(marked)
    }
}

fn check_bookable(rs: &SlotState, actor: &Actor, now: Timestamp) -> Result<(), EngineError> {
    if rs.slot.start_time <= now {
        return Err(EngineError::Validation("slot has already started".into()));
    }
    if let Some(existing) = rs.active_booking_for(actor.user_id) {
        return Err(EngineError::DuplicateBooking(existing.id));
    }
    Ok(())
}

pub(super) fn new_booking(rs: &SlotState, user_id: UserId, load_type: LoadType, now: Timestamp) -> Booking {
    Booking {
        id: Ulid::new(),
        ticket_id: Ulid::new(),
        user_id,
        slot_id: rs.slot.id,
        load_type,
        machines_used: load_type.machines(),
        status: BookingStatus::Confirmed,
        created_at: now,
        updated_at: now,
    }
}
