use ulid::Ulid;

use crate::model::*;

use super::ledger::new_booking;
use super::{Engine, EngineError};

impl Engine {
    pub async fn join_waitlist(
        &self,
        actor: &Actor,
        slot_id: Ulid,
        load_type: LoadType,
    ) -> Result<WaitlistEntry, EngineError> {
        let mut guard = self.lock_slot(slot_id).await?;
        let now = self.now();
        if guard.slot.start_time <= now {
            return Err(EngineError::Validation("slot has already started".into()));
        }
        if let Some(existing) = guard.active_booking_for(actor.user_id) {
            return Err(EngineError::DuplicateBooking(existing.id));
        }
        self.enqueue(&mut guard, actor.user_id, load_type, now).await
    }

    /// Append to the back of the queue. Caller holds the slot lock.
    pub(super) async fn enqueue(
        &self,
        rs: &mut SlotState,
        user_id: UserId,
        load_type: LoadType,
        now: Timestamp,
    ) -> Result<WaitlistEntry, EngineError> {
        if let Some(existing) = rs.waiting_for(user_id) {
            return Err(EngineError::AlreadyWaiting(existing.id));
        }
        let waiting = rs.waiting_count();
        if waiting >= self.config.waitlist_cap {
            return Err(EngineError::WaitlistFull(self.config.waitlist_cap));
        }

        let entry = WaitlistEntry {
            id: Ulid::new(),
            user_id,
            slot_id: rs.slot.id,
            load_type,
            position: waiting + 1,
            status: WaitlistStatus::Waiting,
            created_at: now,
            booking_id: None,
        };
        self.persist_and_apply(rs, &Event::WaitlistJoined { entry: entry.clone() })
            .await?;
        tracing::debug!("user {user_id} waiting on slot {} at #{}", rs.slot.id, entry.position);
        Ok(entry)
    }

    /// Leave the queue. Owners and staff only. The new head moves up if it fits.
    pub async fn leave_waitlist(&self, actor: &Actor, entry_id: Ulid) -> Result<WaitlistEntry, EngineError> {
        let mut guard = self.resolve_entity_write(&entry_id).await?;
        let entry = guard
            .entry(entry_id)
            .cloned()
            .ok_or(EngineError::NotFound(entry_id))?;
        if !actor.is_staff() && entry.user_id != actor.user_id {
            return Err(EngineError::Forbidden("cannot remove another user's waitlist entry"));
        }
        if entry.status != WaitlistStatus::Waiting {
            return Err(EngineError::Conflict(format!(
                "waitlist entry {entry_id} is no longer waiting"
            )));
        }

        self.withdraw(&mut guard, &entry).await?;
        guard
            .entry(entry_id)
            .cloned()
            .ok_or(EngineError::NotFound(entry_id))
    }

    /// Close a waiting entry, then promote behind it. Caller holds the slot lock.
    pub(super) async fn withdraw(
        &self,
        rs: &mut SlotState,
        entry: &WaitlistEntry,
    ) -> Result<Vec<Booking>, EngineError> {
        let event = Event::WaitlistLeft {
            id: entry.id,
            slot_id: entry.slot_id,
            user_id: entry.user_id,
        };
        self.persist_and_apply(rs, &event).await?;
        // The entry is already closed; a failed promotion is retried the next
        // time capacity moves on this slot.
        match self.promote_waiting(rs).await {
            Ok(promoted) => Ok(promoted),
            Err(e) => {
                tracing::warn!("promotion on slot {} failed: {e}", rs.slot.id);
                Ok(Vec::new())
            }
        }
    }

    /// Waiting entries visible to the actor, by slot start then position.
    pub async fn list_waitlist(&self, actor: &Actor) -> Result<Vec<WaitlistEntry>, EngineError> {
        let _gate = self.gate_read().await?;
        let mut rows = Vec::new();
        for slot_id in self.store.slot_ids() {
            let Some(guard) = self.read_slot(slot_id).await? else {
                continue;
            };
            for e in guard.waiting() {
                if actor.is_staff() || e.user_id == actor.user_id {
                    rows.push((guard.slot.start_time, e.clone()));
                }
            }
        }
        rows.sort_by_key(|(start, e)| (*start, e.slot_id, e.position));
        Ok(rows.into_iter().map(|(_, e)| e).collect())
    }

    /// Turn waiting entries into bookings, head first, while the head fits.
    ///
    /// Stops at the first head that needs more than is free; a smaller request
    /// further back never jumps the queue. Caller holds the slot lock.
    pub(super) async fn promote_waiting(&self, rs: &mut SlotState) -> Result<Vec<Booking>, EngineError> {
        let now = self.now();
        let mut promoted = Vec::new();
        if rs.slot.start_time <= now {
            return Ok(promoted);
        }

        while let Some(head) = rs.head_waiting().cloned() {
            // one live booking per user and slot: a head already holding one just leaves
            if rs.active_booking_for(head.user_id).is_some() {
                let event = Event::WaitlistLeft {
                    id: head.id,
                    slot_id: rs.slot.id,
                    user_id: head.user_id,
                };
                self.persist_and_apply(rs, &event).await?;
                continue;
            }
            let required = head.load_type.machines();
            if rs.slot.visible_available() < required {
                break;
            }
            let booking = new_booking(rs, head.user_id, head.load_type, now);
            let event = Event::WaitlistPromoted {
                id: head.id,
                slot_id: rs.slot.id,
                user_id: head.user_id,
                booking: booking.clone(),
                available_machines: rs.slot.available_machines - required,
            };
            self.persist_and_apply(rs, &event).await?;
            metrics::counter!(crate::observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
            tracing::info!(
                "promoted user {} from waitlist on slot {} (booking {})",
                head.user_id,
                rs.slot.id,
                booking.id
            );
            promoted.push(booking);
        }
        Ok(promoted)
    }

    /// Close out waiting entries on slots that have started. Returns how many expired.
    pub async fn expire_waitlists(&self, now: Timestamp) -> Result<usize, EngineError> {
        let mut expired = 0;
        for slot_id in self.store.slot_ids() {
            let due = match self.read_slot(slot_id).await {
                Ok(Some(guard)) => guard.slot.start_time <= now && guard.waiting_count() > 0,
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!("waitlist expiry skipped slot {slot_id}: {e}");
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
                    tracing::warn!("waitlist expiry skipped slot {slot_id}: {e}");
                    continue;
                }
            };
            while let Some(head) = guard.head_waiting().cloned() {
                let event = Event::WaitlistExpired {
                    id: head.id,
                    slot_id,
                    user_id: head.user_id,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!("expired {expired} waitlist entries");
        }
        Ok(expired)
    }
}
