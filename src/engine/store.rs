use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedSlotState;

/// Concurrent slot table plus the lookup indexes derived from it.
pub struct SlotStore {
    slots: DashMap<Ulid, SharedSlotState>,
    /// Booking / waitlist entry id → slot id
    entity_to_slot: DashMap<Ulid, Ulid>,
    /// Ticket id → booking id
    tickets: DashMap<Ulid, Ulid>,
    /// One slot per pair and start time.
    keys: DashMap<(PairId, Timestamp), Ulid>,
    pair_slots: DashMap<PairId, Vec<Ulid>>,
}

impl Default for SlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            entity_to_slot: DashMap::new(),
            tickets: DashMap::new(),
            keys: DashMap::new(),
            pair_slots: DashMap::new(),
        }
    }

    // ── Slot CRUD ────────────────────────────────────────────

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn get_slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_ids(&self) -> Vec<Ulid> {
        self.slots.iter().map(|e| *e.key()).collect()
    }

    pub fn contains_key(&self, pair_id: PairId, start: Timestamp) -> bool {
        self.keys.contains_key(&(pair_id, start))
    }

    pub fn slots_of_pair(&self, pair_id: PairId) -> Vec<Ulid> {
        self.pair_slots
            .get(&pair_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn insert_slot(&self, state: SlotState) {
        let id = state.slot.id;
        let pair_id = state.slot.pair_id;
        self.keys.insert((pair_id, state.slot.start_time), id);
        self.pair_slots.entry(pair_id).or_default().push(id);
        for b in &state.bookings {
            self.map_booking(b);
        }
        for e in &state.waitlist {
            self.entity_to_slot.insert(e.id, id);
        }
        self.slots.insert(id, Arc::new(RwLock::new(state)));
    }

    /// Drop a slot and every index entry pointing into it. The caller holds the
    /// slot's write lock (or is replaying) and passes its state in.
    pub fn remove_slot(&self, rs: &SlotState) {
        let id = rs.slot.id;
        for b in &rs.bookings {
            self.entity_to_slot.remove(&b.id);
            self.tickets.remove(&b.ticket_id);
        }
        for e in &rs.waitlist {
            self.entity_to_slot.remove(&e.id);
        }
        self.keys.remove(&(rs.slot.pair_id, rs.slot.start_time));
        if let Some(mut ids) = self.pair_slots.get_mut(&rs.slot.pair_id) {
            ids.retain(|s| *s != id);
        }
        self.slots.remove(&id);
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn slot_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_slot.get(entity_id).map(|e| *e.value())
    }

    pub fn booking_for_ticket(&self, ticket_id: &Ulid) -> Option<Ulid> {
        self.tickets.get(ticket_id).map(|e| *e.value())
    }

    fn map_booking(&self, booking: &Booking) {
        self.entity_to_slot.insert(booking.id, booking.slot_id);
        self.tickets.insert(booking.ticket_id, booking.id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply a slot-scoped event. No locking here: the caller holds the slot lock.
    pub fn apply_event(&self, rs: &mut SlotState, event: &Event) {
        match event {
            Event::SlotCapacityChanged {
                capacity,
                available_machines,
                ..
            } => {
                rs.slot.capacity = *capacity;
                rs.slot.available_machines = *available_machines;
            }
            Event::SlotEnabledChanged {
                enabled,
                available_machines,
                ..
            } => {
                rs.slot.enabled = *enabled;
                rs.slot.available_machines = *available_machines;
            }
            Event::SlotDeleted { .. } => {
                rs.removed = true;
            }
            Event::BookingCreated {
                booking,
                available_machines,
            } => {
                self.map_booking(booking);
                rs.upsert_booking(booking.clone());
                rs.slot.available_machines = *available_machines;
            }
            Event::BookingStatusChanged {
                id,
                status,
                at,
                available_machines,
                ..
            } => {
                if let Some(b) = rs.booking_mut(*id) {
                    b.status = *status;
                    b.updated_at = *at;
                }
                rs.slot.available_machines = *available_machines;
            }
            Event::WaitlistJoined { entry } => {
                self.entity_to_slot.insert(entry.id, entry.slot_id);
                rs.upsert_entry(entry.clone());
            }
            Event::WaitlistLeft { id, .. } => {
                rs.close_entry(*id, WaitlistStatus::Left);
            }
            Event::WaitlistPromoted {
                id,
                booking,
                available_machines,
                ..
            } => {
                self.map_booking(booking);
                rs.upsert_booking(booking.clone());
                rs.close_entry(*id, WaitlistStatus::Promoted);
                if let Some(e) = rs.waitlist.iter_mut().find(|e| e.id == *id) {
                    e.booking_id = Some(booking.id);
                }
                rs.slot.available_machines = *available_machines;
            }
            Event::WaitlistExpired { id, .. } => {
                rs.close_entry(*id, WaitlistStatus::Expired);
            }
            // Registry events and slot creation are handled above the slot level.
            Event::MachineRegistered { .. }
            | Event::MachineStatusChanged { .. }
            | Event::SlotCreated { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    fn slot(pair_id: PairId, hour: u32) -> Slot {
        let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let start = date.and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap());
        Slot {
            id: Ulid::new(),
            pair_id,
            date,
            start_time: start,
            end_time: start + chrono::Duration::hours(1),
            capacity: 2,
            available_machines: 2,
            enabled: true,
        }
    }

    fn booking_on(slot: &Slot, user_id: UserId) -> Booking {
        Booking {
            id: Ulid::new(),
            ticket_id: Ulid::new(),
            user_id,
            slot_id: slot.id,
            load_type: LoadType::Combined,
            machines_used: 1,
            status: BookingStatus::Confirmed,
            created_at: slot.start_time,
            updated_at: slot.start_time,
        }
    }

    #[test]
    fn insert_indexes_key_and_pair() {
        let store = SlotStore::new();
        let s = slot(3, 9);
        let (id, start) = (s.id, s.start_time);
        store.insert_slot(SlotState::new(s));
        assert_eq!(store.slot_count(), 1);
        assert!(store.contains_key(3, start));
        assert!(!store.contains_key(2, start));
        assert_eq!(store.slots_of_pair(3), vec![id]);
    }

    #[tokio::test]
    async fn booking_event_maps_ticket_and_counter() {
        let store = SlotStore::new();
        let s = slot(1, 10);
        let slot_id = s.id;
        let b = booking_on(&s, 42);
        store.insert_slot(SlotState::new(s));

        let shared = store.get_slot(&slot_id).unwrap();
        let mut guard = shared.write().await;
        store.apply_event(
            &mut guard,
            &Event::BookingCreated {
                booking: b.clone(),
                available_machines: 1,
            },
        );
        assert_eq!(guard.slot.available_machines, 1);
        assert_eq!(store.slot_for_entity(&b.id), Some(slot_id));
        assert_eq!(store.booking_for_ticket(&b.ticket_id), Some(b.id));
    }

    #[tokio::test]
    async fn remove_slot_clears_indexes() {
        let store = SlotStore::new();
        let s = slot(2, 11);
        let b = booking_on(&s, 7);
        let mut state = SlotState::new(s.clone());
        state.bookings.push(b.clone());
        store.insert_slot(state);

        let shared = store.get_slot(&s.id).unwrap();
        let guard = shared.read().await;
        store.remove_slot(&guard);
        drop(guard);

        assert!(store.get_slot(&s.id).is_none());
        assert!(store.slot_for_entity(&b.id).is_none());
        assert!(store.booking_for_ticket(&b.ticket_id).is_none());
        assert!(!store.contains_key(2, s.start_time));
        assert!(store.slots_of_pair(2).is_empty());
    }
}
