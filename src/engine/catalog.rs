use chrono::{Duration, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Materialize slots for `days` days starting at `from`. Returns the number created.
    ///
    /// Keys already present are skipped, so running this again never touches
    /// existing slots or their bookings.
    pub async fn generate_slots(&self, from: NaiveDate, days: u32) -> Result<usize, EngineError> {
        validate_horizon(days)?;
        let _gate = self.gate_write().await?;
        self.generate_under_gate(from, days).await
    }

    async fn generate_under_gate(&self, from: NaiveDate, days: u32) -> Result<usize, EngineError> {
        let now = self.now();
        let pairs = self.registry.pairs();
        let mut created = 0;

        for offset in 0..days {
            let date = from + Duration::days(offset as i64);
            for &pair_id in &pairs {
                let capacity = self.registry.ceiling(pair_id);
                for (start_time, end_time) in self.config.schedule.windows(date, pair_id) {
                    if end_time <= now || self.store.contains_key(pair_id, start_time) {
                        continue;
                    }
                    let slot = Slot {
                        id: Ulid::new(),
                        pair_id,
                        date,
                        start_time,
                        end_time,
                        capacity,
                        available_machines: capacity,
                        enabled: true,
                    };
                    self.wal_append(&Event::SlotCreated { slot: slot.clone() })
                        .await?;
                    self.store.insert_slot(SlotState::new(slot));
                    created += 1;
                }
            }
        }
        Ok(created)
    }

    /// Drop slots that have ended without ever holding a booking.
    async fn prune_under_gate(&self) -> Result<usize, EngineError> {
        let now = self.now();
        let mut pruned = 0;
        for slot_id in self.store.slot_ids() {
            let Some(shared) = self.store.get_slot(&slot_id) else {
                continue;
            };
            let Ok(mut guard) = shared.try_write_owned() else {
                continue;
            };
            if guard.removed || guard.slot.end_time > now || !guard.bookings.is_empty() {
                continue;
            }
            self.wal_append(&Event::SlotDeleted { id: slot_id }).await?;
            self.store.apply_event(&mut guard, &Event::SlotDeleted { id: slot_id });
            self.store.remove_slot(&guard);
            pruned += 1;
        }
        Ok(pruned)
    }

    /// Generate `horizon` days from today, then prune ended empty slots, all
    /// behind the catalog gate so queries never see a half-built catalog.
    pub async fn run_regeneration(&self, horizon: u32) -> Result<RegenerateReport, EngineError> {
        validate_horizon(horizon)?;
        let _gate = self.gate_write().await?;
        let today = self.now().date();
        let created = self.generate_under_gate(today, horizon).await?;
        let pruned = self.prune_under_gate().await?;
        if created > 0 || pruned > 0 {
            tracing::info!("regenerated slots: {created} created, {pruned} pruned");
        }
        Ok(RegenerateReport { created, pruned })
    }

    /// Admin-triggered regeneration.
    pub async fn regenerate(
        &self,
        actor: &Actor,
        horizon: Option<u32>,
    ) -> Result<RegenerateReport, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only admins can regenerate slots"));
        }
        self.run_regeneration(horizon.unwrap_or(self.config.horizon_days))
            .await
    }

    pub async fn query_slots(
        &self,
        date: Option<NaiveDate>,
        pair_id: Option<PairId>,
    ) -> Result<Vec<SlotInfo>, EngineError> {
        let _gate = self.gate_read().await?;
        let ids = match pair_id {
            Some(p) => self.store.slots_of_pair(p),
            None => self.store.slot_ids(),
        };

        let mut out = Vec::new();
        for id in ids {
            let Some(guard) = self.read_slot(id).await? else {
                continue;
            };
            if date.is_none_or(|d| guard.slot.date == d) {
                out.push(SlotInfo::from_state(&guard));
            }
        }
        out.sort_by_key(|s| (s.date, s.start_time, s.pair_id));
        Ok(out)
    }

    pub async fn get_slot_info(&self, slot_id: Ulid) -> Result<SlotInfo, EngineError> {
        let _gate = self.gate_read().await?;
        self.read_slot(slot_id)
            .await?
            .map(|guard| SlotInfo::from_state(&guard))
            .ok_or(EngineError::NotFound(slot_id))
    }

    /// Disabling keeps the counter. Enabling recomputes it against the
    /// current ceiling and lets the waitlist move.
    pub async fn set_enabled(
        &self,
        actor: &Actor,
        slot_id: Ulid,
        enabled: bool,
    ) -> Result<SlotInfo, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only admins can enable or disable slots"));
        }
        let mut guard = self.lock_slot(slot_id).await?;
        if guard.slot.enabled == enabled {
            return Ok(SlotInfo::from_state(&guard));
        }

        let available_machines = if enabled {
            guard.slot.capacity.saturating_sub(guard.consumed())
        } else {
            guard.slot.available_machines
        };
        let event = Event::SlotEnabledChanged {
            id: slot_id,
            enabled,
            available_machines,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("slot {slot_id} enabled={enabled}");

        if enabled {
            self.promote_waiting(&mut guard).await?;
        }
        Ok(SlotInfo::from_state(&guard))
    }

    /// Remove a slot with no live bookings, along with its history.
    pub async fn delete_slot(&self, actor: &Actor, slot_id: Ulid) -> Result<(), EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only admins can delete slots"));
        }
        let _gate = self.gate_write().await?;
        let mut guard = self.lock_slot(slot_id).await?;
        if guard.has_active_bookings() {
            return Err(EngineError::Conflict(format!(
                "slot {slot_id} still has active bookings"
            )));
        }
        self.persist_and_apply(&mut guard, &Event::SlotDeleted { id: slot_id })
            .await?;
        self.store.remove_slot(&guard);
        tracing::info!("slot {slot_id} deleted");
        Ok(())
    }
}

fn validate_horizon(days: u32) -> Result<(), EngineError> {
    if days == 0 {
        return Err(EngineError::Validation("days must be at least 1".into()));
    }
    if days > MAX_HORIZON_DAYS {
        return Err(EngineError::LimitExceeded("regeneration horizon too long"));
    }
    Ok(())
}
