use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Machines keyed by id. The per-pair ceiling is derived, never stored.
pub struct Registry {
    machines: DashMap<Ulid, Machine>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            machines: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<Machine> {
        self.machines.get(id).map(|m| m.value().clone())
    }

    /// Effective capacity of a pair: machines currently `available`.
    pub fn ceiling(&self, pair_id: PairId) -> u32 {
        self.machines
            .iter()
            .filter(|m| m.pair_id == pair_id && m.status == MachineStatus::Available)
            .count() as u32
    }

    /// Every pair that has at least one machine, ascending.
    pub fn pairs(&self) -> Vec<PairId> {
        let mut pairs: Vec<PairId> = self.machines.iter().map(|m| m.pair_id).collect();
        pairs.sort_unstable();
        pairs.dedup();
        pairs
    }

    pub fn list(&self, pair_id: Option<PairId>) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self
            .machines
            .iter()
            .filter(|m| pair_id.is_none_or(|p| m.pair_id == p))
            .map(|m| m.value().clone())
            .collect();
        machines.sort_by_key(|m| m.machine_number);
        machines
    }

    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::MachineRegistered { machine } => {
                self.machines.insert(machine.id, machine.clone());
            }
            Event::MachineStatusChanged { id, status, .. } => {
                if let Some(mut m) = self.machines.get_mut(id) {
                    m.status = *status;
                }
            }
            _ => {}
        }
    }
}

impl Engine {
    /// Seed `pairs × per_pair` machines into an empty registry. Returns how many were created.
    pub async fn initialize_machines(&self, pairs: u32, per_pair: u32) -> Result<usize, EngineError> {
        if per_pair == 0 || per_pair > MAX_MACHINES_PER_PAIR {
            return Err(EngineError::LimitExceeded("machines per pair"));
        }
        let total = pairs as usize * per_pair as usize;
        if total > MAX_MACHINES {
            return Err(EngineError::LimitExceeded("too many machines"));
        }

        let _registry = self.registry_guard().await?;
        if !self.registry.is_empty() {
            return Ok(0);
        }
        for n in 1..=total as u32 {
            let event = Event::MachineRegistered {
                machine: Machine {
                    id: Ulid::new(),
                    pair_id: (n - 1) / per_pair + 1,
                    machine_number: n,
                    status: MachineStatus::Available,
                },
            };
            self.wal_append(&event).await?;
            self.registry.apply_event(&event);
        }
        tracing::info!("registered {total} machines in {pairs} pairs");
        Ok(total)
    }

    pub fn list_machines(&self, pair_id: Option<PairId>) -> Vec<Machine> {
        self.registry.list(pair_id)
    }

    pub fn pair_ceiling(&self, pair_id: PairId) -> u32 {
        self.registry.ceiling(pair_id)
    }

    /// Change one machine's status and reconcile every slot of its pair.
    ///
    /// Slots still locked by someone else after the bounded wait keep their old
    /// numbers until the next operation locks them; `lock_slot` reconciles then.
    pub async fn set_machine_status(
        &self,
        actor: &Actor,
        machine_id: Ulid,
        status: MachineStatus,
    ) -> Result<Machine, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Forbidden("only admins can change machine status"));
        }
        let _registry = self.registry_guard().await?;
        let machine = self
            .registry
            .get(&machine_id)
            .ok_or(EngineError::NotFound(machine_id))?;
        if machine.status == status {
            return Ok(machine);
        }

        let event = Event::MachineStatusChanged {
            id: machine_id,
            pair_id: machine.pair_id,
            status,
        };
        self.wal_append(&event).await?;
        self.registry.apply_event(&event);
        tracing::info!(
            "machine {} (pair {}) -> {status:?}, pair ceiling now {}",
            machine.machine_number,
            machine.pair_id,
            self.registry.ceiling(machine.pair_id)
        );

        for slot_id in self.store.slots_of_pair(machine.pair_id) {
            match self.lock_slot(slot_id).await {
                Ok(_guard) => {}
                Err(EngineError::NotFound(_)) => {}
                Err(e) => tracing::warn!("slot {slot_id} not reconciled yet: {e}"),
            }
        }

        Ok(Machine { status, ..machine })
    }
}
