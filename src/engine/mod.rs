mod catalog;
mod error;
mod ledger;
mod registry;
mod schedule;
mod store;
mod waitlist;

pub use error::EngineError;
pub use ledger::BookingRequest;
pub use registry::Registry;
pub use schedule::DailySchedule;
pub use store::SlotStore;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{
    Mutex, MutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Wal, WalHandle};

pub type SharedSlotState = Arc<RwLock<SlotState>>;

/// Source of "now". Swapped out in tests to drive time-dependent rules.
pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

pub fn local_clock() -> Clock {
    Arc::new(|| chrono::Local::now().naive_local())
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub schedule: DailySchedule,
    /// Max simultaneously waiting entries per slot.
    pub waitlist_cap: u32,
    /// Per-attempt wait for a slot lock.
    pub lock_timeout: std::time::Duration,
    /// Students may not cancel closer than this to the slot start.
    pub cancel_cutoff: chrono::Duration,
    /// Confirmed bookings not checked in this long before start become no-shows.
    pub checkin_lead: chrono::Duration,
    pub horizon_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule: DailySchedule::default(),
            waitlist_cap: DEFAULT_WAITLIST_CAP,
            lock_timeout: std::time::Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            cancel_cutoff: chrono::Duration::minutes(DEFAULT_CANCEL_CUTOFF_MINUTES),
            checkin_lead: chrono::Duration::minutes(DEFAULT_CHECKIN_LEAD_MINUTES),
            horizon_days: DEFAULT_HORIZON_DAYS,
        }
    }
}

pub struct Engine {
    store: SlotStore,
    registry: Registry,
    /// Readers: slot queries. Writer: generation, pruning and deletion of slots.
    catalog_gate: RwLock<()>,
    /// Serializes machine status changes so each pair reconciles against one ceiling at a time.
    registry_lock: Mutex<()>,
    wal: WalHandle,
    pub notify: Arc<NotifyHub>,
    config: EngineConfig,
    clock: Clock,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        config
            .schedule
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);

        let engine = Self {
            store: SlotStore::new(),
            registry: Registry::new(),
            catalog_gate: RwLock::new(()),
            registry_lock: Mutex::new(()),
            wal,
            notify,
            config,
            clock: local_clock(),
        };

        // Nothing else holds these locks yet, so try_write always succeeds.
        // blocking_write would panic when called from inside the runtime.
        for event in &events {
            match event {
                Event::MachineRegistered { .. } | Event::MachineStatusChanged { .. } => {
                    engine.registry.apply_event(event);
                }
                Event::SlotCreated { slot } => {
                    engine.store.insert_slot(SlotState::new(slot.clone()));
                }
                other => {
                    if let Some(slot_id) = other.slot_id()
                        && let Some(shared) = engine.store.get_slot(&slot_id)
                        && let Ok(mut guard) = shared.try_write()
                    {
                        engine.store.apply_event(&mut guard, other);
                        if guard.removed {
                            engine.store.remove_slot(&guard);
                        }
                    }
                }
            }
        }

        tracing::info!(
            "replayed {} events: {} machines, {} slots",
            events.len(),
            engine.registry.len(),
            engine.store.slot_count()
        );
        Ok(engine)
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Timestamp {
        (self.clock)()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn slot_count(&self) -> usize {
        self.store.slot_count()
    }

    // ── Persistence ─────────────────────────────────────────

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply under the caller's slot lock, then notify.
    async fn persist_and_apply(&self, rs: &mut SlotState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(rs, event);
        self.publish(event);
        Ok(())
    }

    fn publish(&self, event: &Event) {
        if let Some(user_id) = event.user_id() {
            self.notify.send(user_id, event);
        }
    }

    // ── Locking ─────────────────────────────────────────────

    /// Up to `MAX_LOCK_ATTEMPTS` waits of `lock_timeout` each. `None` when every attempt timed out.
    async fn bounded<T, F>(&self, what: &str, acquire: impl Fn() -> F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        for attempt in 1..=MAX_LOCK_ATTEMPTS {
            if let Ok(guard) = tokio::time::timeout(self.config.lock_timeout, acquire()).await {
                return Some(guard);
            }
            metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
            tracing::debug!("{what} lock attempt {attempt} timed out");
        }
        None
    }

    /// Shared catalog gate: slot listings and cross-slot scans.
    async fn gate_read(&self) -> Result<RwLockReadGuard<'_, ()>, EngineError> {
        self.bounded("catalog", || self.catalog_gate.read())
            .await
            .ok_or(EngineError::LockBusy("catalog"))
    }

    /// Exclusive catalog gate: slots appear or disappear under it.
    async fn gate_write(&self) -> Result<RwLockWriteGuard<'_, ()>, EngineError> {
        self.bounded("catalog", || self.catalog_gate.write())
            .await
            .ok_or(EngineError::LockBusy("catalog"))
    }

    async fn registry_guard(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.bounded("registry", || self.registry_lock.lock())
            .await
            .ok_or(EngineError::LockBusy("registry"))
    }

    /// Take a slot's write lock with a bounded wait, then bring its capacity in
    /// line with the pair's current machine count.
    async fn lock_slot(&self, slot_id: Ulid) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let shared = self
            .store
            .get_slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;

        let mut guard = self
            .bounded("slot", || shared.clone().write_owned())
            .await
            .ok_or(EngineError::Busy(slot_id))?;
        if guard.removed {
            return Err(EngineError::NotFound(slot_id));
        }
        self.reconcile(&mut guard).await?;
        Ok(guard)
    }

    /// Bounded read lock for queries. `None` if the slot is gone.
    async fn read_slot(
        &self,
        slot_id: Ulid,
    ) -> Result<Option<OwnedRwLockReadGuard<SlotState>>, EngineError> {
        let Some(shared) = self.store.get_slot(&slot_id) else {
            return Ok(None);
        };
        let guard = self
            .bounded("slot", || shared.clone().read_owned())
            .await
            .ok_or(EngineError::Busy(slot_id))?;
        Ok((!guard.removed).then_some(guard))
    }

    /// Entity (booking / waitlist entry) → its slot, write-locked.
    async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SlotState>, EngineError> {
        let slot_id = self
            .store
            .slot_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.lock_slot(slot_id).await
    }

    /// Clamp (or restore) a slot that has not ended to the pair's effective capacity.
    /// A counter that goes up runs promotion.
    async fn reconcile(&self, rs: &mut SlotState) -> Result<(), EngineError> {
        if rs.slot.end_time <= self.now() {
            return Ok(());
        }
        let ceiling = self.registry.ceiling(rs.slot.pair_id);
        let available = ceiling.saturating_sub(rs.consumed());
        if rs.slot.capacity == ceiling && rs.slot.available_machines == available {
            return Ok(());
        }

        let raised = available > rs.slot.available_machines;
        tracing::info!(
            "slot {} capacity {} -> {ceiling}, available {} -> {available}",
            rs.slot.id,
            rs.slot.capacity,
            rs.slot.available_machines
        );
        let event = Event::SlotCapacityChanged {
            id: rs.slot.id,
            capacity: ceiling,
            available_machines: available,
        };
        self.persist_and_apply(rs, &event).await?;
        if raised {
            self.promote_waiting(rs).await?;
        }
        Ok(())
    }

    // ── Compaction ──────────────────────────────────────────

    /// Rewrite the WAL as the minimal event set that recreates current state.
    ///
    /// Holds the catalog gate, the registry lock and a read guard on every slot
    /// for the duration, so no append can land between snapshot and swap.
    /// Gives up with a retryable error if any of them stays held too long.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate_write().await?;
        let _registry = self.registry_guard().await?;

        let mut events: Vec<Event> = self
            .registry
            .list(None)
            .into_iter()
            .map(|machine| Event::MachineRegistered { machine })
            .collect();

        let mut guards = Vec::new();
        for slot_id in self.store.slot_ids() {
            if let Some(shared) = self.store.get_slot(&slot_id) {
                let guard = self
                    .bounded("slot", || shared.clone().read_owned())
                    .await
                    .ok_or(EngineError::Busy(slot_id))?;
                guards.push(guard);
            }
        }
        guards.sort_by_key(|g| (g.slot.start_time, g.slot.pair_id));

        for rs in &guards {
            events.push(Event::SlotCreated { slot: rs.slot.clone() });
            for booking in &rs.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                    available_machines: rs.slot.available_machines,
                });
            }
            for entry in &rs.waitlist {
                events.push(Event::WaitlistJoined { entry: entry.clone() });
            }
        }

        let result = self
            .wal
            .compact(events)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
