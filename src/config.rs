use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;

use crate::engine::{DailySchedule, EngineConfig};
use crate::limits::*;

/// Process configuration, read from `SLOTWASH_*` environment variables.
/// Unset or unparsable values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub regenerate_interval: Duration,
    pub sweep_interval: Duration,
    /// Machines seeded into an empty registry: `seed_pairs × machines_per_pair`.
    pub seed_pairs: u32,
    pub machines_per_pair: u32,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7070,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            metrics_port: None,
            compact_threshold: 1000,
            regenerate_interval: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            seed_pairs: 5,
            machines_per_pair: 2,
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars(lookup);
        let defaults = Self::default();
        let engine_defaults = EngineConfig::default();
        let schedule_defaults = DailySchedule::default();

        let schedule = DailySchedule {
            open: vars.time("OPEN").unwrap_or(schedule_defaults.open),
            close: vars.time("CLOSE").unwrap_or(schedule_defaults.close),
            slot_minutes: vars.parsed("SLOT_MINUTES").unwrap_or(schedule_defaults.slot_minutes),
            stagger_minutes: vars.parsed("STAGGER_MINUTES").unwrap_or(schedule_defaults.stagger_minutes),
        };

        let engine = EngineConfig {
            schedule,
            waitlist_cap: vars.parsed("WAITLIST_CAP").unwrap_or(engine_defaults.waitlist_cap),
            lock_timeout: vars.parsed("LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(engine_defaults.lock_timeout),
            cancel_cutoff: vars.parsed("CANCEL_CUTOFF_MINUTES")
                .map(chrono::Duration::minutes)
                .unwrap_or(engine_defaults.cancel_cutoff),
            checkin_lead: vars.parsed("CHECKIN_LEAD_MINUTES")
                .map(chrono::Duration::minutes)
                .unwrap_or(engine_defaults.checkin_lead),
            horizon_days: vars.parsed::<u32>("HORIZON_DAYS")
                .map(|d| d.clamp(1, MAX_HORIZON_DAYS))
                .unwrap_or(engine_defaults.horizon_days),
        };

        Self {
            bind: vars.raw("BIND").unwrap_or(defaults.bind),
            port: vars.parsed("PORT").unwrap_or(defaults.port),
            data_dir: vars.raw("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            max_connections: vars.parsed("MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            metrics_port: vars.parsed("METRICS_PORT"),
            compact_threshold: vars.parsed("COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            regenerate_interval: vars.interval("REGENERATE_INTERVAL_SECS")
                .unwrap_or(defaults.regenerate_interval),
            sweep_interval: vars.interval("SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval),
            seed_pairs: vars.parsed("SEED_PAIRS").unwrap_or(defaults.seed_pairs),
            machines_per_pair: vars.parsed("MACHINES_PER_PAIR").unwrap_or(defaults.machines_per_pair),
            engine,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotwash.wal")
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(&format!("SLOTWASH_{key}"))
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.raw(key).and_then(|v| v.trim().parse().ok())
    }

    /// Whole seconds, at least one. A zero period is treated like garbage.
    fn interval(&self, key: &str) -> Option<Duration> {
        self.parsed::<u64>(key)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// `HH:MM` or `HH:MM:SS`.
    fn time(&self, key: &str) -> Option<NaiveTime> {
        let raw = self.raw(key)?;
        let raw = raw.trim();
        NaiveTime::parse_from_str(raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
            .ok()
    }
}
