use chrono::{Duration, NaiveDate, NaiveTime};

use crate::model::*;

use super::EngineError;

// ── Daily slot layout ─────────────────────────────────────────────

/// Fixed daily timetable shared by every pair.
///
/// Each pair's timetable is shifted by `stagger_minutes` per pair so that
/// pick-ups at the counter are spread out: pair 1 starts at `open`, pair 2 at
/// `open + stagger`, and so on. The offset wraps at `slot_minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub slot_minutes: u32,
    pub stagger_minutes: u32,
}

impl Default for DailySchedule {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(20, 0, 0).unwrap_or(NaiveTime::MIN),
            slot_minutes: 60,
            stagger_minutes: 10,
        }
    }
}

impl DailySchedule {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.slot_minutes == 0 {
            return Err(EngineError::Validation("slot length must be positive".into()));
        }
        if self.open >= self.close {
            return Err(EngineError::Validation("opening time must precede closing time".into()));
        }
        Ok(())
    }

    /// Offset of a pair's timetable from `open`.
    pub fn pair_offset(&self, pair_id: PairId) -> Duration {
        let minutes = (pair_id.saturating_sub(1) as u64 * self.stagger_minutes as u64)
            % self.slot_minutes.max(1) as u64;
        Duration::minutes(minutes as i64)
    }

    /// Contiguous, non-overlapping `[start, end)` windows for one pair on one day.
    pub fn windows(&self, date: NaiveDate, pair_id: PairId) -> Vec<(Timestamp, Timestamp)> {
        if self.slot_minutes == 0 {
            return Vec::new();
        }
        let offset = self.pair_offset(pair_id);
        let length = Duration::minutes(self.slot_minutes as i64);
        let limit = date.and_time(self.close) + offset;

        let mut out = Vec::new();
        let mut start = date.and_time(self.open) + offset;
        while start + length <= limit {
            out.push((start, start + length));
            start += length;
        }
        out
    }
}
