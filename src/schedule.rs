//! Debouncing of periodic state saves. Nothing in here triggers a save, the caller polls
//! [`SaveScheduler::save_state_allowed`] from its main loop.

pub const DEFAULT_SAVE_STATE_PERIOD_MS: u64 = 1000;
pub const MIN_SAVE_STATE_PERIOD_MS: u64 = 1000;

/// Monotonic millisecond clock supplied by the firmware.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_ms(&self) -> u64 {
        T::now_ms(self)
    }
}

/// All arithmetic wraps, so the scheduler keeps working with clocks that overflow.
#[derive(Debug, Clone)]
pub struct SaveScheduler {
    period_ms: u64,
    last_save_ms: u64,
}

impl Default for SaveScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_SAVE_STATE_PERIOD_MS)
    }
}

impl SaveScheduler {
    pub fn new(period_ms: u64) -> Self {
        Self {
            period_ms: period_ms.max(MIN_SAVE_STATE_PERIOD_MS),
            last_save_ms: 0,
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    /// Periods below [`MIN_SAVE_STATE_PERIOD_MS`] are raised to the minimum.
    pub fn set_period(&mut self, period_ms: u64) {
        self.period_ms = period_ms.max(MIN_SAVE_STATE_PERIOD_MS);
    }

    /// Returns true once more than one period elapsed since the last allowed save and restarts
    /// the period.
    pub fn save_state_allowed(&mut self, now_ms: u64) -> bool {
        if now_ms.wrapping_sub(self.last_save_ms) > self.period_ms {
            self.last_save_ms = now_ms;
            return true;
        }
        false
    }

    /// Requests a save no later than `now_ms + delay_ms`. An already earlier save is kept.
    pub fn schedule_save(&mut self, now_ms: u64, delay_ms: u64) {
        let new_last_save_ms = now_ms
            .wrapping_sub(self.period_ms)
            .wrapping_sub(1)
            .wrapping_add(delay_ms);
        if now_ms.wrapping_sub(self.last_save_ms) < now_ms.wrapping_sub(new_last_save_ms) {
            self.last_save_ms = new_last_save_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_is_clamped() {
        let mut scheduler = SaveScheduler::new(10);
        assert_eq!(scheduler.period_ms(), MIN_SAVE_STATE_PERIOD_MS);
        scheduler.set_period(5000);
        assert_eq!(scheduler.period_ms(), 5000);
    }

    #[test]
    fn save_allowed_after_period() {
        let mut scheduler = SaveScheduler::default();
        assert!(!scheduler.save_state_allowed(500));
        assert!(!scheduler.save_state_allowed(1000));
        assert!(scheduler.save_state_allowed(1001));
        assert!(!scheduler.save_state_allowed(1500));
        assert!(!scheduler.save_state_allowed(2001));
        assert!(scheduler.save_state_allowed(2002));
    }

    #[test]
    fn schedule_save_pulls_next_save_forward() {
        let mut scheduler = SaveScheduler::default();
        assert!(scheduler.save_state_allowed(5000));

        scheduler.schedule_save(5100, 200);
        assert!(!scheduler.save_state_allowed(5299));
        assert!(scheduler.save_state_allowed(5300));
    }

    #[test]
    fn schedule_save_never_postpones() {
        let mut scheduler = SaveScheduler::default();
        assert!(scheduler.save_state_allowed(5000));

        scheduler.schedule_save(5100, 100);
        scheduler.schedule_save(5100, 800);
        assert!(scheduler.save_state_allowed(5200));
    }

    #[test]
    fn schedule_save_right_after_boot() {
        let mut scheduler = SaveScheduler::default();
        scheduler.schedule_save(10, 0);
        assert!(scheduler.save_state_allowed(10));
    }
}
