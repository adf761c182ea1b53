//! Adaptive inter-attempt delay for one account.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ThrottleConfig {
    /// Seed delay for every new job.
    pub min_delay: Duration,
    /// Cap applied after each non-flood attempt.
    pub max_delay: Duration,
    /// Fractional growth per non-flood attempt (0.1 = +10%).
    pub increment: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            increment: 0.1,
        }
    }
}

/// Per-job delay state. Not persisted: a fresh job starts at `min_delay`.
///
/// Growth applies to every non-flood outcome, success included; the delay
/// steadily stretches as the session ages rather than acting as a failure
/// penalty.
#[derive(Clone, Debug)]
pub struct Throttle {
    cfg: ThrottleConfig,
    delay_secs: f64,
}

impl Throttle {
    pub fn new(cfg: ThrottleConfig) -> Self {
        Self {
            cfg,
            delay_secs: cfg.min_delay.as_secs_f64(),
        }
    }

    /// Saturates at [`Duration::MAX`] for flood waits too large to represent.
    pub fn current_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay_secs).unwrap_or(Duration::MAX)
    }

    /// Any outcome other than a flood wait: grow by `increment`, clamp to `max_delay`.
    pub fn on_attempt_completed(&mut self) {
        let grown = self.delay_secs * (1.0 + self.cfg.increment);
        self.delay_secs = grown.min(self.cfg.max_delay.as_secs_f64());
    }

    /// Server-mandated cooldown: the delay becomes a floor of `server_seconds`.
    ///
    /// Never lowers the delay. Not clamped to `max_delay`; the next
    /// [`Throttle::on_attempt_completed`] brings it back under the cap.
    pub fn on_flood_wait(&mut self, server_seconds: u64) {
        self.delay_secs = self.delay_secs.max(server_seconds as f64);
    }
}
