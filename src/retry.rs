use std::time::Duration;

use tokio::time::Instant;

/// Waits start at `initial_interval` and grow by `multiplier` up to
/// `max_interval`. A batch is given up once the next wait would pass
/// `max_elapsed_time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Duration,
    pub multiplier: f64,
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: Duration::from_secs(300),
            multiplier: 1.5,
        }
    }
}
impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.initial_interval.is_zero() {
            return Err("initial_interval must be greater than zero".into());
        }
        if self.max_interval < self.initial_interval {
            return Err("max_interval must not be less than initial_interval".into());
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err("multiplier must be a finite number >= 1".into());
        }
        Ok(())
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            attempts: 0,
            next_backoff: self.initial_interval,
            started: Instant::now(),
        }
    }

    fn grow(&self, wait: Duration) -> Duration {
        wait.mul_f64(self.multiplier).min(self.max_interval)
    }

    /// Every wait a delivery that always fails instantly goes through.
    pub fn schedule(&self) -> Vec<Duration> {
        let mut waits = vec![];
        if !self.enabled {
            return waits;
        }
        let mut elapsed = Duration::ZERO;
        let mut wait = self.initial_interval;
        while elapsed + wait <= self.max_elapsed_time {
            elapsed += wait;
            waits.push(wait);
            wait = self.grow(wait);
        }
        waits
    }

    /// Deliveries made before a batch that always fails instantly is dropped.
    pub fn max_attempts(&self) -> usize {
        self.schedule().len() + 1
    }
}

/// Retry bookkeeping for one batch on one sink.
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
    next_backoff: Duration,
    started: Instant,
}
impl RetryState {
    /// Records a failed attempt and returns how long to wait before the next
    /// one, or `None` when the batch should be given up.
    pub fn on_failure(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if !self.policy.enabled {
            return None;
        }
        let wait = self.next_backoff;
        if self.elapsed() + wait > self.policy.max_elapsed_time {
            return None;
        }
        self.next_backoff = self.policy.grow(wait);
        Some(wait)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial: u64, max: u64, elapsed: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            initial_interval: Duration::from_secs(initial),
            max_interval: Duration::from_secs(max),
            max_elapsed_time: Duration::from_secs(elapsed),
            multiplier,
        }
    }

    #[test]
    fn schedule_doubles_then_caps() {
        let waits: Vec<u64> = policy(1, 4, 18, 2.0)
            .schedule()
            .iter()
            .map(Duration::as_secs)
            .collect();
        // 1 + 2 + 4 + 4 + 4 = 15; another 4 would pass 18.
        assert_eq!(waits, [1, 2, 4, 4, 4]);
        assert_eq!(policy(1, 4, 18, 2.0).max_attempts(), 6);
    }

    #[test]
    fn disabled_gives_up_at_once() {
        let mut state = RetryPolicy::disabled().start();
        assert_eq!(state.on_failure(), None);
        assert_eq!(state.attempts(), 1);
        assert_eq!(RetryPolicy::disabled().max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn state_follows_schedule() {
        let policy = policy(1, 4, 10, 2.0);
        let mut state = policy.start();
        let mut waits = vec![];
        while let Some(wait) = state.on_failure() {
            waits.push(wait);
            tokio::time::sleep(wait).await;
        }
        assert_eq!(waits, policy.schedule());
        assert_eq!(state.attempts() as usize, policy.max_attempts());
    }

    #[test]
    fn validate_rejects_bad_policies() {
        assert!(policy(0, 4, 10, 2.0).validate().is_err());
        assert!(policy(5, 4, 10, 2.0).validate().is_err());
        assert!(policy(1, 4, 10, 0.5).validate().is_err());
        assert!(policy(1, 4, 10, 1.5).validate().is_ok());
        assert!(RetryPolicy::default().validate().is_ok());
    }
}
