//! Shared per-host retry/backoff bookkeeping.
//!
//! vCenter SSO (4.C) and the inventory client (4.E) both gate reconnect
//! attempts behind the same shape of backoff: `min(retries, 10) * 60s` after
//! the last failure.

use chrono::{DateTime, Duration, Utc};

const BACKOFF_UNIT_SECONDS: i64 = 60;
const MAX_BACKOFF_MULTIPLIER: u32 = 10;

/// Tracks consecutive connection failures for one remote host.
#[derive(Clone, Debug, Default)]
pub struct Backoff {
    retries: u32,
    last_retry: Option<DateTime<Utc>>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Whether a connection attempt is allowed right now.
    pub fn may_attempt(&self, now: DateTime<Utc>) -> bool {
        if self.retries == 0 {
            return true;
        }
        match self.last_retry {
            None => true,
            Some(last) => now - last >= self.delay(),
        }
    }

    fn delay(&self) -> Duration {
        let multiplier = self.retries.min(MAX_BACKOFF_MULTIPLIER) as i64;
        Duration::seconds(multiplier * BACKOFF_UNIT_SECONDS)
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.retries += 1;
        self.last_retry = Some(now);
    }

    pub fn reset(&mut self) {
        self.retries = 0;
        self.last_retry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 60)]
    #[case(5, 300)]
    #[case(10, 600)]
    #[case(25, 600)]
    fn delay_caps_at_ten_minutes(#[case] retries: u32, #[case] expected_seconds: i64) {
        let backoff = Backoff {
            retries,
            last_retry: None,
        };
        assert_eq!(backoff.delay(), Duration::seconds(expected_seconds));
    }

    #[test]
    fn gates_reconnect_until_delay_elapses() {
        let now = Utc::now();
        let mut backoff = Backoff::new();
        backoff.record_failure(now);
        assert!(!backoff.may_attempt(now + Duration::seconds(30)));
        assert!(backoff.may_attempt(now + Duration::seconds(61)));
    }

    #[test]
    fn reset_clears_retry_state() {
        let now = Utc::now();
        let mut backoff = Backoff::new();
        backoff.record_failure(now);
        backoff.reset();
        assert!(backoff.may_attempt(now));
        assert_eq!(backoff.retries(), 0);
    }
}
