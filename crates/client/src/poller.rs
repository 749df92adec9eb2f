//! Adaptive polling schedule.

use std::time::Duration;

use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// Poll again after this long.
    Retry(Duration),
    /// Too many consecutive failures; stop polling.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    max_delay: Duration,
    max_failures: u32,
    failures: u32,
}

impl Poller {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            interval: config.poll_interval,
            max_delay: config.poll_max_delay,
            max_failures: config.max_poll_failures,
            failures: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn on_success(&mut self) -> Duration {
        self.failures = 0;
        self.interval
    }

    pub fn on_failure(&mut self) -> PollDecision {
        self.failures += 1;
        if self.failures >= self.max_failures {
            return PollDecision::Exhausted;
        }
        let factor = 1u32.checked_shl(self.failures).unwrap_or(u32::MAX);
        let delay = self
            .interval
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        PollDecision::Retry(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backs_off_then_gives_up() {
        let mut poller = Poller::new(&ClientConfig::default());
        assert_eq!(poller.on_failure(), PollDecision::Retry(Duration::from_secs(6)));
        assert_eq!(poller.on_failure(), PollDecision::Retry(Duration::from_secs(12)));
        assert_eq!(poller.on_failure(), PollDecision::Retry(Duration::from_secs(24)));
        assert_eq!(poller.on_failure(), PollDecision::Retry(Duration::from_secs(30)));
        for _ in 4..9 {
            assert!(matches!(poller.on_failure(), PollDecision::Retry(_)));
        }
        assert_eq!(poller.on_failure(), PollDecision::Exhausted);
    }

    #[test]
    fn success_resets_the_interval() {
        let mut poller = Poller::new(&ClientConfig::default());
        poller.on_failure();
        poller.on_failure();
        assert_eq!(poller.on_success(), Duration::from_secs(3));
        assert_eq!(poller.failures(), 0);
        assert_eq!(poller.on_failure(), PollDecision::Retry(Duration::from_secs(6)));
    }
}
