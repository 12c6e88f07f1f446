use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Sliding-window limit on the client frames one connection may send.
#[derive(Debug)]
pub(crate) struct MessageRateLimiter {
    max_messages: usize,
    window: Duration,
    accepted: VecDeque<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RateLimitDecision {
    Allowed,
    Limited { retry_after_ms: u64 },
}

impl MessageRateLimiter {
    pub(crate) fn new(max_messages: usize, window: Duration) -> Self {
        Self { max_messages, window, accepted: VecDeque::with_capacity(max_messages) }
    }

    pub(crate) fn check(&mut self, now: Instant) -> RateLimitDecision {
        while self.accepted.front().is_some_and(|at| now.duration_since(*at) >= self.window) {
            self.accepted.pop_front();
        }

        if self.accepted.len() >= self.max_messages {
            let retry_after_ms = self
                .accepted
                .front()
                .map(|oldest| {
                    let remaining = self.window.saturating_sub(now.duration_since(*oldest));
                    u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX).max(1)
                })
                .unwrap_or(1);
            return RateLimitDecision::Limited { retry_after_ms };
        }

        self.accepted.push_back(now);
        RateLimitDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_within_window() {
        let mut limiter = MessageRateLimiter::new(3, Duration::from_secs(1));
        let start = Instant::now();

        for _ in 0..3 {
            assert_eq!(limiter.check(start), RateLimitDecision::Allowed);
        }
        assert_eq!(
            limiter.check(start + Duration::from_millis(250)),
            RateLimitDecision::Limited { retry_after_ms: 750 }
        );
    }

    #[test]
    fn window_slides_as_old_messages_expire() {
        let mut limiter = MessageRateLimiter::new(2, Duration::from_secs(1));
        let start = Instant::now();

        assert_eq!(limiter.check(start), RateLimitDecision::Allowed);
        assert_eq!(limiter.check(start + Duration::from_millis(500)), RateLimitDecision::Allowed);
        assert!(matches!(limiter.check(start + Duration::from_millis(900)), RateLimitDecision::Limited { .. }));

        assert_eq!(limiter.check(start + Duration::from_millis(1_000)), RateLimitDecision::Allowed);
        assert!(matches!(limiter.check(start + Duration::from_millis(1_100)), RateLimitDecision::Limited { .. }));
        assert_eq!(limiter.check(start + Duration::from_millis(1_500)), RateLimitDecision::Allowed);
    }

    #[test]
    fn limited_messages_do_not_consume_budget() {
        let mut limiter = MessageRateLimiter::new(1, Duration::from_secs(1));
        let start = Instant::now();

        assert_eq!(limiter.check(start), RateLimitDecision::Allowed);
        for offset in [100, 200, 300] {
            assert!(matches!(
                limiter.check(start + Duration::from_millis(offset)),
                RateLimitDecision::Limited { .. }
            ));
        }
        assert_eq!(limiter.check(start + Duration::from_secs(1)), RateLimitDecision::Allowed);
    }
}
