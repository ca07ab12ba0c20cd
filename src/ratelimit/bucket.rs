// Token bucket with lazy refill and an adaptive cooldown. Time is passed in
// explicitly so the policy is testable without sleeping.

use std::time::{Duration, Instant};

use super::proto::ReleaseOutcome;

/// Floor of the adaptive cooldown step applied on a throttled release.
const COOLDOWN_FLOOR_MS: u64 = 500;

#[derive(Debug)]
pub enum AcquireDecision {
    Granted,
    /// Estimated wait until the request could be granted.
    Wait(Duration),
}

#[derive(Debug)]
pub struct TokenBucket {
    pub name: String,
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
    /// No lease is granted before this instant. Only ever moves forward.
    cooldown_until: Option<Instant>,
    /// Adaptive interval added per throttled release; halves on success.
    cooldown_step_ms: u64,
    max_cooldown_ms: u64,
}

impl TokenBucket {
    pub fn new(name: &str, capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        TokenBucket {
            name: name.to_string(),
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(0.01),
            tokens: capacity.max(1.0),
            last_refill: now,
            cooldown_until: None,
            cooldown_step_ms: 0,
            max_cooldown_ms: 60_000,
        }
    }

    pub fn configure(&mut self, capacity: f64, refill_per_sec: f64, max_cooldown_ms: u64) {
        self.capacity = capacity.max(1.0);
        self.refill_per_sec = refill_per_sec.max(0.01);
        self.tokens = self.tokens.min(self.capacity);
        self.max_cooldown_ms = max_cooldown_ms.max(COOLDOWN_FLOOR_MS);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Duration {
        match self.cooldown_until {
            Some(t) if t > now => t - now,
            _ => Duration::ZERO,
        }
    }

    /// Attempt to take `weight` tokens. Grants require both enough tokens
    /// and an elapsed cooldown; otherwise the caller gets the estimated wait.
    pub fn try_acquire(&mut self, weight: f64, now: Instant) -> AcquireDecision {
        self.refill(now);
        let cooldown = self.cooldown_remaining(now);
        if self.tokens >= weight && cooldown.is_zero() {
            self.tokens -= weight;
            return AcquireDecision::Granted;
        }
        let token_wait = if self.tokens >= weight {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((weight - self.tokens) / self.refill_per_sec)
        };
        AcquireDecision::Wait(token_wait.max(cooldown))
    }

    /// Apply a lease outcome. A throttled release pushes the cooldown
    /// forward by a doubling step; a clean release halves the step so the
    /// bucket recovers. `cooldown_until` itself never moves backward.
    pub fn release(&mut self, outcome: &ReleaseOutcome, now: Instant) {
        match outcome {
            ReleaseOutcome::Throttled => {
                self.cooldown_step_ms = if self.cooldown_step_ms == 0 {
                    COOLDOWN_FLOOR_MS
                } else {
                    (self.cooldown_step_ms * 2).min(self.max_cooldown_ms)
                };
                let candidate = now + Duration::from_millis(self.cooldown_step_ms);
                self.cooldown_until = Some(match self.cooldown_until {
                    Some(cur) if cur > candidate => cur,
                    _ => candidate,
                });
            }
            ReleaseOutcome::Ok => {
                self.cooldown_step_ms /= 2;
            }
            ReleaseOutcome::Error => {}
        }
    }

    pub fn snapshot(&self, now: Instant, active_clients: u64) -> super::proto::BucketSnapshot {
        super::proto::BucketSnapshot {
            name: self.name.clone(),
            tokens: self.tokens,
            cooldown_remain_ms: self.cooldown_remaining(now).as_millis() as u64,
            active_clients,
        }
    }

    #[cfg(test)]
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> Instant {
        Instant::now()
    }

    #[test]
    fn starts_full_and_grants() {
        let now = t0();
        let mut b = TokenBucket::new("api", 4.0, 1.0, now);
        for _ in 0..4 {
            assert!(matches!(b.try_acquire(1.0, now), AcquireDecision::Granted));
        }
        assert!(matches!(b.try_acquire(1.0, now), AcquireDecision::Wait(_)));
    }

    #[test]
    fn wait_estimate_reflects_deficit() {
        let now = t0();
        let mut b = TokenBucket::new("api", 1.0, 1.0, now);
        assert!(matches!(b.try_acquire(1.0, now), AcquireDecision::Granted));
        match b.try_acquire(1.0, now) {
            AcquireDecision::Wait(d) => {
                // one full token at 1 token/s -> about a second
                assert!(d >= Duration::from_millis(900), "wait = {:?}", d);
            }
            AcquireDecision::Granted => panic!("should not grant with empty bucket"),
        }
    }

    #[test]
    fn lazy_refill_caps_at_capacity() {
        let now = t0();
        let mut b = TokenBucket::new("api", 2.0, 10.0, now);
        assert!(matches!(b.try_acquire(2.0, now), AcquireDecision::Granted));
        let later = now + Duration::from_secs(60);
        assert!(matches!(b.try_acquire(2.0, later), AcquireDecision::Granted));
        assert!(b.tokens() <= 2.0);
    }

    #[test]
    fn no_grant_before_cooldown() {
        let now = t0();
        let mut b = TokenBucket::new("api", 10.0, 10.0, now);
        b.release(&ReleaseOutcome::Throttled, now);
        match b.try_acquire(1.0, now) {
            AcquireDecision::Wait(d) => assert!(d >= Duration::from_millis(400)),
            AcquireDecision::Granted => panic!("granted during cooldown"),
        }
        // 冷却过后恢复授予
        let later = now + Duration::from_secs(2);
        assert!(matches!(b.try_acquire(1.0, later), AcquireDecision::Granted));
    }

    #[test]
    fn cooldown_step_doubles_and_caps() {
        let now = t0();
        let mut b = TokenBucket::new("api", 10.0, 10.0, now);
        b.release(&ReleaseOutcome::Throttled, now);
        assert_eq!(b.cooldown_step_ms, 500);
        b.release(&ReleaseOutcome::Throttled, now);
        assert_eq!(b.cooldown_step_ms, 1000);
        for _ in 0..20 {
            b.release(&ReleaseOutcome::Throttled, now);
        }
        assert_eq!(b.cooldown_step_ms, 60_000);
    }

    #[test]
    fn success_release_decays_step() {
        let now = t0();
        let mut b = TokenBucket::new("api", 10.0, 10.0, now);
        b.release(&ReleaseOutcome::Throttled, now);
        b.release(&ReleaseOutcome::Throttled, now);
        assert_eq!(b.cooldown_step_ms, 1000);
        b.release(&ReleaseOutcome::Ok, now);
        assert_eq!(b.cooldown_step_ms, 500);
        b.release(&ReleaseOutcome::Ok, now);
        b.release(&ReleaseOutcome::Ok, now);
        assert_eq!(b.cooldown_step_ms, 125);
    }

    #[test]
    fn cooldown_is_set_forward_only() {
        let now = t0();
        let mut b = TokenBucket::new("api", 10.0, 10.0, now);
        for _ in 0..4 {
            b.release(&ReleaseOutcome::Throttled, now);
        }
        let far = b.cooldown_remaining(now + Duration::from_millis(1));
        // a later throttle with a smaller step must not pull the deadline in
        b.cooldown_step_ms = 0;
        b.release(&ReleaseOutcome::Throttled, now);
        assert!(b.cooldown_remaining(now + Duration::from_millis(1)) >= far);
    }
}
