use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::clock::Clock;
use crate::error::RateLimitError;

/// Shortfalls below this are treated as satisfied, absorbing float drift
/// between the computed wait and the refill observed after it.
const TOKEN_EPSILON: f64 = 1e-6;
const MIN_WAIT: Duration = Duration::from_micros(1);

/// Leaky-bucket limiter for one quota class.
///
/// The level refills continuously at `refill_per_sec` up to `capacity`.
/// `consume` deducts under the state lock and sleeps with the lock released,
/// so concurrent callers never over-admit but get no fairness guarantee.
pub struct TokenBucket {
    class: String,
    capacity: f64,
    refill_per_sec: f64,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(
        class: impl Into<String>,
        capacity: f64,
        refill_per_sec: f64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        let class = class.into();
        let valid = capacity.is_finite()
            && capacity > 0.0
            && refill_per_sec.is_finite()
            && refill_per_sec > 0.0;
        if !valid {
            return Err(RateLimitError::InvalidQuota {
                class,
                capacity,
                refill_per_sec,
            });
        }
        let last_refill = clock.now();
        Ok(Self {
            class,
            capacity,
            refill_per_sec,
            clock,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill,
            }),
        })
    }

    /// Bucket allowing `quota` units per minute with bursts up to `quota`.
    pub fn per_minute(
        class: impl Into<String>,
        quota: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RateLimitError> {
        let quota = f64::from(quota);
        Self::new(class, quota, quota / 60.0, clock)
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Current level after applying the refill owed since the last check.
    pub fn available(&self) -> f64 {
        let mut state = self.lock_state();
        self.leak(&mut state);
        state.tokens
    }

    /// Blocks until `amount` units are available, deducts them and returns
    /// the total time spent waiting.
    pub fn consume(&self, amount: u64) -> Result<Duration, RateLimitError> {
        let requested = amount as f64;
        if requested > self.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                class: self.class.clone(),
                requested: amount,
                capacity: self.capacity,
            });
        }

        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut state = self.lock_state();
                self.leak(&mut state);
                if state.tokens + TOKEN_EPSILON >= requested {
                    state.tokens = (state.tokens - requested).max(0.0);
                    return Ok(waited);
                }
                let deficit = requested - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec).max(MIN_WAIT)
            };
            debug!(
                class = %self.class,
                requested = amount,
                wait_ms = wait.as_millis() as u64,
                "rate limit wait"
            );
            self.clock.sleep(wait);
            waited += wait;
        }
    }

    /// Returns previously reserved units. The level is clamped at capacity.
    pub fn refund(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut state = self.lock_state();
        self.leak(&mut state);
        state.tokens = (state.tokens + amount as f64).min(self.capacity);
    }

    fn leak(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    fn lock_state(&self) -> MutexGuard<'_, BucketState> {
        // The state is two plain numbers; a panic elsewhere cannot leave it
        // half-written.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("class", &self.class)
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::clock::ManualClock;

    use super::*;

    fn bucket(capacity: f64, refill_per_sec: f64) -> (Arc<ManualClock>, TokenBucket) {
        let clock = Arc::new(ManualClock::new());
        let bucket = TokenBucket::new("test", capacity, refill_per_sec, clock.clone())
            .unwrap_or_else(|err| panic!("bucket: {err}"));
        (clock, bucket)
    }

    #[test]
    fn full_bucket_admits_capacity_without_waiting() -> anyhow::Result<()> {
        let (clock, bucket) = bucket(20.0, 20.0 / 60.0);
        assert_eq!(bucket.consume(20)?, Duration::ZERO);
        assert!(clock.sleeps().is_empty());
        assert!(bucket.available().abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn reservation_above_capacity_is_a_configuration_error() {
        let (clock, bucket) = bucket(20.0, 1.0);
        let err = bucket.consume(21).err();
        assert!(matches!(
            err,
            Some(RateLimitError::ExceedsCapacity { requested: 21, .. })
        ));
        assert!(clock.sleeps().is_empty());
        assert_eq!(bucket.available(), 20.0);
    }

    #[test]
    fn empty_bucket_waits_exactly_for_the_deficit() -> anyhow::Result<()> {
        let (clock, bucket) = bucket(60.0, 1.0);
        bucket.consume(60)?;
        let waited = bucket.consume(30)?;
        assert_eq!(waited, Duration::from_secs(30));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30)]);
        assert!(bucket.available().abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn partial_level_only_waits_for_the_remainder() -> anyhow::Result<()> {
        let (clock, bucket) = bucket(10.0, 2.0);
        bucket.consume(8)?;
        clock.advance(Duration::from_secs(1));
        // 2 left + 2 refilled = 4; 6 requested leaves a deficit of 2 → 1 s.
        let waited = bucket.consume(6)?;
        assert_eq!(waited, Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn refill_is_capped_at_capacity() -> anyhow::Result<()> {
        let (clock, bucket) = bucket(5.0, 1.0);
        bucket.consume(5)?;
        clock.advance(Duration::from_secs(3600));
        assert_eq!(bucket.available(), 5.0);
        Ok(())
    }

    #[test]
    fn refund_is_clamped_at_capacity() -> anyhow::Result<()> {
        let (_clock, bucket) = bucket(1000.0, 1000.0 / 60.0);
        bucket.consume(300)?;
        bucket.refund(120);
        assert_eq!(bucket.available(), 820.0);
        bucket.refund(10_000);
        assert_eq!(bucket.available(), 1000.0);
        Ok(())
    }

    #[test]
    fn sustained_rate_never_exceeds_refill() -> anyhow::Result<()> {
        let (clock, bucket) = bucket(60.0, 1.0);
        for _ in 0..100 {
            bucket.consume(10)?;
        }
        // 1000 units admitted: 60 from the initial burst, the rest refilled.
        let elapsed = clock.elapsed().as_secs_f64();
        assert!(elapsed >= 940.0 - 1e-6, "elapsed {elapsed}");
        assert!(elapsed <= 940.0 + 1e-3, "elapsed {elapsed}");
        Ok(())
    }

    #[test]
    fn level_stays_within_bounds_for_mixed_sequences() -> anyhow::Result<()> {
        let (clock, bucket) = bucket(50.0, 3.0);
        let mut seed: u64 = 0x5eed;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let amount = (seed >> 33) % 51;
            match (seed >> 20) % 3 {
                0 => {
                    bucket.consume(amount)?;
                }
                1 => bucket.refund(amount),
                _ => clock.advance(Duration::from_millis(amount * 37)),
            }
            let level = bucket.available();
            assert!(level >= 0.0, "negative level {level}");
            assert!(level <= 50.0, "level {level} above capacity");
        }
        Ok(())
    }

    #[test]
    fn concurrent_consumers_do_not_over_admit() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::new());
        let bucket = Arc::new(TokenBucket::new("shared", 20.0, 10.0, clock.clone())?);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                thread::spawn(move || -> Result<(), RateLimitError> {
                    for _ in 0..10 {
                        bucket.consume(5)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("consumer thread panicked"))??;
        }

        // 200 admitted ≤ 20 initial + 10/s refill.
        assert!(clock.elapsed().as_secs_f64() >= 18.0 - 1e-6);
        let level = bucket.available();
        assert!((0.0..=20.0).contains(&level));
        Ok(())
    }

    #[test]
    fn invalid_quota_is_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        assert!(TokenBucket::per_minute("vision", 0, clock.clone()).is_err());
        assert!(TokenBucket::new("vision", 10.0, f64::NAN, clock).is_err());
    }

    #[test]
    fn per_minute_sets_capacity_and_rate() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let bucket = TokenBucket::per_minute("completion", 1_000, clock)?;
        assert_eq!(bucket.capacity(), 1000.0);
        assert!((bucket.refill_per_sec() - 1000.0 / 60.0).abs() < 1e-12);
        assert_eq!(bucket.class(), "completion");
        Ok(())
    }
}
