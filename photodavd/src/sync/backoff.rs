use rand::Rng;
use std::time::Duration;

/// Fixed per-attempt delays for upload retries, indexed by the number
/// of failed attempts already recorded.
pub const UPLOAD_RETRY_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(120),
    Duration::from_secs(300),
];

pub fn upload_retry_delay(failed_attempts: i64) -> Option<Duration> {
    if failed_attempts < 1 {
        return Some(UPLOAD_RETRY_SCHEDULE[0]);
    }
    UPLOAD_RETRY_SCHEDULE
        .get((failed_attempts - 1) as usize)
        .copied()
}

/// Jittered exponential backoff for whole-pass retries.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}
