use rand::Rng;
use rlog_common::error::{Result, RlogError};
use std::time::Duration;

/// Supplies the pause between two failed proposal attempts.
pub trait RetryPolicy: Send {
    fn next_backoff(&mut self) -> Duration;
}

impl<F> RetryPolicy for F
where
    F: FnMut() -> Duration + Send,
{
    fn next_backoff(&mut self) -> Duration {
        self()
    }
}

/// Jittered exponential backoff: each pause is uniform in `[0, current)`, and
/// `current` grows by `scale` per attempt up to `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max: Duration,
    scale: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(min: Duration, max: Duration, scale: f64) -> Result<Self> {
        if min.is_zero() || max.is_zero() {
            return Err(RlogError::Config(
                "min and max backoff must be positive".into(),
            ));
        }
        if min > max || scale < 1.0 {
            return Err(RlogError::Config(format!(
                "invalid backoff: min {:?}, max {:?}, scale {}",
                min, max, scale
            )));
        }
        Ok(Self {
            max,
            scale,
            current: min,
        })
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_backoff(&mut self) -> Duration {
        let upper = self.current.as_nanos() as u64;
        let wait = Duration::from_nanos(rand::thread_rng().gen_range(0..upper));
        self.current = self.current.mul_f64(self.scale).min(self.max);
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut policy = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            2.0,
        )
        .unwrap();

        let bounds = [10, 20, 40, 40, 40];
        for bound in bounds {
            let wait = policy.next_backoff();
            assert!(wait < Duration::from_millis(bound), "{:?} >= {}ms", wait, bound);
        }
        assert_eq!(policy.current, Duration::from_millis(40));
    }

    #[test]
    fn test_backoff_rejects_bad_bounds() {
        assert!(ExponentialBackoff::new(Duration::ZERO, Duration::from_millis(1), 2.0).is_err());
        assert!(
            ExponentialBackoff::new(Duration::from_millis(5), Duration::from_millis(1), 2.0)
                .is_err()
        );
        assert!(
            ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(5), 0.5)
                .is_err()
        );
    }

    #[test]
    fn test_closure_policy() {
        let mut calls = 0;
        let mut policy = || {
            calls += 1;
            Duration::from_millis(calls)
        };
        assert_eq!(policy.next_backoff(), Duration::from_millis(1));
        assert_eq!(policy.next_backoff(), Duration::from_millis(2));
    }
}
