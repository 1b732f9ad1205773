use rand::Rng;
use std::time::Duration;

/// Exponential backoff with randomized jitter, used between retransmissions
/// of an unacknowledged request.
#[derive(Debug)]
pub struct ExponentialBackoff {
    max: Duration,
    factor: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            max,
            factor,
            current: initial,
        }
    }

    /// Next delay, within ±25% of the current step, then advances the step.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.current.as_secs_f64();
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        let delay = Duration::from_secs_f64(current * jitter);

        self.current = Duration::from_secs_f64(current * self.factor).min(self.max);

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_first_delay_is_jittered_initial() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(5), 2.0);

        let delay = backoff.next_delay().as_secs_f64();
        assert_approx_eq!(delay, 0.5, 0.125 + 1e-9);
    }

    #[test]
    fn test_steps_double_until_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(2), 2.0);

        let expected = [0.5, 1.0, 2.0, 2.0, 2.0];
        for step in expected {
            let delay = backoff.next_delay().as_secs_f64();
            assert_approx_eq!(delay, step, step * 0.25 + 1e-9);
        }
    }
}
