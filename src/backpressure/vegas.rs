use crate::backpressure::LimitAlgorithm;
use tokio::time::{Duration, Instant};

/// Delay based limit. Tracks the lowest commit latency seen as the no-load baseline and estimates
/// the queue as `limit * (1 - baseline / rtt)`. A short queue grows the limit, a long one shrinks
/// it. All thresholds scale with `log10(limit)`.
pub(crate) struct VegasLimit {
    limit: f64,
    min_limit: usize,
    max_limit: usize,
    smoothing: f64,
    rtt_no_load: Option<Duration>,
}

const ALPHA_FACTOR: usize = 3;
const BETA_FACTOR: usize = 6;

impl VegasLimit {
    pub(crate) fn new(initial_limit: usize, min_limit: usize, max_limit: usize) -> Self {
        VegasLimit {
            limit: initial_limit as f64,
            min_limit,
            max_limit,
            smoothing: 1.0,
            rtt_no_load: None,
        }
    }

    fn log10(limit: usize) -> usize {
        std::cmp::max(1, (limit as f64).log10() as usize)
    }
}

impl Default for VegasLimit {
    fn default() -> Self {
        VegasLimit::new(1024, 1, 8192)
    }
}

impl LimitAlgorithm for VegasLimit {
    fn on_sample(&mut self, _now: Instant, rtt: Duration, in_flight: usize) {
        let rtt_no_load = match self.rtt_no_load {
            Some(baseline) if rtt >= baseline => baseline,
            _ => {
                self.rtt_no_load = Some(rtt);
                return;
            }
        };

        let current = self.limit as usize;

        // Application limited. Nothing to learn about capacity.
        if in_flight * 2 < current {
            return;
        }

        let log10 = Self::log10(current);
        let alpha = ALPHA_FACTOR * log10;
        let beta = BETA_FACTOR * log10;
        let threshold = log10;

        let queue_size = (self.limit * (1.0 - rtt_no_load.as_secs_f64() / rtt.as_secs_f64())).ceil() as usize;

        let new_limit = if queue_size <= threshold {
            current + beta
        } else if queue_size < alpha {
            current + log10
        } else if queue_size > beta {
            current.saturating_sub(log10)
        } else {
            return;
        };

        let new_limit = new_limit.min(self.max_limit).max(self.min_limit) as f64;
        self.limit = (1.0 - self.smoothing) * self.limit + self.smoothing * new_limit;
    }

    fn limit(&self) -> usize {
        self.limit as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_while_latency_stays_at_baseline() {
        let now = Instant::now();
        let mut vegas = VegasLimit::new(10, 1, 100);
        let rtt = Duration::from_millis(10);

        // First sample only sets the baseline.
        vegas.on_sample(now, rtt, 10);
        assert_eq!(vegas.limit(), 10);

        // No queueing: limit + beta, where beta = 6 * log10(10).
        vegas.on_sample(now, rtt, 10);
        assert_eq!(vegas.limit(), 16);
    }

    #[test]
    fn shrinks_when_latency_climbs() {
        let now = Instant::now();
        let mut vegas = VegasLimit::new(100, 1, 1000);
        vegas.on_sample(now, Duration::from_millis(10), 100);

        // Queue estimate is 100 * (1 - 10/40) = 75, well over beta = 12.
        vegas.on_sample(now, Duration::from_millis(40), 100);
        assert_eq!(vegas.limit(), 98);
    }

    #[test]
    fn ignores_app_limited_samples_and_respects_bounds() {
        let now = Instant::now();
        let mut vegas = VegasLimit::new(100, 1, 104);
        vegas.on_sample(now, Duration::from_millis(10), 100);

        vegas.on_sample(now, Duration::from_millis(10), 10);
        assert_eq!(vegas.limit(), 100);

        vegas.on_sample(now, Duration::from_millis(10), 100);
        assert_eq!(vegas.limit(), 104);
    }
}
