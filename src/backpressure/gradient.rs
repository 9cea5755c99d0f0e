use crate::backpressure::limit::rtt_ratio;
use crate::backpressure::LimitAlgorithm;
use tokio::time::{Duration, Instant};

/// Compares the current latency against the lowest latency seen. The gradient
/// `tolerance * min_rtt / rtt`, clamped to [0.5, 1.0], scales the limit, and a queue allowance of
/// `sqrt(limit)` is added on top. Decreases are smoothed, increases are not.
pub(crate) struct GradientLimit {
    limit: f64,
    min_limit: usize,
    max_limit: usize,
    smoothing: f64,
    rtt_tolerance: f64,
    min_rtt: Option<Duration>,
}

impl GradientLimit {
    pub(crate) fn new(initial_limit: usize, min_limit: usize, max_limit: usize) -> Self {
        GradientLimit {
            limit: initial_limit as f64,
            min_limit,
            max_limit,
            smoothing: 0.2,
            rtt_tolerance: 2.0,
            min_rtt: None,
        }
    }
}

impl Default for GradientLimit {
    fn default() -> Self {
        GradientLimit::new(20, 10, 1000)
    }
}

impl LimitAlgorithm for GradientLimit {
    fn on_sample(&mut self, _now: Instant, rtt: Duration, in_flight: usize) {
        let min_rtt = match self.min_rtt {
            Some(min_rtt) if min_rtt <= rtt => min_rtt,
            _ => {
                self.min_rtt = Some(rtt);
                rtt
            }
        };

        if (in_flight as f64) * 2.0 < self.limit {
            return;
        }

        let queue_size = self.limit.sqrt();
        let gradient = (self.rtt_tolerance * rtt_ratio(min_rtt, rtt)).min(1.0).max(0.5);

        let mut new_limit = self.limit * gradient + queue_size;
        if new_limit < self.limit {
            new_limit = (self.limit * (1.0 - self.smoothing) + self.smoothing * new_limit).max(self.min_limit as f64);
        }

        self.limit = new_limit.min(self.max_limit as f64).max(queue_size);
    }

    fn limit(&self) -> usize {
        self.limit as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_queue_size_when_latency_is_within_tolerance() {
        let now = Instant::now();
        let mut gradient = GradientLimit::new(16, 10, 100);

        // 16 * 1.0 + sqrt(16)
        gradient.on_sample(now, Duration::from_millis(10), 16);
        assert_eq!(gradient.limit(), 20);

        // Up to 2x the min rtt is tolerated.
        gradient.on_sample(now, Duration::from_millis(20), 20);
        assert_eq!(gradient.limit(), 24);
    }

    #[test]
    fn shrinks_smoothly_when_latency_exceeds_tolerance() {
        let now = Instant::now();
        let mut gradient = GradientLimit::new(100, 10, 1000);
        gradient.on_sample(now, Duration::from_millis(10), 100);
        assert_eq!(gradient.limit(), 110);

        // gradient = 0.5, target = 110 * 0.5 + sqrt(110) ~= 65.5, smoothed 0.8 * 110 + 0.2 * 65.5
        gradient.on_sample(now, Duration::from_millis(100), 110);
        assert_eq!(gradient.limit(), 101);

        for _ in 0..50 {
            let in_flight = gradient.limit();
            gradient.on_sample(now, Duration::from_millis(100), in_flight);
        }
        assert!(gradient.limit() >= 10);
        assert!(gradient.limit() < 40, "limit {} didn't converge down", gradient.limit());
    }

    #[test]
    fn ignores_app_limited_samples() {
        let now = Instant::now();
        let mut gradient = GradientLimit::new(20, 10, 100);
        gradient.on_sample(now, Duration::from_millis(10), 2);
        assert_eq!(gradient.limit(), 20);
    }
}
