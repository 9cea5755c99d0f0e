use crate::backpressure::limit::rtt_ratio;
use crate::backpressure::LimitAlgorithm;
use tokio::time::{Duration, Instant};

/// Compares the latest latency against a long running average instead of the minimum, so it
/// recovers from a permanently higher baseline. The long average decays towards the short one
/// when they drift apart by more than 2x.
pub(crate) struct Gradient2Limit {
    limit: f64,
    min_limit: usize,
    max_limit: usize,
    smoothing: f64,
    rtt_tolerance: f64,
    queue_size: f64,
    long_rtt: ExpAvg,
}

impl Gradient2Limit {
    pub(crate) fn new(initial_limit: usize, min_limit: usize, max_limit: usize) -> Self {
        Gradient2Limit {
            limit: initial_limit as f64,
            min_limit,
            max_limit,
            smoothing: 0.2,
            rtt_tolerance: 1.5,
            queue_size: 4.0,
            long_rtt: ExpAvg::new(600, 10),
        }
    }
}

impl Default for Gradient2Limit {
    fn default() -> Self {
        Gradient2Limit::new(20, 20, 1000)
    }
}

impl LimitAlgorithm for Gradient2Limit {
    fn on_sample(&mut self, _now: Instant, rtt: Duration, in_flight: usize) {
        let short_rtt = rtt.as_secs_f64();
        let mut long_rtt = self.long_rtt.add(short_rtt);

        // Long term average drifted far above what we see now. Pull it down faster.
        if long_rtt / short_rtt.max(f64::EPSILON) > 2.0 {
            long_rtt = self.long_rtt.scale(0.95);
        }

        if (in_flight as f64) < self.limit / 2.0 {
            return;
        }

        let gradient = (self.rtt_tolerance
            * rtt_ratio(Duration::from_secs_f64(long_rtt), Duration::from_secs_f64(short_rtt)))
        .min(1.0)
        .max(0.5);
        let new_limit = self.limit * gradient + self.queue_size;
        let new_limit = self.limit * (1.0 - self.smoothing) + new_limit * self.smoothing;

        self.limit = new_limit.min(self.max_limit as f64).max(self.min_limit as f64);
    }

    fn limit(&self) -> usize {
        self.limit as usize
    }
}

/// Exponential moving average that starts as a plain average over its first `warmup` samples.
struct ExpAvg {
    value: f64,
    count: usize,
    window: usize,
    warmup: usize,
}

impl ExpAvg {
    fn new(window: usize, warmup: usize) -> Self {
        ExpAvg {
            value: 0.0,
            count: 0,
            window,
            warmup,
        }
    }

    fn add(&mut self, sample: f64) -> f64 {
        if self.count < self.warmup {
            self.count += 1;
            self.value += (sample - self.value) / self.count as f64;
        } else {
            let factor = 2.0 / (self.window as f64 + 1.0);
            self.value = self.value * (1.0 - factor) + sample * factor;
        }
        self.value
    }

    fn scale(&mut self, factor: f64) -> f64 {
        self.value *= factor;
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_latency_grows_limit() {
        let now = Instant::now();
        let mut limit = Gradient2Limit::new(20, 20, 200);

        // gradient 1.0: 0.8 * 20 + 0.2 * (20 + 4)
        limit.on_sample(now, Duration::from_millis(10), 20);
        assert_eq!(limit.limit(), 20);
        for _ in 0..20 {
            let in_flight = limit.limit();
            limit.on_sample(now, Duration::from_millis(10), in_flight);
        }
        assert!(limit.limit() > 30, "limit {} didn't grow", limit.limit());
    }

    #[test]
    fn latency_spike_shrinks_limit_but_not_below_min() {
        let now = Instant::now();
        let mut limit = Gradient2Limit::new(100, 20, 200);
        for _ in 0..10 {
            limit.on_sample(now, Duration::from_millis(10), 100);
        }
        let before = limit.limit();

        for _ in 0..30 {
            let in_flight = limit.limit();
            limit.on_sample(now, Duration::from_millis(200), in_flight);
        }
        assert!(limit.limit() < before);
        assert!(limit.limit() >= 20);
    }

    #[test]
    fn exp_avg_warmup_is_plain_average() {
        let mut avg = ExpAvg::new(600, 3);
        avg.add(1.0);
        avg.add(2.0);
        assert!((avg.add(3.0) - 2.0).abs() < 1e-9);
    }
}
