use crate::backpressure::LimitAlgorithm;
use tokio::time::{Duration, Instant};

/// Batches samples into windows and feeds the delegate one aggregate per window: the average
/// latency and the peak in-flight count. Smooths out per-entry noise at high throughput.
pub(crate) struct WindowedLimit<A> {
    delegate: A,
    window_size: usize,
    min_window_time: Duration,
    max_window_time: Duration,
    min_rtt_threshold: Duration,
    next_update_time: Option<Instant>,
    window: Window,
}

#[derive(Default)]
struct Window {
    count: usize,
    rtt_sum: Duration,
    min_rtt: Option<Duration>,
    max_in_flight: usize,
}

impl Window {
    fn add(&mut self, rtt: Duration, in_flight: usize) {
        self.count += 1;
        self.rtt_sum += rtt;
        self.min_rtt = Some(self.min_rtt.map_or(rtt, |m| m.min(rtt)));
        self.max_in_flight = self.max_in_flight.max(in_flight);
    }

    fn average_rtt(&self) -> Duration {
        self.rtt_sum / self.count as u32
    }
}

impl<A: LimitAlgorithm> WindowedLimit<A> {
    pub(crate) fn new(delegate: A) -> Self {
        WindowedLimit {
            delegate,
            window_size: 10,
            min_window_time: Duration::from_secs(1),
            max_window_time: Duration::from_secs(1),
            min_rtt_threshold: Duration::from_micros(100),
            next_update_time: None,
            window: Window::default(),
        }
    }

    #[cfg(test)]
    fn with_window(mut self, window_size: usize, window_time: Duration) -> Self {
        self.window_size = window_size;
        self.min_window_time = window_time;
        self.max_window_time = window_time;
        self
    }
}

impl<A: LimitAlgorithm> LimitAlgorithm for WindowedLimit<A> {
    fn on_sample(&mut self, now: Instant, rtt: Duration, in_flight: usize) {
        if rtt < self.min_rtt_threshold {
            return;
        }

        self.window.add(rtt, in_flight);

        let next_update_time = *self.next_update_time.get_or_insert(now + self.min_window_time);
        if now < next_update_time || self.window.count < self.window_size {
            return;
        }

        let window = std::mem::take(&mut self.window);
        self.delegate
            .on_sample(now, window.average_rtt(), window.max_in_flight);

        let candidate = window.min_rtt.unwrap_or(self.min_window_time) * 2;
        let wait = candidate.max(self.min_window_time).min(self.max_window_time);
        self.next_update_time = Some(now + wait);
    }

    fn limit(&self) -> usize {
        self.delegate.limit()
    }
}
