use tokio::time::{Duration, Instant};

/// LimitAlgorithm estimates how many entries may be in flight at once. It's fed one sample per
/// committed entry: the time from append to commit, and how many entries were in flight when it
/// committed.
pub(crate) trait LimitAlgorithm {
    fn on_sample(&mut self, now: Instant, rtt: Duration, in_flight: usize);

    fn limit(&self) -> usize;
}

/// Shared by the gradient variants. `rtt` values of zero are clamped so ratios stay finite.
pub(super) fn rtt_ratio(numerator: Duration, denominator: Duration) -> f64 {
    let denominator = denominator.as_secs_f64().max(f64::EPSILON);
    numerator.as_secs_f64() / denominator
}
