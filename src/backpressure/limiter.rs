use crate::api::{BackpressureAlgorithm, BackpressureOptions};
use crate::backpressure::{Gradient2Limit, GradientLimit, LimitAlgorithm, VegasLimit, WindowedLimit};
use crate::commitlog::Index;
use std::collections::BTreeMap;
use tokio::time::Instant;

/// CommitLimiter gates client appends on the leader. Each admitted entry is tracked from append
/// until commit. The commit latency feeds the limit algorithm. Without an algorithm every append
/// is admitted.
pub(crate) struct CommitLimiter {
    algorithm: Option<Box<dyn LimitAlgorithm + Send>>,
    in_flight: BTreeMap<Index, Instant>,
}

impl CommitLimiter {
    pub(crate) fn new(options: &BackpressureOptions) -> Self {
        if !options.enabled {
            return Self::disabled();
        }

        let algorithm: Box<dyn LimitAlgorithm + Send> = match (options.algorithm, options.use_windowed) {
            (BackpressureAlgorithm::Vegas, false) => Box::new(VegasLimit::default()),
            (BackpressureAlgorithm::Vegas, true) => Box::new(WindowedLimit::new(VegasLimit::default())),
            (BackpressureAlgorithm::Gradient, false) => Box::new(GradientLimit::default()),
            (BackpressureAlgorithm::Gradient, true) => Box::new(WindowedLimit::new(GradientLimit::default())),
            (BackpressureAlgorithm::Gradient2, false) => Box::new(Gradient2Limit::default()),
            (BackpressureAlgorithm::Gradient2, true) => Box::new(WindowedLimit::new(Gradient2Limit::default())),
        };

        CommitLimiter {
            algorithm: Some(algorithm),
            in_flight: BTreeMap::new(),
        }
    }

    pub(crate) fn disabled() -> Self {
        CommitLimiter {
            algorithm: None,
            in_flight: BTreeMap::new(),
        }
    }

    /// True if one more entry may be appended right now.
    pub(crate) fn try_acquire(&self) -> bool {
        match &self.algorithm {
            None => true,
            Some(algorithm) => self.in_flight.len() < algorithm.limit(),
        }
    }

    pub(crate) fn on_append(&mut self, index: Index, now: Instant) {
        if self.algorithm.is_some() {
            self.in_flight.insert(index, now);
        }
    }

    /// Releases every tracked entry at or below `commit_index`, sampling each one's latency.
    pub(crate) fn on_commit(&mut self, commit_index: Index, now: Instant) {
        let algorithm = match &mut self.algorithm {
            Some(algorithm) => algorithm,
            None => return,
        };

        loop {
            let (index, appended_at) = match self.in_flight.iter().next() {
                Some((&index, &appended_at)) if index <= commit_index => (index, appended_at),
                _ => break,
            };
            let in_flight = self.in_flight.len();
            self.in_flight.remove(&index);
            algorithm.on_sample(now, now.saturating_duration_since(appended_at), in_flight);
        }
    }

    pub(crate) fn limit(&self) -> Option<usize> {
        self.algorithm.as_ref().map(|algorithm| algorithm.limit())
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    fn gradient_options() -> BackpressureOptions {
        BackpressureOptions {
            enabled: true,
            use_windowed: false,
            algorithm: BackpressureAlgorithm::Gradient,
        }
    }

    #[test]
    fn rejects_beyond_limit_until_commits_release_entries() {
        let start = Instant::now();
        let mut limiter = CommitLimiter::new(&gradient_options());
        assert_eq!(limiter.limit(), Some(20));

        for i in 1..=20 {
            assert!(limiter.try_acquire());
            limiter.on_append(Index::new(i), start);
        }
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.in_flight(), 20);

        limiter.on_commit(Index::new(5), start + Duration::from_millis(10));
        assert_eq!(limiter.in_flight(), 15);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn fixed_latency_keeps_gradient_limit_bounded() {
        let start = Instant::now();
        let mut limiter = CommitLimiter::new(&gradient_options());
        let latency = Duration::from_millis(5);

        let mut next_index = 1;
        let mut now = start;
        for _ in 0..200 {
            // Fill the window, then commit everything after a fixed latency.
            while limiter.try_acquire() {
                limiter.on_append(Index::new(next_index), now);
                next_index += 1;
            }
            now += latency;
            limiter.on_commit(Index::new(next_index - 1), now);

            let limit = limiter.limit().unwrap();
            assert!((10..=1000).contains(&limit), "limit {} out of bounds", limit);
        }
    }

    #[test]
    fn disabled_admits_everything() {
        let mut limiter = CommitLimiter::new(&BackpressureOptions {
            enabled: false,
            ..BackpressureOptions::default()
        });
        for i in 1..=10_000 {
            limiter.on_append(Index::new(i), Instant::now());
        }
        assert!(limiter.try_acquire());
        assert_eq!(limiter.limit(), None);
        assert_eq!(limiter.in_flight(), 0);
    }
}
