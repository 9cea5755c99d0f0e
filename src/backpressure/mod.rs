//! Admission control for client appends. The leader admits a new entry only while the number of
//! appended-but-uncommitted entries is below a limit, and the limit adapts to observed commit
//! latency the way TCP congestion control adapts to round-trip time.

mod gradient;
mod gradient2;
mod limit;
mod limiter;
mod vegas;
mod windowed;

pub(crate) use gradient::GradientLimit;
pub(crate) use gradient2::Gradient2Limit;
pub(crate) use limit::LimitAlgorithm;
pub(crate) use limiter::CommitLimiter;
pub(crate) use vegas::VegasLimit;
pub(crate) use windowed::WindowedLimit;
