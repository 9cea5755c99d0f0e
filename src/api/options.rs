use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    /// Leader steps down if it hasn't heard from a quorum of Active members for this long.
    /// Defaults to the follower max timeout.
    pub leader_quorum_liveness_timeout: Option<Duration>,
    pub max_append_batch_entries: Option<usize>,
    pub max_in_flight_appends_per_peer: Option<usize>,
    pub snapshot_chunk_size_bytes: Option<usize>,
    /// Compact automatically once this many entries have been applied past the last snapshot.
    pub snapshot_entry_threshold: Option<u64>,
    /// A joining member is promoted once it is within this many entries of the leader.
    pub promotion_lag_threshold: Option<u64>,
    pub membership_change_timeout: Option<Duration>,
    pub backpressure: Option<BackpressureOptions>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BackpressureAlgorithm {
    Vegas,
    Gradient,
    Gradient2,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackpressureOptions {
    /// When disabled, appends are admitted unconditionally.
    pub enabled: bool,
    /// Feed the algorithm aggregated samples per window instead of every commit.
    pub use_windowed: bool,
    pub algorithm: BackpressureAlgorithm,
}

impl Default for BackpressureOptions {
    fn default() -> Self {
        BackpressureOptions {
            enabled: true,
            use_windowed: true,
            algorithm: BackpressureAlgorithm::Vegas,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub leader_quorum_liveness_timeout: Duration,
    pub max_append_batch_entries: usize,
    pub max_in_flight_appends_per_peer: usize,
    pub snapshot_chunk_size_bytes: usize,
    pub snapshot_entry_threshold: Option<u64>,
    pub promotion_lag_threshold: u64,
    pub membership_change_timeout: Duration,
    pub backpressure: BackpressureOptions,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.leader_quorum_liveness_timeout <= self.leader_heartbeat_duration {
            return Err("Leader's quorum liveness timeout must be greater than leader's heartbeat");
        }
        if self.max_append_batch_entries == 0 {
            return Err("Max AppendEntries batch size must be non-zero");
        }
        if self.max_in_flight_appends_per_peer == 0 {
            return Err("Max in-flight AppendEntries per peer must be non-zero");
        }
        if self.snapshot_chunk_size_bytes == 0 {
            return Err("Snapshot chunk size must be non-zero");
        }
        if self.snapshot_entry_threshold == Some(0) {
            return Err("Snapshot entry threshold must be non-zero when set");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let follower_max_timeout = options.follower_max_timeout.unwrap_or(Duration::from_millis(1500));
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout,
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            leader_quorum_liveness_timeout: options
                .leader_quorum_liveness_timeout
                .unwrap_or(follower_max_timeout),
            max_append_batch_entries: options.max_append_batch_entries.unwrap_or(64),
            max_in_flight_appends_per_peer: options.max_in_flight_appends_per_peer.unwrap_or(2),
            snapshot_chunk_size_bytes: options.snapshot_chunk_size_bytes.unwrap_or(64 * 1024),
            snapshot_entry_threshold: options.snapshot_entry_threshold,
            promotion_lag_threshold: options.promotion_lag_threshold.unwrap_or(10),
            membership_change_timeout: options.membership_change_timeout.unwrap_or(Duration::from_secs(10)),
            backpressure: options.backpressure.unwrap_or_default(),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();

        assert_eq!(validated.leader_quorum_liveness_timeout, validated.follower_max_timeout);
        assert_eq!(validated.max_in_flight_appends_per_peer, 2);
        assert_eq!(validated.snapshot_entry_threshold, None);
        assert_eq!(validated.backpressure, BackpressureOptions::default());
    }

    #[test]
    fn liveness_timeout_follows_follower_max_timeout() {
        let validated = RaftOptionsValidated::try_from(RaftOptions {
            follower_min_timeout: Some(Duration::from_millis(150)),
            follower_max_timeout: Some(Duration::from_millis(300)),
            leader_heartbeat_duration: Some(Duration::from_millis(20)),
            leader_append_entries_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(validated.leader_quorum_liveness_timeout, Duration::from_millis(300));
    }

    #[test]
    fn rejects_illegal_combinations() {
        let cases = vec![
            RaftOptions {
                leader_heartbeat_duration: Some(Duration::from_millis(600)),
                ..Default::default()
            },
            RaftOptions {
                follower_min_timeout: Some(Duration::from_millis(2000)),
                ..Default::default()
            },
            RaftOptions {
                leader_append_entries_timeout: Some(Duration::from_millis(500)),
                ..Default::default()
            },
            RaftOptions {
                leader_quorum_liveness_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
            RaftOptions {
                max_append_batch_entries: Some(0),
                ..Default::default()
            },
            RaftOptions {
                max_in_flight_appends_per_peer: Some(0),
                ..Default::default()
            },
            RaftOptions {
                snapshot_chunk_size_bytes: Some(0),
                ..Default::default()
            },
            RaftOptions {
                snapshot_entry_threshold: Some(0),
                ..Default::default()
            },
        ];

        for options in cases {
            assert!(RaftOptionsValidated::try_from(options).is_err());
        }
    }
}
