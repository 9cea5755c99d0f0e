mod common;

use bytes::Bytes;
use common::{test_options, TestCluster};
use logstream_raft::{AppendError, BackpressureAlgorithm, BackpressureOptions, RaftOptions};
use std::error::Error;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

// Below the append RPC timeout, so replication slows down but keeps working.
const INJECTED_LATENCY: Duration = Duration::from_millis(100);

struct Wave {
    admitted: Vec<Duration>,
    rejected: Vec<Duration>,
}

/// Fires `size` appends at once and waits for all of them.
async fn send_wave(cluster: &Arc<TestCluster>, leader: &str, size: usize) -> Result<Wave, Box<dyn Error>> {
    let mut tasks = Vec::with_capacity(size);
    for i in 0..size {
        let cluster = cluster.clone();
        let leader = leader.to_string();
        tasks.push(tokio::spawn(async move {
            let start = Instant::now();
            let result = cluster.node(&leader).append(Bytes::from(format!("wave-{}", i))).await;
            (result, start.elapsed())
        }));
    }

    let mut wave = Wave {
        admitted: Vec::new(),
        rejected: Vec::new(),
    };
    for task in tasks {
        match task.await? {
            (Ok(_), elapsed) => wave.admitted.push(elapsed),
            (Err(AppendError::Overloaded), elapsed) => wave.rejected.push(elapsed),
            (Err(e), _) => return Err(e.into()),
        }
    }
    Ok(wave)
}

async fn admission_stays_bounded(
    algorithm: BackpressureAlgorithm,
    min_limit: usize,
    max_limit: usize,
    wave_size: usize,
    expect_rejections: bool,
) -> Result<(), Box<dyn Error>> {
    let options = RaftOptions {
        backpressure: Some(BackpressureOptions {
            enabled: true,
            use_windowed: false,
            algorithm,
        }),
        ..test_options()
    };
    let cluster = Arc::new(TestCluster::bootstrap_with_options(3, options).await?);
    let leader = cluster.wait_for_any_leader().await?;
    cluster.network.set_latency(INJECTED_LATENCY);

    let mut total_rejected = 0;
    for _ in 0..5 {
        let wave = send_wave(&cluster, &leader, wave_size).await?;
        assert!(!wave.admitted.is_empty());

        // Rejections come back right away instead of waiting in line behind admitted entries.
        if let (Some(fastest_admitted), Some(fastest_rejected)) =
            (wave.admitted.iter().min(), wave.rejected.iter().min())
        {
            assert!(fastest_rejected < fastest_admitted);
        }
        total_rejected += wave.rejected.len();

        let status = cluster.node(&leader).status().await?;
        let limit = status.admission_limit.expect("Backpressure is enabled");
        assert!(
            (min_limit..=max_limit).contains(&limit),
            "{:?} limit {} outside [{}, {}]",
            algorithm,
            limit,
            min_limit,
            max_limit
        );
        assert!(status.in_flight_appends <= limit);
    }
    if expect_rejections {
        assert!(total_rejected > 0, "Waves of {} never hit the limit", wave_size);
    }

    Ok(())
}

#[tokio::test]
async fn gradient_rejects_beyond_limit() -> Result<(), Box<dyn Error>> {
    admission_stays_bounded(BackpressureAlgorithm::Gradient, 10, 1000, 200, true).await
}

#[tokio::test]
async fn gradient2_rejects_beyond_limit() -> Result<(), Box<dyn Error>> {
    admission_stays_bounded(BackpressureAlgorithm::Gradient2, 20, 1000, 200, true).await
}

#[tokio::test]
async fn vegas_limit_stays_bounded() -> Result<(), Box<dyn Error>> {
    // Vegas starts out far above what one wave can fill.
    admission_stays_bounded(BackpressureAlgorithm::Vegas, 1, 8192, 300, false).await
}

#[tokio::test]
async fn disabled_backpressure_admits_everything() -> Result<(), Box<dyn Error>> {
    let options = RaftOptions {
        backpressure: Some(BackpressureOptions {
            enabled: false,
            ..BackpressureOptions::default()
        }),
        ..test_options()
    };
    let cluster = Arc::new(TestCluster::bootstrap_with_options(3, options).await?);
    let leader = cluster.wait_for_any_leader().await?;

    let wave = send_wave(&cluster, &leader, 300).await?;
    assert_eq!(wave.admitted.len(), 300);
    assert!(wave.rejected.is_empty());
    assert_eq!(cluster.node(&leader).status().await?.admission_limit, None);

    Ok(())
}
