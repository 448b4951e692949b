// =============================================================================
// ramp.rs - THE ADMISSION CONTROLLER
// =============================================================================
//
// A thousand devices slamming a broker in the same millisecond is a thundering
// herd, not a load test. The ramp admits workers in stages: absolute counts
// ("--ramp 100 500 1000") or cumulative percentages ("--ramp-percentages
// 25 50 100"), with a dwell between stages. Both forms normalize to the same
// thing: a non-decreasing sequence of cumulative worker counts ending at the
// full fleet.
//
// The second half of this file synchronizes the first burst. Workers that
// survive their connect arrive at a start gate; once the first stage is
// assembled, the coordinator stamps a single shared start instant a short
// lead time in the future, and every worker schedules its ticks off that
// instant. Tick k happens at S + k*I across the whole shard, which is the
// entire point of a simultaneity test.
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

/// Lower bound on the release lead time so every waiter can observe the
/// start instant before the first tick is due.
pub const MIN_LEAD_TIME_SECS: f64 = 0.05;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RampError {
    #[error("all ramp stage counts must be positive")]
    NonPositiveCount,
    #[error("ramp stages must form a non-decreasing sequence")]
    DecreasingCounts,
    #[error("the last ramp stage ({last}) cannot exceed the fleet size ({total})")]
    ExceedsFleet { last: usize, total: usize },
    #[error("invalid ramp percentage: {0}")]
    InvalidPercentage(String),
    #[error("ramp percentages must be greater than 0")]
    NonPositivePercentage,
    #[error("ramp percentages cannot exceed 100")]
    PercentageTooLarge,
    #[error("ramp percentages must form a non-decreasing sequence")]
    DecreasingPercentages,
}

/// Normalize a sequence of absolute cumulative counts. `None` or empty
/// means "everyone at once".
pub fn parse_ramp(values: Option<&[u64]>, total_devices: usize) -> Result<Vec<usize>, RampError> {
    let values = match values {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(vec![total_devices]),
    };
    if values.iter().any(|&v| v == 0) {
        return Err(RampError::NonPositiveCount);
    }
    if values.windows(2).any(|pair| pair[1] < pair[0]) {
        return Err(RampError::DecreasingCounts);
    }
    let mut ramp: Vec<usize> = values.iter().map(|&v| v as usize).collect();
    let last = *ramp.last().expect("non-empty ramp");
    if last > total_devices {
        return Err(RampError::ExceedsFleet {
            last,
            total: total_devices,
        });
    }
    if last < total_devices {
        ramp.push(total_devices);
    }
    Ok(ramp)
}

/// Normalize a sequence of cumulative percentages. Accepts "25", "25%",
/// and fraction form "0.25"; each stage becomes `ceil(N * p / 100)`
/// clamped into [1, N] and made non-decreasing.
pub fn parse_ramp_percentages(
    values: Option<&[String]>,
    total_devices: usize,
) -> Result<Vec<usize>, RampError> {
    let values = match values {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(vec![total_devices]),
    };
    let mut percentages: Vec<f64> = Vec::new();
    for raw in values {
        let text = raw.trim();
        if text.is_empty() {
            continue;
        }
        let text = text.strip_suffix('%').unwrap_or(text);
        let number: f64 = text
            .parse()
            .map_err(|_| RampError::InvalidPercentage(raw.clone()))?;
        if number <= 0.0 {
            return Err(RampError::NonPositivePercentage);
        }
        // "0.25" is a fraction, "25" is a percentage. Both mean a quarter.
        // Only a literal with a decimal point is fraction form: "1" is a
        // one-percent stage, "1.0" is the whole fleet.
        let number = if number <= 1.0 && text.contains('.') {
            number * 100.0
        } else {
            number
        };
        if number > 100.0 {
            return Err(RampError::PercentageTooLarge);
        }
        percentages.push(number);
    }
    if percentages.is_empty() {
        return Ok(vec![total_devices]);
    }
    if percentages.windows(2).any(|pair| pair[1] < pair[0]) {
        return Err(RampError::DecreasingPercentages);
    }
    let mut ramp: Vec<usize> = Vec::with_capacity(percentages.len() + 1);
    for pct in percentages {
        let mut count = (total_devices as f64 * pct / 100.0).ceil() as usize;
        count = count.clamp(1, total_devices.max(1));
        if let Some(&previous) = ramp.last() {
            if count < previous {
                count = previous;
            }
        }
        ramp.push(count);
    }
    if *ramp.last().expect("non-empty ramp") < total_devices {
        ramp.push(total_devices);
    }
    Ok(ramp)
}

/// Rendezvous point for the first burst: workers arrive once their MQTT
/// session is up, the shard waits until the expected number have arrived.
/// Arrivals beyond the expected count are no-ops, so reconnecting workers
/// cannot double-arrive.
pub struct StartGate {
    remaining: Mutex<usize>,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl StartGate {
    pub fn new(expected: usize) -> Self {
        let (tx, rx) = watch::channel(expected == 0);
        Self {
            remaining: Mutex::new(expected),
            tx,
            rx,
        }
    }

    pub fn arrive(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining == 0 {
            return;
        }
        *remaining -= 1;
        if *remaining == 0 {
            let _ = self.tx.send(true);
        }
    }

    /// Resolve once every expected worker has arrived.
    pub async fn assembled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Publishes the shared wall-clock start instant. `release` is idempotent;
/// the first call wins and later calls return the already-stamped instant.
pub struct StartCoordinator {
    tx: watch::Sender<Option<Instant>>,
    rx: watch::Receiver<Option<Instant>>,
    lead_time: Duration,
}

impl StartCoordinator {
    pub fn new(lead_time_secs: f64) -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx,
            rx,
            lead_time: Duration::from_secs_f64(lead_time_secs.max(MIN_LEAD_TIME_SECS)),
        }
    }

    /// Stamp the start instant `lead_time` in the future and wake every
    /// waiter.
    pub fn release(&self) -> Instant {
        if let Some(already) = *self.rx.borrow() {
            return already;
        }
        let start = Instant::now() + self.lead_time;
        let _ = self.tx.send(Some(start));
        start
    }

    /// Block until the start instant is published.
    pub async fn wait(&self) -> Instant {
        let mut rx = self.rx.clone();
        loop {
            if let Some(start) = *rx.borrow_and_update() {
                return start;
            }
            if rx.changed().await.is_err() {
                // Coordinator dropped without releasing; start immediately
                // rather than hanging a worker forever.
                return Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_ramp_means_everyone_at_once() {
        assert_eq!(parse_ramp(None, 7).unwrap(), vec![7]);
        assert_eq!(parse_ramp_percentages(None, 7).unwrap(), vec![7]);
    }

    #[test]
    fn test_counts_are_normalized_and_capped() {
        assert_eq!(parse_ramp(Some(&[3, 5]), 10).unwrap(), vec![3, 5, 10]);
        assert_eq!(parse_ramp(Some(&[10]), 10).unwrap(), vec![10]);
        assert_eq!(
            parse_ramp(Some(&[4, 20]), 10),
            Err(RampError::ExceedsFleet { last: 20, total: 10 })
        );
        assert_eq!(parse_ramp(Some(&[0, 5]), 10), Err(RampError::NonPositiveCount));
        assert_eq!(parse_ramp(Some(&[5, 3]), 10), Err(RampError::DecreasingCounts));
    }

    #[test]
    fn test_percentages_match_spec_example() {
        let values: Vec<String> = ["25", "50", "100"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            parse_ramp_percentages(Some(&values), 10).unwrap(),
            vec![3, 5, 10]
        );
    }

    #[test]
    fn test_fraction_and_percent_suffix_forms_agree() {
        let plain: Vec<String> = ["25", "50", "100"].iter().map(|s| s.to_string()).collect();
        let suffixed: Vec<String> = ["25%", "50%", "100%"].iter().map(|s| s.to_string()).collect();
        let fractions: Vec<String> = ["0.25", "0.5", "1.0"].iter().map(|s| s.to_string()).collect();
        let expected = parse_ramp_percentages(Some(&plain), 40).unwrap();
        assert_eq!(parse_ramp_percentages(Some(&suffixed), 40).unwrap(), expected);
        assert_eq!(parse_ramp_percentages(Some(&fractions), 40).unwrap(), expected);
    }

    #[test]
    fn test_percentages_derive_same_ramp_as_counts() {
        // Percentages converted to counts by hand, then re-parsed as counts,
        // must yield the identical sequence.
        let total = 10usize;
        let pcts: Vec<String> = ["25", "50", "100"].iter().map(|s| s.to_string()).collect();
        let from_pcts = parse_ramp_percentages(Some(&pcts), total).unwrap();
        let counts: Vec<u64> = from_pcts.iter().map(|&c| c as u64).collect();
        let from_counts = parse_ramp(Some(&counts), total).unwrap();
        assert_eq!(from_pcts, from_counts);
    }

    #[test]
    fn test_percentage_validation() {
        let bad: Vec<String> = vec!["120".to_string()];
        assert_eq!(
            parse_ramp_percentages(Some(&bad), 10),
            Err(RampError::PercentageTooLarge)
        );
        let negative: Vec<String> = vec!["-5".to_string()];
        assert_eq!(
            parse_ramp_percentages(Some(&negative), 10),
            Err(RampError::NonPositivePercentage)
        );
        let garbage: Vec<String> = vec!["many".to_string()];
        assert!(matches!(
            parse_ramp_percentages(Some(&garbage), 10),
            Err(RampError::InvalidPercentage(_))
        ));
        let decreasing: Vec<String> = vec!["50".to_string(), "25".to_string()];
        assert_eq!(
            parse_ramp_percentages(Some(&decreasing), 10),
            Err(RampError::DecreasingPercentages)
        );
    }

    #[test]
    fn test_tiny_fleet_rounds_up_to_one() {
        let values: Vec<String> = vec!["1".to_string(), "100".to_string()];
        assert_eq!(parse_ramp_percentages(Some(&values), 3).unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_integer_one_is_a_percentage_not_a_fraction() {
        // "1" admits one percent of the fleet; "1.0" admits all of it.
        let as_percent: Vec<String> = vec!["1".to_string()];
        assert_eq!(
            parse_ramp_percentages(Some(&as_percent), 200).unwrap(),
            vec![2, 200]
        );
        let as_fraction: Vec<String> = vec!["1.0".to_string()];
        assert_eq!(
            parse_ramp_percentages(Some(&as_fraction), 200).unwrap(),
            vec![200]
        );
    }

    #[tokio::test]
    async fn test_gate_assembles_after_expected_arrivals() {
        let gate = StartGate::new(2);
        gate.arrive();
        gate.arrive();
        gate.arrive(); // extra arrival is a no-op
        tokio::time::timeout(Duration::from_secs(1), gate.assembled())
            .await
            .expect("gate should open after two arrivals");
    }

    #[tokio::test]
    async fn test_empty_gate_is_open_immediately() {
        let gate = StartGate::new(0);
        tokio::time::timeout(Duration::from_secs(1), gate.assembled())
            .await
            .expect("empty gate is already open");
    }

    #[tokio::test]
    async fn test_coordinator_release_is_idempotent_and_leads() {
        let coordinator = StartCoordinator::new(0.0);
        let before = Instant::now();
        let first = coordinator.release();
        let second = coordinator.release();
        assert_eq!(first, second);
        // Lead time is clamped up to the minimum even when asked for zero.
        assert!(first >= before + Duration::from_secs_f64(MIN_LEAD_TIME_SECS));
        let observed = coordinator.wait().await;
        assert_eq!(observed, first);
    }

    #[tokio::test]
    async fn test_waiters_observe_release() {
        let coordinator = std::sync::Arc::new(StartCoordinator::new(0.1));
        let waiter = coordinator.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let released = coordinator.release();
        let observed = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should resolve")
            .expect("waiter should not panic");
        assert_eq!(observed, released);
    }
}
