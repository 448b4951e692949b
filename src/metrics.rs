// =============================================================================
// metrics.rs - THE MEASUREMENT LEDGER
// =============================================================================
//
// Every publish, every connect, every disconnect of every simulated device
// flows through this one object. One parking_lot mutex guards the whole
// ledger; recording never fails and never blocks on anything slower than
// another recorder. Readers get immutable value-typed snapshots.
//
// The interesting bits:
// - Latency percentiles over a lazily re-sorted cache. Writers append and
//   invalidate; the first reader after a write pays for the sort.
// - A one-shot collapse marker: the instant the run first went wrong, set
//   exactly once. Either the first non-graceful failure, or the moment the
//   last connected client walked out while nobody asked the fleet to stop.
// - A per-device health table, because "which of my thousand devices is
//   the sick one" is the first question every operator asks.
// =============================================================================

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::models::{iso_timestamp, utcnow, DeviceBreakdownEntry, DeviceStatus, FailureStage};
use crate::stop::StopToken;

/// Mutable per-device counters. Owned by the aggregator, touched only
/// under its lock.
#[derive(Debug, Clone)]
pub struct DeviceStats {
    pub status: DeviceStatus,
    pub last_stage: FailureStage,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub failure_detail: Option<String>,
    pub disconnect_code: Option<u8>,
    pub messages: u64,
    pub failed_messages: u64,
    pub bytes: u64,
}

impl Default for DeviceStats {
    fn default() -> Self {
        Self {
            status: DeviceStatus::Pending,
            last_stage: FailureStage::Startup,
            last_seen: None,
            last_failure: None,
            failure_reason: None,
            failure_detail: None,
            disconnect_code: None,
            messages: 0,
            failed_messages: 0,
            bytes: 0,
        }
    }
}

/// Read-only view of one device's health, serialized into `metrics.json`
/// for dashboards that want the sick-device table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealth {
    pub name: String,
    pub status: DeviceStatus,
    pub last_stage: FailureStage,
    pub last_seen: Option<String>,
    pub last_failure: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_detail: Option<String>,
    pub disconnect_code: Option<u8>,
}

/// Immutable snapshot of the whole ledger at one instant. This is the
/// wire format: the CSV sink, the `/api/metrics` endpoint, the shard
/// reports to the global aggregator and the final summary all speak it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub uptime_seconds: f64,
    pub elapsed_seconds: f64,
    pub total_devices: u64,
    pub active_clients: u64,
    pub connected_devices: u64,
    pub failed_devices: u64,
    pub successful_publishes: u64,
    pub failed_publishes: u64,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub avg_latency_ms: Option<f64>,
    pub p50_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
    pub messages_per_second: f64,
    pub bandwidth_mbps: f64,
    pub data_volume_mb: f64,
    pub avg_send_rate_per_device: f64,
    pub avg_messages_per_device: f64,
    pub channels_in_use: u64,
    pub bytes_sent: u64,
    pub peak_connected_devices: u64,
    pub collapse_time_seconds: Option<f64>,
    pub collapse_reason: Option<String>,
    pub disconnect_causes: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// The all-zeroes snapshot served before any shard has reported.
    pub fn empty() -> Self {
        Self {
            timestamp: iso_timestamp(utcnow()),
            uptime_seconds: 0.0,
            elapsed_seconds: 0.0,
            total_devices: 0,
            active_clients: 0,
            connected_devices: 0,
            failed_devices: 0,
            successful_publishes: 0,
            failed_publishes: 0,
            messages_sent: 0,
            messages_failed: 0,
            avg_latency_ms: None,
            p50_latency_ms: None,
            p95_latency_ms: None,
            p99_latency_ms: None,
            messages_per_second: 0.0,
            bandwidth_mbps: 0.0,
            data_volume_mb: 0.0,
            avg_send_rate_per_device: 0.0,
            avg_messages_per_device: 0.0,
            channels_in_use: 0,
            bytes_sent: 0,
            peak_connected_devices: 0,
            collapse_time_seconds: None,
            collapse_reason: None,
            disconnect_causes: BTreeMap::new(),
        }
    }
}

struct AggregatorInner {
    success_count: u64,
    failure_count: u64,
    latencies: Vec<f64>,
    latencies_sorted: bool,
    latencies_cache: Vec<f64>,
    active: HashSet<String>,
    seen: HashSet<String>,
    failed: HashSet<String>,
    devices: HashMap<String, DeviceStats>,
    disconnect_causes: BTreeMap<String, u64>,
    bytes_sent: u64,
    peak_connected: u64,
    collapse_elapsed: Option<f64>,
    collapse_reason: Option<String>,
}

impl AggregatorInner {
    fn device(&mut self, device_id: &str) -> &mut DeviceStats {
        self.devices.entry(device_id.to_string()).or_default()
    }

    fn mark_collapse(&mut self, elapsed: f64, reason: &str) {
        if self.collapse_elapsed.is_none() {
            self.collapse_elapsed = Some(elapsed);
            self.collapse_reason = Some(reason.to_string());
        }
    }

    /// Caller must hold the lock. Re-sorts the cache only when a write
    /// invalidated it since the last read.
    fn sorted_latencies(&mut self) -> &[f64] {
        if !self.latencies_sorted {
            self.latencies_cache = self.latencies.clone();
            self.latencies_cache
                .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            self.latencies_sorted = true;
        }
        &self.latencies_cache
    }
}

/// Thread-safe metrics ledger for one shard. One instance per shard
/// process; recording operations never fail.
pub struct MetricsAggregator {
    total_devices: usize,
    started: Instant,
    stop: StopToken,
    inner: Mutex<AggregatorInner>,
}

impl MetricsAggregator {
    /// `total_devices` is the declared fleet size for this shard; the stop
    /// token lets the collapse rule distinguish "everyone left because we
    /// told them to" from "everyone left".
    pub fn new(total_devices: usize, stop: StopToken) -> Self {
        Self {
            total_devices,
            started: Instant::now(),
            stop,
            inner: Mutex::new(AggregatorInner {
                success_count: 0,
                failure_count: 0,
                latencies: Vec::new(),
                latencies_sorted: true,
                latencies_cache: Vec::new(),
                active: HashSet::new(),
                seen: HashSet::new(),
                failed: HashSet::new(),
                devices: HashMap::new(),
                disconnect_causes: BTreeMap::new(),
                bytes_sent: 0,
                peak_connected: 0,
                collapse_elapsed: None,
                collapse_reason: None,
            }),
        }
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64().max(1e-9)
    }

    pub fn record_client_connected(&self, device_id: &str) {
        let now = utcnow();
        let mut inner = self.inner.lock();
        inner.active.insert(device_id.to_string());
        inner.seen.insert(device_id.to_string());
        let connected = inner.active.len() as u64;
        inner.peak_connected = inner.peak_connected.max(connected);
        let stats = inner.device(device_id);
        stats.status = DeviceStatus::Connected;
        stats.last_stage = FailureStage::Connect;
        stats.last_seen = Some(now);
        stats.disconnect_code = Some(0);
    }

    pub fn record_client_disconnected(&self, device_id: &str, reason: &str, graceful: bool) {
        let elapsed = self.elapsed();
        let now = utcnow();
        let mut inner = self.inner.lock();
        inner.active.remove(device_id);
        if graceful {
            let stats = inner.device(device_id);
            stats.status = DeviceStatus::Disconnected;
            stats.last_stage = FailureStage::Disconnect;
        } else {
            inner.failed.insert(device_id.to_string());
            let stats = inner.device(device_id);
            stats.status = DeviceStatus::Failed;
            stats.last_stage = FailureStage::Disconnect;
            stats.last_failure = Some(now);
            stats.failure_reason = Some(reason.to_string());
            *inner.disconnect_causes.entry(reason.to_string()).or_insert(0) += 1;
            inner.mark_collapse(elapsed, reason);
        }
        // Losing the last connected client is a collapse in its own right,
        // unless shutdown is already in progress.
        if inner.active.is_empty() && !self.stop.is_stopped() {
            inner.mark_collapse(elapsed, reason);
        }
    }

    pub fn record_publish_success(&self, device_id: &str, latency_seconds: f64, payload_bytes: usize) {
        let now = utcnow();
        let mut inner = self.inner.lock();
        inner.success_count += 1;
        inner.latencies.push(latency_seconds);
        inner.latencies_sorted = false;
        inner.bytes_sent += payload_bytes as u64;
        let stats = inner.device(device_id);
        stats.status = DeviceStatus::Connected;
        stats.last_stage = FailureStage::Publish;
        stats.last_seen = Some(now);
        stats.messages += 1;
        stats.bytes += payload_bytes as u64;
    }

    pub fn record_publish_failure(&self, device_id: &str, reason: &str, detail: Option<&str>) {
        let elapsed = self.elapsed();
        let now = utcnow();
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.failed.insert(device_id.to_string());
        let stats = inner.device(device_id);
        stats.status = DeviceStatus::Failed;
        stats.last_stage = FailureStage::Publish;
        stats.last_failure = Some(now);
        stats.failure_reason = Some(reason.to_string());
        stats.failure_detail = detail.map(str::to_string);
        stats.failed_messages += 1;
        *inner.disconnect_causes.entry(reason.to_string()).or_insert(0) += 1;
        inner.mark_collapse(elapsed, reason);
    }

    /// Like a publish failure, but without the per-device packet counter:
    /// nothing was ever attempted on the wire for this tick.
    pub fn record_connection_failure(
        &self,
        device_id: &str,
        reason: &str,
        detail: Option<&str>,
        code: Option<u8>,
    ) {
        let elapsed = self.elapsed();
        let now = utcnow();
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.failed.insert(device_id.to_string());
        let stats = inner.device(device_id);
        stats.status = DeviceStatus::Failed;
        stats.last_stage = FailureStage::Connect;
        stats.last_failure = Some(now);
        stats.failure_reason = Some(reason.to_string());
        stats.failure_detail = detail.map(str::to_string);
        if code.is_some() {
            stats.disconnect_code = code;
        }
        *inner.disconnect_causes.entry(reason.to_string()).or_insert(0) += 1;
        inner.mark_collapse(elapsed, reason);
    }

    /// Derive an immutable snapshot under the lock. Latency statistics use
    /// the lazily re-sorted cache; nothing here mutates a counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed = self.elapsed();
        let now = utcnow();
        let mut inner = self.inner.lock();

        let avg_ms = if inner.latencies.is_empty() {
            None
        } else {
            let sum: f64 = inner.latencies.iter().sum();
            Some(round4(sum / inner.latencies.len() as f64 * 1000.0))
        };
        let sorted = inner.sorted_latencies();
        let p50_ms = percentile(50.0, sorted).map(|v| round4(v * 1000.0));
        let p95_ms = percentile(95.0, sorted).map(|v| round4(v * 1000.0));
        let p99_ms = percentile(99.0, sorted).map(|v| round4(v * 1000.0));

        let observed_devices = self.total_devices.max(inner.seen.len()).max(1) as u64;
        let messages_per_second = inner.success_count as f64 / elapsed;
        let bandwidth_mbps = (inner.bytes_sent * 8) as f64 / elapsed / 1_000_000.0;

        MetricsSnapshot {
            timestamp: iso_timestamp(now),
            uptime_seconds: round2(elapsed),
            elapsed_seconds: elapsed,
            total_devices: observed_devices,
            active_clients: inner.active.len() as u64,
            connected_devices: inner.active.len() as u64,
            failed_devices: inner.failed.len() as u64,
            successful_publishes: inner.success_count,
            failed_publishes: inner.failure_count,
            messages_sent: inner.success_count,
            messages_failed: inner.failure_count,
            avg_latency_ms: avg_ms,
            p50_latency_ms: p50_ms,
            p95_latency_ms: p95_ms,
            p99_latency_ms: p99_ms,
            messages_per_second: round4(messages_per_second),
            bandwidth_mbps: round6(bandwidth_mbps),
            data_volume_mb: inner.bytes_sent as f64 / (1024.0 * 1024.0),
            avg_send_rate_per_device: messages_per_second / observed_devices as f64,
            avg_messages_per_device: inner.success_count as f64 / observed_devices as f64,
            channels_in_use: inner.active.len() as u64,
            bytes_sent: inner.bytes_sent,
            peak_connected_devices: inner.peak_connected,
            collapse_time_seconds: inner.collapse_elapsed,
            collapse_reason: inner.collapse_reason.clone(),
            disconnect_causes: inner.disconnect_causes.clone(),
        }
    }

    /// End-of-run view. Identical to [`snapshot`] except `total_devices`
    /// reports `max(declared, |seen|)` without the floor of one, which is
    /// the value tests and summaries must assert on.
    pub fn summary(&self) -> MetricsSnapshot {
        let mut snap = self.snapshot();
        let seen = self.inner.lock().seen.len();
        snap.total_devices = self.total_devices.max(seen) as u64;
        snap
    }

    /// Devices ordered by message count, busiest first, device id as the
    /// tie break so a shorter listing is always a prefix of a longer one.
    pub fn device_breakdown(&self, limit: Option<usize>) -> Vec<DeviceBreakdownEntry> {
        let inner = self.inner.lock();
        let mut entries: Vec<DeviceBreakdownEntry> = inner
            .devices
            .iter()
            .map(|(device, stats)| DeviceBreakdownEntry {
                device: device.clone(),
                messages: stats.messages,
                failed_messages: stats.failed_messages,
                bytes: stats.bytes,
            })
            .collect();
        entries.sort_by(|a, b| b.messages.cmp(&a.messages).then_with(|| a.device.cmp(&b.device)));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        entries
    }

    /// Per-device health rows, sorted by name, for `metrics.json`.
    pub fn device_health(&self) -> Vec<DeviceHealth> {
        let inner = self.inner.lock();
        let mut health: Vec<DeviceHealth> = inner
            .devices
            .iter()
            .map(|(name, stats)| DeviceHealth {
                name: name.clone(),
                status: stats.status,
                last_stage: stats.last_stage,
                last_seen: stats.last_seen.map(iso_timestamp),
                last_failure: stats.last_failure.map(iso_timestamp),
                failure_reason: stats.failure_reason.clone(),
                failure_detail: stats.failure_detail.clone(),
                disconnect_code: stats.disconnect_code,
            })
            .collect();
        health.sort_by(|a, b| a.name.cmp(&b.name));
        health
    }
}

/// Linear-interpolation percentile over pre-sorted data. Empty input has
/// no percentile; a single sample is every percentile.
pub fn percentile(percent: f64, sorted: &[f64]) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let rank = (sorted.len() - 1) as f64 * percent / 100.0;
    let lower_index = rank.floor() as usize;
    let upper_index = rank.ceil() as usize;
    if lower_index == upper_index {
        return Some(sorted[lower_index]);
    }
    let lower = sorted[lower_index];
    let upper = sorted[upper_index];
    Some(lower + (upper - lower) * (rank - lower_index as f64))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(total: usize) -> MetricsAggregator {
        MetricsAggregator::new(total, StopToken::new())
    }

    #[test]
    fn test_percentile_empty_and_single() {
        assert_eq!(percentile(95.0, &[]), None);
        assert_eq!(percentile(50.0, &[0.25]), Some(0.25));
        assert_eq!(percentile(99.0, &[0.25]), Some(0.25));
    }

    #[test]
    fn test_percentile_interpolates_linearly() {
        let data = [1.0, 2.0, 3.0, 4.0];
        // rank = 3 * 0.5 = 1.5 -> halfway between 2.0 and 3.0
        assert_eq!(percentile(50.0, &data), Some(2.5));
        assert_eq!(percentile(0.0, &data), Some(1.0));
        assert_eq!(percentile(100.0, &data), Some(4.0));
    }

    #[test]
    fn test_percentile_order_holds() {
        let agg = aggregator(5);
        for i in 0..100 {
            let latency = 0.001 * ((i * 37) % 100 + 1) as f64;
            agg.record_publish_success("sim-0", latency, 64);
        }
        let snap = agg.snapshot();
        let p50 = snap.p50_latency_ms.unwrap();
        let p95 = snap.p95_latency_ms.unwrap();
        let p99 = snap.p99_latency_ms.unwrap();
        assert!(p50 <= p95, "p50={p50} p95={p95}");
        assert!(p95 <= p99, "p95={p95} p99={p99}");
    }

    #[test]
    fn test_publish_success_accumulates() {
        let agg = aggregator(2);
        agg.record_client_connected("sim-0");
        agg.record_publish_success("sim-0", 0.1, 100);
        agg.record_publish_success("sim-0", 0.3, 100);
        let snap = agg.snapshot();
        assert_eq!(snap.successful_publishes, 2);
        assert_eq!(snap.failed_publishes, 0);
        assert_eq!(snap.bytes_sent, 200);
        assert_eq!(snap.avg_latency_ms, Some(200.0));
        assert!(snap.collapse_time_seconds.is_none());
        assert!(snap.disconnect_causes.is_empty());
    }

    #[test]
    fn test_collapse_marked_once() {
        let agg = aggregator(3);
        agg.record_publish_failure("sim-0", "network", Some("connection reset"));
        let first = agg.snapshot();
        agg.record_publish_failure("sim-1", "auth", None);
        let second = agg.snapshot();
        assert_eq!(first.collapse_reason.as_deref(), Some("network"));
        assert_eq!(second.collapse_reason.as_deref(), Some("network"));
        assert_eq!(
            first.collapse_time_seconds,
            second.collapse_time_seconds,
            "collapse instant must not move"
        );
        assert_eq!(second.disconnect_causes.get("network"), Some(&1));
        assert_eq!(second.disconnect_causes.get("auth"), Some(&1));
    }

    #[test]
    fn test_losing_last_client_collapses_unless_stopping() {
        let stop = StopToken::new();
        let agg = MetricsAggregator::new(2, stop.clone());
        agg.record_client_connected("sim-0");
        agg.record_client_disconnected("sim-0", "loop_exit", true);
        let snap = agg.snapshot();
        assert_eq!(snap.collapse_reason.as_deref(), Some("loop_exit"));

        let stop = StopToken::new();
        let agg = MetricsAggregator::new(2, stop.clone());
        agg.record_client_connected("sim-0");
        stop.trip("test shutdown");
        agg.record_client_disconnected("sim-0", "stopped", true);
        assert!(agg.snapshot().collapse_time_seconds.is_none());
    }

    #[test]
    fn test_non_graceful_disconnect_counts_cause() {
        let agg = aggregator(2);
        agg.record_client_connected("sim-0");
        agg.record_client_connected("sim-1");
        agg.record_client_disconnected("sim-0", "mqtt_error:network", false);
        let snap = agg.snapshot();
        assert_eq!(snap.failed_devices, 1);
        assert_eq!(snap.active_clients, 1);
        assert_eq!(snap.disconnect_causes.get("mqtt_error:network"), Some(&1));
        assert_eq!(snap.collapse_reason.as_deref(), Some("mqtt_error:network"));
    }

    #[test]
    fn test_peak_connected_is_monotonic() {
        let agg = aggregator(3);
        agg.record_client_connected("sim-0");
        agg.record_client_connected("sim-1");
        agg.record_client_disconnected("sim-0", "graceful", true);
        agg.record_client_connected("sim-2");
        let snap = agg.snapshot();
        assert_eq!(snap.peak_connected_devices, 2);
        assert_eq!(snap.active_clients, 2);
    }

    #[test]
    fn test_summary_reports_max_of_declared_and_seen() {
        let agg = aggregator(2);
        for device in ["sim-0", "sim-1", "sim-2"] {
            agg.record_client_connected(device);
        }
        assert_eq!(agg.summary().total_devices, 3);

        let sparse = aggregator(10);
        sparse.record_client_connected("sim-0");
        assert_eq!(sparse.summary().total_devices, 10);
    }

    #[test]
    fn test_breakdown_orders_and_prefixes() {
        let agg = aggregator(4);
        agg.record_publish_success("sim-b", 0.01, 10);
        agg.record_publish_success("sim-b", 0.01, 10);
        agg.record_publish_success("sim-a", 0.01, 10);
        agg.record_publish_success("sim-c", 0.01, 10);
        agg.record_publish_failure("sim-d", "network", None);

        let top2 = agg.device_breakdown(Some(2));
        let top3 = agg.device_breakdown(Some(3));
        let all = agg.device_breakdown(None);

        assert_eq!(top2[0].device, "sim-b");
        // Tie between sim-a and sim-c broken by name.
        assert_eq!(top2[1].device, "sim-a");
        assert_eq!(&top3[..2], &top2[..]);
        assert_eq!(&all[..3], &top3[..]);
        assert_eq!(all.last().unwrap().device, "sim-d");
        assert_eq!(all.last().unwrap().failed_messages, 1);
    }

    #[test]
    fn test_connection_failure_skips_packet_counter() {
        let agg = aggregator(1);
        agg.record_connection_failure("sim-0", "auth", Some("Not authorized"), Some(5));
        let snap = agg.snapshot();
        assert_eq!(snap.failed_publishes, 1);
        let breakdown = agg.device_breakdown(None);
        assert_eq!(breakdown[0].failed_messages, 0);
        let health = agg.device_health();
        assert_eq!(health[0].disconnect_code, Some(5));
        assert_eq!(health[0].failure_reason.as_deref(), Some("auth"));
    }

    #[test]
    fn test_snapshot_roundtrips_through_json() {
        let agg = aggregator(2);
        agg.record_client_connected("sim-0");
        agg.record_publish_success("sim-0", 0.05, 128);
        let snap = agg.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
    }
}
