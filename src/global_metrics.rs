// =============================================================================
// global_metrics.rs - THE CLUSTER-WIDE LEDGER
// =============================================================================
//
// When the fleet outgrows one process, each shard keeps its own aggregator
// and reports snapshots over HTTP. This collector holds the latest report
// per shard (keyed by shard id, latest wins) and merges them into a single
// cluster-wide view on demand:
//
// - counters, byte totals, and rates: summed
// - latency statistics: weighted by each shard's success count, because a
//   shard that published ten times deserves a tenth of the influence of a
//   shard that published a hundred times
// - timestamps and uptimes: the most recent shard wins
// - collapse: the EARLIEST collapse wins, reasons are unioned
//
// Nothing in here talks to the network; the dashboard module feeds it.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;
use crate::models::DeviceBreakdownEntry;

/// Wire format of one shard's report, POSTed to `/api/shard`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardReport {
    pub shard_id: String,
    pub snapshot: MetricsSnapshot,
    pub devices: Vec<DeviceBreakdownEntry>,
}

struct ShardEntry {
    snapshot: MetricsSnapshot,
    devices: HashMap<String, DeviceBreakdownEntry>,
}

/// Orchestrator-side merger of shard snapshots.
#[derive(Default)]
pub struct GlobalMetricsCollector {
    shards: RwLock<HashMap<String, ShardEntry>>,
}

impl GlobalMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the latest report for a shard, replacing any previous one.
    pub fn ingest(
        &self,
        shard_id: &str,
        snapshot: MetricsSnapshot,
        devices: Vec<DeviceBreakdownEntry>,
    ) {
        let key = if shard_id.is_empty() {
            "default".to_string()
        } else {
            shard_id.to_string()
        };
        let device_map: HashMap<String, DeviceBreakdownEntry> = devices
            .into_iter()
            .map(|entry| (entry.device.clone(), entry))
            .collect();
        self.shards.write().insert(
            key,
            ShardEntry {
                snapshot,
                devices: device_map,
            },
        );
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Merge every shard's latest snapshot into one cluster view.
    pub fn summary(&self) -> MetricsSnapshot {
        let shards = self.shards.read();
        if shards.is_empty() {
            return MetricsSnapshot::empty();
        }

        let mut merged = MetricsSnapshot::empty();
        merged.timestamp = String::new();
        let mut weighted_avg = 0.0;
        let mut weighted_p50 = 0.0;
        let mut weighted_p95 = 0.0;
        let mut weighted_p99 = 0.0;
        let mut latency_weight = 0.0;
        let mut collapse_time: Option<f64> = None;
        let mut collapse_reasons: BTreeSet<String> = BTreeSet::new();
        let mut disconnect_causes: BTreeMap<String, u64> = BTreeMap::new();

        for entry in shards.values() {
            let snap = &entry.snapshot;
            merged.total_devices += snap.total_devices;
            merged.connected_devices += snap.connected_devices;
            merged.active_clients += snap.active_clients;
            merged.failed_devices += snap.failed_devices;
            merged.successful_publishes += snap.successful_publishes;
            merged.failed_publishes += snap.failed_publishes;
            merged.bytes_sent += snap.bytes_sent;
            merged.data_volume_mb += snap.data_volume_mb;
            merged.channels_in_use += snap.channels_in_use;
            merged.peak_connected_devices += snap.peak_connected_devices;
            merged.messages_per_second += snap.messages_per_second;
            merged.bandwidth_mbps += snap.bandwidth_mbps;

            if let Some(avg) = snap.avg_latency_ms {
                if snap.successful_publishes > 0 {
                    let weight = snap.successful_publishes as f64;
                    weighted_avg += avg * weight;
                    latency_weight += weight;
                    if let Some(p50) = snap.p50_latency_ms {
                        weighted_p50 += p50 * weight;
                    }
                    if let Some(p95) = snap.p95_latency_ms {
                        weighted_p95 += p95 * weight;
                    }
                    if let Some(p99) = snap.p99_latency_ms {
                        weighted_p99 += p99 * weight;
                    }
                }
            }

            if snap.timestamp > merged.timestamp {
                merged.timestamp = snap.timestamp.clone();
            }
            merged.uptime_seconds = merged.uptime_seconds.max(snap.uptime_seconds);
            merged.elapsed_seconds = merged.elapsed_seconds.max(snap.elapsed_seconds);

            if let Some(collapse) = snap.collapse_time_seconds {
                collapse_time = Some(match collapse_time {
                    Some(existing) => existing.min(collapse),
                    None => collapse,
                });
            }
            if let Some(reason) = &snap.collapse_reason {
                collapse_reasons.insert(reason.clone());
            }
            for (cause, count) in &snap.disconnect_causes {
                *disconnect_causes.entry(cause.clone()).or_insert(0) += count;
            }
        }

        if latency_weight > 0.0 {
            merged.avg_latency_ms = Some(weighted_avg / latency_weight);
            merged.p50_latency_ms = Some(weighted_p50 / latency_weight);
            merged.p95_latency_ms = Some(weighted_p95 / latency_weight);
            merged.p99_latency_ms = Some(weighted_p99 / latency_weight);
        }
        merged.messages_sent = merged.successful_publishes;
        merged.messages_failed = merged.failed_publishes;
        merged.avg_messages_per_device = if merged.total_devices > 0 {
            merged.successful_publishes as f64 / merged.total_devices as f64
        } else {
            0.0
        };
        merged.avg_send_rate_per_device =
            if merged.elapsed_seconds > 0.0 && merged.total_devices > 0 {
                (merged.successful_publishes as f64 / merged.elapsed_seconds)
                    / merged.total_devices as f64
            } else {
                0.0
            };
        merged.collapse_time_seconds = collapse_time;
        merged.collapse_reason = if collapse_reasons.is_empty() {
            None
        } else {
            Some(
                collapse_reasons
                    .into_iter()
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        };
        merged.disconnect_causes = disconnect_causes;
        merged
    }

    /// Per-device counters summed across shards, ordered busiest first.
    pub fn device_breakdown(&self, limit: Option<usize>) -> Vec<DeviceBreakdownEntry> {
        let shards = self.shards.read();
        let mut aggregated: HashMap<String, DeviceBreakdownEntry> = HashMap::new();
        for entry in shards.values() {
            for (device, stats) in &entry.devices {
                let total = aggregated
                    .entry(device.clone())
                    .or_insert_with(|| DeviceBreakdownEntry {
                        device: device.clone(),
                        messages: 0,
                        failed_messages: 0,
                        bytes: 0,
                    });
                total.messages += stats.messages;
                total.failed_messages += stats.failed_messages;
                total.bytes += stats.bytes;
            }
        }
        let mut devices: Vec<DeviceBreakdownEntry> = aggregated.into_values().collect();
        devices.sort_by(|a, b| b.messages.cmp(&a.messages).then_with(|| a.device.cmp(&b.device)));
        if let Some(limit) = limit {
            devices.truncate(limit);
        }
        devices
    }
}
