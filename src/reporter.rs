// =============================================================================
// reporter.rs - THE TOWN CRIER
// =============================================================================
//
// Every report interval: take one snapshot and tell everyone who cares.
// The CSV sink gets a row, the global aggregator (if configured) gets an
// HTTP POST, metrics.json (single-process mode) gets an atomic rewrite,
// and the operator gets a one-line heartbeat in the log. After
// cancellation a final pass runs so the last row of the CSV always
// reflects the end of the run.
//
// The reporter reads; it never mutates aggregator state. If the HTTP
// aggregator is unreachable that is the aggregator's problem, not the
// run's: we warn and keep simulating.
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use std::sync::Arc;

use tracing::{info, warn};

use crate::global_metrics::ShardReport;
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::models::DeviceBreakdownEntry;
use crate::sinks::CsvSink;
use crate::stop::StopToken;

/// HTTP client for the orchestrator's `/api/shard` ingest endpoint.
pub struct AggregatorClient {
    endpoint: String,
    shard_id: String,
    client: reqwest::Client,
}

impl AggregatorClient {
    pub fn new(endpoint: &str, shard_id: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            shard_id: shard_id.to_string(),
            client,
        })
    }

    /// Ship one snapshot. Failure is logged and swallowed; metrics
    /// reporting must never take the load test down with it.
    pub async fn send(&self, snapshot: MetricsSnapshot, devices: Vec<DeviceBreakdownEntry>) {
        let report = ShardReport {
            shard_id: self.shard_id.clone(),
            snapshot,
            devices,
        };
        match self.client.post(&self.endpoint).json(&report).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    status = response.status().as_u16(),
                    endpoint = %self.endpoint,
                    "aggregator rejected shard report"
                );
            }
            Ok(_) => {}
            Err(error) => {
                warn!(error = %error, endpoint = %self.endpoint, "could not report metrics to aggregator");
            }
        }
    }
}

/// The periodic reporter for one shard.
pub struct Reporter {
    pub metrics: Arc<MetricsAggregator>,
    pub csv: CsvSink,
    pub interval: Duration,
    pub stop: StopToken,
    pub aggregator: Option<AggregatorClient>,
    pub metrics_json: Option<PathBuf>,
}

impl Reporter {
    /// Tick until cancelled, then run one final pass.
    pub async fn run(self) {
        loop {
            if self.stop.sleep(self.interval).await {
                break;
            }
            self.report_once(false).await;
        }
        self.report_once(true).await;
    }

    async fn report_once(&self, last: bool) {
        let snapshot = self.metrics.snapshot();
        self.csv.log(snapshot.clone()).await;

        if let Some(aggregator) = &self.aggregator {
            let devices = self.metrics.device_breakdown(None);
            aggregator.send(snapshot.clone(), devices).await;
        }

        if let Some(path) = &self.metrics_json {
            let devices = self.metrics.device_health();
            let payload = serde_json::json!({ "metrics": snapshot, "devices": devices });
            if let Err(error) = write_json_atomic(path, &payload).await {
                warn!(path = %path.display(), error = %error, "could not update metrics.json");
            }
        }

        let heading = if last { "final summary" } else { "telemetry heartbeat" };
        info!(
            active = snapshot.active_clients,
            total = snapshot.total_devices,
            ok = snapshot.successful_publishes,
            fail = snapshot.failed_publishes,
            avg_ms = snapshot.avg_latency_ms.map(|v| v.to_string()).unwrap_or_else(|| "n/a".into()),
            p95_ms = snapshot.p95_latency_ms.map(|v| v.to_string()).unwrap_or_else(|| "n/a".into()),
            p99_ms = snapshot.p99_latency_ms.map(|v| v.to_string()).unwrap_or_else(|| "n/a".into()),
            rate = format!("{:.4}", snapshot.messages_per_second),
            bw_mbps = format!("{:.4}", snapshot.bandwidth_mbps),
            "{heading}"
        );
    }
}

/// Write-temp-then-rename so dashboard readers never observe a torn file.
pub async fn write_json_atomic(path: &PathBuf, payload: &serde_json::Value) -> anyhow::Result<()> {
    let body = serde_json::to_vec_pretty(payload)?;
    let mut tmp = path.clone().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
