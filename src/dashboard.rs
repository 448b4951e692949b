// =============================================================================
// dashboard.rs - THE OBSERVATION DECK
// =============================================================================
//
// A small axum server with exactly three jobs:
//
//   GET  /            the live dashboard page (a frozen HTML asset)
//   GET  /api/metrics the current merged snapshot plus device breakdown
//   POST /api/shard   shard snapshot ingest (global aggregator mode only)
//
// The same server fronts either a shard-local MetricsAggregator (single
// process mode) or the orchestrator's GlobalMetricsCollector (split mode);
// the ingest route only exists in the latter. All contracts live at
// /api/metrics; the HTML never participates in any invariant, it just
// draws what the API says.
// =============================================================================

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::global_metrics::{GlobalMetricsCollector, ShardReport};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::models::DeviceBreakdownEntry;
use crate::stop::StopToken;

/// What the server reads its numbers from.
pub enum MetricsSource {
    Shard(Arc<MetricsAggregator>),
    Global(Arc<GlobalMetricsCollector>),
}

impl MetricsSource {
    fn summary(&self) -> MetricsSnapshot {
        match self {
            MetricsSource::Shard(aggregator) => aggregator.summary(),
            MetricsSource::Global(collector) => collector.summary(),
        }
    }

    fn device_breakdown(&self) -> Vec<DeviceBreakdownEntry> {
        match self {
            MetricsSource::Shard(aggregator) => aggregator.device_breakdown(None),
            MetricsSource::Global(collector) => collector.device_breakdown(None),
        }
    }
}

struct AppState {
    source: MetricsSource,
    refresh_ms: u64,
}

/// Handle to a running dashboard server. The listening socket is released
/// when the stop token trips and the serve task drains.
pub struct DashboardServer {
    handle: JoinHandle<()>,
    local_addr: std::net::SocketAddr,
}

impl DashboardServer {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Wait for the server to finish shutting down.
    pub async fn stopped(self) {
        let _ = self.handle.await;
    }
}

/// Bind and serve. Shard mode gets the read-only routes; global mode also
/// accepts shard reports.
pub async fn serve(
    source: MetricsSource,
    host: &str,
    port: u16,
    refresh_ms: u64,
    stop: &StopToken,
) -> anyhow::Result<DashboardServer> {
    let accepts_shards = matches!(source, MetricsSource::Global(_));
    let state = Arc::new(AppState { source, refresh_ms });

    let mut router = Router::new()
        .route("/", get(serve_index))
        .route("/api/metrics", get(serve_metrics));
    if accepts_shards {
        router = router.route("/api/shard", post(ingest_shard));
    }
    let router = router.with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    let local_addr = listener.local_addr()?;
    let shutdown = stop.cancelled_owned();
    let handle = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %error, "dashboard server exited with an error");
        }
    });

    let host_label = match host {
        "0.0.0.0" | "" | "127.0.0.1" => "localhost",
        other => other,
    };
    info!(
        "dashboard available at http://{}:{}",
        host_label,
        local_addr.port()
    );
    Ok(DashboardServer { handle, local_addr })
}

async fn serve_index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(DASHBOARD_HTML.replace("__REFRESH_MS__", &state.refresh_ms.to_string()))
}

async fn serve_metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let metrics = state.source.summary();
    let devices = state.source.device_breakdown();
    Json(serde_json::json!({ "metrics": metrics, "devices": devices }))
}

async fn ingest_shard(
    State(state): State<Arc<AppState>>,
    Json(report): Json<ShardReport>,
) -> StatusCode {
    match &state.source {
        MetricsSource::Global(collector) => {
            collector.ingest(&report.shard_id, report.snapshot, report.devices);
            StatusCode::NO_CONTENT
        }
        MetricsSource::Shard(_) => StatusCode::NOT_FOUND,
    }
}

/// The dashboard page. Frozen asset: it reads /api/metrics on a timer and
/// renders tables plus two trend charts. Nothing here is load-bearing.
const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>Fleet Surge Dashboard</title>
  <script src="https://cdn.jsdelivr.net/npm/chart.js"></script>
  <style>
    body { font-family: Arial, sans-serif; margin: 0; padding: 0 1.5rem 2rem; background: #101822; color: #f2f4f8; }
    h1 { margin-top: 1.5rem; }
    .grid { display: grid; grid-template-columns: repeat(auto-fit, minmax(260px, 1fr)); gap: 1rem; margin-top: 1rem; }
    .card { background: #1b2533; border-radius: 8px; padding: 1rem; box-shadow: 0 4px 12px rgba(0,0,0,0.25); }
    .card h2 { margin-top: 0; font-size: 1.1rem; }
    table { width: 100%; border-collapse: collapse; font-size: 0.9rem; }
    th, td { padding: 0.35rem 0.5rem; text-align: left; border-bottom: 1px solid rgba(255,255,255,0.08); }
    .status { display: flex; gap: 1rem; flex-wrap: wrap; margin: 0.5rem 0 0; }
    .chart-container { background: #1b2533; border-radius: 8px; padding: 1rem; margin-top: 1rem; }
    .chart-container canvas { width: 100% !important; max-height: 300px; }
    footer { margin-top: 2rem; font-size: 0.75rem; color: #9ca6b4; }
  </style>
</head>
<body>
  <h1>Fleet Surge Dashboard</h1>
  <div class="status">
    <span>Elapsed: <strong id="elapsed">--</strong></span>
    <span>Messages/sec: <strong id="mps">--</strong></span>
    <span>Bandwidth (Mbps): <strong id="bandwidth">--</strong></span>
    <span>Channels in use: <strong id="channels">--</strong></span>
  </div>
  <div class="grid">
    <div class="card">
      <h2>Connections</h2>
      <table>
        <tr><th>Total devices</th><td id="total-devices">--</td></tr>
        <tr><th>Connected now</th><td id="connected">--</td></tr>
        <tr><th>Peak connected</th><td id="peak-connected">--</td></tr>
        <tr><th>Failed devices</th><td id="failed-devices">--</td></tr>
        <tr><th>Collapse time</th><td id="collapse-time">--</td></tr>
        <tr><th>Collapse reason</th><td id="collapse-reason">--</td></tr>
      </table>
    </div>
    <div class="card">
      <h2>Traffic</h2>
      <table>
        <tr><th>Successful publishes</th><td id="packets-sent">--</td></tr>
        <tr><th>Failed publishes</th><td id="packets-failed">--</td></tr>
        <tr><th>Total volume (MB)</th><td id="volume">--</td></tr>
        <tr><th>Avg msgs/device</th><td id="avg-msgs-device">--</td></tr>
        <tr><th>Avg msg rate/device</th><td id="avg-rate-device">--</td></tr>
      </table>
    </div>
    <div class="card">
      <h2>Latency (ms)</h2>
      <table>
        <tr><th>Average</th><td id="latency-avg">--</td></tr>
        <tr><th>P50</th><td id="latency-p50">--</td></tr>
        <tr><th>P95</th><td id="latency-p95">--</td></tr>
        <tr><th>P99</th><td id="latency-p99">--</td></tr>
      </table>
    </div>
    <div class="card">
      <h2>Disconnect causes</h2>
      <table id="disconnect-table"><tr><th>Reason</th><th>Count</th></tr></table>
    </div>
  </div>
  <div class="chart-container"><h2>Messages per Second</h2><canvas id="messagesChart"></canvas></div>
  <div class="chart-container"><h2>Latency Trends (ms)</h2><canvas id="latencyChart"></canvas></div>
  <div class="card" style="margin-top:1rem">
    <h2>Top devices (by messages sent)</h2>
    <table id="devices-table"><tr><th>Device</th><th>Messages</th><th>Failed</th></tr></table>
  </div>
  <footer>Refresh interval: __REFRESH_MS__ ms</footer>
  <script>
    const refreshInterval = __REFRESH_MS__;
    const maxPoints = 60;
    const lineChart = (id, labels, colors) => new Chart(document.getElementById(id).getContext('2d'), {
      type: 'line',
      data: { labels: [], datasets: labels.map((label, i) => ({ label, borderColor: colors[i], backgroundColor: colors[i], tension: 0.2, data: [], fill: false })) },
      options: { animation: false, responsive: true, maintainAspectRatio: false,
        scales: { x: { ticks: { color: '#9ca6b4' } }, y: { ticks: { color: '#9ca6b4' }, beginAtZero: true } },
        plugins: { legend: { labels: { color: '#f2f4f8' } } } }
    });
    const messagesChart = lineChart('messagesChart', ['Messages/s'], ['#4fd1c5']);
    const latencyChart = lineChart('latencyChart', ['Avg', 'P95', 'P99'], ['#63b3ed', '#f6ad55', '#fc8181']);

    function push(chart, values) {
      const ts = new Date().toLocaleTimeString();
      chart.data.labels.push(ts);
      values.forEach((v, i) => chart.data.datasets[i].data.push(v));
      if (chart.data.labels.length > maxPoints) {
        chart.data.labels.shift();
        chart.data.datasets.forEach(d => d.data.shift());
      }
      chart.update();
    }

    function set(id, value) { document.getElementById(id).innerText = value; }
    function fmt(value, digits) { return value == null ? '--' : Number(value).toFixed(digits); }
    function formatSeconds(seconds) {
      const total = Math.floor(Number.isFinite(seconds) ? seconds : 0);
      const h = Math.floor(total / 3600), m = Math.floor((total % 3600) / 60), s = total % 60;
      return [h, m, s].map(v => String(v).padStart(2, '0')).join(':');
    }

    async function refresh() {
      try {
        const response = await fetch('/api/metrics');
        if (!response.ok) throw new Error('metrics fetch failed');
        const { metrics = {}, devices = [] } = await response.json();
        set('elapsed', formatSeconds(metrics.elapsed_seconds));
        set('mps', fmt(metrics.messages_per_second, 3));
        set('bandwidth', fmt(metrics.bandwidth_mbps, 4));
        set('channels', metrics.channels_in_use ?? '--');
        set('total-devices', metrics.total_devices ?? '--');
        set('connected', metrics.connected_devices ?? '--');
        set('peak-connected', metrics.peak_connected_devices ?? '--');
        set('failed-devices', metrics.failed_devices ?? '--');
        set('collapse-time', metrics.collapse_time_seconds != null ? fmt(metrics.collapse_time_seconds, 1) + ' s' : 'N/A');
        set('collapse-reason', metrics.collapse_reason ?? 'N/A');
        set('packets-sent', metrics.successful_publishes ?? '--');
        set('packets-failed', metrics.failed_publishes ?? '--');
        set('volume', fmt(metrics.data_volume_mb, 3));
        set('avg-msgs-device', fmt(metrics.avg_messages_per_device, 2));
        set('avg-rate-device', fmt(metrics.avg_send_rate_per_device, 3));
        set('latency-avg', fmt(metrics.avg_latency_ms, 3));
        set('latency-p50', fmt(metrics.p50_latency_ms, 3));
        set('latency-p95', fmt(metrics.p95_latency_ms, 3));
        set('latency-p99', fmt(metrics.p99_latency_ms, 3));

        const causes = document.getElementById('disconnect-table');
        while (causes.rows.length > 1) causes.deleteRow(1);
        Object.entries(metrics.disconnect_causes || {}).forEach(([reason, count]) => {
          const tr = causes.insertRow();
          tr.insertCell().innerText = reason;
          tr.insertCell().innerText = count;
        });

        const table = document.getElementById('devices-table');
        while (table.rows.length > 1) table.deleteRow(1);
        devices.slice(0, 10).forEach(item => {
          const tr = table.insertRow();
          tr.insertCell().innerText = item.device;
          tr.insertCell().innerText = item.messages;
          tr.insertCell().innerText = item.failed_messages;
        });

        push(messagesChart, [metrics.messages_per_second ?? 0]);
        push(latencyChart, [metrics.avg_latency_ms ?? 0, metrics.p95_latency_ms ?? 0, metrics.p99_latency_ms ?? 0]);
      } catch (err) {
        console.error(err);
      }
    }
    refresh();
    setInterval(refresh, refreshInterval);
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSnapshot;

    #[tokio::test]
    async fn test_shard_report_roundtrips_through_http() {
        let collector = Arc::new(GlobalMetricsCollector::new());
        let stop = StopToken::new();
        let server = serve(
            MetricsSource::Global(Arc::clone(&collector)),
            "127.0.0.1",
            0,
            2_000,
            &stop,
        )
        .await
        .expect("bind");
        let base = format!("http://{}", server.local_addr());

        let mut snapshot = MetricsSnapshot::empty();
        snapshot.successful_publishes = 321;
        snapshot.messages_sent = 321;
        snapshot.total_devices = 5;
        snapshot.avg_latency_ms = Some(9.5);
        let report = ShardReport {
            shard_id: "00000-00005".to_string(),
            snapshot,
            devices: vec![DeviceBreakdownEntry {
                device: "sim-0".to_string(),
                messages: 321,
                failed_messages: 0,
                bytes: 32_100,
            }],
        };

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/api/shard"))
            .json(&report)
            .send()
            .await
            .expect("post shard report");
        assert_eq!(response.status().as_u16(), 204);

        let body: serde_json::Value = client
            .get(format!("{base}/api/metrics"))
            .send()
            .await
            .expect("get metrics")
            .json()
            .await
            .expect("parse metrics");
        assert_eq!(body["metrics"]["successful_publishes"], 321);
        assert_eq!(body["metrics"]["total_devices"], 5);
        assert_eq!(body["devices"][0]["device"], "sim-0");

        let page = client
            .get(format!("{base}/"))
            .send()
            .await
            .expect("get index")
            .text()
            .await
            .expect("read index");
        assert!(page.contains("Fleet Surge Dashboard"));
        assert!(page.contains("Refresh interval: 2000 ms"));

        stop.trip("test over");
        server.stopped().await;
    }

    #[tokio::test]
    async fn test_shard_mode_has_no_ingest_route() {
        let stop = StopToken::new();
        let aggregator = Arc::new(MetricsAggregator::new(1, stop.clone()));
        let server = serve(
            MetricsSource::Shard(aggregator),
            "127.0.0.1",
            0,
            1_000,
            &stop,
        )
        .await
        .expect("bind");
        let base = format!("http://{}", server.local_addr());

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/api/shard"))
            .json(&serde_json::json!({"shard_id": "x", "snapshot": MetricsSnapshot::empty(), "devices": []}))
            .send()
            .await
            .expect("post");
        assert_eq!(response.status().as_u16(), 404);

        stop.trip("test over");
        server.stopped().await;
    }
}
