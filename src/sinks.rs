// =============================================================================
// sinks.rs - THE APPEND-ONLY SCRIBES
// =============================================================================
//
// Two independent writers, each fed by a bounded queue with a single
// consumer task on the other end:
//
// 1. The event sink: one JSON object per line, one line per connect,
//    publish, or disconnect, flushed after every write. This is the
//    forensic record. When a run goes sideways at device 713, the JSONL
//    file knows exactly when and how.
// 2. The CSV sink: one row per periodic snapshot plus a final row at
//    shutdown, fixed 17-column schema, header written once.
//
// The queues are bounded and sends await: a publisher that outruns the
// disk waits its turn instead of silently dropping records. Shutdown is a
// sentinel; close() returns only after everything enqueued before it has
// hit the file.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use portable_atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics::MetricsSnapshot;
use crate::models::EventRecord;

/// Queue depth shared by both sinks. Deep enough to absorb a full-fleet
/// publish burst between two disk flushes.
const SINK_QUEUE_CAPACITY: usize = 10_000;

/// Fixed schema of the snapshot CSV, in column order.
pub const CSV_HEADER: [&str; 17] = [
    "timestamp",
    "uptime_seconds",
    "elapsed_seconds",
    "total_devices",
    "active_clients",
    "connected_devices",
    "successful_publishes",
    "failed_publishes",
    "failed_devices",
    "avg_latency_ms",
    "p50_latency_ms",
    "p95_latency_ms",
    "p99_latency_ms",
    "messages_per_second",
    "bandwidth_mbps",
    "avg_send_rate_per_device",
    "avg_messages_per_device",
];

/// Writer-side counters, atomics so the consumer task and curious readers
/// never contend.
#[derive(Debug, Default)]
pub struct SinkStats {
    pub records_written: AtomicU64,
    pub write_errors: AtomicU64,
}

/// Handle to a sink's consumer task. Returned by `spawn`, consumed by
/// `close`.
pub struct SinkTask(JoinHandle<()>);

/// Cheap-to-clone producer half of the JSONL event log.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Option<EventRecord>>,
    stats: Arc<SinkStats>,
}

impl EventSink {
    /// Open the log file and start the consumer task.
    pub async fn spawn(path: &Path) -> anyhow::Result<(Self, SinkTask)> {
        let file = File::create(path).await?;
        let (tx, mut rx) = mpsc::channel::<Option<EventRecord>>(SINK_QUEUE_CAPACITY);
        let stats = Arc::new(SinkStats::default());
        let writer_stats = Arc::clone(&stats);
        let task = tokio::spawn(async move {
            let mut writer = BufWriter::new(file);
            while let Some(message) = rx.recv().await {
                let Some(record) = message else { break };
                let mut line = match serde_json::to_vec(&record) {
                    Ok(line) => line,
                    Err(error) => {
                        writer_stats.write_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %error, "could not serialize event record");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(error) = write_flushed(&mut writer, &line).await {
                    writer_stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %error, "event log write failed, record lost");
                    continue;
                }
                writer_stats.records_written.fetch_add(1, Ordering::Relaxed);
            }
            let _ = writer.flush().await;
        });
        Ok((Self { tx, stats }, SinkTask(task)))
    }

    /// Enqueue a record. Blocks (asynchronously) when the queue is full;
    /// events are never silently dropped while the sink is open.
    pub async fn log(&self, record: EventRecord) {
        if self.tx.send(Some(record)).await.is_err() {
            self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!("event sink already closed, record dropped");
        }
    }

    /// Drain the queue and close the file. Everything enqueued before this
    /// call is on disk when it returns.
    pub async fn close(&self, task: SinkTask) {
        let _ = self.tx.send(None).await;
        let _ = task.0.await;
        debug!(
            records = self.stats.records_written.load(Ordering::Relaxed),
            errors = self.stats.write_errors.load(Ordering::Relaxed),
            "event sink closed"
        );
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }
}

/// Producer half of the snapshot CSV.
#[derive(Clone)]
pub struct CsvSink {
    tx: mpsc::Sender<Option<MetricsSnapshot>>,
    stats: Arc<SinkStats>,
}

impl CsvSink {
    pub async fn spawn(path: &Path) -> anyhow::Result<(Self, SinkTask)> {
        let file = File::create(path).await?;
        let (tx, mut rx) = mpsc::channel::<Option<MetricsSnapshot>>(SINK_QUEUE_CAPACITY);
        let stats = Arc::new(SinkStats::default());
        let writer_stats = Arc::clone(&stats);
        let task = tokio::spawn(async move {
            let mut writer = BufWriter::new(file);
            let header: Vec<String> = CSV_HEADER.iter().map(|s| s.to_string()).collect();
            if let Err(error) = write_flushed(&mut writer, &encode_row(&header)).await {
                writer_stats.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %error, "could not write CSV header");
            }
            while let Some(message) = rx.recv().await {
                let Some(snapshot) = message else { break };
                let row = encode_row(&csv_row(&snapshot));
                if let Err(error) = write_flushed(&mut writer, &row).await {
                    writer_stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %error, "CSV row write failed, row lost");
                    continue;
                }
                writer_stats.records_written.fetch_add(1, Ordering::Relaxed);
            }
            let _ = writer.flush().await;
        });
        Ok((Self { tx, stats }, SinkTask(task)))
    }

    pub async fn log(&self, snapshot: MetricsSnapshot) {
        if self.tx.send(Some(snapshot)).await.is_err() {
            self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!("CSV sink already closed, snapshot dropped");
        }
    }

    pub async fn close(&self, task: SinkTask) {
        let _ = self.tx.send(None).await;
        let _ = task.0.await;
        debug!(
            rows = self.stats.records_written.load(Ordering::Relaxed),
            errors = self.stats.write_errors.load(Ordering::Relaxed),
            "CSV sink closed"
        );
    }
}

async fn write_flushed(writer: &mut BufWriter<File>, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Render one snapshot as the 17 CSV columns. Absent latency statistics
/// become empty cells, not zeroes; an empty cell means "no samples yet"
/// and a zero means "instantaneous".
pub fn csv_row(snapshot: &MetricsSnapshot) -> Vec<String> {
    vec![
        snapshot.timestamp.clone(),
        format_f64(snapshot.uptime_seconds),
        format_f64(snapshot.elapsed_seconds),
        snapshot.total_devices.to_string(),
        snapshot.active_clients.to_string(),
        snapshot.connected_devices.to_string(),
        snapshot.successful_publishes.to_string(),
        snapshot.failed_publishes.to_string(),
        snapshot.failed_devices.to_string(),
        format_opt(snapshot.avg_latency_ms),
        format_opt(snapshot.p50_latency_ms),
        format_opt(snapshot.p95_latency_ms),
        format_opt(snapshot.p99_latency_ms),
        format_f64(snapshot.messages_per_second),
        format_f64(snapshot.bandwidth_mbps),
        format_f64(snapshot.avg_send_rate_per_device),
        format_f64(snapshot.avg_messages_per_device),
    ]
}

fn format_f64(value: f64) -> String {
    format!("{value}")
}

fn format_opt(value: Option<f64>) -> String {
    value.map(format_f64).unwrap_or_default()
}

fn encode_row(fields: &[String]) -> Vec<u8> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    let _ = writer.write_record(fields);
    writer.into_inner().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_sink_persists_every_record_before_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let (sink, task) = EventSink::spawn(&path).await.expect("spawn");

        for i in 0..100u64 {
            sink.log(EventRecord::disconnected(&format!("sim-{i}"), "graceful"))
                .await;
        }
        sink.close(task).await;

        let content = std::fs::read_to_string(&path).expect("read back");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 100);
        for line in lines {
            let record: EventRecord = serde_json::from_str(line).expect("valid JSONL line");
            assert_eq!(record.reason.as_deref(), Some("graceful"));
        }
        assert_eq!(sink.stats().records_written.load(Ordering::Relaxed), 100);
        assert_eq!(sink.stats().write_errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_csv_sink_writes_header_then_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics.csv");
        let (sink, task) = CsvSink::spawn(&path).await.expect("spawn");

        let mut snapshot = MetricsSnapshot::empty();
        snapshot.successful_publishes = 7;
        snapshot.avg_latency_ms = Some(12.5);
        sink.log(snapshot.clone()).await;
        sink.log(snapshot).await;
        sink.close(task).await;

        let content = std::fs::read_to_string(&path).expect("read back");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER.join(","));
        assert!(lines[1].contains(",7,"));
        assert_eq!(lines[1].split(',').count(), CSV_HEADER.len());
    }

    #[test]
    fn test_absent_latency_renders_as_empty_cell() {
        let snapshot = MetricsSnapshot::empty();
        let row = csv_row(&snapshot);
        assert_eq!(row.len(), CSV_HEADER.len());
        let avg_index = CSV_HEADER.iter().position(|c| *c == "avg_latency_ms").unwrap();
        assert_eq!(row[avg_index], "");
    }
}
