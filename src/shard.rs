// =============================================================================
// shard.rs - THE FLEET RUNTIME
// =============================================================================
//
// One process, one slice of the fleet. This module owns the choreography:
// build the stop plane, open the sinks, start the reporter and (maybe) the
// dashboard, launch workers under the ramp, synchronize the first burst,
// then wait for the run to end and take everything down in a fixed order:
//
//   1. stop token trips          5. reporter emits the final row and exits
//   2. ramp loop exits           6. sinks drain and close
//   3. workers join              7. aggregator HTTP client drops
//   4. duration timer stands down 8. dashboard releases its socket
//
// Order matters: the final CSV row must exist before the file closes, and
// the file must close before the process claims the run is over.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::Config;
use crate::dashboard::{self, MetricsSource};
use crate::metrics::MetricsAggregator;
use crate::models::utcnow;
use crate::ramp::{parse_ramp, parse_ramp_percentages, StartCoordinator, StartGate};
use crate::reporter::{AggregatorClient, Reporter};
use crate::sinks::{CsvSink, EventSink};
use crate::stop::{self, StopToken};
use crate::tokens;
use crate::worker::{DeviceWorker, WorkerSettings};

/// How long the shard waits for the first ramp stage to assemble at the
/// gate before releasing the start instant anyway.
const GATE_ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Drive one shard's slice of the fleet from launch to drained sinks.
pub async fn run_shard(config: &Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("could not create log dir {}", config.log_dir.display()))?;
    std::fs::create_dir_all(&config.metrics_dir)
        .with_context(|| format!("could not create metrics dir {}", config.metrics_dir.display()))?;

    let fleet = tokens::resolve_fleet(
        &config.tokens_file,
        config.token_prefix.as_deref(),
        config.device_count,
        config.start_id,
        config.count,
    )?;
    let total = fleet.len();
    let ramp_sequence = if config.ramp_percentages.is_some() {
        parse_ramp_percentages(config.ramp_percentages.as_deref(), total)?
    } else {
        parse_ramp(config.ramp.as_deref(), total)?
    };

    let stop = StopToken::new();
    stop::install_signal_handlers(&stop);
    stop::spawn_stop_flag_watcher(&stop, stop::stop_flag_path(&config.log_dir));
    stop::spawn_duration_timer(&stop, config.duration);

    let metrics = Arc::new(MetricsAggregator::new(total, stop.clone()));
    let session_id = session_id(config, total);
    let events_path = config.log_dir.join(format!("{session_id}-events.jsonl"));
    let csv_path = config.metrics_dir.join(format!("{session_id}-metrics.csv"));
    let (events, events_task) = EventSink::spawn(&events_path).await?;
    let (csv, csv_task) = CsvSink::spawn(&csv_path).await?;

    let aggregator = match &config.aggregator_endpoint {
        Some(endpoint) => Some(AggregatorClient::new(
            endpoint,
            &config.effective_shard_id(total),
        )?),
        None => None,
    };

    // A shard that reports upstream has no dashboard of its own; the
    // orchestrator serves the merged view.
    let dashboard = if !config.disable_dashboard && config.aggregator_endpoint.is_none() {
        match dashboard::serve(
            MetricsSource::Shard(Arc::clone(&metrics)),
            &config.metrics_host,
            config.metrics_port,
            config.metrics_refresh,
            &stop,
        )
        .await
        {
            Ok(server) => Some(server),
            Err(error) => {
                warn!(error = %error, "could not start the metrics dashboard");
                None
            }
        }
    } else {
        None
    };

    let metrics_json = config
        .aggregator_endpoint
        .is_none()
        .then(|| config.metrics_dir.join("metrics.json"));
    let reporter = Reporter {
        metrics: Arc::clone(&metrics),
        csv: csv.clone(),
        interval: Duration::from_secs_f64(config.report_interval.max(0.1)),
        stop: stop.clone(),
        aggregator,
        metrics_json,
    };
    let reporter_handle = tokio::spawn(reporter.run());

    let first_stage = ramp_sequence.first().copied().unwrap_or(total).min(total);
    let gate = Arc::new(StartGate::new(first_stage));
    let coordinator = Arc::new(StartCoordinator::new(config.start_lead_time));
    let settings = Arc::new(WorkerSettings {
        host: config.host.clone(),
        port: config.port,
        topic: config.topic.clone(),
        qos: config.mqtt_qos(),
        interval: Duration::from_secs_f64(config.interval),
        backoff_base: config.backoff_base,
        backoff_max: config.backoff_max,
    });

    info!(
        session = %session_id,
        devices = total,
        stages = ?ramp_sequence,
        host = %config.host,
        port = config.port,
        interval_secs = config.interval,
        qos = config.qos,
        "launching fleet"
    );

    let mut workers: JoinSet<()> = JoinSet::new();
    let mut fleet_iter = fleet.into_iter();
    let mut launched = 0usize;
    let stage_count = ramp_sequence.len();
    for (index, target) in ramp_sequence.iter().enumerate() {
        if stop.is_stopped() {
            break;
        }
        let target = (*target).min(total);
        while launched < target {
            let device = fleet_iter.next().expect("ramp stays within fleet bounds");
            let worker = DeviceWorker::new(
                device,
                Arc::clone(&settings),
                Arc::clone(&metrics),
                events.clone(),
                stop.clone(),
                Arc::clone(&gate),
                Arc::clone(&coordinator),
            );
            workers.spawn(worker.run());
            launched += 1;
        }
        if index == 0 {
            tokio::select! {
                _ = gate.assembled() => {}
                _ = tokio::time::sleep(GATE_ASSEMBLY_TIMEOUT) => {
                    warn!("not every client synchronized the first burst in time");
                }
                _ = stop.cancelled() => {}
            }
            coordinator.release();
            info!(stage = target, "first burst released");
        } else {
            info!(stage = index + 1, launched, "ramp stage launched");
        }
        if launched >= total {
            break;
        }
        if config.ramp_wait > 0.0 && index + 1 < stage_count {
            if stop.sleep(Duration::from_secs_f64(config.ramp_wait)).await {
                break;
            }
        }
    }

    // Run until cancelled, or until every worker finished on its own.
    if launched > 0 {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = async {
                while workers.join_next().await.is_some() {}
            } => {
                stop.trip("all workers finished");
            }
        }
    } else {
        stop.cancelled().await;
    }

    while workers.join_next().await.is_some() {}
    let _ = reporter_handle.await;
    events.close(events_task).await;
    csv.close(csv_task).await;
    if let Some(server) = dashboard {
        server.stopped().await;
    }

    info!(
        events = %events_path.display(),
        metrics = %csv_path.display(),
        "run artifacts saved"
    );
    Ok(())
}

/// Session identity used in artifact file names. Shard workers append
/// their slice so parallel shards never collide on a file.
fn session_id(config: &Config, fleet_size: usize) -> String {
    let base = utcnow().format("surge-run-%Y%m%d-%H%M%S").to_string();
    if config.worker {
        format!("{base}-s{:05}-n{:05}", config.start_id, fleet_size)
    } else {
        base
    }
}
