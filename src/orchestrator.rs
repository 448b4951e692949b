// =============================================================================
// orchestrator.rs - THE SHARD WRANGLER
// =============================================================================
//
// One process can only hold so many MQTT sessions before the event loops
// start elbowing each other. Past the per-process cap the orchestrator
// fans the fleet out: N/cap shard processes, each a copy of this binary
// run with --worker and a contiguous token slice, all reporting snapshots
// to the global aggregator this process hosts.
//
// Shutdown is cooperative first, forceful second: the orchestrator drops a
// stop.flag where every shard is watching for it, waits out a grace
// period, and only then kills survivors. Any shard that exits non-zero
// makes the whole run exit non-zero, after the merged summary is printed;
// operators deserve their numbers even when a shard face-planted.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::config::{Config, SplitMode};
use crate::dashboard::{self, MetricsSource};
use crate::global_metrics::GlobalMetricsCollector;
use crate::shard;
use crate::stop::{self, StopToken};
use crate::tokens;

/// Whether this run fans out into shard processes.
fn should_split(mode: SplitMode, total_devices: usize, cap: usize) -> bool {
    match mode {
        SplitMode::Never => false,
        SplitMode::Always => true,
        SplitMode::Auto => total_devices > cap,
    }
}

/// Contiguous (start_id, count) slices covering the fleet, cap per shard.
fn shard_slices(total_devices: usize, cap: usize, base_start: usize) -> Vec<(usize, usize)> {
    let cap = cap.max(1);
    let mut slices = Vec::new();
    let mut offset = 0;
    while offset < total_devices {
        let count = cap.min(total_devices - offset);
        slices.push((base_start + offset, count));
        offset += count;
    }
    slices
}

/// Top-level run: either drive the fleet in-process or spawn shards and
/// merge their view. Returns the process exit code.
pub async fn run(config: &Config) -> anyhow::Result<i32> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("could not create log dir {}", config.log_dir.display()))?;
    stop::clear_stale_stop_flag(&stop::stop_flag_path(&config.log_dir));

    let fleet = tokens::resolve_fleet(
        &config.tokens_file,
        config.token_prefix.as_deref(),
        config.device_count,
        config.start_id,
        config.count,
    )?;
    let total = fleet.len();
    drop(fleet);

    let cap = config.max_clients_per_process.max(1);
    if !should_split(config.split, total, cap) {
        shard::run_shard(config).await?;
        return Ok(0);
    }

    info!(
        total,
        max_per_process = cap,
        "splitting the simulation into shard processes"
    );

    let stop = StopToken::new();
    stop::install_signal_handlers(&stop);

    // The global view: shards POST here, the dashboard reads from here.
    let collector = Arc::new(GlobalMetricsCollector::new());
    let server = dashboard::serve(
        MetricsSource::Global(Arc::clone(&collector)),
        &config.metrics_host,
        config.metrics_port,
        config.metrics_refresh,
        &stop,
    )
    .await
    .context("could not start the global aggregation endpoint")?;
    let endpoint = format!("http://127.0.0.1:{}/api/shard", server.local_addr().port());

    let exe = std::env::current_exe().context("could not locate our own executable")?;
    let mut children: Vec<Child> = Vec::new();
    for (index, (shard_start, shard_count)) in
        shard_slices(total, cap, config.start_id).iter().enumerate()
    {
        let mut command = Command::new(&exe);
        command
            .arg("--worker")
            .args(["--start-id", &shard_start.to_string()])
            .args(["--count", &shard_count.to_string()])
            .args(["--device-count", &shard_count.to_string()])
            .args(["--host", &config.host])
            .args(["--port", &config.port.to_string()])
            .args(["--interval", &config.interval.to_string()])
            .args(["--duration", &config.duration.to_string()])
            .args(["--report-interval", &config.report_interval.to_string()])
            .args(["--topic", &config.topic])
            .args(["--qos", &config.qos.to_string()])
            .args(["--log-dir", &config.log_dir.display().to_string()])
            .args(["--metrics-dir", &config.metrics_dir.display().to_string()])
            .args(["--backoff-base", &config.backoff_base.to_string()])
            .args(["--backoff-max", &config.backoff_max.to_string()])
            .args(["--ramp-wait", &config.ramp_wait.to_string()])
            .args(["--start-lead-time", &config.start_lead_time.to_string()])
            .args(["--metrics-host", &config.metrics_host])
            .args(["--metrics-refresh", &config.metrics_refresh.to_string()])
            .args(["--max-clients-per-process", &cap.to_string()])
            .args(["--tokens-file", &config.tokens_file.display().to_string()])
            .arg("--disable-dashboard")
            .args(["--aggregator-endpoint", &endpoint])
            .args(["--shard-id", &format!("{shard_start:05}-{shard_count:05}")]);
        if let Some(prefix) = &config.token_prefix {
            command.args(["--token-prefix", prefix]);
        }
        if let Some(ramp) = &config.ramp {
            command.arg("--ramp");
            for value in ramp {
                command.arg(value.to_string());
            }
        }
        if let Some(percentages) = &config.ramp_percentages {
            command.arg("--ramp-percentages");
            for value in percentages {
                command.arg(value);
            }
        }
        info!(
            shard = index + 1,
            start = shard_start,
            count = shard_count,
            "starting shard"
        );
        let child = command
            .spawn()
            .with_context(|| format!("could not spawn shard {}", index + 1))?;
        children.push(child);
    }

    // Wait for every shard, or for an interrupt that means "wind it down".
    loop {
        if stop.is_stopped() {
            break;
        }
        let mut all_done = true;
        for child in children.iter_mut() {
            if child.try_wait()?.is_none() {
                all_done = false;
                break;
            }
        }
        if all_done {
            break;
        }
        stop.sleep(Duration::from_millis(200)).await;
    }

    if stop.is_stopped() {
        wind_down_shards(config, &mut children).await;
    }

    let statuses = join_all(children.iter_mut().map(|child| child.wait())).await;
    let mut exit_codes = Vec::with_capacity(statuses.len());
    for (index, status) in statuses.into_iter().enumerate() {
        let code = match status {
            Ok(status) => status.code().unwrap_or(1),
            Err(error) => {
                error!(shard = index + 1, error = %error, "could not reap shard process");
                1
            }
        };
        if code != 0 {
            warn!(shard = index + 1, code, "shard finished with a non-zero exit code");
        }
        exit_codes.push(code);
    }

    let summary = collector.summary();
    info!(
        devices = summary.total_devices,
        connected = summary.connected_devices,
        active = summary.active_clients,
        ok = summary.successful_publishes,
        fail = summary.failed_publishes,
        avg_ms = summary.avg_latency_ms.map(|v| v.to_string()).unwrap_or_else(|| "n/a".into()),
        p99_ms = summary.p99_latency_ms.map(|v| v.to_string()).unwrap_or_else(|| "n/a".into()),
        rate = format!("{:.4}", summary.messages_per_second),
        "global summary"
    );

    stop.trip("orchestration complete");
    server.stopped().await;

    if exit_codes.iter().any(|&code| code != 0) {
        error!("at least one shard finished with errors, check the logs");
        return Ok(1);
    }
    Ok(0)
}

/// Cooperative shutdown: raise the stop flag every shard watches, give
/// them the grace period, then kill whoever is still standing.
async fn wind_down_shards(config: &Config, children: &mut [Child]) {
    warn!("interrupt received, stopping shards");
    let flag = stop::stop_flag_path(&config.log_dir);
    if let Err(error) = std::fs::write(&flag, b"stop requested by orchestrator\n") {
        warn!(error = %error, "could not write the stop flag, falling back to kill");
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(config.shutdown_grace.max(0.0));
    while tokio::time::Instant::now() < deadline {
        let any_alive = children
            .iter_mut()
            .any(|child| matches!(child.try_wait(), Ok(None)));
        if !any_alive {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    for child in children.iter_mut() {
        if let Ok(None) = child.try_wait() {
            warn!("shard did not stop within the grace period, killing it");
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_decision_honors_mode_and_cap() {
        assert!(!should_split(SplitMode::Never, 10_000, 400));
        assert!(should_split(SplitMode::Always, 3, 400));
        assert!(should_split(SplitMode::Auto, 401, 400));
        assert!(!should_split(SplitMode::Auto, 400, 400));
        // Cap larger than the fleet: single process even in auto mode.
        assert!(!should_split(SplitMode::Auto, 50, 400));
    }

    #[test]
    fn test_shard_slices_cover_the_fleet_contiguously() {
        let slices = shard_slices(1_000, 400, 0);
        assert_eq!(slices, vec![(0, 400), (400, 400), (800, 200)]);

        let offset = shard_slices(500, 500, 100);
        assert_eq!(offset, vec![(100, 500)]);

        let total: usize = shard_slices(12_345, 400, 0).iter().map(|(_, c)| c).sum();
        assert_eq!(total, 12_345);
    }

    #[test]
    fn test_shard_slices_survive_a_zero_cap() {
        let slices = shard_slices(3, 0, 0);
        assert_eq!(slices, vec![(0, 1), (1, 1), (2, 1)]);
    }
}
